//! Allowed-license policy.
//!
//! Packages declare an SPDX expression (`MIT`, `(MIT OR Apache-2.0)`,
//! `Apache-2.0 WITH LLVM-exception`). An expression is allowed when it can be
//! satisfied using allowed identifiers only: any side of an `OR`, every side
//! of an `AND`. Exceptions attached with `WITH` do not affect eligibility.

use std::collections::BTreeSet;

/// The Apache, BSD and MIT SPDX families.
pub const DEFAULT_LICENSES: &[&str] = &[
    "Apache-1.0",
    "Apache-1.1",
    "Apache-2.0",
    "0BSD",
    "BSD-1-Clause",
    "BSD-2-Clause",
    "BSD-2-Clause-Patent",
    "BSD-2-Clause-Views",
    "BSD-3-Clause",
    "BSD-3-Clause-Attribution",
    "BSD-3-Clause-Clear",
    "BSD-3-Clause-LBNL",
    "BSD-3-Clause-Modification",
    "BSD-3-Clause-No-Military-License",
    "BSD-3-Clause-No-Nuclear-License",
    "BSD-3-Clause-No-Nuclear-License-2014",
    "BSD-3-Clause-No-Nuclear-Warranty",
    "BSD-3-Clause-Open-MPI",
    "BSD-4-Clause",
    "BSD-4-Clause-Shortened",
    "BSD-4-Clause-UC",
    "BSD-Protection",
    "BSD-Source-Code",
    "MIT",
    "MIT-0",
    "MIT-advertising",
    "MIT-CMU",
    "MIT-enna",
    "MIT-feh",
    "MIT-Modern-Variant",
    "MIT-open-group",
    "MITNFA",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LicenseList {
    allowed: BTreeSet<String>,
}

impl Default for LicenseList {
    fn default() -> Self {
        Self::new(DEFAULT_LICENSES)
    }
}

impl LicenseList {
    pub fn new<I, S>(licenses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            allowed: licenses
                .into_iter()
                .map(|l| l.as_ref().trim().to_ascii_lowercase())
                .filter(|l| !l.is_empty())
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.allowed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allowed.is_empty()
    }

    /// Whether a package declaring `license` may be listed. Packages without
    /// a license, or with an expression that does not parse, are not.
    pub fn is_allowed(&self, license: Option<&str>) -> bool {
        let Some(expr) = license.map(str::trim).filter(|l| !l.is_empty()) else {
            return false;
        };
        let tokens = tokenize(expr);
        let mut parser = Parser {
            tokens: &tokens,
            pos: 0,
            allowed: &self.allowed,
        };
        match parser.expr() {
            Some(ok) if parser.pos == tokens.len() => ok,
            _ => false,
        }
    }
}

fn tokenize(expr: &str) -> Vec<String> {
    expr.replace('(', " ( ")
        .replace(')', " ) ")
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

struct Parser<'a> {
    tokens: &'a [String],
    pos: usize,
    allowed: &'a BTreeSet<String>,
}

impl Parser<'_> {
    fn peek_keyword(&self, keyword: &str) -> bool {
        self.tokens
            .get(self.pos)
            .is_some_and(|t| t.eq_ignore_ascii_case(keyword))
    }

    // expr := term (OR term)*
    fn expr(&mut self) -> Option<bool> {
        let mut value = self.term()?;
        while self.peek_keyword("or") {
            self.pos += 1;
            let rhs = self.term()?;
            value = value || rhs;
        }
        Some(value)
    }

    // term := factor (AND factor)*
    fn term(&mut self) -> Option<bool> {
        let mut value = self.factor()?;
        while self.peek_keyword("and") {
            self.pos += 1;
            let rhs = self.factor()?;
            value = value && rhs;
        }
        Some(value)
    }

    // factor := '(' expr ')' | id [WITH id]
    fn factor(&mut self) -> Option<bool> {
        let token = self.tokens.get(self.pos)?;
        self.pos += 1;
        if token == "(" {
            let value = self.expr()?;
            if self.tokens.get(self.pos).map(String::as_str) != Some(")") {
                return None;
            }
            self.pos += 1;
            return Some(value);
        }
        if token == ")" || token.eq_ignore_ascii_case("and") || token.eq_ignore_ascii_case("or") {
            return None;
        }

        let id = token.trim_end_matches('+').to_ascii_lowercase();
        if self.peek_keyword("with") {
            self.pos += 1;
            self.tokens.get(self.pos)?;
            self.pos += 1;
        }
        Some(self.allowed.contains(&id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_families() {
        let list = LicenseList::default();
        assert!(list.is_allowed(Some("MIT")));
        assert!(list.is_allowed(Some("apache-2.0")));
        assert!(list.is_allowed(Some("BSD-3-Clause")));
        assert!(!list.is_allowed(Some("GPL-3.0-only")));
        assert!(!list.is_allowed(None));
        assert!(!list.is_allowed(Some("  ")));
    }

    #[test]
    fn expressions() {
        let list = LicenseList::default();
        assert!(list.is_allowed(Some("(MIT OR GPL-3.0-only)")));
        assert!(list.is_allowed(Some("MIT AND Apache-2.0")));
        assert!(!list.is_allowed(Some("MIT AND GPL-3.0-only")));
        assert!(list.is_allowed(Some("GPL-2.0-only AND (MIT OR Apache-2.0) OR BSD-2-Clause")));
        assert!(!list.is_allowed(Some("GPL-2.0-only AND (MIT OR Apache-2.0)")));
        assert!(list.is_allowed(Some("Apache-2.0 WITH LLVM-exception")));
    }

    #[test]
    fn malformed_expressions_are_rejected() {
        let list = LicenseList::default();
        assert!(!list.is_allowed(Some("(MIT")));
        assert!(!list.is_allowed(Some("MIT OR")));
        assert!(!list.is_allowed(Some("MIT MIT")));
        assert!(!list.is_allowed(Some("AND MIT")));
    }

    #[test]
    fn custom_list() {
        let list = LicenseList::new(["ISC"]);
        assert_eq!(list.len(), 1);
        assert!(list.is_allowed(Some("isc")));
        assert!(!list.is_allowed(Some("MIT")));
    }
}
