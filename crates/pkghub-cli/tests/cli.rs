//! Binary smoke tests against a temporary filesystem store.

use flate2::Compression;
use flate2::write::GzEncoder;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

/// Test context with an isolated home and a filesystem store
struct TestContext {
    temp_dir: TempDir,
    pkghub_home: PathBuf,
    storage: PathBuf,
}

impl TestContext {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let pkghub_home = temp_dir.path().join(".pkghub");
        let storage = temp_dir.path().join("storage");
        std::fs::create_dir_all(&pkghub_home).expect("failed to create pkghub home");

        Self {
            temp_dir,
            pkghub_home,
            storage,
        }
    }

    fn pkghub_cmd(&self) -> Command {
        let bin_path = env!("CARGO_BIN_EXE_pkghub");
        let mut cmd = Command::new(bin_path);
        cmd.env("HOME", self.temp_dir.path());
        cmd.env("PKGHUB_HOME", &self.pkghub_home);
        cmd.env_remove("PKGHUB_CONFIG");
        cmd.env("RUST_LOG", "warn");
        cmd.arg("--storage").arg(&self.storage);
        cmd
    }

    fn run(&self, args: &[&str]) -> Output {
        self.pkghub_cmd()
            .args(args)
            .output()
            .expect("failed to run pkghub")
    }

    fn write_tarball(&self, name: &str, version: &str, license: &str) -> PathBuf {
        let manifest = serde_json::json!({
            "name": name,
            "version": version,
            "description": format!("The {name} package"),
            "license": license,
        })
        .to_string();

        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        let mut header = tar::Header::new_gnu();
        header.set_size(manifest.len() as u64);
        header.set_mode(0o644);
        builder
            .append_data(&mut header, "package/package.json", manifest.as_bytes())
            .unwrap();
        let data = builder.into_inner().unwrap().finish().unwrap();

        let path = self
            .temp_dir
            .path()
            .join(format!("{}-{version}.tgz", name.replace('/', "-")));
        std::fs::write(&path, data).unwrap();
        path
    }
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn assert_ok(output: &Output) {
    assert!(
        output.status.success(),
        "command failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

fn submit(ctx: &TestContext, tarball: &Path) -> Output {
    ctx.run(&["submit", tarball.to_str().unwrap()])
}

#[test]
fn test_help_command() {
    let ctx = TestContext::new();
    let output = ctx.run(&["--help"]);
    assert_ok(&output);
    let out = stdout(&output);
    assert!(out.contains("Usage:"));
    assert!(out.contains("prune-versions"));
}

#[test]
fn test_version_command() {
    let ctx = TestContext::new();
    let output = ctx.run(&["--version"]);
    assert_ok(&output);
    assert!(stdout(&output).starts_with("pkghub "));
}

#[test]
fn test_empty_catalog() {
    let ctx = TestContext::new();
    let output = ctx.run(&["catalog"]);
    assert_ok(&output);
    assert!(stdout(&output).contains("No packages"));
}

#[test]
fn test_submit_then_catalog() {
    let ctx = TestContext::new();
    let tarball = ctx.write_tarball("left-pad", "1.3.0", "MIT");

    let output = submit(&ctx, &tarball);
    assert_ok(&output);
    assert!(stdout(&output).contains("left-pad@1.3.0 indexed"));

    let output = ctx.run(&["catalog", "--json"]);
    assert_ok(&output);
    let doc: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let packages = doc["packages"].as_array().unwrap();
    assert_eq!(packages.len(), 1);
    assert_eq!(packages[0]["identity"]["name"], "left-pad");
    assert_eq!(packages[0]["description"], "The left-pad package");

    // Same artifact again is a no-op.
    let output = submit(&ctx, &tarball);
    assert_ok(&output);
    assert!(stdout(&output).contains("already indexed"));
}

#[test]
fn test_submit_disallowed_license_fails() {
    let ctx = TestContext::new();
    let tarball = ctx.write_tarball("secret", "1.0.0", "Proprietary");

    let output = submit(&ctx, &tarball);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("rejected"));

    let output = ctx.run(&["catalog"]);
    assert!(stdout(&output).contains("No packages"));
}

#[test]
fn test_deny_set_removes_package_from_catalog() {
    let ctx = TestContext::new();
    assert_ok(&submit(&ctx, &ctx.write_tarball("foo", "1.0.0", "MIT")));
    assert_ok(&submit(&ctx, &ctx.write_tarball("bar", "2.0.0", "MIT")));

    let rules = ctx.temp_dir.path().join("deny.toml");
    std::fs::write(
        &rules,
        r#"
[[deny]]
package = "foo"
reason = "compromised"
"#,
    )
    .unwrap();
    let output = ctx.run(&["deny", "set", rules.to_str().unwrap()]);
    assert_ok(&output);
    assert!(stdout(&output).contains("removing foo@1.0.0"));

    let output = ctx.run(&["deny", "show"]);
    assert_ok(&output);
    assert!(stdout(&output).contains("compromised"));

    let output = ctx.run(&["catalog"]);
    assert_ok(&output);
    let out = stdout(&output);
    assert!(out.contains("bar"));
    assert!(!out.contains("foo"));

    // Denied records stay in storage and show up in the audit.
    let output = ctx.run(&["inventory"]);
    assert_ok(&output);
    assert!(stdout(&output).contains("denied   foo@1.0.0"));
}

#[test]
fn test_rebuild_reports_counts() {
    let ctx = TestContext::new();
    assert_ok(&submit(&ctx, &ctx.write_tarball("foo", "1.0.0", "MIT")));

    let output = ctx.run(&["rebuild"]);
    assert_ok(&output);
    let out = stdout(&output);
    assert!(out.contains("Catalog rebuilt"));
    assert!(out.contains("included"));
}

#[test]
fn test_serve_processes_event_file() {
    let ctx = TestContext::new();
    let tarball = ctx.write_tarball("served", "0.1.0", "MIT");

    // Stage the artifact where a `store:` location points, then replay its event.
    let data = std::fs::read(&tarball).unwrap();
    let artifact = ctx.storage.join("artifacts/served/v0.1.0/package.tgz");
    std::fs::create_dir_all(artifact.parent().unwrap()).unwrap();
    std::fs::write(&artifact, &data).unwrap();

    let digest = pkghub_schema::Sha256Digest::compute(&data).prefixed();
    let events = ctx.temp_dir.path().join("events.ndjson");
    std::fs::write(
        &events,
        format!(
            "{}\nnot json\n",
            serde_json::json!({
                "identity": { "name": "served", "version": "0.1.0" },
                "artifact_location": "store:artifacts/served/v0.1.0/package.tgz",
                "received_at": "2026-01-01T00:00:00Z",
                "integrity_digest": digest,
            })
        ),
    )
    .unwrap();

    let output = ctx.run(&["serve", "--events", events.to_str().unwrap()]);
    assert_ok(&output);
    let out = stdout(&output);
    assert!(out.contains("malformed"));

    let output = ctx.run(&["catalog", "--json"]);
    let doc: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(doc["packages"][0]["identity"]["version"], "0.1.0");
}
