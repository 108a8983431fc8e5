//! pkghub - package registry indexing pipeline
#![allow(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::doc_markdown)]
//!
//! Operator surface for the ingestion, orchestration and catalog pipeline.
//!
//! # Storage Layout
//!
//! ```text
//! <storage root>/
//! ├── data/<name>/v<version>/metadata.json   # one record per package version
//! ├── artifacts/<name>/v<version>/package.tgz
//! ├── leases/<name>/v<version>.json           # per-identity execution leases
//! ├── catalog.json                            # the served catalog
//! ├── deny-list.json
//! └── inventory.json
//! ```

pub mod cmd;
pub mod context;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "pkghub", version = env!("PKGHUB_VERSION"), about, long_about = None)]
pub struct Cli {
    /// Configuration file (default: ~/.pkghub/config.toml)
    #[arg(long, global = true, env = "PKGHUB_CONFIG")]
    pub config: Option<PathBuf>,

    /// Use a local directory as package storage
    #[arg(long, global = true)]
    pub storage: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the pipeline over newline-delimited JSON ingestion events
    Serve {
        /// Read events from this file instead of stdin
        #[arg(long)]
        events: Option<PathBuf>,
    },
    /// Ingest a local package tarball and wait for the result
    Submit {
        /// Path to an npm-layout .tgz
        tarball: PathBuf,
        /// Package name (default: read from package.json)
        #[arg(long)]
        name: Option<String>,
        /// Package version (default: read from package.json)
        #[arg(long)]
        version: Option<String>,
    },
    /// Rebuild the catalog once
    Rebuild,
    /// Show the current catalog
    Catalog {
        /// Print the raw catalog document
        #[arg(long)]
        json: bool,
    },
    /// Inspect or replace the deny list
    Deny {
        #[command(subcommand)]
        command: DenyCommands,
    },
    /// Audit stored package records
    Inventory,
    /// Expire non-current object versions past their retention
    #[command(name = "prune-versions")]
    PruneVersions,
}

#[derive(Subcommand, Debug)]
pub enum DenyCommands {
    /// List the current rules
    Show,
    /// Replace all rules with the `[[deny]]` entries of a TOML file
    Set {
        /// TOML file with `[[deny]]` tables
        file: PathBuf,
    },
}
