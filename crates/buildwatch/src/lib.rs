//! Watches git repositories hosted on an upstream review server for new
//! commits, reports them to the build dashboard, and optionally mirrors
//! them to a destination host.
//!
//! Structure:
//! - One watcher task per repository runs a fetch -> push -> post loop
//! - A single upstream poller coalesces review-server events into
//!   per-repository wakeups
//! - A small HTTP surface serves revision tarballs and operator status

pub mod config;
pub mod dash;
pub mod git;
pub mod graph;
pub mod http;
pub mod status;
pub mod supervisor;
pub mod tickler;
pub mod watcher;

pub use config::{load_config, Config, MergeOpts};
pub use dash::{DashBoard, HttpDash, MemDash};
pub use graph::{Branch, Commit, CommitGraph, MASTER};
pub use status::{StatusEntry, StatusRing};
pub use tickler::Tickler;
pub use watcher::RepoWatcher;
