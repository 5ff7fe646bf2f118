// Copyright 2025 Buildwatch Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Client for the build dashboard's commit protocol, plus the in-memory
//! stand-in used when network calls are disabled.

use std::collections::HashSet;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::graph::Commit;

/// Protocol version understood by the dashboard's commit handler.
pub const DASH_VERSION: u32 = 3;

/// Error text the dashboard returns when a package's history is already
/// rooted; posting stops silently when it shows up.
pub const FIRST_COMMIT_SENTINEL: &str = "this package already has a first commit; aborting";

/// What the watcher needs from the dashboard.
#[async_trait]
pub trait DashBoard: Send + Sync {
    /// Whether the dashboard already knows `hash` under `package_path`.
    async fn seen(&self, hash: &str, package_path: &str) -> Result<bool>;

    /// Report one commit under `package_path`.
    async fn post(&self, commit: &Commit, package_path: &str) -> Result<()>;
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    #[serde(rename = "Error", default)]
    error: String,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct PostedCommit<'a> {
    package_path: &'a str,
    hash: &'a str,
    parent_hash: &'a str,
    user: &'a str,
    desc: &'a str,
    time: DateTime<FixedOffset>,
    branch: &'a str,
    needs_benchmarking: bool,
}

/// Dashboard client over HTTP.
pub struct HttpDash {
    client: reqwest::Client,
    /// Base URL, ends in '/'.
    base: String,
    key: String,
}

impl HttpDash {
    pub fn new(client: reqwest::Client, base: impl Into<String>, key: impl Into<String>) -> Self {
        HttpDash {
            client,
            base: base.into(),
            key: key.into(),
        }
    }
}

#[async_trait]
impl DashBoard for HttpDash {
    async fn seen(&self, hash: &str, package_path: &str) -> Result<bool> {
        let resp = self
            .client
            .get(format!("{}commit", self.base))
            .query(&[("hash", hash), ("packagePath", package_path)])
            .send()
            .await
            .context("querying dashboard for commit")?;
        if !resp.status().is_success() {
            bail!("dashboard status: {}", resp.status());
        }
        let env: ErrorEnvelope = resp
            .json()
            .await
            .context("decoding dashboard commit response")?;
        match env.error.as_str() {
            "" => Ok(true),
            "Commit not found" => Ok(false),
            other => bail!("dashboard: {}", other),
        }
    }

    async fn post(&self, commit: &Commit, package_path: &str) -> Result<()> {
        tracing::info!(commit = %commit, "sending commit to dashboard");
        let time = DateTime::parse_from_rfc2822(&commit.date).with_context(|| {
            format!("parsing date {:?} for commit {}", commit.date, commit)
        })?;
        let body = PostedCommit {
            package_path,
            hash: &commit.hash,
            parent_hash: &commit.parent,
            user: &commit.author,
            desc: &commit.desc,
            time,
            branch: &commit.branch,
            needs_benchmarking: commit.needs_benchmarking(),
        };
        let version = DASH_VERSION.to_string();
        let resp = self
            .client
            .post(format!("{}commit", self.base))
            .query(&[("version", version.as_str()), ("key", self.key.as_str())])
            .header(reqwest::header::CONTENT_TYPE, "text/json")
            .body(serde_json::to_vec(&body).context("marshaling commit")?)
            .send()
            .await
            .context("posting commit")?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            bail!("posting commit: status {}\nbody: {}", status, body);
        }
        let env: ErrorEnvelope = resp.json().await.context("decoding post response")?;
        if !env.error.is_empty() {
            bail!("posting commit: {}", env.error);
        }
        Ok(())
    }
}

/// In-memory dashboard used when network calls are disabled. Enforces the
/// same parent-before-child ordering the real dashboard would and records
/// the posting order for assertions.
#[derive(Default)]
pub struct MemDash {
    seen: Mutex<HashSet<String>>,
    posted: Mutex<Vec<String>>,
}

impl MemDash {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend the dashboard already knows `hash`.
    pub fn mark_seen(&self, hash: &str) {
        self.seen.lock().insert(hash.to_string());
    }

    /// Hashes posted so far, oldest first.
    pub fn posted(&self) -> Vec<String> {
        self.posted.lock().clone()
    }
}

#[async_trait]
impl DashBoard for MemDash {
    async fn seen(&self, hash: &str, _package_path: &str) -> Result<bool> {
        Ok(self.seen.lock().contains(hash))
    }

    async fn post(&self, commit: &Commit, _package_path: &str) -> Result<()> {
        let mut seen = self.seen.lock();
        if !commit.parent.is_empty() && !seen.contains(&commit.parent) {
            bail!("no parent {} found on dashboard for {}", commit.parent, commit);
        }
        if !seen.insert(commit.hash.clone()) {
            bail!("already posted {}", commit);
        }
        self.posted.lock().push(commit.hash.clone());
        Ok(())
    }
}

#[derive(Deserialize)]
struct PackageList {
    #[serde(rename = "Response", default)]
    response: Vec<PackageEntry>,
    #[serde(rename = "Error", default)]
    error: String,
}

#[derive(Deserialize)]
struct PackageEntry {
    #[serde(rename = "Path")]
    path: String,
}

/// Fetch the dashboard's subrepository list as base import paths,
/// e.g. `["golang.org/x/tools", "golang.org/x/net"]`.
pub async fn subrepo_list(client: &reqwest::Client, dash_url: &str) -> Result<Vec<String>> {
    let resp = client
        .get(format!("{}packages", dash_url))
        .query(&[("kind", "subrepo")])
        .send()
        .await
        .context("fetching subrepo list")?;
    if !resp.status().is_success() {
        bail!("subrepo list: got status {}", resp.status());
    }
    let list: PackageList = resp.json().await.context("decoding subrepo list")?;
    if !list.error.is_empty() {
        bail!("subrepo list: {}", list.error);
    }
    Ok(list.response.into_iter().map(|p| p.path).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::MASTER;

    fn commit(hash: &str, parent: &str) -> Commit {
        Commit {
            hash: hash.to_string(),
            author: "Gopher <gopher@golang.org>".to_string(),
            date: "Thu, 7 Apr 2005 22:13:13 -0700".to_string(),
            desc: "a change".to_string(),
            parent: parent.to_string(),
            branch: MASTER.to_string(),
            files: "src/a.go".to_string(),
        }
    }

    #[tokio::test]
    async fn mem_dash_requires_parent_first() {
        let dash = MemDash::new();
        let err = dash.post(&commit("bbbb", "aaaa"), "").await.unwrap_err();
        assert!(err.to_string().contains("no parent"));

        dash.post(&commit("aaaa", ""), "").await.unwrap();
        dash.post(&commit("bbbb", "aaaa"), "").await.unwrap();
        assert_eq!(dash.posted(), vec!["aaaa", "bbbb"]);
    }

    #[tokio::test]
    async fn mem_dash_rejects_double_post() {
        let dash = MemDash::new();
        dash.post(&commit("aaaa", ""), "").await.unwrap();
        assert!(dash.post(&commit("aaaa", ""), "").await.is_err());
    }

    #[tokio::test]
    async fn mem_dash_seen_tracks_marks_and_posts() {
        let dash = MemDash::new();
        assert!(!dash.seen("aaaa", "").await.unwrap());
        dash.mark_seen("aaaa");
        assert!(dash.seen("aaaa", "").await.unwrap());
    }

    #[test]
    fn commit_date_parses_as_rfc2822() {
        let c = commit("aaaa", "");
        let t = DateTime::parse_from_rfc2822(&c.date).unwrap();
        assert_eq!(t.timezone().local_minus_utc(), -7 * 3600);
    }

    #[test]
    fn posted_commit_wire_format() {
        let c = commit("aaaa", "");
        let time = DateTime::parse_from_rfc2822(&c.date).unwrap();
        let body = PostedCommit {
            package_path: "golang.org/x/tools",
            hash: &c.hash,
            parent_hash: &c.parent,
            user: &c.author,
            desc: &c.desc,
            time,
            branch: &c.branch,
            needs_benchmarking: true,
        };
        let v: serde_json::Value = serde_json::to_value(&body).unwrap();
        assert_eq!(v["PackagePath"], "golang.org/x/tools");
        assert_eq!(v["Hash"], "aaaa");
        assert_eq!(v["ParentHash"], "");
        assert_eq!(v["User"], "Gopher <gopher@golang.org>");
        assert_eq!(v["Branch"], "master");
        assert_eq!(v["NeedsBenchmarking"], true);
        // chrono serializes with the original offset intact
        assert!(v["Time"].as_str().unwrap().starts_with("2005-04-07T22:13:13"));
    }
}
