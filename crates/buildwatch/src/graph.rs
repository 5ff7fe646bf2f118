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

//! In-memory commit graph for one repository: commits keyed by full hash,
//! children kept as an adjacency list keyed by the first-parent hash, and
//! the branch bookkeeping the watcher drives posting from.

use std::collections::HashMap;
use std::fmt;

use anyhow::{bail, Result};

/// Name of the master branch.
pub const MASTER: &str = "master";

/// A single commit as parsed from the log output.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Commit {
    /// Full hash, 40 lowercase hex digits.
    pub hash: String,
    /// Author line, "Name <email>".
    pub author: String,
    /// Committer date, RFC-2822 style, kept verbatim for forwarding.
    pub date: String,
    /// Plain text; first line is the short description.
    pub desc: String,
    /// First parent hash, empty for the initial commit.
    pub parent: String,
    /// Branch this commit was first recorded on (master wins).
    pub branch: String,
    /// Space-separated paths touched, possibly empty (e.g. merges).
    pub files: String,
}

impl Commit {
    /// Whether the commit should be benchmarked by the dashboard: only
    /// master commits that touch source files, excluding tests and
    /// test data.
    pub fn needs_benchmarking(&self) -> bool {
        if self.branch != MASTER {
            return false;
        }
        self.files.split(' ').any(|f| {
            (f.starts_with("include") || f.starts_with("src"))
                && !f.ends_with("_test.go")
                && !f.contains("testdata")
        })
    }
}

impl fmt::Display for Commit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.hash)?;
        if !self.branch.is_empty() {
            write!(f, "[{}]", self.branch)?;
        }
        let first_line = self.desc.split('\n').next().unwrap_or("");
        write!(f, "({:?})", first_line)
    }
}

/// A branch as observed by the watcher.
#[derive(Clone, Debug)]
pub struct Branch {
    pub name: String,
    /// Hash of the current tip.
    pub head: String,
    /// Hash of the newest ancestor of `head` the dashboard is known to
    /// have accepted, or None when nothing on the chain has been posted.
    pub last_seen: Option<String>,
}

/// What `record` did with one batch of log output.
#[derive(Debug, Default)]
pub struct RecordOutcome {
    /// Hashes newly inserted, in the order they appeared in the log.
    pub added: Vec<String>,
    /// Commits that were already present.
    pub duplicates: usize,
    /// Duplicates dropped because they arrived on a non-master branch.
    pub dropped: usize,
}

/// The commit DAG of one repository.
///
/// The parent relation is stored as a hash on each commit; the child
/// relation is an adjacency list keyed by parent hash. Only the first
/// parent of a merge is recorded, so each commit is the child of at most
/// one parent and the children lists form a forest.
#[derive(Default)]
pub struct CommitGraph {
    commits: HashMap<String, Commit>,
    children: HashMap<String, Vec<String>>,
}

impl CommitGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.commits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }

    pub fn get(&self, hash: &str) -> Option<&Commit> {
        self.commits.get(hash)
    }

    pub fn contains(&self, hash: &str) -> bool {
        self.commits.contains_key(hash)
    }

    /// Record one batch of log output observed on `branch` (topological
    /// order, newest first). A commit already present is kept as is; when
    /// the duplicate observation is on master, its recorded branch is
    /// rewritten to master, otherwise it is dropped. Newly inserted
    /// commits are linked to their parent, which must be present by the
    /// time the whole batch has been inserted.
    pub fn record(&mut self, branch: &str, log: Vec<Commit>) -> Result<RecordOutcome> {
        let mut outcome = RecordOutcome::default();
        for mut c in log {
            if let Some(existing) = self.commits.get_mut(&c.hash) {
                outcome.duplicates += 1;
                if branch != MASTER {
                    outcome.dropped += 1;
                    continue;
                }
                existing.branch = MASTER.to_string();
                continue;
            }
            c.branch = branch.to_string();
            outcome.added.push(c.hash.clone());
            self.commits.insert(c.hash.clone(), c);
        }

        // Link after inserting the whole batch: the log is newest first,
        // so a commit's parent shows up later in the same batch.
        for hash in &outcome.added {
            let parent = match self.commits.get(hash) {
                Some(c) => c.parent.clone(),
                None => continue,
            };
            if parent.is_empty() {
                tracing::debug!(commit = %hash, "no parent for initial commit");
                continue;
            }
            if !self.commits.contains_key(&parent) {
                bail!("can't find parent {:?} for {}", parent, hash);
            }
            self.children.entry(parent).or_default().push(hash.clone());
        }
        Ok(outcome)
    }

    /// The first-parent chain from `head` (inclusive), newest first.
    pub fn ancestry(&self, head: &str) -> Result<Vec<String>> {
        let mut chain = Vec::new();
        let mut cur = head.to_string();
        loop {
            let c = match self.commits.get(&cur) {
                Some(c) => c,
                None => bail!("can't find {:?} in commits", cur),
            };
            chain.push(cur.clone());
            if c.parent.is_empty() {
                return Ok(chain);
            }
            cur = c.parent.clone();
        }
    }

    /// The initial commit (empty parent hash), if one has been recorded.
    pub fn initial_commit(&self) -> Option<&Commit> {
        self.commits.values().find(|c| c.parent.is_empty())
    }

    /// Descendants of `from` that lie on `branch`, in posting order: the
    /// on-branch children of a node first, then the same walk through
    /// each child in order. `from` itself is not emitted. Uses an
    /// explicit stack so a long linear history cannot overflow the call
    /// stack.
    pub fn descendants_on_branch(&self, from: &str, branch: &str) -> Vec<String> {
        let mut out = Vec::new();
        let mut stack = vec![from.to_string()];
        while let Some(node) = stack.pop() {
            let kids = match self.children.get(&node) {
                Some(kids) => kids,
                None => continue,
            };
            for kid in kids {
                if self.commits.get(kid).is_some_and(|c| c.branch == branch) {
                    out.push(kid.clone());
                }
            }
            for kid in kids.iter().rev() {
                stack.push(kid.clone());
            }
        }
        out
    }
}
