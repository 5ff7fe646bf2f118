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

//! Per-repository watcher: keeps the mirror clone fresh, pushes ref
//! changes to the destination remote, and posts new commits to the
//! dashboard, driven by tickler wakeups with a slow safety timer.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use tokio::sync::Notify;

use crate::config::Config;
use crate::dash::{DashBoard, FIRST_COMMIT_SENTINEL};
use crate::git::{pending_refs, try_times, GitRepo};
use crate::graph::{Branch, CommitGraph, MASTER};
use crate::status::StatusRing;
use crate::tickler::Tickler;

/// Safety net for a broken tickler: the loop always runs at least this
/// often.
const SAFETY_POLL_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// At most this many refs go into one push invocation.
const PUSH_BATCH: usize = 200;

/// Watches one repository.
pub struct RepoWatcher {
    git: GitRepo,
    name: String,
    /// Base import path; empty for the main repository.
    path: String,
    graph: CommitGraph,
    branches: HashMap<String, Branch>,
    status: Arc<StatusRing>,
    dash: Arc<dyn DashBoard>,
    /// Post new commits to the dashboard.
    dash_enabled: bool,
    /// When false, posting is a logged no-op.
    report: bool,
    /// Push ref changes to the "dest" remote.
    mirror: bool,
    filters: Vec<String>,
    branch_override: Option<Vec<String>>,
    wakeup: Arc<Notify>,
}

impl RepoWatcher {
    /// Set up the mirror clone under `dir` and load initial state. When
    /// `dst_url` is set, a "dest" remote is configured and fully synced;
    /// when `dash_enabled`, the commit graph is loaded before watching
    /// starts.
    #[allow(clippy::too_many_arguments)]
    pub async fn new(
        dir: &Path,
        src_url: &str,
        dst_url: Option<&str>,
        import_path: &str,
        dash_enabled: bool,
        dash: Arc<dyn DashBoard>,
        tickler: &Tickler,
        cfg: &Config,
    ) -> Result<RepoWatcher> {
        let name = if import_path.is_empty() {
            cfg.main_repo_name()
        } else {
            import_path
                .rsplit('/')
                .next()
                .unwrap_or(import_path)
                .to_string()
        };
        let root = dir.join(&name);
        let filters = if import_path.is_empty() {
            cfg.filter_paths()
        } else {
            Vec::new()
        };
        let mut w = RepoWatcher {
            git: GitRepo::new(root, name.clone()),
            name: name.clone(),
            path: import_path.to_string(),
            graph: CommitGraph::new(),
            branches: HashMap::new(),
            status: Arc::new(StatusRing::new()),
            dash,
            dash_enabled,
            report: cfg.report,
            mirror: dst_url.is_some(),
            filters,
            branch_override: cfg.branch_list(),
            wakeup: tickler.channel_for(&name),
        };

        w.init_clone(src_url, dst_url).await?;

        if let Some(dst) = dst_url {
            w.status.add("adding dest remote");
            if let Err(e) = w.git.add_remote("dest", dst).await {
                w.status.add("failed to add dest");
                return Err(e.context("adding remote"));
            }
            w.status.add("added dest remote");
            tracing::info!(repo = %w.name, dest = %dst, "starting initial push");
            w.push().await?;
            tracing::info!(repo = %w.name, dest = %dst, "did initial push");
        }

        if w.dash_enabled {
            tracing::info!(repo = %w.name, "loading commit log");
            w.update(false).await?;
            tracing::info!(
                repo = %w.name,
                branches = w.branches.len(),
                commits = w.graph.len(),
                "loaded commit graph"
            );
        }

        Ok(w)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn git(&self) -> &GitRepo {
        &self.git
    }

    pub fn status(&self) -> Arc<StatusRing> {
        self.status.clone()
    }

    /// Watch continuously: fetch, push ref changes (if mirroring), post
    /// new commits (if reporting), then sleep until a tickle or the
    /// safety timer. Only returns on failure.
    pub async fn watch(mut self) -> Result<()> {
        loop {
            self.sync_once().await?;
            self.status.add("waiting");
            tokio::select! {
                _ = self.wakeup.notified() => {
                    self.status.add("got update tickle");
                }
                _ = tokio::time::sleep(SAFETY_POLL_INTERVAL) => {
                    self.status.add("poll timer fired");
                }
            }
        }
    }

    /// One fetch -> push -> post iteration.
    pub async fn sync_once(&mut self) -> Result<()> {
        self.fetch().await?;
        if self.mirror {
            self.push().await?;
        }
        if self.dash_enabled {
            self.update_dashboard().await?;
        }
        Ok(())
    }

    /// Reuse a prior clone when it looks healthy, otherwise wipe and
    /// clone from scratch.
    async fn init_clone(&self, src_url: &str, dst_url: Option<&str>) -> Result<()> {
        let mut need_clone = true;
        if self.should_try_reuse(dst_url).await {
            self.status.add("reusing git dir; running git fetch");
            let t0 = Instant::now();
            match self.git.fetch_origin().await {
                Ok(()) => {
                    need_clone = false;
                    tracing::info!(repo = %self.name, elapsed = ?t0.elapsed(), "ran git fetch");
                }
                Err(e) => {
                    tracing::warn!(repo = %self.name, error = %e,
                        "git fetch failed; proceeding to wipe and clone instead");
                }
            }
        }
        if need_clone {
            self.status.add("need clone; removing cache root");
            let _ = tokio::fs::remove_dir_all(self.git.root()).await;
            self.status.add("running fresh git clone --mirror");
            tracing::info!(repo = %self.name, url = %src_url, "cloning");
            let t0 = Instant::now();
            GitRepo::clone_mirror(src_url, self.git.root()).await?;
            self.status.add("cloned");
            tracing::info!(repo = %self.name, elapsed = ?t0.elapsed(), "cloned");
        }
        Ok(())
    }

    async fn should_try_reuse(&self, dst_url: Option<&str>) -> bool {
        if !self.git.has_fetch_head() {
            tracing::info!(repo = %self.name, root = %self.git.root().display(),
                "not reusing git dir; no FETCH_HEAD");
            return false;
        }
        match dst_url {
            None => true,
            Some(dst) => {
                if self.git.dest_remote_matches(dst).await {
                    true
                } else {
                    tracing::info!(repo = %self.name,
                        "not reusing old repo: remote \"dest\" URL doesn't match");
                    false
                }
            }
        }
    }

    /// Fetch from origin, retrying transient failures.
    async fn fetch(&self) -> Result<()> {
        self.status.add("running git fetch origin");
        let res = try_times(3, |attempt| {
            if attempt > 0 {
                self.status
                    .add(format!("running git fetch origin, attempt {}", attempt + 1));
            }
            let git = self.git.clone();
            let name = self.name.clone();
            async move {
                git.fetch_origin().await.map_err(|e| {
                    tracing::warn!(repo = %name, error = %e, "git fetch");
                    e
                })
            }
        })
        .await;
        match res {
            Ok(()) => {
                self.status.add("ran git fetch");
                Ok(())
            }
            Err(e) => {
                self.status.add("git fetch failed");
                Err(e)
            }
        }
    }

    /// Sync every local ref whose value differs on the "dest" remote,
    /// retrying the whole diff-and-push sequence on failure.
    async fn push(&self) -> Result<()> {
        self.status.add("syncing to mirror");
        let this = &*self;
        let res = try_times(3, |attempt| this.push_once(attempt)).await;
        match res {
            Ok(()) => {
                self.status.add("did sync to mirror");
                Ok(())
            }
            Err(e) => {
                self.status.add("sync to mirror failed");
                Err(e)
            }
        }
    }

    async fn push_once(&self, attempt: usize) -> Result<()> {
        if attempt > 0 {
            self.status
                .add(format!("syncing to mirror, attempt {}", attempt + 1));
        }
        self.status.add("sync: fetching local refs");
        let local = self.git.local_refs().await.map_err(|e| {
            tracing::warn!(repo = %self.name, error = %e, "failed to get local refs");
            e
        })?;
        self.status.add(format!("sync: got {} local refs", local.len()));

        self.status.add("sync: fetching remote refs");
        let remote = self.git.remote_refs("dest").await.map_err(|e| {
            tracing::warn!(repo = %self.name, error = %e, "failed to get remote refs");
            e
        })?;
        self.status
            .add(format!("sync: got {} remote refs", remote.len()));

        let pending = pending_refs(&local, &remote);
        if pending.is_empty() {
            self.status.add("nothing to sync");
            return Ok(());
        }

        let mut rest: &[String] = &pending;
        while !rest.is_empty() {
            self.status
                .add(format!("{} refs to push; pushing batch", rest.len()));
            tracing::info!(repo = %self.name, remaining = rest.len(),
                "refs remain to sync to mirror");
            let (batch, tail) = rest.split_at(rest.len().min(PUSH_BATCH));
            let refspecs: Vec<String> = batch
                .iter()
                .map(|name| format!("+{}:{}", local[name.as_str()], name))
                .collect();
            if let Err(e) = self.git.push_refs("dest", &refspecs).await {
                self.status.add("git push failure");
                tracing::warn!(repo = %self.name, error = %e, "git push failed");
                return Err(e);
            }
            rest = tail;
        }
        self.status.add("sync complete");
        Ok(())
    }

    /// Post everything the dashboard has not seen yet, branch by branch.
    async fn update_dashboard(&mut self) -> Result<()> {
        self.status.add("updating dashboard");
        self.update(true).await?;
        for name in self.list_branches().await? {
            if !self.branches.contains_key(&name) {
                // listed but never produced a commit; must be already
                // merged away
                continue;
            }
            self.post_new_commits(&name).await?;
        }
        self.status.add("updated dashboard");
        Ok(())
    }

    /// Look for new commits and branches and fold them into the graph.
    async fn update(&mut self, noisy: bool) -> Result<()> {
        for name in self.list_branches().await? {
            let known_head = self.branches.get(&name).map(|b| b.head.clone());
            let range = match &known_head {
                // only log commits down to the known head
                Some(head) => format!("{}..heads/{}", head, name),
                None => format!("heads/{}", name),
            };
            let log = self.git.log(&range, &self.filters).await?;
            if log.is_empty() {
                continue;
            }
            let head = log[0].hash.clone();
            if noisy {
                for c in &log {
                    tracing::info!(repo = %self.name, commit = %c, "found new commit");
                }
            }
            let outcome = self.graph.record(&name, log)?;
            if outcome.duplicates > 0 {
                tracing::info!(repo = %self.name, branch = %name,
                    duplicates = outcome.duplicates, dropped = outcome.dropped,
                    "saw duplicate commits");
            }
            if let Some(b) = self.branches.get_mut(&name) {
                b.head = head;
                tracing::info!(repo = %self.name, branch = %name, head = %b.head,
                    "updated branch head");
            } else {
                let last_seen = self.last_seen(&head).await?;
                tracing::info!(repo = %self.name, branch = %name, head = %head,
                    last_seen = ?last_seen, "found branch");
                self.branches.insert(
                    name.clone(),
                    Branch {
                        name: name.clone(),
                        head,
                        last_seen,
                    },
                );
            }
        }
        Ok(())
    }

    /// Branches to process, master first. The explicit branch override is
    /// used verbatim when configured.
    async fn list_branches(&self) -> Result<Vec<String>> {
        if let Some(list) = &self.branch_override {
            return Ok(list.clone());
        }
        let listing = self.git.branch_listing().await?;
        Ok(parse_branch_listing(&listing))
    }

    /// The newest ancestor of `head` the dashboard has seen, or None when
    /// the whole chain is unknown to it.
    ///
    /// Assumes "the dashboard has seen H" is monotone along the
    /// first-parent chain: every ancestor of a seen commit is seen. The
    /// chain is binary-searched under that assumption.
    async fn last_seen(&self, head: &str) -> Result<Option<String>> {
        let chain = self.graph.ancestry(head)?;
        let (mut lo, mut hi) = (0usize, chain.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.dash.seen(&chain[mid], &self.path).await? {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }
        Ok(chain.get(lo).cloned())
    }

    /// Post the unseen commits of one branch in parent-before-child
    /// order. `last_seen` advances to the branch head only when the whole
    /// traversal completed; the "first commit" sentinel stops it silently
    /// without advancing.
    async fn post_new_commits(&mut self, name: &str) -> Result<()> {
        let (head, last_seen) = match self.branches.get(name) {
            Some(b) => (b.head.clone(), b.last_seen.clone()),
            None => return Ok(()),
        };
        if last_seen.as_deref() == Some(head.as_str()) {
            return Ok(());
        }

        let order = match &last_seen {
            Some(from) => self.graph.descendants_on_branch(from, name),
            None if name == MASTER => {
                // Nothing on master was ever posted: start from the
                // repository's initial commit.
                let init = self
                    .graph
                    .initial_commit()
                    .ok_or_else(|| anyhow!("couldn't find initial commit"))?;
                let init_hash = init.hash.clone();
                let mut order = Vec::new();
                if init.branch == name {
                    order.push(init_hash.clone());
                }
                order.extend(self.graph.descendants_on_branch(&init_hash, name));
                order
            }
            None => {
                // Start from the commit this branch forked from.
                let base = self
                    .git
                    .merge_base(&format!("heads/{}", name), MASTER)
                    .await?;
                if !self.graph.contains(&base) {
                    bail!("couldn't find base commit: {}", base);
                }
                self.graph.descendants_on_branch(&base, name)
            }
        };

        for hash in &order {
            let c = self
                .graph
                .get(hash)
                .ok_or_else(|| anyhow!("commit {} missing from graph", hash))?;
            if !self.report {
                tracing::info!(repo = %self.name, commit = %c,
                    "dry-run mode; not posting commit to dashboard");
                continue;
            }
            if let Err(e) = self.dash.post(c, &self.path).await {
                if format!("{:#}", e).contains(FIRST_COMMIT_SENTINEL) {
                    return Ok(());
                }
                return Err(e.context(format!("posting {}", hash)));
            }
        }

        if let Some(b) = self.branches.get_mut(name) {
            b.last_seen = Some(head);
        }
        Ok(())
    }
}

/// Parse `git branch` output into the branches to process, master always
/// first. Aliases, blanks, and pre-modern release lines are skipped.
fn parse_branch_listing(listing: &str) -> Vec<String> {
    let mut branches = vec![MASTER.to_string()];
    for line in listing.lines() {
        let b = line.trim_start_matches("* ").trim();
        if b.is_empty() || b.contains("->") || b == MASTER {
            continue;
        }
        if b.starts_with("release-branch.r") {
            continue;
        }
        branches.push(b.to_string());
    }
    branches
}
