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

//! Thin adapter over a local mirror clone. Every operation shells out to
//! the `git` binary with stdout and stderr captured in full, so failures
//! carry the subprocess output for diagnostics.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::graph::Commit;

const LOG_BOUNDARY: &str = "_-_- magic boundary -_-_";
const FILE_BOUNDARY: &str = "_-_- file boundary -_-_";
const LOG_FORMAT: &str =
    "--format=format:_-_- magic boundary -_-_%H\n%P\n%an <%ae>\n%cD\n%B\n_-_- file boundary -_-_";

/// Deadline for listing refs on a remote.
const REMOTE_LIST_TIMEOUT: Duration = Duration::from_secs(5);

/// Linear back-off step used by [`try_times`].
const BACKOFF_STEP: Duration = Duration::from_secs(5);

/// Run `f` up to `attempts` times with linear back-off (5 s times the
/// attempt index) before each try. Reports only the last error.
pub async fn try_times<T, F, Fut>(attempts: usize, mut f: F) -> Result<T>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last = None;
    for attempt in 0..attempts {
        tokio::time::sleep(BACKOFF_STEP * attempt as u32).await;
        match f(attempt).await {
            Ok(v) => return Ok(v),
            Err(e) => last = Some(e),
        }
    }
    Err(last.unwrap_or_else(|| anyhow!("no attempts made")))
}

/// A local mirror clone of one repository.
#[derive(Clone, Debug)]
pub struct GitRepo {
    root: PathBuf,
    name: String,
}

impl GitRepo {
    pub fn new(root: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        GitRepo {
            root: root.into(),
            name: name.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run git in the clone directory, returning stdout. A non-zero exit
    /// embeds the captured output in the error.
    async fn git(&self, args: &[&str]) -> Result<Vec<u8>> {
        let out = Command::new("git")
            .args(args)
            .current_dir(&self.root)
            .output()
            .await
            .with_context(|| format!("spawning git {}", args.join(" ")))?;
        if !out.status.success() {
            bail!(
                "git {}: {}\n{}{}",
                args.join(" "),
                out.status,
                String::from_utf8_lossy(&out.stdout),
                String::from_utf8_lossy(&out.stderr)
            );
        }
        Ok(out.stdout)
    }

    /// Create a bare mirror clone of `src_url` at `root`.
    pub async fn clone_mirror(src_url: &str, root: &Path) -> Result<()> {
        let out = Command::new("git")
            .arg("clone")
            .arg("--mirror")
            .arg(src_url)
            .arg(root)
            .output()
            .await
            .context("spawning git clone")?;
        if !out.status.success() {
            bail!(
                "cloning {}: {}\n\n{}{}",
                src_url,
                out.status,
                String::from_utf8_lossy(&out.stdout),
                String::from_utf8_lossy(&out.stderr)
            );
        }
        Ok(())
    }

    /// Whether the clone directory has been fetched into before; used to
    /// decide between reusing a cached clone and starting over.
    pub fn has_fetch_head(&self) -> bool {
        self.root.join("FETCH_HEAD").exists()
    }

    /// Whether a remote named "dest" already points at `dst_url`.
    pub async fn dest_remote_matches(&self, dst_url: &str) -> bool {
        let out = match self.git(&["remote", "-v"]).await {
            Ok(out) => out,
            Err(e) => {
                tracing::warn!(repo = %self.name, error = %e, "git remote -v failed");
                return false;
            }
        };
        for line in String::from_utf8_lossy(&out).lines() {
            if !line.starts_with("dest") {
                continue;
            }
            let mut fields = line.split_whitespace();
            if fields.next() == Some("dest") {
                match fields.next() {
                    Some(url) if url == dst_url => return true,
                    Some(url) => {
                        tracing::info!(repo = %self.name, found = %url, want = %dst_url,
                            "found dest remote with a different URL");
                    }
                    None => {}
                }
            }
        }
        false
    }

    /// Append a remote stanza to the clone's configuration.
    pub async fn add_remote(&self, name: &str, url: &str) -> Result<()> {
        let config = self.root.join("config");
        let mut f = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&config)
            .await
            .with_context(|| format!("opening {}", config.display()))?;
        f.write_all(format!("\n[remote {:?}]\n\turl = {}\n", name, url).as_bytes())
            .await
            .with_context(|| format!("appending remote {} to {}", name, config.display()))?;
        Ok(())
    }

    /// One `git fetch origin`; the watcher wraps this in [`try_times`].
    pub async fn fetch_origin(&self) -> Result<()> {
        self.git(&["fetch", "origin"]).await.map(|_| ())
    }

    /// Commits reachable under `range` in topological order, newest
    /// first. `path_filters`, when non-empty, restricts the walk to the
    /// given paths.
    pub async fn log(&self, range: &str, path_filters: &[String]) -> Result<Vec<Commit>> {
        let mut args: Vec<&str> = vec![
            "log",
            "--date=rfc",
            "--name-only",
            "--parents",
            LOG_FORMAT,
            "--topo-order",
            range,
        ];
        if !path_filters.is_empty() {
            args.push("--");
            args.extend(path_filters.iter().map(String::as_str));
        }
        let out = self.git(&args).await?;
        // Some descriptions carry a raw 0x1b byte, which downstream
        // consumers reject; scrub it before parsing.
        let text = String::from_utf8_lossy(&out).replace('\u{1b}', "?");
        parse_log(&text)
    }

    /// Best common ancestor hash of revisions `a` and `b`.
    pub async fn merge_base(&self, a: &str, b: &str) -> Result<String> {
        let out = self
            .git(&["merge-base", a, b])
            .await
            .with_context(|| format!("git merge-base {} {}", a, b))?;
        Ok(String::from_utf8_lossy(&out).trim().to_string())
    }

    /// Raw `git branch` listing for branch discovery.
    pub async fn branch_listing(&self) -> Result<String> {
        let out = self.git(&["branch"]).await?;
        Ok(String::from_utf8_lossy(&out).into_owned())
    }

    /// Map of ref name to hash for every local ref.
    pub async fn local_refs(&self) -> Result<HashMap<String, String>> {
        let out = self.git(&["show-ref"]).await?;
        Ok(parse_refs(&String::from_utf8_lossy(&out)))
    }

    /// Map of ref name to hash on `remote`. Bounded by a 5 second
    /// deadline; on expiry the subprocess is killed.
    pub async fn remote_refs(&self, remote: &str) -> Result<HashMap<String, String>> {
        let run = async {
            let out = Command::new("git")
                .args(["ls-remote", remote])
                .current_dir(&self.root)
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .output()
                .await
                .with_context(|| format!("spawning git ls-remote {}", remote))?;
            if !out.status.success() {
                bail!(
                    "git ls-remote {}: {}\n{}{}",
                    remote,
                    out.status,
                    String::from_utf8_lossy(&out.stdout),
                    String::from_utf8_lossy(&out.stderr)
                );
            }
            Ok(parse_refs(&String::from_utf8_lossy(&out.stdout)))
        };
        match tokio::time::timeout(REMOTE_LIST_TIMEOUT, run).await {
            Ok(res) => res,
            Err(_) => bail!(
                "git ls-remote {}: timed out after {:?}",
                remote,
                REMOTE_LIST_TIMEOUT
            ),
        }
    }

    /// Force-push the given `+hash:ref` updates to `remote`.
    pub async fn push_refs(&self, remote: &str, refspecs: &[String]) -> Result<()> {
        let mut args: Vec<&str> = vec!["push", "-f", remote];
        args.extend(refspecs.iter().map(String::as_str));
        self.git(&args).await.map(|_| ())
    }

    /// Gzipped tar of the tree at `rev`.
    pub async fn archive(&self, rev: &str) -> Result<Vec<u8>> {
        self.git(&["archive", "--format=tgz", rev]).await
    }
}

/// Parse boundary-delimited log output into commits.
fn parse_log(out: &str) -> Result<Vec<Commit>> {
    let mut commits = Vec::new();
    for record in out.split(LOG_BOUNDARY) {
        let record = record.trim();
        if record.is_empty() {
            continue;
        }
        let parts: Vec<&str> = record.splitn(5, '\n').collect();
        if parts.len() != 5 {
            bail!("malformed commit record: {:?}", record);
        }
        // The change summary holds the description followed by the file
        // boundary and the touched files; merges may list no files at
        // all, in which case the boundary is the last thing in the
        // record.
        let summary = parts[4];
        let (desc, files) = match summary.split_once(FILE_BOUNDARY) {
            Some((desc, files)) => (desc.trim(), files.trim()),
            None => (summary.trim(), ""),
        };
        commits.push(Commit {
            hash: parts[0].trim().to_string(),
            // TODO: only the first parent is kept, which flattens merge
            // edges out of the reconstructed graph.
            parent: parts[1].split(' ').next().unwrap_or("").trim().to_string(),
            author: parts[2].trim().to_string(),
            date: parts[3].trim().to_string(),
            desc: desc.to_string(),
            branch: String::new(),
            files: files.replace('\n', " ").trim().to_string(),
        });
    }
    Ok(commits)
}

/// Parse `hash ref` lines (show-ref, ls-remote) into a ref -> hash map.
fn parse_refs(out: &str) -> HashMap<String, String> {
    let mut refs = HashMap::new();
    for line in out.lines() {
        let mut fields = line.split_whitespace();
        if let (Some(hash), Some(name)) = (fields.next(), fields.next()) {
            refs.insert(name.to_string(), hash.to_string());
        }
    }
    refs
}

/// The path segment immediately after "refs/".
fn ref_class(name: &str) -> &str {
    let rest = name.strip_prefix("refs/").unwrap_or(name);
    match rest.find('/') {
        Some(i) => &rest[..i],
        None => rest,
    }
}

fn ref_priority(name: &str) -> u8 {
    match ref_class(name) {
        "heads" => 5,
        "tags" => 4,
        "changes" => 3,
        _ => 0,
    }
}

/// Sort refs highest-priority first, ties broken by name.
pub fn sort_refs_by_priority(refs: &mut [String]) {
    refs.sort_by(|a, b| {
        ref_priority(b)
            .cmp(&ref_priority(a))
            .then_with(|| a.cmp(b))
    });
}

/// Local refs whose remote value differs, in push order.
pub fn pending_refs(
    local: &HashMap<String, String>,
    remote: &HashMap<String, String>,
) -> Vec<String> {
    let mut pending: Vec<String> = local
        .iter()
        .filter(|(name, hash)| remote.get(*name) != Some(*hash))
        .map(|(name, _)| name.clone())
        .collect();
    sort_refs_by_priority(&mut pending);
    pending
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_log_single_commit() {
        let out = format!(
            "{}8c52b8e6f51d71b8a827b0e48fb2bec4b29d3716\n\
             0ffa1f124bc29c677d30b1ee9386f0b617c871e2\n\
             Gopher <gopher@golang.org>\n\
             Thu, 7 Apr 2005 22:13:13 -0700\n\
             runtime: fix scheduler\n\nLonger body here.\n{}\n\
             src/runtime/proc.go\nsrc/runtime/runtime.h\n",
            LOG_BOUNDARY, FILE_BOUNDARY
        );
        let commits = parse_log(&out).unwrap();
        assert_eq!(commits.len(), 1);
        let c = &commits[0];
        assert_eq!(c.hash, "8c52b8e6f51d71b8a827b0e48fb2bec4b29d3716");
        assert_eq!(c.parent, "0ffa1f124bc29c677d30b1ee9386f0b617c871e2");
        assert_eq!(c.author, "Gopher <gopher@golang.org>");
        assert_eq!(c.date, "Thu, 7 Apr 2005 22:13:13 -0700");
        assert_eq!(c.desc, "runtime: fix scheduler\n\nLonger body here.");
        assert_eq!(c.files, "src/runtime/proc.go src/runtime/runtime.h");
    }

    #[test]
    fn parse_log_keeps_first_parent_only() {
        let out = format!(
            "{}aaaa\nbbbb cccc dddd\nGopher <gopher@golang.org>\n\
             Thu, 7 Apr 2005 22:13:13 -0700\nmerge\n{}\n",
            LOG_BOUNDARY, FILE_BOUNDARY
        );
        let commits = parse_log(&out).unwrap();
        assert_eq!(commits[0].parent, "bbbb");
    }

    #[test]
    fn parse_log_merge_with_no_files() {
        let out = format!(
            "{}aaaa\nbbbb\nGopher <gopher@golang.org>\n\
             Thu, 7 Apr 2005 22:13:13 -0700\nmerge commit\n{}\n",
            LOG_BOUNDARY, FILE_BOUNDARY
        );
        let commits = parse_log(&out).unwrap();
        assert_eq!(commits[0].files, "");
        assert_eq!(commits[0].desc, "merge commit");
    }

    #[test]
    fn parse_log_initial_commit_has_empty_parent() {
        let out = format!(
            "{}aaaa\n\nGopher <gopher@golang.org>\n\
             Thu, 7 Apr 2005 22:13:13 -0700\ninitial\n{}\nsrc/all.bash\n",
            LOG_BOUNDARY, FILE_BOUNDARY
        );
        let commits = parse_log(&out).unwrap();
        assert_eq!(commits[0].parent, "");
    }

    #[test]
    fn parse_log_multiple_records() {
        let out = format!(
            "{b}cccc\nbbbb\nA <a@x>\nThu, 7 Apr 2005 22:13:15 -0700\nthird\n{f}\nsrc/c.go\n\
             {b}bbbb\naaaa\nA <a@x>\nThu, 7 Apr 2005 22:13:14 -0700\nsecond\n{f}\nsrc/b.go\n\
             {b}aaaa\n\nA <a@x>\nThu, 7 Apr 2005 22:13:13 -0700\nfirst\n{f}\nsrc/a.go\n",
            b = LOG_BOUNDARY,
            f = FILE_BOUNDARY
        );
        let commits = parse_log(&out).unwrap();
        let hashes: Vec<&str> = commits.iter().map(|c| c.hash.as_str()).collect();
        assert_eq!(hashes, vec!["cccc", "bbbb", "aaaa"]);
    }

    #[test]
    fn parse_log_rejects_malformed_record() {
        let out = format!("{}aaaa\nbbbb\n", LOG_BOUNDARY);
        assert!(parse_log(&out).is_err());
    }

    #[test]
    fn escape_byte_is_scrubbed_before_parsing() {
        let raw = format!(
            "{}aaaa\n\nA <a@x>\nThu, 7 Apr 2005 22:13:13 -0700\nbad \u{1b} byte\n{}\n",
            LOG_BOUNDARY, FILE_BOUNDARY
        );
        let scrubbed = raw.replace('\u{1b}', "?");
        let commits = parse_log(&scrubbed).unwrap();
        assert_eq!(commits[0].desc, "bad ? byte");
    }

    #[test]
    fn parse_refs_handles_both_listing_formats() {
        // show-ref separates with a space, ls-remote with a tab
        let out = "aaaa refs/heads/master\nbbbb\trefs/tags/go1.4\n";
        let refs = parse_refs(out);
        assert_eq!(refs.get("refs/heads/master").map(String::as_str), Some("aaaa"));
        assert_eq!(refs.get("refs/tags/go1.4").map(String::as_str), Some("bbbb"));
    }

    #[test]
    fn ref_classes() {
        assert_eq!(ref_class("refs/heads/master"), "heads");
        assert_eq!(ref_class("refs/tags/go1.4"), "tags");
        assert_eq!(ref_class("refs/changes/01/2/3"), "changes");
        assert_eq!(ref_class("refs/meta/config"), "meta");
        assert_eq!(ref_class("HEAD"), "HEAD");
    }

    #[test]
    fn refs_sort_by_class_then_name() {
        let mut refs = vec![
            "refs/changes/01".to_string(),
            "refs/tags/go1.4".to_string(),
            "refs/heads/release".to_string(),
            "refs/heads/master".to_string(),
            "refs/meta/config".to_string(),
        ];
        sort_refs_by_priority(&mut refs);
        assert_eq!(
            refs,
            vec![
                "refs/heads/master",
                "refs/heads/release",
                "refs/tags/go1.4",
                "refs/changes/01",
                "refs/meta/config",
            ]
        );
    }

    #[test]
    fn pending_refs_skips_matching_and_orders_by_class() {
        let local: HashMap<String, String> = [
            ("refs/heads/master".to_string(), "h1".to_string()),
            ("refs/tags/v1".to_string(), "t1".to_string()),
            ("refs/changes/01".to_string(), "c1".to_string()),
        ]
        .into();
        let remote: HashMap<String, String> = [
            ("refs/heads/master".to_string(), "h0".to_string()),
            ("refs/tags/v1".to_string(), "t1".to_string()),
        ]
        .into();
        assert_eq!(
            pending_refs(&local, &remote),
            vec!["refs/heads/master", "refs/changes/01"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn try_times_returns_last_error() {
        let mut calls = 0;
        let err = try_times(3, |_attempt| {
            calls += 1;
            let n = calls;
            async move { anyhow::Result::<()>::Err(anyhow!("attempt {} failed", n)) }
        })
        .await
        .unwrap_err();
        assert_eq!(calls, 3);
        assert!(err.to_string().contains("attempt 3 failed"));
    }

    #[tokio::test(start_paused = true)]
    async fn try_times_stops_on_success() {
        let mut calls = 0;
        let got = try_times(3, |attempt| {
            calls += 1;
            async move {
                if attempt == 1 {
                    Ok(attempt)
                } else {
                    Err(anyhow!("not yet"))
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(got, 1);
        assert_eq!(calls, 2);
    }
}
