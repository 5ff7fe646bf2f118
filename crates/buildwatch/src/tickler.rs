//! Cross-repository wakeups. A process-wide registry hands out one
//! coalesced signal per repository; a single poller watches the upstream
//! review server's metadata and tickles repositories whose master head
//! moved.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Deserialize;
use tokio::sync::Notify;

/// Registry of per-repository wakeup signals, created lazily and never
/// torn down. `Notify::notify_one` stores at most one permit, so any
/// number of tickles between two watcher iterations collapse into one
/// wakeup and the sender never blocks.
#[derive(Default)]
pub struct Tickler {
    channels: Mutex<HashMap<String, Arc<Notify>>>,
}

impl Tickler {
    pub fn new() -> Self {
        Self::default()
    }

    /// The wakeup signal for `repo`, created on first request.
    pub fn channel_for(&self, repo: &str) -> Arc<Notify> {
        let mut channels = self.channels.lock();
        channels
            .entry(repo.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }

    /// Non-blocking wakeup for `repo`; dropped if one is already pending.
    pub fn tickle(&self, repo: &str) {
        self.channel_for(repo).notify_one();
    }
}

#[derive(Deserialize)]
struct RepoMeta {
    #[serde(rename = "Branches", default)]
    branches: HashMap<String, String>,
}

/// Fetch the review server's metadata document and return the map from
/// repository name to its master head. The body is XSSI-prefixed with one
/// line that is discarded before decoding. Returns None on any transient
/// failure; repositories without a master branch are left out.
pub async fn upstream_meta_map(
    client: &reqwest::Client,
    meta_url: &str,
) -> Option<HashMap<String, String>> {
    let resp = client.get(meta_url).send().await.ok()?;
    if !resp.status().is_success() {
        return None;
    }
    let body = resp.text().await.ok()?;
    let (_, json) = body.split_once('\n')?;
    let meta: HashMap<String, RepoMeta> = match serde_json::from_str(json) {
        Ok(meta) => meta,
        Err(e) => {
            tracing::warn!(url = %meta_url, error = %e, "json decoding error from upstream metadata");
            return None;
        }
    };
    Some(
        meta.into_iter()
            .filter_map(|(repo, v)| v.branches.get("master").map(|h| (repo, h.clone())))
            .collect(),
    )
}

/// Polls the upstream metadata document and tickles every repository
/// whose master hash changed since the last observation.
pub struct UpstreamPoller {
    client: reqwest::Client,
    meta_url: String,
    interval: Duration,
    tickler: Arc<Tickler>,
}

impl UpstreamPoller {
    pub fn new(
        client: reqwest::Client,
        meta_url: impl Into<String>,
        interval: Duration,
        tickler: Arc<Tickler>,
    ) -> Self {
        UpstreamPoller {
            client,
            meta_url: meta_url.into(),
            interval,
            tickler,
        }
    }

    pub async fn run(self) {
        tracing::info!(url = %self.meta_url, interval = ?self.interval, "starting upstream poller");
        let mut last: HashMap<String, String> = HashMap::new();
        loop {
            if let Some(map) = upstream_meta_map(&self.client, &self.meta_url).await {
                for (repo, hash) in map {
                    if last.get(&repo) != Some(&hash) {
                        tracing::debug!(repo = %repo, head = %hash, "master moved; tickling");
                        self.tickler.tickle(&repo);
                        last.insert(repo, hash);
                    }
                }
            }
            tokio::time::sleep(self.interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn channel_is_shared_per_repo() {
        let t = Tickler::new();
        let a = t.channel_for("go");
        let b = t.channel_for("go");
        let other = t.channel_for("net");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &other));
    }

    #[tokio::test]
    async fn tickles_coalesce_into_one_wakeup() {
        let t = Tickler::new();
        // three distinct head changes observed before the watcher wakes
        t.tickle("go");
        t.tickle("go");
        t.tickle("go");

        let signal = t.channel_for("go");
        tokio::time::timeout(Duration::from_millis(50), signal.notified())
            .await
            .expect("one wakeup should be pending");
        // the permit is consumed; nothing further is pending
        assert!(
            tokio::time::timeout(Duration::from_millis(50), signal.notified())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn tickle_never_blocks() {
        let t = Tickler::new();
        for _ in 0..1000 {
            t.tickle("go");
        }
    }

    #[test]
    fn meta_document_decodes_after_xssi_prefix() {
        let body = ")]}'\n{\"go\": {\"Branches\": {\"master\": \"aaaa\"}}, \
                    \"net\": {\"Branches\": {\"dev\": \"cccc\"}}}";
        let (_, json) = body.split_once('\n').unwrap();
        let meta: HashMap<String, RepoMeta> = serde_json::from_str(json).unwrap();
        let map: HashMap<String, String> = meta
            .into_iter()
            .filter_map(|(repo, v)| v.branches.get("master").map(|h| (repo, h.clone())))
            .collect();
        // net has no master branch, so it is excluded from this tick
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("go").map(String::as_str), Some("aaaa"));
    }
}
