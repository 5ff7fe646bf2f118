//! Startup and process lifetime: discover the repositories to watch,
//! spawn one watcher task per repository plus the upstream poller and the
//! HTTP server, and end the process on the first watcher failure.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::dash::{subrepo_list, DashBoard, HttpDash, MemDash};
use crate::http::{router, WatcherRegistry};
use crate::tickler::{upstream_meta_map, Tickler, UpstreamPoller};
use crate::watcher::RepoWatcher;

/// Repositories mirrored without asking the destination host first.
const MIRRORED: &[&str] = &[
    "arch",
    "benchmarks",
    "blog",
    "build",
    "crypto",
    "debug",
    "example",
    "exp",
    "gddo",
    "go",
    "gofrontend",
    "image",
    "mobile",
    "net",
    "oauth2",
    "playground",
    "proposal",
    "review",
    "sync",
    "sys",
    "talks",
    "term",
    "text",
    "time",
    "tools",
    "tour",
];

/// Run the watcher role. Blocks until a watcher fails and returns that
/// failure; the caller exits non-zero.
pub async fn run(cfg: Config) -> Result<()> {
    if !cfg.dash_url.ends_with('/') {
        bail!("dashboard URL must end in /");
    }
    let key = if cfg.report {
        read_key(&cfg.key_file)?
    } else {
        String::new()
    };

    // Reuse the cache root across restarts when it exists; otherwise work
    // in a temporary directory removed on exit.
    let (dir, _tmp_guard) = match std::fs::metadata(&cfg.cache_dir) {
        Ok(meta) if meta.is_dir() => (cfg.cache_dir.clone(), None),
        _ => {
            let tmp = tempfile::tempdir().context("creating working directory")?;
            (tmp.path().to_path_buf(), Some(tmp))
        }
    };

    let client = reqwest::Client::new();
    let dash: Arc<dyn DashBoard> = if cfg.network {
        Arc::new(HttpDash::new(client.clone(), cfg.dash_url.clone(), key))
    } else {
        Arc::new(MemDash::new())
    };
    let tickler = Arc::new(Tickler::new());
    let registry = WatcherRegistry::default();
    let (err_tx, mut err_rx) = mpsc::channel::<anyhow::Error>(16);

    if let Some(addr) = cfg.http_addr.as_deref().filter(|a| !a.is_empty()) {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding http server on {}", addr))?;
        let app = router(registry.clone());
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!(error = %e, "http server failed");
            }
        });
    }

    let cfg = Arc::new(cfg);

    let main_name = cfg.main_repo_name();
    let main_dst = cfg
        .mirror
        .then(|| format!("git@github.com:golang/{}.git", main_name));
    start_watcher(
        WatchTarget {
            src_url: cfg.repo_url.clone(),
            dst_url: main_dst,
            import_path: String::new(),
            dash_enabled: true,
        },
        dir.clone(),
        dash.clone(),
        tickler.clone(),
        registry.clone(),
        cfg.clone(),
        err_tx.clone(),
    );

    let mut covered: HashSet<String> = HashSet::new();
    covered.insert(main_name);

    let subrepos = if cfg.network {
        subrepo_list(&client, &cfg.dash_url).await?
    } else {
        Vec::new()
    };
    for import_path in subrepos {
        let name = import_path
            .rsplit('/')
            .next()
            .unwrap_or(&import_path)
            .to_string();
        covered.insert(name.clone());
        let dst_url = mirror_dest(&client, &cfg, &name).await;
        start_watcher(
            WatchTarget {
                src_url: format!("{}{}", cfg.upstream_base, name),
                dst_url,
                import_path,
                dash_enabled: true,
            },
            dir.clone(),
            dash.clone(),
            tickler.clone(),
            registry.clone(),
            cfg.clone(),
            err_tx.clone(),
        );
    }

    if cfg.mirror {
        // Repositories the review server knows about that the dashboard
        // does not list still get mirrored, just never posted.
        if let Some(meta) = upstream_meta_map(&client, &cfg.meta_url()).await {
            for name in meta.keys() {
                if covered.contains(name) {
                    continue;
                }
                let dst_url = mirror_dest(&client, &cfg, name).await;
                start_watcher(
                    WatchTarget {
                        src_url: format!("{}{}", cfg.upstream_base, name),
                        dst_url,
                        import_path: format!("golang.org/x/{}", name),
                        dash_enabled: false,
                    },
                    dir.clone(),
                    dash.clone(),
                    tickler.clone(),
                    registry.clone(),
                    cfg.clone(),
                    err_tx.clone(),
                );
            }
        }
    }

    if cfg.network {
        tokio::spawn(
            UpstreamPoller::new(
                client.clone(),
                cfg.meta_url(),
                cfg.poll_interval,
                tickler.clone(),
            )
            .run(),
        );
    }

    match err_rx.recv().await {
        Some(e) => Err(e),
        None => bail!("all watchers exited"),
    }
}

struct WatchTarget {
    src_url: String,
    dst_url: Option<String>,
    import_path: String,
    dash_enabled: bool,
}

fn start_watcher(
    target: WatchTarget,
    dir: PathBuf,
    dash: Arc<dyn DashBoard>,
    tickler: Arc<Tickler>,
    registry: WatcherRegistry,
    cfg: Arc<Config>,
    err_tx: mpsc::Sender<anyhow::Error>,
) {
    tokio::spawn(async move {
        tracing::info!(url = %target.src_url, "starting watch");
        let res = async {
            let w = RepoWatcher::new(
                &dir,
                &target.src_url,
                target.dst_url.as_deref(),
                &target.import_path,
                target.dash_enabled,
                dash,
                &tickler,
                &cfg,
            )
            .await?;
            registry.register(w.name(), w.git().clone(), w.status());
            w.watch().await
        }
        .await;
        if let Err(e) = res {
            let _ = err_tx.send(e).await;
        }
    });
}

/// Destination URL for a repository that should be mirrored, or None.
async fn mirror_dest(client: &reqwest::Client, cfg: &Config, name: &str) -> Option<String> {
    if !cfg.mirror {
        return None;
    }
    if should_mirror(client, name).await {
        tracing::info!(repo = %name, "starting mirror");
        Some(format!("git@github.com:golang/{}.git", name))
    } else {
        tracing::info!(repo = %name, "not mirroring repo");
        None
    }
}

/// Whether `name` should be mirrored to the destination host: either on
/// the fixed list, or alive behind its vanity import URL.
async fn should_mirror(client: &reqwest::Client, name: &str) -> bool {
    if MIRRORED.contains(&name) {
        return true;
    }
    match client
        .get(format!("https://golang.org/x/{}", name))
        .send()
        .await
    {
        Ok(resp) => resp.status().is_success(),
        Err(e) => {
            tracing::info!(repo = %name, error = %e, "repo doesn't seem to exist");
            false
        }
    }
}

/// First line of the dashboard key file.
fn read_key(path: &Path) -> Result<String> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading dashboard key file {}", path.display()))?;
    Ok(contents.lines().next().unwrap_or("").trim().to_string())
}
