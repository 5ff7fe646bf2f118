//! Runtime configuration, merged from defaults, an optional TOML file,
//! `BUILDWATCH_*` environment variables, and CLI flags, in that order of
//! increasing precedence.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;

/// Base URL of the upstream review server.
pub const UPSTREAM_BASE_DEFAULT: &str = "https://go.googlesource.com/";

/// Base URL of the build dashboard.
pub const DASH_URL_DEFAULT: &str = "https://build.golang.org/";

#[derive(Clone, Debug)]
pub struct Config {
    /// Review server base; subrepository URLs are `<base><name>`.
    pub upstream_base: String,
    /// Upstream URL of the main repository.
    pub repo_url: String,
    /// Dashboard base URL; must end in '/'.
    pub dash_url: String,
    /// Dashboard key file; only the first line is used.
    pub key_file: PathBuf,
    /// Upstream metadata poll interval.
    pub poll_interval: Duration,
    /// When false, all outbound HTTP is suppressed and the dashboard is
    /// an in-memory set (testing).
    pub network: bool,
    /// Mirror refs to the destination host.
    pub mirror: bool,
    /// Comma-separated path prefixes restricting the main repository's
    /// log walk.
    pub filter: Option<String>,
    /// Comma-separated explicit branch list; overrides discovery.
    pub branches: Option<String>,
    /// Listen address for the operator HTTP server; None disables it.
    pub http_addr: Option<String>,
    /// When false, posting is a logged no-op (dry run).
    pub report: bool,
    /// Clone cache directory, reused across restarts when it exists.
    pub cache_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        Config {
            upstream_base: UPSTREAM_BASE_DEFAULT.to_string(),
            repo_url: format!("{}go", UPSTREAM_BASE_DEFAULT),
            dash_url: DASH_URL_DEFAULT.to_string(),
            key_file: Path::new(&home).join(".buildkey"),
            poll_interval: Duration::from_secs(10),
            network: true,
            mirror: false,
            filter: None,
            branches: None,
            http_addr: None,
            report: true,
            cache_dir: PathBuf::from("/var/cache/buildwatch"),
        }
    }
}

impl Config {
    /// Name of the main repository: the last path segment of its URL.
    pub fn main_repo_name(&self) -> String {
        self.repo_url
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or("go")
            .to_string()
    }

    /// URL of the review server's metadata document.
    pub fn meta_url(&self) -> String {
        format!("{}?b=master&format=JSON", self.upstream_base)
    }

    /// The configured path filters, split for the log invocation.
    pub fn filter_paths(&self) -> Vec<String> {
        match &self.filter {
            Some(filter) => filter.split(',').map(str::to_string).collect(),
            None => Vec::new(),
        }
    }

    /// The explicit branch list, if configured. Used verbatim.
    pub fn branch_list(&self) -> Option<Vec<String>> {
        self.branches
            .as_ref()
            .map(|b| b.split(',').map(str::to_string).collect())
    }
}

/// CLI-level overrides that the binary passes to [`load_config`].
#[derive(Clone, Debug, Default)]
pub struct MergeOpts {
    pub config_path: Option<PathBuf>,
    pub cli_repo_url: Option<String>,
    pub cli_dash_url: Option<String>,
    pub cli_key_file: Option<PathBuf>,
    pub cli_poll_interval_seconds: Option<u64>,
    pub cli_network: Option<bool>,
    pub cli_mirror: Option<bool>,
    pub cli_filter: Option<String>,
    pub cli_branches: Option<String>,
    pub cli_http_addr: Option<String>,
    pub cli_report: Option<bool>,
    pub cli_cache_dir: Option<PathBuf>,
}

/// Load and merge Config from: defaults <- config file <- env vars <- CLI
pub fn load_config(mut base: Config, opts: MergeOpts) -> Result<Config> {
    if let Some(path) = opts.config_path.as_ref() {
        if path.exists() {
            let s = fs::read_to_string(path)?;
            let v: toml::Value = toml::from_str(&s)?;
            if let Some(x) = v.get("upstream_base").and_then(|x| x.as_str()) {
                base.upstream_base = x.to_string();
            }
            if let Some(x) = v.get("repo_url").and_then(|x| x.as_str()) {
                base.repo_url = x.to_string();
            }
            if let Some(x) = v.get("dash_url").and_then(|x| x.as_str()) {
                base.dash_url = x.to_string();
            }
            if let Some(x) = v.get("key_file").and_then(|x| x.as_str()) {
                base.key_file = PathBuf::from(x);
            }
            if let Some(x) = v.get("poll_interval_seconds").and_then(|x| x.as_integer()) {
                base.poll_interval = Duration::from_secs(x as u64);
            }
            if let Some(x) = v.get("network").and_then(|x| x.as_bool()) {
                base.network = x;
            }
            if let Some(x) = v.get("mirror").and_then(|x| x.as_bool()) {
                base.mirror = x;
            }
            if let Some(x) = v.get("filter").and_then(|x| x.as_str()) {
                base.filter = Some(x.to_string());
            }
            if let Some(x) = v.get("branches").and_then(|x| x.as_str()) {
                base.branches = Some(x.to_string());
            }
            if let Some(x) = v.get("http_addr").and_then(|x| x.as_str()) {
                base.http_addr = Some(x.to_string());
            }
            if let Some(x) = v.get("report").and_then(|x| x.as_bool()) {
                base.report = x;
            }
            if let Some(x) = v.get("cache_dir").and_then(|x| x.as_str()) {
                base.cache_dir = PathBuf::from(x);
            }
        }
    }

    // env vars override file
    if let Ok(x) = std::env::var("BUILDWATCH_REPO_URL") {
        base.repo_url = x;
    }
    if let Ok(x) = std::env::var("BUILDWATCH_DASH_URL") {
        base.dash_url = x;
    }
    if let Ok(x) = std::env::var("BUILDWATCH_KEY_FILE") {
        base.key_file = PathBuf::from(x);
    }
    if let Ok(x) = std::env::var("BUILDWATCH_POLL_INTERVAL_SECONDS") {
        if let Ok(secs) = x.parse::<u64>() {
            base.poll_interval = Duration::from_secs(secs);
        }
    }
    if let Ok(x) = std::env::var("BUILDWATCH_MIRROR") {
        base.mirror = x == "true";
    }
    if let Ok(x) = std::env::var("BUILDWATCH_HTTP_ADDR") {
        base.http_addr = Some(x);
    }
    if let Ok(x) = std::env::var("BUILDWATCH_CACHE_DIR") {
        base.cache_dir = PathBuf::from(x);
    }

    // CLI overrides everything
    if let Some(x) = opts.cli_repo_url {
        base.repo_url = x;
    }
    if let Some(x) = opts.cli_dash_url {
        base.dash_url = x;
    }
    if let Some(x) = opts.cli_key_file {
        base.key_file = x;
    }
    if let Some(x) = opts.cli_poll_interval_seconds {
        base.poll_interval = Duration::from_secs(x);
    }
    if let Some(x) = opts.cli_network {
        base.network = x;
    }
    if let Some(x) = opts.cli_mirror {
        base.mirror = x;
    }
    if let Some(x) = opts.cli_filter {
        base.filter = Some(x);
    }
    if let Some(x) = opts.cli_branches {
        base.branches = Some(x);
    }
    if let Some(x) = opts.cli_http_addr {
        base.http_addr = Some(x);
    }
    if let Some(x) = opts.cli_report {
        base.report = x;
    }
    if let Some(x) = opts.cli_cache_dir {
        base.cache_dir = x;
    }

    Ok(base)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clear_env() {
        std::env::remove_var("BUILDWATCH_REPO_URL");
        std::env::remove_var("BUILDWATCH_DASH_URL");
        std::env::remove_var("BUILDWATCH_KEY_FILE");
        std::env::remove_var("BUILDWATCH_POLL_INTERVAL_SECONDS");
        std::env::remove_var("BUILDWATCH_MIRROR");
        std::env::remove_var("BUILDWATCH_HTTP_ADDR");
        std::env::remove_var("BUILDWATCH_CACHE_DIR");
    }

    #[test]
    #[serial_test::serial]
    fn merge_file_env_cli_precedence() {
        clear_env();

        let tmp = tempfile::NamedTempFile::new().expect("tempfile");
        let toml = r#"
repo_url = "https://example.com/from-file"
poll_interval_seconds = 3
mirror = true
"#;
        fs::write(tmp.path(), toml).unwrap();

        std::env::set_var("BUILDWATCH_REPO_URL", "https://example.com/from-env");
        std::env::set_var("BUILDWATCH_POLL_INTERVAL_SECONDS", "4");

        let opts = MergeOpts {
            config_path: Some(tmp.path().to_path_buf()),
            cli_repo_url: Some("https://example.com/from-cli".to_string()),
            ..Default::default()
        };

        let got = load_config(Config::default(), opts).expect("load");
        // CLI wins over env over file
        assert_eq!(got.repo_url, "https://example.com/from-cli");
        // env wins over file
        assert_eq!(got.poll_interval.as_secs(), 4);
        // file wins over default
        assert!(got.mirror);

        clear_env();
    }

    #[test]
    #[serial_test::serial]
    fn invalid_env_is_ignored() {
        clear_env();

        let tmp = tempfile::NamedTempFile::new().expect("tempfile");
        fs::write(tmp.path(), "poll_interval_seconds = 6\n").unwrap();
        std::env::set_var("BUILDWATCH_POLL_INTERVAL_SECONDS", "not-a-number");

        let opts = MergeOpts {
            config_path: Some(tmp.path().to_path_buf()),
            ..Default::default()
        };
        let got = load_config(Config::default(), opts).expect("load");
        assert_eq!(got.poll_interval.as_secs(), 6);

        clear_env();
    }

    #[test]
    #[serial_test::serial]
    fn missing_file_keeps_defaults() {
        clear_env();
        let opts = MergeOpts {
            config_path: Some(PathBuf::from("/nonexistent/buildwatch.toml")),
            ..Default::default()
        };
        let got = load_config(Config::default(), opts).expect("load");
        assert_eq!(got.dash_url, DASH_URL_DEFAULT);
        assert!(got.network);
        assert!(got.report);
    }

    #[test]
    fn main_repo_name_is_last_url_segment() {
        let mut cfg = Config::default();
        assert_eq!(cfg.main_repo_name(), "go");
        cfg.repo_url = "https://example.com/mirrors/tools".to_string();
        assert_eq!(cfg.main_repo_name(), "tools");
    }

    #[test]
    fn filter_and_branch_lists_split_verbatim() {
        let mut cfg = Config::default();
        assert!(cfg.filter_paths().is_empty());
        assert!(cfg.branch_list().is_none());

        cfg.filter = Some("src,include".to_string());
        assert_eq!(cfg.filter_paths(), vec!["src", "include"]);

        cfg.branches = Some("master,release-branch.go1.42".to_string());
        assert_eq!(
            cfg.branch_list().unwrap(),
            vec!["master", "release-branch.go1.42"]
        );
    }

    #[test]
    fn meta_url_points_at_upstream_base() {
        let cfg = Config::default();
        assert_eq!(
            cfg.meta_url(),
            "https://go.googlesource.com/?b=master&format=JSON"
        );
    }
}
