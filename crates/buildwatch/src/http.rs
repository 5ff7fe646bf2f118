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

//! Operator HTTP surface: revision tarballs at `/<name>.tar.gz` and the
//! per-repository status page at `/debug/watcher/<name>`.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use parking_lot::RwLock;

use crate::git::GitRepo;
use crate::status::StatusRing;

/// What the handlers need for one repository.
#[derive(Clone)]
pub struct RepoEntry {
    pub git: GitRepo,
    pub status: Arc<StatusRing>,
}

/// Shared map of repository name to its handler state. Watchers register
/// themselves as they come up.
#[derive(Clone, Default)]
pub struct WatcherRegistry {
    repos: Arc<RwLock<HashMap<String, RepoEntry>>>,
}

impl WatcherRegistry {
    pub fn register(&self, name: &str, git: GitRepo, status: Arc<StatusRing>) {
        self.repos
            .write()
            .insert(name.to_string(), RepoEntry { git, status });
    }

    pub fn get(&self, name: &str) -> Option<RepoEntry> {
        self.repos.read().get(name).cloned()
    }
}

/// Routes for tarballs and status pages. Anything else, including other
/// methods on the known paths, gets a 400.
pub fn router(registry: WatcherRegistry) -> Router {
    Router::new()
        .route("/:archive", get(tarball).fallback(bad_request))
        .route("/debug/watcher/:name", get(status_page).fallback(bad_request))
        .fallback(bad_request)
        .with_state(registry)
}

async fn bad_request() -> StatusCode {
    StatusCode::BAD_REQUEST
}

/// `GET /<name>.tar.gz?rev=<revspec>`: gzipped tar of the tree at `rev`.
async fn tarball(
    State(registry): State<WatcherRegistry>,
    Path(archive): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let name = match archive.strip_suffix(".tar.gz") {
        Some(name) => name,
        None => return StatusCode::BAD_REQUEST.into_response(),
    };
    let entry = match registry.get(name) {
        Some(entry) => entry,
        None => return StatusCode::NOT_FOUND.into_response(),
    };
    let rev = match params.get("rev").map(String::as_str) {
        Some(rev) if !rev.is_empty() => rev,
        _ => return StatusCode::BAD_REQUEST.into_response(),
    };
    match entry.git.archive(rev).await {
        Ok(tgz) => (
            [(header::CONTENT_TYPE, "application/x-compressed")],
            tgz,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e)).into_response(),
    }
}

/// `GET /debug/watcher/<name>`: the status ring, newest first, with UTC
/// timestamps and relative ages.
async fn status_page(
    State(registry): State<WatcherRegistry>,
    Path(name): Path<String>,
) -> Response {
    let entry = match registry.get(&name) {
        Some(entry) => entry,
        None => return StatusCode::NOT_FOUND.into_response(),
    };
    let mut page = format!(
        "<html><head><title>watcher: {name}</title><body>\
         <h1>watcher status for repo: {name:?}</h1>\n<pre>\n"
    );
    let now = Utc::now();
    for e in entry.status.snapshot_desc() {
        let age = (now - e.at).num_seconds().max(0);
        page.push_str(&format!(
            "{}   {:<20} {}\n",
            e.at.format("%Y-%m-%dT%H:%M:%SZ"),
            format!("{} ago", format_age(age)),
            e.status
        ));
    }
    page.push_str("</pre>\n");
    Html(page).into_response()
}

/// Render a second count the way an operator reads it: "1h2m3s".
fn format_age(secs: i64) -> String {
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    let mut out = String::new();
    if h > 0 {
        out.push_str(&format!("{}h", h));
    }
    if m > 0 || h > 0 {
        out.push_str(&format!("{}m", m));
    }
    out.push_str(&format!("{}s", s));
    out
}
