//! Shared helpers for integration tests that drive the real git binary.

use std::path::Path;
use std::process::Command;

/// Whether the git binary is usable; tests skip with a message when not.
pub fn git_available() -> bool {
    Command::new("git")
        .arg("version")
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

pub fn run_git(dir: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .args([
            "-c",
            "user.name=Gopher",
            "-c",
            "user.email=gopher@golang.org",
            "-c",
            "commit.gpgsign=false",
        ])
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap_or_else(|e| panic!("spawning git {:?}: {}", args, e));
    assert!(
        out.status.success(),
        "git {:?} failed: {}{}",
        args,
        String::from_utf8_lossy(&out.stdout),
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).into_owned()
}

/// A throwaway upstream repository with a master branch.
pub struct ScratchRepo {
    dir: tempfile::TempDir,
}

impl ScratchRepo {
    pub fn init() -> ScratchRepo {
        let dir = tempfile::tempdir().expect("tempdir");
        run_git(dir.path(), &["init", "--quiet"]);
        // pin the unborn branch name regardless of the git default
        run_git(dir.path(), &["symbolic-ref", "HEAD", "refs/heads/master"]);
        ScratchRepo { dir }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn url(&self) -> String {
        self.dir.path().display().to_string()
    }

    pub fn run(&self, args: &[&str]) -> String {
        run_git(self.dir.path(), args)
    }

    /// Write `contents` to `file`, commit it, and return the commit hash.
    pub fn commit_file(&self, file: &str, contents: &str, msg: &str) -> String {
        let path = self.dir.path().join(file);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("mkdir");
        }
        std::fs::write(&path, contents).expect("write");
        self.run(&["add", "."]);
        self.run(&["commit", "--quiet", "-m", msg]);
        self.rev_parse("HEAD")
    }

    pub fn rev_parse(&self, rev: &str) -> String {
        self.run(&["rev-parse", rev]).trim().to_string()
    }
}
