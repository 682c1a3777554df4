//! Version-control substrate: isolated workspaces and snapshots.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use ignore::overrides::OverrideBuilder;
use ignore::WalkBuilder;
use tracing::{debug, info, warn};

use crate::backlog::sanitize_component;
use crate::error::{RalphError, Result};
use crate::process::{run_command, CommandOutput};

/// Never copied or scanned, on top of whatever the tree's ignore files list.
const SKIP_DIRS: &[&str] = &[".git", ".ralph"];

/// Isolation and snapshotting for worker workspaces.
#[async_trait]
pub trait VersionControl: Send + Sync {
    /// Create a private working copy derived from `source_ref` for `worker_id`.
    async fn isolate_workspace(&self, source_ref: &str, worker_id: &str) -> Result<PathBuf>;

    /// Record the workspace state; returns a reference to the snapshot.
    async fn snapshot(&self, workspace: &Path, message: &str) -> Result<String>;

    /// Paths (relative to the workspace) changed since the last snapshot.
    async fn modified_files(&self, workspace: &Path) -> Result<Vec<String>>;

    /// Tear down a workspace made by [`VersionControl::isolate_workspace`].
    async fn remove_workspace(&self, workspace: &Path) -> Result<()>;

    /// Start tracking changes in a workspace that was not isolated here.
    async fn track(&self, _workspace: &Path) -> Result<()> {
        Ok(())
    }
}

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    pub path: String,
}

/// Parse one porcelain v1 line. Renames report the new path.
pub fn parse_status_line(line: &str) -> Option<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Some(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return None;
    }
    let code = line.get(..2)?.to_string();
    let mut path = line.get(3..)?.trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Some(StatusEntry { code, path })
}

/// Git worktrees under a workspaces directory.
#[derive(Debug, Clone)]
pub struct GitVcs {
    repo: PathBuf,
    workspaces_root: PathBuf,
    timeout: Duration,
}

impl GitVcs {
    pub fn new(
        repo: impl Into<PathBuf>,
        workspaces_root: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            repo: repo.into(),
            workspaces_root: workspaces_root.into(),
            timeout,
        }
    }

    /// Whether `path` is inside a git repository.
    pub fn is_repo(path: &Path) -> bool {
        path.join(".git").exists()
    }

    async fn git(&self, workdir: &Path, args: &[&str]) -> Result<CommandOutput> {
        let output = run_command("git", args, workdir, &[], None, Some(self.timeout))
            .await
            .map_err(|e| RalphError::Vcs(format!("spawn git {}: {}", args.join(" "), e)))?;
        if output.timed_out {
            return Err(RalphError::Timeout {
                operation: format!("git {}", args.join(" ")),
                seconds: self.timeout.as_secs(),
            });
        }
        if !output.success {
            return Err(RalphError::Vcs(format!(
                "git {} failed: {}",
                args.join(" "),
                output.stderr.trim()
            )));
        }
        Ok(output)
    }
}

#[async_trait]
impl VersionControl for GitVcs {
    async fn isolate_workspace(&self, source_ref: &str, worker_id: &str) -> Result<PathBuf> {
        let name = sanitize_component(worker_id);
        let path = self.workspaces_root.join(&name);
        if path.exists() {
            warn!(workspace = %path.display(), "stale workspace, replacing");
            self.remove_workspace(&path).await?;
        }
        fs::create_dir_all(&self.workspaces_root)?;
        let branch = format!("ralph-worker/{}", name);
        let path_arg = path.to_string_lossy().into_owned();
        self.git(
            &self.repo,
            &["worktree", "add", "-B", &branch, &path_arg, source_ref],
        )
        .await?;
        info!(worker_id, branch = %branch, workspace = %path.display(), "worktree created");
        Ok(path)
    }

    async fn snapshot(&self, workspace: &Path, message: &str) -> Result<String> {
        self.git(workspace, &["add", "-A"]).await?;
        let staged = self
            .git(workspace, &["diff", "--cached", "--name-only"])
            .await?;
        if staged.stdout.trim().is_empty() {
            debug!(workspace = %workspace.display(), "nothing staged, snapshot is HEAD");
        } else {
            self.git(workspace, &["commit", "-m", message]).await?;
        }
        let head = self.git(workspace, &["rev-parse", "HEAD"]).await?;
        Ok(head.stdout.trim().to_string())
    }

    async fn modified_files(&self, workspace: &Path) -> Result<Vec<String>> {
        let output = self
            .git(workspace, &["status", "--porcelain=v1", "-uall"])
            .await?;
        Ok(output
            .stdout
            .lines()
            .filter_map(parse_status_line)
            .map(|entry| entry.path)
            .collect())
    }

    async fn remove_workspace(&self, workspace: &Path) -> Result<()> {
        let path_arg = workspace.to_string_lossy().into_owned();
        if let Err(err) = self
            .git(&self.repo, &["worktree", "remove", "--force", &path_arg])
            .await
        {
            warn!(error = %err, "worktree remove failed, deleting directory");
            if workspace.exists() {
                fs::remove_dir_all(workspace)?;
            }
            self.git(&self.repo, &["worktree", "prune"]).await?;
        }
        Ok(())
    }
}

type Manifest = HashMap<String, (u64, Option<SystemTime>)>;

/// Plain directory copies, for sources that are not git repositories.
///
/// Snapshots are labels only; change detection compares file size and
/// modification time against a manifest taken at isolation or snapshot.
#[derive(Debug)]
pub struct CopyVcs {
    source: PathBuf,
    workspaces_root: PathBuf,
    manifests: Mutex<HashMap<PathBuf, Manifest>>,
    snapshots: Mutex<u64>,
}

impl CopyVcs {
    pub fn new(source: impl Into<PathBuf>, workspaces_root: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            workspaces_root: workspaces_root.into(),
            manifests: Mutex::new(HashMap::new()),
            snapshots: Mutex::new(0),
        }
    }

    async fn record_manifest(&self, workspace: &Path) -> Result<()> {
        let manifest = scan_blocking(workspace).await?;
        let mut manifests = self
            .manifests
            .lock()
            .map_err(|_| RalphError::Vcs("manifest lock poisoned".to_string()))?;
        manifests.insert(workspace.to_path_buf(), manifest);
        Ok(())
    }
}

#[async_trait]
impl VersionControl for CopyVcs {
    async fn isolate_workspace(&self, _source_ref: &str, worker_id: &str) -> Result<PathBuf> {
        let path = self.workspaces_root.join(sanitize_component(worker_id));
        let source = self.source.clone();
        let target = path.clone();
        blocking(move || {
            if target.exists() {
                fs::remove_dir_all(&target)?;
            }
            copy_tree(&source, &target)
        })
        .await?;
        self.record_manifest(&path).await?;
        debug!(worker_id, workspace = %path.display(), "workspace copied");
        Ok(path)
    }

    async fn snapshot(&self, workspace: &Path, message: &str) -> Result<String> {
        self.record_manifest(workspace).await?;
        let mut count = self
            .snapshots
            .lock()
            .map_err(|_| RalphError::Vcs("snapshot counter poisoned".to_string()))?;
        *count += 1;
        debug!(workspace = %workspace.display(), message, "directory snapshot");
        Ok(format!("copy-{}", *count))
    }

    async fn modified_files(&self, workspace: &Path) -> Result<Vec<String>> {
        let current = scan_blocking(workspace).await?;
        let manifests = self
            .manifests
            .lock()
            .map_err(|_| RalphError::Vcs("manifest lock poisoned".to_string()))?;
        let Some(baseline) = manifests.get(workspace) else {
            return Ok(Vec::new());
        };
        let mut changed: Vec<String> = current
            .iter()
            .filter(|(path, meta)| baseline.get(*path) != Some(*meta))
            .map(|(path, _)| path.clone())
            .chain(
                baseline
                    .keys()
                    .filter(|path| !current.contains_key(*path))
                    .cloned(),
            )
            .collect();
        changed.sort();
        Ok(changed)
    }

    async fn remove_workspace(&self, workspace: &Path) -> Result<()> {
        if let Ok(mut manifests) = self.manifests.lock() {
            manifests.remove(workspace);
        }
        if workspace.exists() {
            fs::remove_dir_all(workspace)?;
        }
        Ok(())
    }

    async fn track(&self, workspace: &Path) -> Result<()> {
        self.record_manifest(workspace).await
    }
}

/// Filesystem work for [`CopyVcs`] runs off the async worker threads.
async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| RalphError::Vcs(format!("workspace task failed: {}", e)))?
}

async fn scan_blocking(root: &Path) -> Result<Manifest> {
    let root = root.to_path_buf();
    blocking(move || scan(&root)).await
}

/// Project files under `root`. Hidden files are included; `.gitignore` and
/// `.ignore` rules inside the tree apply even when `root` is not a git
/// repository, rules from directories above it do not.
fn project_walk(root: &Path) -> Result<ignore::Walk> {
    let mut overrides = OverrideBuilder::new(root);
    for dir in SKIP_DIRS {
        overrides.add(&format!("!{}", dir)).map_err(walk_error)?;
    }
    let overrides = overrides.build().map_err(walk_error)?;
    Ok(WalkBuilder::new(root)
        .hidden(false)
        .parents(false)
        .require_git(false)
        .overrides(overrides)
        .build())
}

fn walk_error(err: ignore::Error) -> RalphError {
    RalphError::Vcs(format!("walking workspace: {}", err))
}

fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    fs::create_dir_all(to)?;
    for entry in project_walk(from)? {
        let entry = entry.map_err(walk_error)?;
        let Ok(relative) = entry.path().strip_prefix(from) else {
            continue;
        };
        if relative.as_os_str().is_empty() {
            continue;
        }
        let target = to.join(relative);
        match entry.file_type() {
            Some(kind) if kind.is_dir() => fs::create_dir_all(&target)?,
            Some(kind) if kind.is_file() => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::copy(entry.path(), &target)?;
            }
            _ => {}
        }
    }
    Ok(())
}

fn scan(root: &Path) -> Result<Manifest> {
    let mut manifest = Manifest::new();
    for entry in project_walk(root)? {
        let entry = entry.map_err(walk_error)?;
        if !entry.file_type().is_some_and(|kind| kind.is_file()) {
            continue;
        }
        let meta = entry.metadata().map_err(walk_error)?;
        let relative = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        manifest.insert(relative, (meta.len(), meta.modified().ok()));
    }
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_status_line() {
        assert_eq!(
            parse_status_line("?? src/new.rs"),
            Some(StatusEntry {
                code: "??".into(),
                path: "src/new.rs".into()
            })
        );
        assert_eq!(
            parse_status_line(" M src/lib.rs").map(|e| e.path),
            Some("src/lib.rs".to_string())
        );
        assert_eq!(
            parse_status_line("R  old.rs -> new.rs").map(|e| e.path),
            Some("new.rs".to_string())
        );
        assert_eq!(parse_status_line("M"), None);
    }

    #[tokio::test]
    async fn test_copy_vcs_isolates_and_detects_changes() {
        let source = TempDir::new().expect("source");
        fs::create_dir_all(source.path().join("src")).expect("mkdir");
        fs::write(source.path().join("src/lib.rs"), "fn a() {}").expect("write");
        fs::create_dir_all(source.path().join(".ralph")).expect("mkdir");
        fs::write(source.path().join(".ralph/config.toml"), "").expect("write");

        let root = TempDir::new().expect("root");
        let vcs = CopyVcs::new(source.path(), root.path());
        let workspace = vcs.isolate_workspace("HEAD", "worker-1").await.expect("isolate");

        assert!(workspace.join("src/lib.rs").exists());
        assert!(!workspace.join(".ralph").exists());
        assert!(vcs.modified_files(&workspace).await.expect("diff").is_empty());

        fs::write(workspace.join("src/lib.rs"), "fn a() { changed() }").expect("edit");
        fs::write(workspace.join("src/new.rs"), "").expect("add");
        let changed = vcs.modified_files(&workspace).await.expect("diff");
        assert_eq!(changed, vec!["src/lib.rs", "src/new.rs"]);

        // The source tree is untouched
        assert_eq!(
            fs::read_to_string(source.path().join("src/lib.rs")).expect("read"),
            "fn a() {}"
        );

        let first = vcs.snapshot(&workspace, "feat: US-001").await.expect("snapshot");
        assert_eq!(first, "copy-1");
        assert!(vcs.modified_files(&workspace).await.expect("diff").is_empty());

        vcs.remove_workspace(&workspace).await.expect("remove");
        assert!(!workspace.exists());
    }

    #[tokio::test]
    async fn test_copy_vcs_honours_gitignore() {
        let source = TempDir::new().expect("source");
        fs::write(source.path().join(".gitignore"), "dist/\n*.log\n").expect("write");
        fs::write(source.path().join(".env.example"), "KEY=\n").expect("write");
        fs::create_dir_all(source.path().join("dist")).expect("mkdir");
        fs::write(source.path().join("dist/bundle.js"), "built").expect("write");
        fs::write(source.path().join("build.log"), "noise").expect("write");
        fs::create_dir_all(source.path().join("src")).expect("mkdir");
        fs::write(source.path().join("src/main.rs"), "fn main() {}").expect("write");

        let root = TempDir::new().expect("root");
        let vcs = CopyVcs::new(source.path(), root.path());
        let workspace = vcs.isolate_workspace("HEAD", "worker-1").await.expect("isolate");

        assert!(workspace.join("src/main.rs").exists());
        assert!(workspace.join(".gitignore").exists());
        assert!(workspace.join(".env.example").exists());
        assert!(!workspace.join("dist").exists());
        assert!(!workspace.join("build.log").exists());

        // Build output inside the workspace is not a change
        fs::create_dir_all(workspace.join("dist")).expect("mkdir");
        fs::write(workspace.join("dist/bundle.js"), "rebuilt").expect("write");
        fs::write(workspace.join("test.log"), "noise").expect("write");
        assert!(vcs.modified_files(&workspace).await.expect("diff").is_empty());

        fs::write(workspace.join("src/main.rs"), "fn main() { run() }").expect("edit");
        assert_eq!(
            vcs.modified_files(&workspace).await.expect("diff"),
            vec!["src/main.rs"]
        );
    }

    fn git_available() -> bool {
        std::process::Command::new("git")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn git(dir: &Path, args: &[&str]) {
        let status = std::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .status()
            .expect("git");
        assert!(status.success(), "git {:?} failed", args);
    }

    #[tokio::test]
    async fn test_git_worktree_round_trip() {
        if !git_available() {
            return;
        }
        let repo = TempDir::new().expect("repo");
        git(repo.path(), &["init", "-q"]);
        git(repo.path(), &["config", "user.email", "dev@example.com"]);
        git(repo.path(), &["config", "user.name", "Dev"]);
        fs::write(repo.path().join("README.md"), "hello\n").expect("write");
        git(repo.path(), &["add", "-A"]);
        git(repo.path(), &["commit", "-q", "-m", "init"]);

        let vcs = GitVcs::new(
            repo.path(),
            repo.path().join(".ralph/workspaces"),
            Duration::from_secs(30),
        );
        let workspace = vcs.isolate_workspace("HEAD", "w1").await.expect("isolate");
        assert!(workspace.join("README.md").exists());

        fs::write(workspace.join("feature.rs"), "// new\n").expect("write");
        let changed = vcs.modified_files(&workspace).await.expect("status");
        assert_eq!(changed, vec!["feature.rs"]);

        let commit = vcs.snapshot(&workspace, "feat: US-001 - Feature").await.expect("commit");
        assert_eq!(commit.len(), 40);
        assert!(vcs.modified_files(&workspace).await.expect("status").is_empty());

        vcs.remove_workspace(&workspace).await.expect("remove");
        assert!(!workspace.exists());
    }
}
