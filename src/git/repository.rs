//! Ephemeral shallow checkouts.
//!
//! A [`Repository`] owns one temporary directory holding a depth-1 clone made
//! with `--no-checkout`. Files are only materialized once [`Repository::checkout`]
//! fetches a specific revision, which keeps clones cheap no matter how large
//! the remote history is.
//!
//! Cleanup is explicit: [`clone`] always hands back a [`Release`], even when
//! the clone itself failed, and [`Release::guard`] ties it to a scope.

use std::ffi::OsStr;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use super::command::{Credentials, GitCli, GitError, Scope};
use super::context::Context;

/// git output fragments that mean the server wanted credentials we could not
/// supply. Older gits report the disabled terminal prompt, newer ones honour
/// `credential.interactive=false`.
const AUTH_FAILURE_SIGNATURES: &[&str] = &[
    "unable to get password from user",
    "terminal prompts disabled",
    "could not read Username",
    "Authentication failed",
];

/// Errors returned by repository operations.
#[derive(Error, Debug)]
pub enum RepoError {
    /// The server asked for credentials that were missing or rejected.
    #[error("clone error: authentication required")]
    AuthenticationRequired,
    /// A git invocation failed.
    #[error(transparent)]
    Git(#[from] GitError),
    /// The backing directory is gone, most likely released already.
    #[error("repository clone no longer exists at {}, used after release?", .path.display())]
    CloneGone {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// The requested file is not in the checked-out tree.
    #[error("file does not exist: {}", .path.display())]
    FileNotFound { path: PathBuf },
    /// The requested path would resolve outside the checkout.
    #[error("path escapes the repository root: {}", .path.display())]
    PathOutsideRepository { path: PathBuf },
    /// Invalid inputs were provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// Underlying IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl RepoError {
    /// True when the operation stopped because its context was cancelled or expired.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RepoError::Git(e) if e.is_interrupted())
    }

    /// True when git ran and exited non-zero.
    pub fn is_command_failed(&self) -> bool {
        matches!(self, RepoError::Git(GitError::CommandFailed { .. }))
    }
}

/// Validate that a revision does not contain dangerous patterns.
///
/// Rejects:
/// - Empty strings
/// - Strings starting with `-` (could be interpreted as flags)
/// - Strings containing null bytes or control characters
fn validate_revision(value: &str) -> Result<(), RepoError> {
    if value.is_empty() {
        return Err(RepoError::InvalidInput("revision cannot be empty".into()));
    }
    if value.starts_with('-') {
        return Err(RepoError::InvalidInput(
            "revision cannot start with '-'".into(),
        ));
    }
    if value.bytes().any(|b| b < 0x20 || b == 0x7f) {
        return Err(RepoError::InvalidInput(
            "revision cannot contain null or control characters".into(),
        ));
    }
    Ok(())
}

fn validate_url(url: &str) -> Result<(), RepoError> {
    if url.is_empty() {
        return Err(RepoError::InvalidInput("url cannot be empty".into()));
    }
    if url.starts_with('-') {
        return Err(RepoError::InvalidInput("url cannot start with '-'".into()));
    }
    Ok(())
}

/// Temp directory prefix taken from the last `/` segment of the URL.
fn dir_prefix(url: &str) -> String {
    let name = url.rsplit('/').next().unwrap_or_default();
    let name: String = name
        .chars()
        .map(|c| if std::path::is_separator(c) { '_' } else { c })
        .collect();
    if name.is_empty() || name == "." || name == ".." {
        "repo-".to_string()
    } else {
        format!("{name}-")
    }
}

fn is_auth_failure(err: &GitError) -> bool {
    err.message()
        .is_some_and(|msg| AUTH_FAILURE_SIGNATURES.iter().any(|sig| msg.contains(sig)))
}

/// Where and how clones are made.
#[derive(Debug, Clone, Default)]
pub struct CloneOptions {
    /// Parent directory for clones; the system temp dir when unset.
    pub temp_root: Option<PathBuf>,
    /// git executor used for every command on the resulting handle.
    pub git: GitCli,
}

/// Capability to delete a clone's directory.
///
/// Cheap to clone and safe to call from any thread, any number of times,
/// including while another operation on the same checkout is still running.
#[derive(Debug, Clone)]
pub struct Release {
    dir: Option<Arc<Path>>,
}

impl Release {
    fn noop() -> Self {
        Self { dir: None }
    }

    fn for_dir(dir: &Path) -> Self {
        Self {
            dir: Some(Arc::from(dir)),
        }
    }

    /// Directory this capability removes, if one was ever allocated.
    pub fn path(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Recursively remove the directory. Never fails; missing is fine.
    pub fn release(&self) {
        let Some(dir) = self.dir.as_deref() else {
            return;
        };
        match std::fs::remove_dir_all(dir) {
            Ok(()) => log::debug!("released {}", dir.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("failed to release {}: {}", dir.display(), e),
        }
    }

    /// Release when the returned guard goes out of scope.
    pub fn guard(&self) -> ReleaseGuard {
        ReleaseGuard(self.clone())
    }
}

/// Calls [`Release::release`] on drop.
#[derive(Debug)]
#[must_use = "the directory is released as soon as the guard is dropped"]
pub struct ReleaseGuard(Release);

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.0.release();
    }
}

/// One shallow clone of a remote repository in its own temporary directory.
#[derive(Debug)]
pub struct Repository {
    url: String,
    credentials: Option<Credentials>,
    directory: PathBuf,
    git: GitCli,
    release: Release,
}

/// Clone `url` with default options.
///
/// See [`clone_with`].
pub fn clone(
    ctx: &Context,
    url: &str,
    credentials: Option<Credentials>,
) -> (Release, Result<Repository, RepoError>) {
    clone_with(ctx, url, credentials, &CloneOptions::default())
}

/// Shallow-clone `url` into a fresh temporary directory without checking out
/// any files.
///
/// The [`Release`] is returned even on failure so whatever was allocated can
/// be removed by the caller.
pub fn clone_with(
    ctx: &Context,
    url: &str,
    credentials: Option<Credentials>,
    options: &CloneOptions,
) -> (Release, Result<Repository, RepoError>) {
    if let Err(e) = validate_url(url) {
        return (Release::noop(), Err(e));
    }

    let prefix = dir_prefix(url);
    let mut builder = tempfile::Builder::new();
    builder.prefix(&prefix);
    let allocated = match &options.temp_root {
        Some(root) => builder.tempdir_in(root),
        None => builder.tempdir(),
    };
    let directory = match allocated {
        Ok(dir) => dir.keep(),
        Err(e) => return (Release::noop(), Err(RepoError::Io(e))),
    };
    let release = Release::for_dir(&directory);

    let repo = Repository {
        url: url.to_string(),
        credentials,
        directory,
        git: options.git.clone(),
        release: release.clone(),
    };

    let args = [
        OsStr::new(&repo.url),
        repo.directory.as_os_str(),
        OsStr::new("--depth=1"),
        OsStr::new("--no-checkout"),
    ];
    let result = repo.git.run(
        ctx,
        Scope::Clone {
            credentials: repo.credentials.as_ref(),
        },
        "clone",
        args,
    );

    match result {
        Ok(_) => {
            log::info!("cloned {} into {}", repo.url, repo.directory.display());
            (release, Ok(repo))
        }
        Err(e) if is_auth_failure(&e) => {
            log::debug!("clone of {} needs authentication: {}", repo.url, e);
            (release, Err(RepoError::AuthenticationRequired))
        }
        Err(e) => (release, Err(RepoError::Git(e))),
    }
}

impl Repository {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// The release capability for this checkout.
    pub fn release_handle(&self) -> Release {
        self.release.clone()
    }

    /// Remove the checkout. Later operations fail with [`RepoError::CloneGone`].
    pub fn release(&self) {
        self.release.release();
    }

    fn ensure_exists(&self) -> Result<(), RepoError> {
        match std::fs::metadata(&self.directory) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(RepoError::CloneGone {
                path: self.directory.clone(),
                source: e,
            }),
            Err(e) => Err(RepoError::Io(e)),
        }
    }

    fn run_git<I, S>(&self, ctx: &Context, subcommand: &str, args: I) -> Result<Vec<u8>, RepoError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.ensure_exists()?;
        Ok(self
            .git
            .run(ctx, Scope::Checkout(&self.directory), subcommand, args)?)
    }

    /// Point the working tree at `revision`.
    ///
    /// Works for branches, tags, full commit ids and commits no ref points
    /// at, since the object is fetched by name rather than found through
    /// advertised refs. Nothing is checked out when the fetch fails.
    pub fn checkout(&mut self, ctx: &Context, revision: &str) -> Result<(), RepoError> {
        validate_revision(revision)?;
        self.run_git(ctx, "fetch", ["origin", revision, "--depth=1"])?;
        self.run_git(ctx, "checkout", ["FETCH_HEAD"])?;
        log::info!("checked out {} of {}", revision, self.url);
        Ok(())
    }

    /// Commit id of `HEAD`, trimmed. Fails when `HEAD` names no commit yet.
    pub fn current_revision(&self, ctx: &Context) -> Result<String, RepoError> {
        let out = self.run_git(ctx, "rev-list", ["-n1", "HEAD"])?;
        Ok(String::from_utf8_lossy(&out).trim().to_string())
    }

    /// Raw bytes of `path`, relative to the repository root.
    pub fn file_content(&self, path: impl AsRef<Path>) -> Result<Vec<u8>, RepoError> {
        let path = path.as_ref();
        self.ensure_exists()?;

        let escapes = path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(RepoError::PathOutsideRepository {
                path: path.to_path_buf(),
            });
        }

        match std::fs::read(self.directory.join(path)) {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(RepoError::FileNotFound {
                path: path.to_path_buf(),
            }),
            Err(e) => Err(RepoError::Io(e)),
        }
    }
}
