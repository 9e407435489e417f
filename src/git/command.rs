//! Hardened wrapper around the `git` binary.
//!
//! Every invocation is scoped explicitly: clones pass their destination as a
//! positional argument, everything else is pinned to the checkout with `-C`.
//! The process working directory is never changed, so any number of
//! checkouts can be driven from different threads at once.
//!
//! Credentials are handed to git through an environment variable that is set
//! only on the child process and referenced with `--config-env`, so the
//! encoded secret never shows up in the argument list.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use std::ffi::OsStr;
use std::fmt;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use thiserror::Error;

use super::context::{Context, Interrupt};

/// Environment variable carrying the `Authorization` header for a clone.
pub const AUTH_HEADER_ENV: &str = "REVFETCH_GIT_AUTH_HEADER";

/// How often a running child is checked for exit or cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Errors returned by a single git invocation.
#[derive(Error, Debug)]
pub enum GitError {
    /// git ran and exited non-zero.
    #[error("git {subcommand} error: {message}: {status}")]
    CommandFailed {
        subcommand: String,
        message: String,
        status: ExitStatus,
    },
    /// git could not be started or waited on.
    #[error("git {subcommand} error: {source}")]
    Spawn {
        subcommand: String,
        #[source]
        source: io::Error,
    },
    /// The context was cancelled before git finished.
    #[error("git {subcommand} error: context canceled")]
    Cancelled { subcommand: String },
    /// The context deadline passed before git finished.
    #[error("git {subcommand} error: context deadline exceeded")]
    DeadlineExceeded { subcommand: String },
}

impl GitError {
    fn interrupted(subcommand: &str, interrupt: Interrupt) -> Self {
        let subcommand = subcommand.to_string();
        match interrupt {
            Interrupt::Cancelled => GitError::Cancelled { subcommand },
            Interrupt::DeadlineExceeded => GitError::DeadlineExceeded { subcommand },
        }
    }

    /// The git subcommand this error came from.
    pub fn subcommand(&self) -> &str {
        match self {
            GitError::CommandFailed { subcommand, .. }
            | GitError::Spawn { subcommand, .. }
            | GitError::Cancelled { subcommand }
            | GitError::DeadlineExceeded { subcommand } => subcommand,
        }
    }

    /// Diagnostic text git printed, if it ran to completion.
    pub fn message(&self) -> Option<&str> {
        match self {
            GitError::CommandFailed { message, .. } => Some(message),
            _ => None,
        }
    }

    /// True for cancellation and deadline errors.
    pub fn is_interrupted(&self) -> bool {
        matches!(
            self,
            GitError::Cancelled { .. } | GitError::DeadlineExceeded { .. }
        )
    }
}

/// HTTP basic-auth credentials used while cloning.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    username: String,
    password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// Credentials are only applied when both halves are present.
    pub fn is_usable(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }

    /// Header value for `http.extraHeader`.
    fn basic_auth_header(&self) -> String {
        let token = STANDARD.encode(format!("{}:{}", self.username, self.password));
        format!("Authorization: Basic {token}")
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Where a git invocation runs.
#[derive(Debug, Clone, Copy)]
pub enum Scope<'a> {
    /// Initial clone; the destination is a positional argument.
    Clone {
        credentials: Option<&'a Credentials>,
    },
    /// Any later command, pinned to an existing checkout with `-C`.
    Checkout(&'a Path),
}

/// Git CLI wrapper with security hardening.
#[derive(Debug, Clone)]
pub struct GitCli {
    git_path: PathBuf,
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new()
    }
}

impl GitCli {
    /// Create a new GitCli instance using the system git.
    pub fn new() -> Self {
        Self {
            git_path: "git".into(),
        }
    }

    /// Use a specific git binary instead of the one on `PATH`.
    pub fn with_git_path(git_path: impl Into<PathBuf>) -> Self {
        Self {
            git_path: git_path.into(),
        }
    }

    pub fn git_path(&self) -> &Path {
        &self.git_path
    }

    /// Create a hardened Command with security settings.
    ///
    /// Applies:
    /// - `GIT_LFS_SKIP_SMUDGE=1` - skip LFS file downloads
    /// - `GIT_TERMINAL_PROMPT=0` - disable interactive prompts
    /// - `core.hooksPath=` - disable hooks execution
    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.git_path);
        cmd.env("GIT_LFS_SKIP_SMUDGE", "1");
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        cmd.args(["-c", "core.hooksPath="]);
        cmd.stdin(Stdio::null());
        cmd
    }

    /// Build the full command for `subcommand` without running it.
    pub(crate) fn build<I, S>(&self, scope: Scope<'_>, subcommand: &str, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = self.command();
        match scope {
            Scope::Clone { credentials } => {
                cmd.args(["-c", "credential.interactive=false"]);
                // Basic auth only means something for http(s) remotes; other
                // transports simply ignore the header.
                if let Some(credentials) = credentials.filter(|c| c.is_usable()) {
                    cmd.env(AUTH_HEADER_ENV, credentials.basic_auth_header());
                    cmd.arg("--config-env")
                        .arg(format!("http.extraHeader={AUTH_HEADER_ENV}"));
                }
            }
            Scope::Checkout(dir) => {
                cmd.arg("-C").arg(dir);
            }
        }
        cmd.arg(subcommand).args(args);
        cmd
    }

    /// Run `git <subcommand> <args>` and return its stdout.
    ///
    /// The child is killed as soon as `ctx` is cancelled or expires.
    pub fn run<I, S>(
        &self,
        ctx: &Context,
        scope: Scope<'_>,
        subcommand: &str,
        args: I,
    ) -> Result<Vec<u8>, GitError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        if let Some(interrupt) = ctx.interrupted() {
            return Err(GitError::interrupted(subcommand, interrupt));
        }

        let mut cmd = self.build(scope, subcommand, args);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        match scope {
            Scope::Clone { .. } => log::debug!("running git {}", subcommand),
            Scope::Checkout(dir) => {
                log::debug!("running git {} in {}", subcommand, dir.display())
            }
        }

        let mut child = cmd.spawn().map_err(|source| GitError::Spawn {
            subcommand: subcommand.to_string(),
            source,
        })?;
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = loop {
            if let Some(interrupt) = ctx.interrupted() {
                let _ = child.kill();
                let _ = child.wait();
                // Readers are left to finish on their own: a helper such as
                // git-remote-https may still hold the pipes open.
                log::debug!("git {} interrupted: {:?}", subcommand, interrupt);
                return Err(GitError::interrupted(subcommand, interrupt));
            }
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(source) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(GitError::Spawn {
                        subcommand: subcommand.to_string(),
                        source,
                    });
                }
            }
        };

        let stdout = collect(stdout);
        let stderr = collect(stderr);

        if !status.success() {
            return Err(GitError::CommandFailed {
                subcommand: subcommand.to_string(),
                message: failure_message(&stderr, &stdout),
                status,
            });
        }

        Ok(stdout)
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    let mut pipe = pipe?;
    Some(thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    }))
}

fn collect(reader: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

/// Trimmed stderr, or trimmed stdout when git wrote nothing to stderr.
fn failure_message(stderr: &[u8], stdout: &[u8]) -> String {
    let stderr = String::from_utf8_lossy(stderr);
    let stderr = stderr.trim();
    if !stderr.is_empty() {
        return stderr.to_string();
    }
    String::from_utf8_lossy(stdout).trim().to_string()
}
