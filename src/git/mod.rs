//! Ephemeral git checkouts driven through the git CLI.

mod command;
mod context;
#[cfg(test)]
mod fixture;
mod repository;

pub use command::{AUTH_HEADER_ENV, Credentials, GitCli, GitError, Scope};
pub use context::{Context, Interrupt};
pub use repository::{
    CloneOptions, Release, ReleaseGuard, RepoError, Repository, clone, clone_with,
};
