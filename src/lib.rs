//! Read single files from a remote git repository at any revision without
//! keeping a persistent clone around.
//!
//! ```no_run
//! use revfetch::git::{self, Context};
//!
//! let ctx = Context::background();
//! let (release, result) = git::clone(&ctx, "https://github.com/tektoncd/pipeline", None);
//! let _guard = release.guard();
//! let mut repo = result?;
//! repo.checkout(&ctx, "main")?;
//! let readme = repo.file_content("README.md")?;
//! # Ok::<(), revfetch::git::RepoError>(())
//! ```

pub mod git;
