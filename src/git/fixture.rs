//! Local repositories for tests, built with libgit2.

use git2::{BranchType, Commit, Oid, Repository, RepositoryInitOptions, Signature};
use std::path::PathBuf;
use tempfile::{TempDir, tempdir};

/// Whether the `git` binary can be run; prints a skip notice when it can't.
pub(crate) fn git_available() -> bool {
    let ok = std::process::Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false);
    if !ok {
        eprintln!("skipping test: git binary not found");
    }
    ok
}

pub(crate) fn network_tests_enabled() -> bool {
    match std::env::var("REVFETCH_RUN_NETWORK_TESTS") {
        Ok(value) => {
            let value = value.to_ascii_lowercase();
            value == "1" || value == "true" || value == "yes"
        }
        Err(_) => false,
    }
}

pub(crate) fn require_network() -> bool {
    if network_tests_enabled() && git_available() {
        true
    } else {
        eprintln!("skipping network test (set REVFETCH_RUN_NETWORK_TESTS=1)");
        false
    }
}

/// A commit to add on top of `main`.
pub(crate) struct CommitSpec<'a> {
    pub filename: &'a str,
    pub content: &'a str,
    pub branch: &'a str,
    pub tag: Option<&'a str>,
}

/// A throwaway origin repository.
pub(crate) struct TestRepo {
    _dir: TempDir,
    path: PathBuf,
    /// Commit ids for each [`CommitSpec`], in order.
    pub revisions: Vec<String>,
}

impl TestRepo {
    pub fn url(&self) -> String {
        self.path.display().to_string()
    }

    /// Delete a branch, leaving its commit unreachable from any ref.
    pub fn delete_branch(&self, name: &str) {
        let repo = Repository::open(&self.path).expect("Failed to open test repo");
        repo.find_branch(name, BranchType::Local)
            .expect("Branch should exist")
            .delete()
            .expect("Failed to delete branch");
    }
}

/// Create a repository with an initial commit on `main`, then one commit per
/// spec, each branched from `main` and optionally tagged.
pub(crate) fn create_test_repo(commits: &[CommitSpec<'_>]) -> TestRepo {
    let dir = tempdir().expect("Failed to create temp directory");
    let path = dir.path().join("origin");

    let mut opts = RepositoryInitOptions::new();
    opts.initial_head("main");
    let repo = Repository::init_opts(&path, &opts).expect("Failed to init test repo");
    let sig = Signature::now("revfetch", "revfetch@example.com").expect("Failed to build signature");

    let initial = commit_file(&repo, &sig, None, "initial.txt", "initial", Some("HEAD"));
    let main = repo.find_commit(initial).expect("Initial commit should exist");

    let mut revisions = Vec::with_capacity(commits.len());
    for spec in commits {
        let oid = commit_file(&repo, &sig, Some(&main), spec.filename, spec.content, None);
        let commit = repo.find_commit(oid).expect("Commit should exist");
        repo.branch(spec.branch, &commit, false)
            .expect("Failed to create branch");
        if let Some(tag) = spec.tag {
            repo.tag_lightweight(tag, commit.as_object(), false)
                .expect("Failed to create tag");
        }
        revisions.push(oid.to_string());
    }

    TestRepo {
        _dir: dir,
        path,
        revisions,
    }
}

/// A repository with no commits at all.
pub(crate) fn create_empty_repo() -> TestRepo {
    let dir = tempdir().expect("Failed to create temp directory");
    let path = dir.path().join("empty");
    Repository::init(&path).expect("Failed to init empty repo");
    TestRepo {
        _dir: dir,
        path,
        revisions: Vec::new(),
    }
}

fn commit_file(
    repo: &Repository,
    sig: &Signature<'_>,
    parent: Option<&Commit<'_>>,
    filename: &str,
    content: &str,
    update_ref: Option<&str>,
) -> Oid {
    let blob = repo.blob(content.as_bytes()).expect("Failed to write blob");
    let base = parent.map(|p| p.tree().expect("Parent tree should exist"));
    let mut builder = repo
        .treebuilder(base.as_ref())
        .expect("Failed to create tree builder");
    builder
        .insert(filename, blob, 0o100644)
        .expect("Failed to insert blob");
    let tree_id = builder.write().expect("Failed to write tree");
    let tree = repo.find_tree(tree_id).expect("Tree should exist");
    let parents: Vec<&Commit<'_>> = parent.into_iter().collect();
    repo.commit(
        update_ref,
        sig,
        sig,
        &format!("add {filename}"),
        &tree,
        &parents,
    )
    .expect("Failed to commit")
}
