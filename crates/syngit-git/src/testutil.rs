//! Helpers for tests against local bare repositories

use std::path::Path;

use git2::{Oid, Repository, Signature};

use crate::tree::{read_path, write_path};

/// Create a commit adding `path` on top of `parent` without touching any reference
pub(crate) fn commit_file(
    repo: &Repository,
    parent: Option<Oid>,
    path: &str,
    content: &str,
    message: &str,
) -> Oid {
    let parent = parent.map(|oid| repo.find_commit(oid).unwrap());
    let base = parent.as_ref().map(|c| c.tree().unwrap());
    let blob = repo.blob(content.as_bytes()).unwrap();
    let tree_oid = write_path(repo, base.as_ref(), path, Some(blob)).unwrap();
    let tree = repo.find_tree(tree_oid).unwrap();
    let sig = Signature::now("tester", "tester@example.com").unwrap();
    let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
    repo.commit(None, &sig, &sig, message, &tree, &parents).unwrap()
}

/// Point `refs/heads/<branch>` at `oid`
pub(crate) fn set_branch(repo: &Repository, branch: &str, oid: Oid) {
    repo.reference(&format!("refs/heads/{}", branch), oid, true, "test")
        .unwrap();
}

/// Head of `branch`, if it exists
pub(crate) fn branch_head(repo: &Repository, branch: &str) -> Option<Oid> {
    repo.refname_to_id(&format!("refs/heads/{}", branch)).ok()
}

/// Content of `path` at the head of `branch`
pub(crate) fn read_file(repo: &Repository, branch: &str, path: &str) -> Option<String> {
    let head = branch_head(repo, branch)?;
    let tree = repo.find_commit(head).unwrap().tree().unwrap();
    read_path(repo, &tree, path)
        .unwrap()
        .map(|bytes| String::from_utf8(bytes).unwrap())
}

/// `file://localhost/...` URL of a local repository
pub(crate) fn file_url(path: &Path) -> String {
    format!("file://localhost{}", path.display())
}

/// A bare repository in a temporary directory
pub(crate) struct BareRemote {
    pub(crate) _dir: tempfile::TempDir,
    pub(crate) repo: Repository,
    pub(crate) url: String,
}

impl BareRemote {
    pub(crate) fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::init_bare(dir.path()).unwrap();
        let url = file_url(dir.path());
        Self {
            _dir: dir,
            repo,
            url,
        }
    }

    /// Commit `path` on `branch`, creating the branch if needed
    pub(crate) fn seed(&self, branch: &str, path: &str, content: &str) -> Oid {
        let parent = branch_head(&self.repo, branch);
        let oid = commit_file(&self.repo, parent, path, content, "seed");
        set_branch(&self.repo, branch, oid);
        oid
    }
}
