//! Fetch, align, write, commit and push

use std::cell::{Cell, RefCell};

use git2::{
    CertificateCheckStatus, Cred, FetchOptions, Oid, PushOptions, RemoteCallbacks, Repository,
    Signature,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::error::{GitError, GitErrorKind};
use crate::finder::find_document;
use crate::path::{resource_path, validate_path};
use crate::tls::CaBundle;
use crate::tree::write_path;
use crate::worktree::select_base;
use crate::{PushOutcome, PushRequest, ORIGIN, UPSTREAM};

/// Materialize `request` on its target and push it
///
/// Blocking: run it on a blocking thread. `cancel` aborts transfers in
/// flight; a cancelled push reports [`GitErrorKind::Cancelled`].
#[instrument(
    skip_all,
    fields(
        target = %request.target_repository,
        branch = %request.target_branch,
        resource = %request.resource.resource,
        name = %request.resource.name
    )
)]
pub fn push(request: &PushRequest, cancel: &CancellationToken) -> Result<PushOutcome, GitError> {
    let session = Session::new(request, cancel)?;
    session.run()
}

struct Session<'a> {
    request: &'a PushRequest,
    cancel: &'a CancellationToken,
    ca_bundle: Option<CaBundle>,
    progress: RefCell<String>,
    rejection: RefCell<Option<String>>,
    auth_attempts: Cell<u32>,
}

/// File content to store and where
struct Placement {
    path: String,
    content: Option<String>,
}

impl<'a> Session<'a> {
    fn new(request: &'a PushRequest, cancel: &'a CancellationToken) -> Result<Self, GitError> {
        let mut session = Self {
            request,
            cancel,
            ca_bundle: None,
            progress: RefCell::new(String::new()),
            rejection: RefCell::new(None),
            auth_attempts: Cell::new(0),
        };
        if !request.tls.insecure_skip_verify {
            if let Some(pem) = &request.tls.ca_bundle {
                let bundle = CaBundle::from_pem(pem)
                    .map_err(|e| session.error(GitErrorKind::Setup, &request.target_repository, e))?;
                session.ca_bundle = Some(bundle);
            }
        }
        Ok(session)
    }

    fn target_ref(&self) -> String {
        format!("refs/heads/{}", self.request.target_branch)
    }

    fn error(&self, kind: GitErrorKind, url: &str, message: impl ToString) -> GitError {
        let kind = if self.cancel.is_cancelled() {
            GitErrorKind::Cancelled
        } else {
            kind
        };
        GitError {
            kind,
            url: url.to_string(),
            reference: self.target_ref(),
            user: self.request.author.username.clone(),
            message: message.to_string(),
            progress: self.progress.borrow().clone(),
        }
    }

    fn check_cancelled(&self, url: &str) -> Result<(), GitError> {
        if self.cancel.is_cancelled() {
            return Err(self.error(GitErrorKind::Cancelled, url, "request cancelled"));
        }
        Ok(())
    }

    fn run(&self) -> Result<PushOutcome, GitError> {
        let request = self.request;
        let target_url = request.target_repository.as_str();
        let setup_err = |e: &dyn std::fmt::Display| self.error(GitErrorKind::Setup, target_url, e);

        let workdir = tempfile::Builder::new()
            .prefix("syngit-")
            .tempdir()
            .map_err(|e| setup_err(&e))?;
        let repo = Repository::init_bare(workdir.path()).map_err(|e| setup_err(&e))?;

        self.fetch(&repo, ORIGIN, target_url)?;
        let target_head = remote_head(&repo, ORIGIN, &request.target_branch);
        let upstream_head = match request.merge_strategy {
            Some(_) => {
                self.fetch(&repo, UPSTREAM, &request.upstream_repository)?;
                remote_head(&repo, UPSTREAM, &request.upstream_branch)
            }
            None => None,
        };

        let base = select_base(&repo, request.merge_strategy, target_head, upstream_head)
            .map_err(|e| self.error(GitErrorKind::Merge, target_url, e))?;
        debug!(?target_head, ?upstream_head, ?base, "selected base commit");

        let commit_err = |e: &dyn std::fmt::Display| self.error(GitErrorKind::Commit, target_url, e);
        let base_commit = base
            .map(|oid| repo.find_commit(oid))
            .transpose()
            .map_err(|e| commit_err(&e))?;
        let base_tree = base_commit
            .as_ref()
            .map(|c| c.tree())
            .transpose()
            .map_err(|e| commit_err(&e))?;

        let placement = self.place(&repo, base_tree.as_ref())?;
        let blob = placement
            .content
            .as_ref()
            .map(|c| repo.blob(c.as_bytes()))
            .transpose()
            .map_err(|e| commit_err(&e))?;
        let new_tree = write_path(&repo, base_tree.as_ref(), &placement.path, blob)
            .map_err(|e| commit_err(&e))?;

        let unchanged = match &base_tree {
            Some(tree) => tree.id() == new_tree,
            None => placement.content.is_none(),
        };

        let (head, committed) = if unchanged {
            match base {
                Some(oid) => (oid, false),
                None => {
                    info!(path = %placement.path, "nothing to delete on an unborn branch");
                    return Ok(self.outcome(placement.path, String::new(), false));
                }
            }
        } else {
            let tree = repo.find_tree(new_tree).map_err(|e| commit_err(&e))?;
            let author = &request.author;
            let signature =
                Signature::now(&author.username, &author.email).map_err(|e| commit_err(&e))?;
            let parents: Vec<&git2::Commit<'_>> = base_commit.iter().collect();
            let oid = repo
                .commit(
                    None,
                    &signature,
                    &signature,
                    &request.commit_message(),
                    &tree,
                    &parents,
                )
                .map_err(|e| commit_err(&e))?;
            (oid, true)
        };

        if Some(head) == target_head {
            info!(commit = %head, "target already up to date");
            return Ok(self.outcome(placement.path, head.to_string(), false));
        }

        repo.reference(&self.target_ref(), head, true, "syngit")
            .map_err(|e| commit_err(&e))?;
        self.push_head(&repo)?;

        info!(commit = %head, path = %placement.path, committed, "pushed");
        Ok(self.outcome(placement.path, head.to_string(), committed))
    }

    fn outcome(&self, path: String, commit_hash: String, committed: bool) -> PushOutcome {
        PushOutcome {
            repository: self.request.target_repository.clone(),
            branch: self.request.target_branch.clone(),
            path,
            commit_hash,
            committed,
        }
    }

    /// Decide where the manifest goes and what the file will contain
    fn place(&self, repo: &Repository, base: Option<&git2::Tree<'_>>) -> Result<Placement, GitError> {
        let request = self.request;
        let url = request.target_repository.as_str();
        let yaml = (!request.is_deletion()).then(|| request.yaml.clone());

        if request.resource_finder {
            if let Some(tree) = base {
                let found = find_document(repo, tree, &request.resource)
                    .map_err(|e| self.error(GitErrorKind::Path, url, e))?;
                if let Some(found) = found {
                    let path = validate_path(&found.path)
                        .map_err(|e| self.error(GitErrorKind::Path, url, e))?;
                    debug!(path = %path, "resource finder located the manifest");
                    return Ok(Placement {
                        content: found.replace(yaml.as_deref().unwrap_or_default()),
                        path,
                    });
                }
            }
        }

        let path = resource_path(request.root_path.as_deref(), &request.resource)
            .map_err(|e| self.error(GitErrorKind::Path, url, e))?;
        Ok(Placement { path, content: yaml })
    }

    fn callbacks(&self) -> RemoteCallbacks<'_> {
        let mut callbacks = RemoteCallbacks::new();

        callbacks.credentials(move |_url, username_from_url, allowed| {
            if self.cancel.is_cancelled() {
                return Err(git2::Error::from_str("request cancelled"));
            }
            let attempt = self.auth_attempts.get() + 1;
            self.auth_attempts.set(attempt);
            if attempt > 3 {
                return Err(git2::Error::from_str(
                    "authentication failed: the remote rejected the credentials",
                ));
            }
            let author = &self.request.author;
            if allowed.is_user_pass_plaintext() {
                let user = if author.username.is_empty() {
                    username_from_url.unwrap_or("git")
                } else {
                    author.username.as_str()
                };
                return Cred::userpass_plaintext(user, &author.token);
            }
            Cred::default()
        });

        callbacks.certificate_check(move |cert, host| {
            if self.request.tls.insecure_skip_verify {
                return Ok(CertificateCheckStatus::CertificateOk);
            }
            let Some(bundle) = &self.ca_bundle else {
                return Ok(CertificateCheckStatus::CertificatePassthrough);
            };
            let Some(x509) = cert.as_x509() else {
                return Ok(CertificateCheckStatus::CertificatePassthrough);
            };
            match bundle.verify(x509.data()) {
                Ok(()) => Ok(CertificateCheckStatus::CertificateOk),
                Err(reason) => Err(git2::Error::from_str(&format!(
                    "certificate of {} rejected: {}",
                    host, reason
                ))),
            }
        });

        callbacks.sideband_progress(move |data| {
            self.progress
                .borrow_mut()
                .push_str(&String::from_utf8_lossy(data));
            !self.cancel.is_cancelled()
        });

        callbacks.transfer_progress(move |_| !self.cancel.is_cancelled());

        callbacks.push_update_reference(move |refname, status| {
            if let Some(message) = status {
                *self.rejection.borrow_mut() = Some(format!("{} rejected: {}", refname, message));
            }
            Ok(())
        });

        callbacks
    }

    fn fetch(&self, repo: &Repository, name: &str, url: &str) -> Result<(), GitError> {
        self.check_cancelled(url)?;
        let fetch_err = |e: git2::Error| self.error(GitErrorKind::Fetch, url, e.message());

        let mut remote = repo.remote(name, url).map_err(fetch_err)?;
        let mut options = FetchOptions::new();
        options.remote_callbacks(self.callbacks());
        let refspec = format!("+refs/heads/*:refs/remotes/{}/*", name);
        remote
            .fetch(&[refspec.as_str()], Some(&mut options), None)
            .map_err(fetch_err)?;
        debug!(remote = name, url, "fetched");
        Ok(())
    }

    fn push_head(&self, repo: &Repository) -> Result<(), GitError> {
        let url = self.request.target_repository.as_str();
        self.check_cancelled(url)?;
        let push_err = |e: git2::Error| self.error(GitErrorKind::Push, url, e.message());

        let target_ref = self.target_ref();
        let refspec = if self.request.force_push() {
            format!("+{}:{}", target_ref, target_ref)
        } else {
            format!("{}:{}", target_ref, target_ref)
        };

        let mut remote = repo.find_remote(ORIGIN).map_err(push_err)?;
        let mut options = PushOptions::new();
        options.remote_callbacks(self.callbacks());
        remote
            .push(&[refspec.as_str()], Some(&mut options))
            .map_err(push_err)?;

        if let Some(rejection) = self.rejection.borrow_mut().take() {
            return Err(self.error(GitErrorKind::Push, url, rejection));
        }
        Ok(())
    }
}

fn remote_head(repo: &Repository, remote: &str, branch: &str) -> Option<Oid> {
    repo.refname_to_id(&format!("refs/remotes/{}/{}", remote, branch))
        .ok()
}
