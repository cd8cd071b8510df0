//! libgit2-backed transports: shallow upstream snapshots and a
//! history-free distribution branch.

use crate::digest::TreeDigest;
use crate::transport::{
    Abandon, DistributionRepo, DistributionState, PublishRequest, RetryPolicy, SourceRepo,
    SourceSnapshot, with_retry, with_timeout,
};
use carve_core::config::SyncConfig;
use carve_core::{CarveError, Result};
use git2::{
    Cred, CredentialType, ErrorClass, ErrorCode, FetchOptions, IndexAddOption, PushOptions,
    RemoteCallbacks, Repository, Signature,
};
use std::cell::{Cell, RefCell};
use std::path::{Path, PathBuf};

pub const DIGEST_TRAILER: &str = "Carve-Tree-Digest";
pub const SOURCE_TRAILER: &str = "Carve-Source-Revision";

/// Default shallow depth for network fetches.
const SHALLOW_DEPTH: i32 = 1;
/// libgit2 keeps asking for credentials after a rejection; stop after this many.
const MAX_CREDENTIAL_ATTEMPTS: usize = 3;

/// Map a libgit2 failure onto the transport error kinds.
pub fn transport_error(operation: &str, e: &git2::Error) -> CarveError {
    let message = e.message().to_string();
    let auth = matches!(e.code(), ErrorCode::Auth | ErrorCode::Certificate)
        || (e.class() == ErrorClass::Http && (message.contains("401") || message.contains("403")));
    if auth {
        CarveError::TransportAuthFailure {
            operation: operation.to_string(),
            reason: message,
        }
    } else {
        CarveError::Transport {
            operation: operation.to_string(),
            reason: message,
        }
    }
}

fn abandoned() -> git2::Error {
    git2::Error::new(ErrorCode::User, ErrorClass::Net, "abandoned after timeout")
}

/// Credentials: a token from `token_env` over HTTPS, else the SSH agent,
/// else libgit2's defaults. Every hook that can fail the transfer does so
/// once `abandon` is raised.
fn callbacks<'a>(token_env: &str, attempts: &'a Cell<usize>, abandon: &'a Abandon) -> RemoteCallbacks<'a> {
    let token = std::env::var(token_env).ok().filter(|t| !t.is_empty());
    let mut callbacks = RemoteCallbacks::new();
    callbacks.transfer_progress(move |_| !abandon.is_set());
    callbacks.sideband_progress(move |_| !abandon.is_set());
    callbacks.push_negotiation(move |_| {
        if abandon.is_set() {
            return Err(abandoned());
        }
        Ok(())
    });
    callbacks.credentials(move |_url, username, allowed| {
        if abandon.is_set() {
            return Err(abandoned());
        }
        attempts.set(attempts.get() + 1);
        if attempts.get() > MAX_CREDENTIAL_ATTEMPTS {
            return Err(git2::Error::new(
                ErrorCode::Auth,
                ErrorClass::Net,
                "credentials rejected",
            ));
        }
        if allowed.contains(CredentialType::USER_PASS_PLAINTEXT)
            && let Some(token) = &token
        {
            return Cred::userpass_plaintext("x-access-token", token);
        }
        if allowed.contains(CredentialType::SSH_KEY) {
            return Cred::ssh_key_from_agent(username.unwrap_or("git"));
        }
        Cred::default()
    });
    callbacks
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> CarveError + '_ {
    move |e| CarveError::io(path, e)
}

/// Clones the upstream branch and strips it down to a plain tree.
#[derive(Debug, Clone)]
pub struct GitSource {
    url: String,
    branch: String,
    token_env: String,
    depth: Option<i32>,
    policy: RetryPolicy,
}

impl GitSource {
    pub fn new(url: impl Into<String>, branch: impl Into<String>, config: &SyncConfig) -> Self {
        Self {
            url: url.into(),
            branch: branch.into(),
            token_env: config.token_env.clone(),
            depth: Some(SHALLOW_DEPTH),
            policy: RetryPolicy::from_config(config),
        }
    }

    /// Full-history fetches, for transports without shallow support.
    #[must_use]
    pub fn without_depth(mut self) -> Self {
        self.depth = None;
        self
    }

    fn clone_into(&self, scratch: tempfile::TempDir) -> Result<(String, PathBuf)> {
        let operation = "fetch upstream";
        let (url, branch, token_env, depth) = (
            self.url.clone(),
            self.branch.clone(),
            self.token_env.clone(),
            self.depth,
        );
        with_timeout(operation, self.policy.timeout, move |abandon| {
            let attempts = Cell::new(0);
            let mut fetch = FetchOptions::new();
            fetch.remote_callbacks(callbacks(&token_env, &attempts, abandon));
            if let Some(depth) = depth {
                fetch.depth(depth);
            }
            let repo = git2::build::RepoBuilder::new()
                .branch(&branch)
                .fetch_options(fetch)
                .clone(&url, scratch.path())
                .map_err(|e| transport_error(operation, &e))?;
            let revision = repo
                .head()
                .and_then(|h| h.peel_to_commit())
                .map_err(|e| transport_error(operation, &e))?
                .id()
                .to_string();
            drop(repo);

            let git_dir = scratch.path().join(".git");
            std::fs::remove_dir_all(&git_dir).map_err(io_error(&git_dir))?;
            Ok((revision, scratch.keep()))
        })
    }
}

impl SourceRepo for GitSource {
    fn fetch(&self, dest: &Path) -> Result<SourceSnapshot> {
        let parent = dest.parent().unwrap_or(Path::new("."));
        std::fs::create_dir_all(parent).map_err(io_error(parent))?;

        with_retry(&self.policy, "fetch upstream", || {
            // Each attempt clones into its own directory, so an abandoned
            // attempt never races the next one.
            let scratch = tempfile::Builder::new()
                .prefix(".carve-fetch-")
                .tempdir_in(parent)
                .map_err(io_error(parent))?;
            let (revision, tree) = self.clone_into(scratch)?;
            std::fs::rename(&tree, dest).map_err(io_error(dest))?;
            tracing::info!("fetched {}@{} ({revision})", self.url, self.branch);
            Ok(SourceSnapshot { revision })
        })
    }
}

/// Publishes to a branch that always holds exactly one, parentless commit.
#[derive(Debug, Clone)]
pub struct GitDistribution {
    url: String,
    branch: String,
    token_env: String,
    author_name: String,
    author_email: String,
    depth: Option<i32>,
    policy: RetryPolicy,
}

impl GitDistribution {
    pub fn new(url: impl Into<String>, branch: impl Into<String>, config: &SyncConfig) -> Self {
        Self {
            url: url.into(),
            branch: branch.into(),
            token_env: config.token_env.clone(),
            author_name: config.author_name.clone(),
            author_email: config.author_email.clone(),
            depth: Some(SHALLOW_DEPTH),
            policy: RetryPolicy::from_config(config),
        }
    }

    #[must_use]
    pub fn without_depth(mut self) -> Self {
        self.depth = None;
        self
    }

    fn read_state(&self) -> Result<Option<DistributionState>> {
        let operation = "read distribution";
        let scratch = tempfile::tempdir().map_err(io_error(Path::new(".")))?;
        let (url, branch, token_env, depth) = (
            self.url.clone(),
            self.branch.clone(),
            self.token_env.clone(),
            self.depth,
        );
        with_timeout(operation, self.policy.timeout, move |abandon| {
            let fail = |e: git2::Error| transport_error(operation, &e);
            let repo = Repository::init_bare(scratch.path()).map_err(fail)?;
            let mut remote = repo.remote_anonymous(&url).map_err(fail)?;

            let tracking = format!("refs/remotes/dist/{branch}");
            let refspec = format!("+refs/heads/{branch}:{tracking}");
            let attempts = Cell::new(0);
            let mut fetch = FetchOptions::new();
            fetch.remote_callbacks(callbacks(&token_env, &attempts, abandon));
            if let Some(depth) = depth {
                fetch.depth(depth);
            }
            match remote.fetch(&[refspec.as_str()], Some(&mut fetch), None) {
                Ok(()) => {}
                Err(e) if e.code() == ErrorCode::NotFound => return Ok(None),
                Err(e) => return Err(fail(e)),
            }

            let reference = match repo.find_reference(&tracking) {
                Ok(r) => r,
                Err(e) if e.code() == ErrorCode::NotFound => return Ok(None),
                Err(e) => return Err(fail(e)),
            };
            let commit = reference.peel_to_commit().map_err(fail)?;
            Ok(Some(DistributionState {
                commit: commit.id().to_string(),
                digest: commit.message().and_then(|m| trailer(m, DIGEST_TRAILER)).and_then(TreeDigest::parse),
            }))
        })
    }

    /// Build a single parentless commit of `tree` in `tree/.git`.
    fn commit(&self, tree: &Path, request: &PublishRequest) -> Result<(String, String)> {
        let operation = "commit distribution";
        let fail = |e: git2::Error| transport_error(operation, &e);

        let repo = Repository::init(tree).map_err(fail)?;
        let mut index = repo.index().map_err(fail)?;
        // FORCE: upstream ignore rules must not drop files the digest covered.
        index
            .add_all(["*"].iter(), IndexAddOption::DEFAULT | IndexAddOption::FORCE, None)
            .map_err(fail)?;
        index.write().map_err(fail)?;
        let tree_id = index.write_tree().map_err(fail)?;
        let git_tree = repo.find_tree(tree_id).map_err(fail)?;

        let author = Signature::now(&self.author_name, &self.author_email).map_err(fail)?;
        let message = format!(
            "{}\n\n{DIGEST_TRAILER}: {}\n{SOURCE_TRAILER}: {}\n",
            request.summary, request.digest, request.source_revision
        );
        let oid = repo
            .commit(Some("HEAD"), &author, &author, &message, &git_tree, &[])
            .map_err(fail)?;
        let head = repo
            .head()
            .map_err(fail)?
            .name()
            .map(str::to_string)
            .ok_or_else(|| CarveError::Transport {
                operation: operation.to_string(),
                reason: "HEAD is not a valid UTF-8 reference".to_string(),
            })?;
        Ok((oid.to_string(), head))
    }

    fn push(&self, tree: &Path, head: &str) -> Result<()> {
        let operation = "push distribution";
        let (tree, url, branch, token_env) = (
            tree.to_path_buf(),
            self.url.clone(),
            self.branch.clone(),
            self.token_env.clone(),
        );
        let refspec = format!("+{head}:refs/heads/{branch}");
        with_timeout(operation, self.policy.timeout, move |abandon| {
            let fail = |e: git2::Error| transport_error(operation, &e);
            let repo = Repository::open(&tree).map_err(fail)?;
            let mut remote = repo.remote_anonymous(&url).map_err(fail)?;

            let attempts = Cell::new(0);
            let rejected: RefCell<Option<String>> = RefCell::new(None);
            {
                let mut cbs = callbacks(&token_env, &attempts, abandon);
                cbs.push_update_reference(|refname, status| {
                    if let Some(status) = status {
                        *rejected.borrow_mut() = Some(format!("{refname}: {status}"));
                    }
                    Ok(())
                });
                let mut options = PushOptions::new();
                options.remote_callbacks(cbs);
                remote.push(&[refspec.as_str()], Some(&mut options)).map_err(fail)?;
            }

            match rejected.into_inner() {
                Some(reason) => Err(CarveError::Transport {
                    operation: operation.to_string(),
                    reason: format!("remote rejected {reason}"),
                }),
                None => Ok(()),
            }
        })
    }
}

impl DistributionRepo for GitDistribution {
    fn current_state(&self) -> Result<Option<DistributionState>> {
        with_retry(&self.policy, "read distribution", || self.read_state())
    }

    fn publish(&self, tree: &Path, request: &PublishRequest) -> Result<String> {
        let (commit, head) = self.commit(tree, request)?;
        // A timed-out push has exited by the time the next attempt starts.
        let pushed = with_retry(&self.policy, "push distribution", || self.push(tree, &head));
        // A stalled push may still be reading its repository.
        if !matches!(pushed, Err(CarveError::TransportStalled { .. })) {
            let git_dir = tree.join(".git");
            if let Err(e) = std::fs::remove_dir_all(&git_dir) {
                tracing::warn!("failed to clean {}: {e}", git_dir.display());
            }
        }
        pushed?;
        tracing::info!("published {commit} to {}@{}", self.url, self.branch);
        Ok(commit)
    }
}

/// Value of the last `key: value` trailer in a commit message.
pub fn trailer<'m>(message: &'m str, key: &str) -> Option<&'m str> {
    message
        .lines()
        .rev()
        .filter_map(|line| line.split_once(':'))
        .find(|(k, _)| k.trim() == key)
        .map(|(_, v)| v.trim())
}
