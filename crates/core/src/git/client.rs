//! Local Git repository operations via `git2`.

use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use git2::build::CheckoutBuilder;
use git2::{
    Cred, ErrorCode, FetchOptions, IndexAddOption, ObjectType, Oid, PushOptions, RemoteCallbacks,
    Repository, RepositoryInitOptions, RepositoryState, ResetType, Signature, Status,
    StatusOptions, TreeWalkMode, TreeWalkResult,
};
use tracing::{debug, info, instrument, warn};

use super::{MergeOutcome, RepoStatus, VersionControl};
use crate::codec::FileSet;
use crate::errors::GitError;

/// Remote, branch and identity the client works with.
#[derive(Debug, Clone)]
pub struct GitSettings {
    pub remote_name: String,
    pub branch: String,
    /// HTTPS token sent as `x-access-token`.
    pub token: Option<String>,
    pub author_name: String,
    pub author_email: String,
}

impl Default for GitSettings {
    fn default() -> Self {
        Self {
            remote_name: "origin".into(),
            branch: "main".into(),
            token: None,
            author_name: "snipsync".into(),
            author_email: "snipsync@localhost".into(),
        }
    }
}

/// High-level Git client wrapping a `git2::Repository`.
pub struct GitClient {
    repo: Repository,
    repo_path: PathBuf,
    settings: GitSettings,
}

impl GitClient {
    /// Open an existing Git repository at `repo_path`.
    pub fn open<P: AsRef<Path>>(repo_path: P, settings: GitSettings) -> Result<Self, GitError> {
        let path = repo_path.as_ref();
        info!(path = %path.display(), "opening git repository");
        let repo = Repository::open(path)
            .map_err(|_| GitError::RepositoryNotFound(path.display().to_string()))?;
        Self::attach(repo, path, settings)
    }

    /// Create a new repository whose HEAD points at the configured branch.
    pub fn init<P: AsRef<Path>>(repo_path: P, settings: GitSettings) -> Result<Self, GitError> {
        let path = repo_path.as_ref();
        info!(path = %path.display(), branch = %settings.branch, "initializing git repository");
        fs::create_dir_all(path)?;
        let mut opts = RepositoryInitOptions::new();
        opts.initial_head(&settings.branch);
        let repo = Repository::init_opts(path, &opts)?;
        Self::attach(repo, path, settings)
    }

    /// Clone a remote repository to `path`.
    #[instrument(skip(settings), fields(url = %url, path = %path.display()))]
    pub fn clone_repo(url: &str, path: &Path, settings: GitSettings) -> Result<Self, GitError> {
        info!("cloning git repository");
        let mut fetch_opts = FetchOptions::new();
        fetch_opts.remote_callbacks(credential_callbacks(settings.token.as_deref()));
        let mut builder = git2::build::RepoBuilder::new();
        builder.fetch_options(fetch_opts);
        let repo = builder.clone(url, path)?;
        info!("clone completed");
        Self::attach(repo, path, settings)
    }

    /// Open the repository at `path`, creating it if needed, and point the
    /// configured remote at `remote_url` when one is given.
    pub fn open_or_init<P: AsRef<Path>>(
        path: P,
        remote_url: Option<&str>,
        settings: GitSettings,
    ) -> Result<Self, GitError> {
        let path = path.as_ref();
        let client = match Repository::open(path) {
            Ok(repo) => Self::attach(repo, path, settings)?,
            Err(_) => Self::init(path, settings)?,
        };
        if let Some(url) = remote_url {
            client.set_remote(url)?;
        }
        Ok(client)
    }

    fn attach(repo: Repository, path: &Path, settings: GitSettings) -> Result<Self, GitError> {
        let wanted = format!("refs/heads/{}", settings.branch);
        if repo.head().is_err() {
            // Unborn HEAD (fresh init or empty clone): aim it at our branch.
            repo.set_head(&wanted)?;
        } else if repo.find_reference("HEAD")?.symbolic_target() != Some(wanted.as_str()) {
            warn!(branch = %settings.branch, "HEAD is not on the configured branch");
        }
        Ok(Self {
            repo,
            repo_path: path.to_path_buf(),
            settings,
        })
    }

    /// Add the configured remote, or update its URL.
    pub fn set_remote(&self, url: &str) -> Result<(), GitError> {
        let name = &self.settings.remote_name;
        match self.repo.find_remote(name) {
            Ok(remote) if remote.url() == Some(url) => {}
            Ok(_) => {
                info!(remote = %name, url, "updating remote url");
                self.repo.remote_set_url(name, url)?;
            }
            Err(_) => {
                info!(remote = %name, url, "adding remote");
                self.repo.remote(name, url)?;
            }
        }
        Ok(())
    }

    pub fn repo(&self) -> &Repository {
        &self.repo
    }

    pub fn settings(&self) -> &GitSettings {
        &self.settings
    }

    fn find_remote(&self) -> Result<git2::Remote<'_>, GitError> {
        self.repo.find_remote(&self.settings.remote_name).map_err(|e| {
            if e.code() == ErrorCode::NotFound {
                GitError::RemoteNotConfigured(self.settings.remote_name.clone())
            } else {
                e.into()
            }
        })
    }

    fn head_oid(&self) -> Result<Option<Oid>, GitError> {
        match self.repo.head() {
            Ok(head) => Ok(Some(head.peel_to_commit()?.id())),
            Err(e) if matches!(e.code(), ErrorCode::UnbornBranch | ErrorCode::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn head_ref_name(&self) -> String {
        self.repo
            .find_reference("HEAD")
            .ok()
            .and_then(|r| r.symbolic_target().map(str::to_string))
            .unwrap_or_else(|| format!("refs/heads/{}", self.settings.branch))
    }

    fn resolve(&self, rev: &str) -> Result<Oid, GitError> {
        let object = self
            .repo
            .revparse_single(rev)
            .map_err(|_| GitError::RefNotFound(rev.to_string()))?;
        Ok(object.peel_to_commit()?.id())
    }

    fn merge_heads(&self) -> Result<Vec<Oid>, GitError> {
        let path = self.repo.path().join("MERGE_HEAD");
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        text.lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(|l| Oid::from_str(l).map_err(GitError::from))
            .collect()
    }

    fn signature(&self) -> Result<Signature<'static>, GitError> {
        Ok(Signature::now(&self.settings.author_name, &self.settings.author_email)?)
    }

    fn fast_forward(&self, target: Oid) -> Result<(), GitError> {
        let head_ref = self.head_ref_name();
        match self.repo.find_reference(&head_ref) {
            Ok(mut reference) => {
                reference.set_target(target, "snipsync: fast-forward")?;
            }
            Err(_) => {
                self.repo.reference(&head_ref, target, true, "snipsync: initial fast-forward")?;
            }
        }
        self.repo.set_head(&head_ref)?;
        self.repo.checkout_head(Some(CheckoutBuilder::new().force()))?;
        Ok(())
    }
}

fn credential_callbacks<'a>(token: Option<&str>) -> RemoteCallbacks<'a> {
    let mut callbacks = RemoteCallbacks::new();
    if let Some(tok) = token {
        let tok = tok.to_string();
        callbacks.credentials(move |_url, _username, _allowed| {
            Cred::userpass_plaintext("x-access-token", &tok)
        });
    }
    callbacks
}

fn entry_path(entry: &git2::IndexEntry) -> String {
    String::from_utf8_lossy(&entry.path).into_owned()
}

impl VersionControl for GitClient {
    fn workdir(&self) -> &Path {
        &self.repo_path
    }

    fn status(&self) -> Result<RepoStatus, GitError> {
        let mut opts = StatusOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);
        let statuses = self.repo.statuses(Some(&mut opts))?;

        let mut status = RepoStatus::default();
        for entry in statuses.iter() {
            let Some(path) = entry.path() else { continue };
            let path = path.to_string();
            let flags = entry.status();

            if flags.is_conflicted() {
                status.conflicted.push(path);
                continue;
            }
            if flags.intersects(
                Status::INDEX_NEW | Status::INDEX_MODIFIED | Status::INDEX_DELETED | Status::INDEX_RENAMED,
            ) {
                status.staged.push(path.clone());
            }
            if flags.intersects(Status::INDEX_NEW | Status::WT_NEW) {
                status.created.push(path.clone());
            }
            if flags.intersects(Status::INDEX_MODIFIED | Status::WT_MODIFIED) {
                status.modified.push(path.clone());
            }
            if flags.intersects(Status::INDEX_DELETED | Status::WT_DELETED) {
                status.deleted.push(path.clone());
            }
            if flags.intersects(Status::INDEX_RENAMED | Status::WT_RENAMED) {
                status.renamed.push(path);
            }
        }
        Ok(status)
    }

    fn add_all(&self) -> Result<(), GitError> {
        let mut index = self.repo.index()?;

        if index.has_conflicts() {
            let mut paths = Vec::new();
            for conflict in index.conflicts()? {
                let conflict = conflict?;
                if let Some(entry) = conflict.our.as_ref().or(conflict.their.as_ref()).or(conflict.ancestor.as_ref()) {
                    paths.push(entry_path(entry));
                }
            }
            for path in paths {
                let relative = Path::new(&path);
                if self.repo_path.join(relative).exists() {
                    index.add_path(relative)?;
                } else {
                    index.remove_path(relative)?;
                }
                debug!(path = %path, "settled conflict entry");
            }
        }

        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"].iter(), None)?;
        index.write()?;
        Ok(())
    }

    #[instrument(skip(self, message))]
    fn commit(&self, message: &str) -> Result<Option<String>, GitError> {
        if self.merge_in_progress() {
            return Err(GitError::MergeInProgress);
        }
        let mut index = self.repo.index()?;
        let tree_oid = index.write_tree()?;
        let parent = match self.head_oid()? {
            Some(oid) => Some(self.repo.find_commit(oid)?),
            None => None,
        };

        let unchanged = match &parent {
            Some(commit) => commit.tree_id() == tree_oid,
            None => index.is_empty(),
        };
        if unchanged {
            debug!("nothing to commit");
            return Ok(None);
        }

        let tree = self.repo.find_tree(tree_oid)?;
        let sig = self.signature()?;
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let oid = self.repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        info!(sha = %oid, "created commit");
        Ok(Some(oid.to_string()))
    }

    #[instrument(skip(self))]
    fn fetch(&self) -> Result<(), GitError> {
        info!(remote = %self.settings.remote_name, "fetching");
        let mut remote = self.find_remote()?;
        let mut fetch_opts = FetchOptions::new();
        fetch_opts.remote_callbacks(credential_callbacks(self.settings.token.as_deref()));
        let refspec = format!("+refs/heads/{}:{}", self.settings.branch, self.remote_ref());
        remote.fetch(&[refspec.as_str()], Some(&mut fetch_opts), None)?;
        debug!("fetch completed");
        Ok(())
    }

    fn pull(&self) -> Result<MergeOutcome, GitError> {
        self.fetch()?;
        if self.remote_head()?.is_none() {
            return Ok(MergeOutcome::UpToDate);
        }
        self.merge(&self.remote_ref(), false)
    }

    #[instrument(skip(self))]
    fn push(&self) -> Result<(), GitError> {
        let branch = &self.settings.branch;
        info!(remote = %self.settings.remote_name, branch = %branch, "pushing");
        let head = self
            .head_oid()?
            .ok_or_else(|| GitError::RefNotFound(self.head_ref_name()))?;
        let mut remote = self.find_remote()?;

        let rejection = RefCell::new(None::<String>);
        let mut callbacks = credential_callbacks(self.settings.token.as_deref());
        callbacks.push_update_reference(|refname, status| {
            if let Some(msg) = status {
                warn!(refname, msg, "push rejected");
                *rejection.borrow_mut() = Some(msg.to_string());
            }
            Ok(())
        });
        let mut push_opts = PushOptions::new();
        push_opts.remote_callbacks(callbacks);

        let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
        match remote.push(&[refspec.as_str()], Some(&mut push_opts)) {
            Ok(()) => {}
            Err(e) if e.code() == ErrorCode::NotFastForward => {
                warn!(detail = %e.message(), "push rejected as non-fast-forward");
                return Err(GitError::PushRejected {
                    branch: branch.clone(),
                    detail: e.message().to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        }
        drop(push_opts);
        if let Some(detail) = rejection.borrow_mut().take() {
            return Err(GitError::PushRejected {
                branch: branch.clone(),
                detail,
            });
        }

        self.repo
            .reference(&self.remote_ref(), head, true, "snipsync: push")?;
        info!(sha = %head, "push completed");
        Ok(())
    }

    fn head(&self) -> Result<Option<String>, GitError> {
        Ok(self.head_oid()?.map(|oid| oid.to_string()))
    }

    fn remote_head(&self) -> Result<Option<String>, GitError> {
        match self.repo.find_reference(&self.remote_ref()) {
            Ok(reference) => Ok(Some(reference.peel_to_commit()?.id().to_string())),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn remote_ref(&self) -> String {
        format!("refs/remotes/{}/{}", self.settings.remote_name, self.settings.branch)
    }

    fn merge_needed(&self) -> Result<bool, GitError> {
        let Some(remote) = self.remote_head()? else {
            return Ok(false);
        };
        let remote = Oid::from_str(&remote)?;
        match self.head_oid()? {
            None => Ok(true),
            Some(head) if head == remote => Ok(false),
            Some(head) => Ok(!self.repo.graph_descendant_of(head, remote)?),
        }
    }

    fn common_ancestor(&self, a: &str, b: &str) -> Result<Option<String>, GitError> {
        let a = self.resolve(a)?;
        let b = self.resolve(b)?;
        match self.repo.merge_base(a, b) {
            Ok(oid) => Ok(Some(oid.to_string())),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self))]
    fn merge(&self, rev: &str, allow_unrelated: bool) -> Result<MergeOutcome, GitError> {
        if self.merge_in_progress() {
            return Err(GitError::MergeInProgress);
        }
        let theirs = self.resolve(rev)?;

        let Some(ours) = self.head_oid()? else {
            info!(sha = %theirs, "unborn HEAD, taking remote history");
            self.fast_forward(theirs)?;
            return Ok(MergeOutcome::FastForward);
        };
        if ours == theirs {
            return Ok(MergeOutcome::UpToDate);
        }

        let related = match self.repo.merge_base(ours, theirs) {
            Ok(_) => true,
            Err(e) if e.code() == ErrorCode::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        if !related && !allow_unrelated {
            return Err(GitError::UnrelatedHistories {
                ours: ours.to_string(),
                theirs: theirs.to_string(),
            });
        }

        let annotated = self.repo.find_annotated_commit(theirs)?;
        let (analysis, _) = self.repo.merge_analysis(&[&annotated])?;
        if analysis.is_up_to_date() {
            return Ok(MergeOutcome::UpToDate);
        }
        if analysis.is_fast_forward() {
            self.fast_forward(theirs)?;
            info!(sha = %theirs, "fast-forwarded");
            return Ok(MergeOutcome::FastForward);
        }

        let mut checkout = CheckoutBuilder::new();
        checkout.allow_conflicts(true).conflict_style_merge(true);
        self.repo.merge(&[&annotated], None, Some(&mut checkout))?;
        let conflicted_paths = self.conflicted_paths()?;
        info!(
            ours = %ours,
            theirs = %theirs,
            related,
            conflicts = conflicted_paths.len(),
            "merge in progress"
        );
        Ok(MergeOutcome::Merging { conflicted_paths })
    }

    #[instrument(skip(self, message))]
    fn commit_merge(&self, message: &str) -> Result<String, GitError> {
        if !self.merge_in_progress() {
            return Err(GitError::NoMergeInProgress);
        }
        let conflicts = self.conflicted_paths()?;
        if !conflicts.is_empty() {
            return Err(GitError::UnresolvedConflicts(conflicts));
        }

        let head = self
            .head_oid()?
            .ok_or_else(|| GitError::RefNotFound(self.head_ref_name()))?;
        let mut parents = vec![self.repo.find_commit(head)?];
        for oid in self.merge_heads()? {
            parents.push(self.repo.find_commit(oid)?);
        }
        let parent_refs: Vec<&git2::Commit> = parents.iter().collect();

        let tree_oid = self.repo.index()?.write_tree()?;
        let tree = self.repo.find_tree(tree_oid)?;
        let sig = self.signature()?;
        let oid = self
            .repo
            .commit(Some("HEAD"), &sig, &sig, message, &tree, &parent_refs)?;
        self.repo.cleanup_state()?;
        info!(sha = %oid, parents = parent_refs.len(), "created merge commit");
        Ok(oid.to_string())
    }

    fn conflicted_paths(&self) -> Result<Vec<String>, GitError> {
        let index = self.repo.index()?;
        if !index.has_conflicts() {
            return Ok(Vec::new());
        }
        let mut paths = Vec::new();
        for conflict in index.conflicts()? {
            let conflict = conflict?;
            if let Some(entry) = conflict.our.as_ref().or(conflict.their.as_ref()).or(conflict.ancestor.as_ref()) {
                paths.push(entry_path(entry));
            }
        }
        paths.sort();
        paths.dedup();
        Ok(paths)
    }

    fn merge_in_progress(&self) -> bool {
        self.repo.state() == RepositoryState::Merge
    }

    fn merge_started_at(&self) -> Result<Option<DateTime<Utc>>, GitError> {
        if !self.merge_in_progress() {
            return Ok(None);
        }
        match fs::metadata(self.repo.path().join("MERGE_HEAD")) {
            Ok(meta) => Ok(Some(DateTime::<Utc>::from(meta.modified()?))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self))]
    fn abort_merge(&self) -> Result<(), GitError> {
        self.repo.cleanup_state()?;
        match self.head_oid()? {
            Some(head) => {
                let object = self.repo.find_object(head, Some(ObjectType::Commit))?;
                self.repo.reset(&object, ResetType::Hard, None)?;
            }
            None => {
                let mut index = self.repo.index()?;
                index.clear()?;
                index.write()?;
            }
        }
        info!("merge aborted");
        Ok(())
    }

    fn read_files_at(&self, rev: &str) -> Result<FileSet, GitError> {
        let oid = self.resolve(rev)?;
        let tree = self.repo.find_commit(oid)?.tree()?;

        let mut files = FileSet::new();
        let mut failure: Option<git2::Error> = None;
        tree.walk(TreeWalkMode::PreOrder, |root, entry| {
            if entry.kind() != Some(ObjectType::Blob) {
                return TreeWalkResult::Ok;
            }
            let Some(name) = entry.name() else {
                return TreeWalkResult::Ok;
            };
            let path = format!("{root}{name}");
            match self.repo.find_blob(entry.id()) {
                Ok(blob) => match std::str::from_utf8(blob.content()) {
                    Ok(text) => {
                        files.insert(path, text.to_string());
                    }
                    Err(_) => warn!(path = %path, "skipping non-UTF-8 file"),
                },
                Err(e) => {
                    failure = Some(e);
                    return TreeWalkResult::Abort;
                }
            }
            TreeWalkResult::Ok
        })?;
        if let Some(e) = failure {
            return Err(e.into());
        }
        debug!(rev, count = files.len(), "read files at revision");
        Ok(files)
    }

    #[instrument(skip(self))]
    fn reset_hard(&self, rev: &str) -> Result<(), GitError> {
        let oid = self.resolve(rev)?;
        let object = self.repo.find_object(oid, Some(ObjectType::Commit))?;
        self.repo.cleanup_state()?;
        self.repo.reset(&object, ResetType::Hard, None)?;
        warn!(sha = %oid, "reset working tree");
        Ok(())
    }
}
