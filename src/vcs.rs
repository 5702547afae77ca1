//! Rule-directory version-control bookkeeping (spec.md §9): the rule
//! directory is a git checkout; the scheduler only bothers re-parsing it
//! when the checkout has actually moved since the last reload.
//!
//! Grounded on `examples/original_source/fedbadges/rulesrepo.py`, which
//! wraps a GitPython `Repo` the same way: check whether HEAD changed, and
//! expose the last commit's timestamp for logging. `git2` is the direct
//! analogue the teacher already depends on.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VcsError {
    #[error("git error on {path}: {source}")]
    Git {
        path: PathBuf,
        #[source]
        source: git2::Error,
    },
}

/// The rule-directory version-control port.
pub trait VersionControl: Send + Sync {
    /// The current HEAD commit id, or `None` if the directory isn't a git
    /// checkout (plain rule directories are also supported; reload then
    /// always re-parses).
    fn head_commit(&self) -> Result<Option<String>, VcsError>;

    /// Seconds-since-epoch of the last commit touching the repository, for
    /// structured logging.
    fn last_commit_time(&self) -> Result<Option<i64>, VcsError>;
}

pub struct GitVersionControl {
    path: PathBuf,
}

impl GitVersionControl {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn open(&self) -> Result<Option<git2::Repository>, VcsError> {
        match git2::Repository::open(&self.path) {
            Ok(repo) => Ok(Some(repo)),
            Err(err) if err.code() == git2::ErrorCode::NotFound => Ok(None),
            Err(source) => Err(VcsError::Git {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

impl VersionControl for GitVersionControl {
    fn head_commit(&self) -> Result<Option<String>, VcsError> {
        let Some(repo) = self.open()? else {
            return Ok(None);
        };
        let head = repo.head().map_err(|source| VcsError::Git {
            path: self.path.clone(),
            source,
        })?;
        let commit = head.peel_to_commit().map_err(|source| VcsError::Git {
            path: self.path.clone(),
            source,
        })?;
        Ok(Some(commit.id().to_string()))
    }

    fn last_commit_time(&self) -> Result<Option<i64>, VcsError> {
        let Some(repo) = self.open()? else {
            return Ok(None);
        };
        let head = repo.head().map_err(|source| VcsError::Git {
            path: self.path.clone(),
            source,
        })?;
        let commit = head.peel_to_commit().map_err(|source| VcsError::Git {
            path: self.path.clone(),
            source,
        })?;
        Ok(Some(commit.time().seconds()))
    }
}

/// Wraps a plain directory with no version control: always reports "changed"
/// so the caller re-parses every poll. Used in tests and for rule
/// directories managed outside git.
pub struct NoVersionControl;

impl VersionControl for NoVersionControl {
    fn head_commit(&self) -> Result<Option<String>, VcsError> {
        Ok(None)
    }

    fn last_commit_time(&self) -> Result<Option<i64>, VcsError> {
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_git_directory_reports_no_head() {
        let dir = tempfile::tempdir().unwrap();
        let vcs = GitVersionControl::new(dir.path());
        assert_eq!(vcs.head_commit().unwrap(), None);
    }

    #[test]
    fn no_version_control_always_reports_none() {
        let vcs = NoVersionControl;
        assert_eq!(vcs.head_commit().unwrap(), None);
        assert_eq!(vcs.last_commit_time().unwrap(), None);
    }

    #[test]
    fn git_directory_reports_head_commit() {
        let dir = tempfile::tempdir().unwrap();
        let repo = git2::Repository::init(dir.path()).unwrap();
        let sig = git2::Signature::now("Test", "test@example.com").unwrap();
        let tree_id = {
            let mut index = repo.index().unwrap();
            index.write_tree().unwrap()
        };
        let tree = repo.find_tree(tree_id).unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "initial", &tree, &[])
            .unwrap();

        let vcs = GitVersionControl::new(dir.path());
        assert!(vcs.head_commit().unwrap().is_some());
        assert!(vcs.last_commit_time().unwrap().is_some());
    }
}
