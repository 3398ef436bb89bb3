//! Write-through status document storage.

use super::{StageState, StageStatus};
use crate::errors::StatusError;
use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};

/// Durable status record for one (session, stage) pair.
///
/// Holds no cached state: every read goes to disk and every update is a
/// read-modify-write of the whole document, committed by rename.
#[derive(Debug, Clone)]
pub struct StatusStore {
    file_path: PathBuf,
}

impl StatusStore {
    /// File name of the status document inside a stage's log directory.
    pub const FILE_NAME: &'static str = "status.json";

    /// Opens the store in `folder`, creating the folder and a default
    /// record if none exists.
    pub fn open(folder: impl AsRef<Path>) -> Result<Self, StatusError> {
        let folder = folder.as_ref();
        let file_path = folder.join(Self::FILE_NAME);
        fs::create_dir_all(folder).map_err(|source| StatusError::Io {
            path: folder.to_path_buf(),
            source,
        })?;

        let store = Self { file_path };
        if !store.file_path.exists() {
            store.write(&StageStatus::default())?;
        }
        Ok(store)
    }

    /// Returns the path of the status document.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.file_path
    }

    /// Reads the current record from disk.
    pub fn read(&self) -> Result<StageStatus, StatusError> {
        let text = fs::read_to_string(&self.file_path).map_err(|source| StatusError::Io {
            path: self.file_path.clone(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|e| StatusError::Corrupt {
            path: self.file_path.clone(),
            message: e.to_string(),
        })
    }

    /// Returns the current state.
    pub fn state(&self) -> Result<StageState, StatusError> {
        Ok(self.read()?.state)
    }

    /// Returns the number of recorded starts.
    pub fn run_count(&self) -> Result<u32, StatusError> {
        Ok(self.read()?.run_count)
    }

    /// Records a new run: run count up by one, state reset to incomplete.
    pub fn update_start_run(&self) -> Result<StageStatus, StatusError> {
        self.update(|status| {
            status.run_count += 1;
            status.state = StageState::Incomplete;
        })
    }

    /// Records verified success and clears the comment.
    pub fn update_success(&self) -> Result<StageStatus, StatusError> {
        self.update(|status| {
            status.state = StageState::Succeeded;
            status.comment.clear();
        })
    }

    /// Records failure with a comment.
    pub fn update_failure(&self, comment: impl Into<String>) -> Result<StageStatus, StatusError> {
        let comment = comment.into();
        self.update(move |status| {
            status.state = StageState::Failed;
            status.comment = comment;
        })
    }

    /// Records assumed-but-unverified success with a comment.
    pub fn update_unchecked(&self, comment: impl Into<String>) -> Result<StageStatus, StatusError> {
        let comment = comment.into();
        self.update(move |status| {
            status.state = StageState::Unchecked;
            status.comment = comment;
        })
    }

    /// Returns true if the stage succeeded or completed unchecked.
    pub fn succeeded(&self) -> Result<bool, StatusError> {
        Ok(self.state()?.allows_continuation())
    }

    fn update(&self, mutate: impl FnOnce(&mut StageStatus)) -> Result<StageStatus, StatusError> {
        let mut status = self.read()?;
        mutate(&mut status);
        status.updated_at = Some(Utc::now());
        self.write(&status)?;
        Ok(status)
    }

    fn write(&self, status: &StageStatus) -> Result<(), StatusError> {
        let text = serde_json::to_string_pretty(status).map_err(|e| StatusError::Corrupt {
            path: self.file_path.clone(),
            message: e.to_string(),
        })?;
        let tmp = self.file_path.with_extension("json.tmp");
        fs::write(&tmp, text)
            .and_then(|()| fs::rename(&tmp, &self.file_path))
            .map_err(|source| StatusError::Io {
                path: self.file_path.clone(),
                source,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_default_record() {
        let dir = TempDir::new().unwrap();
        let store = StatusStore::open(dir.path().join("PreFreeSurfer")).unwrap();

        assert!(store.path().exists());
        let status = store.read().unwrap();
        assert_eq!(status.run_count, 0);
        assert_eq!(status.state, StageState::NotStarted);
        assert!(status.comment.is_empty());
    }

    #[test]
    fn test_open_keeps_existing_record() {
        let dir = TempDir::new().unwrap();
        let store = StatusStore::open(dir.path()).unwrap();
        store.update_start_run().unwrap();
        store.update_failure("exit code 2").unwrap();

        let reopened = StatusStore::open(dir.path()).unwrap();
        let status = reopened.read().unwrap();
        assert_eq!(status.run_count, 1);
        assert_eq!(status.state, StageState::Failed);
        assert_eq!(status.comment, "exit code 2");
    }

    #[test]
    fn test_start_run_increments_by_one() {
        let dir = TempDir::new().unwrap();
        let store = StatusStore::open(dir.path()).unwrap();

        for expected in 1..=3 {
            store.update_start_run().unwrap();
            assert_eq!(store.run_count().unwrap(), expected);
            assert_eq!(store.state().unwrap(), StageState::Incomplete);
        }
    }

    #[test]
    fn test_success_clears_comment() {
        let dir = TempDir::new().unwrap();
        let store = StatusStore::open(dir.path()).unwrap();
        store.update_failure("boom").unwrap();
        store.update_success().unwrap();

        let status = store.read().unwrap();
        assert_eq!(status.state, StageState::Succeeded);
        assert!(status.comment.is_empty());
        assert!(status.updated_at.is_some());
    }

    #[test]
    fn test_unchecked_counts_as_succeeded() {
        let dir = TempDir::new().unwrap();
        let store = StatusStore::open(dir.path()).unwrap();
        store.update_unchecked("no expected outputs").unwrap();

        assert!(store.succeeded().unwrap());
        assert_eq!(store.state().unwrap(), StageState::Unchecked);
    }

    #[test]
    fn test_writes_are_visible_to_other_handles() {
        let dir = TempDir::new().unwrap();
        let writer = StatusStore::open(dir.path()).unwrap();
        let observer = StatusStore::open(dir.path()).unwrap();

        writer.update_start_run().unwrap();
        assert_eq!(observer.state().unwrap(), StageState::Incomplete);
        writer.update_success().unwrap();
        assert_eq!(observer.state().unwrap(), StageState::Succeeded);
    }

    #[test]
    fn test_corrupt_record_is_reported() {
        let dir = TempDir::new().unwrap();
        let store = StatusStore::open(dir.path()).unwrap();
        fs::write(store.path(), "{not json").unwrap();

        assert!(matches!(store.read(), Err(StatusError::Corrupt { .. })));
    }
}
