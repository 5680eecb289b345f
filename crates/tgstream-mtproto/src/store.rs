use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::proto::DcId;

/// Session material persisted across restarts, one file per DC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionData {
    pub dc_id: i32,
    pub auth_key: Vec<u8>,
    pub test_mode: bool,
    pub user_id: Option<i64>,
    pub is_bot: bool,
}

/// Failure to load or save a session file.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("session file io: {0}")]
    Io(#[from] io::Error),
    #[error("session file malformed: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// JSON session files under one directory: `dc{N}.session.json`.
///
/// Only the home session must be persisted; foreign-DC sessions are rebuilt
/// via export/import after a restart, so a missing file is never an error.
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path(&self, dc_id: DcId) -> PathBuf {
        self.dir.join(format!("dc{}.session.json", dc_id.0))
    }

    /// Loads the session file for `dc_id`, if one exists.
    pub fn load(&self, dc_id: DcId) -> Result<Option<SessionData>, StoreError> {
        let raw = match fs::read(self.path(dc_id)) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(serde_json::from_slice(&raw)?))
    }

    /// Writes the session file for `data.dc_id`, creating the directory on
    /// first use.
    pub fn save(&self, data: &SessionData) -> Result<(), StoreError> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path(DcId(data.dc_id));
        let raw = serde_json::to_vec_pretty(data)?;
        fs::write(path, raw)?;
        Ok(())
    }

    /// Removes the session file for `dc_id`, if any.
    pub fn delete(&self, dc_id: DcId) -> Result<(), StoreError> {
        match fs::remove_file(self.path(dc_id)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
