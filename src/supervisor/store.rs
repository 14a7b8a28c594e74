use super::types::SessionRecord;
use crate::error::{Result, StackError};
use std::path::{Path, PathBuf};

/// Session records on disk, one JSON file per session id.
#[derive(Debug, Clone)]
pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn record_path(&self, session_id: &str) -> PathBuf {
        self.root.join(format!("{session_id}.json"))
    }

    /// Directory holding the window logs of one session.
    pub fn log_dir(&self, session_id: &str) -> PathBuf {
        self.root.join(session_id)
    }

    pub fn load(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let path = self.record_path(session_id);
        match std::fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text).map(Some).map_err(|e| {
                StackError::Process(format!("corrupt session file {}: {e}", path.display()))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write via a temp file and rename so readers never see half a record.
    pub fn save(&self, record: &SessionRecord) -> Result<()> {
        std::fs::create_dir_all(&self.root)?;
        let path = self.record_path(&record.id);
        let tmp = path.with_extension("json.tmp");
        let text = serde_json::to_string_pretty(record)
            .map_err(|e| StackError::Process(format!("cannot encode session: {e}")))?;
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub fn remove(&self, session_id: &str) -> Result<()> {
        match std::fs::remove_file(self.record_path(session_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
