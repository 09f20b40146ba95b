//! Durable per-(agent, task) session ids.
//!
//! One JSON record per agent under `<sessions>/<task>/<agent>.json`, written
//! atomically. A record is only ever replaced through [`SessionStore::replace`];
//! [`SessionStore::save`] refuses to overwrite a different id.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::errors::SessionError;
use crate::util::atomic_write;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub agent_id: String,
    pub task_id: String,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self, agent_id: &str, task_id: &str) -> PathBuf {
        self.dir.join(task_id).join(format!("{}.json", agent_id))
    }

    /// Full record for `(agent_id, task_id)`, if any.
    pub fn record(&self, agent_id: &str, task_id: &str) -> Result<Option<SessionRecord>, SessionError> {
        read_record(&self.path(agent_id, task_id))
    }

    /// Session id for `(agent_id, task_id)`; `None` if never recorded.
    pub fn load(&self, agent_id: &str, task_id: &str) -> Result<Option<String>, SessionError> {
        Ok(self.record(agent_id, task_id)?.map(|r| r.session_id))
    }

    /// Record a session id. Saving the same id again is a no-op; a different
    /// id is a `Conflict`.
    pub fn save(
        &self,
        agent_id: &str,
        task_id: &str,
        session_id: &str,
    ) -> Result<SessionRecord, SessionError> {
        if let Some(existing) = self.record(agent_id, task_id)? {
            if existing.session_id == session_id {
                return Ok(existing);
            }
            return Err(SessionError::Conflict {
                agent_id: agent_id.to_string(),
                task_id: task_id.to_string(),
                existing: existing.session_id,
                attempted: session_id.to_string(),
            });
        }
        let record = SessionRecord {
            agent_id: agent_id.to_string(),
            task_id: task_id.to_string(),
            session_id: session_id.to_string(),
            created_at: Utc::now(),
        };
        self.write(&record)?;
        debug!(agent_id, task_id, session_id, "recorded session");
        Ok(record)
    }

    /// Overwrite the record, returning the one it replaced.
    pub fn replace(
        &self,
        agent_id: &str,
        task_id: &str,
        session_id: &str,
    ) -> Result<Option<SessionRecord>, SessionError> {
        let previous = self.record(agent_id, task_id)?;
        let record = SessionRecord {
            agent_id: agent_id.to_string(),
            task_id: task_id.to_string(),
            session_id: session_id.to_string(),
            created_at: Utc::now(),
        };
        self.write(&record)?;
        if let Some(prev) = &previous
            && prev.session_id != session_id
        {
            info!(agent_id, task_id, old = %prev.session_id, new = session_id, "replaced session");
        }
        Ok(previous)
    }

    /// Put back a record captured before a phase started; `None` deletes.
    pub fn restore(
        &self,
        agent_id: &str,
        task_id: &str,
        previous: Option<&SessionRecord>,
    ) -> Result<(), SessionError> {
        match previous {
            Some(record) => self.write(record),
            None => {
                let path = self.path(agent_id, task_id);
                match std::fs::remove_file(&path) {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    Err(source) => Err(SessionError::Io { path, source }),
                }
            }
        }
    }

    /// All records for a task, sorted by agent id.
    pub fn list(&self, task_id: &str) -> Result<Vec<SessionRecord>, SessionError> {
        let dir = self.dir.join(task_id);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(SessionError::Io { path: dir, source }),
        };
        let mut records = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == "json")
                && let Some(record) = read_record(&path)?
            {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        Ok(records)
    }

    /// Delete every record for a task. Returns how many were removed.
    pub fn clear(&self, task_id: &str) -> Result<usize, SessionError> {
        let count = self.list(task_id)?.len();
        let dir = self.dir.join(task_id);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(count),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(source) => Err(SessionError::Io { path: dir, source }),
        }
    }

    fn write(&self, record: &SessionRecord) -> Result<(), SessionError> {
        let path = self.path(&record.agent_id, &record.task_id);
        let json = serde_json::to_vec_pretty(record).map_err(|e| SessionError::Corrupt {
            path: path.clone(),
            message: e.to_string(),
        })?;
        atomic_write(&path, &json).map_err(|source| SessionError::Io { path, source })
    }
}

fn read_record(path: &Path) -> Result<Option<SessionRecord>, SessionError> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(SessionError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| SessionError::Corrupt {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        store.save("writer_a", "t1", "sess-abc").unwrap();
        assert_eq!(store.load("writer_a", "t1").unwrap().as_deref(), Some("sess-abc"));
    }

    #[test]
    fn test_unknown_pair_is_none() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        assert_eq!(store.load("nobody", "nothing").unwrap(), None);
        assert!(store.list("nothing").unwrap().is_empty());
    }

    #[test]
    fn test_save_refuses_silent_overwrite() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        store.save("j", "t", "one").unwrap();
        store.save("j", "t", "one").unwrap();
        let err = store.save("j", "t", "two").unwrap_err();
        assert!(matches!(err, SessionError::Conflict { .. }));
        assert_eq!(store.load("j", "t").unwrap().as_deref(), Some("one"));
    }

    #[test]
    fn test_replace_and_restore() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        let original = store.save("w", "t", "one").unwrap();

        let previous = store.replace("w", "t", "two").unwrap();
        assert_eq!(previous.as_ref(), Some(&original));
        assert_eq!(store.load("w", "t").unwrap().as_deref(), Some("two"));

        store.restore("w", "t", previous.as_ref()).unwrap();
        assert_eq!(store.load("w", "t").unwrap().as_deref(), Some("one"));

        store.restore("w", "t", None).unwrap();
        assert_eq!(store.load("w", "t").unwrap(), None);
    }

    #[test]
    fn test_corrupt_record() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        let path = store.path("w", "t");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(store.load("w", "t"), Err(SessionError::Corrupt { .. })));
    }

    #[test]
    fn test_list_and_clear() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        store.save("b", "t", "2").unwrap();
        store.save("a", "t", "1").unwrap();
        store.save("a", "other", "3").unwrap();
        let ids: Vec<_> = store.list("t").unwrap().into_iter().map(|r| r.agent_id).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(store.clear("t").unwrap(), 2);
        assert!(store.list("t").unwrap().is_empty());
        assert_eq!(store.load("a", "other").unwrap().as_deref(), Some("3"));
    }
}
