//! Decision files on disk.
//!
//! Layout: `<root>/<task>/<initial|peer_review>/<judge>.json`. Earlier peer
//! review rounds are moved into `round-<n>/` subdirectories.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use super::types::{Decision, ReviewType};
use crate::errors::DecisionError;
use crate::util::{atomic_create, extract_json_object};

#[derive(Debug, Clone)]
pub struct DecisionStore {
    root: PathBuf,
}

impl DecisionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn review_dir(&self, task_id: &str, review_type: ReviewType) -> PathBuf {
        self.root.join(task_id).join(review_type.dir_name())
    }

    pub fn path(&self, task_id: &str, review_type: ReviewType, judge_id: &str) -> PathBuf {
        self.review_dir(task_id, review_type)
            .join(format!("{}.json", judge_id))
    }

    /// Write a decision. Fails with `AlreadyWritten` if one exists.
    pub fn write(&self, decision: &Decision) -> Result<PathBuf, DecisionError> {
        let path = self.path(&decision.task_id, decision.review_type, &decision.judge);
        let json = serde_json::to_vec_pretty(decision).map_err(|e| DecisionError::Corrupt {
            path: path.clone(),
            message: e.to_string(),
        })?;
        match atomic_create(&path, &json) {
            Ok(()) => {
                info!(path = %path.display(), judge = %decision.judge, "wrote decision");
                Ok(path)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(DecisionError::AlreadyWritten { path })
            }
            Err(source) => Err(DecisionError::Io { path, source }),
        }
    }

    /// Load a judge's decision; `None` if the judge has not written one.
    ///
    /// The file may wrap the JSON object in prose or a code fence. Judge,
    /// task and review type are taken from the file's location.
    pub fn read(
        &self,
        task_id: &str,
        review_type: ReviewType,
        judge_id: &str,
    ) -> Result<Option<Decision>, DecisionError> {
        let path = self.path(task_id, review_type, judge_id);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(DecisionError::Io { path, source }),
        };

        let mut decision = parse_decision(&content).map_err(|message| DecisionError::Corrupt {
            path: path.clone(),
            message,
        })?;
        if decision.judge != judge_id {
            if !decision.judge.is_empty() {
                warn!(path = %path.display(), found = %decision.judge, "decision names a different judge; using file name");
            }
            decision.judge = judge_id.to_string();
        }
        decision.task_id = task_id.to_string();
        decision.review_type = review_type;
        Ok(Some(decision))
    }

    /// Judges with a decision file in the current round.
    pub fn present(&self, task_id: &str, review_type: ReviewType) -> BTreeSet<String> {
        let dir = self.review_dir(task_id, review_type);
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return BTreeSet::new();
        };
        entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.is_file() && p.extension().is_some_and(|e| e == "json"))
            .filter_map(|p| p.file_stem().map(|s| s.to_string_lossy().to_string()))
            .filter(|stem| !stem.starts_with('.'))
            .collect()
    }

    /// Number of archived rounds for a review.
    pub fn archived_rounds(&self, task_id: &str, review_type: ReviewType) -> u32 {
        let dir = self.review_dir(task_id, review_type);
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return 0;
        };
        entries
            .flatten()
            .filter_map(|e| {
                e.file_name()
                    .to_string_lossy()
                    .strip_prefix("round-")
                    .and_then(|n| n.parse::<u32>().ok())
            })
            .max()
            .unwrap_or(0)
    }

    /// Move the current round's files into `round-<n>/`.
    ///
    /// Returns the round number, or `None` if there was nothing to archive.
    pub fn archive_round(
        &self,
        task_id: &str,
        review_type: ReviewType,
    ) -> Result<Option<u32>, DecisionError> {
        let present = self.present(task_id, review_type);
        if present.is_empty() {
            return Ok(None);
        }
        let round = self.archived_rounds(task_id, review_type) + 1;
        let dir = self.review_dir(task_id, review_type);
        let round_dir = dir.join(format!("round-{}", round));
        std::fs::create_dir_all(&round_dir).map_err(|source| DecisionError::Io {
            path: round_dir.clone(),
            source,
        })?;
        for judge in &present {
            let from = dir.join(format!("{}.json", judge));
            let to = round_dir.join(format!("{}.json", judge));
            std::fs::rename(&from, &to).map_err(|source| DecisionError::Io { path: from, source })?;
        }
        info!(task_id, review = %review_type, round, count = present.len(), "archived review round");
        Ok(Some(round))
    }

    /// Delete the current-round decisions of the given judges.
    pub fn discard(&self, task_id: &str, review_type: ReviewType, judges: &[String]) -> Result<(), DecisionError> {
        for judge in judges {
            let path = self.path(task_id, review_type, judge);
            match std::fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "discarded decision"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => return Err(DecisionError::Io { path, source }),
            }
        }
        Ok(())
    }

    /// Remove every decision for a task.
    pub fn clear(&self, task_id: &str) -> Result<(), DecisionError> {
        let dir = self.root.join(task_id);
        match std::fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(DecisionError::Io { path: dir, source }),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn parse_decision(content: &str) -> Result<Decision, String> {
    match serde_json::from_str::<Decision>(content.trim()) {
        Ok(decision) => Ok(decision),
        Err(direct) => {
            let Some(object) = extract_json_object(content) else {
                return Err(format!("no JSON object found ({})", direct));
            };
            serde_json::from_str::<Decision>(&object).map_err(|e| e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::types::{DecisionKind, Winner};
    use tempfile::tempdir;

    fn decision(judge: &str) -> Decision {
        Decision::new(judge, "t1", ReviewType::Initial, DecisionKind::Approved, Winner::Writer(0))
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempdir().unwrap();
        let store = DecisionStore::new(dir.path());
        let path = store.write(&decision("judge_1")).unwrap();
        assert!(path.ends_with("t1/initial/judge_1.json"));

        let loaded = store.read("t1", ReviewType::Initial, "judge_1").unwrap().unwrap();
        assert_eq!(loaded.winner, Winner::Writer(0));
        assert!(store.read("t1", ReviewType::Initial, "judge_2").unwrap().is_none());
    }

    #[test]
    fn test_decisions_are_immutable() {
        let dir = tempdir().unwrap();
        let store = DecisionStore::new(dir.path());
        store.write(&decision("judge_1")).unwrap();
        assert!(matches!(
            store.write(&decision("judge_1")),
            Err(DecisionError::AlreadyWritten { .. })
        ));
    }

    #[test]
    fn test_read_tolerates_prose_and_fixes_identity() {
        let dir = tempdir().unwrap();
        let store = DecisionStore::new(dir.path());
        let path = store.path("t1", ReviewType::PeerReview, "judge_2");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            "Here is my decision:\n```json\n{\"judge\":\"me\",\"decision\":\"REQUEST_CHANGES\",\"winner\":\"A\",\"blocker_issues\":[\"No tests\"]}\n```\n",
        )
        .unwrap();
        let loaded = store.read("t1", ReviewType::PeerReview, "judge_2").unwrap().unwrap();
        assert_eq!(loaded.judge, "judge_2");
        assert_eq!(loaded.task_id, "t1");
        assert_eq!(loaded.review_type, ReviewType::PeerReview);
        assert_eq!(loaded.decision, DecisionKind::RequestChanges);
    }

    #[test]
    fn test_invalid_file_is_corrupt() {
        let dir = tempdir().unwrap();
        let store = DecisionStore::new(dir.path());
        let path = store.path("t1", ReviewType::Initial, "judge_3");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "I think B is better").unwrap();
        assert!(matches!(
            store.read("t1", ReviewType::Initial, "judge_3"),
            Err(DecisionError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_archive_rounds() {
        let dir = tempdir().unwrap();
        let store = DecisionStore::new(dir.path());
        assert_eq!(store.archive_round("t1", ReviewType::PeerReview).unwrap(), None);

        let mut peer = decision("judge_1");
        peer.review_type = ReviewType::PeerReview;
        store.write(&peer).unwrap();
        assert_eq!(store.archive_round("t1", ReviewType::PeerReview).unwrap(), Some(1));
        assert!(store.present("t1", ReviewType::PeerReview).is_empty());

        store.write(&peer).unwrap();
        assert_eq!(store.archive_round("t1", ReviewType::PeerReview).unwrap(), Some(2));
        assert_eq!(store.archived_rounds("t1", ReviewType::PeerReview), 2);
        assert!(store
            .review_dir("t1", ReviewType::PeerReview)
            .join("round-1/judge_1.json")
            .exists());
    }

    #[test]
    fn test_discard_and_present() {
        let dir = tempdir().unwrap();
        let store = DecisionStore::new(dir.path());
        store.write(&decision("judge_1")).unwrap();
        store.write(&decision("judge_2")).unwrap();
        store
            .discard("t1", ReviewType::Initial, &["judge_2".to_string(), "judge_9".to_string()])
            .unwrap();
        let present: Vec<_> = store.present("t1", ReviewType::Initial).into_iter().collect();
        assert_eq!(present, vec!["judge_1"]);
    }
}
