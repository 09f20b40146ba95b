//! Judge decision artifacts.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::agent::{slot_index, slot_letter};

/// Which review a decision belongs to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewType {
    #[default]
    Initial,
    PeerReview,
}

impl ReviewType {
    pub fn dir_name(&self) -> &'static str {
        match self {
            ReviewType::Initial => "initial",
            ReviewType::PeerReview => "peer_review",
        }
    }
}

impl std::fmt::Display for ReviewType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}

impl FromStr for ReviewType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "initial" => Ok(ReviewType::Initial),
            "peer_review" | "peer" => Ok(ReviewType::PeerReview),
            other => Err(format!("unknown review type '{}'", other)),
        }
    }
}

/// A judge's verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecisionKind {
    #[serde(rename = "APPROVED", alias = "APPROVE", alias = "approved")]
    Approved,
    #[serde(
        rename = "REQUEST_CHANGES",
        alias = "CHANGES_REQUESTED",
        alias = "request_changes"
    )]
    RequestChanges,
    #[serde(rename = "REJECTED", alias = "REJECT", alias = "rejected")]
    Rejected,
}

impl std::fmt::Display for DecisionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DecisionKind::Approved => "APPROVED",
            DecisionKind::RequestChanges => "REQUEST_CHANGES",
            DecisionKind::Rejected => "REJECTED",
        };
        f.write_str(s)
    }
}

/// Preferred writer slot, or a tie.
///
/// Serialized as the slot letter (`"A"`, `"B"`, ...) or `"TIE"`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Winner {
    Writer(usize),
    #[default]
    Tie,
}

impl std::fmt::Display for Winner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Winner::Writer(i) => match slot_letter(*i) {
                Some(letter) => write!(f, "{}", letter),
                None => write!(f, "#{}", i + 1),
            },
            Winner::Tie => f.write_str("TIE"),
        }
    }
}

impl FromStr for Winner {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_ascii_uppercase();
        let slot = upper
            .strip_prefix("WRITER")
            .map(|rest| rest.trim_start_matches([' ', '_', '-']))
            .unwrap_or(&upper);
        match slot {
            "TIE" | "DRAW" => Ok(Winner::Tie),
            _ => {
                let mut chars = slot.chars();
                match (chars.next(), chars.next()) {
                    (Some(letter), None) => slot_index(letter)
                        .map(Winner::Writer)
                        .ok_or_else(|| format!("invalid winner '{}'", s)),
                    _ => Err(format!("invalid winner '{}' (expected a writer letter or TIE)", s)),
                }
            }
        }
    }
}

impl TryFrom<String> for Winner {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Winner> for String {
    fn from(winner: Winner) -> Self {
        winner.to_string()
    }
}

/// One judge's decision for one review of one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    #[serde(default, alias = "judge_id")]
    pub judge: String,
    #[serde(default)]
    pub task_id: String,
    /// Taken from the file's location when loaded.
    #[serde(default)]
    pub review_type: ReviewType,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    pub decision: DecisionKind,
    #[serde(default)]
    pub winner: Winner,
    #[serde(default, deserialize_with = "deserialize_scores")]
    pub scores: BTreeMap<String, f64>,
    #[serde(default, alias = "blockers")]
    pub blocker_issues: Vec<String>,
    #[serde(default)]
    pub recommendation: String,
}

impl Decision {
    pub fn new(judge: &str, task_id: &str, review_type: ReviewType, decision: DecisionKind, winner: Winner) -> Self {
        Self {
            judge: judge.to_string(),
            task_id: task_id.to_string(),
            review_type,
            timestamp: Utc::now(),
            decision,
            winner,
            scores: BTreeMap::new(),
            blocker_issues: Vec::new(),
            recommendation: String::new(),
        }
    }

    pub fn with_blockers(mut self, blockers: &[&str]) -> Self {
        self.blocker_issues = blockers.iter().map(|b| b.to_string()).collect();
        self
    }

    pub fn with_score(mut self, category: &str, score: f64) -> Self {
        self.scores.insert(category.to_string(), score);
        self
    }

    pub fn with_recommendation(mut self, text: &str) -> Self {
        self.recommendation = text.to_string();
        self
    }
}

/// Accept flat `{"correctness": 8}` or nested `{"A": {"correctness": 8}}`
/// scores, flattening nested keys with dots. Non-numeric leaves are dropped.
fn deserialize_scores<'de, D>(deserializer: D) -> Result<BTreeMap<String, f64>, D::Error>
where
    D: Deserializer<'de>,
{
    fn flatten(prefix: &str, value: &Value, out: &mut BTreeMap<String, f64>) {
        match value {
            Value::Number(n) => {
                if let Some(f) = n.as_f64() {
                    out.insert(prefix.to_string(), f);
                }
            }
            Value::Object(map) => {
                for (key, inner) in map {
                    let name = if prefix.is_empty() {
                        key.clone()
                    } else {
                        format!("{}.{}", prefix, key)
                    };
                    flatten(&name, inner, out);
                }
            }
            _ => {}
        }
    }

    let value = Option::<Value>::deserialize(deserializer)?;
    let mut scores = BTreeMap::new();
    if let Some(value) = value {
        flatten("", &value, &mut scores);
    }
    Ok(scores)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_winner_parsing() {
        assert_eq!("A".parse::<Winner>().unwrap(), Winner::Writer(0));
        assert_eq!("b".parse::<Winner>().unwrap(), Winner::Writer(1));
        assert_eq!("Writer C".parse::<Winner>().unwrap(), Winner::Writer(2));
        assert_eq!("writer_a".parse::<Winner>().unwrap(), Winner::Writer(0));
        assert_eq!("tie".parse::<Winner>().unwrap(), Winner::Tie);
        assert!("AB".parse::<Winner>().is_err());
        assert!("7".parse::<Winner>().is_err());
        assert_eq!(Winner::Writer(1).to_string(), "B");
    }

    #[test]
    fn test_decision_from_judge_json() {
        let json = r#"{
            "judge": "judge_1",
            "task_id": "auth",
            "timestamp": "2025-06-01T12:00:00Z",
            "decision": "REQUEST_CHANGES",
            "winner": "B",
            "scores": {"A": {"correctness": 6}, "B": {"correctness": 8.5, "notes": "good"}},
            "blocker_issues": ["Missing tests for refresh tokens"],
            "recommendation": "Go with B after adding tests"
        }"#;
        let decision: Decision = serde_json::from_str(json).unwrap();
        assert_eq!(decision.decision, DecisionKind::RequestChanges);
        assert_eq!(decision.winner, Winner::Writer(1));
        assert_eq!(decision.scores.get("B.correctness"), Some(&8.5));
        assert_eq!(decision.scores.len(), 2);
        assert_eq!(decision.blocker_issues.len(), 1);
    }

    #[test]
    fn test_decision_minimal_and_aliases() {
        let json = r#"{"judge_id":"j","decision":"APPROVE","blockers":["x"]}"#;
        let decision: Decision = serde_json::from_str(json).unwrap();
        assert_eq!(decision.judge, "j");
        assert_eq!(decision.decision, DecisionKind::Approved);
        assert_eq!(decision.winner, Winner::Tie);
        assert_eq!(decision.blocker_issues, vec!["x"]);
    }

    #[test]
    fn test_decision_rejects_bad_winner() {
        let json = r#"{"judge":"j","decision":"APPROVED","winner":"writer-42"}"#;
        assert!(serde_json::from_str::<Decision>(json).is_err());
    }

    #[test]
    fn test_serialized_shape() {
        let decision = Decision::new("j", "t", ReviewType::PeerReview, DecisionKind::Approved, Winner::Writer(0));
        let value = serde_json::to_value(&decision).unwrap();
        assert_eq!(value["winner"], "A");
        assert_eq!(value["decision"], "APPROVED");
        assert_eq!(value["review_type"], "peer_review");
    }

    #[test]
    fn test_review_type_parse() {
        assert_eq!("peer-review".parse::<ReviewType>().unwrap(), ReviewType::PeerReview);
        assert_eq!("initial".parse::<ReviewType>().unwrap(), ReviewType::Initial);
        assert!("final".parse::<ReviewType>().is_err());
    }
}
