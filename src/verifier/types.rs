use crate::error::{Result, StackError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResources {
    pub cpu: u32,
    pub memory_gb: f64,
}

impl Default for RunResources {
    fn default() -> Self {
        Self { cpu: 1, memory_gb: 1.0 }
    }
}

/// A job submission. Built once and never mutated after submit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    pub tool_id: String,
    #[serde(default)]
    pub inputs: Map<String, Value>,
    #[serde(default)]
    pub resources: RunResources,
    #[serde(default)]
    pub constraints: Map<String, Value>,
}

impl RunRequest {
    pub fn new(tool_id: &str, inputs: Value) -> Self {
        Self {
            tool_id: tool_id.to_string(),
            inputs: match inputs {
                Value::Object(map) => map,
                _ => Map::new(),
            },
            resources: RunResources::default(),
            constraints: Map::new(),
        }
    }

    /// The enrichment request the smoke test submits by default.
    pub fn smoke_default() -> Self {
        Self::new(
            "enrichr_pathway",
            serde_json::json!({ "genes": ["TP53", "BRCA1", "EGFR"] }),
        )
    }

    pub fn from_json_file(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            StackError::Configuration(format!("cannot read run request {}: {e}", path.display()))
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    /// Shape checks that need no server.
    pub fn check(&self) -> Result<()> {
        if self.tool_id.trim().is_empty() {
            return Err(StackError::Configuration("run request has an empty tool_id".into()));
        }
        if self.resources.cpu == 0 {
            return Err(StackError::Configuration("run request asks for 0 cpu".into()));
        }
        if self.resources.memory_gb.is_nan() || self.resources.memory_gb <= 0.0 {
            return Err(StackError::Configuration(format!(
                "run request memory_gb must be positive, got {}",
                self.resources.memory_gb
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    Pending,
    Running,
    Completed,
    Failed,
    Unknown,
}

impl RunState {
    /// Case-insensitive; anything unrecognised is Unknown.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Self::Pending,
            "RUNNING" => Self::Running,
            "COMPLETED" => Self::Completed,
            "FAILED" => Self::Failed,
            _ => Self::Unknown,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    bioquery: Option<BioQuery>,
}

#[derive(Debug, Deserialize)]
struct BioQuery {
    #[serde(default)]
    payload: Option<BioQueryPayload>,
}

#[derive(Debug, Deserialize)]
struct BioQueryPayload {
    #[serde(default)]
    rows: Option<Vec<Value>>,
}

/// One parsed status-proxy response.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusSnapshot {
    pub state: RunState,
    pub rows: Option<Vec<Value>>,
    pub body: String,
}

impl StatusSnapshot {
    /// Empty or unparsable bodies are an Unknown snapshot, not an error.
    pub fn parse(body: String) -> Self {
        match serde_json::from_str::<StatusBody>(&body) {
            Ok(parsed) => Self {
                state: parsed.state.as_deref().map(RunState::parse).unwrap_or(RunState::Unknown),
                rows: parsed.bioquery.and_then(|b| b.payload).and_then(|p| p.rows),
                body,
            },
            Err(_) => Self::unknown(body),
        }
    }

    pub fn unknown(body: String) -> Self {
        Self { state: RunState::Unknown, rows: None, body }
    }
}

/// Read-only view of a run as last observed through the proxy.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    pub run_id: String,
    pub state: RunState,
    pub result: Option<Vec<Value>>,
}

impl RunRecord {
    pub fn new(run_id: &str) -> Self {
        Self {
            run_id: run_id.to_string(),
            state: RunState::Pending,
            result: None,
        }
    }

    /// Apply a polled snapshot. Terminal states are sticky and Unknown never
    /// overwrites a real state. Returns false when the snapshot was ignored.
    pub fn observe(&mut self, snapshot: &StatusSnapshot) -> bool {
        if self.state.is_terminal() || snapshot.state == RunState::Unknown {
            return false;
        }
        self.state = snapshot.state;
        if snapshot.state == RunState::Completed {
            self.result = Some(snapshot.rows.clone().unwrap_or_default());
        }
        true
    }
}

/// What a successful verification saw.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationReport {
    pub run_id: String,
    pub attempts: u32,
    pub final_state: RunState,
    pub row_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_parse_is_case_insensitive() {
        assert_eq!(RunState::parse("completed"), RunState::Completed);
        assert_eq!(RunState::parse(" Running "), RunState::Running);
        assert_eq!(RunState::parse("FAILED"), RunState::Failed);
        assert_eq!(RunState::parse("queued"), RunState::Unknown);
        assert_eq!(RunState::parse(""), RunState::Unknown);
    }

    #[test]
    fn test_snapshot_reads_nested_rows() {
        let body = r#"{"state":"completed","bioquery":{"payload":{"rows":[{"term":"p53"},{"term":"DNA repair"}]}}}"#;
        let snap = StatusSnapshot::parse(body.to_string());
        assert_eq!(snap.state, RunState::Completed);
        assert_eq!(snap.rows.as_ref().map(Vec::len), Some(2));
    }

    #[test]
    fn test_snapshot_garbage_is_unknown() {
        assert_eq!(StatusSnapshot::parse(String::new()).state, RunState::Unknown);
        assert_eq!(StatusSnapshot::parse("<html>502</html>".into()).state, RunState::Unknown);
        assert_eq!(StatusSnapshot::parse("{}".into()).state, RunState::Unknown);
    }

    #[test]
    fn test_terminal_state_is_sticky() {
        let mut record = RunRecord::new("run_1");
        assert!(record.observe(&StatusSnapshot::parse(r#"{"state":"RUNNING"}"#.into())));
        assert!(!record.observe(&StatusSnapshot::unknown(String::new())));
        assert_eq!(record.state, RunState::Running);

        assert!(record.observe(&StatusSnapshot::parse(r#"{"state":"FAILED"}"#.into())));
        assert!(!record.observe(&StatusSnapshot::parse(r#"{"state":"RUNNING"}"#.into())));
        assert_eq!(record.state, RunState::Failed);
        assert!(record.result.is_none());
    }

    #[test]
    fn test_request_serializes_snake_case() {
        let request = RunRequest::smoke_default();
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["tool_id"], "enrichr_pathway");
        assert_eq!(json["inputs"]["genes"][1], "BRCA1");
        assert_eq!(json["resources"]["cpu"], 1);
        assert_eq!(json["resources"]["memory_gb"], 1.0);
    }

    #[test]
    fn test_request_check_rejects_bad_shapes() {
        assert!(RunRequest::smoke_default().check().is_ok());

        let mut empty_tool = RunRequest::smoke_default();
        empty_tool.tool_id = " ".into();
        assert!(matches!(empty_tool.check(), Err(StackError::Configuration(_))));

        let mut no_memory = RunRequest::smoke_default();
        no_memory.resources.memory_gb = 0.0;
        assert!(no_memory.check().is_err());
    }
}
