//! Session State
//!
//! One session is the lifetime of a single user question: an append-only
//! history of turns plus the terminal answer. Sessions are owned exclusively
//! by the iteration controller and discarded once the caller reads the
//! outcome; nothing here is shared across sessions.

use crate::result_analyzer::AnalysisResult;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Answered,
    Failed,
    Exhausted,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Running => "running",
            SessionStatus::Answered => "answered",
            SessionStatus::Failed => "failed",
            SessionStatus::Exhausted => "exhausted",
        }
    }
}

/// Action the model chose for a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnAction {
    ExecuteSql,
    Answer,
}

/// Result of one SQL execution, as produced by the executor adapter.
/// Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub rows: Vec<HashMap<String, Value>>,
    pub columns: Vec<String>,
    pub row_count: usize,
    pub error: Option<String>,
    pub execution_time_ms: u64,
}

impl ExecutionResult {
    pub fn success(
        rows: Vec<HashMap<String, Value>>,
        columns: Vec<String>,
        execution_time_ms: u64,
    ) -> Self {
        let row_count = rows.len();
        Self {
            success: true,
            rows,
            columns,
            row_count,
            error: None,
            execution_time_ms,
        }
    }

    pub fn failure(error: String, execution_time_ms: u64) -> Self {
        Self {
            success: false,
            rows: Vec::new(),
            columns: Vec::new(),
            row_count: 0,
            error: Some(error),
            execution_time_ms,
        }
    }
}

/// Record of one iteration. Immutable once appended to the history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub iteration: u32,
    pub thought: String,
    pub action: TurnAction,
    pub sql: Option<String>,
    pub execution_result: Option<ExecutionResult>,
    pub analysis: Option<AnalysisResult>,
    /// Feedback carried into the next turn's prompt after a rejection or
    /// execution failure
    pub error_feedback: Option<String>,
    pub answer: Option<String>,
}

/// State for one user question's lifetime
#[derive(Debug, Clone)]
pub struct Session {
    pub question: String,
    pub iteration_count: u32,
    pub max_iterations: u32,
    pub history: Vec<Turn>,
    pub terminal_answer: Option<String>,
    pub status: SessionStatus,
    pub degraded: bool,
}

impl Session {
    pub fn new(question: &str, max_iterations: u32) -> Self {
        Self {
            question: question.to_string(),
            iteration_count: 0,
            max_iterations,
            history: Vec::new(),
            terminal_answer: None,
            status: SessionStatus::Running,
            degraded: false,
        }
    }

    /// Append a completed turn. The history is append-only.
    pub fn push_turn(&mut self, turn: Turn) {
        self.history.push(turn);
    }

    /// Error feedback from the most recent turn, if any
    pub fn last_error_feedback(&self) -> Option<&str> {
        self.history
            .last()
            .and_then(|turn| turn.error_feedback.as_deref())
    }

    /// Whether any turn so far executed successfully
    pub fn has_successful_result(&self) -> bool {
        self.history.iter().any(|turn| {
            turn.execution_result
                .as_ref()
                .map(|result| result.success)
                .unwrap_or(false)
        })
    }
}

/// Caller-facing outcome of one query
#[derive(Debug, Clone, Serialize)]
pub struct QueryOutcome {
    pub answer: String,
    pub iterations: u32,
    pub status: SessionStatus,
    pub degraded: bool,
    pub history: Vec<Turn>,
}

impl QueryOutcome {
    pub fn from_session(session: Session) -> Self {
        Self {
            answer: session
                .terminal_answer
                .unwrap_or_else(|| "Sorry, this question could not be answered.".to_string()),
            iterations: session.iteration_count,
            status: session.status,
            degraded: session.degraded,
            history: session.history,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_is_append_only() {
        let mut session = Session::new("How many employees?", 5);
        assert_eq!(session.history.len(), 0);

        session.push_turn(Turn {
            iteration: 1,
            thought: "count employees".to_string(),
            action: TurnAction::ExecuteSql,
            sql: Some("SELECT COUNT(*) FROM employees".to_string()),
            execution_result: None,
            analysis: None,
            error_feedback: Some("rejected".to_string()),
            answer: None,
        });

        assert_eq!(session.history.len(), 1);
        assert_eq!(session.last_error_feedback(), Some("rejected"));
        assert!(!session.has_successful_result());
    }

    #[test]
    fn test_execution_result_constructors() {
        let ok = ExecutionResult::success(Vec::new(), Vec::new(), 12);
        assert!(ok.success);
        assert_eq!(ok.row_count, 0);
        assert!(ok.error.is_none());

        let failed = ExecutionResult::failure("relation missing".to_string(), 3);
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some("relation missing"));
    }

    #[test]
    fn test_outcome_defaults_answer_when_none_set() {
        let session = Session::new("q", 5);
        let outcome = QueryOutcome::from_session(session);
        assert!(!outcome.answer.is_empty());
        assert_eq!(outcome.status, SessionStatus::Running);
    }
}
