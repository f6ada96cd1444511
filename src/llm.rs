//! Generation Adapter
//!
//! The seam between the iteration controller and the language model. The
//! model's reply is mapped onto a tagged action at this boundary; anything
//! that cannot be mapped is a generation failure handled by the controller's
//! retry budget, never a silently-accepted empty action.

use crate::config::LlmConfig;
use crate::error::{AgentError, Result};
use crate::prompts::PromptBuilder;
use crate::session::{Session, Turn};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// Maximum sample rows per turn carried back into the prompt
const SAMPLE_ROWS_PER_TURN: usize = 5;
/// How many recent turns are rendered into the prompt
const CONTEXT_TURNS: usize = 3;

/// One prior turn as seen by the model
#[derive(Debug, Clone, Serialize)]
pub struct TurnContext {
    pub iteration: u32,
    pub sql: Option<String>,
    pub row_count: Option<usize>,
    pub sample_rows: Vec<HashMap<String, Value>>,
    pub error: Option<String>,
}

/// Serialized conversation context handed to the generation adapter
#[derive(Debug, Clone, Serialize)]
pub struct PromptContext {
    pub question: String,
    pub turns: Vec<TurnContext>,
    pub error_feedback: Option<String>,
    pub answer_directive: bool,
}

impl PromptContext {
    pub fn from_session(session: &Session, answer_directive: bool) -> Self {
        let skip = session.history.len().saturating_sub(CONTEXT_TURNS);
        let turns = session.history[skip..]
            .iter()
            .map(TurnContext::from_turn)
            .collect();
        Self {
            question: session.question.clone(),
            turns,
            error_feedback: session.last_error_feedback().map(|s| s.to_string()),
            answer_directive,
        }
    }
}

impl TurnContext {
    fn from_turn(turn: &Turn) -> Self {
        let result = turn.execution_result.as_ref();
        Self {
            iteration: turn.iteration,
            sql: turn.sql.clone(),
            row_count: result.map(|r| r.row_count),
            sample_rows: result
                .map(|r| r.rows.iter().take(SAMPLE_ROWS_PER_TURN).cloned().collect())
                .unwrap_or_default(),
            error: result.and_then(|r| r.error.clone()),
        }
    }
}

/// Tagged action extracted from the model reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GenerationAction {
    ExecuteSql { sql: String },
    Answer { text: String },
}

/// One structured generation step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationStep {
    pub thought: String,
    pub action: GenerationAction,
    /// Model's signal that nothing further is needed after this step
    pub is_final: bool,
}

impl GenerationStep {
    pub fn action_name(&self) -> &'static str {
        match self.action {
            GenerationAction::ExecuteSql { .. } => "execute_sql",
            GenerationAction::Answer { .. } => "answer",
        }
    }
}

/// External collaborator wrapping the language-model call
#[async_trait]
pub trait GenerationAdapter: Send + Sync {
    async fn generate(&self, context: &PromptContext) -> Result<GenerationStep>;
}

/// Parse the model reply into a [`GenerationStep`].
///
/// Accepts the JSON object bare or inside a fenced code block; anything else
/// is a generation failure.
pub fn parse_generation_response(raw: &str) -> Result<GenerationStep> {
    let json_text = extract_json(raw)
        .ok_or_else(|| AgentError::Generation("no JSON object in model response".to_string()))?;
    let value: Value = serde_json::from_str(&json_text)
        .map_err(|e| AgentError::Generation(format!("model response is not valid JSON: {e}")))?;

    let thought = value
        .get("thought")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    let action_name = value
        .get("action")
        .and_then(Value::as_str)
        .ok_or_else(|| AgentError::Generation("model response has no action field".to_string()))?;

    let action = match action_name {
        "execute_sql" => {
            let sql = value
                .get("sql")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| {
                    AgentError::Generation("action is execute_sql but sql is missing".to_string())
                })?;
            GenerationAction::ExecuteSql {
                sql: sql.to_string(),
            }
        }
        "answer" => {
            let text = value
                .get("answer")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| {
                    AgentError::Generation("action is answer but answer is missing".to_string())
                })?;
            GenerationAction::Answer {
                text: text.to_string(),
            }
        }
        other => {
            return Err(AgentError::Generation(format!(
                "unknown action in model response: {other}"
            )))
        }
    };

    let is_final = value
        .get("is_final")
        .and_then(Value::as_bool)
        .unwrap_or(matches!(action, GenerationAction::Answer { .. }));

    Ok(GenerationStep {
        thought,
        action,
        is_final,
    })
}

fn extract_json(raw: &str) -> Option<String> {
    if let Some(fence_start) = raw.find("```json") {
        let body = &raw[fence_start + 7..];
        if let Some(fence_end) = body.find("```") {
            return Some(body[..fence_end].trim().to_string());
        }
    }
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    (end > start).then(|| raw[start..=end].to_string())
}

/// LLM client against an OpenAI-compatible chat completions endpoint
pub struct LlmClient {
    http: reqwest::Client,
    config: LlmConfig,
    prompts: PromptBuilder,
}

impl LlmClient {
    pub fn new(config: LlmConfig, prompts: PromptBuilder) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            prompts,
        }
    }
}

#[async_trait]
impl GenerationAdapter for LlmClient {
    async fn generate(&self, context: &PromptContext) -> Result<GenerationStep> {
        let body = serde_json::json!({
            "model": self.config.model,
            "messages": [
                {"role": "system", "content": self.prompts.system_prompt()},
                {"role": "user", "content": self.prompts.user_prompt(context)}
            ],
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens,
        });

        let response = self
            .http
            .post(format!("{}/chat/completions", self.config.base_url))
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| AgentError::Generation(format!("LLM API call failed: {e}")))?;

        let payload: Value = response
            .json()
            .await
            .map_err(|e| AgentError::Generation(format!("failed to read LLM response: {e}")))?;

        let content = payload["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| AgentError::Generation("no content in LLM response".to_string()))?;

        parse_generation_response(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_json() {
        let step = parse_generation_response(
            r#"{"thought": "count them", "action": "execute_sql", "sql": "SELECT COUNT(*) FROM employees", "is_final": false}"#,
        )
        .unwrap();
        assert_eq!(step.thought, "count them");
        assert!(!step.is_final);
        assert_eq!(
            step.action,
            GenerationAction::ExecuteSql {
                sql: "SELECT COUNT(*) FROM employees".to_string()
            }
        );
    }

    #[test]
    fn test_parse_fenced_json() {
        let raw = "Here you go:\n```json\n{\"action\": \"answer\", \"answer\": \"88 employees\"}\n```";
        let step = parse_generation_response(raw).unwrap();
        assert_eq!(
            step.action,
            GenerationAction::Answer {
                text: "88 employees".to_string()
            }
        );
        // answer defaults to final when the flag is missing
        assert!(step.is_final);
    }

    #[test]
    fn test_unknown_action_is_rejected() {
        let err = parse_generation_response(r#"{"action": "shrug"}"#).unwrap_err();
        assert!(err.to_string().contains("unknown action"));
    }

    #[test]
    fn test_execute_sql_without_sql_is_rejected() {
        assert!(parse_generation_response(r#"{"action": "execute_sql"}"#).is_err());
        assert!(parse_generation_response(r#"{"action": "execute_sql", "sql": "  "}"#).is_err());
    }

    #[test]
    fn test_non_json_is_rejected() {
        assert!(parse_generation_response("I could not decide what to do.").is_err());
    }

    #[test]
    fn test_prompt_context_takes_recent_turns() {
        use crate::session::{Session, Turn, TurnAction};
        let mut session = Session::new("q", 10);
        for i in 1..=5 {
            session.push_turn(Turn {
                iteration: i,
                thought: String::new(),
                action: TurnAction::ExecuteSql,
                sql: Some(format!("SELECT {i}")),
                execution_result: None,
                analysis: None,
                error_feedback: None,
                answer: None,
            });
        }
        let context = PromptContext::from_session(&session, false);
        assert_eq!(context.turns.len(), 3);
        assert_eq!(context.turns[0].iteration, 3);
        assert_eq!(context.turns[2].iteration, 5);
    }
}
