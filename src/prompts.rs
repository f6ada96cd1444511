//! Prompts
//!
//! System prompt template for the ReAct loop and the builder that assembles
//! the per-turn conversation context. Schema and few-shot examples are
//! immutable configuration loaded once and passed into the generation
//! adapter, so concurrent sessions never share mutable prompt state.

use crate::error::Result;
use crate::llm::PromptContext;
use chrono::Local;
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// System prompt driving the think -> act -> observe loop.
///
/// Placeholders: `{schema}`, `{examples}`, `{current_date}`.
pub const REACT_SYSTEM_PROMPT: &str = r#"You are a data analyst agent that answers business questions by querying a read-only PostgreSQL database.

## How you work

You operate in iterations. Each iteration you either run one SQL query to gather data, or give the final answer once the gathered data is enough.

1. Think: reason about what data the question needs and what the previous results showed.
2. Act: either execute one SQL query, or answer.
3. Observe: the query result (or error) is fed back to you on the next iteration.

## SQL rules

- Exactly ONE statement per iteration, starting with SELECT or WITH.
- Never use data- or schema-modifying statements (INSERT, UPDATE, DELETE, DROP, ALTER, CREATE, TRUNCATE, GRANT, REVOKE). They are rejected before execution.
- For "top N" questions, ties matter: a bare LIMIT N can cut off rows tied with the Nth row. Prefer RANK() or FETCH FIRST N ROWS WITH TIES, or verify the boundary value separately.
- Answers must only state facts present in query results. Never invent numbers.

## Current date

{current_date}

## Database schema

{schema}

## Examples

{examples}

## Output format

Reply with ONLY a JSON object, no other text:

{
  "thought": "your reasoning for this step",
  "action": "execute_sql" or "answer",
  "sql": "the SQL statement (when action is execute_sql)",
  "answer": "the final answer (when action is answer)",
  "is_final": true when nothing further is needed after this step
}
"#;

/// Assembles system and user prompts from immutable schema/example text.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    schema: String,
    examples: String,
}

impl PromptBuilder {
    pub fn new(schema: impl Into<String>, examples: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            examples: examples.into(),
        }
    }

    /// Load `schema.txt` and `examples.txt` from a prompts directory.
    pub fn from_dir(dir: &Path) -> Result<Self> {
        let schema = fs::read_to_string(dir.join("schema.txt"))?;
        let examples = fs::read_to_string(dir.join("examples.txt"))?;
        Ok(Self::new(schema, examples))
    }

    pub fn system_prompt(&self) -> String {
        let today = Local::now();
        let date_info = format!(
            "Today is {} ({}).",
            today.format("%Y-%m-%d"),
            today.format("%A")
        );
        REACT_SYSTEM_PROMPT
            .replace("{current_date}", &date_info)
            .replace("{schema}", &self.schema)
            .replace("{examples}", &self.examples)
    }

    /// Render the per-turn user message: the question, the recent query
    /// history with sampled rows, pending error feedback, and the answer
    /// directive once the analyzer judged the data sufficient.
    pub fn user_prompt(&self, context: &PromptContext) -> String {
        let mut sections = Vec::new();
        sections.push(format!("## Question\n{}", context.question));

        if !context.turns.is_empty() {
            sections.push("## Previous queries".to_string());
            for turn in &context.turns {
                let mut block = format!("### Iteration {}", turn.iteration);
                if let Some(sql) = &turn.sql {
                    block.push_str(&format!("\nSQL: {sql}"));
                }
                match &turn.error {
                    Some(error) => block.push_str(&format!("\nFailed: {error}")),
                    None => {
                        if let Some(row_count) = turn.row_count {
                            block.push_str(&format!("\nRows returned: {row_count}"));
                        }
                        if !turn.sample_rows.is_empty() {
                            block.push_str(&format!(
                                "\nSample rows: {}",
                                render_sample(&turn.sample_rows)
                            ));
                        }
                    }
                }
                sections.push(block);
            }
        }

        if let Some(feedback) = &context.error_feedback {
            sections.push(format!("## Feedback on the last attempt\n{feedback}"));
        }

        if context.answer_directive {
            sections.push(
                "## Directive\nThe data gathered so far is sufficient. Respond now with \
                 action \"answer\", using only values from the results above."
                    .to_string(),
            );
        }

        sections.join("\n\n")
    }
}

fn render_sample(rows: &[HashMap<String, Value>]) -> String {
    serde_json::to_string(rows).unwrap_or_else(|_| "[]".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::TurnContext;

    #[test]
    fn test_system_prompt_fills_placeholders() {
        let builder = PromptBuilder::new("TABLE employees(...)", "Q: how many? A: ...");
        let prompt = builder.system_prompt();
        assert!(prompt.contains("TABLE employees(...)"));
        assert!(prompt.contains("Q: how many?"));
        assert!(!prompt.contains("{schema}"));
        assert!(!prompt.contains("{examples}"));
        assert!(!prompt.contains("{current_date}"));
    }

    #[test]
    fn test_user_prompt_carries_feedback_and_directive() {
        let builder = PromptBuilder::new("", "");
        let context = PromptContext {
            question: "How many employees?".to_string(),
            turns: vec![TurnContext {
                iteration: 1,
                sql: Some("SELECT COUNT(*) FROM employee".to_string()),
                row_count: None,
                sample_rows: Vec::new(),
                error: Some("relation \"employee\" does not exist".to_string()),
            }],
            error_feedback: Some("use table employees".to_string()),
            answer_directive: true,
        };
        let prompt = builder.user_prompt(&context);
        assert!(prompt.contains("How many employees?"));
        assert!(prompt.contains("relation \"employee\" does not exist"));
        assert!(prompt.contains("use table employees"));
        assert!(prompt.contains("action \"answer\""));
    }
}
