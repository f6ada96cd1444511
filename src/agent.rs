//! Iteration Controller
//!
//! The ReAct loop driving one session: ask the model for a structured step,
//! route SQL through the safety validator and the executor, judge the result,
//! then loop, force-continue, or terminate with an answer. Every failure mode
//! is a typed outcome routed back into the next prompt; the only fatal path
//! is an exhausted generation retry budget.

use crate::config::AgentConfig;
use crate::error::{AgentError, Result};
use crate::executor::QueryExecutor;
use crate::llm::{GenerationAction, GenerationAdapter, GenerationStep, PromptContext};
use crate::result_analyzer::ResultAnalyzer;
use crate::session::{
    ExecutionResult, QueryOutcome, Session, SessionStatus, Turn, TurnAction,
};
use crate::sql_validator::{self, Verdict};
use crate::synthesizer;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// One event per turn transition, emitted in controller order
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Start {
        question: String,
    },
    IterationStart {
        iteration: u32,
    },
    Thought {
        iteration: u32,
        thought: String,
    },
    Action {
        iteration: u32,
        action: String,
    },
    SqlExecuting {
        iteration: u32,
        sql: String,
    },
    SqlResult {
        iteration: u32,
        success: bool,
        row_count: usize,
        error: Option<String>,
    },
    AnalyzingResult {
        iteration: u32,
    },
    Answer {
        iteration: u32,
        answer: String,
    },
    Error {
        iteration: u32,
        error: String,
    },
    Final {
        success: bool,
        answer: String,
        iterations: u32,
        status: SessionStatus,
        degraded: bool,
    },
}

/// The agent: stateless across queries, safe to share across concurrent
/// sessions. All per-question state lives in the [`Session`] built inside
/// each call.
pub struct Agent {
    generation: Arc<dyn GenerationAdapter>,
    executor: Arc<dyn QueryExecutor>,
    analyzer: ResultAnalyzer,
    config: AgentConfig,
}

impl Agent {
    pub fn new(
        generation: Arc<dyn GenerationAdapter>,
        executor: Arc<dyn QueryExecutor>,
        config: AgentConfig,
    ) -> Self {
        Self {
            generation,
            executor,
            analyzer: ResultAnalyzer::default(),
            config,
        }
    }

    pub fn with_analyzer(mut self, analyzer: ResultAnalyzer) -> Self {
        self.analyzer = analyzer;
        self
    }

    /// Run one question to completion.
    pub async fn run_query(&self, question: &str) -> Result<QueryOutcome> {
        self.drive(question, None).await
    }

    /// Run one question, emitting an [`AgentEvent`] per turn transition.
    /// Dropping the receiver cancels the session.
    pub async fn run_query_stream(
        &self,
        question: &str,
        events: mpsc::Sender<AgentEvent>,
    ) -> Result<QueryOutcome> {
        self.drive(question, Some(events)).await
    }

    async fn drive(
        &self,
        question: &str,
        events: Option<mpsc::Sender<AgentEvent>>,
    ) -> Result<QueryOutcome> {
        let session_id = Uuid::new_v4();
        let mut session = Session::new(question, self.config.max_iterations);
        let mut answer_directive = false;

        info!(%session_id, question, "session started");
        self.emit(
            &events,
            AgentEvent::Start {
                question: question.to_string(),
            },
        )
        .await?;

        while session.iteration_count < session.max_iterations {
            session.iteration_count += 1;
            let iteration = session.iteration_count;
            info!(%session_id, iteration, "iteration started");
            self.emit(&events, AgentEvent::IterationStart { iteration }).await?;

            let context = PromptContext::from_session(&session, answer_directive);
            let step = match self.generate_with_retry(&context).await {
                Ok(step) => step,
                Err(e) => {
                    error!(%session_id, iteration, error = %e, "generation budget exhausted");
                    self.emit(
                        &events,
                        AgentEvent::Error {
                            iteration,
                            error: e.to_string(),
                        },
                    )
                    .await?;
                    session.status = SessionStatus::Failed;
                    session.terminal_answer = Some(format!("Query failed: {e}"));
                    break;
                }
            };

            debug!(%session_id, iteration, thought = %step.thought, action = step.action_name());
            self.emit(
                &events,
                AgentEvent::Thought {
                    iteration,
                    thought: step.thought.clone(),
                },
            )
            .await?;
            self.emit(
                &events,
                AgentEvent::Action {
                    iteration,
                    action: step.action_name().to_string(),
                },
            )
            .await?;

            match &step.action {
                GenerationAction::ExecuteSql { sql } => {
                    let rejection = match sql_validator::validate(sql) {
                        Verdict::Accept => None,
                        Verdict::Reject(rejection) => Some(rejection),
                    };
                    if let Some(rejection) = rejection {
                        warn!(%session_id, iteration, reason = %rejection.message, "SQL rejected");
                        self.emit(
                            &events,
                            AgentEvent::Error {
                                iteration,
                                error: rejection.message.clone(),
                            },
                        )
                        .await?;
                        session.push_turn(Turn {
                            iteration,
                            thought: step.thought.clone(),
                            action: TurnAction::ExecuteSql,
                            sql: Some(sql.clone()),
                            execution_result: None,
                            analysis: None,
                            error_feedback: Some(rejection.feedback(sql)),
                            answer: None,
                        });
                        answer_directive = false;
                        continue;
                    }

                    self.emit(
                        &events,
                        AgentEvent::SqlExecuting {
                            iteration,
                            sql: sql.clone(),
                        },
                    )
                    .await?;
                    let result = self.execute_bounded(sql).await;
                    self.emit(
                        &events,
                        AgentEvent::SqlResult {
                            iteration,
                            success: result.success,
                            row_count: result.row_count,
                            error: result.error.clone(),
                        },
                    )
                    .await?;

                    if !result.success {
                        let error_text = result.error.clone().unwrap_or_default();
                        let analysis = sql_validator::analyze_execution_error(&error_text);
                        warn!(
                            %session_id, iteration,
                            class = %analysis.class,
                            error = %error_text,
                            "execution failed"
                        );
                        let judgment = self.analyzer.analyze(question, sql, &result);
                        session.push_turn(Turn {
                            iteration,
                            thought: step.thought.clone(),
                            action: TurnAction::ExecuteSql,
                            sql: Some(sql.clone()),
                            execution_result: Some(result),
                            analysis: Some(judgment),
                            error_feedback: Some(analysis.feedback(sql, &error_text)),
                            answer: None,
                        });
                        answer_directive = false;
                        continue;
                    }

                    info!(
                        %session_id, iteration,
                        rows = result.row_count,
                        elapsed_ms = result.execution_time_ms,
                        "execution succeeded"
                    );
                    self.emit(&events, AgentEvent::AnalyzingResult { iteration }).await?;
                    let judgment = self.analyzer.analyze(question, sql, &result);
                    debug!(
                        %session_id, iteration,
                        completeness = judgment.completeness,
                        sufficient = judgment.is_sufficient,
                        "result analyzed"
                    );
                    let sufficient = judgment.is_sufficient;
                    let forced = judgment.needs_more_data;
                    session.push_turn(Turn {
                        iteration,
                        thought: step.thought.clone(),
                        action: TurnAction::ExecuteSql,
                        sql: Some(sql.clone()),
                        execution_result: Some(result),
                        analysis: Some(judgment),
                        error_feedback: None,
                        answer: None,
                    });

                    if forced {
                        // The analyzer outranks an optimistic model signal;
                        // this is what stops premature tie truncation.
                        if step.is_final {
                            info!(%session_id, iteration, "analyzer overrides model completion signal");
                        }
                        answer_directive = false;
                        continue;
                    }

                    if sufficient && step.is_final {
                        let answer = synthesizer::synthesize(question, &session.history, None);
                        self.emit(
                            &events,
                            AgentEvent::Answer {
                                iteration,
                                answer: answer.clone(),
                            },
                        )
                        .await?;
                        session.terminal_answer = Some(answer);
                        session.status = SessionStatus::Answered;
                        break;
                    }

                    if sufficient {
                        // Tell the model to answer from the gathered data on
                        // the next turn rather than fabricating one here.
                        answer_directive = true;
                    }
                }

                GenerationAction::Answer { text } => {
                    let answer =
                        synthesizer::synthesize(question, &session.history, Some(text.as_str()));
                    self.emit(
                        &events,
                        AgentEvent::Answer {
                            iteration,
                            answer: answer.clone(),
                        },
                    )
                    .await?;
                    session.push_turn(Turn {
                        iteration,
                        thought: step.thought.clone(),
                        action: TurnAction::Answer,
                        sql: None,
                        execution_result: None,
                        analysis: None,
                        error_feedback: None,
                        answer: Some(text.clone()),
                    });
                    session.terminal_answer = Some(answer);
                    session.status = SessionStatus::Answered;
                    break;
                }
            }
        }

        if session.status == SessionStatus::Running {
            // Iteration budget spent without an accepted answer: degrade
            // instead of failing, over whatever history exists.
            session.status = SessionStatus::Exhausted;
            warn!(%session_id, iterations = session.iteration_count, "iteration budget exhausted");
            let answer = synthesizer::synthesize_best_effort(question, &session.history);
            self.emit(
                &events,
                AgentEvent::Answer {
                    iteration: session.iteration_count,
                    answer: answer.clone(),
                },
            )
            .await?;
            session.terminal_answer = Some(answer);
            session.degraded = true;
            session.status = SessionStatus::Answered;
        }

        info!(
            %session_id,
            status = session.status.as_str(),
            iterations = session.iteration_count,
            degraded = session.degraded,
            "session finished"
        );
        let outcome = QueryOutcome::from_session(session);
        self.emit(
            &events,
            AgentEvent::Final {
                success: outcome.status == SessionStatus::Answered,
                answer: outcome.answer.clone(),
                iterations: outcome.iterations,
                status: outcome.status,
                degraded: outcome.degraded,
            },
        )
        .await?;
        Ok(outcome)
    }

    /// Invoke the generation adapter under a timeout, retrying with backoff
    /// up to the configured budget.
    async fn generate_with_retry(&self, context: &PromptContext) -> Result<GenerationStep> {
        let timeout = Duration::from_secs(self.config.generation_timeout_secs);
        let mut last_error = None;

        for attempt in 1..=self.config.generation_retries {
            match tokio::time::timeout(timeout, self.generation.generate(context)).await {
                Ok(Ok(step)) => return Ok(step),
                Ok(Err(e)) => {
                    warn!(attempt, error = %e, "generation attempt failed");
                    last_error = Some(e);
                }
                Err(_) => {
                    warn!(attempt, "generation timed out");
                    last_error = Some(AgentError::Generation(format!(
                        "generation timed out after {}s",
                        timeout.as_secs()
                    )));
                }
            }
            if attempt < self.config.generation_retries {
                tokio::time::sleep(Duration::from_millis(
                    self.config.retry_backoff_ms * u64::from(attempt),
                ))
                .await;
            }
        }

        Err(last_error
            .unwrap_or_else(|| AgentError::Generation("generation retry budget is zero".to_string())))
    }

    /// Invoke the executor under a timeout; every failure mode becomes an
    /// unsuccessful result routed through the error-feedback path.
    async fn execute_bounded(&self, sql: &str) -> ExecutionResult {
        let timeout = Duration::from_secs(self.config.execution_timeout_secs);
        match tokio::time::timeout(timeout, self.executor.execute(sql)).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => ExecutionResult::failure(e.to_string(), 0),
            Err(_) => ExecutionResult::failure(
                format!("Query timed out after {}s", timeout.as_secs()),
                timeout.as_millis() as u64,
            ),
        }
    }

    async fn emit(
        &self,
        events: &Option<mpsc::Sender<AgentEvent>>,
        event: AgentEvent,
    ) -> Result<()> {
        if let Some(sender) = events {
            if sender.send(event).await.is_err() {
                // Receiver gone: the caller disconnected. Abandon the session
                // without touching any other session's state.
                warn!("event receiver dropped, cancelling session");
                return Err(AgentError::Cancelled);
            }
        }
        Ok(())
    }
}
