//! Configuration
//!
//! Env-driven configuration for the LLM endpoint, the database and the agent
//! loop. Loaded once at startup and passed into constructors explicitly so
//! concurrent sessions never share mutable state.

use crate::error::{AgentError, Result};
use std::env;

/// LLM endpoint configuration (OpenAI-compatible chat completions API)
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    /// Low temperature keeps SQL generation deterministic
    pub temperature: f64,
    pub max_tokens: u32,
}

impl LlmConfig {
    pub fn new(api_key: String) -> Self {
        Self {
            api_key,
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4".to_string(),
            temperature: 0.1,
            max_tokens: 4096,
        }
    }

    /// Load from environment variables.
    ///
    /// Required: `OPENAI_API_KEY`. Optional: `OPENAI_BASE_URL`, `OPENAI_MODEL`.
    pub fn from_env() -> Result<Self> {
        let api_key = env::var("OPENAI_API_KEY")
            .map_err(|_| AgentError::Config("missing required env var: OPENAI_API_KEY".to_string()))?;

        let mut config = Self::new(api_key);
        if let Ok(base_url) = env::var("OPENAI_BASE_URL") {
            config.base_url = base_url;
        }
        if let Ok(model) = env::var("OPENAI_MODEL") {
            config.model = model;
        }
        Ok(config)
    }
}

/// Database connection configuration
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Postgres connection URL
    pub url: String,
    pub max_connections: u32,
    /// Server-side statement timeout per query (seconds)
    pub statement_timeout_secs: u64,
    /// Row-count ceiling per query result
    pub max_rows: usize,
}

impl DatabaseConfig {
    pub fn new(url: String) -> Self {
        Self {
            url,
            max_connections: 5,
            statement_timeout_secs: 30,
            max_rows: 1000,
        }
    }

    /// Load from environment variables.
    ///
    /// Either `DATABASE_URL`, or the component form `DB_HOST`, `DB_PORT`
    /// (default 5432), `DB_NAME`, `DB_USER`, `DB_PASSWORD`. Optional:
    /// `SQL_TIMEOUT` (seconds), `MAX_RESULT_ROWS`.
    pub fn from_env() -> Result<Self> {
        let url = match env::var("DATABASE_URL") {
            Ok(url) => url,
            Err(_) => Self::url_from_parts()?,
        };

        let mut config = Self::new(url);
        if let Ok(timeout) = env::var("SQL_TIMEOUT") {
            config.statement_timeout_secs = timeout
                .parse()
                .map_err(|_| AgentError::Config(format!("invalid SQL_TIMEOUT: {timeout}")))?;
        }
        if let Ok(max_rows) = env::var("MAX_RESULT_ROWS") {
            config.max_rows = max_rows
                .parse()
                .map_err(|_| AgentError::Config(format!("invalid MAX_RESULT_ROWS: {max_rows}")))?;
        }
        Ok(config)
    }

    fn url_from_parts() -> Result<String> {
        let mut missing = Vec::new();
        let host = env::var("DB_HOST").unwrap_or_else(|_| {
            missing.push("DB_HOST");
            String::new()
        });
        let database = env::var("DB_NAME").unwrap_or_else(|_| {
            missing.push("DB_NAME");
            String::new()
        });
        let user = env::var("DB_USER").unwrap_or_else(|_| {
            missing.push("DB_USER");
            String::new()
        });
        let password = env::var("DB_PASSWORD").unwrap_or_else(|_| {
            missing.push("DB_PASSWORD");
            String::new()
        });
        if !missing.is_empty() {
            return Err(AgentError::Config(format!(
                "missing required env vars: {}",
                missing.join(", ")
            )));
        }
        let port = env::var("DB_PORT").unwrap_or_else(|_| "5432".to_string());
        Ok(format!("postgres://{user}:{password}@{host}:{port}/{database}"))
    }
}

/// Agent loop configuration
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Hard iteration ceiling for one session
    pub max_iterations: u32,
    /// Retry budget for failed/unparseable generation calls
    pub generation_retries: u32,
    /// Base backoff between generation retries (multiplied by attempt number)
    pub retry_backoff_ms: u64,
    pub generation_timeout_secs: u64,
    pub execution_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            generation_retries: 3,
            retry_backoff_ms: 500,
            generation_timeout_secs: 60,
            execution_timeout_secs: 30,
        }
    }
}

impl AgentConfig {
    /// Load from environment variables, falling back to defaults.
    ///
    /// Optional: `MAX_ITERATIONS`, `GENERATION_RETRIES`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(max) = env::var("MAX_ITERATIONS").ok().and_then(|v| v.parse().ok()) {
            config.max_iterations = max;
        }
        if let Some(retries) = env::var("GENERATION_RETRIES").ok().and_then(|v| v.parse().ok()) {
            config.generation_retries = retries;
        }
        config
    }
}
