//! Query Executor
//!
//! External collaborator wrapping the read-only SQL engine. The Postgres
//! implementation shares one pool across sessions (read-only credentials),
//! but every execution runs single-flight on its own connection under a
//! server-side statement timeout and a row-count ceiling.

use crate::config::DatabaseConfig;
use crate::error::Result;
use crate::session::ExecutionResult;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Row, TypeInfo};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Execute one validated SQL statement. Engine faults come back as an
    /// unsuccessful [`ExecutionResult`], not an `Err`; `Err` is reserved for
    /// infrastructure failures (pool exhausted, connection lost).
    async fn execute(&self, sql: &str) -> Result<ExecutionResult>;

    async fn test_connection(&self) -> Result<()>;
}

pub struct PostgresExecutor {
    pool: PgPool,
    max_rows: usize,
    statement_timeout: Duration,
}

impl PostgresExecutor {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&config.url)
            .await?;
        Ok(Self {
            pool,
            max_rows: config.max_rows,
            statement_timeout: Duration::from_secs(config.statement_timeout_secs),
        })
    }
}

#[async_trait]
impl QueryExecutor for PostgresExecutor {
    async fn execute(&self, sql: &str) -> Result<ExecutionResult> {
        let started = Instant::now();
        let mut conn = self.pool.acquire().await?;

        // Bound the statement server-side so a cancelled session never leaves
        // a runaway query behind.
        sqlx::query(&format!(
            "SET statement_timeout = {}",
            self.statement_timeout.as_millis()
        ))
        .execute(&mut *conn)
        .await?;

        debug!("executing query: {}", sql);
        match sqlx::query(sql).fetch_all(&mut *conn).await {
            Ok(mut rows) => {
                if rows.len() > self.max_rows {
                    warn!(
                        returned = rows.len(),
                        max = self.max_rows,
                        "result exceeds row ceiling, truncating"
                    );
                    rows.truncate(self.max_rows);
                }
                let columns: Vec<String> = rows
                    .first()
                    .map(|row| {
                        row.columns()
                            .iter()
                            .map(|column| column.name().to_string())
                            .collect()
                    })
                    .unwrap_or_default();
                let data = rows.iter().map(row_to_json).collect::<Result<Vec<_>>>()?;
                Ok(ExecutionResult::success(
                    data,
                    columns,
                    started.elapsed().as_millis() as u64,
                ))
            }
            Err(error) => Ok(ExecutionResult::failure(
                format_db_error(&error, self.statement_timeout),
                started.elapsed().as_millis() as u64,
            )),
        }
    }

    async fn test_connection(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn row_to_json(row: &PgRow) -> Result<HashMap<String, Value>> {
    let mut record = HashMap::with_capacity(row.columns().len());
    for (index, column) in row.columns().iter().enumerate() {
        let value = column_value(row, index, column.type_info().name())?;
        record.insert(column.name().to_string(), value);
    }
    Ok(record)
}

fn column_value(row: &PgRow, index: usize, type_name: &str) -> Result<Value> {
    let value = match type_name {
        "INT2" => row.try_get::<Option<i16>, _>(index)?.map(Value::from),
        "INT4" => row.try_get::<Option<i32>, _>(index)?.map(Value::from),
        "INT8" => row.try_get::<Option<i64>, _>(index)?.map(Value::from),
        "FLOAT4" => row
            .try_get::<Option<f32>, _>(index)?
            .map(|v| float_value(v as f64)),
        "FLOAT8" => row.try_get::<Option<f64>, _>(index)?.map(float_value),
        "NUMERIC" => row
            .try_get::<Option<Decimal>, _>(index)?
            .map(decimal_value),
        "BOOL" => row.try_get::<Option<bool>, _>(index)?.map(Value::from),
        "DATE" => row
            .try_get::<Option<NaiveDate>, _>(index)?
            .map(|v| Value::from(v.to_string())),
        "TIME" => row
            .try_get::<Option<NaiveTime>, _>(index)?
            .map(|v| Value::from(v.to_string())),
        "TIMESTAMP" => row
            .try_get::<Option<NaiveDateTime>, _>(index)?
            .map(|v| Value::from(v.to_string())),
        "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(index)?
            .map(|v| Value::from(v.to_rfc3339())),
        "UUID" => row
            .try_get::<Option<uuid::Uuid>, _>(index)?
            .map(|v| Value::from(v.to_string())),
        "JSON" | "JSONB" => row.try_get::<Option<Value>, _>(index)?,
        // TEXT, VARCHAR, CHAR, NAME and anything unrecognized
        _ => row
            .try_get::<Option<String>, _>(index)
            .unwrap_or(None)
            .map(Value::from),
    };
    Ok(value.unwrap_or(Value::Null))
}

fn float_value(value: f64) -> Value {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn decimal_value(value: Decimal) -> Value {
    value
        .to_f64()
        .and_then(serde_json::Number::from_f64)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(value.to_string()))
}

fn format_db_error(error: &sqlx::Error, timeout: Duration) -> String {
    let message = error.to_string();
    let lower = message.to_lowercase();
    if lower.contains("syntax error") {
        format!("SQL syntax error: {message}")
    } else if lower.contains("does not exist") {
        format!("Missing table or column: {message}")
    } else if lower.contains("permission denied") {
        format!("Permission denied: {message}")
    } else if lower.contains("canceling statement") || lower.contains("timeout") {
        format!("Query timed out after {}s: {message}", timeout.as_secs())
    } else {
        format!("Database error: {message}")
    }
}
