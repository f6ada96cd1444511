//! Answer Synthesizer
//!
//! Turns the accumulated history into the final natural-language answer.
//! Deterministic: no further SQL, no model call. The model's draft answer is
//! validated rather than trusted: any number that cannot be traced back to
//! executed rows discards the draft in favor of a computed summary, and
//! ranking answers are always recomputed so a tie at the boundary is never
//! truncated.

use crate::result_analyzer::{classify_question, QuestionKind};
use crate::session::{ExecutionResult, Turn};
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;
use std::collections::HashMap;

lazy_static! {
    static ref ORDER_BY_RE: Regex =
        Regex::new(r#"(?i)\border\s+by\s+"?([A-Za-z_][\w."]*)"?(?:\s+(asc|desc))?"#).unwrap();
    static ref DATE_RE: Regex = Regex::new(r"\d{4}-\d{2}-\d{2}").unwrap();
    static ref NUMBER_RE: Regex = Regex::new(r"\d[\d,]*(?:\.\d+)?").unwrap();
}

/// Synthesize the final answer from the history, optionally validating a
/// model-drafted answer.
pub fn synthesize(question: &str, history: &[Turn], draft: Option<&str>) -> String {
    let latest = latest_successful(history);
    let kind = classify_question(question);

    match (kind, latest) {
        // Ranking correctness is enforced here regardless of the draft.
        (QuestionKind::Ranking { n }, Some((sql, result))) if result.row_count > 0 => {
            render_ranking(result, sql, n)
        }
        (QuestionKind::Existence, Some((_, result))) if result.row_count == 0 => {
            "No, no matching records were found; the data shows no occurrence of this."
                .to_string()
        }
        (_, Some((sql, result))) => match draft {
            Some(text) if draft_is_traceable(text, question, result) => text.trim().to_string(),
            _ => render_rows(result, sql),
        },
        (_, None) => match draft {
            // A draft with no figures states no facts we could contradict.
            Some(text) if !NUMBER_RE.is_match(text) => text.trim().to_string(),
            _ => "Unable to determine an answer: no query completed successfully.".to_string(),
        },
    }
}

/// Best-effort answer after the iteration budget is exhausted, explicitly
/// labeled as partial.
pub fn synthesize_best_effort(question: &str, history: &[Turn]) -> String {
    if latest_successful(history).is_some() {
        format!(
            "Partial answer (iteration limit reached, not fully verified): {}",
            synthesize(question, history, None)
        )
    } else {
        "Unable to determine an answer within the iteration limit: no query completed successfully."
            .to_string()
    }
}

/// Most recent successful execution, preferring turns the analyzer judged
/// sufficient.
fn latest_successful(history: &[Turn]) -> Option<(&str, &ExecutionResult)> {
    let successful = |turn: &&Turn| {
        turn.execution_result
            .as_ref()
            .map(|result| result.success)
            .unwrap_or(false)
    };
    let sufficient = |turn: &&Turn| {
        turn.analysis
            .as_ref()
            .map(|analysis| analysis.is_sufficient)
            .unwrap_or(false)
    };

    history
        .iter()
        .rev()
        .find(|turn| successful(turn) && sufficient(turn))
        .or_else(|| history.iter().rev().find(successful))
        .map(|turn| {
            (
                turn.sql.as_deref().unwrap_or(""),
                turn.execution_result.as_ref().expect("checked above"),
            )
        })
}

/// Walk the ranked rows until `n` distinct rank positions are filled,
/// carrying every row tied at the boundary value.
fn render_ranking(result: &ExecutionResult, sql: &str, n: usize) -> String {
    let metric_column = match ranking_metric_column(result, sql) {
        Some(column) => column,
        None => return render_rows(result, sql),
    };
    let descending = ORDER_BY_RE
        .captures(sql)
        .and_then(|caps| caps.get(2))
        .map(|dir| !dir.as_str().eq_ignore_ascii_case("asc"))
        .unwrap_or(true);

    let mut rows: Vec<&HashMap<String, Value>> = result.rows.iter().collect();
    rows.sort_by(|a, b| {
        let left = metric_of(a, &metric_column);
        let right = metric_of(b, &metric_column);
        let ordering = left.partial_cmp(&right).unwrap_or(std::cmp::Ordering::Equal);
        if descending {
            ordering.reverse()
        } else {
            ordering
        }
    });

    let label_column = result
        .columns
        .iter()
        .find(|column| **column != metric_column)
        .unwrap_or(&metric_column)
        .clone();

    let mut lines = Vec::new();
    let mut positions = 0usize;
    let mut boundary_value: Option<f64> = None;
    for row in rows {
        let value = metric_of(row, &metric_column);
        let new_position = boundary_value.map_or(true, |previous| previous != value);
        if new_position {
            if positions == n {
                break;
            }
            positions += 1;
            boundary_value = Some(value);
        }
        lines.push(format!(
            "{positions}. {}: {}",
            display_value(row.get(&label_column).unwrap_or(&Value::Null)),
            display_value(row.get(&metric_column).unwrap_or(&Value::Null)),
        ));
    }

    let tie_note = if lines.len() > n {
        format!(" ({} rows, including ties at the boundary)", lines.len())
    } else {
        String::new()
    };

    format!(
        "Top {n} by {metric_column}{tie_note}:\n{}",
        lines.join("\n")
    )
}

/// Ranking metric: the ORDER BY column when it survives into the result set,
/// otherwise the last numeric column.
fn ranking_metric_column(result: &ExecutionResult, sql: &str) -> Option<String> {
    if let Some(caps) = ORDER_BY_RE.captures(sql) {
        let raw = caps[1].trim_matches('"');
        let unqualified = raw.rsplit('.').next().unwrap_or(raw);
        if let Some(column) = result
            .columns
            .iter()
            .find(|column| column.eq_ignore_ascii_case(unqualified))
        {
            if is_numeric_column(result, column) {
                return Some(column.clone());
            }
        }
    }
    result
        .columns
        .iter()
        .rev()
        .find(|column| is_numeric_column(result, column))
        .cloned()
}

fn is_numeric_column(result: &ExecutionResult, column: &str) -> bool {
    result
        .rows
        .iter()
        .filter_map(|row| row.get(column))
        .any(|value| value.is_number())
}

fn metric_of(row: &HashMap<String, Value>, column: &str) -> f64 {
    row.get(column)
        .and_then(Value::as_f64)
        .unwrap_or(f64::NEG_INFINITY)
}

/// Literal rendering of the result rows, with any date range the SQL
/// referenced for context.
fn render_rows(result: &ExecutionResult, sql: &str) -> String {
    let period = date_context(sql);

    if result.row_count == 0 {
        return format!("The query returned no rows{period}.");
    }

    // Fast path for a lone COUNT-style value.
    if result.row_count == 1 && result.columns.len() == 1 {
        let column = &result.columns[0];
        if column.to_ascii_lowercase().contains("count") {
            if let Some(value) = result.rows[0].get(column).and_then(Value::as_f64) {
                return format!("There are {} matching records{period}.", value as i64);
            }
        }
    }

    if result.row_count == 1 {
        let row = &result.rows[0];
        let parts: Vec<String> = result
            .columns
            .iter()
            .filter_map(|column| {
                row.get(column)
                    .filter(|value| !value.is_null())
                    .map(|value| format!("{column} = {}", display_value(value)))
            })
            .collect();
        return format!("Result{period}: {}.", parts.join(", "));
    }

    let shown = result.rows.len().min(10);
    let mut lines = Vec::with_capacity(shown + 1);
    lines.push(format!(
        "The query returned {} rows{period}{}:",
        result.row_count,
        if result.row_count > shown {
            format!(", showing the first {shown}")
        } else {
            String::new()
        }
    ));
    for (index, row) in result.rows.iter().take(shown).enumerate() {
        let parts: Vec<String> = result
            .columns
            .iter()
            .filter_map(|column| {
                row.get(column)
                    .filter(|value| !value.is_null())
                    .map(|value| format!("{column}: {}", display_value(value)))
            })
            .collect();
        lines.push(format!("{}. {}", index + 1, parts.join(", ")));
    }
    lines.join("\n")
}

fn date_context(sql: &str) -> String {
    let dates: Vec<&str> = DATE_RE.find_iter(sql).map(|m| m.as_str()).collect();
    match dates.as_slice() {
        [] => String::new(),
        [single] => format!(" (as of {single})"),
        [first, .., last] => format!(" (covering {first} to {last})"),
    }
}

/// Every number in the draft must be traceable to the executed rows, the row
/// count, or the question itself; otherwise the draft is discarded.
fn draft_is_traceable(draft: &str, question: &str, result: &ExecutionResult) -> bool {
    let mut traceable: Vec<String> = Vec::new();
    traceable.push(result.row_count.to_string());
    for token in NUMBER_RE.find_iter(question) {
        traceable.push(token.as_str().replace(',', ""));
    }
    for row in &result.rows {
        for value in row.values() {
            match value {
                Value::Number(number) => {
                    traceable.push(number.to_string());
                    if let Some(float) = number.as_f64() {
                        if float.fract() == 0.0 {
                            traceable.push(format!("{}", float as i64));
                        }
                    }
                }
                Value::String(text) => {
                    for token in NUMBER_RE.find_iter(text) {
                        traceable.push(token.as_str().to_string());
                    }
                }
                _ => {}
            }
        }
    }

    NUMBER_RE.find_iter(draft).all(|token| {
        let needle = token.as_str().replace(',', "");
        traceable.iter().any(|known| *known == needle)
    })
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Null => "NULL".to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::TurnAction;
    use serde_json::json;

    fn turn_with_result(sql: &str, columns: &[&str], rows: Vec<Vec<Value>>) -> Turn {
        let data = rows
            .into_iter()
            .map(|values| {
                columns
                    .iter()
                    .map(|c| c.to_string())
                    .zip(values)
                    .collect::<HashMap<_, _>>()
            })
            .collect();
        Turn {
            iteration: 1,
            thought: String::new(),
            action: TurnAction::ExecuteSql,
            sql: Some(sql.to_string()),
            execution_result: Some(ExecutionResult::success(
                data,
                columns.iter().map(|c| c.to_string()).collect(),
                3,
            )),
            analysis: None,
            error_feedback: None,
            answer: None,
        }
    }

    fn sales_rows(values: &[(&str, i64)]) -> Vec<Vec<Value>> {
        values
            .iter()
            .map(|(name, sales)| vec![json!(name), json!(sales)])
            .collect()
    }

    #[test]
    fn test_tie_boundary_includes_all_tied_rows() {
        // 9 distinct leaders, then two rows sharing rank 10's value
        let mut values: Vec<(&str, i64)> = vec![
            ("amara", 100),
            ("blake", 95),
            ("carlos", 90),
            ("diana", 85),
            ("elif", 80),
            ("farid", 75),
            ("grace", 70),
            ("hana", 65),
            ("ivan", 60),
            ("jorge", 55),
            ("karim", 55),
        ];
        values.reverse(); // synthesizer must sort, not trust input order
        let history = vec![turn_with_result(
            "SELECT name, total_sales FROM sales ORDER BY total_sales DESC",
            &["name", "total_sales"],
            sales_rows(&values),
        )];

        let answer = synthesize("Who are the top 10 salespeople?", &history, None);
        for (name, _) in &values {
            assert!(answer.contains(name), "missing {name} in: {answer}");
        }
        assert!(answer.lines().count() >= 11);
    }

    #[test]
    fn test_ranking_does_not_collapse_to_first_tied_group() {
        let history = vec![turn_with_result(
            "SELECT name, score FROM t ORDER BY score DESC",
            &["name", "score"],
            sales_rows(&[("ada", 10), ("ben", 10), ("cal", 5), ("dee", 5), ("eli", 4)]),
        )];
        let answer = synthesize("Top 2 by score?", &history, None);
        // two distinct rank positions: both tied pairs, but not the 5th row
        for name in ["ada", "ben", "cal", "dee"] {
            assert!(answer.contains(name), "missing {name} in: {answer}");
        }
        assert!(!answer.contains("eli"), "rank 3 leaked into: {answer}");
    }

    #[test]
    fn test_ranking_respects_ascending_order() {
        let history = vec![turn_with_result(
            "SELECT name, errors FROM t ORDER BY errors ASC",
            &["name", "errors"],
            sales_rows(&[("amy", 9), ("bo", 1), ("cy", 4)]),
        )];
        let answer = synthesize("Which employee has the lowest error count?", &history, None);
        assert!(answer.lines().nth(1).unwrap().contains("bo"));
    }

    #[test]
    fn test_existence_question_states_negative_finding() {
        let history = vec![turn_with_result(
            "SELECT id FROM payroll WHERE paid = false",
            &["id"],
            Vec::new(),
        )];
        let answer = synthesize("Has there ever been an unpaid payroll run?", &history, None);
        assert!(answer.starts_with("No"));
    }

    #[test]
    fn test_count_fast_path() {
        let history = vec![turn_with_result(
            "SELECT COUNT(*) AS count FROM employees WHERE leave_date IS NULL",
            &["count"],
            vec![vec![json!(88)]],
        )];
        let answer = synthesize("How many active employees?", &history, None);
        assert!(answer.contains("88"));
    }

    #[test]
    fn test_traceable_draft_is_kept() {
        let history = vec![turn_with_result(
            "SELECT COUNT(*) AS count FROM employees",
            &["count"],
            vec![vec![json!(88)]],
        )];
        let draft = "The company currently has 88 active employees.";
        let answer = synthesize("How many active employees?", &history, Some(draft));
        assert_eq!(answer, draft);
    }

    #[test]
    fn test_untraceable_draft_is_discarded() {
        let history = vec![turn_with_result(
            "SELECT COUNT(*) AS count FROM employees",
            &["count"],
            vec![vec![json!(88)]],
        )];
        let answer = synthesize(
            "How many active employees?",
            &history,
            Some("There are 97 active employees."),
        );
        assert!(!answer.contains("97"));
        assert!(answer.contains("88"));
    }

    #[test]
    fn test_date_context_from_sql() {
        let history = vec![turn_with_result(
            "SELECT SUM(amount) AS total FROM orders WHERE order_date BETWEEN '2024-01-01' AND '2024-12-31'",
            &["total"],
            vec![vec![json!(123456.5)]],
        )];
        let answer = synthesize("What was the total order amount last year?", &history, None);
        assert!(answer.contains("2024-01-01"));
        assert!(answer.contains("2024-12-31"));
    }

    #[test]
    fn test_best_effort_is_labeled_partial() {
        let history = vec![turn_with_result(
            "SELECT COUNT(*) AS count FROM employees",
            &["count"],
            vec![vec![json!(42)]],
        )];
        let answer = synthesize_best_effort("How many employees?", &history);
        assert!(answer.starts_with("Partial answer"));
        assert!(answer.contains("42"));
    }

    #[test]
    fn test_best_effort_without_data() {
        let answer = synthesize_best_effort("How many employees?", &[]);
        assert!(answer.contains("Unable to determine"));
    }
}
