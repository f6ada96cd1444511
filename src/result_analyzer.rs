//! Result Analyzer
//!
//! Judges whether one query result is enough to answer the question, or the
//! agent must query again. Pure and deterministic: identical inputs always
//! produce an identical judgment, which is what makes session replay
//! reproducible.
//!
//! The continuation decision also carries the anti-truncation override: a
//! ranking question answered through a bare LIMIT is forced to continue even
//! when the model believes the result is complete, unless the row count shows
//! the tie boundary was already expanded.

use crate::session::ExecutionResult;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// Tagged anomaly raised on a result
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Anomaly {
    EmptyResultUnexpected,
    ExecutionError,
    NullProliferation,
    OutOfRangeValue,
    RankingTruncationRisk,
}

/// Sufficiency judgment for one execution result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// How completely the result answers the question, in [0, 1]
    pub completeness: f64,
    pub is_sufficient: bool,
    /// Forces another iteration even when the model signals completion
    pub needs_more_data: bool,
    pub anomalies: BTreeSet<Anomaly>,
    pub reasoning_tags: BTreeSet<String>,
    pub suggested_followup: Option<String>,
}

/// Lexical classification of the user question
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuestionKind {
    /// "has there ever been ...", "is there any ...": an empty result is an
    /// answer in itself
    Existence,
    /// "top N ...", superlatives, subject to the tie-boundary policy
    Ranking { n: usize },
    /// "how many ...", "total ..." (a literal value answer)
    Aggregate,
    General,
}

lazy_static! {
    static ref EXISTENCE_RE: Regex = Regex::new(
        r"(?i)\b(has there ever|have there ever been|have there been|is there (a|any)|are there any|was there (a|any)|were there any|any record of|does .{0,60} exist|do .{0,60} exist)\b"
    )
    .unwrap();
    static ref TOP_N_RE: Regex = Regex::new(r"(?i)\btop\s+(\d+)\b").unwrap();
    static ref TOP_WORD_RE: Regex = Regex::new(
        r"(?i)\btop\s+(one|two|three|four|five|six|seven|eight|nine|ten)\b"
    )
    .unwrap();
    static ref SUPERLATIVE_RE: Regex = Regex::new(
        r"(?i)\b(highest|largest|biggest|greatest|most|lowest|smallest|least|best|worst|earliest|latest)\b"
    )
    .unwrap();
    static ref AGGREGATE_RE: Regex =
        Regex::new(r"(?i)\b(how many|how much|number of|count|total|average|avg|sum|mean)\b")
            .unwrap();
    static ref LIMIT_RE: Regex = Regex::new(r"(?i)\blimit\s+(\d+)\b").unwrap();
    static ref TIE_GUARD_RE: Regex =
        Regex::new(r"(?i)with\s+ties|\brank\s*\(|\bdense_rank\s*\(").unwrap();
}

/// Classify a question by its lexical cues. Ranking takes precedence over
/// aggregate so "which 5 departments have the most employees" ranks.
pub fn classify_question(question: &str) -> QuestionKind {
    if EXISTENCE_RE.is_match(question) {
        return QuestionKind::Existence;
    }
    if let Some(caps) = TOP_N_RE.captures(question) {
        if let Ok(n) = caps[1].parse::<usize>() {
            return QuestionKind::Ranking { n: n.max(1) };
        }
    }
    if let Some(caps) = TOP_WORD_RE.captures(question) {
        let n = match caps[1].to_ascii_lowercase().as_str() {
            "one" => 1,
            "two" => 2,
            "three" => 3,
            "four" => 4,
            "five" => 5,
            "six" => 6,
            "seven" => 7,
            "eight" => 8,
            "nine" => 9,
            _ => 10,
        };
        return QuestionKind::Ranking { n };
    }
    if SUPERLATIVE_RE.is_match(question) {
        return QuestionKind::Ranking { n: 1 };
    }
    if AGGREGATE_RE.is_match(question) {
        return QuestionKind::Aggregate;
    }
    QuestionKind::General
}

/// Requested LIMIT in the SQL text, if any
pub fn parse_limit(sql: &str) -> Option<usize> {
    LIMIT_RE
        .captures(sql)
        .and_then(|caps| caps[1].parse().ok())
}

/// Column name substrings that mark a value as a currency/amount, which must
/// not be negative
const AMOUNT_COLUMN_HINTS: [&str; 7] = [
    "salary", "amount", "price", "cost", "revenue", "pay", "balance",
];

/// A configured valid range for columns whose name contains `column_pattern`
#[derive(Debug, Clone)]
pub struct ColumnRange {
    pub column_pattern: String,
    pub min: f64,
    pub max: f64,
}

#[derive(Debug, Clone)]
pub struct AnalyzerConfig {
    /// Completeness above this is required for sufficiency
    pub sufficiency_threshold: f64,
    /// Weight of the NULL-cell ratio in the completeness score
    pub null_ratio_weight: f64,
    /// NULL-cell ratio above this flags NullProliferation
    pub null_proliferation_ratio: f64,
    /// Completeness penalty per out-of-range column
    pub out_of_range_penalty: f64,
    pub column_ranges: Vec<ColumnRange>,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            sufficiency_threshold: 0.7,
            null_ratio_weight: 0.4,
            null_proliferation_ratio: 0.5,
            out_of_range_penalty: 0.2,
            column_ranges: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResultAnalyzer {
    config: AnalyzerConfig,
}

impl ResultAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        Self { config }
    }

    /// Analyze one execution result against the question and the SQL that
    /// produced it. Deterministic for identical inputs.
    pub fn analyze(&self, question: &str, sql: &str, result: &ExecutionResult) -> AnalysisResult {
        if !result.success {
            let mut anomalies = BTreeSet::new();
            anomalies.insert(Anomaly::ExecutionError);
            let mut tags = BTreeSet::new();
            tags.insert("execution_failed".to_string());
            return AnalysisResult {
                completeness: 0.0,
                is_sufficient: false,
                needs_more_data: true,
                anomalies,
                reasoning_tags: tags,
                suggested_followup: None,
            };
        }

        let kind = classify_question(question);

        if result.row_count == 0 {
            return self.analyze_empty(kind);
        }

        let mut anomalies = BTreeSet::new();
        let mut tags = BTreeSet::new();
        let mut followup = None;
        let mut forced_continuation = false;
        let mut completeness = 1.0_f64;

        // NULL density over all cells
        let total_cells = result.row_count * result.columns.len().max(1);
        let null_cells = count_null_cells(result);
        let null_ratio = null_cells as f64 / total_cells as f64;
        completeness -= null_ratio * self.config.null_ratio_weight;
        if null_ratio > self.config.null_proliferation_ratio {
            anomalies.insert(Anomaly::NullProliferation);
            tags.insert("null_heavy_result".to_string());
        } else if null_cells == 0 {
            tags.insert("no_nulls".to_string());
        }

        // Out-of-domain values
        let violating_columns = self.out_of_range_columns(result);
        if !violating_columns.is_empty() {
            anomalies.insert(Anomaly::OutOfRangeValue);
            completeness -= self.config.out_of_range_penalty * violating_columns.len() as f64;
            for column in &violating_columns {
                tags.insert(format!("out_of_range:{column}"));
            }
        }

        // Ranking-truncation override: a bare LIMIT on a ranking question can
        // cut off rows tied at the boundary, unless the returned row count
        // already exceeds the requested N.
        if let QuestionKind::Ranking { n } = kind {
            if let Some(limit) = parse_limit(sql) {
                if result.row_count > n {
                    tags.insert("ties_already_expanded".to_string());
                } else if !TIE_GUARD_RE.is_match(sql) {
                    anomalies.insert(Anomaly::RankingTruncationRisk);
                    tags.insert("limit_without_tie_check".to_string());
                    forced_continuation = true;
                    followup = Some(format!(
                        "LIMIT {limit} may cut off rows tied at rank {n}; re-run with a tie-aware \
                         ranking (RANK() or FETCH FIRST {n} ROWS WITH TIES), or without the limit."
                    ));
                }
            }
        }

        let completeness = completeness.clamp(0.0, 1.0);
        let is_sufficient = !forced_continuation && completeness > self.config.sufficiency_threshold;
        if is_sufficient {
            tags.insert("result_answers_question".to_string());
        }

        AnalysisResult {
            completeness,
            is_sufficient,
            needs_more_data: !is_sufficient,
            anomalies,
            reasoning_tags: tags,
            suggested_followup: followup,
        }
    }

    fn analyze_empty(&self, kind: QuestionKind) -> AnalysisResult {
        let mut anomalies = BTreeSet::new();
        let mut tags = BTreeSet::new();

        if kind == QuestionKind::Existence {
            // For existence questions an empty result is itself the answer.
            tags.insert("empty_result_confirms_absence".to_string());
            return AnalysisResult {
                completeness: 1.0,
                is_sufficient: true,
                needs_more_data: false,
                anomalies,
                reasoning_tags: tags,
                suggested_followup: None,
            };
        }

        anomalies.insert(Anomaly::EmptyResultUnexpected);
        tags.insert("empty_result".to_string());
        AnalysisResult {
            completeness: 0.3,
            is_sufficient: false,
            needs_more_data: true,
            anomalies,
            reasoning_tags: tags,
            suggested_followup: Some(
                "The query returned no rows; double-check the filter conditions and join keys."
                    .to_string(),
            ),
        }
    }

    fn out_of_range_columns(&self, result: &ExecutionResult) -> Vec<String> {
        let mut violating = Vec::new();
        for column in &result.columns {
            let lower = column.to_ascii_lowercase();
            let amount_like = AMOUNT_COLUMN_HINTS.iter().any(|hint| lower.contains(hint));
            let configured = self
                .config
                .column_ranges
                .iter()
                .find(|range| lower.contains(&range.column_pattern.to_ascii_lowercase()));

            if !amount_like && configured.is_none() {
                continue;
            }

            let out_of_range = result.rows.iter().any(|row| {
                let Some(value) = row.get(column).and_then(numeric_value) else {
                    return false;
                };
                if let Some(range) = configured {
                    value < range.min || value > range.max
                } else {
                    value < 0.0
                }
            });
            if out_of_range {
                violating.push(column.clone());
            }
        }
        violating.sort();
        violating
    }
}

fn count_null_cells(result: &ExecutionResult) -> usize {
    result
        .rows
        .iter()
        .map(|row| {
            result
                .columns
                .iter()
                .filter(|column| row.get(*column).map(Value::is_null).unwrap_or(true))
                .count()
        })
        .sum()
}

fn numeric_value(value: &Value) -> Option<f64> {
    value.as_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn result_with_rows(columns: &[&str], rows: Vec<Vec<Value>>) -> ExecutionResult {
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
        ExecutionResult::success(data, columns.iter().map(|c| c.to_string()).collect(), 5)
    }

    #[test]
    fn test_analysis_is_deterministic() {
        let analyzer = ResultAnalyzer::default();
        let result = result_with_rows(
            &["name", "salary"],
            vec![
                vec![json!("alice"), json!(90000)],
                vec![json!("bob"), Value::Null],
            ],
        );
        let first = analyzer.analyze("Who earns the most?", "SELECT name, salary FROM employees ORDER BY salary DESC LIMIT 1", &result);
        let second = analyzer.analyze("Who earns the most?", "SELECT name, salary FROM employees ORDER BY salary DESC LIMIT 1", &result);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn test_execution_failure_zeroes_completeness() {
        let analyzer = ResultAnalyzer::default();
        let result = ExecutionResult::failure("boom".to_string(), 1);
        let analysis = analyzer.analyze("How many employees?", "SELECT 1", &result);
        assert_eq!(analysis.completeness, 0.0);
        assert!(!analysis.is_sufficient);
        assert!(analysis.needs_more_data);
        assert!(analysis.anomalies.contains(&Anomaly::ExecutionError));
        assert!(analysis.suggested_followup.is_none());
    }

    #[test]
    fn test_empty_result_sufficient_for_existence_question() {
        let analyzer = ResultAnalyzer::default();
        let result = result_with_rows(&["id"], Vec::new());
        let analysis = analyzer.analyze(
            "Has there ever been a case of unpaid wages?",
            "SELECT id FROM payroll WHERE paid = false",
            &result,
        );
        assert!(analysis.is_sufficient);
        assert!(!analysis.needs_more_data);
        assert!(analysis.anomalies.is_empty());
    }

    #[test]
    fn test_empty_result_flagged_for_other_questions() {
        let analyzer = ResultAnalyzer::default();
        let result = result_with_rows(&["id"], Vec::new());
        let analysis = analyzer.analyze(
            "How many active employees?",
            "SELECT id FROM employees WHERE 1=0",
            &result,
        );
        assert!(!analysis.is_sufficient);
        assert!(analysis.anomalies.contains(&Anomaly::EmptyResultUnexpected));
        assert!(analysis.suggested_followup.is_some());
    }

    #[test]
    fn test_ranking_limit_without_ties_forces_continuation() {
        let analyzer = ResultAnalyzer::default();
        let rows = (0..10)
            .map(|i| vec![json!(format!("p{i}")), json!(100 - i)])
            .collect();
        let result = result_with_rows(&["name", "score"], rows);
        let analysis = analyzer.analyze(
            "Who are the top 10 performers?",
            "SELECT name, score FROM performance ORDER BY score DESC LIMIT 10",
            &result,
        );
        assert!(analysis.anomalies.contains(&Anomaly::RankingTruncationRisk));
        assert!(analysis.needs_more_data);
        assert!(!analysis.is_sufficient);
    }

    #[test]
    fn test_ranking_with_expanded_ties_is_sufficient() {
        let analyzer = ResultAnalyzer::default();
        // 11 rows back for a top-10 question: boundary tie already expanded
        let rows = (0..11)
            .map(|i| vec![json!(format!("p{i}")), json!(100 - i.min(9))])
            .collect();
        let result = result_with_rows(&["name", "score"], rows);
        let analysis = analyzer.analyze(
            "Who are the top 10 performers?",
            "SELECT name, score FROM performance ORDER BY score DESC LIMIT 11",
            &result,
        );
        assert!(!analysis.anomalies.contains(&Anomaly::RankingTruncationRisk));
        assert!(analysis.is_sufficient);
        assert!(analysis
            .reasoning_tags
            .contains("ties_already_expanded"));
    }

    #[test]
    fn test_tie_guarded_sql_is_not_flagged() {
        let analyzer = ResultAnalyzer::default();
        let rows = (0..10)
            .map(|i| vec![json!(format!("p{i}")), json!(100 - i)])
            .collect();
        let result = result_with_rows(&["name", "score"], rows);
        let analysis = analyzer.analyze(
            "Who are the top 10 performers?",
            "SELECT name, score FROM performance ORDER BY score DESC FETCH FIRST 10 ROWS WITH TIES LIMIT 10",
            &result,
        );
        assert!(!analysis.anomalies.contains(&Anomaly::RankingTruncationRisk));
    }

    #[test]
    fn test_negative_amount_flags_out_of_range() {
        let analyzer = ResultAnalyzer::default();
        let result = result_with_rows(
            &["name", "salary"],
            vec![vec![json!("alice"), json!(-100)]],
        );
        let analysis = analyzer.analyze(
            "What is the average salary?",
            "SELECT name, salary FROM employees",
            &result,
        );
        assert!(analysis.anomalies.contains(&Anomaly::OutOfRangeValue));
        assert!(analysis.reasoning_tags.contains("out_of_range:salary"));
    }

    #[test]
    fn test_configured_range_flags_level_codes() {
        let analyzer = ResultAnalyzer::new(AnalyzerConfig {
            column_ranges: vec![ColumnRange {
                column_pattern: "level".to_string(),
                min: 1.0,
                max: 10.0,
            }],
            ..AnalyzerConfig::default()
        });
        let result = result_with_rows(&["name", "level"], vec![vec![json!("bob"), json!(42)]]);
        let analysis = analyzer.analyze("List employees", "SELECT name, level FROM employees", &result);
        assert!(analysis.anomalies.contains(&Anomaly::OutOfRangeValue));
    }

    #[test]
    fn test_null_proliferation_lowers_completeness() {
        let analyzer = ResultAnalyzer::default();
        let result = result_with_rows(
            &["a", "b"],
            vec![
                vec![Value::Null, Value::Null],
                vec![Value::Null, json!(1)],
            ],
        );
        let analysis = analyzer.analyze("List values", "SELECT a, b FROM t", &result);
        assert!(analysis.anomalies.contains(&Anomaly::NullProliferation));
        assert!(analysis.completeness < 1.0);
    }

    #[test]
    fn test_clean_aggregate_is_sufficient() {
        let analyzer = ResultAnalyzer::default();
        let result = result_with_rows(&["count"], vec![vec![json!(88)]]);
        let analysis = analyzer.analyze(
            "How many active employees?",
            "SELECT COUNT(*) AS count FROM employees WHERE leave_date IS NULL",
            &result,
        );
        assert!(analysis.is_sufficient);
        assert!(!analysis.needs_more_data);
        assert!(analysis.completeness > 0.9);
    }

    #[test]
    fn test_question_classification() {
        assert_eq!(
            classify_question("How many active employees?"),
            QuestionKind::Aggregate
        );
        assert_eq!(
            classify_question("Who are the top 10 salespeople?"),
            QuestionKind::Ranking { n: 10 }
        );
        assert_eq!(
            classify_question("Which department has the most employees?"),
            QuestionKind::Ranking { n: 1 }
        );
        assert_eq!(
            classify_question("Top five vendors by spend"),
            QuestionKind::Ranking { n: 5 }
        );
        assert_eq!(
            classify_question("Has there ever been a late payroll run?"),
            QuestionKind::Existence
        );
        assert_eq!(
            classify_question("Show the org chart"),
            QuestionKind::General
        );
    }
}
