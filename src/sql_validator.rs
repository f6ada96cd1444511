//! SQL Safety Validator
//!
//! Pure pre-execution classification of generated SQL: exactly one read-only
//! statement, no mutating keywords anywhere (including inside CTEs and
//! subqueries). A rejection is never fatal to the session; the reason is fed
//! back into the next generation turn.
//!
//! Also classifies execution errors reported by the engine into a taxonomy
//! with a concrete fix strategy, so the next turn gets a diagnosis instead of
//! a raw error string.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Keywords that mutate data or schema. Rejected as standalone tokens in any
/// position, which covers mutation hidden inside a CTE or subquery.
const FORBIDDEN_KEYWORDS: [&str; 9] = [
    "DROP", "DELETE", "UPDATE", "INSERT", "ALTER", "TRUNCATE", "GRANT", "REVOKE", "CREATE",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    EmptyStatement,
    NotReadOnly,
    ForbiddenKeyword,
    MultipleStatements,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub kind: RejectionKind,
    pub message: String,
    pub suggestion: String,
}

impl Rejection {
    fn new(kind: RejectionKind, message: String, suggestion: &str) -> Self {
        Self {
            kind,
            message,
            suggestion: suggestion.to_string(),
        }
    }

    /// Feedback block carried into the next generation turn
    pub fn feedback(&self, sql: &str) -> String {
        format!(
            "The generated SQL did not pass the safety check.\n\
             SQL: {sql}\n\
             Reason: {}\n\
             Fix: {}\n\
             Regenerate a single read-only SELECT (or WITH ... SELECT) statement.",
            self.message, self.suggestion
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept,
    Reject(Rejection),
}

impl Verdict {
    pub fn is_accept(&self) -> bool {
        matches!(self, Verdict::Accept)
    }
}

/// Validate one SQL statement. Pure; no side effects.
pub fn validate(sql: &str) -> Verdict {
    // String literals and comments are blanked out first so keywords inside
    // them never trigger a rejection, and separators inside them never count
    // as statement boundaries.
    let cleaned = strip_literals_and_comments(sql);

    let tokens: Vec<String> = cleaned
        .split(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .filter(|t| !t.is_empty())
        .map(|t| t.to_ascii_uppercase())
        .collect();

    let Some(first) = tokens.first() else {
        return Verdict::Reject(Rejection::new(
            RejectionKind::EmptyStatement,
            "the SQL statement is empty".to_string(),
            "Generate a complete SELECT query",
        ));
    };

    if first != "SELECT" && first != "WITH" {
        return Verdict::Reject(Rejection::new(
            RejectionKind::NotReadOnly,
            format!("only SELECT queries (or WITH ... SELECT) are allowed, statement starts with {first}"),
            "Start the statement with SELECT, or with WITH when a CTE is needed",
        ));
    }

    for token in &tokens {
        if FORBIDDEN_KEYWORDS.contains(&token.as_str()) {
            return Verdict::Reject(Rejection::new(
                RejectionKind::ForbiddenKeyword,
                format!("forbidden keyword detected: {token}"),
                "Remove every data- or schema-mutating clause; the query must be read-only",
            ));
        }
    }

    // More than one non-empty statement separated by `;` (a single trailing
    // semicolon is fine).
    let statements = cleaned
        .split(';')
        .filter(|part| !part.trim().is_empty())
        .count();
    if statements > 1 {
        return Verdict::Reject(Rejection::new(
            RejectionKind::MultipleStatements,
            "multiple SQL statements are not allowed".to_string(),
            "Send exactly one statement; combine steps with a CTE if needed",
        ));
    }

    Verdict::Accept
}

/// Replace the contents of string literals, quoted identifiers and comments
/// with spaces, preserving everything else.
fn strip_literals_and_comments(sql: &str) -> String {
    #[derive(PartialEq)]
    enum State {
        Normal,
        SingleQuote,
        DoubleQuote,
        LineComment,
        BlockComment,
    }

    let mut out = String::with_capacity(sql.len());
    let mut state = State::Normal;
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        match state {
            State::Normal => match c {
                '\'' => {
                    state = State::SingleQuote;
                    out.push(' ');
                }
                '"' => {
                    state = State::DoubleQuote;
                    out.push(' ');
                }
                '-' if chars.peek() == Some(&'-') => {
                    chars.next();
                    state = State::LineComment;
                    out.push(' ');
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    state = State::BlockComment;
                    out.push(' ');
                }
                _ => out.push(c),
            },
            State::SingleQuote => {
                out.push(' ');
                if c == '\'' {
                    // '' is an escaped quote inside the literal
                    if chars.peek() == Some(&'\'') {
                        chars.next();
                        out.push(' ');
                    } else {
                        state = State::Normal;
                    }
                }
            }
            State::DoubleQuote => {
                out.push(' ');
                if c == '"' {
                    state = State::Normal;
                }
            }
            State::LineComment => {
                if c == '\n' {
                    state = State::Normal;
                    out.push('\n');
                } else {
                    out.push(' ');
                }
            }
            State::BlockComment => {
                out.push(' ');
                if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    out.push(' ');
                    state = State::Normal;
                }
            }
        }
    }

    out
}

/// Taxonomy of execution errors reported by the query engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlErrorClass {
    TableNotFound,
    ColumnNotFound,
    SyntaxError,
    GroupByError,
    SetReturningFunctionMisuse,
    Timeout,
    PermissionDenied,
    Unknown,
}

impl fmt::Display for SqlErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SqlErrorClass::TableNotFound => "table_not_found",
            SqlErrorClass::ColumnNotFound => "column_not_found",
            SqlErrorClass::SyntaxError => "syntax_error",
            SqlErrorClass::GroupByError => "group_by_error",
            SqlErrorClass::SetReturningFunctionMisuse => "set_returning_function_misuse",
            SqlErrorClass::Timeout => "timeout",
            SqlErrorClass::PermissionDenied => "permission_denied",
            SqlErrorClass::Unknown => "unknown",
        };
        write!(f, "{name}")
    }
}

/// Diagnosis of an execution failure, fed back into the next turn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorAnalysis {
    pub class: SqlErrorClass,
    pub diagnosis: String,
    pub fix_strategy: String,
    pub next_step: String,
}

impl ErrorAnalysis {
    /// Feedback block carried into the next generation turn
    pub fn feedback(&self, sql: &str, error: &str) -> String {
        format!(
            "The previous query failed.\n\
             SQL: {sql}\n\
             Error: {error}\n\
             Diagnosis: {}\n\
             Fix strategy: {}\n\
             {}",
            self.diagnosis, self.fix_strategy, self.next_step
        )
    }
}

lazy_static! {
    static ref RELATION_RE: Regex = Regex::new(r#"relation "([^"]+)" does not exist"#).unwrap();
    static ref COLUMN_RE: Regex = Regex::new(r#"column "?([A-Za-z_][\w.]*)"? does not exist"#).unwrap();
}

/// Classify an execution error into the taxonomy with a fix strategy.
pub fn analyze_execution_error(error_message: &str) -> ErrorAnalysis {
    let lower = error_message.to_lowercase();

    if lower.contains("set-returning functions are not allowed") {
        return ErrorAnalysis {
            class: SqlErrorClass::SetReturningFunctionMisuse,
            diagnosis: "a set-returning function was used directly in a WHERE or HAVING clause"
                .to_string(),
            fix_strategy: "move the set-returning function into a CTE (WITH clause) or the FROM clause and reference its output".to_string(),
            next_step: "Regenerate the SQL with the function moved into a CTE.".to_string(),
        };
    }

    if let Some(caps) = RELATION_RE.captures(error_message) {
        let table = &caps[1];
        return ErrorAnalysis {
            class: SqlErrorClass::TableNotFound,
            diagnosis: format!("table \"{table}\" does not exist"),
            fix_strategy: "check the schema description and use an existing table name".to_string(),
            next_step: format!("Regenerate the SQL with a valid table name (currently: {table})."),
        };
    }

    if let Some(caps) = COLUMN_RE.captures(error_message) {
        let column = &caps[1];
        return ErrorAnalysis {
            class: SqlErrorClass::ColumnNotFound,
            diagnosis: format!("column \"{column}\" does not exist"),
            fix_strategy: "check the table structure in the schema description and use an existing column".to_string(),
            next_step: format!("Regenerate the SQL with a valid column name (currently: {column})."),
        };
    }

    if lower.contains("must appear in the group by") {
        return ErrorAnalysis {
            class: SqlErrorClass::GroupByError,
            diagnosis: "a non-aggregated column in SELECT is missing from GROUP BY".to_string(),
            fix_strategy: "add every non-aggregated column to GROUP BY, or wrap it in an aggregate function".to_string(),
            next_step: "Regenerate the SQL with a consistent GROUP BY clause.".to_string(),
        };
    }

    if lower.contains("syntax error") {
        return ErrorAnalysis {
            class: SqlErrorClass::SyntaxError,
            diagnosis: "the statement does not parse".to_string(),
            fix_strategy: "check keyword spelling, parenthesis matching and comma placement".to_string(),
            next_step: "Regenerate syntactically valid SQL.".to_string(),
        };
    }

    if lower.contains("canceling statement") || lower.contains("timed out") || lower.contains("timeout") {
        return ErrorAnalysis {
            class: SqlErrorClass::Timeout,
            diagnosis: "the query exceeded the statement timeout".to_string(),
            fix_strategy: "narrow the query: add filters, reduce joined tables, or aggregate earlier".to_string(),
            next_step: "Regenerate a cheaper query.".to_string(),
        };
    }

    if lower.contains("permission denied") {
        return ErrorAnalysis {
            class: SqlErrorClass::PermissionDenied,
            diagnosis: "the connection role cannot read one of the referenced objects".to_string(),
            fix_strategy: "query only the tables listed in the schema description".to_string(),
            next_step: "Regenerate the SQL against the documented tables.".to_string(),
        };
    }

    ErrorAnalysis {
        class: SqlErrorClass::Unknown,
        diagnosis: "the query engine reported an error".to_string(),
        fix_strategy: "re-read the error message and adjust the query accordingly".to_string(),
        next_step: "Re-analyze the question and generate new SQL.".to_string(),
    }
}
