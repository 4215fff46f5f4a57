//! Domain error types.

use chrono::NaiveDate;

/// A parse error with position information for trigger condition parsing.
#[derive(Debug, Clone, thiserror::Error)]
#[error("parse error at position {position}: {message}")]
pub struct ParseError {
    pub message: String,
    pub position: usize,
}

impl ParseError {
    /// Format the error with a caret pointing at the error position in the input.
    pub fn display_with_context(&self, input: &str) -> String {
        let caret = " ".repeat(self.position) + "^";
        format!(
            "{input}\n{caret}\n{err}",
            input = input,
            caret = caret,
            err = self
        )
    }
}

/// Top-level error type for rsrank.
#[derive(Debug, thiserror::Error)]
pub enum RsrankError {
    #[error("database error: {reason}")]
    Database { reason: String },

    #[error("database query error: {reason}")]
    DatabaseQuery { reason: String },

    #[error("config parse error in {file}: {reason}")]
    ConfigParse { file: String, reason: String },

    #[error("missing config key [{section}] {key}")]
    ConfigMissing { section: String, key: String },

    #[error("invalid config value [{section}] {key}: {reason}")]
    ConfigInvalid {
        section: String,
        key: String,
        reason: String,
    },

    #[error(transparent)]
    RuleParse(#[from] ParseError),

    #[error("invalid trigger rule {name}: {reason}")]
    RuleInvalid { name: String, reason: String },

    #[error("no data: {what}")]
    NoData { what: String },

    #[error("full rebuild required for {table} (watermark {watermark}): {reason}")]
    RebuildRequired {
        table: String,
        watermark: NaiveDate,
        reason: String,
    },

    #[error("watermark for {table} moved during the run (expected version {expected}, found {found})")]
    WatermarkConflict {
        table: String,
        expected: i64,
        found: i64,
    },

    #[error("import error in {file}: {reason}")]
    Import { file: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<&RsrankError> for std::process::ExitCode {
    fn from(err: &RsrankError) -> Self {
        let code: u8 = match err {
            RsrankError::Io(_) => 1,
            RsrankError::ConfigParse { .. }
            | RsrankError::ConfigMissing { .. }
            | RsrankError::ConfigInvalid { .. } => 2,
            RsrankError::Database { .. } | RsrankError::DatabaseQuery { .. } => 3,
            RsrankError::RuleParse(_) | RsrankError::RuleInvalid { .. } => 4,
            RsrankError::NoData { .. } => 5,
            RsrankError::RebuildRequired { .. } | RsrankError::WatermarkConflict { .. } => 6,
            RsrankError::Import { .. } => 7,
        };
        std::process::ExitCode::from(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_error_context_points_at_position() {
        let err = ParseError {
            message: "expected operator".into(),
            position: 10,
        };
        let rendered = err.display_with_context("return_5d 10");
        let lines: Vec<&str> = rendered.lines().collect();
        assert_eq!(lines[0], "return_5d 10");
        assert_eq!(lines[1], "          ^");
        assert!(lines[2].contains("expected operator"));
    }

    #[test]
    fn rebuild_required_message_names_table() {
        let err = RsrankError::RebuildRequired {
            table: "ranks".into(),
            watermark: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            reason: "watermark date has no price bars".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("ranks"));
        assert!(msg.contains("2024-03-01"));
    }
}
