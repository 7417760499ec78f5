//! Failure classification for simulation and broadcast diagnostics
//!
//! Maps node error text and program log lines onto the pipeline's error
//! taxonomy. Rules are checked in a fixed order and the first match wins;
//! anything unmatched becomes the stage's generic kind with the diagnostic
//! attached.

use crate::pipeline::errors::{excerpt_logs, ErrorKind, OperationError, Stage};
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

/// Aggregator program whose custom error 6001 is "slippage tolerance exceeded"
pub const JUPITER_PROGRAM_ID: &str = "JUP6LkbZbjS1jKKwapdHNy74zcZ3tLUZoi5QNyVTaV4";
const JUPITER_SLIPPAGE_CODE: u64 = 6001;

/// SPL token programs; custom error 1 is `TokenError::InsufficientFunds`
const TOKEN_PROGRAM_IDS: &[&str] = &[
    "TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA",
    "TokenzQdBNbLqP5VEhdkAS6EPFLC1PHnBqCXEpPxuEb",
];
const TOKEN_INSUFFICIENT_FUNDS_CODE: u64 = 1;

static PROGRAM_FAILURE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"Program (\w+) failed: custom program error: 0x([0-9a-fA-F]+)")
        .expect("valid regex")
});

static SLIPPAGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)slippage|SlippageToleranceExceeded|price impact|minimum out(put)? not (met|reached)")
        .expect("valid regex")
});

static INSUFFICIENT_BALANCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)insufficient (funds|lamports|balance)|InsufficientFundsForFee|InsufficientFundsForRent",
    )
    .expect("valid regex")
});

static RECENCY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)blockhash not found|BlockhashNotFound|block height exceeded|TransactionExpired")
        .expect("valid regex")
});

static TRANSIENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b429\b|too many requests|rate limit|timed out|timeout|connection (reset|refused|closed)|service unavailable|\b50[234]\b|node is behind|unhealthy",
    )
    .expect("valid regex")
});

/// Outcome of matching a diagnostic against the known patterns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Slippage,
    InsufficientBalance,
    ExpiredRecency,
    Transient,
    Unknown,
}

/// Custom program errors reported in log lines, as (program id, code)
pub fn program_errors(logs: &[String]) -> Vec<(String, u64)> {
    logs.iter()
        .filter_map(|line| {
            let caps = PROGRAM_FAILURE.captures(line)?;
            let code = u64::from_str_radix(&caps[2], 16).ok()?;
            Some((caps[1].to_string(), code))
        })
        .collect()
}

/// Match diagnostic text and logs against the known failure patterns
pub fn classify(diagnostic: &str, logs: &[String]) -> FailureClass {
    let codes = program_errors(logs);
    let text_matches =
        |re: &Regex| re.is_match(diagnostic) || logs.iter().any(|line| re.is_match(line));

    if text_matches(&SLIPPAGE)
        || codes
            .iter()
            .any(|(program, code)| program == JUPITER_PROGRAM_ID && *code == JUPITER_SLIPPAGE_CODE)
    {
        return FailureClass::Slippage;
    }
    if text_matches(&INSUFFICIENT_BALANCE)
        || codes.iter().any(|(program, code)| {
            TOKEN_PROGRAM_IDS.contains(&program.as_str()) && *code == TOKEN_INSUFFICIENT_FUNDS_CODE
        })
    {
        return FailureClass::InsufficientBalance;
    }
    if RECENCY.is_match(diagnostic) {
        return FailureClass::ExpiredRecency;
    }
    if TRANSIENT.is_match(diagnostic) {
        return FailureClass::Transient;
    }
    FailureClass::Unknown
}

/// Translate a simulation or broadcast failure into exactly one error kind
pub fn classify_failure(stage: Stage, diagnostic: &str, logs: &[String]) -> OperationError {
    let class = classify(diagnostic, logs);
    let generic = match stage {
        Stage::Simulate => ErrorKind::SimulationFailed,
        _ => ErrorKind::BroadcastFailed,
    };

    let (kind, retryable) = match class {
        FailureClass::Slippage => (ErrorKind::SlippageExceeded, true),
        FailureClass::InsufficientBalance => (ErrorKind::InsufficientBalance, false),
        FailureClass::ExpiredRecency => (ErrorKind::InvalidRecencyToken, true),
        FailureClass::Transient => (generic, true),
        FailureClass::Unknown => (generic, false),
    };
    debug!(?class, %kind, %stage, "Classified failure");

    let mut excerpt = diagnostic.to_string();
    if !logs.is_empty() {
        excerpt.push('\n');
        excerpt.push_str(&excerpt_logs(logs));
    }

    OperationError::new(kind, stage, first_line(diagnostic))
        .with_retryable(retryable)
        .with_logs(excerpt)
}

fn first_line(text: &str) -> String {
    let line = text.lines().next().unwrap_or_default();
    if line.is_empty() {
        "no diagnostic".to_string()
    } else {
        line.chars().take(200).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logs(lines: &[&str]) -> Vec<String> {
        lines.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_slippage_text() {
        let err = classify_failure(
            Stage::Simulate,
            "InstructionError(2, Custom(6001))",
            &logs(&["Program log: Error: Slippage tolerance exceeded"]),
        );
        assert_eq!(err.kind, ErrorKind::SlippageExceeded);
        assert!(err.retryable);
        assert!(err.upstream_logs.unwrap().contains("Slippage tolerance exceeded"));
    }

    #[test]
    fn test_slippage_program_code() {
        let lines = logs(&[
            "Program JUP6LkbZbjS1jKKwapdHNy74zcZ3tLUZoi5QNyVTaV4 invoke [1]",
            "Program JUP6LkbZbjS1jKKwapdHNy74zcZ3tLUZoi5QNyVTaV4 failed: custom program error: 0x1771",
        ]);
        assert_eq!(classify("InstructionError(3, Custom(6001))", &lines), FailureClass::Slippage);
    }

    #[test]
    fn test_same_code_other_program_is_not_slippage() {
        let lines = logs(&[
            "Program 11111111111111111111111111111111 failed: custom program error: 0x1771",
        ]);
        assert_eq!(classify("InstructionError(0, Custom(6001))", &lines), FailureClass::Unknown);
    }

    #[test]
    fn test_insufficient_balance() {
        assert_eq!(classify("InsufficientFundsForFee", &[]), FailureClass::InsufficientBalance);
        let lines = logs(&[
            "Program log: Error: insufficient funds",
            "Program TokenkegQfeZyiNwAJbNbGKPFXCWuBvf9Ss623VQ5DA failed: custom program error: 0x1",
        ]);
        let err = classify_failure(Stage::Simulate, "InstructionError(1, Custom(1))", &lines);
        assert_eq!(err.kind, ErrorKind::InsufficientBalance);
        assert!(!err.retryable);
    }

    #[test]
    fn test_recency_expiry_is_retryable() {
        let err = classify_failure(Stage::Simulate, "BlockhashNotFound", &[]);
        assert_eq!(err.kind, ErrorKind::InvalidRecencyToken);
        assert!(err.retryable);
    }

    #[test]
    fn test_transient_generic() {
        let err = classify_failure(
            Stage::Broadcast,
            "HTTP status server error (503 Service Unavailable)",
            &[],
        );
        assert_eq!(err.kind, ErrorKind::BroadcastFailed);
        assert!(err.retryable);
    }

    #[test]
    fn test_unknown_keeps_diagnostic() {
        let err = classify_failure(
            Stage::Simulate,
            "InstructionError(0, InvalidAccountData)",
            &logs(&["Program log: something odd"]),
        );
        assert_eq!(err.kind, ErrorKind::SimulationFailed);
        assert!(!err.retryable);
        let excerpt = err.upstream_logs.unwrap();
        assert!(excerpt.contains("InvalidAccountData"));
        assert!(excerpt.contains("something odd"));
    }
}
