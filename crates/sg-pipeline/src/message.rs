use sg_types::{EvaluationError, InputRow, Row};
use std::time::{Duration, Instant};

use crate::token::CorrelationToken;

/// One point to evaluate. Never mutated after creation.
#[derive(Debug, Clone)]
pub struct EvaluationRequest {
    pub token: CorrelationToken,
    pub input: InputRow,
    pub submitted_at: Instant,
    pub timeout: Option<Duration>,
}

impl EvaluationRequest {
    pub fn deadline(&self) -> Option<Instant> {
        self.timeout.map(|t| self.submitted_at + t)
    }
}

/// Outcome of one request, carrying the request's token.
#[derive(Debug, Clone)]
pub struct EvaluationResult {
    pub token: CorrelationToken,
    pub outcome: Result<Row, EvaluationError>,
    /// Served from the result cache rather than the evaluator.
    pub cached: bool,
}

impl EvaluationResult {
    pub fn success(token: CorrelationToken, row: Row, cached: bool) -> Self {
        Self {
            token,
            outcome: Ok(row),
            cached,
        }
    }

    pub fn failure(token: CorrelationToken, error: EvaluationError) -> Self {
        Self {
            token,
            outcome: Err(error),
            cached: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn row(&self) -> Option<&Row> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&EvaluationError> {
        self.outcome.as_ref().err()
    }
}
