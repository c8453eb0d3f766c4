use thiserror::Error;

/// Failures raised by the evaluation core.
///
/// Record-level problems (`InvalidInput`) are isolated by the caller: the
/// offending utterance is logged, counted and excluded from its bucket's
/// aggregate. `InsufficientData` means a confidence interval cannot be
/// produced; the point estimate is still written when computable.
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("insufficient data: {0}")]
    InsufficientData(String),
}
