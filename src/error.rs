use thiserror::Error;

// Unified error type for ellax

#[derive(Error, Debug)]
pub enum EllError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("solve error: {0}")]
    Solve(String),
    #[error("indefinite operator detected (p^T A p <= 0)")]
    IndefiniteOperator,
    #[error("indefinite preconditioner detected (beta < 0)")]
    IndefinitePreconditioner,
    #[error("residual diverged: {residual:e} vs initial {initial:e}")]
    Diverged { residual: f64, initial: f64 },
    #[error("scratch arena exhausted: {0}")]
    ArenaExhausted(String),
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
}
