use thiserror::Error;

/// Errors that stop the server loop.
#[derive(Debug, Error)]
pub enum ServerError {
    /// World state is corrupt; continuing would replicate the corruption.
    #[error("invariant violated at tick {tick}: {detail}")]
    InvariantViolation { tick: u64, detail: String },
}
