use crate::types::SondeId;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invariant violated for sonde {serial}: {detail}")]
    Invariant { serial: SondeId, detail: String },
}
