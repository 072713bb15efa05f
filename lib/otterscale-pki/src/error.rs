use thiserror::Error;

/// Failures the PKI surface can raise. These map onto the core's error
/// kinds (`ConfigError`, `BadRequest`) but are kept local to this crate so
/// it has no dependency on the binary crate's error type.
#[derive(Error, Debug)]
pub enum PkiError {
    #[error("refusing to derive a CA from the placeholder seed")]
    PlaceholderSeed,

    #[error("tunnel key seed is too short ({0} bytes, need at least 16)")]
    SeedTooShort(usize),

    #[error("seed key derivation failed: {0}")]
    SeedExpansion(String),

    #[error("malformed certificate signing request: {0}")]
    MalformedCsr(String),

    #[error("certificate signing request has an invalid embedded signature")]
    InvalidCsrSignature,

    #[error("certificate generation failed: {0}")]
    Generation(#[from] rcgen::Error),
}
