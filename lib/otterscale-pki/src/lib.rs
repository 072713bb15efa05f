//! Deterministic elliptic-curve CA used by the hub: signs agent CSRs, issues
//! the hub's own server certificates, and derives the symmetric passwords
//! agents use to authenticate their reverse tunnels.

mod ca;
mod error;

pub use ca::{CertificateAuthority, PLACEHOLDER_SEED};
pub use error::PkiError;
