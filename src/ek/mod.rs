//! Endorsement key certificate handling.
//!
//! Everything in here is pure data processing: no TPM access happens in this
//! module tree. The connection layer in [`crate::tpm`] feeds it certificates
//! read from the device (or supplied by the caller) and the public key of the
//! endorsement key it resolved.

pub mod anchors;
pub mod attributes;
pub mod chain;
pub mod verify;


pub use anchors::{RootCaFingerprint, TrustAnchors};
pub use attributes::{AttributeError, DeviceAttributes, TpmManufacturer};
pub use chain::{CertificateChain, ChainCertificate, ChainError};
pub use verify::{EkVerifier, VerifiedEk, VerifyError};
