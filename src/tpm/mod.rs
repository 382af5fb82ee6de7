use thiserror::Error;

use crate::ek::VerifyError;

#[macro_use]
pub mod command;
pub mod connection;
pub mod esapi;
pub mod nv;
pub mod provision;
pub mod scoped;

#[cfg(test)]
pub(crate) mod mock;

pub use command::{CommandError, Hierarchy, Tpm2Commands};
pub use connection::{
    connect_to_default_tpm, secure_connect_to_default_tpm, EkCredential, TpmConnection,
};
pub use esapi::{EsapiTpm, RetryPolicy};
pub use nv::{PinIndex, PinIndexOwner, SealedKeyObject};
pub use provision::{provision_tpm, HierarchyAuthValues, ProvisionMode};

/// Persistent handle of the endorsement key, TCG EK Credential Profile.
pub const EK_HANDLE: u32 = 0x8101_0001;
/// Persistent handle of the storage root key.
pub const SRK_HANDLE: u32 = 0x8100_0001;
/// NV index holding the manufacturer's RSA 2048 EK certificate.
pub const EK_CERT_NV_INDEX: u32 = 0x01c0_0002;

pub const DEFAULT_TCTI: &str = "device:/dev/tpmrm0";

#[derive(Error, Debug)]
pub enum TpmError {
    #[error("no TPM2 device is available")]
    NoTpm2Device,
    #[error("the TPM is not correctly provisioned")]
    Provisioning,
    #[error("cannot verify the endorsement key certificate: {0}")]
    EkCertVerification(#[from] VerifyError),
    #[error("cannot verify that the TPM is the device the EK certificate was issued for: {0}")]
    TpmVerification(String),
    #[error("authorization of the {0} hierarchy failed")]
    AuthFail(Hierarchy),
    #[error("clearing the TPM requires physical presence, owner clear is disabled")]
    ClearRequiresPpi,
    #[error("{0:#010x} is not a PIN index handle")]
    InvalidPinIndex(u32),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error("failed to release TPM resources: {0}")]
    Cleanup(CommandError),
}

pub type Result<T, E = TpmError> = core::result::Result<T, E>;

/// Turns an authorization failure against `hierarchy` into [`TpmError::AuthFail`].
pub(crate) fn auth_fail(hierarchy: Hierarchy) -> impl Fn(CommandError) -> TpmError {
    move |e| match e {
        CommandError::AuthFail => TpmError::AuthFail(hierarchy),
        e => e.into(),
    }
}
