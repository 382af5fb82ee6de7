//! Verified connections to a TPM2 device for sealing disk keys.
//!
//! A connection only counts as secure once the TPM's endorsement key
//! certificate chains up to an enrolled manufacturer root CA and the TPM
//! proves it holds the certified key. From there the crate can provision
//! the TPM (EK, SRK and hierarchy auth values) and manage the NV indices
//! that sealed keys depend on.
//!
//! ```no_run
//! use tpm_secboot::config::Config;
//! use tpm_secboot::tpm::{EsapiTpm, TpmConnection};
//!
//! # fn main() -> eyre::Result<()> {
//! let config = Config::load("/etc/tpm-secboot.yaml")?;
//! let anchors = config.trust_anchors()?;
//! let tpm = EsapiTpm::open(&config.tcti, &config.startup)?;
//! let conn = TpmConnection::secure_connect(tpm, &anchors, None, None)?;
//! println!("{:?}", conn.verified_device_attributes());
//! conn.close()?;
//! # Ok(())
//! # }
//! ```

pub mod cli;
pub mod config;
pub mod ek;
pub mod tpm;
