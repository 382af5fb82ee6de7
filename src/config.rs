//! Configuration file.
//!
//! ```yaml
//! tcti: device:/dev/tpmrm0
//! root_ca_fingerprints:
//!   - 9c8f5a9d...
//! root_ca_certificates:
//!   - /etc/tpm-secboot/roots/vendor-root.der
//! startup:
//!   attempts: 5
//!   interval_ms: 1000
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::ek::anchors::FingerprintError;
use crate::ek::{RootCaFingerprint, TrustAnchors};
use crate::tpm::{RetryPolicy, DEFAULT_TCTI};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error(transparent)]
    Fingerprint(#[from] FingerprintError),
}

pub type Result<T, E = ConfigError> = core::result::Result<T, E>;

fn default_tcti() -> String {
    DEFAULT_TCTI.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_tcti")]
    pub tcti: String,
    /// Hex SHA-256 digests of trusted manufacturer root certificates.
    #[serde(default)]
    pub root_ca_fingerprints: Vec<String>,
    /// DER root certificates to trust, hashed when the anchors are built.
    #[serde(default)]
    pub root_ca_certificates: Vec<PathBuf>,
    #[serde(default)]
    pub startup: RetryPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tcti: default_tcti(),
            root_ca_fingerprints: Vec::new(),
            root_ca_certificates: Vec::new(),
            startup: RetryPolicy::default(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        let config: Self = serde_yaml::from_str(&data)?;
        log::debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn trust_anchors(&self) -> Result<TrustAnchors> {
        let mut anchors = TrustAnchors::new();
        for fingerprint in &self.root_ca_fingerprints {
            anchors.enroll(fingerprint.parse::<RootCaFingerprint>()?);
        }
        for path in &self.root_ca_certificates {
            let der = fs::read(path).map_err(|source| ConfigError::Io {
                path: path.clone(),
                source,
            })?;
            anchors.enroll_certificate(&der);
        }
        if anchors.is_empty() {
            log::warn!("No root CAs are enrolled, no EK certificate will verify");
        }
        Ok(anchors)
    }
}
