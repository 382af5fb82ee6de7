use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum FingerprintError {
    #[error("invalid root CA fingerprint `{0}`, expected 64 hex characters")]
    InvalidFingerprint(String),
}

/// SHA-256 digest of a DER encoded root certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RootCaFingerprint([u8; 32]);

impl RootCaFingerprint {
    pub fn new(digest: [u8; 32]) -> Self {
        Self(digest)
    }

    pub fn of_certificate(der: &[u8]) -> Self {
        Self(Sha256::digest(der).into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl TryFrom<&[u8]> for RootCaFingerprint {
    type Error = FingerprintError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let digest: [u8; 32] = bytes
            .try_into()
            .map_err(|_| FingerprintError::InvalidFingerprint(hex::encode(bytes)))?;
        Ok(Self(digest))
    }
}

impl FromStr for RootCaFingerprint {
    type Err = FingerprintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes =
            hex::decode(s.trim()).map_err(|_| FingerprintError::InvalidFingerprint(s.to_owned()))?;
        Self::try_from(bytes.as_slice())
            .map_err(|_| FingerprintError::InvalidFingerprint(s.to_owned()))
    }
}

impl fmt::Display for RootCaFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// The set of manufacturer root CAs an EK certificate chain may terminate at.
///
/// Built once while the process initialises (the only time [`Self::enroll`]
/// is called) and then shared by reference with every connection. Nothing is
/// ever removed, and there is no lookup against a system trust store.
#[derive(Debug, Clone, Default)]
pub struct TrustAnchors {
    fingerprints: HashSet<RootCaFingerprint>,
}

impl TrustAnchors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enroll(&mut self, fingerprint: RootCaFingerprint) -> &mut Self {
        if self.fingerprints.insert(fingerprint) {
            log::debug!("Enrolled root CA {}", fingerprint);
        }
        self
    }

    /// Enrolls the fingerprint of a DER encoded root certificate.
    pub fn enroll_certificate(&mut self, der: &[u8]) -> &mut Self {
        self.enroll(RootCaFingerprint::of_certificate(der))
    }

    pub fn is_trusted(&self, fingerprint: &RootCaFingerprint) -> bool {
        self.fingerprints.contains(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.fingerprints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fingerprints.is_empty()
    }
}

impl FromIterator<RootCaFingerprint> for TrustAnchors {
    fn from_iter<I: IntoIterator<Item = RootCaFingerprint>>(iter: I) -> Self {
        let mut anchors = Self::new();
        for fingerprint in iter {
            anchors.enroll(fingerprint);
        }
        anchors
    }
}
