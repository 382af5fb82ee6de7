use der::asn1::ObjectIdentifier;
use der::{Decode, Encode};
use p256::ecdsa::signature::hazmat::PrehashVerifier;
use rsa::pkcs8::DecodePublicKey;
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Sign, RsaPublicKey};
use sha2::{Digest, Sha256, Sha384, Sha512};
use std::time::SystemTime;
use thiserror::Error;
use x509_cert::ext::pkix::BasicConstraints;
use x509_cert::Certificate;

use super::anchors::{RootCaFingerprint, TrustAnchors};
use super::attributes::{AttributeError, DeviceAttributes};
use super::chain::{CertificateChain, ChainCertificate, ChainError};
use crate::tpm::command::RsaPublic;

const OID_RSA_ENCRYPTION: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1");
const OID_SHA256_WITH_RSA: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.11");
const OID_SHA384_WITH_RSA: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.12");
const OID_SHA512_WITH_RSA: ObjectIdentifier =
    ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.13");
const OID_EC_PUBLIC_KEY: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");
const OID_ECDSA_WITH_SHA256: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.2");
const OID_ECDSA_WITH_SHA384: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.4.3.3");
const OID_SECP256R1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.3.1.7");
const OID_SECP384R1: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.132.0.34");
const OID_BASIC_CONSTRAINTS: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.29.19");

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("cannot decode EK certificate chain: {0}")]
    Malformed(#[from] ChainError),
    #[error("no EK certificate was supplied and none could be read from the TPM")]
    MissingLeaf,
    #[error("EK certificate chain has no issuer certificates")]
    EmptyChain,
    #[error("certificate {index} was not issued by the certificate that follows it")]
    IssuerMismatch { index: usize },
    #[error("root certificate is not self-signed")]
    NotSelfSigned,
    #[error("issuer certificate {index} is not a CA")]
    NotCa { index: usize },
    #[error("certificate {index} is outside its validity period")]
    Expired { index: usize },
    #[error("signature on certificate {index} is invalid: {reason}")]
    BadSignature { index: usize, reason: String },
    #[error("unsupported signature algorithm {0}")]
    UnsupportedAlgorithm(ObjectIdentifier),
    #[error("certificate chain has an unknown issuer (root CA {0})")]
    UnknownIssuer(RootCaFingerprint),
    #[error("EK certificate does not hold an RSA public key: {0}")]
    PublicKey(String),
    #[error("EK certificate does not match the endorsement key of this TPM")]
    KeyMismatch,
    #[error("cannot obtain device attributes: {0}")]
    Attributes(#[from] AttributeError),
}

pub type Result<T, E = VerifyError> = core::result::Result<T, E>;

/// A certificate chain that terminated at a trusted root, plus what it says
/// about the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedEk {
    chain: Vec<ChainCertificate>,
    attributes: DeviceAttributes,
    public_key: RsaPublic,
}

impl VerifiedEk {
    /// Leaf first, root last.
    pub fn chain(&self) -> &[ChainCertificate] {
        &self.chain
    }

    pub fn attributes(&self) -> &DeviceAttributes {
        &self.attributes
    }

    /// The EK public key the leaf certificate was issued for.
    pub fn public_key(&self) -> &RsaPublic {
        &self.public_key
    }

    pub fn matches_key(&self, key: &RsaPublic) -> bool {
        self.public_key == *key
    }
}

/// Checks EK certificate chains against a set of enrolled manufacturer roots.
pub struct EkVerifier<'a> {
    anchors: &'a TrustAnchors,
    now: SystemTime,
}

impl<'a> EkVerifier<'a> {
    pub fn new(anchors: &'a TrustAnchors) -> Self {
        Self {
            anchors,
            now: SystemTime::now(),
        }
    }

    /// Verify against a fixed point in time instead of the current clock.
    pub fn at(mut self, now: SystemTime) -> Self {
        self.now = now;
        self
    }

    /// Decodes `chain` and verifies it for the TPM whose endorsement key is
    /// `expected`.
    pub fn verify(&self, chain: &[u8], expected: &RsaPublic) -> Result<VerifiedEk> {
        let chain = CertificateChain::decode(chain)?;
        let verified = self.verify_chain(&chain)?;
        match verified.matches_key(expected) {
            true => Ok(verified),
            false => Err(VerifyError::KeyMismatch),
        }
    }

    /// Everything [`Self::verify`] checks except the binding to a particular
    /// endorsement key.
    pub fn verify_chain(&self, chain: &CertificateChain) -> Result<VerifiedEk> {
        let leaf = chain.leaf.as_ref().ok_or(VerifyError::MissingLeaf)?;
        if chain.parents.is_empty() {
            return Err(VerifyError::EmptyChain);
        }
        let certs: Vec<&ChainCertificate> = chain.iter().collect();

        // names and basic constraints first, they cost nothing to check
        for (index, pair) in certs.windows(2).enumerate() {
            let (cert, issuer) = (pair[0].certificate(), pair[1].certificate());
            if cert.tbs_certificate.issuer != issuer.tbs_certificate.subject {
                return Err(VerifyError::IssuerMismatch { index });
            }
            if !is_ca(issuer) {
                return Err(VerifyError::NotCa { index: index + 1 });
            }
        }
        let root = certs[certs.len() - 1];
        if root.certificate().tbs_certificate.issuer != root.certificate().tbs_certificate.subject
        {
            return Err(VerifyError::NotSelfSigned);
        }
        for (index, cert) in certs.iter().enumerate() {
            self.check_validity(cert.certificate(), index)?;
        }

        for (index, pair) in certs.windows(2).enumerate() {
            verify_signature(pair[0].certificate(), pair[1].certificate())
                .map_err(|reason| signature_error(index, reason))?;
        }
        verify_signature(root.certificate(), root.certificate())
            .map_err(|reason| signature_error(certs.len() - 1, reason))?;

        let fingerprint = RootCaFingerprint::of_certificate(root.raw());
        if !self.anchors.is_trusted(&fingerprint) {
            return Err(VerifyError::UnknownIssuer(fingerprint));
        }

        let public_key = rsa_public(leaf.certificate())?;
        let attributes = DeviceAttributes::from_certificate(leaf.certificate())?;

        log::debug!(
            "Verified EK certificate chain of {} certificates for {} {}",
            certs.len(),
            attributes.manufacturer,
            attributes.model
        );

        Ok(VerifiedEk {
            chain: certs.into_iter().cloned().collect(),
            attributes,
            public_key,
        })
    }

    fn check_validity(&self, cert: &Certificate, index: usize) -> Result<()> {
        let validity = &cert.tbs_certificate.validity;
        if self.now < validity.not_before.to_system_time()
            || self.now > validity.not_after.to_system_time()
        {
            return Err(VerifyError::Expired { index });
        }
        Ok(())
    }
}

fn signature_error(index: usize, reason: SignatureFailure) -> VerifyError {
    match reason {
        SignatureFailure::Unsupported(oid) => VerifyError::UnsupportedAlgorithm(oid),
        SignatureFailure::Invalid(reason) => VerifyError::BadSignature { index, reason },
    }
}

fn is_ca(cert: &Certificate) -> bool {
    cert.tbs_certificate
        .extensions
        .iter()
        .flatten()
        .find(|e| e.extn_id == OID_BASIC_CONSTRAINTS)
        .and_then(|e| BasicConstraints::from_der(e.extn_value.as_bytes()).ok())
        .map_or(false, |bc| bc.ca)
}

fn rsa_public(cert: &Certificate) -> Result<RsaPublic> {
    let spki = &cert.tbs_certificate.subject_public_key_info;
    if spki.algorithm.oid != OID_RSA_ENCRYPTION {
        return Err(VerifyError::PublicKey(format!(
            "unexpected key algorithm {}",
            spki.algorithm.oid
        )));
    }
    let der = spki
        .to_der()
        .map_err(|e| VerifyError::PublicKey(e.to_string()))?;
    let key =
        RsaPublicKey::from_public_key_der(&der).map_err(|e| VerifyError::PublicKey(e.to_string()))?;
    let e = key.e().to_bytes_be();
    if e.len() > 4 {
        return Err(VerifyError::PublicKey(
            "public exponent does not fit in 32 bits".into(),
        ));
    }
    let exponent = e.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b));
    Ok(RsaPublic::new(key.n().to_bytes_be(), exponent))
}

enum SignatureFailure {
    Unsupported(ObjectIdentifier),
    Invalid(String),
}

fn invalid(e: impl ToString) -> SignatureFailure {
    SignatureFailure::Invalid(e.to_string())
}

/// Verifies `cert`'s signature with `issuer`'s public key.
fn verify_signature(
    cert: &Certificate,
    issuer: &Certificate,
) -> core::result::Result<(), SignatureFailure> {
    let algorithm = cert.signature_algorithm.oid;
    let tbs = cert.tbs_certificate.to_der().map_err(invalid)?;
    let signature = cert
        .signature
        .as_bytes()
        .ok_or_else(|| invalid("signature has unused bits"))?;
    let spki = &issuer.tbs_certificate.subject_public_key_info;

    match algorithm {
        oid if oid == OID_SHA256_WITH_RSA
            || oid == OID_SHA384_WITH_RSA
            || oid == OID_SHA512_WITH_RSA =>
        {
            let key = RsaPublicKey::from_public_key_der(&spki.to_der().map_err(invalid)?)
                .map_err(invalid)?;
            let (scheme, digest) = match oid {
                oid if oid == OID_SHA256_WITH_RSA => {
                    (Pkcs1v15Sign::new::<Sha256>(), Sha256::digest(&tbs).to_vec())
                }
                oid if oid == OID_SHA384_WITH_RSA => {
                    (Pkcs1v15Sign::new::<Sha384>(), Sha384::digest(&tbs).to_vec())
                }
                _ => (Pkcs1v15Sign::new::<Sha512>(), Sha512::digest(&tbs).to_vec()),
            };
            key.verify(scheme, &digest, signature).map_err(invalid)
        }
        oid if oid == OID_ECDSA_WITH_SHA256 || oid == OID_ECDSA_WITH_SHA384 => {
            if spki.algorithm.oid != OID_EC_PUBLIC_KEY {
                return Err(invalid("issuer key is not an EC key"));
            }
            let digest = match oid {
                oid if oid == OID_ECDSA_WITH_SHA256 => Sha256::digest(&tbs).to_vec(),
                _ => Sha384::digest(&tbs).to_vec(),
            };
            let curve = spki
                .algorithm
                .parameters
                .as_ref()
                .and_then(|p| p.decode_as::<ObjectIdentifier>().ok())
                .ok_or_else(|| invalid("issuer key has no named curve"))?;
            let point = spki.subject_public_key.raw_bytes();
            match curve {
                c if c == OID_SECP256R1 => {
                    let key = p256::ecdsa::VerifyingKey::from_sec1_bytes(point).map_err(invalid)?;
                    let sig = p256::ecdsa::Signature::from_der(signature).map_err(invalid)?;
                    key.verify_prehash(&digest, &sig).map_err(invalid)
                }
                c if c == OID_SECP384R1 => {
                    let key = p384::ecdsa::VerifyingKey::from_sec1_bytes(point).map_err(invalid)?;
                    let sig = p384::ecdsa::Signature::from_der(signature).map_err(invalid)?;
                    key.verify_prehash(&digest, &sig).map_err(invalid)
                }
                c => Err(invalid(format!("unsupported curve {}", c))),
            }
        }
        oid => Err(SignatureFailure::Unsupported(oid)),
    }
}
