use ambassador::Delegate;
use std::io::Read;

use super::command::{
    CommandError, Hierarchy, KeyTemplate, ObjectContext, ObjectPublic, PermanentAttributes,
    Property, Result as CommandResult, SessionContext, StartupClearAttributes, Tpm2Commands,
};
use super::esapi::{EsapiTpm, RetryPolicy};
use super::scoped::Scoped;
use super::{Result, TpmError, DEFAULT_TCTI, EK_CERT_NV_INDEX, EK_HANDLE};
use crate::ek::{
    CertificateChain, ChainCertificate, ChainError, DeviceAttributes, EkVerifier, TrustAnchors,
    VerifiedEk, VerifyError,
};

/// Where the connection's endorsement key came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EkCredential {
    /// The canonical persistent EK at [`EK_HANDLE`].
    Persistent(ObjectContext),
    /// Derived for this connection only and flushed when it closes.
    Transient(ObjectContext),
}

impl EkCredential {
    pub fn context(&self) -> ObjectContext {
        match self {
            EkCredential::Persistent(ek) | EkCredential::Transient(ek) => *ek,
        }
    }

    /// Flushes a transient EK, or closes the context of a persistent one.
    fn release<T: Tpm2Commands + ?Sized>(self, tpm: &mut T) -> CommandResult<()> {
        match self {
            EkCredential::Persistent(ek) => tpm.close_persistent(ek),
            EkCredential::Transient(ek) => tpm.flush_context(ek),
        }
    }
}

/// An open TPM with an HMAC session and, after [`TpmConnection::secure_connect`],
/// proof that it is the device its EK certificate was issued for.
///
/// Raw TPM commands can be issued through the connection itself, which
/// implements [`Tpm2Commands`] by forwarding to the transport.
#[derive(Delegate)]
#[delegate(Tpm2Commands, target = "tpm")]
pub struct TpmConnection<T: Tpm2Commands> {
    tpm: T,
    ek: Option<EkCredential>,
    verified: Option<VerifiedEk>,
    hmac_session: Option<SessionContext>,
}

/// An authorization problem while deriving an EK means the endorsement
/// hierarchy is not in a state we can use, not that the TPM is fake.
fn provisioning(e: CommandError) -> TpmError {
    match e {
        CommandError::AuthFail | CommandError::HierarchyDisabled => TpmError::Provisioning,
        e => e.into(),
    }
}

/// Looks for an endorsement primary key at [`EK_HANDLE`].
fn persistent_ek<T: Tpm2Commands + ?Sized>(
    tpm: &mut T,
) -> Result<Option<(ObjectContext, ObjectPublic)>> {
    let ek = match tpm.load_persistent(EK_HANDLE) {
        Ok(ek) => ek,
        Err(CommandError::HandleNotFound(_)) => {
            log::debug!("No persistent EK");
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    };
    let public = match tpm.read_public(ek) {
        Ok(public) => public,
        Err(e) => {
            tpm.close_persistent(ek).ok();
            return Err(e.into());
        }
    };
    match public.is_primary(Hierarchy::Endorsement, KeyTemplate::Ek) {
        true => Ok(Some((ek, public))),
        false => {
            log::warn!("Object at {:#010x} is not an endorsement key", EK_HANDLE);
            tpm.close_persistent(ek).map_err(TpmError::Cleanup)?;
            Ok(None)
        }
    }
}

impl<T: Tpm2Commands> TpmConnection<T> {
    /// Wraps an open TPM, picking up the persistent EK if there is a valid
    /// one. A TPM without an EK still connects; [`Self::endorsement_key`]
    /// reports the problem when asked.
    pub fn connect(mut tpm: T) -> Result<Self> {
        let ek = persistent_ek(&mut tpm)?.map(|(ek, _)| EkCredential::Persistent(ek));
        let mut conn = Self {
            tpm,
            ek,
            verified: None,
            hmac_session: None,
        };
        conn.restart_session()?;
        Ok(conn)
    }

    /// Connects and proves the TPM is genuine: the EK certificate chain must
    /// lead to one of `anchors` and certify a key this TPM holds.
    ///
    /// `cert_source` supplies an encoded [`CertificateChain`]. When it has no
    /// leaf, the EK certificate the manufacturer stored in NV is used. If the
    /// persistent EK does not match the certificate, or there is none, an EK
    /// is derived from the endorsement hierarchy for this connection, which
    /// needs `endorsement_auth` if that hierarchy has an auth value.
    pub fn secure_connect(
        tpm: T,
        anchors: &TrustAnchors,
        cert_source: Option<&mut dyn Read>,
        endorsement_auth: Option<&[u8]>,
    ) -> Result<Self> {
        let mut conn = Self::connect(tpm)?;
        conn.verify(anchors, cert_source, endorsement_auth)?;
        Ok(conn)
    }

    fn verify(
        &mut self,
        anchors: &TrustAnchors,
        cert_source: Option<&mut dyn Read>,
        endorsement_auth: Option<&[u8]>,
    ) -> Result<()> {
        let mut chain = match cert_source {
            Some(source) => CertificateChain::read_from(source).map_err(VerifyError::from)?,
            None => CertificateChain::default(),
        };
        if chain.leaf.is_none() {
            chain.leaf = self.read_ek_cert()?;
        }
        let verified = EkVerifier::new(anchors).verify_chain(&chain)?;

        if let Some(EkCredential::Persistent(ek)) = self.ek {
            let public = self.tpm.read_public(ek)?;
            if public.key.map_or(false, |key| verified.matches_key(&key)) {
                log::debug!("Persistent EK matches the EK certificate");
                self.verified = Some(verified);
                return self.restart_session();
            }
            log::info!("Persistent EK does not match the EK certificate");
        }

        let (ek, public) = self.create_transient_ek(endorsement_auth)?;
        let ek = Scoped::new(&mut self.tpm, ek);
        if !public.key.map_or(false, |key| verified.matches_key(&key)) {
            return Err(TpmError::TpmVerification(
                "endorsement key does not match the EK certificate".into(),
            ));
        }
        let ek = ek.keep();
        self.verified = Some(verified);
        log::debug!("Verified TPM with a transient EK");
        self.replace_ek(Some(EkCredential::Transient(ek)))
    }

    /// The manufacturer's EK certificate index has an empty auth value and
    /// is read with it, whatever the owner auth is.
    fn read_ek_cert(&mut self) -> Result<Option<ChainCertificate>> {
        match self.tpm.nv_read(EK_CERT_NV_INDEX, &[]) {
            Ok(der) => ChainCertificate::from_der(der)
                .map(Some)
                .map_err(|source| {
                    TpmError::from(VerifyError::Malformed(ChainError::Certificate {
                        index: 0,
                        source,
                    }))
                }),
            Err(CommandError::HandleNotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn create_transient_ek(
        &mut self,
        endorsement_auth: Option<&[u8]>,
    ) -> Result<(ObjectContext, ObjectPublic)> {
        let permanent = PermanentAttributes(self.tpm.read_property(Property::Permanent)?);
        if permanent.endorsement_auth_set() && endorsement_auth.is_none() {
            log::info!("Endorsement hierarchy has an auth value that was not supplied");
            return Err(TpmError::Provisioning);
        }
        self.tpm
            .set_hierarchy_auth(Hierarchy::Endorsement, endorsement_auth.unwrap_or_default())?;

        // PolicySecret checks the endorsement auth, the key is created in the
        // encrypted HMAC session
        let session = self.tpm.start_policy_session()?;
        let hmac_session = self.hmac_session;
        let mut tpm = Scoped::new(&mut self.tpm, session);
        tpm.policy_secret(session, Hierarchy::Endorsement)
            .map_err(provisioning)?;
        let ek = tpm
            .create_primary(Hierarchy::Endorsement, KeyTemplate::Ek, None, hmac_session)
            .map_err(provisioning)?;
        Ok(ek)
    }

    /// Replaces the EK credential, releasing the one being replaced, and
    /// restarts the HMAC session salted with the new key.
    pub(super) fn replace_ek(&mut self, ek: Option<EkCredential>) -> Result<()> {
        if let Some(old) = self.ek {
            if Some(old) != ek {
                old.release(&mut self.tpm).map_err(TpmError::Cleanup)?;
            }
        }
        self.ek = ek;
        self.restart_session()
    }

    fn restart_session(&mut self) -> Result<()> {
        if let Some(session) = self.hmac_session.take() {
            self.tpm.flush_session(session).map_err(TpmError::Cleanup)?;
        }
        let salt = self.ek.map(|ek| ek.context());
        self.hmac_session = Some(self.tpm.start_hmac_session(salt)?);
        Ok(())
    }

    /// True only if both the storage and endorsement hierarchies are enabled
    /// right now.
    pub fn is_enabled(&mut self) -> bool {
        match self.tpm.read_property(Property::StartupClear) {
            Ok(flags) => {
                let flags = StartupClearAttributes(flags);
                flags.owner_enabled() && flags.endorsement_enabled()
            }
            Err(e) => {
                log::warn!("Cannot read TPM startup flags: {}", e);
                false
            }
        }
    }

    /// The persistent EK. A connection verified with a transient EK has none.
    pub fn endorsement_key(&self) -> Result<ObjectContext> {
        match self.ek {
            Some(EkCredential::Persistent(ek)) => Ok(ek),
            _ => Err(TpmError::Provisioning),
        }
    }

    pub fn ek_credential(&self) -> Option<EkCredential> {
        self.ek
    }

    pub fn hmac_session(&self) -> Option<SessionContext> {
        self.hmac_session
    }

    /// Leaf to root. Empty unless the connection was securely established.
    pub fn verified_ek_cert_chain(&self) -> &[ChainCertificate] {
        self.verified.as_ref().map_or(&[], |v| v.chain())
    }

    pub fn verified_device_attributes(&self) -> Option<&DeviceAttributes> {
        self.verified.as_ref().map(|v| v.attributes())
    }

    /// Flushes the HMAC session and any transient EK and closes the persistent
    /// EK's context, then releases the transport even if that failed.
    pub fn close(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        let mut first = None;
        if let Some(session) = self.hmac_session.take() {
            if let Err(e) = self.tpm.flush_session(session) {
                log::warn!("Failed to flush HMAC session: {}", e);
                first.get_or_insert(e);
            }
        }
        if let Some(ek) = self.ek.take() {
            if let Err(e) = ek.release(&mut self.tpm) {
                log::warn!("Failed to release {:?}: {}", ek, e);
                first.get_or_insert(e);
            }
        }
        match first {
            Some(e) => Err(TpmError::Cleanup(e)),
            None => Ok(()),
        }
    }
}

impl<T: Tpm2Commands> Drop for TpmConnection<T> {
    fn drop(&mut self) {
        self.release().ok();
    }
}

/// [`TpmConnection::connect`] to the TPM at [`DEFAULT_TCTI`].
pub fn connect_to_default_tpm() -> Result<TpmConnection<EsapiTpm>> {
    TpmConnection::connect(EsapiTpm::open(DEFAULT_TCTI, &RetryPolicy::default())?)
}

/// [`TpmConnection::secure_connect`] to the TPM at [`DEFAULT_TCTI`].
pub fn secure_connect_to_default_tpm(
    anchors: &TrustAnchors,
    cert_source: Option<&mut dyn Read>,
    endorsement_auth: Option<&[u8]>,
) -> Result<TpmConnection<EsapiTpm>> {
    TpmConnection::secure_connect(
        EsapiTpm::open(DEFAULT_TCTI, &RetryPolicy::default())?,
        anchors,
        cert_source,
        endorsement_auth,
    )
}
