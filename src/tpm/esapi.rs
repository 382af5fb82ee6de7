use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::thread;
use std::time::Duration;
use tss_esapi::abstraction::ek;
use tss_esapi::attributes::{NvIndexAttributesBuilder, ObjectAttributes, SessionAttributes};
use tss_esapi::constants::property_tag::PropertyTag;
use tss_esapi::constants::{CapabilityType, SessionType, StartupType};
use tss_esapi::handles::{
    AuthHandle, KeyHandle, NvIndexHandle, NvIndexTpmHandle, ObjectHandle, PersistentTpmHandle,
    SessionHandle, TpmHandle,
};
use tss_esapi::interface_types::algorithm::{
    AsymmetricAlgorithm, HashingAlgorithm, PublicAlgorithm,
};
use tss_esapi::interface_types::dynamic_handles::Persistent;
use tss_esapi::interface_types::ecc::EccCurve;
use tss_esapi::interface_types::resource_handles::{self as rh, NvAuth, Provision};
use tss_esapi::interface_types::session_handles::{AuthSession, HmacSession, PolicySession};
use tss_esapi::constants::Tss2ResponseCodeKind;
use tss_esapi::structures::{
    Auth, CapabilityData, CreatePrimaryKeyResult, EccPoint, MaxNvBuffer, NvPublicBuilder,
    Public, PublicEccParametersBuilder, SensitiveData, SymmetricDefinition,
    SymmetricDefinitionObject,
};
use tss_esapi::tcti_ldr::TctiNameConf;
use tss_esapi::WrapperErrorKind;

use super::command::{
    CommandError, Hierarchy, KeyTemplate, NvPublic, ObjectContext, ObjectPublic, Property, Result,
    RsaPublic, SessionContext, Tpm2Commands,
};
use super::TpmError;

pub const DEFAULT_DEVICE: &str = "/dev/tpmrm0";

/// Smallest TPM2_PT_NV_BUFFER_MAX a TPM may report.
const NV_BUFFER_MAX: u16 = 512;

/// How long to keep trying to open a TPM that is present but not answering,
/// e.g. a simulator that is still starting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub interval_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            interval_ms: 1000,
        }
    }
}

impl From<tss_esapi::Error> for CommandError {
    fn from(e: tss_esapi::Error) -> Self {
        match e {
            tss_esapi::Error::Tss2Error(rc) => match rc.kind() {
                Some(Tss2ResponseCodeKind::AuthFail) | Some(Tss2ResponseCodeKind::BadAuth) => {
                    CommandError::AuthFail
                }
                Some(Tss2ResponseCodeKind::Hierarchy) => CommandError::HierarchyDisabled,
                Some(Tss2ResponseCodeKind::Disabled) => CommandError::Disabled,
                Some(Tss2ResponseCodeKind::ObjectMemory)
                | Some(Tss2ResponseCodeKind::SessionMemory)
                | Some(Tss2ResponseCodeKind::NvSpace) => CommandError::ResourceExhausted,
                _ => CommandError::Tpm(rc.to_string()),
            },
            e => CommandError::Tpm(e.to_string()),
        }
    }
}

fn rc_kind(e: &tss_esapi::Error) -> Option<Tss2ResponseCodeKind> {
    match e {
        tss_esapi::Error::Tss2Error(rc) => rc.kind(),
        _ => None,
    }
}

/// Maps handle and NV definition errors onto the handle the command was about.
fn about(handle: u32) -> impl Fn(tss_esapi::Error) -> CommandError {
    move |e| match rc_kind(&e) {
        Some(Tss2ResponseCodeKind::Handle) => CommandError::HandleNotFound(handle),
        Some(Tss2ResponseCodeKind::NvDefined) => CommandError::NvDefined(handle),
        _ => e.into(),
    }
}

fn object_handle(hierarchy: Hierarchy) -> ObjectHandle {
    match hierarchy {
        Hierarchy::Owner => ObjectHandle::Owner,
        Hierarchy::Endorsement => ObjectHandle::Endorsement,
        Hierarchy::Platform => ObjectHandle::Platform,
        Hierarchy::Lockout => ObjectHandle::Lockout,
    }
}

fn auth_handle(hierarchy: Hierarchy) -> AuthHandle {
    match hierarchy {
        Hierarchy::Owner => AuthHandle::Owner,
        Hierarchy::Endorsement => AuthHandle::Endorsement,
        Hierarchy::Platform => AuthHandle::Platform,
        Hierarchy::Lockout => AuthHandle::Lockout,
    }
}

fn provision(hierarchy: Hierarchy) -> Result<Provision> {
    match hierarchy {
        Hierarchy::Owner => Ok(Provision::Owner),
        Hierarchy::Platform => Ok(Provision::Platform),
        h => Err(CommandError::Tpm(format!("{} hierarchy cannot own NV indices", h))),
    }
}

fn srk_template() -> tss_esapi::Result<Public> {
    let object_attributes = ObjectAttributes::builder()
        .with_fixed_tpm(true)
        .with_fixed_parent(true)
        .with_sensitive_data_origin(true)
        .with_user_with_auth(true)
        .with_no_da(true)
        .with_decrypt(true)
        .with_sign_encrypt(false)
        .with_restricted(true)
        .build()?;

    Public::builder()
        .with_public_algorithm(PublicAlgorithm::Ecc)
        .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
        .with_object_attributes(object_attributes)
        .with_ecc_parameters(
            PublicEccParametersBuilder::new_restricted_decryption_key(
                SymmetricDefinitionObject::AES_128_CFB,
                EccCurve::NistP256,
            )
            .build()?,
        )
        .with_ecc_unique_identifier(EccPoint::default())
        .build()
}

/// True if `a` and `b` differ at most in their unique field.
fn same_template(a: &Public, b: &Public) -> bool {
    match (a, b) {
        (
            Public::Rsa {
                object_attributes: oa,
                name_hashing_algorithm: na,
                auth_policy: pa,
                parameters: ra,
                ..
            },
            Public::Rsa {
                object_attributes: ob,
                name_hashing_algorithm: nb,
                auth_policy: pb,
                parameters: rb,
                ..
            },
        ) => oa == ob && na == nb && pa == pb && ra == rb,
        (
            Public::Ecc {
                object_attributes: oa,
                name_hashing_algorithm: na,
                auth_policy: pa,
                parameters: ea,
                ..
            },
            Public::Ecc {
                object_attributes: ob,
                name_hashing_algorithm: nb,
                auth_policy: pb,
                parameters: eb,
                ..
            },
        ) => oa == ob && na == nb && pa == pb && ea == eb,
        _ => false,
    }
}

/// Checks that a TCTI names something we could plausibly talk to. A device
/// node that does not exist means there is no TPM, not that it is busy.
fn check_device(tcti: &str) -> Result<(), TpmError> {
    let path = match tcti.split_once(':') {
        Some(("device", path)) if !path.is_empty() => path,
        None if tcti == "device" => DEFAULT_DEVICE,
        _ => return Ok(()),
    };
    match Path::new(path).exists() {
        true => Ok(()),
        false => {
            log::debug!("TPM device {} does not exist", path);
            Err(TpmError::NoTpm2Device)
        }
    }
}

/// Reads `size` bytes, `chunk` at a time, authorized by the index itself.
fn read_nv(
    context: &mut tss_esapi::Context,
    handle: NvIndexHandle,
    size: u16,
    chunk: u16,
) -> tss_esapi::Result<Vec<u8>> {
    let mut data = Vec::with_capacity(size.into());
    while data.len() < size.into() {
        let offset = data.len() as u16;
        let buffer = context.execute_with_session(Some(AuthSession::Password), |ctx| {
            ctx.nv_read(NvAuth::NvIndex(handle), handle, chunk.min(size - offset), offset)
        })?;
        if buffer.value().is_empty() {
            return Err(tss_esapi::Error::WrapperError(
                WrapperErrorKind::WrongValueFromTpm,
            ));
        }
        data.extend_from_slice(buffer.value());
    }
    Ok(data)
}

/// [`Tpm2Commands`] on top of an ESYS context.
pub struct EsapiTpm {
    context: tss_esapi::Context,
    sessions: HashMap<u32, AuthSession>,
    /// ESYS resource of each loaded persistent object, to its TPM handle.
    persistent: HashMap<u32, u32>,
    ek_template: Public,
    srk_template: Public,
}

impl EsapiTpm {
    /// Opens the TPM named by `tcti`, e.g. `device:/dev/tpmrm0` or
    /// `mssim:host=localhost,port=2321`, and starts it up if nobody has.
    pub fn open(tcti: &str, retry: &RetryPolicy) -> Result<Self, TpmError> {
        check_device(tcti)?;
        let conf = TctiNameConf::from_str(tcti)
            .map_err(|e| CommandError::Transport(format!("invalid TCTI `{}`: {}", tcti, e)))?;
        log::debug!("TCTI config {:?}", conf);

        let attempts = retry.attempts.max(1);
        let mut attempt = 1;
        let mut context = loop {
            match tss_esapi::Context::new(conf.clone()) {
                Ok(context) => break context,
                Err(e) if attempt < attempts => {
                    log::debug!("Cannot open TPM ({}), attempt {}/{}", e, attempt, attempts);
                    thread::sleep(Duration::from_millis(retry.interval_ms));
                    attempt += 1;
                }
                Err(e) => return Err(CommandError::Transport(e.to_string()).into()),
            }
        };

        match context.startup(StartupType::Clear) {
            Ok(()) => log::debug!("Started TPM"),
            Err(e) if rc_kind(&e) == Some(Tss2ResponseCodeKind::Initialize) => {}
            Err(e) => return Err(CommandError::from(e).into()),
        }

        Ok(Self {
            context,
            sessions: HashMap::new(),
            persistent: HashMap::new(),
            ek_template: ek::create_ek_public_from_default_template(AsymmetricAlgorithm::Rsa, None)
                .map_err(CommandError::from)?,
            srk_template: srk_template().map_err(CommandError::from)?,
        })
    }

    fn make_session(&mut self, t: SessionType, salt: Option<KeyHandle>) -> Result<SessionContext> {
        let session = self
            .context
            .start_auth_session(
                salt,
                None,
                None,
                t,
                SymmetricDefinition::AES_128_CFB,
                HashingAlgorithm::Sha256,
            )?
            .ok_or_else(|| CommandError::Tpm("no session returned".into()))?;
        // the TPM flushes a session without continueSession after one command
        let (session_attributes, session_attributes_mask) = SessionAttributes::builder()
            .with_continue_session(true)
            .with_decrypt(t == SessionType::Hmac)
            .build();
        self.context
            .tr_sess_set_attributes(session, session_attributes, session_attributes_mask)?;

        let handle: u32 = ObjectHandle::from(SessionHandle::from(session)).into();
        self.sessions.insert(handle, session);
        Ok(SessionContext(handle))
    }

    /// `None` is a plain password session.
    fn auth_session(&self, session: Option<SessionContext>) -> Result<AuthSession> {
        match session {
            None => Ok(AuthSession::Password),
            Some(session) => self
                .sessions
                .get(&session.0)
                .copied()
                .ok_or(CommandError::HandleNotFound(session.0)),
        }
    }

    /// Opens an ESYS resource for an NV index. Close it with [`Self::close_nv`].
    fn nv_handle(&mut self, index: u32) -> Result<NvIndexHandle> {
        let tpm_handle = NvIndexTpmHandle::new(index)?;
        let object = self
            .context
            .execute_without_session(|ctx| ctx.tr_from_tpm_public(TpmHandle::NvIndex(tpm_handle)))
            .map_err(about(index))?;
        Ok(object.into())
    }

    fn close_nv(&mut self, handle: NvIndexHandle) {
        let mut object = ObjectHandle::from(handle);
        if let Err(e) = self.context.tr_close(&mut object) {
            log::debug!("Cannot close NV index resource: {}", e);
        }
    }

    fn template_of(&self, public: &Public) -> Option<KeyTemplate> {
        match public {
            p if same_template(p, &self.ek_template) => Some(KeyTemplate::Ek),
            p if same_template(p, &self.srk_template) => Some(KeyTemplate::Srk),
            _ => None,
        }
    }
}

impl Tpm2Commands for EsapiTpm {
    fn shutdown(&mut self) -> Result<()> {
        Ok(self.context.shutdown(StartupType::Clear)?)
    }

    fn read_property(&mut self, property: Property) -> Result<u32> {
        let tag = match property {
            Property::Permanent => PropertyTag::Permanent,
            Property::StartupClear => PropertyTag::StartupClear,
        };
        self.context
            .get_tpm_property(tag)?
            .ok_or_else(|| CommandError::Tpm(format!("TPM did not report {:?}", property)))
    }

    fn start_hmac_session(&mut self, salt: Option<ObjectContext>) -> Result<SessionContext> {
        let salt = salt.map(|o| KeyHandle::from(ObjectHandle::from(o.0)));
        self.make_session(SessionType::Hmac, salt)
    }

    fn start_policy_session(&mut self) -> Result<SessionContext> {
        self.make_session(SessionType::Policy, None)
    }

    fn policy_secret(&mut self, session: SessionContext, hierarchy: Hierarchy) -> Result<()> {
        let policy = PolicySession::try_from(self.auth_session(Some(session))?)?;
        self.context
            .execute_with_session(Some(AuthSession::Password), |ctx| {
                ctx.policy_secret(
                    policy,
                    auth_handle(hierarchy),
                    Default::default(),
                    Default::default(),
                    Default::default(),
                    None,
                )
            })?;
        Ok(())
    }

    fn flush_context(&mut self, object: ObjectContext) -> Result<()> {
        Ok(self
            .context
            .flush_context(ObjectHandle::from(object.0))
            .map_err(about(object.0))?)
    }

    fn flush_session(&mut self, session: SessionContext) -> Result<()> {
        let auth = self
            .sessions
            .remove(&session.0)
            .ok_or(CommandError::HandleNotFound(session.0))?;
        let handle = match auth {
            AuthSession::HmacSession(session) => match session {
                HmacSession::HmacSession { session_handle, .. } => Some(session_handle.into()),
            },
            AuthSession::PolicySession(session) => match session {
                PolicySession::PolicySession { session_handle, .. } => Some(session_handle.into()),
            },
            _ => None,
        };
        if let Some(handle) = handle {
            self.context.flush_context(handle)?;
        }
        Ok(())
    }

    fn load_persistent(&mut self, handle: u32) -> Result<ObjectContext> {
        let tpm_handle = PersistentTpmHandle::new(handle)?;
        let object = self
            .context
            .execute_without_session(|ctx| {
                ctx.tr_from_tpm_public(TpmHandle::Persistent(tpm_handle))
            })
            .map_err(about(handle))?;
        let resource: u32 = object.into();
        self.persistent.insert(resource, handle);
        Ok(ObjectContext(resource))
    }

    fn close_persistent(&mut self, object: ObjectContext) -> Result<()> {
        self.persistent
            .remove(&object.0)
            .ok_or(CommandError::HandleNotFound(object.0))?;
        let mut handle = ObjectHandle::from(object.0);
        Ok(self.context.tr_close(&mut handle)?)
    }

    fn read_public(&mut self, object: ObjectContext) -> Result<ObjectPublic> {
        let key = KeyHandle::from(ObjectHandle::from(object.0));
        let (public, name, qualified_name) = self
            .context
            .execute_without_session(|ctx| ctx.read_public(key))
            .map_err(about(object.0))?;
        let rsa = match &public {
            Public::Rsa {
                unique, parameters, ..
            } => Some(RsaPublic::new(
                unique.value().to_vec(),
                parameters.exponent().value(),
            )),
            _ => None,
        };
        Ok(ObjectPublic {
            template: self.template_of(&public),
            key: rsa,
            name: name.value().to_vec(),
            qualified_name: qualified_name.value().to_vec(),
        })
    }

    fn create_primary(
        &mut self,
        hierarchy: Hierarchy,
        template: KeyTemplate,
        sensitive: Option<&[u8]>,
        session: Option<SessionContext>,
    ) -> Result<(ObjectContext, ObjectPublic)> {
        let auth = self.auth_session(session)?;
        let public = match template {
            KeyTemplate::Ek => self.ek_template.clone(),
            KeyTemplate::Srk => self.srk_template.clone(),
        };
        let sensitive = sensitive
            .map(|s| SensitiveData::try_from(s.to_vec()))
            .transpose()?;
        let primary = match hierarchy {
            Hierarchy::Owner => rh::Hierarchy::Owner,
            Hierarchy::Endorsement => rh::Hierarchy::Endorsement,
            Hierarchy::Platform => rh::Hierarchy::Platform,
            Hierarchy::Lockout => {
                return Err(CommandError::Tpm("lockout has no primary seed".into()))
            }
        };

        let CreatePrimaryKeyResult { key_handle, .. } = self
            .context
            .execute_with_session(Some(auth), |ctx| {
                ctx.create_primary(primary, public, None, sensitive, None, None)
            })?;
        let object = ObjectContext(ObjectHandle::from(key_handle).into());
        log::debug!("Created {:?} primary key in the {} hierarchy", template, hierarchy);

        match self.read_public(object) {
            Ok(public) => Ok((object, public)),
            Err(e) => {
                self.flush_context(object).ok();
                Err(e)
            }
        }
    }

    fn persist_object(&mut self, object: ObjectContext, handle: u32) -> Result<ObjectContext> {
        let persistent = Persistent::Persistent(PersistentTpmHandle::new(handle)?);
        let resource = self
            .context
            .execute_with_session(Some(AuthSession::Password), |ctx| {
                ctx.evict_control(Provision::Owner, ObjectHandle::from(object.0), persistent)
            })
            .map_err(about(handle))?;
        let resource: u32 = resource.into();
        self.persistent.insert(resource, handle);
        Ok(ObjectContext(resource))
    }

    fn evict_persistent(&mut self, object: ObjectContext) -> Result<()> {
        let handle = self
            .persistent
            .get(&object.0)
            .copied()
            .ok_or(CommandError::HandleNotFound(object.0))?;
        let persistent = Persistent::Persistent(PersistentTpmHandle::new(handle)?);
        // evicting needs an authorization session even for an empty owner
        // auth. ESYS frees the resource once the object is gone.
        self.context
            .execute_with_session(Some(AuthSession::Password), |ctx| {
                ctx.evict_control(Provision::Owner, ObjectHandle::from(object.0), persistent)
            })
            .map_err(about(handle))?;
        self.persistent.remove(&object.0);
        Ok(())
    }

    fn set_hierarchy_auth(&mut self, hierarchy: Hierarchy, auth: &[u8]) -> Result<()> {
        let auth = Auth::try_from(auth.to_vec())?;
        Ok(self.context.tr_set_auth(object_handle(hierarchy), auth)?)
    }

    fn hierarchy_change_auth(
        &mut self,
        hierarchy: Hierarchy,
        auth: &[u8],
        session: Option<SessionContext>,
    ) -> Result<()> {
        let session = self.auth_session(session)?;
        let auth = Auth::try_from(auth.to_vec())?;
        self.context
            .execute_with_session(Some(session), |ctx| {
                ctx.hierarchy_change_auth(auth_handle(hierarchy), auth.clone())
            })?;
        Ok(self.context.tr_set_auth(object_handle(hierarchy), auth)?)
    }

    fn clear(&mut self, hierarchy: Hierarchy) -> Result<()> {
        Ok(self
            .context
            .execute_with_session(Some(AuthSession::Password), |ctx| {
                ctx.clear(auth_handle(hierarchy))
            })?)
    }

    fn clear_control(&mut self, hierarchy: Hierarchy, disable: bool) -> Result<()> {
        Ok(self
            .context
            .execute_with_session(Some(AuthSession::Password), |ctx| {
                ctx.clear_control(auth_handle(hierarchy), disable)
            })?)
    }

    fn nv_define_space(
        &mut self,
        hierarchy: Hierarchy,
        public: &NvPublic,
        auth: &[u8],
        session: Option<SessionContext>,
    ) -> Result<()> {
        let session = self.auth_session(session)?;
        let attributes = NvIndexAttributesBuilder::new()
            .with_auth_read(true)
            .with_auth_write(true)
            .with_no_da(true)
            .with_platform_create(public.hierarchy == Hierarchy::Platform)
            .build()?;
        let nv_public = NvPublicBuilder::new()
            .with_nv_index(NvIndexTpmHandle::new(public.index)?)
            .with_index_name_algorithm(HashingAlgorithm::Sha256)
            .with_index_attributes(attributes)
            .with_data_area_size(public.size as usize)
            .build()?;
        let provision = provision(hierarchy)?;
        let auth = Auth::try_from(auth.to_vec())?;
        self.context
            .execute_with_session(Some(session), |ctx| {
                ctx.nv_define_space(provision, Some(auth), nv_public)
            })
            .map_err(about(public.index))?;
        Ok(())
    }

    fn nv_undefine_space(&mut self, hierarchy: Hierarchy, index: u32) -> Result<()> {
        let provision = provision(hierarchy)?;
        let handle = self.nv_handle(index)?;
        let result = self
            .context
            .execute_with_session(Some(AuthSession::Password), |ctx| {
                ctx.nv_undefine_space(provision, handle)
            });
        // ESYS frees the resource of an undefined index
        if result.is_err() {
            self.close_nv(handle);
        }
        Ok(result.map_err(about(index))?)
    }

    fn nv_write(&mut self, index: u32, auth: &[u8], data: &[u8], offset: u16) -> Result<()> {
        let auth = Auth::try_from(auth.to_vec())?;
        let data = MaxNvBuffer::try_from(data.to_vec())?;
        let handle = self.nv_handle(index)?;
        let result = self.context.tr_set_auth(handle.into(), auth).and_then(|()| {
            self.context
                .execute_with_session(Some(AuthSession::Password), |ctx| {
                    ctx.nv_write(NvAuth::NvIndex(handle), handle, data, offset)
                })
        });
        self.close_nv(handle);
        Ok(result.map_err(about(index))?)
    }

    fn nv_read(&mut self, index: u32, auth: &[u8]) -> Result<Vec<u8>> {
        let auth = Auth::try_from(auth.to_vec())?;
        let size = self.nv_read_public(index)?.size;
        let chunk = self
            .context
            .get_tpm_property(PropertyTag::NvBufferMax)?
            .map_or(NV_BUFFER_MAX, |max| max.min(u16::MAX.into()) as u16);
        let handle = self.nv_handle(index)?;
        let result = self
            .context
            .tr_set_auth(handle.into(), auth)
            .and_then(|()| read_nv(&mut self.context, handle, size, chunk));
        self.close_nv(handle);
        Ok(result.map_err(about(index))?)
    }

    fn nv_read_public(&mut self, index: u32) -> Result<NvPublic> {
        let handle = self.nv_handle(index)?;
        let result = self
            .context
            .execute_without_session(|ctx| ctx.nv_read_public(handle));
        self.close_nv(handle);
        let (public, _name) = result.map_err(about(index))?;
        let attributes = public.attributes();
        Ok(NvPublic {
            index,
            size: public.data_size() as u16,
            hierarchy: match attributes.platform_create() {
                true => Hierarchy::Platform,
                false => Hierarchy::Owner,
            },
            written: attributes.written(),
        })
    }

    fn handles(&mut self, first: u32, count: u32) -> Result<Vec<u32>> {
        let (capabilities, _) = self
            .context
            .get_capability(CapabilityType::Handles, first, count)?;
        match capabilities {
            CapabilityData::Handles(handles) => Ok(handles
                .into_inner()
                .into_iter()
                .map(u32::from)
                .collect()),
            _ => Ok(Vec::new()),
        }
    }
}
