//! In-memory TPM for tests.
//!
//! Models just enough TPM behaviour for the connection, provisioning and NV
//! code: hierarchy auth values and enable flags, primary key derivation from
//! per-hierarchy seeds, persistent objects, NV indices and the small fixed
//! number of transient object and session slots. State lives behind an
//! `Rc<RefCell<_>>` so several connections can be opened on one "chip".

use rsa::traits::PublicKeyParts;
use sha2::{Digest, Sha256};
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use super::command::{
    primary_qualified_name, CommandError, Hierarchy, KeyTemplate, NvPublic, ObjectContext,
    ObjectPublic, Property, Result, RsaPublic, SessionContext, Tpm2Commands, NAME_ALG_SHA256,
};
use super::EK_CERT_NV_INDEX;
use crate::ek::testutil::{test_ek_cert, test_ek_key};

const MAX_TRANSIENT: usize = 3;
const MAX_SESSIONS: usize = 3;
const MAX_NV_INDICES: usize = 8;
const TRANSIENT_FIRST: u32 = 0x8000_0000;
const SESSION_FIRST: u32 = 0x0200_0000;
/// Contexts for persistent objects, like ESYS resources, are not TPM handles.
const RESOURCE_FIRST: u32 = 0x0040_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionKind {
    Hmac,
    Policy,
}

#[derive(Debug, Clone, Copy)]
struct Session {
    kind: SessionKind,
    /// Hierarchy a policy session has passed TPM2_PolicySecret for.
    secret: Option<Hierarchy>,
}

/// How a command that needs authorization was authorized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Authorization {
    Password,
    /// An HMAC session, which encrypts the first command parameter.
    Hmac,
    Policy,
}

#[derive(Debug, Clone)]
struct HierarchyState {
    auth: Vec<u8>,
    enabled: bool,
}

#[derive(Debug, Clone)]
struct NvIndex {
    public: NvPublic,
    auth: Vec<u8>,
    data: Vec<u8>,
}

#[derive(Debug)]
struct MockState {
    hierarchies: HashMap<Hierarchy, HierarchyState>,
    disable_clear: bool,
    owner_seed: u32,
    persistent: BTreeMap<u32, ObjectPublic>,
    transient: BTreeMap<u32, ObjectPublic>,
    /// Open contexts for persistent objects, to their handle.
    resources: BTreeMap<u32, u32>,
    sessions: BTreeMap<u32, Session>,
    nv: BTreeMap<u32, NvIndex>,
    authorizations: Vec<(&'static str, Authorization)>,
    next_handle: u32,
}

impl Default for MockState {
    fn default() -> Self {
        let hierarchies = [
            Hierarchy::Owner,
            Hierarchy::Endorsement,
            Hierarchy::Platform,
            Hierarchy::Lockout,
        ]
        .into_iter()
        .map(|h| {
            (
                h,
                HierarchyState {
                    auth: Vec::new(),
                    enabled: true,
                },
            )
        })
        .collect();
        Self {
            hierarchies,
            disable_clear: false,
            owner_seed: 0,
            persistent: BTreeMap::new(),
            transient: BTreeMap::new(),
            resources: BTreeMap::new(),
            sessions: BTreeMap::new(),
            nv: BTreeMap::new(),
            authorizations: Vec::new(),
            next_handle: 0,
        }
    }
}

impl MockState {
    fn hierarchy(&self, h: Hierarchy) -> &HierarchyState {
        &self.hierarchies[&h]
    }

    fn hierarchy_mut(&mut self, h: Hierarchy) -> &mut HierarchyState {
        self.hierarchies.entry(h).or_insert_with(|| HierarchyState {
            auth: Vec::new(),
            enabled: true,
        })
    }

    fn object(&self, object: ObjectContext) -> Result<&ObjectPublic> {
        self.transient
            .get(&object.0)
            .or_else(|| {
                self.resources
                    .get(&object.0)
                    .and_then(|handle| self.persistent.get(handle))
            })
            .ok_or(CommandError::HandleNotFound(object.0))
    }

    fn open_resource(&mut self, handle: u32) -> ObjectContext {
        let resource = RESOURCE_FIRST + self.next();
        self.resources.insert(resource, handle);
        ObjectContext(resource)
    }

    fn next(&mut self) -> u32 {
        self.next_handle += 1;
        self.next_handle
    }
}

/// A connection to the in-memory TPM. Auth values handed to
/// [`Tpm2Commands::set_hierarchy_auth`] are local to this value, like they
/// are to an ESYS context.
#[derive(Debug, Default)]
pub struct MockTpm {
    state: Rc<RefCell<MockState>>,
    auth: HashMap<Hierarchy, Vec<u8>>,
}

impl MockTpm {
    /// A cleared TPM with no persistent objects or NV indices.
    pub fn new() -> Self {
        Self::default()
    }

    /// A cleared TPM whose manufacturer stored the test EK certificate.
    pub fn certified() -> Self {
        let tpm = Self::new();
        let cert = test_ek_cert().to_vec();
        tpm.state.borrow_mut().nv.insert(
            EK_CERT_NV_INDEX,
            NvIndex {
                public: NvPublic {
                    index: EK_CERT_NV_INDEX,
                    size: cert.len() as u16,
                    hierarchy: Hierarchy::Platform,
                    written: true,
                },
                auth: Vec::new(),
                data: cert,
            },
        );
        tpm
    }

    /// Another connection to the same TPM.
    pub fn reopen(&self) -> Self {
        Self {
            state: Rc::clone(&self.state),
            auth: HashMap::new(),
        }
    }

    /// Changes a hierarchy auth value behind this connection's back.
    pub fn set_auth(&self, hierarchy: Hierarchy, auth: &[u8]) {
        self.state.borrow_mut().hierarchy_mut(hierarchy).auth = auth.to_vec();
    }

    pub fn auth(&self, hierarchy: Hierarchy) -> Vec<u8> {
        self.state.borrow().hierarchy(hierarchy).auth.clone()
    }

    pub fn set_hierarchy_enabled(&self, hierarchy: Hierarchy, enabled: bool) {
        self.state.borrow_mut().hierarchy_mut(hierarchy).enabled = enabled;
    }

    /// Persists a key created under the storage hierarchy at `handle`. It has
    /// the EK template but is not an endorsement primary key.
    pub fn persist_child_key(&self, handle: u32) {
        let mut state = self.state.borrow_mut();
        let key = RsaPublic::new(derive(b"child", &[]), 0);
        let name = object_name(KeyTemplate::Ek, key.modulus());
        let qualified_name = primary_qualified_name(Hierarchy::Owner, &[0x11; 34]);
        state.persistent.insert(
            handle,
            ObjectPublic {
                template: Some(KeyTemplate::Ek),
                key: Some(key),
                name,
                qualified_name,
            },
        );
    }

    pub fn persistent(&self, handle: u32) -> Option<ObjectPublic> {
        self.state.borrow().persistent.get(&handle).cloned()
    }

    pub fn nv_indices(&self) -> Vec<u32> {
        self.state.borrow().nv.keys().copied().collect()
    }

    pub fn disable_clear(&self) -> bool {
        self.state.borrow().disable_clear
    }

    pub fn transient_count(&self) -> usize {
        self.state.borrow().transient.len()
    }

    pub fn session_count(&self) -> usize {
        self.state.borrow().sessions.len()
    }

    /// Contexts for persistent objects that were never closed.
    pub fn resource_count(&self) -> usize {
        self.state.borrow().resources.len()
    }

    /// How each call of `command` was authorized, oldest first.
    pub fn authorizations(&self, command: &str) -> Vec<Authorization> {
        self.state
            .borrow()
            .authorizations
            .iter()
            .filter(|(c, _)| *c == command)
            .map(|(_, a)| *a)
            .collect()
    }

    fn local_auth(&self, hierarchy: Hierarchy) -> &[u8] {
        self.auth.get(&hierarchy).map(Vec::as_slice).unwrap_or_default()
    }

    fn authorize(&self, hierarchy: Hierarchy) -> Result<()> {
        let state = self.state.borrow();
        let h = state.hierarchy(hierarchy);
        if !h.enabled {
            return Err(CommandError::HierarchyDisabled);
        }
        if h.auth != self.local_auth(hierarchy) {
            return Err(CommandError::AuthFail);
        }
        Ok(())
    }

    /// Authorizes `command` on `hierarchy` with a password or a started
    /// session. A policy session must have passed TPM2_PolicySecret for that
    /// hierarchy.
    fn authorize_with(
        &self,
        command: &'static str,
        hierarchy: Hierarchy,
        session: Option<SessionContext>,
    ) -> Result<()> {
        let session = session
            .map(|session| {
                self.state
                    .borrow()
                    .sessions
                    .get(&session.0)
                    .copied()
                    .ok_or(CommandError::HandleNotFound(session.0))
            })
            .transpose()?;
        let authorization = match session {
            None => Authorization::Password,
            Some(Session {
                kind: SessionKind::Hmac,
                ..
            }) => Authorization::Hmac,
            Some(Session {
                kind: SessionKind::Policy,
                secret,
            }) => {
                if !self.state.borrow().hierarchy(hierarchy).enabled {
                    return Err(CommandError::HierarchyDisabled);
                }
                if secret != Some(hierarchy) {
                    return Err(CommandError::AuthFail);
                }
                Authorization::Policy
            }
        };
        if authorization != Authorization::Policy {
            self.authorize(hierarchy)?;
        }
        self.state
            .borrow_mut()
            .authorizations
            .push((command, authorization));
        Ok(())
    }

    fn start_session(&mut self, kind: SessionKind) -> Result<SessionContext> {
        let mut state = self.state.borrow_mut();
        if state.sessions.len() >= MAX_SESSIONS {
            return Err(CommandError::ResourceExhausted);
        }
        let handle = SESSION_FIRST + state.next();
        state.sessions.insert(handle, Session { kind, secret: None });
        Ok(SessionContext(handle))
    }
}

fn derive(label: &[u8], seed: &[u8]) -> Vec<u8> {
    let mut modulus = Vec::with_capacity(256);
    let mut counter = 0u32;
    while modulus.len() < 256 {
        let mut hasher = Sha256::new();
        hasher.update(label);
        hasher.update(seed);
        hasher.update(counter.to_be_bytes());
        modulus.extend_from_slice(&hasher.finalize());
        counter += 1;
    }
    modulus[0] |= 0x80;
    modulus
}

fn object_name(template: KeyTemplate, unique: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update([template as u8]);
    hasher.update(unique);
    [NAME_ALG_SHA256.as_slice(), &hasher.finalize()].concat()
}

impl Tpm2Commands for MockTpm {
    fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }

    fn read_property(&mut self, property: Property) -> Result<u32> {
        let state = self.state.borrow();
        let bit = |set: bool, n: u32| u32::from(set) << n;
        Ok(match property {
            Property::Permanent => {
                bit(!state.hierarchy(Hierarchy::Owner).auth.is_empty(), 0)
                    | bit(!state.hierarchy(Hierarchy::Endorsement).auth.is_empty(), 1)
                    | bit(!state.hierarchy(Hierarchy::Lockout).auth.is_empty(), 2)
                    | bit(state.disable_clear, 8)
            }
            Property::StartupClear => {
                bit(state.hierarchy(Hierarchy::Platform).enabled, 0)
                    | bit(state.hierarchy(Hierarchy::Owner).enabled, 1)
                    | bit(state.hierarchy(Hierarchy::Endorsement).enabled, 2)
                    | bit(true, 31)
            }
        })
    }

    fn start_hmac_session(&mut self, salt: Option<ObjectContext>) -> Result<SessionContext> {
        if let Some(salt) = salt {
            self.state.borrow().object(salt)?;
        }
        self.start_session(SessionKind::Hmac)
    }

    fn start_policy_session(&mut self) -> Result<SessionContext> {
        self.start_session(SessionKind::Policy)
    }

    fn policy_secret(&mut self, session: SessionContext, hierarchy: Hierarchy) -> Result<()> {
        let kind = self.state.borrow().sessions.get(&session.0).map(|s| s.kind);
        match kind {
            Some(SessionKind::Policy) => {}
            Some(SessionKind::Hmac) => return Err(CommandError::Tpm("not a policy session".into())),
            None => return Err(CommandError::HandleNotFound(session.0)),
        }
        self.authorize(hierarchy)?;
        if let Some(s) = self.state.borrow_mut().sessions.get_mut(&session.0) {
            s.secret = Some(hierarchy);
        }
        Ok(())
    }

    fn flush_context(&mut self, object: ObjectContext) -> Result<()> {
        self.state
            .borrow_mut()
            .transient
            .remove(&object.0)
            .map(|_| ())
            .ok_or(CommandError::HandleNotFound(object.0))
    }

    fn flush_session(&mut self, session: SessionContext) -> Result<()> {
        self.state
            .borrow_mut()
            .sessions
            .remove(&session.0)
            .map(|_| ())
            .ok_or(CommandError::HandleNotFound(session.0))
    }

    fn load_persistent(&mut self, handle: u32) -> Result<ObjectContext> {
        let mut state = self.state.borrow_mut();
        match state.persistent.contains_key(&handle) {
            true => Ok(state.open_resource(handle)),
            false => Err(CommandError::HandleNotFound(handle)),
        }
    }

    fn close_persistent(&mut self, object: ObjectContext) -> Result<()> {
        self.state
            .borrow_mut()
            .resources
            .remove(&object.0)
            .map(|_| ())
            .ok_or(CommandError::HandleNotFound(object.0))
    }

    fn read_public(&mut self, object: ObjectContext) -> Result<ObjectPublic> {
        self.state.borrow().object(object).cloned()
    }

    fn create_primary(
        &mut self,
        hierarchy: Hierarchy,
        template: KeyTemplate,
        sensitive: Option<&[u8]>,
        session: Option<SessionContext>,
    ) -> Result<(ObjectContext, ObjectPublic)> {
        self.authorize_with("create_primary", hierarchy, session)?;
        let mut state = self.state.borrow_mut();
        if state.transient.len() >= MAX_TRANSIENT {
            return Err(CommandError::ResourceExhausted);
        }

        let (key, unique) = match (hierarchy, template, sensitive) {
            (Hierarchy::Endorsement, KeyTemplate::Ek, None) => {
                let key = RsaPublic::from(&test_ek_key().to_public_key());
                let unique = key.modulus().to_vec();
                (Some(key), unique)
            }
            (_, KeyTemplate::Ek, _) => {
                let key = RsaPublic::new(derive(b"ek", sensitive.unwrap_or_default()), 0);
                let unique = key.modulus().to_vec();
                (Some(key), unique)
            }
            (_, KeyTemplate::Srk, _) => {
                let seed = [
                    state.owner_seed.to_be_bytes().as_slice(),
                    sensitive.unwrap_or_default(),
                ]
                .concat();
                (None, derive(b"srk", &seed))
            }
        };

        let name = object_name(template, &unique);
        let public = ObjectPublic {
            template: Some(template),
            key,
            qualified_name: primary_qualified_name(hierarchy, &name),
            name,
        };
        let handle = TRANSIENT_FIRST + state.next();
        state.transient.insert(handle, public.clone());
        Ok((ObjectContext(handle), public))
    }

    fn persist_object(&mut self, object: ObjectContext, handle: u32) -> Result<ObjectContext> {
        self.authorize(Hierarchy::Owner)?;
        let mut state = self.state.borrow_mut();
        if state.persistent.contains_key(&handle) {
            return Err(CommandError::NvDefined(handle));
        }
        let public = state
            .transient
            .get(&object.0)
            .cloned()
            .ok_or(CommandError::HandleNotFound(object.0))?;
        state.persistent.insert(handle, public);
        Ok(state.open_resource(handle))
    }

    fn evict_persistent(&mut self, object: ObjectContext) -> Result<()> {
        self.authorize(Hierarchy::Owner)?;
        let mut state = self.state.borrow_mut();
        let handle = state
            .resources
            .get(&object.0)
            .copied()
            .ok_or(CommandError::HandleNotFound(object.0))?;
        state
            .persistent
            .remove(&handle)
            .ok_or(CommandError::HandleNotFound(handle))?;
        state.resources.remove(&object.0);
        Ok(())
    }

    fn set_hierarchy_auth(&mut self, hierarchy: Hierarchy, auth: &[u8]) -> Result<()> {
        self.auth.insert(hierarchy, auth.to_vec());
        Ok(())
    }

    fn hierarchy_change_auth(
        &mut self,
        hierarchy: Hierarchy,
        auth: &[u8],
        session: Option<SessionContext>,
    ) -> Result<()> {
        self.authorize_with("hierarchy_change_auth", hierarchy, session)?;
        self.state.borrow_mut().hierarchy_mut(hierarchy).auth = auth.to_vec();
        self.auth.insert(hierarchy, auth.to_vec());
        Ok(())
    }

    fn clear(&mut self, hierarchy: Hierarchy) -> Result<()> {
        if !matches!(hierarchy, Hierarchy::Lockout | Hierarchy::Platform) {
            return Err(CommandError::Tpm("clear requires lockout or platform".into()));
        }
        self.authorize(hierarchy)?;
        let mut state = self.state.borrow_mut();
        if state.disable_clear {
            return Err(CommandError::Disabled);
        }
        for h in [Hierarchy::Owner, Hierarchy::Endorsement, Hierarchy::Lockout] {
            state.hierarchy_mut(h).auth.clear();
        }
        state.persistent.clear();
        state.nv.retain(|_, nv| nv.public.hierarchy == Hierarchy::Platform);
        state.owner_seed += 1;
        drop(state);
        for h in [Hierarchy::Owner, Hierarchy::Endorsement, Hierarchy::Lockout] {
            self.auth.remove(&h);
        }
        Ok(())
    }

    fn clear_control(&mut self, hierarchy: Hierarchy, disable: bool) -> Result<()> {
        match hierarchy {
            Hierarchy::Platform => {}
            // only the platform may re-enable clear
            Hierarchy::Lockout if disable => {}
            _ => return Err(CommandError::AuthFail),
        }
        self.authorize(hierarchy)?;
        self.state.borrow_mut().disable_clear = disable;
        Ok(())
    }

    fn nv_define_space(
        &mut self,
        hierarchy: Hierarchy,
        public: &NvPublic,
        auth: &[u8],
        session: Option<SessionContext>,
    ) -> Result<()> {
        if public.hierarchy != hierarchy {
            return Err(CommandError::Tpm("NV attributes do not match hierarchy".into()));
        }
        self.authorize_with("nv_define_space", hierarchy, session)?;
        let mut state = self.state.borrow_mut();
        if state.nv.contains_key(&public.index) {
            return Err(CommandError::NvDefined(public.index));
        }
        if state.nv.len() >= MAX_NV_INDICES {
            return Err(CommandError::ResourceExhausted);
        }
        state.nv.insert(
            public.index,
            NvIndex {
                public: NvPublic {
                    written: false,
                    ..public.clone()
                },
                auth: auth.to_vec(),
                data: vec![0; public.size as usize],
            },
        );
        Ok(())
    }

    fn nv_undefine_space(&mut self, hierarchy: Hierarchy, index: u32) -> Result<()> {
        self.authorize(hierarchy)?;
        let mut state = self.state.borrow_mut();
        match state.nv.get(&index) {
            None => Err(CommandError::HandleNotFound(index)),
            Some(nv) if nv.public.hierarchy != hierarchy => Err(CommandError::AuthFail),
            Some(_) => {
                state.nv.remove(&index);
                Ok(())
            }
        }
    }

    fn nv_write(&mut self, index: u32, auth: &[u8], data: &[u8], offset: u16) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let nv = state
            .nv
            .get_mut(&index)
            .ok_or(CommandError::HandleNotFound(index))?;
        if nv.auth != auth {
            return Err(CommandError::AuthFail);
        }
        let start = offset as usize;
        let end = start + data.len();
        if end > nv.public.size as usize {
            return Err(CommandError::Tpm("NV write out of range".into()));
        }
        nv.data[start..end].copy_from_slice(data);
        nv.public.written = true;
        Ok(())
    }

    fn nv_read(&mut self, index: u32, auth: &[u8]) -> Result<Vec<u8>> {
        let state = self.state.borrow();
        let nv = state
            .nv
            .get(&index)
            .ok_or(CommandError::HandleNotFound(index))?;
        if nv.auth != auth {
            return Err(CommandError::AuthFail);
        }
        match nv.public.written {
            true => Ok(nv.data.clone()),
            false => Err(CommandError::Tpm("NV index not initialized".into())),
        }
    }

    fn nv_read_public(&mut self, index: u32) -> Result<NvPublic> {
        self.state
            .borrow()
            .nv
            .get(&index)
            .map(|nv| nv.public.clone())
            .ok_or(CommandError::HandleNotFound(index))
    }

    fn handles(&mut self, first: u32, count: u32) -> Result<Vec<u32>> {
        let state = self.state.borrow();
        let mut handles: Vec<u32> = state
            .persistent
            .keys()
            .chain(state.transient.keys())
            .chain(state.sessions.keys())
            .chain(state.nv.keys())
            .copied()
            .filter(|h| *h >= first && h >> 24 == first >> 24)
            .collect();
        handles.sort_unstable();
        handles.truncate(count as usize);
        Ok(handles)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::Result;

    #[test]
    fn genuine_ek_is_stable() -> Result<()> {
        let mut tpm = MockTpm::new();
        let (a, public_a) =
            tpm.create_primary(Hierarchy::Endorsement, KeyTemplate::Ek, None, None)?;
        let (b, public_b) =
            tpm.create_primary(Hierarchy::Endorsement, KeyTemplate::Ek, None, None)?;
        assert_eq!(public_a, public_b);
        assert!(public_a.is_primary(Hierarchy::Endorsement, KeyTemplate::Ek));
        assert_eq!(
            public_a.key,
            Some(RsaPublic::from(&test_ek_key().to_public_key()))
        );
        assert_eq!(
            public_a.key.as_ref().map(|k| k.modulus().len()),
            Some(test_ek_key().size())
        );
        tpm.flush_context(a)?;
        tpm.flush_context(b)?;

        let (c, other) =
            tpm.create_primary(Hierarchy::Endorsement, KeyTemplate::Ek, Some(b"foo"), None)?;
        assert_ne!(other.key, public_a.key);
        tpm.flush_context(c)?;
        Ok(())
    }

    #[test]
    fn slots_are_limited() -> Result<()> {
        let mut tpm = MockTpm::new();
        for _ in 0..MAX_TRANSIENT {
            tpm.create_primary(Hierarchy::Owner, KeyTemplate::Srk, None, None)?;
        }
        assert_eq!(
            tpm.create_primary(Hierarchy::Owner, KeyTemplate::Srk, None, None),
            Err(CommandError::ResourceExhausted)
        );
        Ok(())
    }

    #[test]
    fn auth_is_per_connection() -> Result<()> {
        let mut tpm = MockTpm::new();
        tpm.hierarchy_change_auth(Hierarchy::Owner, b"secret", None)?;
        tpm.create_primary(Hierarchy::Owner, KeyTemplate::Srk, None, None)
            .map(|(key, _)| tpm.flush_context(key))??;

        let mut other = tpm.reopen();
        assert_eq!(
            other.create_primary(Hierarchy::Owner, KeyTemplate::Srk, None, None),
            Err(CommandError::AuthFail)
        );
        other.set_hierarchy_auth(Hierarchy::Owner, b"secret")?;
        other
            .create_primary(Hierarchy::Owner, KeyTemplate::Srk, None, None)
            .map(|(key, _)| other.flush_context(key))??;
        Ok(())
    }

    #[test]
    fn clear_resets_owner_state() -> Result<()> {
        let mut tpm = MockTpm::certified();
        tpm.hierarchy_change_auth(Hierarchy::Endorsement, b"1234", None)?;
        tpm.persist_child_key(0x8101_0001);

        tpm.clear(Hierarchy::Platform)?;

        assert!(tpm.auth(Hierarchy::Endorsement).is_empty());
        assert!(tpm.persistent(0x8101_0001).is_none());
        assert_eq!(tpm.nv_indices(), vec![EK_CERT_NV_INDEX]);
        Ok(())
    }

    #[test]
    fn clear_can_be_disabled() -> Result<()> {
        let mut tpm = MockTpm::new();
        tpm.clear_control(Hierarchy::Lockout, true)?;
        assert_eq!(tpm.clear(Hierarchy::Lockout), Err(CommandError::Disabled));
        assert_eq!(
            tpm.clear_control(Hierarchy::Lockout, false),
            Err(CommandError::AuthFail)
        );
        tpm.clear_control(Hierarchy::Platform, false)?;
        tpm.clear(Hierarchy::Lockout)?;
        Ok(())
    }

    #[test]
    fn policy_session_needs_secret() -> Result<()> {
        let mut tpm = MockTpm::new();
        tpm.set_auth(Hierarchy::Endorsement, b"1234");
        let session = tpm.start_policy_session()?;
        assert_eq!(
            tpm.create_primary(Hierarchy::Endorsement, KeyTemplate::Ek, None, Some(session)),
            Err(CommandError::AuthFail)
        );
        assert_eq!(
            tpm.policy_secret(session, Hierarchy::Endorsement),
            Err(CommandError::AuthFail)
        );

        tpm.set_hierarchy_auth(Hierarchy::Endorsement, b"1234")?;
        tpm.policy_secret(session, Hierarchy::Endorsement)?;
        assert_eq!(
            tpm.create_primary(Hierarchy::Owner, KeyTemplate::Srk, None, Some(session)),
            Err(CommandError::AuthFail)
        );
        let (ek, _) =
            tpm.create_primary(Hierarchy::Endorsement, KeyTemplate::Ek, None, Some(session))?;
        assert_eq!(
            tpm.authorizations("create_primary"),
            vec![Authorization::Policy]
        );
        tpm.flush_context(ek)?;
        tpm.flush_session(session)?;
        Ok(())
    }

    #[test]
    fn hmac_session_uses_hierarchy_auth() -> Result<()> {
        let mut tpm = MockTpm::new();
        let session = tpm.start_hmac_session(None)?;
        tpm.hierarchy_change_auth(Hierarchy::Owner, b"secret", Some(session))?;

        let mut other = tpm.reopen();
        let session = other.start_hmac_session(None)?;
        assert_eq!(
            other.create_primary(Hierarchy::Owner, KeyTemplate::Srk, None, Some(session)),
            Err(CommandError::AuthFail)
        );
        assert_eq!(
            tpm.authorizations("hierarchy_change_auth"),
            vec![Authorization::Hmac]
        );
        Ok(())
    }

    #[test]
    fn nv_read_needs_index_auth() -> Result<()> {
        let mut tpm = MockTpm::new();
        let public = NvPublic {
            index: 0x0180_0000,
            size: 4,
            hierarchy: Hierarchy::Owner,
            written: false,
        };
        tpm.nv_define_space(Hierarchy::Owner, &public, b"pin", None)?;
        tpm.nv_write(0x0180_0000, b"pin", &[1, 2, 3, 4], 0)?;
        assert_eq!(tpm.nv_read(0x0180_0000, b""), Err(CommandError::AuthFail));
        assert_eq!(tpm.nv_read(0x0180_0000, b"pin")?, vec![1, 2, 3, 4]);
        Ok(())
    }

    #[test]
    fn persistent_contexts_are_counted() -> Result<()> {
        let mut tpm = MockTpm::new();
        tpm.persist_child_key(0x8100_0001);
        let a = tpm.load_persistent(0x8100_0001)?;
        let b = tpm.load_persistent(0x8100_0001)?;
        assert_ne!(a, b);
        assert_eq!(tpm.resource_count(), 2);

        tpm.close_persistent(a)?;
        assert_eq!(tpm.close_persistent(a), Err(CommandError::HandleNotFound(a.0)));
        tpm.evict_persistent(b)?;
        assert_eq!(tpm.resource_count(), 0);
        assert!(tpm.persistent(0x8100_0001).is_none());
        Ok(())
    }
}
