//! The TPM2 commands a connection is built from.
//!
//! [`Tpm2Commands`] names only the commands the connection, provisioning and
//! NV code issue, in terms of plain handles and small owned structures. The
//! same logic runs against hardware through [`super::esapi::EsapiTpm`] and
//! against an in-memory TPM in tests.

use ambassador::delegatable_trait;
use rsa::traits::PublicKeyParts;
use rsa::RsaPublicKey;
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

/// TPM_ALG_SHA256, the name algorithm of every object this crate creates.
pub const NAME_ALG_SHA256: [u8; 2] = [0x00, 0x0b];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    #[error("authorization failed")]
    AuthFail,
    #[error("handle {0:#010x} does not exist")]
    HandleNotFound(u32),
    #[error("NV index {0:#010x} is already defined")]
    NvDefined(u32),
    #[error("hierarchy is disabled")]
    HierarchyDisabled,
    #[error("command is disabled")]
    Disabled,
    #[error("out of TPM resources")]
    ResourceExhausted,
    #[error("cannot reach TPM: {0}")]
    Transport(String),
    #[error("TPM error: {0}")]
    Tpm(String),
}

pub type Result<T, E = CommandError> = core::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hierarchy {
    Owner,
    Endorsement,
    Platform,
    Lockout,
}

impl Hierarchy {
    /// The permanent TPM handle of the hierarchy.
    pub fn handle(self) -> u32 {
        match self {
            Hierarchy::Owner => 0x4000_0001,
            Hierarchy::Lockout => 0x4000_000a,
            Hierarchy::Endorsement => 0x4000_000b,
            Hierarchy::Platform => 0x4000_000c,
        }
    }
}

impl fmt::Display for Hierarchy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Hierarchy::Owner => "owner",
            Hierarchy::Endorsement => "endorsement",
            Hierarchy::Platform => "platform",
            Hierarchy::Lockout => "lockout",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Property {
    /// TPM_PT_PERMANENT
    Permanent,
    /// TPM_PT_STARTUP_CLEAR
    StartupClear,
}

/// TPMA_PERMANENT
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermanentAttributes(pub u32);

impl PermanentAttributes {
    pub fn owner_auth_set(self) -> bool {
        self.0 & (1 << 0) != 0
    }

    pub fn endorsement_auth_set(self) -> bool {
        self.0 & (1 << 1) != 0
    }

    pub fn lockout_auth_set(self) -> bool {
        self.0 & (1 << 2) != 0
    }

    pub fn disable_clear(self) -> bool {
        self.0 & (1 << 8) != 0
    }
}

/// TPMA_STARTUP_CLEAR
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StartupClearAttributes(pub u32);

impl StartupClearAttributes {
    pub fn platform_enabled(self) -> bool {
        self.0 & (1 << 0) != 0
    }

    pub fn owner_enabled(self) -> bool {
        self.0 & (1 << 1) != 0
    }

    pub fn endorsement_enabled(self) -> bool {
        self.0 & (1 << 2) != 0
    }
}

/// A loaded object, by its resource handle within the command layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectContext(pub u32);

/// A started auth session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionContext(pub u32);

/// Public templates this crate creates primary keys from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTemplate {
    /// TCG default RSA 2048 endorsement key.
    Ek,
    /// ECC P-256 storage root key.
    Srk,
}

/// An RSA public key in TPM terms: big endian modulus and a 32 bit exponent.
///
/// Values are kept normalised (no leading zero bytes on the modulus, and the
/// TPM's "default" exponent of 0 spelled out as 65537) so equality compares
/// keys rather than encodings.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RsaPublic {
    modulus: Vec<u8>,
    exponent: u32,
}

impl RsaPublic {
    pub const DEFAULT_EXPONENT: u32 = 65537;

    pub fn new(modulus: impl Into<Vec<u8>>, exponent: u32) -> Self {
        let mut modulus = modulus.into();
        let zeros = modulus.iter().take_while(|b| **b == 0).count();
        modulus.drain(..zeros);
        let exponent = match exponent {
            0 => Self::DEFAULT_EXPONENT,
            e => e,
        };
        Self { modulus, exponent }
    }

    pub fn modulus(&self) -> &[u8] {
        &self.modulus
    }

    pub fn exponent(&self) -> u32 {
        self.exponent
    }
}

impl From<&RsaPublicKey> for RsaPublic {
    fn from(key: &RsaPublicKey) -> Self {
        let e = key.e().to_bytes_be();
        let exponent = e.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b));
        Self::new(key.n().to_bytes_be(), exponent)
    }
}

/// What [`Tpm2Commands::read_public`] reports about a loaded object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectPublic {
    /// Set when the public area matches one of our templates, ignoring the
    /// unique field.
    pub template: Option<KeyTemplate>,
    pub key: Option<RsaPublic>,
    pub name: Vec<u8>,
    pub qualified_name: Vec<u8>,
}

impl ObjectPublic {
    /// True if this object is a primary key of `hierarchy` created from
    /// `template`. A child key made persistent at the same handle has a
    /// different qualified name even if its template matches.
    pub fn is_primary(&self, hierarchy: Hierarchy, template: KeyTemplate) -> bool {
        self.template == Some(template)
            && self.qualified_name == primary_qualified_name(hierarchy, &self.name)
    }
}

/// Qualified name of a primary object: its hierarchy's handle is the parent's
/// qualified name.
pub fn primary_qualified_name(hierarchy: Hierarchy, name: &[u8]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(hierarchy.handle().to_be_bytes());
    hasher.update(name);
    let mut qn = NAME_ALG_SHA256.to_vec();
    qn.extend_from_slice(&hasher.finalize());
    qn
}

/// Public area of an NV index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NvPublic {
    pub index: u32,
    pub size: u16,
    /// Owner or platform; decides which hierarchy may undefine the index.
    pub hierarchy: Hierarchy,
    pub written: bool,
}

/// Commands that need an authorization take a `session`: `None` authorizes
/// with a plain password session, `Some` uses a started HMAC or policy
/// session, which also encrypts the first parameter of the command.
#[delegatable_trait]
pub trait Tpm2Commands {
    /// TPM2_Shutdown(CLEAR).
    fn shutdown(&mut self) -> crate::tpm::command::Result<()>;

    fn read_property(&mut self, property: Property) -> crate::tpm::command::Result<u32>;

    /// Starts an HMAC session, salted with `salt` when given.
    fn start_hmac_session(
        &mut self,
        salt: Option<ObjectContext>,
    ) -> crate::tpm::command::Result<SessionContext>;

    fn start_policy_session(&mut self) -> crate::tpm::command::Result<SessionContext>;

    /// TPM2_PolicySecret with `hierarchy` as the authorizing entity.
    fn policy_secret(
        &mut self,
        session: SessionContext,
        hierarchy: Hierarchy,
    ) -> crate::tpm::command::Result<()>;

    fn flush_context(&mut self, object: ObjectContext) -> crate::tpm::command::Result<()>;

    fn flush_session(&mut self, session: SessionContext) -> crate::tpm::command::Result<()>;

    /// Obtains a context for the persistent object at `handle`. It must be
    /// released with [`Self::close_persistent`] or [`Self::evict_persistent`].
    fn load_persistent(&mut self, handle: u32) -> crate::tpm::command::Result<ObjectContext>;

    /// Releases a context for a persistent object. The object stays in the TPM.
    fn close_persistent(&mut self, object: ObjectContext) -> crate::tpm::command::Result<()>;

    fn read_public(&mut self, object: ObjectContext) -> crate::tpm::command::Result<ObjectPublic>;

    /// Creates a transient primary key. `sensitive` becomes the key's
    /// sensitive data and perturbs the derived key.
    fn create_primary(
        &mut self,
        hierarchy: Hierarchy,
        template: KeyTemplate,
        sensitive: Option<&[u8]>,
        session: Option<SessionContext>,
    ) -> crate::tpm::command::Result<(ObjectContext, ObjectPublic)>;

    /// TPM2_EvictControl of a transient object to `handle`, authorized by the
    /// owner hierarchy. Returns a context for the new persistent object.
    fn persist_object(
        &mut self,
        object: ObjectContext,
        handle: u32,
    ) -> crate::tpm::command::Result<ObjectContext>;

    /// TPM2_EvictControl of a persistent object, removing it. This releases
    /// the context too.
    fn evict_persistent(&mut self, object: ObjectContext) -> crate::tpm::command::Result<()>;

    /// Tells the command layer the auth value to use for `hierarchy`. Does not
    /// talk to the TPM.
    fn set_hierarchy_auth(
        &mut self,
        hierarchy: Hierarchy,
        auth: &[u8],
    ) -> crate::tpm::command::Result<()>;

    /// TPM2_HierarchyChangeAuth. Also updates the locally known auth value.
    fn hierarchy_change_auth(
        &mut self,
        hierarchy: Hierarchy,
        auth: &[u8],
        session: Option<SessionContext>,
    ) -> crate::tpm::command::Result<()>;

    fn clear(&mut self, hierarchy: Hierarchy) -> crate::tpm::command::Result<()>;

    fn clear_control(
        &mut self,
        hierarchy: Hierarchy,
        disable: bool,
    ) -> crate::tpm::command::Result<()>;

    fn nv_define_space(
        &mut self,
        hierarchy: Hierarchy,
        public: &crate::tpm::command::NvPublic,
        auth: &[u8],
        session: Option<SessionContext>,
    ) -> crate::tpm::command::Result<()>;

    fn nv_undefine_space(
        &mut self,
        hierarchy: Hierarchy,
        index: u32,
    ) -> crate::tpm::command::Result<()>;

    /// Writes `data` at `offset`, authorized by the index's own auth value.
    fn nv_write(
        &mut self,
        index: u32,
        auth: &[u8],
        data: &[u8],
        offset: u16,
    ) -> crate::tpm::command::Result<()>;

    /// Reads the whole index, authorized by the index's own auth value
    /// (TPMA_NV_AUTHREAD).
    fn nv_read(&mut self, index: u32, auth: &[u8]) -> crate::tpm::command::Result<Vec<u8>>;

    fn nv_read_public(
        &mut self,
        index: u32,
    ) -> crate::tpm::command::Result<crate::tpm::command::NvPublic>;

    /// Handles in use, starting at `first`, at most `count`.
    fn handles(&mut self, first: u32, count: u32) -> crate::tpm::command::Result<Vec<u32>>;
}
