use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use super::command::{
    CommandError, Hierarchy, KeyTemplate, ObjectContext, PermanentAttributes, Property,
    SessionContext, Tpm2Commands,
};
use super::connection::{EkCredential, TpmConnection};
use super::scoped::Scoped;
use super::{auth_fail, Result, TpmError, EK_HANDLE, SRK_HANDLE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ProvisionMode {
    /// Create the EK and SRK and set owner and endorsement auth values.
    WithoutLockout,
    /// As above, then set the lockout auth value and disable owner clear.
    Full,
    /// Clear the TPM through the lockout hierarchy first, then as `Full`.
    Clear,
}

/// New auth values for the hierarchies. `None` leaves a value alone.
///
/// The values the TPM currently has must already be known to the connection,
/// see [`Tpm2Commands::set_hierarchy_auth`].
#[derive(Default, Clone)]
pub struct HierarchyAuthValues {
    pub owner: Option<Zeroizing<Vec<u8>>>,
    pub endorsement: Option<Zeroizing<Vec<u8>>>,
    pub lockout: Option<Zeroizing<Vec<u8>>>,
}

impl std::fmt::Debug for HierarchyAuthValues {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HierarchyAuthValues")
            .field("owner", &self.owner.as_ref().map(|_| "<redacted>"))
            .field("endorsement", &self.endorsement.as_ref().map(|_| "<redacted>"))
            .field("lockout", &self.lockout.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Makes sure a primary key from `template` lives at `handle`, keeping a
/// correct one and evicting anything else found there. A new key is created
/// in `session`.
fn ensure_persistent_primary<T: Tpm2Commands + ?Sized>(
    tpm: &mut T,
    hierarchy: Hierarchy,
    template: KeyTemplate,
    handle: u32,
    session: Option<SessionContext>,
) -> Result<ObjectContext> {
    match tpm.load_persistent(handle) {
        Ok(existing) => {
            let public = match tpm.read_public(existing) {
                Ok(public) => public,
                Err(e) => {
                    tpm.close_persistent(existing).ok();
                    return Err(e.into());
                }
            };
            if public.is_primary(hierarchy, template) {
                log::debug!("Keeping {:?} at {:#010x}", template, handle);
                return Ok(existing);
            }
            log::info!("Evicting unexpected object at {:#010x}", handle);
            tpm.evict_persistent(existing)
                .map_err(auth_fail(Hierarchy::Owner))?;
        }
        Err(CommandError::HandleNotFound(_)) => {}
        Err(e) => return Err(e.into()),
    }

    let (transient, _) = tpm
        .create_primary(hierarchy, template, None, session)
        .map_err(auth_fail(hierarchy))?;
    let mut transient = Scoped::new(tpm, transient);
    let object = transient.handle();
    let persistent = transient
        .persist_object(object, handle)
        .map_err(auth_fail(Hierarchy::Owner))?;
    log::info!("Persisted {:?} at {:#010x}", template, handle);
    Ok(persistent)
}

fn clear<T: Tpm2Commands>(conn: &mut TpmConnection<T>) -> Result<()> {
    let permanent = PermanentAttributes(conn.read_property(Property::Permanent)?);
    if permanent.disable_clear() {
        return Err(TpmError::ClearRequiresPpi);
    }
    // the connection's EK does not survive a clear
    conn.replace_ek(None)?;
    conn.clear(Hierarchy::Lockout).map_err(|e| match e {
        CommandError::Disabled => TpmError::ClearRequiresPpi,
        CommandError::AuthFail => TpmError::AuthFail(Hierarchy::Lockout),
        e => e.into(),
    })?;
    for hierarchy in [Hierarchy::Owner, Hierarchy::Endorsement, Hierarchy::Lockout] {
        conn.set_hierarchy_auth(hierarchy, &[])?;
    }
    log::info!("Cleared TPM");
    Ok(())
}

/// Brings the TPM into the state sealed keys rely on: canonical EK and SRK
/// persisted, hierarchy auth values set, and for [`ProvisionMode::Full`] the
/// lockout hierarchy locked down.
///
/// Running it again on a provisioned TPM changes nothing except re-asserting
/// the auth values.
pub fn provision_tpm<T: Tpm2Commands>(
    conn: &mut TpmConnection<T>,
    mode: ProvisionMode,
    values: &HierarchyAuthValues,
) -> Result<()> {
    if mode == ProvisionMode::Clear {
        clear(conn)?;
    }

    let session = conn.hmac_session();
    let ek = ensure_persistent_primary(
        conn,
        Hierarchy::Endorsement,
        KeyTemplate::Ek,
        EK_HANDLE,
        session,
    )?;
    conn.replace_ek(Some(EkCredential::Persistent(ek)))?;

    // new auth values travel encrypted in the session salted with the EK
    let session = conn.hmac_session();
    let srk =
        ensure_persistent_primary(conn, Hierarchy::Owner, KeyTemplate::Srk, SRK_HANDLE, session)?;
    conn.close_persistent(srk).map_err(TpmError::Cleanup)?;

    if let Some(auth) = &values.owner {
        conn.hierarchy_change_auth(Hierarchy::Owner, auth, session)
            .map_err(auth_fail(Hierarchy::Owner))?;
    }
    if let Some(auth) = &values.endorsement {
        conn.hierarchy_change_auth(Hierarchy::Endorsement, auth, session)
            .map_err(auth_fail(Hierarchy::Endorsement))?;
    }

    if mode != ProvisionMode::WithoutLockout {
        if let Some(auth) = &values.lockout {
            conn.hierarchy_change_auth(Hierarchy::Lockout, auth, session)
                .map_err(auth_fail(Hierarchy::Lockout))?;
        }
        conn.clear_control(Hierarchy::Lockout, true)
            .map_err(auth_fail(Hierarchy::Lockout))?;
    }

    log::info!("Provisioned TPM ({:?})", mode);
    Ok(())
}
