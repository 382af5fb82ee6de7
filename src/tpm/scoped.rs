use super::command::{ObjectContext, Result, SessionContext, Tpm2Commands};
use std::ops::{Deref, DerefMut};

/// Something occupying a TPM transient or session slot.
pub trait Flush: Copy + std::fmt::Debug {
    fn flush<T: Tpm2Commands + ?Sized>(self, tpm: &mut T) -> Result<()>;
}

impl Flush for ObjectContext {
    fn flush<T: Tpm2Commands + ?Sized>(self, tpm: &mut T) -> Result<()> {
        tpm.flush_context(self)
    }
}

impl Flush for SessionContext {
    fn flush<T: Tpm2Commands + ?Sized>(self, tpm: &mut T) -> Result<()> {
        tpm.flush_session(self)
    }
}

/// Borrows the TPM while holding a transient object or session, flushing it
/// when dropped unless [`Scoped::keep`] hands it back first.
pub struct Scoped<'a, T: Tpm2Commands + ?Sized, H: Flush> {
    tpm: &'a mut T,
    handle: H,
    armed: bool,
}

impl<'a, T: Tpm2Commands + ?Sized, H: Flush> Scoped<'a, T, H> {
    pub fn new(tpm: &'a mut T, handle: H) -> Self {
        Self {
            tpm,
            handle,
            armed: true,
        }
    }

    pub fn handle(&self) -> H {
        self.handle
    }

    /// Releases the guard without flushing.
    pub fn keep(mut self) -> H {
        self.armed = false;
        self.handle
    }
}

impl<T: Tpm2Commands + ?Sized, H: Flush> Deref for Scoped<'_, T, H> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        self.tpm
    }
}

impl<T: Tpm2Commands + ?Sized, H: Flush> DerefMut for Scoped<'_, T, H> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.tpm
    }
}

impl<T: Tpm2Commands + ?Sized, H: Flush> Drop for Scoped<'_, T, H> {
    fn drop(&mut self) {
        if self.armed {
            if let Err(e) = self.handle.flush(self.tpm) {
                log::warn!("Failed to flush {:?}: {}", self.handle, e);
            }
        }
    }
}
