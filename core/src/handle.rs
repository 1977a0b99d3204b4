// SPDX-License-Identifier: MIT

//! Handle values and the handle-type discrimination baked into their most
//! significant octet (MSO).
//!
//! A `TPM_HANDLE` is just a `u32`, but the top byte names a handle class
//! (`TPM_HT`) and the low three bytes are an index within that class. The
//! types here make that split explicit so callers cannot, for example, pass
//! a PCR index where a transient object handle is expected.

use crate::error::{TpmCoreError, TpmResult};
use crate::types::Class;

/// The handle class encoded in a handle's most significant octet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleType {
    Pcr,
    NvIndex,
    HmacSession,
    PolicySession,
    Permanent,
    Transient,
    Persistent,
    AttachedComponent,
    ExternalNv,
    PermanentNv,
}

impl HandleType {
    fn from_mso(mso: u8) -> Option<Self> {
        match mso {
            0x00 => Some(Self::Pcr),
            0x01 => Some(Self::NvIndex),
            0x02 => Some(Self::HmacSession),
            0x03 => Some(Self::PolicySession),
            0x40 => Some(Self::Permanent),
            0x80 => Some(Self::Transient),
            0x81 => Some(Self::Persistent),
            0x90 => Some(Self::AttachedComponent),
            0xA0 => Some(Self::ExternalNv),
            0xA1 => Some(Self::PermanentNv),
            _ => None,
        }
    }

    fn mso(self) -> u8 {
        match self {
            Self::Pcr => 0x00,
            Self::NvIndex => 0x01,
            Self::HmacSession => 0x02,
            Self::PolicySession => 0x03,
            Self::Permanent => 0x40,
            Self::Transient => 0x80,
            Self::Persistent => 0x81,
            Self::AttachedComponent => 0x90,
            Self::ExternalNv => 0xA0,
            Self::PermanentNv => 0xA1,
        }
    }

    /// True for `HmacSession` and `PolicySession`, the two classes that
    /// name a live session context rather than an object or a constant.
    #[must_use]
    pub fn is_session(self) -> bool {
        matches!(self, Self::HmacSession | Self::PolicySession)
    }
}

impl From<HandleType> for Class {
    fn from(ty: HandleType) -> Class {
        match ty {
            HandleType::Pcr => Class::Pcr,
            HandleType::NvIndex => Class::NvIndex,
            HandleType::HmacSession => Class::HmacSession,
            HandleType::PolicySession => Class::PolicySession,
            HandleType::Permanent => Class::Permanent,
            HandleType::Transient => Class::Transient,
            HandleType::Persistent => Class::Persistent,
            // `TPM_HT_AC`, `TPM_HT_EXT_NV`, and `TPM_HT_PERMANENT_NV` have no
            // `Class` counterpart in the teacher's enumeration; these handle
            // kinds are out of this crate's scope beyond being recognised as
            // well-formed, and fall back to the closest NV-flavoured class.
            HandleType::AttachedComponent => Class::Persistent,
            HandleType::ExternalNv | HandleType::PermanentNv => Class::NvIndex,
        }
    }
}

/// A 32-bit TPM handle, decomposed into its class and index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TpmHandle(pub u32);

impl TpmHandle {
    #[must_use]
    pub fn new(value: u32) -> Self {
        TpmHandle(value)
    }

    #[must_use]
    pub fn value(self) -> u32 {
        self.0
    }

    /// The handle's class, derived from its most significant octet.
    ///
    /// # Errors
    ///
    /// Returns [`TpmCoreError::Malformed`] if the MSO does not name a known
    /// `TPM_HT` value.
    pub fn handle_type(self) -> TpmResult<HandleType> {
        let mso = (self.0 >> 24) as u8;
        HandleType::from_mso(mso).ok_or_else(|| TpmCoreError::Malformed {
            command_code: 0,
            context: format!("handle {:#010x} has unrecognised type octet {:#04x}", self.0, mso),
        })
    }

    /// Asserts the handle belongs to `expected`, returning the 24-bit index
    /// within that class on success.
    ///
    /// # Errors
    ///
    /// Returns [`TpmCoreError::Precondition`] if the handle's actual type
    /// does not match `expected`.
    pub fn require_type(self, expected: HandleType) -> TpmResult<u32> {
        let actual = self.handle_type()?;
        if actual == expected {
            Ok(self.0 & 0x00FF_FFFF)
        } else {
            Err(TpmCoreError::Precondition {
                context: format!(
                    "handle {:#010x} has type {:?}, expected {:?}",
                    self.0, actual, expected
                ),
            })
        }
    }

    #[must_use]
    pub fn transient(index: u32) -> Self {
        TpmHandle((HandleType::Transient.mso() as u32) << 24 | (index & 0x00FF_FFFF))
    }

    #[must_use]
    pub fn persistent(index: u32) -> Self {
        TpmHandle((HandleType::Persistent.mso() as u32) << 24 | (index & 0x00FF_FFFF))
    }

    #[must_use]
    pub fn pcr(index: u32) -> Self {
        TpmHandle((HandleType::Pcr.mso() as u32) << 24 | (index & 0x00FF_FFFF))
    }

    /// `TPM_RS_PW`, the degenerate handle identifying the password session.
    pub const PASSWORD: TpmHandle = TpmHandle(0x4000_0009);

    /// True for the one permanent handle that means "use a password
    /// session" rather than naming a live session context.
    #[must_use]
    pub fn is_password_pseudo_handle(self) -> bool {
        self == Self::PASSWORD
    }
}

impl From<u32> for TpmHandle {
    fn from(value: u32) -> Self {
        TpmHandle(value)
    }
}

impl From<TpmHandle> for u32 {
    fn from(handle: TpmHandle) -> u32 {
        handle.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_handle_layout() {
        let h = TpmHandle::transient(5);
        assert_eq!(h.value(), 0x8000_0005);
        assert_eq!(h.handle_type().unwrap(), HandleType::Transient);
    }

    #[test]
    fn password_pseudo_handle_is_permanent_and_recognised() {
        let h = TpmHandle::PASSWORD;
        assert_eq!(h.handle_type().unwrap(), HandleType::Permanent);
        assert!(h.is_password_pseudo_handle());
        assert!(!TpmHandle::transient(1).is_password_pseudo_handle());
    }

    #[test]
    fn require_type_rejects_mismatch() {
        let h = TpmHandle::transient(1);
        assert!(h.require_type(HandleType::Transient).is_ok());
        assert!(h.require_type(HandleType::Persistent).is_err());
    }

    #[test]
    fn unrecognised_mso_is_malformed() {
        let h = TpmHandle(0x2000_0001);
        assert!(matches!(h.handle_type(), Err(TpmCoreError::Malformed { .. })));
    }
}
