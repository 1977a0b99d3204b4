// SPDX-License-Identifier: MIT
#![deny(clippy::all)]
#![deny(clippy::pedantic)]

//! TPM 2.0 command execution core.
//!
//! This crate assembles TPM 2.0 commands, carries them across a pluggable
//! [`transport::Transport`], verifies HMAC-session response integrity, and
//! decodes the handful of response shapes it knows about — all sensitive
//! bytes (nonces, HMAC tags, session keys, authorization values) routed
//! through a zero-on-release memory [`pool::Pool`] rather than ordinary heap
//! allocations.
//!
//! The entry point for most callers is [`executor::Executor`]; [`session`]
//! and [`handle`] build the pieces it composes.

mod decoders;
mod error;
mod executor;
mod handle;
mod hash;
mod pool;
mod registry;
mod session;
mod transport;
mod types;
mod wire;

pub use decoders::{
    register_builtin, FlushContextResponse, GetCapabilityResponse, GetRandomResponse, PcrReadResponse, PcrSelection,
    StartAuthSessionResponse,
};
pub use error::{TpmCoreError, TpmResult};
pub use executor::{CommandInput, DefaultNameResolver, Executor, ExecutorConfig, NameResolver};
pub use handle::{HandleType, TpmHandle};
pub use hash::HashAlg;
pub use pool::{Pool, SensitiveBuffer};
pub use registry::{Decoder, DecodedResponse, Registry, RegistryBuilder, TypedResponse};
pub use session::{HmacSession, PasswordSession, Session};
#[cfg(unix)]
pub use transport::LinuxDeviceTransport;
#[cfg(all(windows, feature = "tbs"))]
pub use transport::TbsTransport;
pub use transport::{SimulatorTransport, Transport, TransportError};
pub use types::{
    Algorithm, Capability, Class, Command, Handle, ObjectAttributes, Response, ResponseCode, SessionAttributes,
    SessionType, Tag, CAP_LAST, CAP_VENDOR_PROPERTY, CC_FIRST, CC_LAST, RC_FMT1, RC_VER1, RC_WARN,
};
pub use wire::{Reader, Writer};
