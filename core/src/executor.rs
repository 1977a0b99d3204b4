// SPDX-License-Identifier: MIT

//! The command executor: assembles a command, submits it through a
//! [`crate::transport::Transport`], verifies each session's response HMAC,
//! and decodes the parameter area through the [`crate::registry::Registry`].

use std::sync::Arc;

use log::{debug, trace};

use crate::error::{TpmCoreError, TpmResult};
use crate::handle::TpmHandle;
use crate::hash::HashAlg;
use crate::pool::Pool;
use crate::registry::{Registry, TypedResponse};
use crate::session::Session;
use crate::transport::Transport;
use crate::types::{Response, ResponseCode, Tag};
use crate::wire::{Reader, Writer};

/// Resolves a handle to the `TPM2B_NAME` bytes `cpHash` must hash.
///
/// Permanent and transient handles name themselves (the handle value is
/// the name); every other handle class requires a TPM-side lookup this
/// crate does not perform, so [`DefaultNameResolver`] rejects them. A
/// caller that needs persistent-object or NV-index names supplies its own
/// resolver, typically backed by a cache of `TPM2_ReadPublic`/`NV_ReadPublic`
/// results.
pub trait NameResolver: Send + Sync {
    /// Returns the bytes `cpHash` should fold in for `handle`.
    ///
    /// # Errors
    ///
    /// Returns [`TpmCoreError::Precondition`] if this resolver cannot name
    /// the handle's class.
    fn name(&self, handle: TpmHandle) -> TpmResult<Vec<u8>>;
}

/// Names permanent and transient handles as themselves; refuses every
/// other handle class.
pub struct DefaultNameResolver;

impl NameResolver for DefaultNameResolver {
    fn name(&self, handle: TpmHandle) -> TpmResult<Vec<u8>> {
        use crate::handle::HandleType;
        match handle.handle_type()? {
            HandleType::Permanent | HandleType::Transient => Ok(handle.value().to_be_bytes().to_vec()),
            other => Err(TpmCoreError::Precondition {
                context: format!("default name resolver cannot name a {other:?} handle without a TPM round-trip"),
            }),
        }
    }
}

/// Tunables that do not change the wire protocol but shape the executor's
/// behaviour around it.
pub struct ExecutorConfig {
    /// Upper bound on a response's size; the executor allocates a buffer
    /// of this size before calling `transport.submit`. TPM 2.0 devices
    /// commonly cap responses at 4096 bytes; this default matches that.
    pub max_response_size: usize,
    /// When true, logs the command code and response code of every
    /// executed command at `log::debug!`. Never logs parameter or
    /// auth-area bytes.
    pub trace_commands: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        ExecutorConfig {
            max_response_size: 4096,
            trace_commands: true,
        }
    }
}

/// A fully-assembled command, ready for [`Executor::execute`] /
/// [`Executor::execute_raw`].
pub struct CommandInput<'a> {
    pub command_code: u32,
    pub handles: &'a [TpmHandle],
    pub sessions: &'a mut [Session],
    /// Already-serialised command parameters (everything after the
    /// optional authorization area).
    pub parameters: &'a [u8],
    /// How many response handles this command returns, so the executor
    /// knows how many bytes to skip before the optional `parameterSize`
    /// field / the parameter area.
    pub response_handle_count: usize,
}

/// Executes commands against a [`Transport`], using a [`Registry`] to
/// decode known response shapes and a [`NameResolver`] to compute
/// `cpHash` for non-permanent, non-transient handles.
pub struct Executor {
    pool: Arc<Pool>,
    registry: Arc<Registry>,
    transport: Box<dyn Transport>,
    name_resolver: Box<dyn NameResolver>,
    config: ExecutorConfig,
}

impl Executor {
    #[must_use]
    pub fn new(pool: Arc<Pool>, registry: Arc<Registry>, transport: Box<dyn Transport>) -> Self {
        Executor {
            pool,
            registry,
            transport,
            name_resolver: Box::new(DefaultNameResolver),
            config: ExecutorConfig::default(),
        }
    }

    #[must_use]
    pub fn with_name_resolver(mut self, resolver: Box<dyn NameResolver>) -> Self {
        self.name_resolver = resolver;
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    /// Executes `input`, decoding the parameter area with the registered
    /// decoder for `input.command_code`.
    ///
    /// # Errors
    ///
    /// Returns [`TpmCoreError::Precondition`] if no decoder is registered
    /// for the command. Otherwise propagates any failure from assembly,
    /// transport, parsing, or session verification.
    pub fn execute<T: Send + 'static>(&mut self, input: CommandInput<'_>) -> TpmResult<TypedResponse<T>> {
        let command_code = input.command_code;
        let raw = self.execute_raw(input)?;
        let mut reader = Reader::new(&raw.parameters);
        let value = self
            .registry
            .decode::<T>(command_code, &mut reader, &self.pool)
            .ok_or_else(|| TpmCoreError::Precondition {
                context: format!("no decoder registered for command {command_code:#010x}"),
            })??;
        Ok(TypedResponse { header: raw, value })
    }

    /// Executes `input` without decoding the parameter area, returning it
    /// verbatim. This is the path unregistered commands use.
    ///
    /// # Errors
    ///
    /// Propagates any failure from assembly, transport, response parsing,
    /// or session verification.
    pub fn execute_raw(&mut self, mut input: CommandInput<'_>) -> TpmResult<Response> {
        let command_code = input.command_code;
        let request = self.build_request(&mut input)?;

        let mut response_buf = vec![0u8; self.config.max_response_size];
        let (n, platform_rc) = self
            .transport
            .submit(&request, &mut response_buf)
            .map_err(|err| TpmCoreError::TransportFailure {
                command_code,
                context: err.to_string(),
            })?;
        if platform_rc != 0 {
            return Err(TpmCoreError::TransportFailure {
                command_code,
                context: format!("platform returned code {platform_rc:#x}"),
            });
        }
        response_buf.truncate(n);

        self.parse_response(command_code, &response_buf, input.response_handle_count, input.sessions)
    }

    fn build_request(&self, input: &mut CommandInput<'_>) -> TpmResult<Vec<u8>> {
        let has_sessions = !input.sessions.is_empty();
        let tag = if has_sessions { Tag::Sessions } else { Tag::NoSessions };

        let mut writer = Writer::new();
        writer.write_u16(tag as u16);
        writer.write_u32(0); // commandSize placeholder, patched below
        writer.write_u32(input.command_code);

        for handle in input.handles {
            writer.write_u32(handle.value());
        }

        if has_sessions {
            let cp_hash = self.compute_cp_hash(input)?;

            let auth_size: usize = input
                .sessions
                .iter()
                .map(Session::auth_command_size)
                .collect::<TpmResult<Vec<_>>>()?
                .into_iter()
                .sum();
            writer.write_u32(auth_size as u32);

            let before = writer.position();
            for session in input.sessions.iter_mut() {
                session.write_auth_command(&mut writer, &cp_hash, input.command_code)?;
            }
            debug_assert_eq!(writer.position() - before, auth_size, "authSize must match the bytes actually written");
        }

        writer.write_bytes(input.parameters);

        let total = writer.position();
        writer.patch_u32(2, total as u32);

        let request = writer.into_vec();
        if self.config.trace_commands {
            trace!(
                "tpm2_core: request command={:#010x} bytes={}",
                input.command_code,
                request.len()
            );
        }
        Ok(request)
    }

    /// `cpHash = H(commandCode || name(handle_1) || … || parameters)`,
    /// computed with the hash algorithm of the first HMAC session present.
    /// Password-only session sets never reach here with a meaningful
    /// result requirement (password auth ignores `cpHash`), but a stable
    /// algorithm (SHA-256) is still used so the computation is total.
    fn compute_cp_hash(&self, input: &CommandInput<'_>) -> TpmResult<Vec<u8>> {
        let alg = input
            .sessions
            .iter()
            .find_map(Session::cp_hash_alg)
            .unwrap_or(HashAlg::Sha256);

        let mut data = input.command_code.to_be_bytes().to_vec();
        for handle in input.handles {
            data.extend(self.name_resolver.name(*handle)?);
        }
        data.extend_from_slice(input.parameters);
        Ok(alg.digest(&data))
    }

    fn parse_response(
        &self,
        command_code: u32,
        bytes: &[u8],
        response_handle_count: usize,
        sessions: &mut [Session],
    ) -> TpmResult<Response> {
        let mut reader = Reader::new(bytes);
        let tag_raw = reader.read_u16(command_code)?;
        let tag = Tag::from_repr(tag_raw);
        let size = reader.read_u32(command_code)?;
        let rc_raw = reader.read_u32(command_code)?;

        if self.config.trace_commands {
            debug!("tpm2_core: response command={command_code:#010x} rc={rc_raw:#010x} size={size}");
        }

        if rc_raw != 0 {
            return Err(TpmCoreError::TpmResponse { command_code, rc: rc_raw });
        }

        let mut handles = Vec::with_capacity(response_handle_count);
        for _ in 0..response_handle_count {
            handles.push(TpmHandle::new(reader.read_u32(command_code)?));
        }

        let has_sessions = !sessions.is_empty();
        let (parameters, auth_area): (Vec<u8>, &[u8]) = if has_sessions {
            let parameter_size = reader.read_u32(command_code)? as usize;
            let parameters = reader.read_bytes(parameter_size, command_code)?.to_vec();
            let auth_area = reader.read_bytes(reader.remaining(), command_code)?;
            (parameters, auth_area)
        } else {
            let rest = reader.remaining();
            (reader.read_bytes(rest, command_code)?.to_vec(), &[])
        };

        if has_sessions {
            let alg = sessions.iter().find_map(Session::cp_hash_alg).unwrap_or(HashAlg::Sha256);
            let mut rp_data = rc_raw.to_be_bytes().to_vec();
            rp_data.extend_from_slice(&command_code.to_be_bytes());
            rp_data.extend_from_slice(&parameters);
            let rp_hash = alg.digest(&rp_data);

            let mut auth_reader = Reader::new(auth_area);
            for session in sessions.iter_mut() {
                session.verify_and_update(&mut auth_reader, &rp_hash, command_code)?;
            }
        }

        Ok(Response {
            tag,
            size,
            rc: ResponseCode::from(rc_raw),
            handles,
            parameters,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::PasswordSession;
    use crate::transport::SimulatorTransport;
    use crate::types::Command;

    #[test]
    fn sessionless_command_round_trips_through_simulator() {
        let pool = Arc::new(Pool::new());
        let registry = Arc::new(
            Registry::builder()
                .register(Command::GetRandom as u32, |reader, pool| {
                    reader.read_tpm2b_sensitive(pool, Command::GetRandom as u32)
                })
                .build(),
        );
        let transport = SimulatorTransport::new(|request, response| {
            // Echo back a fixed-length random blob regardless of request.
            let mut w = Writer::new();
            w.write_u16(Tag::NoSessions as u16);
            w.write_u32(0);
            w.write_u32(0);
            w.write_tpm2b(&[0xAA, 0xBB, 0xCC, 0xDD]);
            let body = w.into_vec();
            assert!(request.len() >= 10);
            response[..body.len()].copy_from_slice(&body);
            Ok((body.len(), 0))
        });

        let mut executor = Executor::new(pool, registry, Box::new(transport));
        let mut sessions: [Session; 0] = [];
        let mut params = Writer::new();
        params.write_u16(4);
        let input = CommandInput {
            command_code: Command::GetRandom as u32,
            handles: &[],
            sessions: &mut sessions,
            parameters: &params.into_vec(),
            response_handle_count: 0,
        };

        let response: TypedResponse<Option<crate::pool::SensitiveBuffer>> = executor.execute(input).unwrap();
        let bytes = response.value.unwrap().to_vec().unwrap();
        assert_eq!(bytes, vec![0xAA, 0xBB, 0xCC, 0xDD]);
    }

    #[test]
    fn non_zero_response_code_is_surfaced_verbatim() {
        let pool = Arc::new(Pool::new());
        let registry = Arc::new(Registry::builder().build());
        let transport = SimulatorTransport::new(|_request, response| {
            let mut w = Writer::new();
            w.write_u16(Tag::NoSessions as u16);
            w.write_u32(10);
            w.write_u32(0x0000_0144); // TPM_RC_FAILURE-ish non-zero code
            let body = w.into_vec();
            response[..body.len()].copy_from_slice(&body);
            Ok((body.len(), 0))
        });

        let mut executor = Executor::new(pool, registry, Box::new(transport));
        let mut sessions: [Session; 0] = [];
        let input = CommandInput {
            command_code: Command::SelfTest as u32,
            handles: &[],
            sessions: &mut sessions,
            parameters: &[],
            response_handle_count: 0,
        };

        let err = executor.execute_raw(input).unwrap_err();
        match err {
            TpmCoreError::TpmResponse { rc, .. } => assert_eq!(rc, 0x0000_0144),
            other => panic!("expected TpmResponse, got {other:?}"),
        }
    }

    #[test]
    fn poisoned_session_aborts_before_submit() {
        let pool = Arc::new(Pool::new());
        let registry = Arc::new(Registry::builder().build());
        let transport = SimulatorTransport::new(|_req, _resp| panic!("must not submit with a poisoned session"));
        let mut executor = Executor::new(pool.clone(), registry, Box::new(transport));

        let alg = HashAlg::Sha256;
        let tpm_nonce = pool.rent(alg.digest_size()).unwrap();
        let mut hmac_session = crate::session::HmacSession::new(pool, TpmHandle::transient(1), alg, tpm_nonce).unwrap();
        // Force poisoning by feeding a bad response auth area once.
        let bad = vec![0u8; 2 + alg.digest_size() + 1 + 2 + 32];
        let mut r = Reader::new(&bad);
        let _ = hmac_session.verify_and_update(&mut r, &[0u8; 32], 0);

        let mut sessions = [Session::Hmac(hmac_session)];
        let input = CommandInput {
            command_code: Command::GetRandom as u32,
            handles: &[],
            sessions: &mut sessions,
            parameters: &[],
            response_handle_count: 0,
        };

        let err = executor.execute_raw(input).unwrap_err();
        assert!(matches!(err, TpmCoreError::SessionPoisoned { .. }));
    }

    #[test]
    fn password_session_does_not_require_hmac_session() {
        let session = Session::Password(PasswordSession::new(b"pw"));
        assert!(!session.is_poisoned());
    }
}
