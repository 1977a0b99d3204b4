// SPDX-License-Identifier: MIT

//! Authorization sessions: the password degenerate case and the full HMAC
//! session with nonce rotation, per TCG Part 1 §§17–19.

use std::sync::Arc;

use log::warn;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::error::{TpmCoreError, TpmResult};
use crate::handle::TpmHandle;
use crate::hash::HashAlg;
use crate::pool::{Pool, SensitiveBuffer};
use crate::types::SessionAttributes;
use crate::wire::{Reader, Writer};

/// Widest digest this crate supports (SHA-512), also the largest single
/// `sessionKey`, `authValue`, nonce, or cpHash/rpHash the protocol ever
/// produces.
const MAX_DIGEST_SIZE: usize = 64;

/// Capacity for the assembled HMAC key: `sessionKey || authValue`.
const HMAC_KEY_CAPACITY: usize = 2 * MAX_DIGEST_SIZE;

/// Capacity for the assembled HMAC input: `cpHash`/`rpHash`, two nonces,
/// and one attributes byte.
const HMAC_DATA_CAPACITY: usize = 3 * MAX_DIGEST_SIZE + 1;

/// A fixed-capacity, zero-on-drop scratch buffer for secret-derived HMAC
/// inputs. Used in place of a heap `Vec<u8>` so assembling an HMAC key or
/// input never leaves a copy of session secrets on the general heap.
struct ScratchBuf<const N: usize> {
    bytes: Zeroizing<[u8; N]>,
    len: usize,
}

impl<const N: usize> ScratchBuf<N> {
    fn new() -> Self {
        ScratchBuf {
            bytes: Zeroizing::new([0u8; N]),
            len: 0,
        }
    }

    fn push(&mut self, data: &[u8]) -> TpmResult<()> {
        let end = self.len + data.len();
        if end > N {
            return Err(TpmCoreError::Precondition {
                context: format!("hmac scratch buffer overflow: {end} > {N}"),
            });
        }
        let buf: &mut [u8] = &mut *self.bytes;
        buf[self.len..end].copy_from_slice(data);
        self.len = end;
        Ok(())
    }

    fn as_slice(&self) -> &[u8] {
        let buf: &[u8] = &*self.bytes;
        &buf[..self.len]
    }
}

impl<const N: usize> std::ops::Deref for ScratchBuf<N> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

/// One `TPMS_AUTH_COMMAND`/`TPMS_AUTH_RESPONSE` pair's worth of behaviour.
///
/// `Password` and `Hmac` are the only two variants the protocol defines at
/// this layer (policy sessions build on the same HMAC machinery and are out
/// of this crate's scope). Dispatch happens once per command, not once per
/// byte, so a plain enum match costs nothing that matters.
pub enum Session {
    Password(PasswordSession),
    Hmac(HmacSession),
}

impl Session {
    #[must_use]
    pub fn handle(&self) -> TpmHandle {
        match self {
            Self::Password(_) => TpmHandle::PASSWORD,
            Self::Hmac(s) => s.handle,
        }
    }

    #[must_use]
    pub fn is_poisoned(&self) -> bool {
        match self {
            Self::Password(_) => false,
            Self::Hmac(s) => s.poisoned,
        }
    }

    /// The hash algorithm `cpHash`/`rpHash` must use to involve this
    /// session, if any (a password session does not bind a hash).
    #[must_use]
    pub fn cp_hash_alg(&self) -> Option<HashAlg> {
        match self {
            Self::Password(_) => None,
            Self::Hmac(s) => Some(s.hash_alg),
        }
    }

    /// The encoded size of this session's `TPMS_AUTH_COMMAND`, needed by
    /// the executor to reserve `authSize` before it has computed `cpHash`.
    pub fn auth_command_size(&self) -> TpmResult<usize> {
        match self {
            Self::Password(s) => Ok(4 + 2 + 1 + 2 + s.password.len()),
            Self::Hmac(s) => {
                if s.poisoned {
                    return Err(TpmCoreError::SessionPoisoned { command_code: 0 });
                }
                Ok(4 + 2 + s.nonce_caller.len() + 1 + 2 + s.hash_alg.digest_size())
            }
        }
    }

    /// Writes this session's `TPMS_AUTH_COMMAND` using the shared `cpHash`.
    pub fn write_auth_command(&mut self, writer: &mut Writer, cp_hash: &[u8], command_code: u32) -> TpmResult<()> {
        match self {
            Self::Password(s) => {
                writer.write_u32(TpmHandle::PASSWORD.value());
                writer.write_tpm2b(&[]);
                writer.write_u8(0);
                writer.write_tpm2b(&s.password);
                Ok(())
            }
            Self::Hmac(s) => s.write_auth_command(writer, cp_hash, command_code),
        }
    }

    /// Parses and verifies this session's `TPMS_AUTH_RESPONSE` using the
    /// shared `rpHash`. On an HMAC session this rotates the nonces.
    pub fn verify_and_update(&mut self, reader: &mut Reader, rp_hash: &[u8], command_code: u32) -> TpmResult<()> {
        match self {
            Self::Password(_) => {
                // A password session's response auth area is present on
                // the wire but carries no information worth checking: per
                // §4.5 its verification always succeeds. Skip past it.
                let _nonce = reader.read_tpm2b(command_code)?;
                let _attrs = reader.read_u8(command_code)?;
                let _hmac = reader.read_tpm2b(command_code)?;
                Ok(())
            }
            Self::Hmac(s) => s.verify_and_update(reader, rp_hash, command_code),
        }
    }
}

/// The degenerate password session: `TPM_RS_PW` plus a raw password.
pub struct PasswordSession {
    password: Vec<u8>,
}

impl PasswordSession {
    /// An empty password is explicitly legal and yields an empty `hmac`
    /// field on the wire.
    #[must_use]
    pub fn new(password: &[u8]) -> Self {
        PasswordSession {
            password: password.to_vec(),
        }
    }
}

/// A live HMAC authorization session.
pub struct HmacSession {
    pool: Arc<Pool>,
    handle: TpmHandle,
    hash_alg: HashAlg,
    nonce_tpm: SensitiveBuffer,
    nonce_caller: SensitiveBuffer,
    session_key: Option<SensitiveBuffer>,
    auth_value: Option<SensitiveBuffer>,
    attributes: SessionAttributes,
    poisoned: bool,
}

impl HmacSession {
    /// Builds a session from a `TPM2_StartAuthSession` response: takes
    /// ownership of `nonce_tpm`, and immediately samples a same-size
    /// `nonceCaller`. `sessionKey` and `authValue` both start genuinely
    /// empty (neither salt nor bind were negotiated by this core's
    /// `TPM2_StartAuthSession` path; see `DESIGN.md`), so they contribute
    /// zero bytes to the HMAC key until `set_auth_value` is called.
    ///
    /// # Errors
    ///
    /// Propagates pool exhaustion from sampling the initial `nonceCaller`.
    pub fn new(pool: Arc<Pool>, handle: TpmHandle, hash_alg: HashAlg, nonce_tpm: SensitiveBuffer) -> TpmResult<Self> {
        let nonce_caller = fresh_nonce(&pool, hash_alg)?;
        Ok(HmacSession {
            pool,
            handle,
            hash_alg,
            nonce_tpm,
            nonce_caller,
            session_key: None,
            auth_value: None,
            attributes: SessionAttributes::ContinueSession,
            poisoned: false,
        })
    }

    /// Replaces the stored authValue. Trailing zero bytes are stripped per
    /// Part 1 §19.6.4 (password-derived auth values are conventionally
    /// zero-padded to a hash block size before this truncation rule
    /// applies), and an all-zero or empty value is stored as `None` so it
    /// contributes nothing to the HMAC key concatenation.
    pub fn set_auth_value(&mut self, bytes: &[u8]) -> TpmResult<()> {
        let trimmed = strip_trailing_zeros(bytes);
        self.auth_value = if trimmed.is_empty() {
            None
        } else {
            Some(self.pool.rent_copy(trimmed)?)
        };
        Ok(())
    }

    /// Assembles the raw `sessionKey || authValue` HMAC key with no length
    /// prefix, in a zero-on-drop stack buffer. Either half that has not
    /// been negotiated contributes exactly zero bytes.
    fn hmac_key(&self) -> TpmResult<ScratchBuf<HMAC_KEY_CAPACITY>> {
        let mut key = ScratchBuf::new();
        if let Some(session_key) = &self.session_key {
            session_key.with_bytes(|b| key.push(b))??;
        }
        if let Some(auth_value) = &self.auth_value {
            auth_value.with_bytes(|b| key.push(b))??;
        }
        Ok(key)
    }

    fn write_auth_command(&mut self, writer: &mut Writer, cp_hash: &[u8], command_code: u32) -> TpmResult<()> {
        if self.poisoned {
            return Err(TpmCoreError::SessionPoisoned { command_code });
        }

        let mut data = ScratchBuf::<HMAC_DATA_CAPACITY>::new();
        data.push(cp_hash)?;
        self.nonce_caller.with_bytes(|b| data.push(b))??;
        self.nonce_tpm.with_bytes(|b| data.push(b))??;
        data.push(&[self.attributes.bits()])?;

        let hmac_key = self.hmac_key()?;
        let tag = self.hash_alg.hmac(&hmac_key, &data)?;

        writer.write_u32(self.handle.value());
        self.nonce_caller.with_bytes(|b| writer.write_tpm2b(b))?;
        writer.write_u8(self.attributes.bits());
        writer.write_tpm2b(&tag);
        Ok(())
    }

    pub(crate) fn verify_and_update(&mut self, reader: &mut Reader, rp_hash: &[u8], command_code: u32) -> TpmResult<()> {
        if self.poisoned {
            return Err(TpmCoreError::SessionPoisoned { command_code });
        }

        let new_nonce_tpm = reader
            .read_tpm2b_sensitive(&self.pool, command_code)?
            .ok_or_else(|| TpmCoreError::Malformed {
                command_code,
                context: "HMAC session response carried an empty nonceTPM".to_string(),
            })?;
        let response_attrs = SessionAttributes::from_bits_truncate(reader.read_u8(command_code)?);
        let hmac_tag = reader.read_tpm2b(command_code)?;

        let mut data = ScratchBuf::<HMAC_DATA_CAPACITY>::new();
        data.push(rp_hash)?;
        new_nonce_tpm.with_bytes(|b| data.push(b))??;
        self.nonce_caller.with_bytes(|b| data.push(b))??;
        data.push(&[response_attrs.bits()])?;

        let hmac_key = self.hmac_key()?;
        let expected = self.hash_alg.hmac(&hmac_key, &data)?;

        if !constant_time_eq(&expected, &hmac_tag) {
            self.poisoned = true;
            warn!("session {:#010x}: response HMAC verification failed", self.handle.value());
            return Err(TpmCoreError::IntegrityFailure { command_code });
        }

        self.nonce_tpm = new_nonce_tpm;
        self.nonce_caller = fresh_nonce(&self.pool, self.hash_alg)?;
        Ok(())
    }
}

fn fresh_nonce(pool: &Pool, hash_alg: HashAlg) -> TpmResult<SensitiveBuffer> {
    let mut nonce = pool.rent(hash_alg.digest_size())?;
    nonce.with_bytes_mut(|b| rand::thread_rng().fill_bytes(b))?;
    Ok(nonce)
}

fn strip_trailing_zeros(bytes: &[u8]) -> &[u8] {
    let mut end = bytes.len();
    while end > 0 && bytes[end - 1] == 0 {
        end -= 1;
    }
    &bytes[..end]
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_session_auth_command_size_matches_password_length() {
        let session = Session::Password(PasswordSession::new(b"hunter2"));
        assert_eq!(session.auth_command_size().unwrap(), 4 + 2 + 1 + 2 + 7);
    }

    #[test]
    fn empty_password_is_legal() {
        let session = Session::Password(PasswordSession::new(b""));
        assert_eq!(session.auth_command_size().unwrap(), 4 + 2 + 1 + 2);
    }

    #[test]
    fn strip_trailing_zeros_leaves_non_zero_suffix_alone() {
        assert_eq!(strip_trailing_zeros(b"abc\0\0"), b"abc");
        assert_eq!(strip_trailing_zeros(b"\0\0\0"), b"");
        assert_eq!(strip_trailing_zeros(b"abc"), b"abc");
    }

    #[test]
    fn constant_time_eq_rejects_length_mismatch() {
        assert!(!constant_time_eq(b"abc", b"ab"));
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
    }

    #[test]
    fn hmac_session_nonce_rotates_on_successful_verify() {
        let pool = Arc::new(Pool::new());
        let alg = HashAlg::Sha256;
        let mut tpm_nonce = pool.rent(alg.digest_size()).unwrap();
        tpm_nonce.with_bytes_mut(|b| b.fill(0x11)).unwrap();
        let mut session = HmacSession::new(pool.clone(), TpmHandle::transient(1), alg, tpm_nonce).unwrap();

        let cp_hash = [0u8; 32];
        let mut writer = Writer::new();
        session.write_auth_command(&mut writer, &cp_hash, 0x17B).unwrap();

        // Reconstruct the expected response HMAC independently to build a
        // well-formed TPMS_AUTH_RESPONSE the session should accept.
        let rp_hash = [1u8; 32];
        let mut new_nonce = vec![0x22u8; alg.digest_size()];
        new_nonce[0] = 0x22;
        let key = session.hmac_key().unwrap();
        let mut data = rp_hash.to_vec();
        data.extend_from_slice(&new_nonce);
        session.nonce_caller.with_bytes(|b| data.extend_from_slice(b)).unwrap();
        data.push(0);
        let tag = alg.hmac(&key, &data).unwrap();

        let mut resp = Writer::new();
        resp.write_tpm2b(&new_nonce);
        resp.write_u8(0);
        resp.write_tpm2b(&tag);
        let bytes = resp.into_vec();
        let mut reader = Reader::new(&bytes);

        session.verify_and_update(&mut reader, &rp_hash, 0x17B).unwrap();
        assert!(!session.poisoned);
    }

    #[test]
    fn hmac_session_poisons_on_bad_tag() {
        let pool = Arc::new(Pool::new());
        let alg = HashAlg::Sha256;
        let tpm_nonce = pool.rent(alg.digest_size()).unwrap();
        let mut session = HmacSession::new(pool, TpmHandle::transient(1), alg, tpm_nonce).unwrap();

        let mut resp = Writer::new();
        resp.write_tpm2b(&vec![0u8; alg.digest_size()]);
        resp.write_u8(0);
        resp.write_tpm2b(&[0xFFu8; 32]);
        let bytes = resp.into_vec();
        let mut reader = Reader::new(&bytes);

        let err = session.verify_and_update(&mut reader, &[0u8; 32], 0x17B).unwrap_err();
        assert!(matches!(err, TpmCoreError::IntegrityFailure { .. }));
        assert!(session.poisoned);

        let mut writer = Writer::new();
        let err = session.write_auth_command(&mut writer, &[0u8; 32], 0x17B).unwrap_err();
        assert!(matches!(err, TpmCoreError::SessionPoisoned { .. }));
    }

    #[test]
    fn hmac_key_is_raw_concatenation_with_no_placeholder_byte() {
        let pool = Arc::new(Pool::new());
        let alg = HashAlg::Sha256;
        let tpm_nonce = pool.rent(alg.digest_size()).unwrap();
        let mut session = HmacSession::new(pool, TpmHandle::transient(1), alg, tpm_nonce).unwrap();

        // With nothing negotiated, the key is empty, not a one-byte zero.
        assert_eq!(session.hmac_key().unwrap().as_slice(), b"" as &[u8]);

        session.set_auth_value(b"hunter2").unwrap();
        assert_eq!(session.hmac_key().unwrap().as_slice(), b"hunter2" as &[u8]);
    }
}
