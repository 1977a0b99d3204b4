// SPDX-License-Identifier: MIT

//! Response decoders for the handful of commands this crate understands
//! the shape of well enough to decode generically. Everything else still
//! executes fine through [`crate::executor::Executor::execute_raw`]; these
//! are conveniences layered on top via [`crate::registry::Registry`].

use crate::error::TpmResult;
use crate::handle::TpmHandle;
use crate::pool::{Pool, SensitiveBuffer};
use crate::registry::RegistryBuilder;
use crate::types::{Algorithm, Command};
use crate::wire::Reader;

/// `TPM2_GetRandom` response: `randomBytes: TPM2B_DIGEST`.
pub struct GetRandomResponse {
    pub random_bytes: Option<SensitiveBuffer>,
}

fn decode_get_random(reader: &mut Reader, pool: &Pool) -> TpmResult<GetRandomResponse> {
    Ok(GetRandomResponse {
        random_bytes: reader.read_tpm2b_sensitive(pool, Command::GetRandom as u32)?,
    })
}

/// `TPM2_GetCapability` response, decoded for the `TPM_CAP_HANDLES` shape
/// only: `moreData: bool` followed by a `TPML_HANDLE` (a `u32` count and
/// that many `u32` handles). Other capability selectors decode to an empty
/// handle list; callers that need them fall back to `execute_raw`.
pub struct GetCapabilityResponse {
    pub more_data: bool,
    pub handles: Vec<TpmHandle>,
}

fn decode_get_capability(reader: &mut Reader, _pool: &Pool) -> TpmResult<GetCapabilityResponse> {
    let command_code = Command::GetCapability as u32;
    let more_data = reader.read_u8(command_code)? != 0;
    let _capability = reader.read_u32(command_code)?;
    let count = reader.read_u32(command_code)? as usize;
    let mut handles = Vec::with_capacity(count);
    for _ in 0..count {
        handles.push(TpmHandle::new(reader.read_u32(command_code)?));
    }
    Ok(GetCapabilityResponse { more_data, handles })
}

/// `TPM2_StartAuthSession` response parameter area: `nonceTPM:
/// TPM2B_NONCE`. `sessionHandle` is a response handle, not a parameter, so
/// it arrives via `Response::handles` alongside this decoded value — the
/// caller must pass `response_handle_count: 1` when executing the command.
///
/// This decoder stops short of constructing a [`crate::session::HmacSession`]
/// because the negotiated `authHash` lives in the request the caller built,
/// not in this response; the caller combines the two with
/// `HmacSession::new(pool, response.header.handles[0], request_hash_alg,
/// response.value.nonce_tpm.unwrap())`.
pub struct StartAuthSessionResponse {
    pub nonce_tpm: Option<SensitiveBuffer>,
}

fn decode_start_auth_session(reader: &mut Reader, pool: &Pool) -> TpmResult<StartAuthSessionResponse> {
    let command_code = Command::StartAuthSession as u32;
    let nonce_tpm = reader.read_tpm2b_sensitive(pool, command_code)?;
    Ok(StartAuthSessionResponse { nonce_tpm })
}

/// `TPM2_FlushContext` response carries no parameters; this decoder exists
/// only so the command participates in the same registry-driven `execute`
/// path as everything else.
pub struct FlushContextResponse;

fn decode_flush_context(_reader: &mut Reader, _pool: &Pool) -> TpmResult<FlushContextResponse> {
    Ok(FlushContextResponse)
}

/// One bank's selection within a `TPML_PCR_SELECTION`.
pub struct PcrSelection {
    pub hash: Option<Algorithm>,
    pub select: Vec<u8>,
}

/// `TPM2_PCR_Read` response: `pcrUpdateCounter: u32`, `pcrSelectionOut:
/// TPML_PCR_SELECTION`, `pcrValues: TPML_DIGEST`.
///
/// PCR digests are measurement state, not secrets, so they are decoded as
/// plain `Vec<u8>` rather than routed through the sensitive pool.
pub struct PcrReadResponse {
    pub pcr_update_counter: u32,
    pub pcr_selection_out: Vec<PcrSelection>,
    pub pcr_values: Vec<Vec<u8>>,
}

fn decode_pcr_read(reader: &mut Reader, _pool: &Pool) -> TpmResult<PcrReadResponse> {
    let command_code = Command::PcrRead as u32;
    let pcr_update_counter = reader.read_u32(command_code)?;

    let selection_count = reader.read_u32(command_code)? as usize;
    let mut pcr_selection_out = Vec::with_capacity(selection_count);
    for _ in 0..selection_count {
        let hash = Algorithm::from_repr(reader.read_u16(command_code)?);
        let select_len = reader.read_u8(command_code)? as usize;
        let select = reader.read_bytes(select_len, command_code)?.to_vec();
        pcr_selection_out.push(PcrSelection { hash, select });
    }

    let digest_count = reader.read_u32(command_code)? as usize;
    let mut pcr_values = Vec::with_capacity(digest_count);
    for _ in 0..digest_count {
        pcr_values.push(reader.read_tpm2b(command_code)?);
    }

    Ok(PcrReadResponse {
        pcr_update_counter,
        pcr_selection_out,
        pcr_values,
    })
}

/// Registers the decoders for `TPM2_GetRandom`, `TPM2_GetCapability`,
/// `TPM2_StartAuthSession`, `TPM2_FlushContext`, and `TPM2_PCR_Read` into
/// `builder`, returning it for further chaining.
#[must_use]
pub fn register_builtin(builder: RegistryBuilder) -> RegistryBuilder {
    builder
        .register(Command::GetRandom as u32, decode_get_random)
        .register(Command::GetCapability as u32, decode_get_capability)
        .register(Command::StartAuthSession as u32, decode_start_auth_session)
        .register(Command::FlushContext as u32, decode_flush_context)
        .register(Command::PcrRead as u32, decode_pcr_read)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::Writer;

    #[test]
    fn get_random_decodes_sensitive_buffer() {
        let pool = Pool::new();
        let mut w = Writer::new();
        w.write_tpm2b(&[0x11, 0x22, 0x33]);
        let bytes = w.into_vec();
        let mut reader = Reader::new(&bytes);
        let response = decode_get_random(&mut reader, &pool).unwrap();
        assert_eq!(response.random_bytes.unwrap().to_vec().unwrap(), vec![0x11, 0x22, 0x33]);
    }

    #[test]
    fn get_capability_decodes_handle_list() {
        let pool = Pool::new();
        let mut w = Writer::new();
        w.write_u8(1); // moreData
        w.write_u32(0x0000_0001); // TPM_CAP_HANDLES
        w.write_u32(2);
        w.write_u32(0x8000_0000);
        w.write_u32(0x8000_0001);
        let bytes = w.into_vec();
        let mut reader = Reader::new(&bytes);
        let response = decode_get_capability(&mut reader, &pool).unwrap();
        assert!(response.more_data);
        assert_eq!(response.handles, vec![TpmHandle::new(0x8000_0000), TpmHandle::new(0x8000_0001)]);
    }

    #[test]
    fn pcr_read_decodes_selection_and_values() {
        let pool = Pool::new();
        let mut w = Writer::new();
        w.write_u32(7); // pcrUpdateCounter
        w.write_u32(1); // one selection
        w.write_u16(Algorithm::Sha256 as u16);
        w.write_u8(3);
        w.write_bytes(&[0x01, 0x00, 0x00]);
        w.write_u32(1); // one digest
        w.write_tpm2b(&[0xAA; 32]);
        let bytes = w.into_vec();
        let mut reader = Reader::new(&bytes);
        let response = decode_pcr_read(&mut reader, &pool).unwrap();
        assert_eq!(response.pcr_update_counter, 7);
        assert_eq!(response.pcr_selection_out.len(), 1);
        assert_eq!(response.pcr_selection_out[0].hash, Some(Algorithm::Sha256));
        assert_eq!(response.pcr_values, vec![vec![0xAA; 32]]);
    }
}
