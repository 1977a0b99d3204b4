// SPDX-License-Identifier: MIT

//! End-to-end exercises of the executor against an in-process simulator,
//! checked against fixed wire byte sequences rather than just round-trip
//! shape.

use std::sync::Arc;

use tpm2_core::{
    CommandInput, Command, Executor, GetRandomResponse, HashAlg, HmacSession, Pool, Registry,
    SimulatorTransport, TpmHandle, Writer,
};

#[test]
fn get_random_matches_the_documented_wire_bytes() {
    let pool = Arc::new(Pool::new());
    let registry = Arc::new(tpm2_core::register_builtin(Registry::builder()).build());

    let transport = SimulatorTransport::new(|request, response| {
        assert_eq!(request, [0x80, 0x01, 0x00, 0x00, 0x00, 0x0C, 0x00, 0x00, 0x01, 0x7B, 0x00, 0x10]);

        let mut random_bytes = [0u8; 16];
        for (i, b) in random_bytes.iter_mut().enumerate() {
            *b = i as u8;
        }
        let mut w = Writer::new();
        w.write_u16(0x8001); // TPM_ST_NO_SESSIONS
        w.write_u32(0x1C);
        w.write_u32(0);
        w.write_tpm2b(&random_bytes);
        let body = w.into_vec();
        assert_eq!(body.len(), 0x1C);
        response[..body.len()].copy_from_slice(&body);
        Ok((body.len(), 0))
    });

    let mut executor = Executor::new(pool, registry, Box::new(transport));

    let mut params = Writer::new();
    params.write_u16(16);
    let parameters = params.into_vec();
    let input = CommandInput {
        command_code: Command::GetRandom as u32,
        handles: &[],
        sessions: &mut [],
        parameters: &parameters,
        response_handle_count: 0,
    };

    let response: tpm2_core::TypedResponse<GetRandomResponse> = executor.execute(input).unwrap();
    let bytes = response.value.random_bytes.unwrap().to_vec().unwrap();
    assert_eq!(bytes, (0u8..16).collect::<Vec<_>>());
}

#[test]
fn hmac_session_integrity_failure_poisons_without_mutating_further_state() {
    let pool = Arc::new(Pool::new());
    let alg = HashAlg::Sha256;
    let nonce_tpm = pool.rent(alg.digest_size()).unwrap();
    let session = HmacSession::new(pool.clone(), TpmHandle::transient(1), alg, nonce_tpm).unwrap();

    let registry = Arc::new(Registry::builder().build());
    let transport = SimulatorTransport::new(|_req, response| {
        // A well-formed header followed by a garbled auth area: the
        // response HMAC will not verify against any key the session holds.
        let mut w = Writer::new();
        w.write_u16(0x8002); // TPM_ST_SESSIONS
        w.write_u32(0);
        w.write_u32(0);
        w.write_u32(0); // parameterSize
        w.write_tpm2b(&[0xAAu8; 32]); // nonceTPM'
        w.write_u8(0);
        w.write_tpm2b(&[0xFFu8; 32]); // wrong hmac
        let body = w.into_vec();
        response[..body.len()].copy_from_slice(&body);
        Ok((body.len(), 0))
    });

    let mut executor = Executor::new(pool, registry, Box::new(transport));
    let mut sessions = [tpm2_core::Session::Hmac(session)];
    let input = CommandInput {
        command_code: Command::GetRandom as u32,
        handles: &[],
        sessions: &mut sessions,
        parameters: &[],
        response_handle_count: 0,
    };

    let err = executor.execute_raw(input).unwrap_err();
    assert!(matches!(err, tpm2_core::TpmCoreError::IntegrityFailure { .. }));
    assert!(sessions[0].is_poisoned());

    // A second attempt must not reach the transport at all.
    let transport2 = SimulatorTransport::new(|_req, _resp| panic!("must not submit with a poisoned session"));
    let registry2 = Arc::new(Registry::builder().build());
    let mut executor2 = Executor::new(Arc::new(Pool::new()), registry2, Box::new(transport2));
    let input2 = CommandInput {
        command_code: Command::GetRandom as u32,
        handles: &[],
        sessions: &mut sessions,
        parameters: &[],
        response_handle_count: 0,
    };
    let err2 = executor2.execute_raw(input2).unwrap_err();
    assert!(matches!(err2, tpm2_core::TpmCoreError::SessionPoisoned { .. }));
}
