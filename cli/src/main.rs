// SPDX-License-Identifier: GPL-3.0-or-later
#![deny(clippy::all)]
#![deny(clippy::pedantic)]

use std::str::FromStr;

use clap::{Parser, Subcommand};
use clap_num::maybe_hex;
use log::error;
use tpm2_core::{
    register_builtin, Algorithm, Capability, Command, CommandInput, Executor, ExecutorConfig,
    GetCapabilityResponse, GetRandomResponse, HashAlg, Handle, HmacSession, Pool, Registry, ResponseCode,
    SessionType, StartAuthSessionResponse, TpmHandle, Writer,
};

#[cfg(unix)]
use tpm2_core::LinuxDeviceTransport;

/// Authenticated session nonce size.
const NONCE_SIZE: u16 = 16;

/// Upper bound on the number of handles `list` asks `TPM2_GetCapability`
/// to return in one call.
const MAX_HANDLES: u32 = 16;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[arg(short, long, default_value = "/dev/tpmrm0")]
    device: String,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Decode response code
    Rc {
        /// Response code
        #[arg(value_parser = maybe_hex::<u32>)]
        rc: u32,
    },
    /// Enumerate objects
    List {
        /// Transient handles
        #[arg(short, long)]
        transient: bool,
        /// Persistent handles
        #[arg(short, long)]
        persistent: bool,
    },
    /// Draw random bytes from the TPM's RNG
    Random {
        /// Number of bytes to request
        n: u16,
    },
    /// Manage authorization sessions
    Session {
        #[command(subcommand)]
        command: SessionCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum SessionCommands {
    /// Open an HMAC authorization session
    Start {
        /// Session name algorithm
        #[arg(long, default_value = "sha256")]
        hash: String,
    },
}

#[cfg(unix)]
fn open_executor(device: &str) -> Executor {
    let transport = LinuxDeviceTransport::open(device).unwrap_or_else(|err| {
        error!("{err}");
        std::process::exit(1);
    });
    let registry = register_builtin(Registry::builder()).build();
    Executor::new(std::sync::Arc::new(Pool::new()), std::sync::Arc::new(registry), Box::new(transport))
        .with_config(ExecutorConfig::default())
}

fn list_handles(executor: &mut Executor, start: TpmHandle) {
    let mut params = Writer::new();
    params.write_u32(Capability::Handles as u32);
    params.write_u32(start.value());
    params.write_u32(MAX_HANDLES);
    let parameters = params.into_vec();

    let input = CommandInput {
        command_code: Command::GetCapability as u32,
        handles: &[],
        sessions: &mut [],
        parameters: &parameters,
        response_handle_count: 0,
    };

    let response = executor.execute::<GetCapabilityResponse>(input).unwrap_or_else(|err| {
        error!("{err}");
        std::process::exit(1);
    });
    for handle in response.value.handles {
        println!("{:#010x}", handle.value());
    }
}

fn random(executor: &mut Executor, n: u16) {
    let mut params = Writer::new();
    params.write_u16(n);
    let parameters = params.into_vec();

    let input = CommandInput {
        command_code: Command::GetRandom as u32,
        handles: &[],
        sessions: &mut [],
        parameters: &parameters,
        response_handle_count: 0,
    };

    let response = executor.execute::<GetRandomResponse>(input).unwrap_or_else(|err| {
        error!("{err}");
        std::process::exit(1);
    });
    let Some(bytes) = response.value.random_bytes else {
        println!();
        return;
    };
    let bytes = bytes.to_vec().unwrap_or_else(|err| {
        error!("{err}");
        std::process::exit(1);
    });
    println!("{}", bytes.iter().map(|b| format!("{b:02x}")).collect::<String>());
}

fn session_start(executor: &mut Executor, hash: &str) {
    let alg = HashAlg::from_str(hash).unwrap_or_else(|err| {
        error!("{err}");
        std::process::exit(1);
    });

    let mut nonce_caller = vec![0u8; NONCE_SIZE as usize];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut nonce_caller);

    let mut params = Writer::new();
    params.write_tpm2b(&nonce_caller); // nonceCaller
    params.write_tpm2b(&[]); // encryptedSalt
    params.write_u8(SessionType::Hmac as u8);
    params.write_u16(Algorithm::Null as u16); // symmetric algorithm
    params.write_u16(alg.algorithm_id() as u16); // authHash
    let parameters = params.into_vec();

    let handles = [TpmHandle::from(Handle::Null as u32), TpmHandle::from(Handle::Null as u32)];
    let input = CommandInput {
        command_code: Command::StartAuthSession as u32,
        handles: &handles,
        sessions: &mut [],
        parameters: &parameters,
        response_handle_count: 1,
    };

    let response = executor.execute::<StartAuthSessionResponse>(input).unwrap_or_else(|err| {
        error!("{err}");
        std::process::exit(1);
    });
    let session_handle = response.header.handles[0];
    let nonce_tpm = response.value.nonce_tpm.unwrap_or_else(|| {
        error!("StartAuthSession returned an empty nonceTPM");
        std::process::exit(1);
    });

    let _session = HmacSession::new(executor.pool().clone(), session_handle, alg, nonce_tpm).unwrap_or_else(|err| {
        error!("{err}");
        std::process::exit(1);
    });
    println!("{:#010x}", session_handle.value());
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    match &cli.command {
        Commands::Rc { rc } => {
            println!("{} {rc:#010x}", ResponseCode::from(*rc));
        }
        #[cfg(unix)]
        Commands::List { transient, persistent } => {
            let mut executor = open_executor(&cli.device);
            if *transient {
                list_handles(&mut executor, TpmHandle::from(Handle::Transient as u32));
            }
            if *persistent {
                list_handles(&mut executor, TpmHandle::from(Handle::Persistent as u32));
            }
        }
        #[cfg(unix)]
        Commands::Random { n } => {
            let mut executor = open_executor(&cli.device);
            random(&mut executor, *n);
        }
        #[cfg(unix)]
        Commands::Session {
            command: SessionCommands::Start { hash },
        } => {
            let mut executor = open_executor(&cli.device);
            session_start(&mut executor, hash);
        }
        #[cfg(not(unix))]
        _ => {
            error!("this command requires a device transport, which this build does not implement");
            std::process::exit(1);
        }
    }
}
