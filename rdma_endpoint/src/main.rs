//! # RDMA Endpoint Binary
//!
//! Runs one side of a point-to-point transfer.
//!
//! # Usage
//!
//! ```bash
//! # Wait for a peer and print every write-with-immediate it sends
//! rdma_endpoint --config endpoint.toml listen 0.0.0.0:7471
//!
//! # Send 100 blocks of 4 KiB
//! rdma_endpoint --config endpoint.toml connect 10.0.0.2:7471 --writes 100 --size 4096
//!
//! # Force the socket data path, verbose logging
//! rdma_endpoint --socket -v connect 127.0.0.1:7471
//!
//! # Show the device names `rdma.device` accepts
//! rdma_endpoint devices
//! ```

#![deny(warnings)]

use clap::{Parser, Subcommand};
use rdma_common::prelude::*;
use rdma_endpoint::{ConnectionId, DeviceRegistry, Endpoint, Event, WcOpcode};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Receives kept posted per accepted connection.
const RECV_DEPTH: u64 = 16;

/// RDMA transport endpoint
#[derive(Parser, Debug)]
#[command(name = "rdma_endpoint")]
#[command(author = "RTS007")]
#[command(version)]
#[command(about = "Point-to-point RDMA transport endpoint")]
#[command(long_about = None)]
struct Args {
    /// Endpoint configuration file (TOML). Defaults apply when omitted.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Service name used when no configuration file is given
    #[arg(long, default_value = "rdma_endpoint")]
    service: String,

    /// Use the TCP socket data path instead of RDMA
    #[arg(long)]
    socket: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Output logs in JSON format
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Accept one peer and report what it writes
    Listen {
        /// Rendezvous address to bind
        addr: SocketAddr,
    },
    /// Connect to a listener and write blocks into its region
    Connect {
        /// Listener rendezvous address
        addr: SocketAddr,

        /// Number of writes to issue
        #[arg(short = 'n', long, default_value_t = 10)]
        writes: u32,

        /// Bytes per write
        #[arg(short, long, default_value_t = 4096)]
        size: usize,
    },
    /// List the devices this build can open
    Devices,
}

fn main() {
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(2);
        }
    };
    setup_tracing(&args, config.shared.log_level);

    if let Err(e) = run(args, config) {
        error!("Endpoint failed: {}", e);
        std::process::exit(1);
    }
}

fn load_config(args: &Args) -> Result<EndpointConfig, ConfigError> {
    let mut config = match &args.config {
        Some(path) => EndpointConfig::load(path)?,
        None => EndpointConfig::new(args.service.clone()),
    };
    if args.socket {
        config.rdma.connect_using_rdma = false;
    }
    config.validate()?;
    Ok(config)
}

fn run(args: Args, config: EndpointConfig) -> Result<(), Box<dyn std::error::Error>> {
    if matches!(args.command, Command::Devices) {
        for name in DeviceRegistry::with_builtin().list_devices() {
            println!("{name}");
        }
        return Ok(());
    }

    info!(
        "RDMA endpoint v{} starting as {}",
        env!("CARGO_PKG_VERSION"),
        config.shared.service_name
    );

    let mut endpoint = Endpoint::new(config)?;

    let running = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&running);
    ctrlc::set_handler(move || {
        info!("Received shutdown signal");
        flag.store(false, Ordering::SeqCst);
    })?;

    let result = match args.command {
        Command::Listen { addr } => serve(&mut endpoint, addr, &running),
        Command::Connect { addr, writes, size } => {
            send(&mut endpoint, addr, writes, size, &running)
        }
        Command::Devices => Ok(()),
    };

    endpoint.shutdown()?;
    info!("RDMA endpoint shutdown complete");
    result
}

fn serve(
    endpoint: &mut Endpoint,
    addr: SocketAddr,
    running: &AtomicBool,
) -> Result<(), Box<dyn std::error::Error>> {
    endpoint.bind(addr)?;
    let mut next_recv: u64 = 0;

    while running.load(Ordering::SeqCst) {
        for event in endpoint.poll_events(Some(DEFAULT_EVENT_TICK))? {
            match event {
                Event::IncomingConnection { listener } => {
                    let conn = endpoint.accept(listener)?;
                    for _ in 0..RECV_DEPTH {
                        endpoint.post_recv(conn, next_recv)?;
                        next_recv += 1;
                    }
                }
                Event::Completion {
                    connection,
                    completion,
                } => {
                    if completion.opcode == WcOpcode::RecvWithImm {
                        info!(
                            %connection,
                            imm = ?completion.imm_data,
                            bytes = completion.byte_len,
                            "Write received"
                        );
                        endpoint.post_recv(connection, next_recv)?;
                        next_recv += 1;
                    }
                }
                Event::ConnectionError {
                    connection,
                    completion,
                } => {
                    warn!(%connection, status = ?completion.status, "Peer connection failed");
                    endpoint.close(connection)?;
                    return Ok(());
                }
            }
        }
    }
    Ok(())
}

fn send(
    endpoint: &mut Endpoint,
    addr: SocketAddr,
    writes: u32,
    size: usize,
    running: &AtomicBool,
) -> Result<(), Box<dyn std::error::Error>> {
    let conn = endpoint.connect(addr)?;
    let start = Instant::now();

    for n in 0..writes {
        if !running.load(Ordering::SeqCst) {
            break;
        }
        endpoint.region().fill(0, size, n as u8)?;
        endpoint.post_write(conn, u64::from(n), 0, size, 0, Some(n))?;
        wait_for(endpoint, conn, u64::from(n), running)?;
    }

    let elapsed = start.elapsed();
    let bytes = u64::from(writes) * size as u64;
    info!(
        writes,
        bytes,
        elapsed_ms = elapsed.as_millis() as u64,
        "Transfer complete"
    );
    Ok(())
}

fn wait_for(
    endpoint: &mut Endpoint,
    conn: ConnectionId,
    wr_id: u64,
    running: &AtomicBool,
) -> Result<(), Box<dyn std::error::Error>> {
    while running.load(Ordering::SeqCst) {
        for event in endpoint.poll_events(Some(DEFAULT_EVENT_TICK))? {
            match event {
                Event::Completion { completion, .. } if completion.wr_id == wr_id => return Ok(()),
                Event::ConnectionError { completion, .. } => {
                    return Err(format!(
                        "{conn}: wr {} failed with {:?}",
                        completion.wr_id, completion.status
                    )
                    .into());
                }
                _ => {}
            }
        }
    }
    Ok(())
}

/// Setup tracing subscriber based on CLI arguments and configured level.
fn setup_tracing(args: &Args, level: LogLevel) {
    let directive = if args.verbose {
        LogLevel::Debug.as_directive()
    } else {
        level.as_directive()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

    if args.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
