//! Voice bridge application
//!
//! Calls a peer when given its address, otherwise waits for a caller:
//!
//! ```text
//! voicebridge [--config <file>] [peer:port]
//! ```

use anyhow::{bail, Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use voicebridge::{
    audio::{device::list_devices, AudioHardware, CpalDevice, StreamParams},
    config::BridgeConfig,
    dump::DumpWriter,
    network::{Receiver, Sender, Strand, UdpStream},
};

/// How often call statistics are logged
const STATS_INTERVAL: Duration = Duration::from_secs(5);

struct Args {
    config: Option<PathBuf>,
    peer: Option<SocketAddr>,
}

fn parse_args() -> Result<Args> {
    let mut args = Args {
        config: None,
        peer: None,
    };

    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = iter.next().context("--config needs a file name")?;
                args.config = Some(PathBuf::from(path));
            }
            "--help" | "-h" => {
                println!("Usage: voicebridge [--config <file>] [peer:port]");
                std::process::exit(0);
            }
            other if args.peer.is_none() => {
                args.peer = Some(other.parse().with_context(|| format!("Invalid peer address {}", other))?);
            }
            other => bail!("Unexpected argument {}", other),
        }
    }

    Ok(args)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting voice bridge");

    let args = parse_args()?;
    let config_path = args.config.or_else(BridgeConfig::default_path);
    let mut config = BridgeConfig::load_or_default(config_path.as_deref())?;
    if args.peer.is_some() {
        config.network.peer = args.peer;
    }

    println!("\n=== Available Audio Devices ===");
    for device in list_devices() {
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {}{}:", device.name, default_marker);
        println!("    ID: {}", device.id);
        println!("    Sample rates: {:?}", device.sample_rates);
        println!("    Channels: {:?}", device.channels);
    }
    println!();

    let sender = Sender::opus(&config, Strand::current()?)?;
    let receiver = Receiver::opus(&config)?;
    let sender_handle = sender.handle();
    let receiver_handle = receiver.handle();

    let dump = match &config.dump {
        Some(path) => {
            let writer = DumpWriter::create(path)?;
            sender_handle.set_tap(Some(writer.tap()));
            receiver_handle.set_tap(Some(writer.tap()));
            Some(writer)
        }
        None => None,
    };

    let params = StreamParams::from_config(&config.audio);
    let mut hardware = AudioHardware::open(CpalDevice::new(), &params, sender, receiver);
    if hardware.is_disabled() {
        warn!("No usable audio device, the call will carry no audio");
    }

    let bind = config.network.bind_addr()?;
    let peer = config.network.peer;

    tokio::select! {
        stream = async {
            match peer {
                Some(peer) => UdpStream::connect(bind, peer).await,
                None => UdpStream::accept(bind).await,
            }
        } => {
            let stream = stream?;
            if peer.is_some() {
                hardware.streaming(stream);
                hardware.out_stream_ready();
            } else {
                hardware.new_connection(stream);
            }

            info!("Call established, press Ctrl+C to hang up");
            let mut stats = tokio::time::interval(STATS_INTERVAL);
            loop {
                tokio::select! {
                    _ = stats.tick() => {
                        while let Some(e) = hardware.device().check_errors() {
                            warn!("Audio stream error: {}", e);
                        }
                        let tx = sender_handle.stats();
                        let rx = receiver_handle.stats();
                        info!(
                            "sent {} ({} silent), played {} concealed {} | queue {} dropped {} | faults tx {} rx {}",
                            tx.posted,
                            tx.elided,
                            rx.decoded,
                            rx.concealed,
                            rx.queue.level,
                            rx.queue.dropped,
                            tx.encode_faults,
                            rx.faults
                        );
                    }
                    result = tokio::signal::ctrl_c() => {
                        result?;
                        break;
                    }
                }
            }
        }
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Interrupted before a call was established");
        }
    }

    hardware.shutdown();
    // Let the posted write shutdown run
    sender_handle.strand().flush().await;

    if let Some(dump) = dump {
        let records = dump.finish()?;
        info!("Dumped {} packets", records);
    }

    info!("Voice bridge stopped");
    Ok(())
}
