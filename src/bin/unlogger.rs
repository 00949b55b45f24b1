//! Packet dump analyzer
//!
//! Decodes a dump written by `voicebridge` into `local_voice.f32`,
//! `remote_voice.f32` and gnuplot packet-size tables.
//!
//! ```text
//! unlogger [--header bare|sequence|timestamp|0-2] [--out <dir>] [dump.bin]
//! ```

use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use voicebridge::{
    config::BridgeConfig,
    dump::{read_dump, Replay},
    protocol::HeaderFormat,
};

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = BridgeConfig::load_or_default(BridgeConfig::default_path().as_deref())?;

    let mut filename = PathBuf::from("dump.bin");
    let mut out_dir = PathBuf::from(".");
    let mut header: HeaderFormat = config.network.header;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--header" => {
                let value = args.next().context("--header needs a value")?;
                header = value.parse().map_err(anyhow::Error::msg)?;
            }
            "--out" | "-o" => {
                out_dir = PathBuf::from(args.next().context("--out needs a directory")?);
            }
            "--help" | "-h" => {
                println!("Usage: unlogger [--header bare|sequence|timestamp|0-2] [--out <dir>] [dump.bin]");
                return Ok(());
            }
            other if other.starts_with('-') => bail!("Unknown option {}", other),
            other => filename = PathBuf::from(other),
        }
    }

    let records = read_dump(&filename).with_context(|| format!("Cannot open {}", filename.display()))?;
    let replay = Replay::opus(&out_dir, header, config.opus.sample_rate)?;
    let summary = replay.run(records)?;

    tracing::info!(
        "Replayed {} local and {} remote packets ({} skipped) into {}",
        summary.local_packets,
        summary.remote_packets,
        summary.skipped,
        out_dir.display()
    );
    Ok(())
}
