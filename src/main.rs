//! Binary entrypoint for the meshdecrypt CLI.
//!
//! Commands:
//! - `init` - write a starter `config.toml` and create the data directory
//! - `add-channel --name <n> (--psk <base64> | --generate)` - store a channel key
//! - `channels` - list stored channel keys
//! - `ingest --packet-id <id> --from <node> --payload <hex>` - store a received packet,
//!   decrypting it on the spot when a key fits
//! - `decrypt --packet-id <id> --from <node> --payload <hex> [--channel <id>]` - try
//!   decryption without touching the store
//! - `encrypt --channel <id> --packet-id <id> --from <node> --text <msg>` - produce a
//!   channel-encrypted text frame (handy for testing)
//! - `reprocess [--channel <id>]` - sweep stored undecrypted packets
//! - `status` - packet counts, channel stats and engine counters
//!
//! Packet and node ids accept decimal, `0x` hex, or Meshtastic `!` hex notation.
use std::sync::Arc;

use anyhow::{anyhow, Result};
use base64::Engine;
use clap::{Parser, Subcommand};
use log::{info, warn};
use prost::Message;
use rand::RngCore;

use meshdecrypt::channel::{parse_psk, ChannelKey};
use meshdecrypt::config::Config;
use meshdecrypt::decrypt::apply_channel_cipher;
use meshdecrypt::engine::DecryptionEngine;
use meshdecrypt::events::LogSink;
use meshdecrypt::logutil::{init_logging, node_label};
use meshdecrypt::metrics;
use meshdecrypt::protobuf::{Data, PortNum};
use meshdecrypt::reprocess::ProcessingStatus;
use meshdecrypt::storage::SledStore;

#[derive(Parser)]
#[command(name = "meshdecrypt")]
#[command(about = "Channel decryption and packet reprocessing for Meshtastic networks")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a default configuration file and data directory
    Init,
    #[command(flatten)]
    Store(StoreCommand),
}

/// Commands that run against an opened packet store.
#[derive(Subcommand)]
enum StoreCommand {
    /// Store a channel key
    AddChannel {
        #[arg(short, long)]
        name: String,
        /// Base64 PSK as shown by the Meshtastic apps (AQ== for the default key)
        #[arg(long, conflicts_with = "generate")]
        psk: Option<String>,
        /// Generate a random key instead of supplying one
        #[arg(long)]
        generate: bool,
        /// Key size for --generate (128 or 256)
        #[arg(long, default_value_t = 256)]
        bits: u16,
        /// Lower values are tried first
        #[arg(short, long, default_value_t = 0)]
        priority: i32,
        /// Store the key disabled
        #[arg(long)]
        disabled: bool,
        /// Sweep stored packets against the new key right away
        #[arg(long)]
        reprocess: bool,
    },
    /// List stored channel keys
    Channels,
    /// Store a received encrypted packet
    Ingest {
        #[arg(long, value_parser = parse_u32)]
        packet_id: u32,
        #[arg(long, value_parser = parse_u32)]
        from: u32,
        /// Ciphertext as hex
        #[arg(long)]
        payload: String,
    },
    /// Try to decrypt a packet without storing it
    Decrypt {
        #[arg(long, value_parser = parse_u32)]
        packet_id: u32,
        #[arg(long, value_parser = parse_u32)]
        from: u32,
        #[arg(long)]
        payload: String,
        /// Only try this channel
        #[arg(long)]
        channel: Option<u64>,
    },
    /// Encrypt a text message frame with a stored channel key
    Encrypt {
        #[arg(long)]
        channel: u64,
        #[arg(long, value_parser = parse_u32)]
        packet_id: u32,
        #[arg(long, value_parser = parse_u32)]
        from: u32,
        #[arg(long)]
        text: String,
    },
    /// Re-attempt decryption of stored packets
    Reprocess {
        /// Only sweep this channel (default: every enabled channel)
        #[arg(long)]
        channel: Option<u64>,
    },
    /// Show store and engine status
    Status,
}

fn parse_u32(s: &str) -> Result<u32, String> {
    let t = s.trim();
    let parsed = if let Some(hex) = t.strip_prefix('!') {
        u32::from_str_radix(hex, 16)
    } else if let Some(hex) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else {
        t.parse::<u32>()
    };
    parsed.map_err(|e| format!("invalid id '{}': {}", s, e))
}

fn parse_hex(s: &str) -> Result<Vec<u8>> {
    hex::decode(s.trim()).map_err(|e| anyhow!("payload is not valid hex: {}", e))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Init => init(&cli.config, cli.verbose).await,
        Commands::Store(command) => run(command, &cli.config, cli.verbose).await,
    }
}

async fn init(config_path: &str, verbose: u8) -> Result<()> {
    init_logging(None, verbose);
    if tokio::fs::metadata(config_path).await.is_ok() {
        warn!("{} already exists; leaving it untouched", config_path);
    } else {
        Config::create_default(config_path).await?;
        info!("Configuration file created at {}", config_path);
    }
    let config = Config::load(config_path).await?;
    tokio::fs::create_dir_all(&config.storage.data_dir).await?;
    SledStore::open(&config.storage.data_dir)?.close()?;
    info!("Initialized packet store at {}", config.storage.data_dir);
    Ok(())
}

async fn run(command: StoreCommand, config_path: &str, verbose: u8) -> Result<()> {
    let config = Config::load(config_path).await?;
    init_logging(Some(&config), verbose);
    let store = Arc::new(SledStore::open(&config.storage.data_dir)?);
    let engine = DecryptionEngine::with_extra_sink(
        store.clone(),
        &config.decryption,
        Some(Arc::new(LogSink)),
    );

    match command {
        StoreCommand::AddChannel {
            name,
            psk,
            generate,
            bits,
            priority,
            disabled,
            reprocess,
        } => {
            let key = match (psk, generate) {
                (Some(psk), _) => parse_psk(&psk)?,
                (None, true) => {
                    if bits != 128 && bits != 256 {
                        return Err(anyhow!("--bits must be 128 or 256, got {}", bits));
                    }
                    let mut key = vec![0u8; usize::from(bits / 8)];
                    rand::thread_rng().fill_bytes(&mut key);
                    key
                }
                (None, false) => return Err(anyhow!("either --psk or --generate is required")),
            };
            let id = store.next_id()?;
            let mut channel = ChannelKey::new(id, name, key, priority)?;
            channel.enabled = !disabled;
            println!(
                "Added channel #{} '{}' ({}-bit, psk {}, hash 0x{:02x})",
                channel.id,
                channel.name,
                channel.key_length.bits(),
                base64::engine::general_purpose::STANDARD.encode(&channel.key),
                channel.channel_hash()
            );
            store.upsert_channel(channel)?;
            engine.channels_changed();
            if reprocess && !disabled {
                let progress = engine.reprocessor.process_for_channel(id).await?;
                println!(
                    "Reprocessed {} packet(s), {} decrypted",
                    progress.processed, progress.decrypted
                );
            }
        }
        StoreCommand::Channels => {
            for ch in store.list_channels()? {
                println!(
                    "#{:<4} {:<20} {:>3}-bit prio={:<4} {} key={} decrypted={} last={}",
                    ch.id,
                    ch.name,
                    ch.key_length.bits(),
                    ch.sort_order,
                    if ch.enabled { "enabled " } else { "disabled" },
                    ch.fingerprint(),
                    ch.decrypted_packet_count,
                    ch.last_decrypted_at
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "never".to_string())
                );
            }
        }
        StoreCommand::Ingest {
            packet_id,
            from,
            payload,
        } => {
            let ciphertext = parse_hex(&payload)?;
            let mut context = serde_json::Map::new();
            context.insert("source".into(), serde_json::json!("cli"));
            let id = store.insert_encrypted_packet(packet_id, from, ciphertext, context)?;
            let record = store.get_packet(id)?;
            match engine.decryptor.decrypt_record(&record).await? {
                Some(packet) => println!(
                    "Stored record {} and decrypted it with '{}' ({})",
                    id,
                    packet.channel_name,
                    packet.portnum.label()
                ),
                None => println!("Stored record {} (no channel key matched yet)", id),
            }
        }
        StoreCommand::Decrypt {
            packet_id,
            from,
            payload,
            channel,
        } => {
            let ciphertext = parse_hex(&payload)?;
            let (label, port, body) = match channel {
                Some(channel_id) => {
                    let m = engine
                        .decryptor
                        .try_decrypt_with_channel(&ciphertext, packet_id, from, channel_id)
                        .await?;
                    (format!("#{}", channel_id), m.portnum, m.payload)
                }
                None => {
                    let p = engine
                        .decryptor
                        .try_decrypt(&ciphertext, packet_id, from)
                        .await?;
                    (p.channel_name, p.portnum, p.payload)
                }
            };
            println!("channel: {}", label);
            println!("from:    {}", node_label(from));
            println!("port:    {}", port.label());
            match (port, std::str::from_utf8(&body)) {
                (PortNum::TextMessageApp, Ok(text)) => println!("text:    {}", text),
                _ => println!("payload: {}", hex::encode(&body)),
            }
        }
        StoreCommand::Encrypt {
            channel,
            packet_id,
            from,
            text,
        } => {
            let ch = store.get_channel(channel)?;
            let frame = Data {
                portnum: PortNum::TextMessageApp as i32,
                payload: bytes::Bytes::from(text.into_bytes()),
                ..Default::default()
            }
            .encode_to_vec();
            let ct = apply_channel_cipher(&ch.key, packet_id, from, &frame)
                .ok_or_else(|| anyhow!("channel #{} has an unusable key", channel))?;
            println!("{}", hex::encode(ct));
        }
        StoreCommand::Reprocess { channel } => {
            let results = match channel {
                Some(id) => vec![engine.reprocessor.process_for_channel(id).await?],
                None => engine.reprocessor.process_for_all_channels().await,
            };
            if results.is_empty() {
                println!("No enabled channels to reprocess.");
            }
            for p in &results {
                println!(
                    "{:<20} {:<9} {}/{} processed, {} decrypted{}",
                    p.channel_name,
                    p.status.as_str(),
                    p.processed,
                    p.total,
                    p.decrypted,
                    p.error
                        .as_ref()
                        .map(|e| format!(" ({})", e))
                        .unwrap_or_default()
                );
            }
            let failed = results
                .iter()
                .filter(|p| p.status == ProcessingStatus::Failed)
                .count();
            if failed > 0 {
                return Err(anyhow!(
                    "{} of {} channel sweep(s) failed",
                    failed,
                    results.len()
                ));
            }
        }
        StoreCommand::Status => {
            let counts = store.packet_counts()?;
            let channels = store.list_channels()?;
            let enabled = channels.iter().filter(|c| c.enabled).count();
            println!("Meshdecrypt v{}", env!("CARGO_PKG_VERSION"));
            println!("Data dir:      {}", config.storage.data_dir);
            println!(
                "Packets:       {} stored, {} awaiting a key",
                counts.total, counts.undecrypted
            );
            println!("Channels:      {} ({} enabled)", channels.len(), enabled);
            println!(
                "Key cache TTL: {} ms, batch size {}",
                config.decryption.key_cache_ttl_ms, config.decryption.reprocess_batch_size
            );
            engine.cache.refresh().await;
            for rejected in engine.cache.rejected_keys().iter() {
                println!("  rejected: {}", rejected);
            }
            let m = metrics::snapshot();
            println!(
                "This run:      {} attempts, {} matches, {:.1} keys/attempt",
                m.decrypt_attempts,
                m.decrypt_matches,
                m.trials_per_attempt()
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{parse_u32, Cli, Commands, StoreCommand};

    #[test]
    fn parses_node_id_notations() {
        assert_eq!(parse_u32("!deadbeef"), Ok(0xdeadbeef));
        assert_eq!(parse_u32("0x10"), Ok(16));
        assert_eq!(parse_u32("42"), Ok(42));
        assert!(parse_u32("!zz").is_err());
    }

    #[test]
    fn store_commands_parse_at_top_level() {
        let cli = Cli::try_parse_from(["meshdecrypt", "reprocess", "--channel", "3"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Store(StoreCommand::Reprocess { channel: Some(3) })
        ));
        let cli = Cli::try_parse_from(["meshdecrypt", "-v", "init"]).unwrap();
        assert!(matches!(cli.command, Commands::Init));
        assert_eq!(cli.verbose, 1);
    }
}
