//! # Meshdecrypt - Channel Decryption Engine for Meshtastic Networks
//!
//! Meshtastic radios encrypt channel traffic with AES-CTR under a pre-shared key and
//! put no authentication tag on it. A monitoring station that knows several channel
//! keys has to work out which one (if any) fits each packet, and should be able to go
//! back over stored packets it could not read once a new key is configured.
//!
//! ## Features
//!
//! - **Keyed-guess decryption**: candidate keys tried in priority order, accepted only
//!   when the plaintext parses as a Meshtastic `Data` frame with a known port.
//! - **Key cache**: enabled keys cached with a TTL, swapped atomically on refresh, and
//!   kept through store outages.
//! - **Reprocessing**: resumable, single-flight sweeps over stored undecryptable
//!   packets with progress events and cooperative yielding.
//! - **Pluggable store**: anything implementing [`storage::PacketStore`]; in-memory and
//!   sled implementations included.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use meshdecrypt::config::Config;
//! use meshdecrypt::engine::DecryptionEngine;
//! use meshdecrypt::storage::SledStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let store = Arc::new(SledStore::open(&config.storage.data_dir)?);
//!     let engine = DecryptionEngine::new(store, &config.decryption);
//!
//!     for progress in engine.reprocessor.process_for_all_channels().await {
//!         println!("{}: {}/{}", progress.channel_name, progress.decrypted, progress.total);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`channel`] - channel keys, PSK parsing and the key cache
//! - [`decrypt`] - AES-CTR cipher, structural validation and the decryptor
//! - [`reprocess`] - the reprocessing orchestrator and its progress state machine
//! - [`events`] - progress event sinks
//! - [`storage`] - the store contract and its implementations
//! - [`engine`] - convenience wiring of the above
//! - [`config`] - configuration management
//! - [`protobuf`] - Meshtastic `Data` framing

pub mod channel;
pub mod config;
pub mod decrypt;
pub mod engine;
pub mod errors;
pub mod events;
pub mod logutil;
pub mod metrics;
pub mod protobuf;
pub mod reprocess;
pub mod storage;
