//! # VS1053 Streaming Driver
//!
//! This crate provides the core pieces of an internet-radio style audio path:
//!
//! - **Ring Buffer**: Chunked circular queue over external SPI SRAM (or RAM)
//! - **HardwareBus Trait**: Abstraction over the shared SPI bus, select lines and DREQ
//! - **SCI / SDI Protocol**: Register access and ready-gated bulk streaming
//! - **Patch Loader**: Compressed plugin format decoder
//! - **Playback Controller**: Bring-up, self-test, volume/tone, start/stop
//!
//! ## Architecture
//!
//! ```text
//! Network ─────► RingBuffer ─────► StreamingWriter ─────► VS1053 (SDI)
//!  (producer)   (SPI SRAM)           (32-byte gates)
//!                                          │
//!                 PlaybackController ──────┴────────────► VS1053 (SCI)
//! ```
//!
//! ## Blocking Model
//!
//! Every transfer waits on the DREQ line and yields once per poll. With the
//! default [`WaitPolicy::Forever`] an absent device blocks indefinitely; a
//! [`WaitPolicy::Bounded`] bus turns that into [`BusError::ReadyTimeout`].

#![cfg_attr(not(feature = "std"), no_std)]

pub mod buffer;
pub mod bus;
pub mod config;
pub mod patch;
pub mod player;
pub mod registers;
pub mod stream;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

// Re-export main types for convenience
pub use buffer::{BufferError, LinearStore, MemoryStore, RingBuffer, SpiRam, SpiTransport, StoreError};
pub use bus::{BusError, HardwareBus, Transaction, TransactionMode, WaitPolicy};
pub use config::DriverConfig;
pub use patch::{load_patch, PatchError, PatchRecord, PatchRecords, PatchSummary};
pub use player::{DeviceState, PlaybackController, PlaybackError, PlaybackSettings};
pub use registers::RegisterProtocol;
pub use stream::{StopOutcome, StreamingWriter};

/// Library version for diagnostics
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Size of one ring buffer chunk, and the largest SDI transfer per DREQ gate
pub const CHUNK_SIZE: usize = 32;

/// One unit of audio data moved through the buffer and the streaming path
pub type Chunk = [u8; CHUNK_SIZE];
