//! # Playback Controller
//!
//! Owns the bus and drives the decoder through its lifecycle:
//!
//! ```text
//! Idle ──► reset pulse ──► slow SPI ──► DREQ low? ──────────────────► Degraded
//!                                          │                           ▲
//!                                          ▼                           │
//!                                   slow self-test ──── fail ──────────┘
//!                                          │ pass
//!                                          ▼
//!                 AUDATA, CLOCKF, fast SPI, MODE ──► fast self-test
//!                                          │
//!                                          ▼
//!                               read end-fill byte ──► Ready
//! ```
//!
//! `Degraded` is not fatal: data can still be pushed blind, but register
//! readbacks are not to be trusted.

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::buffer::{BufferError, LinearStore, RingBuffer};
use crate::bus::{BusError, HardwareBus};
use crate::config::DriverConfig;
use crate::patch::{self, PatchError, PatchSummary};
use crate::registers::{
    RegisterProtocol, MODE_LINE1, MODE_RESET, MODE_SDINEW, SCI_AUDATA, SCI_BASS, SCI_CLOCKF,
    SCI_DECODE_TIME, SCI_LAST_REGISTER, SCI_MODE, SCI_STATUS, SCI_VOL, SCI_WRAM, SCI_WRAMADDR,
};
use crate::stream::{StopOutcome, StreamingWriter};
use crate::{Chunk, CHUNK_SIZE};

/// WRAM cell holding the end-fill byte in its low half
pub const WRAM_END_FILL_BYTE: u16 = 0x1E06;
/// WRAM cell pair holding the sample rate fine tune (low half first)
pub const WRAM_RATE_TUNE: u16 = 0x1E07;
/// WRAM cell caching the last clock reference; zero forces recalculation
pub const WRAM_OLD_CLOCK_4KHZ: u16 = 0x5B1C;
/// GPIO direction register
pub const WRAM_GPIO_DDR: u16 = 0xC017;
/// GPIO output register
pub const WRAM_GPIO_ODATA: u16 = 0xC019;

/// Loudest volume setting
pub const MAX_VOLUME: u8 = 100;
/// Strongest balance skew in either direction
pub const MAX_BALANCE: i8 = 100;

/// Largest encoded [`PlaybackSettings`]
pub const SETTINGS_MAX_LEN: usize = 16;

/// Controller-level failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PlaybackError {
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error(transparent)]
    Patch(#[from] PatchError),
}

/// Where the decoder is in its lifecycle
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DeviceState {
    /// `begin` has not run
    #[default]
    Idle,
    /// Bring-up passed the slow self-test
    Ready,
    /// Degraded-ready: no DREQ or failed slow self-test
    ///
    /// The controller stays usable and data can still be pushed blind, but
    /// SCI readbacks are unreliable and the fast clock setup was skipped.
    Degraded,
}

/// Current playback settings and bring-up results
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PlaybackState {
    /// 0..=100, higher is louder
    pub volume: u8,
    /// -100..=100, positive attenuates the left channel
    pub balance: i8,
    /// Treble amplitude, treble limit, bass amplitude, bass limit
    pub tone: [u8; 4],
    /// Byte used to prime and flush the decoder
    pub fill_byte: u8,
    /// `SCI_MODE` as last written at bring-up or read back while stopping
    pub mode: u16,
    /// Lifecycle state
    pub device: DeviceState,
}

/// User-facing settings that survive a reboot
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PlaybackSettings {
    pub volume: u8,
    pub balance: i8,
    pub tone: [u8; 4],
}

impl PlaybackSettings {
    /// Encode for storage in NVS/EEPROM
    pub fn encode(&self) -> Result<heapless::Vec<u8, SETTINGS_MAX_LEN>, postcard::Error> {
        let mut buffer = [0u8; SETTINGS_MAX_LEN];
        let used = postcard::to_slice(self, &mut buffer)?;
        heapless::Vec::from_slice(used).map_err(|_| postcard::Error::SerializeBufferFull)
    }

    /// Decode settings previously produced by [`PlaybackSettings::encode`]
    pub fn decode(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}

/// SCI_VOL value for a volume and balance pair
///
/// Each channel's 0..=100 level maps linearly onto 0xFE..=0x00 attenuation.
/// A positive balance lowers the left level by `balance`, a negative one
/// lowers the right level, never below zero.
pub fn volume_register_value(volume: u8, balance: i8) -> u16 {
    let volume = i16::from(volume.min(MAX_VOLUME));
    let balance = i16::from(balance.clamp(-MAX_BALANCE, MAX_BALANCE));

    let (left, right) = match balance {
        b if b > 0 => ((volume - b).max(0), volume),
        b if b < 0 => (volume, (volume + b).max(0)),
        _ => (volume, volume),
    };

    (u16::from(attenuation(left)) << 8) | u16::from(attenuation(right))
}

fn attenuation(level: i16) -> u8 {
    (0xFE - level * 0xFE / 100) as u8
}

/// SCI_BASS value for four tone nibbles, first nibble most significant
pub fn tone_register_value(tone: &[u8; 4]) -> u16 {
    tone.iter()
        .fold(0u16, |value, nibble| (value << 4) | u16::from(nibble & 0x0F))
}

/// Drives one VS1053 over a [`HardwareBus`]
pub struct PlaybackController<B: HardwareBus> {
    bus: B,
    config: DriverConfig,
    state: PlaybackState,
}

impl<B: HardwareBus> PlaybackController<B> {
    /// Wrap the bus; nothing is sent until [`PlaybackController::begin`]
    pub fn new(bus: B, config: DriverConfig) -> Self {
        Self {
            bus,
            config,
            state: PlaybackState::default(),
        }
    }

    /// Reset the chip, verify SCI and switch to full speed
    pub fn begin(&mut self) -> Result<DeviceState, BusError> {
        self.bus.set_reset(false);
        self.bus.delay_ms(100);
        info!("Reset VS1053...");
        self.bus.set_reset(true);
        self.bus.delay_ms(500);
        info!("End reset VS1053...");
        self.bus.set_reset(false);
        self.bus.delay_ms(500);

        self.bus.set_clock_hz(self.config.slow_clock_hz);
        self.bus.delay_ms(20);

        if !self.bus.is_ready() {
            // A missing chip never raises DREQ; pull it up so later waits pass
            warn!("VS1053 not properly installed!");
            self.bus.enable_ready_pullup();
            return Ok(self.enter(DeviceState::Degraded));
        }

        if !self
            .bus
            .self_test("Slow SPI, Testing VS1053 read/write registers...", false)?
        {
            warn!("VS1053 slow self-test failed, readbacks unreliable");
            return Ok(self.enter(DeviceState::Degraded));
        }

        self.bus
            .write_register(SCI_AUDATA, self.config.sample_rate_word)?;
        self.bus
            .write_register(SCI_CLOCKF, self.config.clock_multiplier_word)?;
        self.bus.set_clock_hz(self.config.fast_clock_hz);
        self.bus
            .write_register(SCI_MODE, MODE_SDINEW | MODE_LINE1)?;
        self.state.mode = MODE_SDINEW | MODE_LINE1;

        if !self
            .bus
            .self_test("Fast SPI, Testing VS1053 read/write registers again...", true)?
        {
            warn!("VS1053 fast self-test failed");
        }
        self.bus.delay_ms(10);
        self.bus.wait_ready()?;

        self.state.fill_byte = (self.bus.wram_read(WRAM_END_FILL_BYTE)? & 0xFF) as u8;
        info!("endFillByte is {:X}", self.state.fill_byte);
        self.bus.delay_ms(100);

        Ok(self.enter(DeviceState::Ready))
    }

    fn enter(&mut self, device: DeviceState) -> DeviceState {
        self.state.device = device;
        device
    }

    /// Lifecycle state reached by the last [`PlaybackController::begin`]
    pub fn device_state(&self) -> DeviceState {
        self.state.device
    }

    /// Snapshot of volume, balance, tone and fill byte
    pub fn playback_state(&self) -> PlaybackState {
        self.state
    }

    /// Active configuration
    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// End-fill byte read at bring-up
    pub fn fill_byte(&self) -> u8 {
        self.state.fill_byte
    }

    /// Set volume for both channels, 0..=100 with 100 loudest
    pub fn set_volume(&mut self, volume: u8) -> Result<(), BusError> {
        self.state.volume = volume.min(MAX_VOLUME);
        self.write_volume()
    }

    /// Current volume setting
    pub fn volume(&self) -> u8 {
        self.state.volume
    }

    /// Skew volume between channels, -100..=100
    ///
    /// Positive values attenuate the left channel, negative values the right.
    pub fn set_balance(&mut self, balance: i8) -> Result<(), BusError> {
        self.state.balance = balance.clamp(-MAX_BALANCE, MAX_BALANCE);
        self.write_volume()
    }

    /// Current balance setting
    pub fn balance(&self) -> i8 {
        self.state.balance
    }

    fn write_volume(&mut self) -> Result<(), BusError> {
        let value = volume_register_value(self.state.volume, self.state.balance);
        self.bus.write_register(SCI_VOL, value)
    }

    /// Set treble/bass from four nibbles
    pub fn set_tone(&mut self, tone: &[u8; 4]) -> Result<(), BusError> {
        self.state.tone = tone.map(|nibble| nibble & 0x0F);
        self.bus
            .write_register(SCI_BASS, tone_register_value(&self.state.tone))
    }

    /// Current tone nibbles
    pub fn tone(&self) -> [u8; 4] {
        self.state.tone
    }

    /// Settings worth persisting
    pub fn settings(&self) -> PlaybackSettings {
        PlaybackSettings {
            volume: self.state.volume,
            balance: self.state.balance,
            tone: self.state.tone,
        }
    }

    /// Restore persisted settings on the chip
    pub fn apply_settings(&mut self, settings: &PlaybackSettings) -> Result<(), BusError> {
        self.state.volume = settings.volume.min(MAX_VOLUME);
        self.state.balance = settings.balance.clamp(-MAX_BALANCE, MAX_BALANCE);
        self.write_volume()?;
        self.set_tone(&settings.tone)
    }

    /// Check that the chip is powered and wired
    ///
    /// An unpowered or unwired chip reads back all zeros or all ones.
    pub fn is_chip_connected(&mut self) -> Result<bool, BusError> {
        let status = self.bus.read_register(SCI_STATUS)?;
        Ok(!(status == 0 || status == 0xFFFF))
    }

    /// Decoded time of the current stream in full seconds
    pub fn decoded_time(&mut self) -> Result<u16, BusError> {
        self.bus.read_register(SCI_DECODE_TIME)
    }

    /// Reset the decoded time to zero
    pub fn clear_decoded_time(&mut self) -> Result<(), BusError> {
        // The firmware can overwrite a single write; the second one sticks
        self.bus.write_register(SCI_DECODE_TIME, 0)?;
        self.bus.write_register(SCI_DECODE_TIME, 0)
    }

    /// Fine tune the sample rate by `ppm2` (units of 2 ppm)
    pub fn adjust_rate(&mut self, ppm2: i32) -> Result<(), BusError> {
        let low = ppm2 as u16;
        let high = (ppm2 >> 16) as u16;
        self.bus.write_register(SCI_WRAMADDR, WRAM_RATE_TUNE)?;
        self.bus.write_register(SCI_WRAM, low)?;
        self.bus.write_register(SCI_WRAM, high)?;
        self.bus.write_register(SCI_WRAMADDR, WRAM_OLD_CLOCK_4KHZ)?;
        self.bus.write_register(SCI_WRAM, 0)?;
        // Rewriting AUDATA makes the firmware recompute the adjustment
        let audata = self.bus.read_register(SCI_AUDATA)?;
        self.bus.write_register(SCI_AUDATA, audata)
    }

    /// Soft reset through SCI_MODE
    pub fn soft_reset(&mut self) -> Result<(), BusError> {
        info!("Performing soft-reset");
        self.bus
            .write_register(SCI_MODE, MODE_SDINEW | MODE_RESET)?;
        self.bus.delay_ms(10);
        self.bus.wait_ready()
    }

    /// Leave MIDI mode on boards that strap GPIO0 high
    pub fn switch_to_mp3_mode(&mut self) -> Result<(), BusError> {
        self.bus.wram_write(WRAM_GPIO_DDR, 3)?;
        self.bus.wram_write(WRAM_GPIO_ODATA, 0)?;
        self.bus.delay_ms(100);
        info!("Switched to mp3 mode");
        self.soft_reset()
    }

    /// Current DREQ level
    pub fn data_request(&mut self) -> bool {
        self.bus.is_ready()
    }

    /// Read every register of the primary file
    pub fn dump_registers(&mut self) -> Result<[u16; 16], BusError> {
        let mut registers = [0u16; 16];
        for (address, slot) in (0..=SCI_LAST_REGISTER).zip(registers.iter_mut()) {
            *slot = self.bus.read_register(address)?;
        }
        Ok(registers)
    }

    /// Log a register dump under `header`
    pub fn print_details(&mut self, header: &str) -> Result<(), BusError> {
        let registers = self.dump_registers()?;
        info!("{}", header);
        info!("REG   Contents");
        info!("---   -----");
        for (address, value) in registers.iter().enumerate() {
            info!("{:3X} - {:5X}", address, value);
        }
        Ok(())
    }

    /// Run the SCI read/write sweep
    pub fn self_test(&mut self, label: &str, fast: bool) -> Result<bool, BusError> {
        self.bus.self_test(label, fast)
    }

    /// Writer for the data port using the end-fill byte
    pub fn stream(&mut self) -> StreamingWriter<'_, B> {
        StreamingWriter::new(&mut self.bus, self.state.fill_byte)
            .with_stop_poll_budget(self.config.stop_poll_budget)
    }

    /// Prime the decoder; call at the start of every song
    pub fn start_song(&mut self) -> Result<(), BusError> {
        self.stream().start_song()
    }

    /// Send audio data, blocking until the decoder has taken all of it
    pub fn play_chunk(&mut self, data: &[u8]) -> Result<(), BusError> {
        self.stream().play_chunk(data)
    }

    /// Flush and cancel; call after the last chunk of a song
    ///
    /// The last MODE value seen is mirrored into [`PlaybackState::mode`].
    pub fn stop_song(&mut self) -> Result<StopOutcome, BusError> {
        let outcome = self.stream().stop_song()?;
        self.state.mode = outcome.mode();
        if let StopOutcome::Incomplete { mode } = outcome {
            warn!("Decoder did not acknowledge CANCEL, MODE {:#06x}", mode);
        }
        Ok(outcome)
    }

    /// `SCI_MODE` mirrored from the last bring-up or stop
    pub fn mode(&self) -> u16 {
        self.state.mode
    }

    /// Apply a firmware patch or plugin image
    pub fn load_patch(&mut self, words: &[u16], count: usize) -> Result<PatchSummary, PatchError> {
        patch::load_patch(&mut self.bus, words, count)
    }

    /// Move chunks from `ring` to the decoder while it asks for data
    ///
    /// Stops after `max_chunks`, when the ring runs dry or when DREQ drops.
    /// Returns the number of chunks sent. A chunk leaves the ring only once
    /// the decoder has taken all of it, so a bus error keeps it queued.
    pub fn feed_from<S: LinearStore, const N: usize>(
        &mut self,
        ring: &mut RingBuffer<S, N>,
        max_chunks: usize,
    ) -> Result<usize, PlaybackError> {
        let mut chunk: Chunk = [0u8; CHUNK_SIZE];
        let mut sent = 0;
        while sent < max_chunks && ring.data_available() > 0 && self.data_request() {
            ring.peek(&mut chunk)?;
            self.play_chunk(&chunk)?;
            ring.consume()?;
            sent += 1;
        }
        if sent > 0 {
            debug!("Fed {} chunks, {} buffered", sent, ring.data_available());
        }
        Ok(sent)
    }

    /// Borrow the bus
    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// Mutably borrow the bus
    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    /// Give the bus back
    pub fn into_inner(self) -> B {
        self.bus
    }
}
