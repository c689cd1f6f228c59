//! # SDI Streaming
//!
//! Bulk data goes to the decoder over the data port. DREQ high guarantees room
//! for at least 32 bytes, so transfers are cut into 32-byte pieces and DREQ is
//! checked before each one.
//!
//! ## Stopping a Song
//!
//! ```text
//!  2052 fill bytes ──► MODE |= CANCEL ──► ┌─► 32 fill bytes
//!                                         │   read MODE
//!                                         │   CANCEL clear? ──yes──► 2052 fill bytes ──► Stopped
//!                                         └── no (budget left)
//!                                             budget spent ───────► Incomplete
//! ```

use log::{debug, info, warn};

use crate::bus::{BusError, HardwareBus};
use crate::registers::{RegisterProtocol, MODE_CANCEL, MODE_SDINEW, SCI_LAST_REGISTER, SCI_MODE};
use crate::CHUNK_SIZE;

/// Fill bytes sent before the first chunk of a song
pub const START_FILL_BYTES: usize = 10;

/// Fill bytes sent to flush the decoder when stopping
pub const STOP_FILL_BYTES: usize = 2052;

/// Fill bytes sent between CANCEL polls
pub const CANCEL_POLL_FILL_BYTES: usize = 32;

/// Default number of CANCEL polls before giving up
pub const DEFAULT_STOP_POLL_BUDGET: u16 = 200;

/// Result of [`StreamingWriter::stop_song`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StopOutcome {
    /// The decoder acknowledged CANCEL
    Stopped {
        /// Polls needed before CANCEL cleared
        polls: u16,
        /// Last `SCI_MODE` value read back
        mode: u16,
    },
    /// CANCEL was still set when the poll budget ran out
    Incomplete {
        /// Last `SCI_MODE` value read back, or the value written if none was read
        mode: u16,
    },
}

impl StopOutcome {
    /// `SCI_MODE` as last seen during the stop sequence
    pub fn mode(&self) -> u16 {
        match self {
            StopOutcome::Stopped { mode, .. } | StopOutcome::Incomplete { mode } => *mode,
        }
    }
}

/// Ready-gated writer for the data port
///
/// Borrows the bus for its lifetime, together with the end-fill byte read from
/// the decoder at bring-up.
pub struct StreamingWriter<'a, B: HardwareBus> {
    bus: &'a mut B,
    fill_byte: u8,
    stop_poll_budget: u16,
}

impl<'a, B: HardwareBus> StreamingWriter<'a, B> {
    /// Create a writer that pads with `fill_byte`
    pub fn new(bus: &'a mut B, fill_byte: u8) -> Self {
        Self {
            bus,
            fill_byte,
            stop_poll_budget: DEFAULT_STOP_POLL_BUDGET,
        }
    }

    /// Override the number of CANCEL polls in [`StreamingWriter::stop_song`]
    pub fn with_stop_poll_budget(mut self, budget: u16) -> Self {
        self.stop_poll_budget = budget;
        self
    }

    /// Byte used for padding
    pub fn fill_byte(&self) -> u8 {
        self.fill_byte
    }

    /// Send `data` to the decoder, blocking until every byte is accepted
    pub fn play_chunk(&mut self, data: &[u8]) -> Result<(), BusError> {
        let mut txn = self.bus.begin_data_transaction();
        for piece in data.chunks(CHUNK_SIZE) {
            txn.wait_ready()?;
            txn.transfer_bytes(piece)?;
        }
        Ok(())
    }

    /// Send `count` copies of the fill byte, chunked like real data
    pub fn send_filler_bytes(&mut self, count: usize) -> Result<(), BusError> {
        let fill = self.fill_byte;
        let mut txn = self.bus.begin_data_transaction();
        let mut remaining = count;
        while remaining > 0 {
            txn.wait_ready()?;
            let piece = remaining.min(CHUNK_SIZE);
            txn.transfer_fill(fill, piece)?;
            remaining -= piece;
        }
        Ok(())
    }

    /// Prime the decoder pipeline before the first chunk of a song
    pub fn start_song(&mut self) -> Result<(), BusError> {
        self.send_filler_bytes(START_FILL_BYTES)
    }

    /// Flush and cancel the current song
    ///
    /// A [`StopOutcome::Incomplete`] stop is logged with a register dump but
    /// is not an error; the caller may keep streaming.
    pub fn stop_song(&mut self) -> Result<StopOutcome, BusError> {
        self.send_filler_bytes(STOP_FILL_BYTES)?;
        self.bus.delay_ms(10);
        let mut mode = MODE_SDINEW | MODE_CANCEL;
        self.bus.write_register(SCI_MODE, mode)?;

        for poll in 0..self.stop_poll_budget {
            self.send_filler_bytes(CANCEL_POLL_FILL_BYTES)?;
            mode = self.bus.read_register(SCI_MODE)?;
            if mode & MODE_CANCEL == 0 {
                self.send_filler_bytes(STOP_FILL_BYTES)?;
                info!("Song stopped correctly after {} msec", u32::from(poll) * 10);
                return Ok(StopOutcome::Stopped { polls: poll, mode });
            }
            self.bus.delay_ms(10);
        }

        warn!("Song stopped incorrectly!");
        for address in 0..=SCI_LAST_REGISTER {
            let value = self.bus.read_register(address)?;
            debug!("{:3X} - {:5X}", address, value);
        }
        Ok(StopOutcome::Incomplete { mode })
    }
}

impl<B: HardwareBus> embedded_io::ErrorType for StreamingWriter<'_, B> {
    type Error = BusError;
}

impl<B: HardwareBus> embedded_io::Write for StreamingWriter<'_, B> {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Self::Error> {
        self.play_chunk(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{TransactionMode, WaitPolicy};
    use crate::mock::{BusEvent, MockCodec};

    #[test]
    fn test_play_chunk_sends_all_bytes_in_gated_pieces() {
        let mut bus = MockCodec::new();
        let data: [u8; 100] = core::array::from_fn(|i| i as u8);

        StreamingWriter::new(&mut bus, 0).play_chunk(&data).unwrap();

        assert_eq!(bus.sdi(), &data[..]);
        assert!(bus.max_gate_bytes() <= CHUNK_SIZE);
        assert_eq!(
            bus.events(),
            &[BusEvent::Open(TransactionMode::Data), BusEvent::End]
        );
    }

    #[test]
    fn test_play_chunk_waits_for_ready() {
        let mut bus = MockCodec::new();
        bus.hold_ready_low_for(3);

        StreamingWriter::new(&mut bus, 0).play_chunk(&[1, 2, 3]).unwrap();
        assert_eq!(bus.yields(), 3);
        assert_eq!(bus.sdi(), &[1, 2, 3]);
    }

    #[test]
    fn test_filler_bytes_use_fill_byte() {
        let mut bus = MockCodec::new();
        StreamingWriter::new(&mut bus, 0x0F)
            .send_filler_bytes(70)
            .unwrap();

        assert_eq!(bus.sdi().len(), 70);
        assert!(bus.sdi().iter().all(|&b| b == 0x0F));
        assert!(bus.max_gate_bytes() <= CHUNK_SIZE);
    }

    #[test]
    fn test_start_song_primes_with_ten_fillers() {
        let mut bus = MockCodec::new();
        StreamingWriter::new(&mut bus, 0xAA).start_song().unwrap();
        assert_eq!(bus.sdi(), &[0xAA; START_FILL_BYTES]);
    }

    #[test]
    fn test_stop_song_completes_when_cancel_clears() {
        // CANCEL clears during the third poll burst
        let mut bus = MockCodec::new().with_cancel_after(Some(80));
        let outcome = StreamingWriter::new(&mut bus, 0).stop_song().unwrap();

        assert_eq!(
            outcome,
            StopOutcome::Stopped {
                polls: 2,
                mode: MODE_SDINEW
            }
        );
        assert_eq!(outcome.mode() & MODE_CANCEL, 0);
        assert_eq!(
            bus.writes_to(SCI_MODE),
            [MODE_SDINEW | MODE_CANCEL]
        );
        assert_eq!(
            bus.sdi().len(),
            STOP_FILL_BYTES + 3 * CANCEL_POLL_FILL_BYTES + STOP_FILL_BYTES
        );
    }

    #[test]
    fn test_stop_song_reports_incomplete_after_budget() {
        let mut bus = MockCodec::new().with_cancel_after(None);
        let outcome = StreamingWriter::new(&mut bus, 0)
            .with_stop_poll_budget(5)
            .stop_song()
            .unwrap();

        assert_eq!(
            outcome,
            StopOutcome::Incomplete {
                mode: MODE_SDINEW | MODE_CANCEL
            }
        );
        assert_eq!(
            bus.sdi().len(),
            STOP_FILL_BYTES + 5 * CANCEL_POLL_FILL_BYTES
        );
        // five MODE polls plus the diagnostic dump of every register
        assert_eq!(bus.reads().len(), 5 + 16);
    }

    #[test]
    fn test_stream_propagates_timeout() {
        let mut bus = MockCodec::new().with_wait_policy(WaitPolicy::Bounded { max_polls: 2 });
        bus.set_ready(false);

        let result = StreamingWriter::new(&mut bus, 0).play_chunk(&[0u8; 64]);
        assert_eq!(result, Err(BusError::ReadyTimeout { polls: 2 }));
        assert!(bus.sdi().is_empty());
        assert!(!bus.in_transaction());
    }

    #[test]
    fn test_io_write_streams_whole_buffer() {
        use embedded_io::Write;

        let mut bus = MockCodec::new();
        let mut writer = StreamingWriter::new(&mut bus, 0);
        writer.write_all(&[7u8; 45]).unwrap();
        writer.flush().unwrap();

        assert_eq!(bus.sdi(), &[7u8; 45]);
    }

    #[test]
    fn test_stop_song_without_polls_reports_written_mode() {
        let mut bus = MockCodec::new().with_cancel_after(None);
        let outcome = StreamingWriter::new(&mut bus, 0)
            .with_stop_poll_budget(0)
            .stop_song()
            .unwrap();

        assert_eq!(outcome.mode(), MODE_SDINEW | MODE_CANCEL);
        assert!(matches!(outcome, StopOutcome::Incomplete { .. }));
    }
}
