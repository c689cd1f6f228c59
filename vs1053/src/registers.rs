//! # SCI Register Protocol
//!
//! Register access over the control port. Every operation is one control
//! transaction:
//!
//! ```text
//! ┌──────────┬──────────┬─────────────────────┐
//! │  Opcode  │ Register │   Data (MSB first)  │
//! │  1 byte  │  1 byte  │       16 bits       │
//! └──────────┴──────────┴─────────────────────┘
//!   0x03 read / 0x02 write
//! ```
//!
//! The extended WRAM space is reached indirectly: the cell address goes into
//! `SCI_WRAMADDR`, the data moves through `SCI_WRAM`.

use log::{info, trace, warn};

use crate::bus::{BusError, HardwareBus};

/// SCI read opcode
pub const SCI_READ: u8 = 0x03;
/// SCI write opcode
pub const SCI_WRITE: u8 = 0x02;

/// Mode control
pub const SCI_MODE: u8 = 0x0;
/// Status, holds the chip version in bits 7:4
pub const SCI_STATUS: u8 = 0x1;
/// Built-in bass and treble control
pub const SCI_BASS: u8 = 0x2;
/// Clock frequency and multiplier
pub const SCI_CLOCKF: u8 = 0x3;
/// Decoded time in full seconds
pub const SCI_DECODE_TIME: u8 = 0x4;
/// Sample rate and channel count
pub const SCI_AUDATA: u8 = 0x5;
/// WRAM data port
pub const SCI_WRAM: u8 = 0x6;
/// WRAM address pointer, auto-incremented by each `SCI_WRAM` access
pub const SCI_WRAMADDR: u8 = 0x7;
/// Volume, left channel in the high byte
pub const SCI_VOL: u8 = 0xB;
/// Highest register of the primary file
pub const SCI_LAST_REGISTER: u8 = 0xF;

/// Soft reset
pub const MODE_RESET: u16 = 1 << 2;
/// Cancel decoding of the current song
pub const MODE_CANCEL: u16 = 1 << 3;
/// Native SPI modes, always on
pub const MODE_SDINEW: u16 = 1 << 11;
/// Line input instead of microphone
pub const MODE_LINE1: u16 = 1 << 14;

/// Sample step of the slow self-test sweep
pub const SELF_TEST_DELTA_SLOW: u16 = 300;
/// Sample step of the fast self-test sweep
pub const SELF_TEST_DELTA_FAST: u16 = 3;
/// Mismatch count that aborts a self-test sweep
pub const SELF_TEST_MAX_ERRORS: u16 = 20;

/// Register level access, provided for every [`HardwareBus`]
pub trait RegisterProtocol {
    /// Read a 16-bit register
    fn read_register(&mut self, address: u8) -> Result<u16, BusError>;

    /// Write a 16-bit register
    fn write_register(&mut self, address: u8, value: u16) -> Result<(), BusError>;

    /// Write one WRAM cell
    fn wram_write(&mut self, address: u16, value: u16) -> Result<(), BusError> {
        self.write_register(SCI_WRAMADDR, address)?;
        self.write_register(SCI_WRAM, value)
    }

    /// Read one WRAM cell
    fn wram_read(&mut self, address: u16) -> Result<u16, BusError> {
        self.write_register(SCI_WRAMADDR, address)?;
        self.read_register(SCI_WRAM)
    }

    /// Check that the SCI port writes and reads back without errors
    ///
    /// Sweeps `SCI_VOL` over its 16-bit range, step 3 when `fast` and 300
    /// otherwise. Each sample is written and read back twice; any disagreement
    /// counts as a mismatch. The sweep stops at the 20th mismatch. Returns
    /// `true` only if no mismatch was seen.
    fn self_test(&mut self, label: &str, fast: bool) -> Result<bool, BusError>;
}

impl<B: HardwareBus> RegisterProtocol for B {
    fn read_register(&mut self, address: u8) -> Result<u16, BusError> {
        self.wait_ready()?;
        let mut txn = self.begin_control_transaction();
        txn.transfer(SCI_READ)?;
        txn.transfer(address)?;
        let high = txn.transfer(0xFF)?;
        let low = txn.transfer(0xFF)?;
        txn.wait_ready()?;
        let value = u16::from_be_bytes([high, low]);
        trace!("SCI read  {:#04x} -> {:#06x}", address, value);
        Ok(value)
    }

    fn write_register(&mut self, address: u8, value: u16) -> Result<(), BusError> {
        trace!("SCI write {:#04x} <- {:#06x}", address, value);
        self.wait_ready()?;
        let mut txn = self.begin_control_transaction();
        txn.transfer(SCI_WRITE)?;
        txn.transfer(address)?;
        txn.transfer_bytes(&value.to_be_bytes())?;
        txn.wait_ready()
    }

    fn self_test(&mut self, label: &str, fast: bool) -> Result<bool, BusError> {
        let delta = if fast {
            SELF_TEST_DELTA_FAST
        } else {
            SELF_TEST_DELTA_SLOW
        };
        info!("{}", label);

        let mut errors: u16 = 0;
        let mut sample: u16 = 0;
        while errors < SELF_TEST_MAX_ERRORS {
            self.write_register(SCI_VOL, sample)?;
            let first = self.read_register(SCI_VOL)?;
            let second = self.read_register(SCI_VOL)?;
            if first != second || sample != first {
                warn!(
                    "VS1053 error retry SB:{:04X} R1:{:04X} R2:{:04X}",
                    sample, first, second
                );
                errors += 1;
                self.delay_ms(10);
            }
            self.yield_now();

            sample = match sample.checked_add(delta) {
                Some(next) if next < 0xFFFF => next,
                _ => break,
            };
        }

        Ok(errors == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::WaitPolicy;
    use crate::mock::MockCodec;

    #[test]
    fn test_write_then_read_echoes() {
        let mut bus = MockCodec::new();
        for address in 0..=SCI_LAST_REGISTER {
            if address == SCI_MODE || address == SCI_WRAM {
                continue;
            }
            for value in 0..=u16::MAX {
                bus.write_register(address, value).unwrap();
                assert_eq!(bus.read_register(address).unwrap(), value);
            }
            bus.clear_log();
        }
    }

    #[test]
    fn test_register_ops_are_bracketed() {
        let mut bus = MockCodec::new();
        bus.write_register(SCI_VOL, 0x2020).unwrap();
        bus.read_register(SCI_VOL).unwrap();

        assert_eq!(bus.writes(), &[(SCI_VOL, 0x2020)]);
        assert_eq!(bus.reads(), &[SCI_VOL]);
        assert!(!bus.in_transaction());
    }

    #[test]
    fn test_wram_access_goes_through_address_register() {
        let mut bus = MockCodec::new();
        bus.set_wram(0x1E06, 0x00AB);

        assert_eq!(bus.wram_read(0x1E06).unwrap(), 0x00AB);
        bus.wram_write(0xC017, 3).unwrap();

        assert_eq!(bus.wram(0xC017), 3);
        assert_eq!(
            bus.writes(),
            &[(SCI_WRAMADDR, 0x1E06), (SCI_WRAMADDR, 0xC017), (SCI_WRAM, 3)]
        );
    }

    #[test]
    fn test_self_test_passes_on_echoing_device() {
        let mut bus = MockCodec::new();
        assert!(bus.self_test("Slow SPI", false).unwrap());

        // 0, 300, ... 65400
        assert_eq!(bus.writes_to(SCI_VOL).len(), 219);
    }

    #[test]
    fn test_fast_self_test_uses_fine_step() {
        let mut bus = MockCodec::new();
        assert!(bus.self_test("Fast SPI", true).unwrap());

        let writes = bus.writes_to(SCI_VOL);
        assert_eq!(writes[1], 3);
        assert_eq!(writes.len(), 21845);
    }

    #[test]
    fn test_self_test_stops_at_twentieth_mismatch() {
        // Every read is wrong: the sweep ends after exactly 20 samples
        let mut bus = MockCodec::new().with_read_fault(SCI_VOL, 0, 0x0001);
        assert!(!bus.self_test("Slow SPI", false).unwrap());
        assert_eq!(bus.writes_to(SCI_VOL).len(), 20);
    }

    #[test]
    fn test_self_test_early_exit_bound_mid_sweep() {
        // Samples from 30000 (index 100) onward are corrupted
        let mut bus = MockCodec::new().with_read_fault(SCI_VOL, 30_000, 0x0100);
        assert!(!bus.self_test("Slow SPI", false).unwrap());

        let writes = bus.writes_to(SCI_VOL);
        assert_eq!(writes.len(), 120);
        assert_eq!(*writes.last().unwrap(), 119 * 300);
        assert_eq!(bus.total_delay_ms(), 200);
    }

    #[test]
    fn test_single_mismatch_fails_whole_sweep() {
        let mut bus = MockCodec::new().with_read_fault(SCI_VOL, 65_200, 0x0004);
        assert!(!bus.self_test("Slow SPI", false).unwrap());
        assert_eq!(bus.writes_to(SCI_VOL).len(), 219);
    }

    #[test]
    fn test_register_read_times_out_with_bounded_policy() {
        let mut bus = MockCodec::new().with_wait_policy(WaitPolicy::Bounded { max_polls: 8 });
        bus.set_ready(false);

        assert_eq!(
            bus.read_register(SCI_STATUS),
            Err(BusError::ReadyTimeout { polls: 8 })
        );
        assert!(!bus.in_transaction());
    }
}
