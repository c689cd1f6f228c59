//! # HardwareBus Trait & Transaction Guards
//!
//! The VS1053 shares one SPI bus between two logical ports:
//!
//! - **SCI** (control mode): XCS asserted, register read/write
//! - **SDI** (data mode): XDCS asserted, raw compressed audio bytes
//!
//! Only one mode may be active at a time. A [`Transaction`] guard acquires the
//! bus, asserts the select line and releases both when dropped, so early `?`
//! returns can never leave a select line asserted.
//!
//! ## DREQ
//!
//! The device raises DREQ when it can accept the next SCI operation or the
//! next 32 bytes of SDI data. [`HardwareBus::wait_ready`] polls it and yields
//! to the scheduler on every poll. There is no timeout unless the bus reports
//! a [`WaitPolicy::Bounded`] policy.

use core::ops::{Deref, DerefMut};

use serde::{Deserialize, Serialize};

/// Errors raised at the bus boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusError {
    /// DREQ did not rise within the configured number of polls
    #[error("DREQ stayed low for {polls} polls")]
    ReadyTimeout {
        /// Number of polls performed before giving up
        polls: u32,
    },
    /// The SPI peripheral reported a failed transfer
    #[error("SPI transfer failed")]
    Transfer,
}

impl embedded_io::Error for BusError {
    fn kind(&self) -> embedded_io::ErrorKind {
        match self {
            BusError::ReadyTimeout { .. } => embedded_io::ErrorKind::TimedOut,
            BusError::Transfer => embedded_io::ErrorKind::Other,
        }
    }
}

/// How long to wait for DREQ before giving up
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum WaitPolicy {
    /// Block until DREQ rises, however long that takes
    #[default]
    Forever,
    /// Fail with [`BusError::ReadyTimeout`] after this many unsuccessful polls
    Bounded {
        /// Maximum number of low DREQ samples tolerated
        max_polls: u32,
    },
}

/// Which select line a transaction asserts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransactionMode {
    /// XCS low: SCI register access
    Control,
    /// XDCS low: SDI data streaming
    Data,
}

/// Capability interface over the pins and SPI peripheral wired to the codec
///
/// Implementations map these calls onto a concrete HAL. Protocol code only
/// talks to this trait, which is what lets [`crate::mock::MockCodec`] stand in
/// for real hardware in tests.
pub trait HardwareBus {
    /// Sample the DREQ line
    fn is_ready(&mut self) -> bool;

    /// Give the surrounding cooperative scheduler one tick
    fn yield_now(&mut self);

    /// Acquire the SPI bus and assert the select line for `mode`
    fn open(&mut self, mode: TransactionMode);

    /// Deassert both select lines and release the SPI bus
    fn end_transaction(&mut self);

    /// Exchange one byte, MSB first
    fn transfer(&mut self, byte: u8) -> Result<u8, BusError>;

    /// Drive both select lines low (`true`) to hold the chip in reset, or
    /// both high (`false`) to release it
    fn set_reset(&mut self, asserted: bool);

    /// Change the SPI clock used by subsequent transactions
    fn set_clock_hz(&mut self, hz: u32);

    /// Block for `ms` milliseconds
    fn delay_ms(&mut self, ms: u32);

    /// Switch DREQ to an input with pull-up so a missing chip reads as ready
    fn enable_ready_pullup(&mut self);

    /// Wait policy applied by [`HardwareBus::wait_ready`]
    fn wait_policy(&self) -> WaitPolicy {
        WaitPolicy::Forever
    }

    /// Busy-wait until DREQ is high, yielding once per poll
    fn wait_ready(&mut self) -> Result<(), BusError> {
        let mut polls: u32 = 0;
        while !self.is_ready() {
            if let WaitPolicy::Bounded { max_polls } = self.wait_policy() {
                if polls >= max_polls {
                    return Err(BusError::ReadyTimeout { polls });
                }
            }
            polls = polls.saturating_add(1);
            self.yield_now();
        }
        Ok(())
    }

    /// Open an SCI transaction, released when the guard drops
    fn begin_control_transaction(&mut self) -> Transaction<'_, Self> {
        Transaction::new(self, TransactionMode::Control)
    }

    /// Open an SDI transaction, released when the guard drops
    fn begin_data_transaction(&mut self) -> Transaction<'_, Self> {
        Transaction::new(self, TransactionMode::Data)
    }

    /// Send every byte of `data`, discarding what comes back
    fn transfer_bytes(&mut self, data: &[u8]) -> Result<(), BusError> {
        for &byte in data {
            self.transfer(byte)?;
        }
        Ok(())
    }

    /// Send `byte` `count` times
    fn transfer_fill(&mut self, byte: u8, count: usize) -> Result<(), BusError> {
        for _ in 0..count {
            self.transfer(byte)?;
        }
        Ok(())
    }
}

/// Scoped ownership of the bus in one mode
///
/// Dereferences to the underlying bus so transfers can be issued through it.
/// Dropping the guard ends the transaction.
pub struct Transaction<'a, B: HardwareBus + ?Sized> {
    bus: &'a mut B,
    mode: TransactionMode,
}

impl<'a, B: HardwareBus + ?Sized> Transaction<'a, B> {
    /// Assert the select line for `mode` and take the bus
    pub fn new(bus: &'a mut B, mode: TransactionMode) -> Self {
        bus.open(mode);
        Self { bus, mode }
    }

    /// The mode this transaction was opened in
    pub fn mode(&self) -> TransactionMode {
        self.mode
    }
}

impl<B: HardwareBus + ?Sized> Deref for Transaction<'_, B> {
    type Target = B;

    fn deref(&self) -> &B {
        self.bus
    }
}

impl<B: HardwareBus + ?Sized> DerefMut for Transaction<'_, B> {
    fn deref_mut(&mut self) -> &mut B {
        self.bus
    }
}

impl<B: HardwareBus + ?Sized> Drop for Transaction<'_, B> {
    fn drop(&mut self) {
        self.bus.end_transaction();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{BusEvent, MockCodec};

    #[test]
    fn test_wait_policy_default_is_forever() {
        assert_eq!(WaitPolicy::default(), WaitPolicy::Forever);
    }

    #[test]
    fn test_wait_ready_yields_until_ready() {
        let mut bus = MockCodec::new();
        bus.hold_ready_low_for(5);

        bus.wait_ready().unwrap();
        assert_eq!(bus.yields(), 5);
    }

    #[test]
    fn test_bounded_wait_times_out() {
        let mut bus = MockCodec::new().with_wait_policy(WaitPolicy::Bounded { max_polls: 3 });
        bus.set_ready(false);

        let result = bus.wait_ready();
        assert_eq!(result, Err(BusError::ReadyTimeout { polls: 3 }));
        assert_eq!(bus.yields(), 3);
    }

    #[test]
    fn test_bounded_wait_succeeds_within_budget() {
        let mut bus = MockCodec::new().with_wait_policy(WaitPolicy::Bounded { max_polls: 10 });
        bus.hold_ready_low_for(4);

        assert!(bus.wait_ready().is_ok());
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let mut bus = MockCodec::new();
        {
            let mut txn = bus.begin_data_transaction();
            assert_eq!(txn.mode(), TransactionMode::Data);
            txn.transfer(0x55).unwrap();
        }

        assert_eq!(
            bus.events(),
            &[
                BusEvent::Open(TransactionMode::Data),
                BusEvent::End,
            ]
        );
        assert!(!bus.in_transaction());
    }

    #[test]
    fn test_guard_releases_on_early_error() {
        fn failing_write<B: HardwareBus>(bus: &mut B) -> Result<(), BusError> {
            let mut txn = bus.begin_control_transaction();
            txn.transfer(0x02)?;
            txn.wait_ready()?;
            txn.transfer(0x0B)?;
            Ok(())
        }

        let mut bus = MockCodec::new().with_wait_policy(WaitPolicy::Bounded { max_polls: 1 });
        bus.set_ready(false);

        assert!(failing_write(&mut bus).is_err());
        assert!(!bus.in_transaction());
    }

    #[test]
    fn test_bus_error_maps_to_io_kind() {
        use embedded_io::Error;

        let timeout = BusError::ReadyTimeout { polls: 1 };
        assert_eq!(timeout.kind(), embedded_io::ErrorKind::TimedOut);
        assert_eq!(BusError::Transfer.kind(), embedded_io::ErrorKind::Other);
    }
}
