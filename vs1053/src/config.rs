//! Driver configuration
//!
//! DREQ wait bounds are not part of this struct: they belong to the bus, see
//! [`crate::bus::HardwareBus::wait_policy`].

use serde::{Deserialize, Serialize};

use crate::stream::DEFAULT_STOP_POLL_BUDGET;

/// Configuration for the playback controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DriverConfig {
    /// SPI clock used right after reset, before the PLL is configured
    pub slow_clock_hz: u32,
    /// SPI clock used once `SCI_CLOCKF` has raised the internal clock
    pub fast_clock_hz: u32,
    /// Value written to `SCI_AUDATA` at bring-up (44.1 kHz stereo)
    pub sample_rate_word: u16,
    /// Value written to `SCI_CLOCKF` at bring-up (multiplier 3.0)
    pub clock_multiplier_word: u16,
    /// CANCEL polls allowed in `stop_song`
    pub stop_poll_budget: u16,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            slow_clock_hz: 200_000,
            fast_clock_hz: 4_000_000,
            sample_rate_word: 44_101,
            clock_multiplier_word: 6 << 12,
            stop_poll_budget: DEFAULT_STOP_POLL_BUDGET,
        }
    }
}
