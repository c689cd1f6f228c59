//! # Plugin / Patch Loader
//!
//! VLSI distributes firmware patches and plugins as a compressed stream of
//! 16-bit words. The stream is a concatenation of records:
//!
//! ```text
//! ┌─────────┬──────────────────┬───────────────────────────┐
//! │ address │ count            │ values                    │
//! │ 1 word  │ 1 word           │ 1 word (run) / N (copy)   │
//! └─────────┴──────────────────┴───────────────────────────┘
//!             bit 15 set: run of N = count & 0x7FFF copies
//! ```
//!
//! Both record kinds write every value to the *same* register address; the
//! address is not incremented between values. Loading code into WRAM relies on
//! the auto-incrementing `SCI_WRAMADDR` pointer inside the chip, not on the
//! record address.

use log::debug;

use crate::bus::BusError;
use crate::registers::RegisterProtocol;

/// Bit of the count word that marks a run record
pub const RUN_FLAG: u16 = 0x8000;

/// Errors raised while decoding or loading a patch
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PatchError {
    /// The declared element count is larger than the supplied words
    #[error("declared {declared} words but only {available} supplied")]
    CountExceedsBuffer {
        /// Element count passed by the caller
        declared: usize,
        /// Length of the word slice
        available: usize,
    },
    /// A record runs past the declared element count
    #[error("record at word {offset} is truncated")]
    Truncated {
        /// Word offset of the record header
        offset: usize,
    },
    /// A record targets an address the SCI port cannot express
    #[error("record at word {offset} targets address {address:#06x}")]
    InvalidAddress {
        /// Word offset of the record header
        offset: usize,
        /// The offending address word
        address: u16,
    },
    /// The bus failed while writing
    #[error("bus error while loading patch: {0}")]
    Bus(#[from] BusError),
}

/// One decoded record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchRecord<'a> {
    /// Write `value` to `address` `count` times
    Run {
        address: u16,
        count: u16,
        value: u16,
    },
    /// Write each of `values` to `address`, in order
    Copy { address: u16, values: &'a [u16] },
}

impl PatchRecord<'_> {
    /// Target register address
    pub fn address(&self) -> u16 {
        match self {
            PatchRecord::Run { address, .. } | PatchRecord::Copy { address, .. } => *address,
        }
    }

    /// Number of register writes this record produces
    pub fn write_count(&self) -> usize {
        match self {
            PatchRecord::Run { count, .. } => usize::from(*count),
            PatchRecord::Copy { values, .. } => values.len(),
        }
    }
}

/// Iterator over the records of a patch image
///
/// Yields an error and then stops if a record is malformed.
#[derive(Debug, Clone)]
pub struct PatchRecords<'a> {
    words: &'a [u16],
    offset: usize,
    failed: bool,
}

impl<'a> PatchRecords<'a> {
    /// Decode the first `count` words of `words`
    pub fn new(words: &'a [u16], count: usize) -> Result<Self, PatchError> {
        if count > words.len() {
            return Err(PatchError::CountExceedsBuffer {
                declared: count,
                available: words.len(),
            });
        }
        Ok(Self {
            words: &words[..count],
            offset: 0,
            failed: false,
        })
    }

    fn next_record(&mut self) -> Result<PatchRecord<'a>, PatchError> {
        let words = self.words;
        let start = self.offset;
        let truncated = PatchError::Truncated { offset: start };

        let (address, header) = match &words[start..] {
            [address, header, ..] => (*address, *header),
            _ => return Err(truncated),
        };
        let n = header & !RUN_FLAG;
        let body = start + 2;

        if header & RUN_FLAG != 0 {
            let value = *words.get(body).ok_or(truncated)?;
            self.offset = body + 1;
            Ok(PatchRecord::Run {
                address,
                count: n,
                value,
            })
        } else {
            let end = body + usize::from(n);
            let values = words.get(body..end).ok_or(truncated)?;
            self.offset = end;
            Ok(PatchRecord::Copy { address, values })
        }
    }
}

impl<'a> Iterator for PatchRecords<'a> {
    type Item = Result<PatchRecord<'a>, PatchError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.offset >= self.words.len() {
            return None;
        }
        let record = self.next_record();
        self.failed = record.is_err();
        Some(record)
    }
}

/// Totals reported after a successful load
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PatchSummary {
    /// Records decoded
    pub records: usize,
    /// Register writes issued
    pub writes: usize,
}

/// Replay the first `count` words of a patch image as register writes
///
/// Each record is fully validated before any of its writes are issued, so a
/// malformed record never produces a partial write sequence of its own.
pub fn load_patch<R: RegisterProtocol + ?Sized>(
    regs: &mut R,
    words: &[u16],
    count: usize,
) -> Result<PatchSummary, PatchError> {
    let mut summary = PatchSummary::default();
    let mut offset = 0;

    for record in PatchRecords::new(words, count)? {
        let record = record?;
        let address = u8::try_from(record.address()).map_err(|_| PatchError::InvalidAddress {
            offset,
            address: record.address(),
        })?;

        match record {
            PatchRecord::Run { count, value, .. } => {
                for _ in 0..count {
                    regs.write_register(address, value)?;
                }
                offset += 3;
            }
            PatchRecord::Copy { values, .. } => {
                for &value in values {
                    regs.write_register(address, value)?;
                }
                offset += 2 + values.len();
            }
        }

        summary.records += 1;
        summary.writes += record.write_count();
    }

    debug!(
        "Patch loaded: {} records, {} writes",
        summary.records, summary.writes
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockCodec;
    use crate::registers::{SCI_WRAM, SCI_WRAMADDR};

    #[test]
    fn test_run_record_repeats_value() {
        let mut bus = MockCodec::new();
        let words = [0x0010, 0x8005, 0x1234];

        let summary = load_patch(&mut bus, &words, words.len()).unwrap();

        assert_eq!(bus.writes(), &[(0x10, 0x1234); 5]);
        assert_eq!(summary, PatchSummary { records: 1, writes: 5 });
    }

    #[test]
    fn test_copy_record_writes_same_address() {
        let mut bus = MockCodec::new();
        let words = [0x0020, 0x0003, 0x0001, 0x0002, 0x0003];

        load_patch(&mut bus, &words, words.len()).unwrap();

        assert_eq!(bus.writes(), &[(0x20, 0x01), (0x20, 0x02), (0x20, 0x03)]);
    }

    #[test]
    fn test_mixed_records_load_wram() {
        let mut bus = MockCodec::new();
        // WRAMADDR = 0x8010, then three code words, then a run of two zeros
        #[rustfmt::skip]
        let words = [
            SCI_WRAMADDR as u16, 0x0001, 0x8010,
            SCI_WRAM as u16, 0x0003, 0xAAAA, 0xBBBB, 0xCCCC,
            SCI_WRAM as u16, 0x8002, 0x0000,
        ];

        let summary = load_patch(&mut bus, &words, words.len()).unwrap();

        assert_eq!(summary, PatchSummary { records: 3, writes: 6 });
        assert_eq!(bus.wram(0x8010), 0xAAAA);
        assert_eq!(bus.wram(0x8011), 0xBBBB);
        assert_eq!(bus.wram(0x8012), 0xCCCC);
        assert_eq!(bus.wram(0x8014), 0x0000);
    }

    #[test]
    fn test_count_limits_decoding() {
        let mut bus = MockCodec::new();
        let words = [0x0010, 0x8001, 0x1111, 0x0011, 0x8001, 0x2222];

        load_patch(&mut bus, &words, 3).unwrap();
        assert_eq!(bus.writes(), &[(0x10, 0x1111)]);
    }

    #[test]
    fn test_count_exceeding_buffer_is_rejected() {
        let mut bus = MockCodec::new();
        let words = [0x0010, 0x8001, 0x1111];

        assert_eq!(
            load_patch(&mut bus, &words, 10),
            Err(PatchError::CountExceedsBuffer {
                declared: 10,
                available: 3
            })
        );
        assert!(bus.writes().is_empty());
    }

    #[test]
    fn test_truncated_copy_record_is_rejected_before_writing() {
        let mut bus = MockCodec::new();
        let words = [0x0010, 0x8001, 0x1111, 0x0020, 0x0004, 0x0001, 0x0002];

        let result = load_patch(&mut bus, &words, words.len());
        assert_eq!(result, Err(PatchError::Truncated { offset: 3 }));
        // Only the complete first record was applied
        assert_eq!(bus.writes(), &[(0x10, 0x1111)]);
    }

    #[test]
    fn test_dangling_header_is_truncated() {
        let records: Vec<_> = PatchRecords::new(&[0x0010], 1).unwrap().collect();
        assert_eq!(records, vec![Err(PatchError::Truncated { offset: 0 })]);
    }

    #[test]
    fn test_wide_address_is_rejected() {
        let mut bus = MockCodec::new();
        let words = [0x0120, 0x8001, 0x0001];

        assert_eq!(
            load_patch(&mut bus, &words, words.len()),
            Err(PatchError::InvalidAddress {
                offset: 0,
                address: 0x0120
            })
        );
    }

    #[test]
    fn test_records_iterator_decodes_both_kinds() {
        let words = [0x0006, 0x8003, 0x0000, 0x0006, 0x0002, 0x1234, 0x5678];
        let records: Vec<_> = PatchRecords::new(&words, words.len())
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(
            records,
            vec![
                PatchRecord::Run {
                    address: 6,
                    count: 3,
                    value: 0
                },
                PatchRecord::Copy {
                    address: 6,
                    values: &[0x1234, 0x5678]
                },
            ]
        );
    }

    #[test]
    fn test_empty_patch_is_noop() {
        let mut bus = MockCodec::new();
        let summary = load_patch(&mut bus, &[], 0).unwrap();
        assert_eq!(summary, PatchSummary::default());
        assert!(bus.writes().is_empty());
    }
}
