//! # Simulated Hardware
//!
//! Host-side stand-ins for the VS1053 and the external SPI SRAM, used by the
//! unit tests and available to downstream crates through the `mock` feature.
//!
//! [`MockCodec`] decodes SCI frames into a register file with WRAM
//! auto-increment, records SDI bytes, models DREQ and the CANCEL handshake,
//! and can inject read faults. [`MockSram`] speaks the 23LC1024 framing.

extern crate std;

use std::collections::BTreeMap;
use std::vec::Vec;

use crate::buffer::{SpiTransport, StoreError, SRAM_READ, SRAM_SIZE, SRAM_WRITE};
use crate::bus::{BusError, HardwareBus, TransactionMode, WaitPolicy};
use crate::registers::{
    MODE_CANCEL, MODE_RESET, SCI_MODE, SCI_READ, SCI_STATUS, SCI_WRAM, SCI_WRAMADDR, SCI_WRITE,
};
use crate::CHUNK_SIZE;

/// Bus-level events recorded by [`MockCodec`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusEvent {
    /// A transaction was opened
    Open(TransactionMode),
    /// The open transaction was closed
    End,
    /// Reset line combination changed
    Reset(bool),
    /// SPI clock changed
    Clock(u32),
    /// DREQ pull-up enabled
    Pullup,
}

/// Corrupts reads of one register once the stored value reaches a threshold
#[derive(Debug, Clone, Copy)]
struct ReadFault {
    register: u8,
    from_value: u16,
    xor: u16,
}

/// Simulated VS1053 behind a [`HardwareBus`]
#[derive(Debug)]
pub struct MockCodec {
    registers: [u16; 256],
    wram: BTreeMap<u16, u16>,
    ready: bool,
    low_polls: u32,
    pullup: bool,
    policy: WaitPolicy,
    mode: Option<TransactionMode>,
    sci_index: usize,
    sci_opcode: u8,
    sci_address: u8,
    sci_word: u16,
    writes: Vec<(u8, u16)>,
    reads: Vec<u8>,
    sdi: Vec<u8>,
    events: Vec<BusEvent>,
    yields: u32,
    delay_ms: u64,
    clock_hz: u32,
    cancel_clears_after: Option<usize>,
    cancel_countdown: Option<usize>,
    read_fault: Option<ReadFault>,
    fail_transfers: bool,
    gate_bytes: usize,
    max_gate_bytes: usize,
}

impl MockCodec {
    /// A connected, always-ready codec that echoes register writes
    pub fn new() -> Self {
        let mut registers = [0u16; 256];
        // SS_VER = 4 in bits 7:4, the VS1053 signature
        registers[SCI_STATUS as usize] = 0x0040;
        Self {
            registers,
            wram: BTreeMap::new(),
            ready: true,
            low_polls: 0,
            pullup: false,
            policy: WaitPolicy::Forever,
            mode: None,
            sci_index: 0,
            sci_opcode: 0,
            sci_address: 0,
            sci_word: 0,
            writes: Vec::new(),
            reads: Vec::new(),
            sdi: Vec::new(),
            events: Vec::new(),
            yields: 0,
            delay_ms: 0,
            clock_hz: 0,
            cancel_clears_after: Some(64),
            cancel_countdown: None,
            read_fault: None,
            fail_transfers: false,
            gate_bytes: 0,
            max_gate_bytes: 0,
        }
    }

    /// Report `policy` from [`HardwareBus::wait_policy`]
    pub fn with_wait_policy(mut self, policy: WaitPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Clear CANCEL after this many SDI bytes, or never with `None`
    pub fn with_cancel_after(mut self, bytes: Option<usize>) -> Self {
        self.cancel_clears_after = bytes;
        self
    }

    /// XOR reads of `register` with `xor` whenever its stored value is at
    /// least `from_value`
    pub fn with_read_fault(mut self, register: u8, from_value: u16, xor: u16) -> Self {
        self.read_fault = Some(ReadFault {
            register,
            from_value,
            xor,
        });
        self
    }

    /// Make every byte transfer fail with [`BusError::Transfer`]
    pub fn fail_transfers(&mut self, fail: bool) {
        self.fail_transfers = fail;
    }

    /// Drive DREQ
    pub fn set_ready(&mut self, ready: bool) {
        self.ready = ready;
    }

    /// Report DREQ low for the next `polls` samples
    pub fn hold_ready_low_for(&mut self, polls: u32) {
        self.low_polls = polls;
    }

    /// Overwrite a register without recording a write
    pub fn set_register(&mut self, address: u8, value: u16) {
        self.registers[address as usize] = value;
    }

    /// Current register contents
    pub fn register(&self, address: u8) -> u16 {
        self.registers[address as usize]
    }

    /// Preload one WRAM cell
    pub fn set_wram(&mut self, address: u16, value: u16) {
        self.wram.insert(address, value);
    }

    /// Current WRAM cell contents
    pub fn wram(&self, address: u16) -> u16 {
        self.wram.get(&address).copied().unwrap_or(0)
    }

    /// Every SCI write in order, as `(register, value)`
    pub fn writes(&self) -> &[(u8, u16)] {
        &self.writes
    }

    /// SCI writes to one register, in order
    pub fn writes_to(&self, address: u8) -> Vec<u16> {
        self.writes
            .iter()
            .filter(|(reg, _)| *reg == address)
            .map(|(_, value)| *value)
            .collect()
    }

    /// Registers read over SCI, in order
    pub fn reads(&self) -> &[u8] {
        &self.reads
    }

    /// Every byte received over SDI
    pub fn sdi(&self) -> &[u8] {
        &self.sdi
    }

    /// Bus events in order
    pub fn events(&self) -> &[BusEvent] {
        &self.events
    }

    /// Number of cooperative yields performed while waiting
    pub fn yields(&self) -> u32 {
        self.yields
    }

    /// Total simulated delay
    pub fn total_delay_ms(&self) -> u64 {
        self.delay_ms
    }

    /// Last SPI clock set
    pub fn clock_hz(&self) -> u32 {
        self.clock_hz
    }

    /// Whether a select line is currently asserted
    pub fn in_transaction(&self) -> bool {
        self.mode.is_some()
    }

    /// Largest run of SDI bytes sent without a DREQ check in between
    pub fn max_gate_bytes(&self) -> usize {
        self.max_gate_bytes
    }

    /// Forget recorded traffic, keeping register state
    pub fn clear_log(&mut self) {
        self.writes.clear();
        self.reads.clear();
        self.sdi.clear();
        self.events.clear();
        self.yields = 0;
        self.delay_ms = 0;
        self.max_gate_bytes = 0;
    }

    fn sci_read_value(&mut self, address: u8) -> u16 {
        self.reads.push(address);
        let stored = if address == SCI_WRAM {
            let cell = self.registers[SCI_WRAMADDR as usize];
            self.registers[SCI_WRAMADDR as usize] = cell.wrapping_add(1);
            self.wram(cell)
        } else {
            self.registers[address as usize]
        };

        match self.read_fault {
            Some(fault) if fault.register == address && stored >= fault.from_value => {
                stored ^ fault.xor
            }
            _ => stored,
        }
    }

    fn sci_write_value(&mut self, address: u8, value: u16) {
        self.writes.push((address, value));
        match address {
            SCI_WRAM => {
                let cell = self.registers[SCI_WRAMADDR as usize];
                self.wram.insert(cell, value);
                self.registers[SCI_WRAMADDR as usize] = cell.wrapping_add(1);
            }
            SCI_MODE => {
                if value & MODE_CANCEL != 0 {
                    self.cancel_countdown = self.cancel_clears_after;
                }
                // Soft reset completes immediately and self-clears
                self.registers[SCI_MODE as usize] = value & !MODE_RESET;
            }
            _ => self.registers[address as usize] = value,
        }
    }

    fn sdi_byte(&mut self, byte: u8) {
        self.sdi.push(byte);
        self.gate_bytes += 1;
        self.max_gate_bytes = self.max_gate_bytes.max(self.gate_bytes);

        if let Some(remaining) = self.cancel_countdown {
            if remaining <= 1 {
                self.cancel_countdown = None;
                self.registers[SCI_MODE as usize] &= !MODE_CANCEL;
            } else {
                self.cancel_countdown = Some(remaining - 1);
            }
        }
    }

    fn sci_byte(&mut self, byte: u8) -> u8 {
        let index = self.sci_index;
        self.sci_index += 1;
        match index {
            0 => {
                self.sci_opcode = byte;
                0xFF
            }
            1 => {
                self.sci_address = byte;
                if self.sci_opcode == SCI_READ {
                    self.sci_word = self.sci_read_value(byte);
                }
                0xFF
            }
            2 if self.sci_opcode == SCI_READ => (self.sci_word >> 8) as u8,
            3 if self.sci_opcode == SCI_READ => self.sci_word as u8,
            2 if self.sci_opcode == SCI_WRITE => {
                self.sci_word = u16::from(byte) << 8;
                0xFF
            }
            3 if self.sci_opcode == SCI_WRITE => {
                let value = self.sci_word | u16::from(byte);
                self.sci_write_value(self.sci_address, value);
                0xFF
            }
            _ => 0xFF,
        }
    }
}

impl Default for MockCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl HardwareBus for MockCodec {
    fn is_ready(&mut self) -> bool {
        let level = if self.low_polls > 0 {
            self.low_polls -= 1;
            false
        } else {
            self.ready
        };
        let level = level || self.pullup;
        if level {
            self.gate_bytes = 0;
        }
        level
    }

    fn yield_now(&mut self) {
        self.yields += 1;
    }

    fn open(&mut self, mode: TransactionMode) {
        assert!(
            self.mode.is_none(),
            "transaction opened while another is active"
        );
        self.mode = Some(mode);
        self.sci_index = 0;
        self.events.push(BusEvent::Open(mode));
    }

    fn end_transaction(&mut self) {
        self.mode = None;
        self.events.push(BusEvent::End);
    }

    fn transfer(&mut self, byte: u8) -> Result<u8, BusError> {
        if self.mode.is_some() && self.fail_transfers {
            return Err(BusError::Transfer);
        }
        match self.mode {
            Some(TransactionMode::Control) => Ok(self.sci_byte(byte)),
            Some(TransactionMode::Data) => {
                self.sdi_byte(byte);
                Ok(0xFF)
            }
            None => panic!("transfer outside of a transaction"),
        }
    }

    fn set_reset(&mut self, asserted: bool) {
        self.events.push(BusEvent::Reset(asserted));
    }

    fn set_clock_hz(&mut self, hz: u32) {
        self.clock_hz = hz;
        self.events.push(BusEvent::Clock(hz));
    }

    fn delay_ms(&mut self, ms: u32) {
        self.delay_ms += u64::from(ms);
    }

    fn enable_ready_pullup(&mut self) {
        self.pullup = true;
        self.events.push(BusEvent::Pullup);
    }

    fn wait_policy(&self) -> WaitPolicy {
        self.policy
    }
}

/// Simulated 23LC1024 SPI SRAM
#[derive(Debug)]
pub struct MockSram {
    memory: Vec<u8>,
    frames: usize,
    fail_next: bool,
}

impl MockSram {
    /// A zero-filled 128 KiB SRAM
    pub fn new() -> Self {
        Self {
            memory: std::vec![0u8; SRAM_SIZE],
            frames: 0,
            fail_next: false,
        }
    }

    /// Fail the next frame with [`StoreError::Transport`]
    pub fn fail_next_frame(&mut self) {
        self.fail_next = true;
    }

    /// Number of chip-select frames seen
    pub fn frames(&self) -> usize {
        self.frames
    }

    /// Raw memory contents
    pub fn memory(&self) -> &[u8] {
        &self.memory
    }

    fn decode(&mut self, header: &[u8], expected: u8) -> Result<usize, StoreError> {
        self.frames += 1;
        if core::mem::take(&mut self.fail_next) {
            return Err(StoreError::Transport);
        }
        match header {
            [opcode, a2, a1, a0] if *opcode == expected => {
                Ok((usize::from(*a2) << 16) | (usize::from(*a1) << 8) | usize::from(*a0))
            }
            _ => Err(StoreError::Transport),
        }
    }
}

impl Default for MockSram {
    fn default() -> Self {
        Self::new()
    }
}

impl SpiTransport for MockSram {
    fn write_frame(&mut self, header: &[u8], data: &[u8]) -> Result<(), StoreError> {
        let address = self.decode(header, SRAM_WRITE)?;
        let end = address + data.len();
        if end > self.memory.len() {
            return Err(StoreError::OutOfRange);
        }
        self.memory[address..end].copy_from_slice(data);
        Ok(())
    }

    fn read_frame(&mut self, header: &[u8], data: &mut [u8]) -> Result<(), StoreError> {
        let address = self.decode(header, SRAM_READ)?;
        let end = address + data.len();
        if end > self.memory.len() {
            return Err(StoreError::OutOfRange);
        }
        data.copy_from_slice(&self.memory[address..end]);
        Ok(())
    }
}

/// Chunk whose every byte is `tag`
pub fn chunk_of(tag: u8) -> [u8; CHUNK_SIZE] {
    [tag; CHUNK_SIZE]
}
