//! # Chunked Ring Buffer
//!
//! This module provides the flow-control buffer between the network producer
//! and the decoder feed loop. The buffer stores fixed 32-byte chunks in an
//! addressable linear store, normally a 23LC1024 SPI SRAM.
//!
//! ## Memory Layout
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │            LinearStore (capacity × 32 bytes)               │
//! ├───────┬───────┬───────┬───────┬───────┬─────────┬──────────┤
//! │ chunk │ chunk │ chunk │ chunk │ chunk │   ...   │  chunk   │
//! │   0   │   1   │   2   │   3   │   4   │         │  N - 1   │
//! └───────┴───────┴───────┴───────┴───────┴─────────┴──────────┘
//!             ▲                       ▲
//!          read_idx               write_idx = (read_idx + count) % N
//! ```
//!
//! ## Discipline
//!
//! There is no internal locking. One producer calls [`RingBuffer::write`] after
//! checking [`RingBuffer::space_available`], one consumer calls
//! [`RingBuffer::read`] after checking [`RingBuffer::data_available`], and the
//! caller keeps the two from running at the same time. Breaking the
//! precondition is reported as [`BufferError::BufferFull`] or
//! [`BufferError::BufferEmpty`] instead of corrupting the indices.

use crate::{Chunk, CHUNK_SIZE};

/// Chunks held by a full 23LC1024
pub const DEFAULT_CAPACITY: usize = 4096;

/// Total size of the 23LC1024 SPI SRAM in bytes
pub const SRAM_SIZE: usize = 131_072;

/// SRAM read opcode
pub const SRAM_READ: u8 = 0x03;

/// SRAM write opcode
pub const SRAM_WRITE: u8 = 0x02;

/// Errors reported by a backing store
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum StoreError {
    /// Access extends beyond the end of the store
    #[error("address range outside of store")]
    OutOfRange,
    /// The transport to the memory chip failed
    #[error("store transport failed")]
    Transport,
}

/// Errors specific to ring buffer operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BufferError {
    /// Write attempted while every chunk slot is occupied
    #[error("ring buffer is full")]
    BufferFull,
    /// Read attempted while no chunk is stored
    #[error("ring buffer is empty")]
    BufferEmpty,
    /// The store cannot hold the requested number of chunks
    #[error("store holds {available} bytes, {required} required")]
    StoreTooSmall {
        /// Bytes needed for the configured capacity
        required: usize,
        /// Bytes the store actually provides
        available: usize,
    },
    /// The backing store rejected the access
    #[error("backing store error: {0}")]
    Store(#[from] StoreError),
}

/// Byte-addressable memory backing the ring buffer
pub trait LinearStore {
    /// Size of the store in bytes
    fn capacity(&self) -> usize;

    /// Fill `buf` from `address` onwards
    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), StoreError>;

    /// Store `data` from `address` onwards
    fn write(&mut self, address: u32, data: &[u8]) -> Result<(), StoreError>;
}

/// One chip-select framed SPI exchange with a memory chip
pub trait SpiTransport {
    /// Select, clock out `header` then `data`, deselect
    fn write_frame(&mut self, header: &[u8], data: &[u8]) -> Result<(), StoreError>;

    /// Select, clock out `header`, clock `data.len()` bytes in, deselect
    fn read_frame(&mut self, header: &[u8], data: &mut [u8]) -> Result<(), StoreError>;
}

/// 23LC1024-style SPI SRAM: opcode, 24-bit address, payload
pub struct SpiRam<T> {
    transport: T,
}

impl<T: SpiTransport> SpiRam<T> {
    /// Wrap a transport wired to the SRAM chip select
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    /// Give the transport back
    pub fn into_inner(self) -> T {
        self.transport
    }

    /// Borrow the transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Mutably borrow the transport
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    fn header(opcode: u8, address: u32) -> [u8; 4] {
        let [_, a2, a1, a0] = address.to_be_bytes();
        [opcode, a2, a1, a0]
    }

    fn check_range(address: u32, len: usize) -> Result<(), StoreError> {
        let end = address as usize + len;
        if end > SRAM_SIZE {
            return Err(StoreError::OutOfRange);
        }
        Ok(())
    }
}

impl<T: SpiTransport> LinearStore for SpiRam<T> {
    fn capacity(&self) -> usize {
        SRAM_SIZE
    }

    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), StoreError> {
        Self::check_range(address, buf.len())?;
        self.transport
            .read_frame(&Self::header(SRAM_READ, address), buf)
    }

    fn write(&mut self, address: u32, data: &[u8]) -> Result<(), StoreError> {
        Self::check_range(address, data.len())?;
        self.transport
            .write_frame(&Self::header(SRAM_WRITE, address), data)
    }
}

/// Store kept in internal RAM, for boards without external SRAM
pub struct MemoryStore<const BYTES: usize> {
    data: [u8; BYTES],
}

impl<const BYTES: usize> MemoryStore<BYTES> {
    /// Create a zero-initialized store
    pub const fn new() -> Self {
        Self { data: [0u8; BYTES] }
    }

    fn range(address: u32, len: usize) -> Result<core::ops::Range<usize>, StoreError> {
        let start = address as usize;
        let end = start.checked_add(len).ok_or(StoreError::OutOfRange)?;
        if end > BYTES {
            return Err(StoreError::OutOfRange);
        }
        Ok(start..end)
    }
}

impl<const BYTES: usize> Default for MemoryStore<BYTES> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const BYTES: usize> LinearStore for MemoryStore<BYTES> {
    fn capacity(&self) -> usize {
        BYTES
    }

    fn read(&mut self, address: u32, buf: &mut [u8]) -> Result<(), StoreError> {
        let range = Self::range(address, buf.len())?;
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write(&mut self, address: u32, data: &[u8]) -> Result<(), StoreError> {
        let range = Self::range(address, data.len())?;
        self.data[range].copy_from_slice(data);
        Ok(())
    }
}

/// Fixed-capacity FIFO of 32-byte chunks over a [`LinearStore`]
///
/// # Example
///
/// ```rust
/// use vs1053::buffer::{MemoryStore, RingBuffer};
///
/// let mut ring: RingBuffer<MemoryStore<256>, 8> = RingBuffer::new(MemoryStore::new()).unwrap();
///
/// // Producer
/// if ring.space_available() {
///     ring.write(&[0xAA; 32]).unwrap();
/// }
///
/// // Consumer
/// let mut chunk = [0u8; 32];
/// ring.read(&mut chunk).unwrap();
/// assert_eq!(chunk, [0xAA; 32]);
/// ```
pub struct RingBuffer<S, const N: usize = DEFAULT_CAPACITY> {
    store: S,
    /// Chunk slot the consumer reads next
    read_idx: usize,
    /// Chunk slot the producer writes next
    write_idx: usize,
    /// Chunks currently stored
    count: usize,
}

impl<S: LinearStore, const N: usize> RingBuffer<S, N> {
    /// Take ownership of `store` and start empty
    ///
    /// Fails if the store cannot hold `N` chunks.
    pub fn new(store: S) -> Result<Self, BufferError> {
        let required = N * CHUNK_SIZE;
        let available = store.capacity();
        if available < required {
            return Err(BufferError::StoreTooSmall {
                required,
                available,
            });
        }

        let mut ring = Self {
            store,
            read_idx: 0,
            write_idx: 0,
            count: 0,
        };
        ring.reset();
        Ok(ring)
    }

    /// Capacity in chunks
    #[inline]
    pub const fn capacity(&self) -> usize {
        N
    }

    /// True while at least one chunk slot is free
    #[inline]
    pub fn space_available(&self) -> bool {
        self.count < N
    }

    /// Number of chunks waiting to be read
    #[inline]
    pub fn data_available(&self) -> usize {
        self.count
    }

    /// Number of free chunk slots
    #[inline]
    pub fn free_space(&self) -> usize {
        N - self.count
    }

    /// Drop all buffered chunks
    pub fn reset(&mut self) {
        self.read_idx = 0;
        self.write_idx = 0;
        self.count = 0;
    }

    /// Append one chunk
    pub fn write(&mut self, chunk: &Chunk) -> Result<(), BufferError> {
        if !self.space_available() {
            return Err(BufferError::BufferFull);
        }

        self.store.write(Self::address(self.write_idx), chunk)?;
        self.write_idx = (self.write_idx + 1) % N;
        self.count += 1;
        Ok(())
    }

    /// Remove the oldest chunk into `out`
    pub fn read(&mut self, out: &mut Chunk) -> Result<(), BufferError> {
        if self.count == 0 {
            return Err(BufferError::BufferEmpty);
        }

        self.store.read(Self::address(self.read_idx), out)?;
        self.read_idx = (self.read_idx + 1) % N;
        self.count -= 1;
        Ok(())
    }

    /// Copy the oldest chunk into `out` without removing it
    pub fn peek(&mut self, out: &mut Chunk) -> Result<(), BufferError> {
        if self.count == 0 {
            return Err(BufferError::BufferEmpty);
        }
        self.store.read(Self::address(self.read_idx), out)?;
        Ok(())
    }

    /// Drop the oldest chunk, typically after a successful [`RingBuffer::peek`]
    pub fn consume(&mut self) -> Result<(), BufferError> {
        if self.count == 0 {
            return Err(BufferError::BufferEmpty);
        }
        self.read_idx = (self.read_idx + 1) % N;
        self.count -= 1;
        Ok(())
    }

    /// Borrow the backing store
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Mutably borrow the backing store
    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    #[inline]
    fn address(index: usize) -> u32 {
        (index * CHUNK_SIZE) as u32
    }
}
