//! Pooled frame buffers.
//!
//! Every outbound and inbound message lives in a [`FrameBuffer`] rented from a
//! per-transport [`BufferPool`]. The first four bytes are reserved for the
//! length prefix, which is stamped after the payload has been written:
//!
//! ```text
//! +-------------------+--------------------+
//! | prefix (4 bytes)  |   payload          |
//! | i32 big-endian    |   (len bytes)      |
//! +-------------------+--------------------+
//! ^ 0                 ^ start    ^ read    ^ write
//! ```
//!
//! Dropping or disposing a buffer hands its array back to the pool. Disposal
//! is idempotent; a disposed buffer rejects every read and write.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::codec::{Decode, Encode};
use crate::status::{StatusCode, Transport};

/// Size of the length-prefix slot in front of every payload.
pub const PREFIX_LEN: usize = 4;

/// Maximum number of idle arrays kept per pool.
const MAX_POOLED: usize = 64;

/// Arrays that grew beyond this are dropped instead of pooled.
const MAX_RETAINED_CAPACITY: usize = 64 * 1024;

/// Initial capacity of a freshly allocated array.
const INITIAL_CAPACITY: usize = 256;

/// Errors raised by buffer reads and writes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BufferError {
    /// A read would pass the write cursor.
    #[error("read of {wanted} bytes at payload offset {at} exceeds written length {written}")]
    OutOfBounds {
        /// Payload offset of the read cursor.
        at: usize,
        /// Bytes requested.
        wanted: usize,
        /// Payload bytes written so far.
        written: usize,
    },
    /// A write would pass the buffer's capacity.
    #[error("write would grow the frame to {wanted} bytes, capacity is {capacity}")]
    CapacityExceeded {
        /// Total frame size the write needed.
        wanted: usize,
        /// Maximum frame size for this buffer.
        capacity: usize,
    },
    /// The buffer was already returned to its pool.
    #[error("buffer used after it was returned to its pool")]
    Disposed,
    /// A string payload was not valid UTF-8.
    #[error("string payload is not valid UTF-8")]
    InvalidUtf8,
    /// A boolean byte was neither 0 nor 1.
    #[error("invalid boolean byte {0:#04x}")]
    InvalidBool(u8),
    /// A character payload did not hold exactly one scalar value.
    #[error("character payload is not a single UTF-8 scalar")]
    InvalidChar,
    /// A count or nested length was negative.
    #[error("negative length {0}")]
    NegativeLength(i32),
}

/// Point-in-time counters for one [`BufferPool`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers handed out.
    pub rented: u64,
    /// Buffers handed back.
    pub returned: u64,
    /// Arrays allocated because the pool was empty.
    pub allocated: u64,
    /// Arrays currently idle in the pool.
    pub pooled: usize,
}

impl PoolStats {
    /// Buffers rented and not yet returned.
    pub fn outstanding(&self) -> u64 {
        self.rented.saturating_sub(self.returned)
    }
}

/// A pool of byte arrays for one transport.
///
/// Each pool enforces that transport's maximum payload size on every buffer
/// it hands out.
pub struct BufferPool {
    transport: Transport,
    max_payload: usize,
    free: Mutex<Vec<Vec<u8>>>,
    rented: AtomicU64,
    returned: AtomicU64,
    allocated: AtomicU64,
}

impl BufferPool {
    /// Create a pool whose buffers hold at most `max_payload` payload bytes.
    pub fn new(transport: Transport, max_payload: usize) -> Arc<Self> {
        Arc::new(Self {
            transport,
            max_payload,
            free: Mutex::new(Vec::new()),
            rented: AtomicU64::new(0),
            returned: AtomicU64::new(0),
            allocated: AtomicU64::new(0),
        })
    }

    /// The transport this pool serves.
    pub fn transport(&self) -> Transport {
        self.transport
    }

    /// Maximum payload bytes per buffer.
    pub fn max_payload(&self) -> usize {
        self.max_payload
    }

    /// Rent an empty buffer.
    pub fn rent(self: &Arc<Self>) -> FrameBuffer {
        let pooled = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        let mut data = pooled.unwrap_or_else(|| {
            self.allocated.fetch_add(1, Ordering::Relaxed);
            Vec::with_capacity(INITIAL_CAPACITY.min(PREFIX_LEN + self.max_payload))
        });
        data.clear();
        data.resize(PREFIX_LEN, 0);
        self.rented.fetch_add(1, Ordering::Relaxed);

        FrameBuffer {
            data: Some(data),
            pool: Arc::clone(self),
            read: PREFIX_LEN,
            headroom: 0,
        }
    }

    /// Rent a buffer for a control frame. It fits a body of up to a full
    /// payload plus the length prefix a key or nested message carries.
    pub(crate) fn rent_control(self: &Arc<Self>) -> FrameBuffer {
        let mut buffer = self.rent();
        buffer.headroom = PREFIX_LEN;
        buffer
    }

    /// Rent a buffer holding a copy of `payload`, with its length stamped.
    pub fn rent_with(self: &Arc<Self>, payload: &[u8]) -> Result<FrameBuffer, BufferError> {
        let mut buffer = self.rent();
        buffer.write_bytes(payload)?;
        buffer.stamp_length()?;
        Ok(buffer)
    }

    /// Snapshot the pool counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            rented: self.rented.load(Ordering::Relaxed),
            returned: self.returned.load(Ordering::Relaxed),
            allocated: self.allocated.load(Ordering::Relaxed),
            pooled: self.free.lock().unwrap_or_else(PoisonError::into_inner).len(),
        }
    }

    fn give_back(&self, mut data: Vec<u8>) {
        self.returned.fetch_add(1, Ordering::Relaxed);
        if data.capacity() > MAX_RETAINED_CAPACITY {
            return;
        }
        data.clear();
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        if free.len() < MAX_POOLED {
            free.push(data);
        }
    }
}

/// A growable, pooled message buffer with independent read and write cursors.
pub struct FrameBuffer {
    /// `None` once the array went back to the pool.
    data: Option<Vec<u8>>,
    pool: Arc<BufferPool>,
    read: usize,
    /// Bytes allowed past the pool's maximum payload.
    headroom: usize,
}

impl FrameBuffer {
    /// Transport this buffer was rented for.
    pub fn transport(&self) -> Transport {
        self.pool.transport
    }

    /// Maximum frame size in bytes, prefix included.
    pub fn capacity(&self) -> usize {
        PREFIX_LEN + self.pool.max_payload + self.headroom
    }

    /// Payload bytes written so far.
    pub fn len(&self) -> usize {
        self.data
            .as_ref()
            .map_or(0, |data| data.len() - PREFIX_LEN)
    }

    /// Whether no payload has been written.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Payload bytes between the read and write cursors.
    pub fn remaining(&self) -> usize {
        self.data
            .as_ref()
            .map_or(0, |data| data.len().saturating_sub(self.read))
    }

    /// Read cursor as a payload offset.
    pub fn position(&self) -> usize {
        self.read - PREFIX_LEN
    }

    /// Whether the buffer was already returned to its pool.
    pub fn is_disposed(&self) -> bool {
        self.data.is_none()
    }

    /// Append the big-endian encoding of `value`.
    ///
    /// A failed write leaves the buffer unchanged.
    pub fn write<T: Encode + ?Sized>(&mut self, value: &T) -> Result<(), BufferError> {
        let mark = self.data()?.len();
        let result = value.encode(self);
        if result.is_err()
            && let Some(data) = self.data.as_mut()
        {
            data.truncate(mark);
        }
        result
    }

    /// Append raw bytes.
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), BufferError> {
        let capacity = self.capacity();
        let data = self.data_mut()?;
        let wanted = data.len() + bytes.len();
        if wanted > capacity {
            return Err(BufferError::CapacityExceeded { wanted, capacity });
        }
        data.extend_from_slice(bytes);
        Ok(())
    }

    /// Decode a value and advance the read cursor.
    ///
    /// A failed read leaves the cursor where it was.
    pub fn read<T: Decode>(&mut self) -> Result<T, BufferError> {
        let mark = self.read;
        let result = T::decode(self);
        if result.is_err() {
            self.read = mark;
        }
        result
    }

    /// Decode a value without advancing the read cursor.
    pub fn peek<T: Decode>(&mut self) -> Result<T, BufferError> {
        let mark = self.read;
        let result = T::decode(self);
        self.read = mark;
        result
    }

    /// Take `len` raw bytes at the read cursor.
    pub fn read_bytes(&mut self, len: usize) -> Result<&[u8], BufferError> {
        let at = self.read;
        let data = self.data.as_ref().ok_or(BufferError::Disposed)?;
        let end = at
            .checked_add(len)
            .filter(|end| *end <= data.len())
            .ok_or(BufferError::OutOfBounds {
                at: at - PREFIX_LEN,
                wanted: len,
                written: data.len() - PREFIX_LEN,
            })?;
        self.read = end;
        Ok(&data[at..end])
    }

    /// Take exactly `N` raw bytes at the read cursor.
    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], BufferError> {
        let bytes = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    /// Write the payload length into the reserved prefix slot.
    ///
    /// The payload size is only known once writing is done, so the prefix is
    /// applied after the fact. Returns the stamped length.
    pub fn stamp_length(&mut self) -> Result<i32, BufferError> {
        let len = self.len();
        let prefix = i32::try_from(len).map_err(|_| BufferError::CapacityExceeded {
            wanted: len,
            capacity: i32::MAX as usize,
        })?;
        self.data_mut()?[..PREFIX_LEN].copy_from_slice(&prefix.to_be_bytes());
        Ok(prefix)
    }

    /// Write a status code into the prefix slot.
    pub(crate) fn stamp_status(&mut self, code: StatusCode) -> Result<(), BufferError> {
        self.data_mut()?[..PREFIX_LEN].copy_from_slice(&code.prefix().to_be_bytes());
        Ok(())
    }

    /// The value currently in the prefix slot.
    pub fn prefix(&self) -> Result<i32, BufferError> {
        let data = self.data()?;
        let mut raw = [0u8; PREFIX_LEN];
        raw.copy_from_slice(&data[..PREFIX_LEN]);
        Ok(i32::from_be_bytes(raw))
    }

    /// Payload bytes, without the prefix.
    pub fn payload(&self) -> Result<&[u8], BufferError> {
        Ok(&self.data()?[PREFIX_LEN..])
    }

    /// The complete frame as it goes on the wire.
    pub fn wire(&self) -> Result<&[u8], BufferError> {
        Ok(self.data()?.as_slice())
    }

    /// Move the read cursor back to the start of the payload.
    pub fn rewind(&mut self) {
        self.read = PREFIX_LEN;
    }

    /// Drop all payload bytes and reset both cursors.
    pub fn clear(&mut self) {
        if let Some(data) = self.data.as_mut() {
            data.clear();
            data.resize(PREFIX_LEN, 0);
        }
        self.read = PREFIX_LEN;
    }

    /// Append `inner`'s payload as a nested length-prefixed frame.
    pub fn write_framed(&mut self, inner: &FrameBuffer) -> Result<(), BufferError> {
        let payload = inner.payload()?;
        let len = i32::try_from(payload.len()).map_err(|_| BufferError::CapacityExceeded {
            wanted: payload.len(),
            capacity: i32::MAX as usize,
        })?;
        let capacity = self.capacity();
        let wanted = self.data()?.len() + PREFIX_LEN + payload.len();
        if wanted > capacity {
            return Err(BufferError::CapacityExceeded { wanted, capacity });
        }
        self.write(&len)?;
        self.write_bytes(payload)
    }

    /// Read a nested length-prefixed frame into its own buffer.
    pub fn read_framed(&mut self) -> Result<FrameBuffer, BufferError> {
        let mark = self.read;
        let result = self.read_framed_at_cursor();
        if result.is_err() {
            self.read = mark;
        }
        result
    }

    fn read_framed_at_cursor(&mut self) -> Result<FrameBuffer, BufferError> {
        let len: i32 = self.read()?;
        let len = usize::try_from(len).map_err(|_| BufferError::NegativeLength(len))?;
        let pool = Arc::clone(&self.pool);
        let bytes = self.read_bytes(len)?;
        pool.rent_with(bytes)
    }

    /// Replace the payload with `len` zeroed bytes and return them for filling.
    pub(crate) fn fill(&mut self, len: usize) -> Result<&mut [u8], BufferError> {
        self.read = PREFIX_LEN;
        let capacity = self.capacity();
        let wanted = PREFIX_LEN + len;
        if wanted > capacity {
            return Err(BufferError::CapacityExceeded { wanted, capacity });
        }
        let data = self.data_mut()?;
        data.resize(wanted, 0);
        Ok(&mut data[PREFIX_LEN..])
    }

    /// Return the array to its pool. Safe to call more than once.
    pub fn dispose(&mut self) {
        if let Some(data) = self.data.take() {
            self.pool.give_back(data);
        }
        self.read = PREFIX_LEN;
    }

    fn data(&self) -> Result<&Vec<u8>, BufferError> {
        self.data.as_ref().ok_or(BufferError::Disposed)
    }

    fn data_mut(&mut self) -> Result<&mut Vec<u8>, BufferError> {
        self.data.as_mut().ok_or(BufferError::Disposed)
    }
}

impl Drop for FrameBuffer {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("transport", &self.transport())
            .field("len", &self.len())
            .field("position", &self.position())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
