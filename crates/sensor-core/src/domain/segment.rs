//! Fixed-layout memory segments behind sensor buffers.
//!
//! A segment is a block of bytes that other processes can map by name.  It
//! starts with a 64-byte header followed by two value regions, one holding
//! the values the sensor reported and one holding the values readers want
//! written:
//!
//! ```text
//! offset  size  field
//!      0     4  magic "SSB1"           (atomic)
//!      4     4  lock word              (atomic, 0 = free)
//!      8     4  closing flag           (atomic)
//!     12     4  attached readers       (atomic)
//!     16     8  version                (atomic, bumped on every change)
//!     24     2  device type            ┐
//!     26     2  subscription bitmap    │
//!     28     2  delay (ms)             │
//!     30     2  dirty bitmap           │ guarded by the lock word
//!     32     2  read-request bitmap    │
//!     34     1  uid year               │
//!     36     4  values length (V)      │
//!     40     8  uid id                 ┘
//!     64     V  current values         ┐ guarded
//!   64+V     V  desired values         ┘
//! ```
//!
//! All multi-byte fields are little-endian.  Segments created by
//! [`Segment::heap`] have the same layout but live in private memory.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use memmap2::MmapMut;

pub(crate) const MAGIC: u32 = u32::from_le_bytes(*b"SSB1");
pub(crate) const HEADER_LEN: usize = 64;

const MAGIC_AT: usize = 0;
const LOCK_AT: usize = 4;
const CLOSING_AT: usize = 8;
const READERS_AT: usize = 12;
const VERSION_AT: usize = 16;

/// Start of the lock-guarded bytes.
const GUARDED_AT: usize = 24;

pub(crate) const DEVICE_TYPE_AT: usize = 24;
pub(crate) const SUBSCRIPTION_AT: usize = 26;
pub(crate) const DELAY_AT: usize = 28;
pub(crate) const DIRTY_AT: usize = 30;
pub(crate) const READ_REQUESTS_AT: usize = 32;
pub(crate) const YEAR_AT: usize = 34;
pub(crate) const VALUES_LEN_AT: usize = 36;
pub(crate) const UID_ID_AT: usize = 40;

/// Spins before yielding the thread while waiting for the lock word.
const SPINS_BEFORE_YIELD: u32 = 64;

/// Total segment size for a layout whose values take `values_len` bytes.
pub(crate) const fn segment_len(values_len: usize) -> usize {
    HEADER_LEN + 2 * values_len
}

enum Backing {
    Heap(#[allow(dead_code)] Box<[AtomicU64]>),
    Mapped(#[allow(dead_code)] MmapMut),
}

/// One mapped (or private) segment.
pub(crate) struct Segment {
    ptr: NonNull<u8>,
    len: usize,
    _backing: Backing,
}

// SAFETY: every access to the memory behind `ptr` goes through an atomic in
// the header or through a `SegmentGuard`, which holds the lock word.  The
// backing allocation lives as long as the segment.
unsafe impl Send for Segment {}
unsafe impl Sync for Segment {}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("len", &self.len)
            .field("mapped", &matches!(self._backing, Backing::Mapped(_)))
            .finish()
    }
}

impl Segment {
    /// A zeroed segment in private memory.
    pub(crate) fn heap(len: usize) -> Self {
        let words: Box<[AtomicU64]> = (0..len.div_ceil(8)).map(|_| AtomicU64::new(0)).collect();
        // The slice is never empty: `len` includes the header.
        let ptr = NonNull::new(words.as_ptr() as *mut u8).unwrap_or(NonNull::dangling());
        Self {
            ptr,
            len,
            _backing: Backing::Heap(words),
        }
    }

    /// Creates a zeroed segment file at `path`, replacing nothing: the file
    /// must not exist yet.
    pub(crate) fn create(path: &Path, len: usize) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.set_len(len as u64)?;
        // SAFETY: the file was just created by us and sized to `len`; other
        // processes only touch it through the header protocol.
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self::mapped(map))
    }

    /// Maps an existing segment file.
    pub(crate) fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = usize::try_from(file.metadata()?.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "segment too large"))?;
        if len < HEADER_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("segment is {len} bytes, shorter than its header"),
            ));
        }
        // SAFETY: as in `create`; the length was checked against the header.
        let map = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self::mapped(map))
    }

    fn mapped(mut map: MmapMut) -> Self {
        let len = map.len();
        let ptr = NonNull::new(map.as_mut_ptr()).unwrap_or(NonNull::dangling());
        Self {
            ptr,
            len,
            _backing: Backing::Mapped(map),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    fn atomic_u32(&self, offset: usize) -> &AtomicU32 {
        debug_assert!(offset % 4 == 0 && offset + 4 <= HEADER_LEN);
        // SAFETY: the offset is 4-aligned inside the header, the base is at
        // least 8-aligned (page or `AtomicU64` allocation), and the memory is
        // only ever accessed atomically at this offset.
        unsafe { AtomicU32::from_ptr(self.ptr.as_ptr().add(offset).cast()) }
    }

    fn atomic_u64(&self, offset: usize) -> &AtomicU64 {
        debug_assert!(offset % 8 == 0 && offset + 8 <= HEADER_LEN);
        // SAFETY: as in `atomic_u32`, with 8-byte alignment.
        unsafe { AtomicU64::from_ptr(self.ptr.as_ptr().add(offset).cast()) }
    }

    pub(crate) fn magic(&self) -> u32 {
        self.atomic_u32(MAGIC_AT).load(Ordering::Acquire)
    }

    pub(crate) fn set_magic(&self) {
        self.atomic_u32(MAGIC_AT).store(MAGIC, Ordering::Release);
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.atomic_u32(CLOSING_AT).load(Ordering::SeqCst) != 0
    }

    pub(crate) fn mark_closing(&self) {
        self.atomic_u32(CLOSING_AT).store(1, Ordering::SeqCst);
        self.atomic_u64(VERSION_AT).fetch_add(1, Ordering::Release);
    }

    pub(crate) fn readers(&self) -> &AtomicU32 {
        self.atomic_u32(READERS_AT)
    }

    pub(crate) fn version(&self) -> u64 {
        self.atomic_u64(VERSION_AT).load(Ordering::Acquire)
    }

    /// Takes the lock word, spinning and then yielding until it is free.
    ///
    /// A process that dies while holding the lock leaves the segment locked;
    /// the owning session then replaces the segment on its next open.
    pub(crate) fn lock(&self) -> SegmentGuard<'_> {
        let word = self.atomic_u32(LOCK_AT);
        let mut spins = 0u32;
        while word
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spins = spins.saturating_add(1);
            if spins < SPINS_BEFORE_YIELD {
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
        SegmentGuard {
            segment: self,
            changed: false,
        }
    }
}

/// Exclusive access to the guarded bytes of a segment.
pub(crate) struct SegmentGuard<'a> {
    segment: &'a Segment,
    changed: bool,
}

impl SegmentGuard<'_> {
    fn check(&self, offset: usize, len: usize) {
        assert!(
            offset >= GUARDED_AT && offset + len <= self.segment.len,
            "segment access {offset}+{len} outside guarded range of {}-byte segment",
            self.segment.len
        );
    }

    pub(crate) fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        self.check(offset, len);
        // SAFETY: bounds checked above; the lock word keeps every other
        // accessor out of the guarded range while this guard lives.
        unsafe { std::slice::from_raw_parts(self.segment.ptr.as_ptr().add(offset), len) }
    }

    pub(crate) fn bytes_mut(&mut self, offset: usize, len: usize) -> &mut [u8] {
        self.check(offset, len);
        self.changed = true;
        // SAFETY: as in `bytes`; `&mut self` makes this the only live view.
        unsafe { std::slice::from_raw_parts_mut(self.segment.ptr.as_ptr().add(offset), len) }
    }

    pub(crate) fn u16_at(&self, offset: usize) -> u16 {
        let mut raw = [0u8; 2];
        raw.copy_from_slice(self.bytes(offset, 2));
        u16::from_le_bytes(raw)
    }

    pub(crate) fn set_u16(&mut self, offset: usize, value: u16) {
        self.bytes_mut(offset, 2).copy_from_slice(&value.to_le_bytes());
    }

    pub(crate) fn u32_at(&self, offset: usize) -> u32 {
        let mut raw = [0u8; 4];
        raw.copy_from_slice(self.bytes(offset, 4));
        u32::from_le_bytes(raw)
    }

    pub(crate) fn set_u32(&mut self, offset: usize, value: u32) {
        self.bytes_mut(offset, 4).copy_from_slice(&value.to_le_bytes());
    }

    pub(crate) fn u64_at(&self, offset: usize) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.bytes(offset, 8));
        u64::from_le_bytes(raw)
    }

    pub(crate) fn set_u64(&mut self, offset: usize, value: u64) {
        self.bytes_mut(offset, 8).copy_from_slice(&value.to_le_bytes());
    }

    pub(crate) fn u8_at(&self, offset: usize) -> u8 {
        self.bytes(offset, 1)[0]
    }

    pub(crate) fn set_u8(&mut self, offset: usize, value: u8) {
        self.bytes_mut(offset, 1)[0] = value;
    }
}

impl Drop for SegmentGuard<'_> {
    fn drop(&mut self) {
        if self.changed {
            self.segment.atomic_u64(VERSION_AT).fetch_add(1, Ordering::Release);
        }
        self.segment.atomic_u32(LOCK_AT).store(0, Ordering::Release);
    }
}

/// Removes a segment file, treating an already missing file as success.
pub(crate) fn unlink(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
