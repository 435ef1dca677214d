//! The shared buffer holding one sensor's live parameter values.
//!
//! A buffer has exactly one writer, the session that owns the sensor, and any
//! number of readers.  Readers in the device service attach through the
//! [`BufferStore`](super::store::BufferStore); readers in other processes map
//! the published segment file with [`BufferReader::attach_segment`].  Readers
//! see the values the sensor last reported and queue writes by setting
//! desired values; the owning session drains those writes with
//! [`SensorBuffer::make_write`] and [`SensorBuffer::make_read`].
//!
//! Values are kept in their little-endian wire encoding, one fixed slot per
//! catalog parameter, so a DEVICE_DATA payload is copied slot by slot.

use std::collections::BTreeMap;
use std::fs;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use super::catalog::{self, DeviceType, ParamType, ParamValue};
use super::segment::{self, Segment, SegmentGuard};
use crate::protocol::messages::{SensorPacket, SensorUid};

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors raised by buffer operations.
#[derive(Debug, Error, PartialEq)]
pub enum BufferError {
    #[error("unknown device type {0:#06x}")]
    UnknownDevice(u16),

    #[error("device {device} has no parameter named {name:?}")]
    UnknownParameter { device: &'static str, name: String },

    #[error("parameter {0} is not writeable")]
    NotWriteable(&'static str),

    #[error("parameter {0} is not readable")]
    NotReadable(&'static str),

    #[error("parameter {param} expects {expected:?}, got {actual:?}")]
    TypeMismatch {
        param: &'static str,
        expected: ParamType,
        actual: ParamType,
    },

    #[error("device data is {actual} bytes, the active subscription needs {expected}")]
    LengthMismatch { expected: usize, actual: usize },

    #[error("buffer {0} is being released by its owner")]
    Closing(String),

    #[error("sensor segment {path}: {reason}")]
    Segment { path: String, reason: String },
}

impl BufferError {
    fn segment(path: &Path, reason: impl ToString) -> Self {
        BufferError::Segment {
            path: path.display().to_string(),
            reason: reason.to_string(),
        }
    }
}

// ── Status snapshot ───────────────────────────────────────────────────────────

/// Serializable snapshot of a buffer, published in status broadcasts.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BufferStatus {
    pub device: &'static str,
    pub uid: SensorUid,
    pub subscription: Vec<&'static str>,
    pub delay: u16,
    pub values: BTreeMap<&'static str, ParamValue>,
}

// ── Buffer ────────────────────────────────────────────────────────────────────

/// Byte offset of each parameter slot inside a value region, and the
/// region's total length.
fn slot_layout(device: &DeviceType) -> (Vec<usize>, usize) {
    let mut offsets = Vec::with_capacity(device.params.len());
    let mut len = 0;
    for spec in device.params {
        offsets.push(len);
        len += spec.ty.size();
    }
    (offsets, len)
}

/// One sensor's parameter values.
#[derive(Debug)]
pub struct SensorBuffer {
    key: String,
    device: &'static DeviceType,
    offsets: Vec<usize>,
    values_len: usize,
    segment: Segment,
    path: Option<PathBuf>,
}

impl SensorBuffer {
    /// A buffer in private memory, visible only inside this process.
    pub fn new(device: &'static DeviceType, uid: SensorUid) -> Self {
        let (offsets, values_len) = slot_layout(device);
        let buffer = Self {
            key: uid.buffer_key(),
            device,
            offsets,
            values_len,
            segment: Segment::heap(segment::segment_len(values_len)),
            path: None,
        };
        buffer.initialise(uid);
        buffer
    }

    /// Publishes a fresh buffer as the segment file `dir/<key>`.
    ///
    /// The segment is fully initialised under a temporary name and then
    /// renamed into place, so a reader never maps a half-written header.  An
    /// older segment under the same key is replaced; processes that still map
    /// it keep the old copy.
    pub fn create(device: &'static DeviceType, uid: SensorUid, dir: &Path) -> Result<Self, BufferError> {
        let key = uid.buffer_key();
        let path = dir.join(&key);
        let staging = dir.join(format!(".{key}.{}", std::process::id()));
        segment::unlink(&staging).map_err(|e| BufferError::segment(&staging, e))?;

        let (offsets, values_len) = slot_layout(device);
        let segment = Segment::create(&staging, segment::segment_len(values_len))
            .map_err(|e| BufferError::segment(&staging, e))?;
        let buffer = Self {
            key,
            device,
            offsets,
            values_len,
            segment,
            path: Some(path.clone()),
        };
        buffer.initialise(uid);
        if let Err(e) = fs::rename(&staging, &path) {
            let _ = segment::unlink(&staging);
            return Err(BufferError::segment(&path, e));
        }
        Ok(buffer)
    }

    /// Maps a segment another process published.
    pub fn open_segment(path: &Path) -> Result<Self, BufferError> {
        let segment = Segment::open(path).map_err(|e| BufferError::segment(path, e))?;
        if segment.magic() != segment::MAGIC {
            return Err(BufferError::segment(path, "not a sensor buffer segment"));
        }
        let (uid, values_len) = {
            let guard = segment.lock();
            let uid = SensorUid {
                device_type: guard.u16_at(segment::DEVICE_TYPE_AT),
                year: guard.u8_at(segment::YEAR_AT),
                id: guard.u64_at(segment::UID_ID_AT),
            };
            (uid, guard.u32_at(segment::VALUES_LEN_AT) as usize)
        };
        let device = catalog::lookup(uid.device_type).ok_or(BufferError::UnknownDevice(uid.device_type))?;
        let (offsets, expected) = slot_layout(device);
        if values_len != expected || segment.len() < segment::segment_len(expected) {
            return Err(BufferError::segment(
                path,
                format!(
                    "{} layout needs {expected} value bytes, segment declares {values_len}",
                    device.name
                ),
            ));
        }
        Ok(Self {
            key: uid.buffer_key(),
            device,
            offsets,
            values_len,
            segment,
            path: Some(path.to_path_buf()),
        })
    }

    fn initialise(&self, uid: SensorUid) {
        {
            let mut guard = self.segment.lock();
            guard.set_u16(segment::DEVICE_TYPE_AT, uid.device_type);
            guard.set_u8(segment::YEAR_AT, uid.year);
            guard.set_u64(segment::UID_ID_AT, uid.id);
            guard.set_u32(segment::VALUES_LEN_AT, self.values_len as u32);
        }
        self.segment.set_magic();
    }

    fn lock(&self) -> SegmentGuard<'_> {
        self.segment.lock()
    }

    fn current_at(&self, index: usize) -> usize {
        segment::HEADER_LEN + self.offsets[index]
    }

    fn desired_at(&self, index: usize) -> usize {
        segment::HEADER_LEN + self.values_len + self.offsets[index]
    }

    fn decode_slot(&self, guard: &SegmentGuard<'_>, offset: usize, index: usize) -> ParamValue {
        let ty = self.device.params[index].ty;
        ty.decode(guard.bytes(offset, ty.size()))
            .unwrap_or_else(|| ty.default_value())
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn device(&self) -> &'static DeviceType {
        self.device
    }

    /// The segment file backing this buffer, if it is published.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn uid(&self) -> SensorUid {
        let guard = self.lock();
        SensorUid {
            device_type: guard.u16_at(segment::DEVICE_TYPE_AT),
            year: guard.u8_at(segment::YEAR_AT),
            id: guard.u64_at(segment::UID_ID_AT),
        }
    }

    pub fn subscription(&self) -> u16 {
        self.lock().u16_at(segment::SUBSCRIPTION_AT)
    }

    pub fn delay(&self) -> u16 {
        self.lock().u16_at(segment::DELAY_AT)
    }

    /// Counter bumped on every change to the buffer.
    pub fn version(&self) -> u64 {
        self.segment.version()
    }

    /// Records a subscription response from the sensor and returns the
    /// bitmap actually applied.
    ///
    /// Bits past the device layout are dropped with a warning.
    pub fn update_subscription(&self, params: u16, delay: u16, uid: SensorUid) -> u16 {
        let applied = params & self.device.all_params();
        if applied != params {
            warn!(
                device = self.device.name,
                requested = params,
                applied,
                "subscription selects parameters the device does not have; ignoring them"
            );
        }
        let mut guard = self.lock();
        guard.set_u16(segment::SUBSCRIPTION_AT, applied);
        guard.set_u16(segment::DELAY_AT, delay);
        guard.set_u16(segment::DEVICE_TYPE_AT, uid.device_type);
        guard.set_u8(segment::YEAR_AT, uid.year);
        guard.set_u64(segment::UID_ID_AT, uid.id);
        applied
    }

    /// Number of bytes a DEVICE_DATA payload must carry under the active subscription.
    pub fn subscribed_size(&self) -> usize {
        self.device.packed_size(self.subscription())
    }

    /// Splits a DEVICE_DATA payload into the subscribed parameter slots.
    ///
    /// The payload is laid out against the buffer's active subscription, not
    /// the bitmap in the packet header.  Either every subscribed slot is
    /// updated or, on a length mismatch, none is.
    pub fn apply_device_data(&self, data: &[u8]) -> Result<(), BufferError> {
        let mut guard = self.lock();
        let subscription = guard.u16_at(segment::SUBSCRIPTION_AT);
        let expected = self.device.packed_size(subscription);
        if data.len() != expected {
            return Err(BufferError::LengthMismatch {
                expected,
                actual: data.len(),
            });
        }

        let mut offset = 0;
        for (index, spec) in self.device.params_in(subscription) {
            let size = spec.ty.size();
            guard
                .bytes_mut(self.current_at(index), size)
                .copy_from_slice(&data[offset..offset + size]);
            offset += size;
        }
        Ok(())
    }

    fn spec_index(&self, name: &str) -> Result<usize, BufferError> {
        self.device
            .param_index(name)
            .ok_or_else(|| BufferError::UnknownParameter {
                device: self.device.name,
                name: name.to_string(),
            })
    }

    fn encode_checked(&self, index: usize, value: &ParamValue) -> Result<Vec<u8>, BufferError> {
        let spec = &self.device.params[index];
        if value.param_type() != spec.ty {
            return Err(BufferError::TypeMismatch {
                param: spec.name,
                expected: spec.ty,
                actual: value.param_type(),
            });
        }
        let mut encoded = Vec::with_capacity(spec.ty.size());
        value.encode_into(&mut encoded);
        Ok(encoded)
    }

    /// Overwrites the reported value of a parameter.
    pub fn set_current(&self, name: &str, value: ParamValue) -> Result<(), BufferError> {
        let index = self.spec_index(name)?;
        let encoded = self.encode_checked(index, &value)?;
        self.lock()
            .bytes_mut(self.current_at(index), encoded.len())
            .copy_from_slice(&encoded);
        Ok(())
    }

    /// The value the sensor last reported for `name`.
    pub fn current(&self, name: &str) -> Result<ParamValue, BufferError> {
        let index = self.spec_index(name)?;
        let guard = self.lock();
        Ok(self.decode_slot(&guard, self.current_at(index), index))
    }

    /// Queues a write of `value` to a writeable parameter.
    pub fn set_desired(&self, name: &str, value: ParamValue) -> Result<(), BufferError> {
        let index = self.spec_index(name)?;
        let spec = &self.device.params[index];
        if !spec.writeable {
            return Err(BufferError::NotWriteable(spec.name));
        }
        let encoded = self.encode_checked(index, &value)?;
        let mut guard = self.lock();
        guard
            .bytes_mut(self.desired_at(index), encoded.len())
            .copy_from_slice(&encoded);
        let dirty = guard.u16_at(segment::DIRTY_AT) | (1 << index);
        guard.set_u16(segment::DIRTY_AT, dirty);
        Ok(())
    }

    /// Asks for a one-off read of a readable parameter.
    pub fn request_read(&self, name: &str) -> Result<(), BufferError> {
        let index = self.spec_index(name)?;
        let spec = &self.device.params[index];
        if !spec.readable {
            return Err(BufferError::NotReadable(spec.name));
        }
        let mut guard = self.lock();
        let requests = guard.u16_at(segment::READ_REQUESTS_AT) | (1 << index);
        guard.set_u16(segment::READ_REQUESTS_AT, requests);
        Ok(())
    }

    /// Drains pending writes into a DEVICE_WRITE packet, if any are due.
    pub fn make_write(&self) -> Option<SensorPacket> {
        let mut guard = self.lock();
        let params = guard.u16_at(segment::DIRTY_AT);
        if params == 0 {
            return None;
        }
        let mut data = Vec::with_capacity(self.device.packed_size(params));
        for (index, spec) in self.device.params_in(params) {
            data.extend_from_slice(guard.bytes(self.desired_at(index), spec.ty.size()));
        }
        guard.set_u16(segment::DIRTY_AT, 0);
        Some(SensorPacket::DeviceWrite { params, data })
    }

    /// Drains read requests the subscription does not already cover.
    pub fn make_read(&self) -> Option<SensorPacket> {
        let mut guard = self.lock();
        let requests = guard.u16_at(segment::READ_REQUESTS_AT);
        if requests == 0 {
            return None;
        }
        let params = requests & !guard.u16_at(segment::SUBSCRIPTION_AT);
        guard.set_u16(segment::READ_REQUESTS_AT, 0);
        (params != 0).then_some(SensorPacket::DeviceRead { params })
    }

    /// Restores every value to its default and drops pending writes and reads.
    pub fn reset(&self) {
        let mut guard = self.lock();
        guard
            .bytes_mut(segment::HEADER_LEN, 2 * self.values_len)
            .fill(0);
        guard.set_u16(segment::DIRTY_AT, 0);
        guard.set_u16(segment::READ_REQUESTS_AT, 0);
    }

    pub fn status(&self) -> BufferStatus {
        let guard = self.lock();
        let subscription = guard.u16_at(segment::SUBSCRIPTION_AT);
        BufferStatus {
            device: self.device.name,
            uid: SensorUid {
                device_type: guard.u16_at(segment::DEVICE_TYPE_AT),
                year: guard.u8_at(segment::YEAR_AT),
                id: guard.u64_at(segment::UID_ID_AT),
            },
            subscription: self.device.params_in(subscription).map(|(_, p)| p.name).collect(),
            delay: guard.u16_at(segment::DELAY_AT),
            values: self
                .device
                .params
                .iter()
                .enumerate()
                .map(|(index, p)| (p.name, self.decode_slot(&guard, self.current_at(index), index)))
                .collect(),
        }
    }

    pub fn mark_closing(&self) {
        self.segment.mark_closing();
    }

    /// True once the owning session has started releasing the buffer, or
    /// another session has taken it over.
    pub fn is_closing(&self) -> bool {
        self.segment.is_closing()
    }

    /// Readers currently attached, in this process or any other.
    pub fn reader_count(&self) -> usize {
        self.segment.readers().load(Ordering::SeqCst) as usize
    }
}

// ── Reader guard ──────────────────────────────────────────────────────────────

/// A reader's handle on a buffer.  Dropping it detaches the reader.
#[derive(Debug)]
pub struct BufferReader {
    buffer: Arc<SensorBuffer>,
}

impl BufferReader {
    pub(crate) fn new(buffer: Arc<SensorBuffer>) -> Self {
        buffer.segment.readers().fetch_add(1, Ordering::SeqCst);
        Self { buffer }
    }

    /// Attaches to the segment file a device service published at `path`.
    pub fn attach_segment(path: &Path) -> Result<Self, BufferError> {
        let buffer = SensorBuffer::open_segment(path)?;
        if buffer.is_closing() {
            return Err(BufferError::Closing(buffer.key));
        }
        Ok(Self::new(Arc::new(buffer)))
    }
}

impl Deref for BufferReader {
    type Target = SensorBuffer;

    fn deref(&self) -> &SensorBuffer {
        &self.buffer
    }
}

impl Drop for BufferReader {
    fn drop(&mut self) {
        self.buffer.segment.readers().fetch_sub(1, Ordering::SeqCst);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::catalog::{EXAMPLE_DEVICE, LINE_FOLLOWER, POLAR_BEAR};
    use uuid::Uuid;

    fn uid(device_type: u16) -> SensorUid {
        SensorUid {
            device_type,
            year: 0x14,
            id: 42,
        }
    }

    fn line_follower() -> SensorBuffer {
        SensorBuffer::new(&LINE_FOLLOWER, uid(LINE_FOLLOWER.id))
    }

    fn f32_bytes(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("sensor_buffer_{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_new_buffer_has_defaults_and_no_subscription() {
        let buffer = line_follower();
        assert_eq!(buffer.subscription(), 0);
        assert_eq!(buffer.current("left"), Ok(ParamValue::F32(0.0)));
        assert_eq!(buffer.key(), uid(LINE_FOLLOWER.id).buffer_key());
        assert_eq!(buffer.uid(), uid(LINE_FOLLOWER.id));
        assert!(buffer.path().is_none());
    }

    #[test]
    fn test_apply_device_data_updates_only_subscribed_fields() {
        // Arrange: subscribe to left and right
        let buffer = line_follower();
        buffer.update_subscription(0b101, 40, uid(2));

        // Act
        buffer.apply_device_data(&f32_bytes(&[0.25, 0.75])).unwrap();

        // Assert
        assert_eq!(buffer.current("left"), Ok(ParamValue::F32(0.25)));
        assert_eq!(buffer.current("center"), Ok(ParamValue::F32(0.0)));
        assert_eq!(buffer.current("right"), Ok(ParamValue::F32(0.75)));
    }

    #[test]
    fn test_apply_device_data_rejects_wrong_length_without_partial_update() {
        // Arrange
        let buffer = line_follower();
        buffer.update_subscription(0b111, 40, uid(2));

        // Act: two floats where three are subscribed
        let result = buffer.apply_device_data(&f32_bytes(&[1.0, 2.0]));

        // Assert
        assert_eq!(
            result,
            Err(BufferError::LengthMismatch {
                expected: 12,
                actual: 8
            })
        );
        assert_eq!(buffer.current("left"), Ok(ParamValue::F32(0.0)));
    }

    #[test]
    fn test_apply_device_data_with_empty_subscription_accepts_only_empty_payload() {
        let buffer = line_follower();
        assert!(buffer.apply_device_data(&[]).is_ok());
        assert!(buffer.apply_device_data(&[0]).is_err());
    }

    #[test]
    fn test_mixed_width_fields_are_split_in_bitmap_order() {
        // Arrange: kumiko (bool), sapphire (i8), asuka (i16), kanade (f64)
        let buffer = SensorBuffer::new(&EXAMPLE_DEVICE, uid(0xFF));
        let bitmap = (1 << 0) | (1 << 2) | (1 << 4) | (1 << 10);
        buffer.update_subscription(bitmap, 10, uid(0xFF));
        let mut data = vec![1, 0xFE];
        data.extend_from_slice(&(-300i16).to_le_bytes());
        data.extend_from_slice(&2.5f64.to_le_bytes());

        // Act
        buffer.apply_device_data(&data).unwrap();

        // Assert
        assert_eq!(buffer.current("kumiko"), Ok(ParamValue::Bool(true)));
        assert_eq!(buffer.current("sapphire"), Ok(ParamValue::I8(-2)));
        assert_eq!(buffer.current("asuka"), Ok(ParamValue::I16(-300)));
        assert_eq!(buffer.current("kanade"), Ok(ParamValue::F64(2.5)));
    }

    #[test]
    fn test_update_subscription_masks_bits_past_the_layout() {
        // Arrange: the line follower has three parameters
        let buffer = line_follower();

        // Act
        let applied = buffer.update_subscription(0b1010, 20, uid(2));

        // Assert
        assert_eq!(applied, 0b010);
        assert_eq!(buffer.subscription(), 0b010);
        assert_eq!(buffer.subscribed_size(), 4);
        assert_eq!(buffer.delay(), 20);
    }

    #[test]
    fn test_set_desired_marks_dirty_and_make_write_drains() {
        // Arrange
        let buffer = SensorBuffer::new(&POLAR_BEAR, uid(1));
        buffer.set_desired("duty_cycle", ParamValue::F32(0.5)).unwrap();
        buffer.set_desired("drive_mode", ParamValue::U8(2)).unwrap();

        // Act
        let first = buffer.make_write();
        let second = buffer.make_write();

        // Assert
        let mut expected = 0.5f32.to_le_bytes().to_vec();
        expected.push(2);
        assert_eq!(
            first,
            Some(SensorPacket::DeviceWrite {
                params: 0b1001,
                data: expected
            })
        );
        assert_eq!(second, None);
    }

    #[test]
    fn test_set_desired_rejects_read_only_and_mistyped_values() {
        let buffer = SensorBuffer::new(&POLAR_BEAR, uid(1));
        assert_eq!(
            buffer.set_desired("motor_current", ParamValue::F32(1.0)),
            Err(BufferError::NotWriteable("motor_current"))
        );
        assert!(matches!(
            buffer.set_desired("duty_cycle", ParamValue::U8(1)),
            Err(BufferError::TypeMismatch { .. })
        ));
        assert!(matches!(
            buffer.set_desired("nonexistent", ParamValue::U8(1)),
            Err(BufferError::UnknownParameter { .. })
        ));
        assert_eq!(buffer.make_write(), None);
    }

    #[test]
    fn test_make_read_skips_parameters_already_streamed() {
        // Arrange: left is subscribed, right is not
        let buffer = line_follower();
        buffer.update_subscription(0b001, 40, uid(2));
        buffer.request_read("left").unwrap();
        buffer.request_read("right").unwrap();

        // Act / Assert
        assert_eq!(buffer.make_read(), Some(SensorPacket::DeviceRead { params: 0b100 }));
        assert_eq!(buffer.make_read(), None);
    }

    #[test]
    fn test_reset_restores_defaults_and_clears_pending() {
        // Arrange
        let buffer = SensorBuffer::new(&POLAR_BEAR, uid(1));
        buffer.set_current("motor_current", ParamValue::F32(3.0)).unwrap();
        buffer.set_desired("duty_cycle", ParamValue::F32(1.0)).unwrap();
        buffer.request_read("enc_pos").unwrap();

        // Act
        buffer.reset();

        // Assert
        assert_eq!(buffer.current("motor_current"), Ok(ParamValue::F32(0.0)));
        assert_eq!(buffer.make_write(), None);
        assert_eq!(buffer.make_read(), None);
    }

    #[test]
    fn test_status_lists_subscription_names_and_values() {
        // Arrange
        let buffer = line_follower();
        buffer.update_subscription(0b011, 25, uid(2));
        buffer.apply_device_data(&f32_bytes(&[0.1, 0.2])).unwrap();

        // Act
        let status = buffer.status();

        // Assert
        assert_eq!(status.device, "LineFollower");
        assert_eq!(status.subscription, vec!["left", "center"]);
        assert_eq!(status.delay, 25);
        assert_eq!(status.values.get("center"), Some(&ParamValue::F32(0.2)));
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["uid"]["year"], 0x14);
    }

    #[test]
    fn test_version_advances_on_every_change() {
        let buffer = line_follower();
        let start = buffer.version();

        buffer.update_subscription(0b001, 10, uid(2));
        buffer.apply_device_data(&f32_bytes(&[1.0])).unwrap();
        let _ = buffer.current("left");

        assert_eq!(buffer.version(), start + 2);
    }

    #[test]
    fn test_reader_guard_tracks_attached_readers() {
        let buffer = Arc::new(line_follower());
        let reader = BufferReader::new(Arc::clone(&buffer));
        assert_eq!(buffer.reader_count(), 1);
        assert_eq!(reader.device().name, "LineFollower");
        drop(reader);
        assert_eq!(buffer.reader_count(), 0);
    }

    #[test]
    fn test_published_segment_is_shared_with_an_attached_reader() {
        // Arrange: the owner publishes and streams two values
        let dir = temp_dir();
        let owner = SensorBuffer::create(&LINE_FOLLOWER, uid(2), &dir).unwrap();
        owner.update_subscription(0b011, 30, uid(2));
        owner.apply_device_data(&f32_bytes(&[0.5, 0.25])).unwrap();
        let path = dir.join(owner.key());

        // Act: a second mapping of the same file, as another process would hold
        let reader = BufferReader::attach_segment(&path).unwrap();

        // Assert
        assert_eq!(owner.path(), Some(path.as_path()));
        assert_eq!(reader.key(), owner.key());
        assert_eq!(reader.current("center"), Ok(ParamValue::F32(0.25)));
        assert_eq!(reader.status().subscription, vec!["left", "center"]);
        assert_eq!(owner.reader_count(), 1);
        drop(reader);
        assert_eq!(owner.reader_count(), 0);
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_attached_reader_writes_are_drained_by_the_owner() {
        // Arrange
        let dir = temp_dir();
        let owner = SensorBuffer::create(&POLAR_BEAR, uid(1), &dir).unwrap();
        let reader = BufferReader::attach_segment(&dir.join(owner.key())).unwrap();

        // Act
        reader.set_desired("duty_cycle", ParamValue::F32(-0.5)).unwrap();
        let write = owner.make_write();

        // Assert
        assert_eq!(
            write,
            Some(SensorPacket::DeviceWrite {
                params: 0b0001,
                data: (-0.5f32).to_le_bytes().to_vec()
            })
        );
        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_attach_segment_refuses_closing_and_foreign_files() {
        // Arrange
        let dir = temp_dir();
        let owner = SensorBuffer::create(&LINE_FOLLOWER, uid(2), &dir).unwrap();
        let foreign = dir.join("not-a-sensor");
        fs::write(&foreign, [0u8; 128]).unwrap();

        // Act
        owner.mark_closing();
        let closing = BufferReader::attach_segment(&dir.join(owner.key()));
        let bogus = BufferReader::attach_segment(&foreign);
        let missing = BufferReader::attach_segment(&dir.join("smart-sensor-1"));

        // Assert
        assert_eq!(closing.map(|_| ()), Err(BufferError::Closing(owner.key().to_string())));
        assert!(matches!(bogus, Err(BufferError::Segment { .. })));
        assert!(matches!(missing, Err(BufferError::Segment { .. })));
        fs::remove_dir_all(&dir).unwrap();
    }
}
