//! Registry of live sensor buffers, keyed by `smart-sensor-<uid>`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use super::buffer::{BufferError, BufferReader, SensorBuffer};
use super::catalog;
use super::segment;
use crate::protocol::messages::SensorUid;

/// Process-wide table of sensor buffers.
///
/// The owning session opens a buffer when the sensor first identifies itself
/// and removes it when the session ends.  Readers in this process attach by
/// key and hold a [`BufferReader`] for as long as they read.
///
/// A store made with [`BufferStore::shared`] also publishes every buffer as
/// a segment file named after its key, which other processes map with
/// [`BufferReader::attach_segment`].
///
/// Each key has a single owner.  Opening a key that is already live hands the
/// key to the new caller and marks the previous buffer closing, so the
/// previous owner's writer stops and its release leaves the new buffer alone.
#[derive(Debug, Default)]
pub struct BufferStore {
    dir: Option<PathBuf>,
    buffers: Mutex<HashMap<String, Arc<SensorBuffer>>>,
}

impl BufferStore {
    /// A store whose buffers live in private memory.
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that publishes each buffer as a segment file under `dir`.
    pub fn shared(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
            buffers: Mutex::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Arc<SensorBuffer>>> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Directory segment files are published in, if any.
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Where the segment for `key` is published, if this store publishes.
    pub fn segment_path(&self, key: &str) -> Option<PathBuf> {
        self.dir.as_ref().map(|dir| dir.join(key))
    }

    /// Opens a fresh buffer for `uid` and makes the caller its owner.
    ///
    /// A live buffer already published under the same key is marked closing
    /// and replaced.
    pub fn open(&self, uid: SensorUid) -> Result<Arc<SensorBuffer>, BufferError> {
        let device = catalog::lookup(uid.device_type).ok_or(BufferError::UnknownDevice(uid.device_type))?;
        let key = uid.buffer_key();
        let mut buffers = self.lock();
        let buffer = Arc::new(match &self.dir {
            Some(dir) => SensorBuffer::create(device, uid, dir)?,
            None => SensorBuffer::new(device, uid),
        });
        if let Some(previous) = buffers.insert(key, Arc::clone(&buffer)) {
            if !previous.is_closing() {
                warn!(key = buffer.key(), "sensor buffer taken over by a new session");
                previous.mark_closing();
            }
        }
        debug!(key = buffer.key(), shared = self.dir.is_some(), "sensor buffer opened");
        Ok(buffer)
    }

    /// Attaches a reader to the buffer published under `key`.
    ///
    /// Returns `None` if no such buffer exists or it is closing.
    pub fn attach(&self, key: &str) -> Option<BufferReader> {
        let buffers = self.lock();
        let buffer = buffers.get(key).filter(|b| !b.is_closing())?;
        Some(BufferReader::new(Arc::clone(buffer)))
    }

    /// Removes `buffer` from the table and unpublishes its segment.
    ///
    /// Only the exact instance is removed; a newer buffer published under the
    /// same key stays, along with its segment file.  Returns whether anything
    /// was removed.
    pub fn remove(&self, buffer: &Arc<SensorBuffer>) -> bool {
        let mut buffers = self.lock();
        match buffers.get(buffer.key()) {
            Some(current) if Arc::ptr_eq(current, buffer) => {
                buffers.remove(buffer.key());
                if let Some(path) = buffer.path() {
                    if let Err(e) = segment::unlink(path) {
                        warn!(path = %path.display(), "failed to unlink sensor segment: {e}");
                    }
                }
                true
            }
            _ => false,
        }
    }

    /// Keys of every published buffer, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
