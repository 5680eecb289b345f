use std::collections::HashMap;
use std::sync::Mutex;

use tgstream_mtproto::{FileHandle, MediaMeta};
use tracing::debug;

/// A decoded handle plus the message metadata it was derived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedMedia {
    pub handle: FileHandle,
    pub meta: MediaMeta,
}

/// Cache of decoded media per `(chat_id, message_id)`.
///
/// No LRU: entries are cheap, and the backing file references expire on the
/// backend's schedule anyway, so the whole map is cleared wholesale by a
/// periodic sweeper. A stale entry costs at most one refresh round-trip.
#[derive(Debug, Default)]
pub struct MediaCache {
    inner: Mutex<HashMap<(i64, i32), CachedMedia>>,
}

impl MediaCache {
    pub fn get(&self, chat_id: i64, message_id: i32) -> Option<CachedMedia> {
        self.inner
            .lock()
            .unwrap()
            .get(&(chat_id, message_id))
            .cloned()
    }

    pub fn insert(&self, chat_id: i64, message_id: i32, media: CachedMedia) {
        self.inner
            .lock()
            .unwrap()
            .insert((chat_id, message_id), media);
    }

    pub fn remove(&self, chat_id: i64, message_id: i32) {
        self.inner.lock().unwrap().remove(&(chat_id, message_id));
    }

    /// Wholesale eviction, called by the sweeper.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        if !inner.is_empty() {
            debug!(entries = inner.len(), "clearing media cache");
        }
        inner.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().is_empty()
    }
}
