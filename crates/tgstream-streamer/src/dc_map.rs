use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use serde::Serialize;
use tgstream_mtproto::DcId;
use tracing::{debug, info};

/// Memoises which DC each `(chat_id, message_id)` was last served from, so
/// repeat requests skip the home-DC-then-migrate dance.
#[derive(Debug, Default)]
pub struct FileDcMap {
    inner: Mutex<HashMap<(i64, i32), DcId>>,
}

/// Summary of the mapping, for the stats surface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MappingStats {
    pub total_files: usize,
    pub dc_distribution: BTreeMap<i32, usize>,
}

impl FileDcMap {
    pub fn get(&self, chat_id: i64, message_id: i32) -> Option<DcId> {
        let dc = self
            .inner
            .lock()
            .unwrap()
            .get(&(chat_id, message_id))
            .copied();
        if let Some(dc) = dc {
            debug!(chat_id, message_id, dc = dc.0, "file-dc mapping hit");
        }
        dc
    }

    pub fn set(&self, chat_id: i64, message_id: i32, dc: DcId) {
        let prior = self
            .inner
            .lock()
            .unwrap()
            .insert((chat_id, message_id), dc);
        if prior != Some(dc) {
            info!(chat_id, message_id, dc = dc.0, "file-dc mapping recorded");
        }
    }

    pub fn clear(&self, chat_id: i64, message_id: i32) {
        self.inner.lock().unwrap().remove(&(chat_id, message_id));
    }

    pub fn reset(&self) {
        self.inner.lock().unwrap().clear();
    }

    pub fn stats(&self) -> MappingStats {
        let inner = self.inner.lock().unwrap();
        let mut dc_distribution = BTreeMap::new();
        for dc in inner.values() {
            *dc_distribution.entry(dc.0).or_default() += 1;
        }
        MappingStats {
            total_files: inner.len(),
            dc_distribution,
        }
    }
}
