//! In-memory cache pool, used when no cache directory is configured

use bytes::Bytes;
use parking_lot::Mutex;
use slatefs_common::BlockId;
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct MemoryDir {
    blocks: Mutex<HashMap<BlockId, Bytes>>,
}

impl MemoryDir {
    pub fn write(&self, block: &BlockId, data: Bytes) {
        self.blocks.lock().insert(*block, data);
    }

    pub fn read(&self, block: &BlockId) -> Option<Bytes> {
        self.blocks.lock().get(block).cloned()
    }

    pub fn remove(&self, block: &BlockId) {
        self.blocks.lock().remove(block);
    }
}
