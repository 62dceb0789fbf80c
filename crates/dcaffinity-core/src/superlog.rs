// # Memory Superlog
//
// Bounded ring of recent state-machine runs. The oldest entry is dropped
// once capacity is reached.

use async_trait::async_trait;
use std::collections::VecDeque;
use tokio::sync::Mutex;

use crate::traits::{Superlog, SuperlogEntry};

#[derive(Debug)]
pub struct MemorySuperlog {
    capacity: usize,
    entries: Mutex<VecDeque<SuperlogEntry>>,
}

impl MemorySuperlog {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }
}

#[async_trait]
impl Superlog for MemorySuperlog {
    async fn record(&self, entry: SuperlogEntry) {
        let mut entries = self.entries.lock().await;
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    async fn recent(&self, limit: usize) -> Vec<SuperlogEntry> {
        let entries = self.entries.lock().await;
        entries.iter().rev().take(limit).cloned().collect()
    }
}
