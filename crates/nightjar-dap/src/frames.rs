//! Client-visible frame ids.
//!
//! Frame ids are unique across threads so `evaluate` and friends can be routed
//! from a bare `frameId`. A thread's ids are released the moment it resumes.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicI64, Ordering},
};

use parking_lot::Mutex;

use crate::events::ThreadId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameRef {
    pub thread_id: ThreadId,
    pub call_frame_id: String,
}

#[derive(Debug)]
pub struct FrameTable {
    next: AtomicI64,
    frames: Mutex<HashMap<i64, FrameRef>>,
}

impl Default for FrameTable {
    fn default() -> Self {
        Self {
            next: AtomicI64::new(1),
            frames: Mutex::new(HashMap::new()),
        }
    }
}

impl FrameTable {
    pub fn allocate(&self, thread_id: ThreadId, call_frame_id: impl Into<String>) -> i64 {
        let id = self.next.fetch_add(1, Ordering::Relaxed);
        self.frames.lock().insert(
            id,
            FrameRef {
                thread_id,
                call_frame_id: call_frame_id.into(),
            },
        );
        id
    }

    pub fn get(&self, frame_id: i64) -> Option<FrameRef> {
        self.frames.lock().get(&frame_id).cloned()
    }

    pub fn release_thread(&self, thread_id: ThreadId) {
        self.frames
            .lock()
            .retain(|_, frame| frame.thread_id != thread_id);
    }
}
