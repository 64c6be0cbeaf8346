//! Session I/O buffers, recycled across connections.
//!
//! A pool that churns through short-lived sessions would otherwise allocate
//! fresh read and write buffers for each one.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, LazyLock};

use crossbeam_queue::ArrayQueue;

const RECYCLED_SETS: usize = 128;
const MAX_KEPT_CAPACITY: usize = 4 * 1024 * 1024;

static RECYCLER: LazyLock<Arc<Recycler>> =
    LazyLock::new(|| Arc::new(Recycler::new(RECYCLED_SETS)));

/// Buffers owned by one session.
#[derive(Debug, Default)]
pub(crate) struct SessionBuffers {
    /// Bytes received but not yet decoded; may end in a partial frame
    pub inbound: Vec<u8>,
    /// Encoded frames not yet handed to the transport
    pub outbound: Vec<u8>,
    /// Encoding target for a single command, copied to `outbound` on success
    pub scratch: Vec<u8>,
}

impl SessionBuffers {
    fn allocate() -> Self {
        Self {
            inbound: Vec::with_capacity(8192),
            outbound: Vec::with_capacity(8192),
            scratch: Vec::with_capacity(1024),
        }
    }

    fn oversized(&self) -> bool {
        self.inbound.capacity() > MAX_KEPT_CAPACITY || self.outbound.capacity() > MAX_KEPT_CAPACITY
    }
}

#[derive(Debug)]
struct Recycler {
    free: ArrayQueue<SessionBuffers>,
}

impl Recycler {
    fn new(capacity: usize) -> Self {
        Self {
            free: ArrayQueue::new(capacity),
        }
    }

    fn take(self: &Arc<Self>) -> Buffers {
        let buffers = self.free.pop().unwrap_or_else(SessionBuffers::allocate);
        Buffers {
            recycler: Arc::clone(self),
            buffers,
        }
    }

    fn put_back(&self, mut buffers: SessionBuffers) {
        // a huge result left these too big to keep around
        if buffers.oversized() {
            return;
        }
        buffers.inbound.clear();
        buffers.outbound.clear();
        buffers.scratch.clear();
        // full: let it drop
        let _ = self.free.push(buffers);
    }
}

/// Buffers checked out of the global recycler, returned on drop.
#[derive(Debug)]
pub(crate) struct Buffers {
    recycler: Arc<Recycler>,
    buffers: SessionBuffers,
}

impl Buffers {
    pub fn take() -> Self {
        RECYCLER.take()
    }
}

impl Deref for Buffers {
    type Target = SessionBuffers;

    fn deref(&self) -> &Self::Target {
        &self.buffers
    }
}

impl DerefMut for Buffers {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buffers
    }
}

impl Drop for Buffers {
    fn drop(&mut self) {
        let buffers = std::mem::take(&mut self.buffers);
        self.recycler.put_back(buffers);
    }
}
