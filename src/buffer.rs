// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use crate::{
    error::{Result, RouterError},
    geometry::{CropRegion, FourCC, Resolution},
    stream::StreamId,
};
use core::fmt;
use parking_lot::{Condvar, Mutex};
use std::{
    collections::VecDeque,
    sync::{Arc, Weak},
    time::Duration,
};
use tracing::warn;

/// Opaque client-side buffer handle, translated to a [`Surface`] through a
/// stream's translation table.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct NativeHandle(pub u64);

/// Internal view of one hardware buffer: an addressable surface with a
/// known resolution and pixel layout.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Surface {
    pub id: u64,
    pub resolution: Resolution,
    pub format: FourCC,
}

impl fmt::Display for Surface {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {} id:{}", self.resolution, self.format, self.id)
    }
}

struct Shared {
    surface: Surface,
    crop: CropRegion,
    owner: Option<StreamId>,
    count: Mutex<usize>,
    released: Condvar,
}

/// Reference-counted wrapper around one hardware-produced buffer.
///
/// Each consuming stream retains the handle once before its worker is
/// signaled and releases it exactly once when its job completes. The
/// underlying buffer must not be recycled back to the capture hardware
/// until the count reaches zero; [`SharedBufferHandle::wait_released`]
/// blocks the recycling thread until that point.
///
/// At most one stream owns the underlying storage (the buffer was that
/// stream's own output); every other stream merely reads it. The owner is
/// recorded so teardown accounting can exclude it.
#[derive(Clone)]
pub struct SharedBufferHandle {
    inner: Arc<Shared>,
}

impl SharedBufferHandle {
    pub fn new(surface: Surface, crop: CropRegion, owner: Option<StreamId>) -> Self {
        Self {
            inner: Arc::new(Shared {
                surface,
                crop,
                owner,
                count: Mutex::new(0),
                released: Condvar::new(),
            }),
        }
    }

    pub fn surface(&self) -> &Surface {
        &self.inner.surface
    }

    pub fn crop(&self) -> CropRegion {
        self.inner.crop
    }

    pub fn owner(&self) -> Option<StreamId> {
        self.inner.owner
    }

    pub fn refcount(&self) -> usize {
        *self.inner.count.lock()
    }

    /// Adds one consumer reference. Called once per participating stream
    /// before its worker is signaled.
    pub fn retain(&self) {
        *self.inner.count.lock() += 1;
    }

    /// Drops one consumer reference and returns the remaining count. The
    /// transition to zero wakes every thread blocked in
    /// [`SharedBufferHandle::wait_released`].
    pub fn release(&self) -> usize {
        let mut count = self.inner.count.lock();
        if *count == 0 {
            warn!(surface = %self.inner.surface, "release on drained buffer handle");
            return 0;
        }
        *count -= 1;
        if *count == 0 {
            self.inner.released.notify_all();
        }
        *count
    }

    /// Blocks until every consumer reference has been released.
    pub fn wait_released(&self) {
        let mut count = self.inner.count.lock();
        while *count > 0 {
            self.inner.released.wait(&mut count);
        }
    }

    pub fn downgrade(&self) -> WeakBufferHandle {
        WeakBufferHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }
}

/// Weak reference to a [`SharedBufferHandle`].
#[derive(Clone)]
pub struct WeakBufferHandle {
    inner: Weak<Shared>,
}

impl WeakBufferHandle {
    /// Resolves to a strong handle, or `None` if the buffer has already
    /// been torn down.
    pub fn promote(&self) -> Option<SharedBufferHandle> {
        self.inner.upgrade().map(|inner| SharedBufferHandle { inner })
    }
}

/// Pool of pre-allocated surfaces backing synthesized zoom buffers.
///
/// Acquisition is bounded by a fixed timeout; running past it is reported
/// as a fence timeout and the affected job completes through the normal
/// per-buffer error path.
pub struct BufferPool {
    free: Mutex<VecDeque<Surface>>,
    available: Condvar,
    timeout: Duration,
}

impl BufferPool {
    pub fn new(surfaces: Vec<Surface>, timeout: Duration) -> Self {
        Self {
            free: Mutex::new(surfaces.into()),
            available: Condvar::new(),
            timeout,
        }
    }

    /// Takes a surface from the pool, blocking up to the pool timeout.
    pub fn acquire(&self, frame: u64) -> Result<Surface> {
        let mut free = self.free.lock();
        loop {
            if let Some(surface) = free.pop_front() {
                return Ok(surface);
            }
            if self
                .available
                .wait_for(&mut free, self.timeout)
                .timed_out()
                && free.is_empty()
            {
                warn!(frame, "zoom buffer acquisition timed out");
                return Err(RouterError::FenceTimeout(frame));
            }
        }
    }

    /// Returns a surface to the pool and wakes one blocked acquirer.
    pub fn release(&self, surface: Surface) {
        self.free.lock().push_back(surface);
        self.available.notify_one();
    }

    pub fn len(&self) -> usize {
        self.free.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.free.lock().is_empty()
    }
}

/// Default number of in-flight buffers for a stream of the given
/// resolution. Larger modes get deeper queues to ride out encoder jitter.
pub fn buffer_count_for(res: Resolution) -> usize {
    const COUNTS: &[(u32, u32, usize)] = &[
        (3840, 2160, 6),
        (1920, 1080, 6),
        (1280, 720, 6),
        (640, 480, 5),
        (320, 240, 5),
    ];
    for &(w, h, n) in COUNTS {
        if res.width == w && res.height == h {
            return n;
        }
    }
    4
}
