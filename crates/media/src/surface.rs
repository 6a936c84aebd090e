//! Opaque handles to platform render targets.
//!
//! A decoder renders into a handle produced by the GPU context, and the GPU
//! context draws into a handle produced by the encoder. The engine never
//! looks inside; adapters recover their native object with [`SurfaceHandle::native`].

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_SURFACE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone)]
pub struct SurfaceHandle {
    id: u64,
    native: Arc<dyn Any + Send + Sync>,
}

impl SurfaceHandle {
    pub fn new<T: Any + Send + Sync>(native: Arc<T>) -> Self {
        Self {
            id: NEXT_SURFACE_ID.fetch_add(1, Ordering::Relaxed),
            native,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// The adapter-specific object behind this handle, if it has type `T`.
    pub fn native<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.native.clone().downcast::<T>().ok()
    }
}

impl fmt::Debug for SurfaceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SurfaceHandle").field("id", &self.id).finish()
    }
}
