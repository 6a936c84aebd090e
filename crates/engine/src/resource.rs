//! Owned platform handles that are freed when dropped.

use std::ops::{Deref, DerefMut};

use reframe_media::capability::{Codec, Decoder, Demuxer, Encoder, GpuContext, Muxer};

/// Frees the platform objects behind a handle. Must be idempotent.
pub trait Teardown {
    fn teardown(&mut self);
}

impl Teardown for dyn Demuxer {
    fn teardown(&mut self) {
        self.release();
    }
}

impl Teardown for dyn Decoder {
    fn teardown(&mut self) {
        halt(self, "decoder");
    }
}

impl Teardown for dyn Encoder {
    fn teardown(&mut self) {
        halt(self, "encoder");
    }
}

impl Teardown for dyn GpuContext {
    fn teardown(&mut self) {
        self.release();
    }
}

impl Teardown for dyn Muxer {
    fn teardown(&mut self) {
        self.release();
    }
}

fn halt<C: Codec + ?Sized>(codec: &mut C, role: &str) {
    if let Err(e) = codec.stop() {
        tracing::debug!(role, error = %e, "Codec stop failed during teardown");
    }
    Codec::release(codec);
}

/// A boxed handle torn down on drop, so early returns never leak it.
pub struct Owned<T: Teardown + ?Sized>(Box<T>);

impl<T: Teardown + ?Sized> Owned<T> {
    pub fn new(inner: Box<T>) -> Self {
        Self(inner)
    }
}

impl<T: Teardown + ?Sized> Deref for Owned<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T: Teardown + ?Sized> DerefMut for Owned<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.0
    }
}

impl<T: Teardown + ?Sized> Drop for Owned<T> {
    fn drop(&mut self) {
        self.0.teardown();
    }
}
