//! # Scoped Device Resources
//!
//! Every backend handle the crate acquires is wrapped in a [`Guard`] right
//! after creation. Dropping the guard hands the handle back to the backend's
//! matching `release_*` call, so release happens exactly once on every exit
//! path: normal return, early `return Err(..)`, or `?` propagation from a
//! nested step.
//!
//! ```text
//!   create_buffer ──> Guard<B, BufferHandle> ──(scope ends)──> release_buffer
//!   create_queue  ──> Guard<B, QueueHandle>  ──(scope ends)──> release_queue
//! ```
//!
//! Contexts are shared through `Arc<DeviceContext<B>>`, so the context is
//! released only when the session and every program built on it are gone.

use std::fmt;
use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::backend::ComputeBackend;

/// A class of backend handle and how to release it.
pub trait Handle<B: ComputeBackend> {
    type Raw;
    const LABEL: &'static str;

    fn release(backend: &B, raw: Self::Raw);
}

pub enum ContextHandle {}
pub enum QueueHandle {}
pub enum ProgramHandle {}
pub enum BufferHandle {}

impl<B: ComputeBackend> Handle<B> for ContextHandle {
    type Raw = B::Context;
    const LABEL: &'static str = "context";

    fn release(backend: &B, raw: B::Context) {
        backend.release_context(raw)
    }
}

impl<B: ComputeBackend> Handle<B> for QueueHandle {
    type Raw = B::Queue;
    const LABEL: &'static str = "queue";

    fn release(backend: &B, raw: B::Queue) {
        backend.release_queue(raw)
    }
}

impl<B: ComputeBackend> Handle<B> for ProgramHandle {
    type Raw = B::Program;
    const LABEL: &'static str = "program";

    fn release(backend: &B, raw: B::Program) {
        backend.release_program(raw)
    }
}

impl<B: ComputeBackend> Handle<B> for BufferHandle {
    type Raw = B::Buffer;
    const LABEL: &'static str = "buffer";

    fn release(backend: &B, raw: B::Buffer) {
        backend.release_buffer(raw)
    }
}

/// Owns one backend handle and releases it when dropped.
pub struct Guard<B: ComputeBackend, H: Handle<B>> {
    backend: Arc<B>,
    raw: ManuallyDrop<H::Raw>,
    _kind: PhantomData<fn() -> H>,
}

pub type DeviceContext<B> = Guard<B, ContextHandle>;
pub type DeviceQueue<B> = Guard<B, QueueHandle>;
pub type DeviceProgram<B> = Guard<B, ProgramHandle>;
pub type DeviceBuffer<B> = Guard<B, BufferHandle>;

impl<B: ComputeBackend, H: Handle<B>> Guard<B, H> {
    /// Take ownership of a freshly acquired handle.
    pub fn new(backend: Arc<B>, raw: H::Raw) -> Self {
        tracing::trace!("Acquired {} on {}", H::LABEL, backend.name());
        Self {
            backend,
            raw: ManuallyDrop::new(raw),
            _kind: PhantomData,
        }
    }
}

impl<B: ComputeBackend, H: Handle<B>> Deref for Guard<B, H> {
    type Target = H::Raw;

    fn deref(&self) -> &H::Raw {
        &self.raw
    }
}

impl<B: ComputeBackend, H: Handle<B>> DerefMut for Guard<B, H> {
    fn deref_mut(&mut self) -> &mut H::Raw {
        &mut self.raw
    }
}

impl<B: ComputeBackend, H: Handle<B>> Drop for Guard<B, H> {
    fn drop(&mut self) {
        // SAFETY: `raw` is never touched again after this point.
        let raw = unsafe { ManuallyDrop::take(&mut self.raw) };
        H::release(&self.backend, raw);
        tracing::trace!("Released {} on {}", H::LABEL, self.backend.name());
    }
}

impl<B: ComputeBackend, H: Handle<B>> fmt::Debug for Guard<B, H> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Guard")
            .field("kind", &H::LABEL)
            .field("backend", &self.backend.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BufferAccess, EmulatedBackend};
    use crate::error::{DeviceError, Result};

    fn alloc_then_fail(backend: &Arc<EmulatedBackend>, ctx: &DeviceContext<EmulatedBackend>) -> Result<()> {
        let _a = DeviceBuffer::new(
            backend.clone(),
            backend.create_buffer(ctx, 4, BufferAccess::ReadOnly)?,
        );
        let _b = DeviceBuffer::new(
            backend.clone(),
            backend.create_buffer(ctx, 4, BufferAccess::WriteOnly)?,
        );
        Err(DeviceError::execution("test", "early exit"))
    }

    #[test]
    fn test_guards_release_on_error_path() {
        let backend = Arc::new(EmulatedBackend::new());
        let device = backend.devices(0).unwrap().remove(0);
        let ctx = DeviceContext::new(backend.clone(), backend.create_context(&device).unwrap());

        assert!(alloc_then_fail(&backend, &ctx).is_err());
        assert_eq!(backend.ledger().live_buffers(), 0);
        assert_eq!(backend.ledger().buffers_allocated(), 2);

        drop(ctx);
        assert!(backend.ledger().is_clean());
    }

    #[test]
    fn test_shared_context_outlives_first_owner() {
        let backend = Arc::new(EmulatedBackend::new());
        let device = backend.devices(0).unwrap().remove(0);
        let ctx = Arc::new(DeviceContext::new(
            backend.clone(),
            backend.create_context(&device).unwrap(),
        ));
        let other = ctx.clone();

        drop(ctx);
        assert_eq!(backend.ledger().live_contexts(), 1);
        drop(other);
        assert_eq!(backend.ledger().live_contexts(), 0);
        assert_eq!(backend.ledger().double_releases(), 0);
    }
}
