//! # Compute Backends
//!
//! The engine talks to a device only through [`ComputeBackend`]. A backend
//! exposes the classic accelerator object model: platforms own devices, a
//! context is opened on one device, work is submitted through an in-order
//! queue, programs are compiled from source text, and buffers hold device
//! memory.
//!
//! Handles are plain values; releasing them is explicit (`release_*`). Callers
//! never invoke the release methods directly: the [`crate::guard`] wrappers do,
//! exactly once, when the owning scope ends.
//!
//! - `emulated`: host-side backend with resource accounting and fault
//!   injection. Always available.
//! - `cuda`: CUDA driver + NVRTC via `cudarc` (feature `cuda`).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::Result;
use crate::kernel::KernelSource;

#[cfg(feature = "cuda")]
pub mod cuda;
pub mod emulated;

#[cfg(feature = "cuda")]
pub use cuda::CudaBackend;
pub use emulated::{EmulatedBackend, FaultPlan, ResourceLedger};

/// Broad class of a compute device.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Gpu,
    Cpu,
    Accelerator,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gpu => write!(f, "GPU"),
            Self::Cpu => write!(f, "CPU"),
            Self::Accelerator => write!(f, "Accelerator"),
        }
    }
}

/// A platform reported by discovery.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformInfo {
    pub name: String,
    pub vendor: String,
}

/// A device reported by discovery.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub name: String,
    pub kind: DeviceKind,
    /// Position of the owning platform in discovery order
    pub platform: usize,
    /// Position of the device within its platform
    pub index: usize,
}

/// How the kernel accesses a buffer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BufferAccess {
    ReadOnly,
    WriteOnly,
}

/// Arguments of the yield kernel, in ABI order.
///
/// The field order mirrors the kernel's parameter list; backends bind them
/// positionally as `(areas, temperatures, results, count)`.
pub struct KernelArgs<'a, Buf> {
    pub areas: &'a Buf,
    pub temperatures: &'a Buf,
    pub results: &'a mut Buf,
    pub count: u32,
}

/// Largest work group any backend is asked to run. CUDA caps a block at
/// 1024 threads on every current architecture.
pub const MAX_WORK_GROUP: u32 = 1024;

/// Launch geometry for a one-dimensional range.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LaunchShape {
    /// Number of lanes that carry an item
    pub global: u32,
    /// Lanes per work group
    pub local: u32,
}

impl LaunchShape {
    /// Cover `items` lanes with groups of `local` lanes, `local` clamped to
    /// `1..=MAX_WORK_GROUP`. Trailing lanes of the last group are idle and
    /// skipped by the kernel's `i < count` guard.
    pub fn cover(items: u32, local: u32) -> Self {
        Self {
            global: items,
            local: local.clamp(1, MAX_WORK_GROUP),
        }
    }

    /// Number of work groups launched
    pub fn groups(&self) -> u32 {
        self.global.div_ceil(self.local)
    }

    /// Total lanes launched, including idle trailing lanes
    pub fn padded(&self) -> u32 {
        self.groups() * self.local
    }
}

/// A parallel compute device as seen by the engine.
///
/// Implementations must be shareable across threads; per-handle
/// synchronization (the queue in particular) is provided by the caller.
pub trait ComputeBackend: Send + Sync + 'static {
    type Context: Send + Sync + 'static;
    type Queue: Send + 'static;
    type Program: Send + Sync + 'static;
    type Buffer: Send + 'static;

    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Available platforms, in a stable order
    fn platforms(&self) -> Result<Vec<PlatformInfo>>;

    /// Devices of one platform, in a stable order
    fn devices(&self, platform: usize) -> Result<Vec<DeviceInfo>>;

    fn create_context(&self, device: &DeviceInfo) -> Result<Self::Context>;

    /// Create an in-order command queue on `context`
    fn create_queue(&self, context: &Self::Context) -> Result<Self::Queue>;

    /// Compile `source`. On failure the backend's diagnostic log is returned
    /// as [`crate::DeviceError::BuildFailed`].
    fn build_program(&self, context: &Self::Context, source: &KernelSource)
        -> Result<Self::Program>;

    /// Allocate `len` `f32` elements of device memory
    fn create_buffer(
        &self,
        context: &Self::Context,
        len: usize,
        access: BufferAccess,
    ) -> Result<Self::Buffer>;

    /// Blocking host-to-device copy
    fn write_buffer(&self, queue: &mut Self::Queue, buffer: &mut Self::Buffer, data: &[f32])
        -> Result<()>;

    /// Enqueue the program over `shape`
    fn launch(
        &self,
        queue: &mut Self::Queue,
        program: &Self::Program,
        args: KernelArgs<'_, Self::Buffer>,
        shape: LaunchShape,
    ) -> Result<()>;

    /// Wait until all enqueued work has completed, at most `timeout`
    fn finish(&self, queue: &mut Self::Queue, timeout: Duration) -> Result<()>;

    /// Blocking device-to-host copy
    fn read_buffer(&self, queue: &mut Self::Queue, buffer: &Self::Buffer, out: &mut [f32])
        -> Result<()>;

    fn release_buffer(&self, buffer: Self::Buffer);
    fn release_program(&self, program: Self::Program);
    fn release_queue(&self, queue: Self::Queue);
    fn release_context(&self, context: Self::Context);
}
