#![allow(missing_docs)]
//! # Crop Yield Simulation Engine
//!
//! This crate offloads batches of crop-yield estimates to a compute device.
//! Each sample is a field area and an average temperature; the device runs one
//! kernel lane per sample and returns one estimated yield per sample, in input
//! order.
//!
//! The device context, its command queue and the compiled kernel are created
//! once per process and shared by every request; each request only allocates
//! and frees its own transfer buffers.
//!
//! ## Core Modules
//!
//! - `backend`: The device abstraction, plus the emulated and CUDA backends.
//! - `guard`: RAII ownership of device handles.
//! - `session`: Device discovery and the long-lived context/queue pair.
//! - `cache`: Compile-once program cache keyed by session and kernel version.
//! - `engine`: The batch pipeline and the process-scoped `SimulationEngine`.
//! - `service`: JSON request/response contract for the calling backend.
//! - `kernel`, `model`, `config`, `error`: kernel text, data types, settings
//!   and the error taxonomy.

pub mod backend;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod guard;
pub mod kernel;
pub mod model;
pub mod service;
pub mod session;

pub use backend::{ComputeBackend, EmulatedBackend};
#[cfg(feature = "cuda")]
pub use backend::CudaBackend;
pub use cache::{CompiledProgram, ProgramCache};
pub use config::{DevicePreference, EngineConfig};
pub use engine::{run, EngineStats, SimulationEngine};
pub use error::{DeviceError, Result};
pub use kernel::{estimate_yield, KernelSource};
pub use model::{YieldRequest, YieldResult, YieldSample};
pub use service::{SimulationHandler, SimulationPayload, SimulationResponse};
pub use session::{DeviceSession, SessionId};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
