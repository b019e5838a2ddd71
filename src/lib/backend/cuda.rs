//! # CUDA Backend
//!
//! Runs the yield kernel on an NVIDIA GPU through `cudarc`.
//!
//! | Concept  | CUDA object                                   |
//! |----------|-----------------------------------------------|
//! | platform | the CUDA driver (one platform when it loads)  |
//! | device   | a CUDA ordinal                                |
//! | context  | `Arc<CudaDevice>` (primary context)           |
//! | queue    | a stream forked from the device stream        |
//! | program  | NVRTC-compiled PTX module + entry function    |
//! | buffer   | `CudaSlice<f32>`                              |
//!
//! Transfers are synchronous copies; launches go to the forked stream and
//! completion is awaited by polling an event recorded behind the launch, so
//! the wait can be bounded.
//!
//! Buffers are freed asynchronously on the device's default stream. When
//! `finish` gives up (timeout or a failed query) the kernel may still be
//! writing to them, so before returning the error the default stream is made
//! to wait for the forked one: the frees that follow run only after the
//! kernel has drained. The host is not blocked by this.

use cudarc::driver::result::{self as driver, event};
use cudarc::driver::{sys, CudaDevice, CudaFunction, CudaSlice, CudaStream, DeviceSlice, LaunchAsync, LaunchConfig};
use cudarc::nvrtc::{compile_ptx, CompileError};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use super::{
    BufferAccess, ComputeBackend, DeviceInfo, DeviceKind, KernelArgs, LaunchShape, PlatformInfo,
};
use crate::backend::MAX_WORK_GROUP;
use crate::error::{DeviceError, Result};
use crate::kernel::KernelSource;

/// Interval between completion polls in `finish`.
const POLL_INTERVAL: Duration = Duration::from_micros(50);

/// `CudaDevice::load_ptx` wants `'static` function names. Each distinct entry
/// name is leaked once and reused.
fn intern(name: &str) -> &'static str {
    static NAMES: OnceLock<Mutex<HashSet<&'static str>>> = OnceLock::new();
    let mut names = NAMES.get_or_init(|| Mutex::new(HashSet::new())).lock();
    if let Some(existing) = names.get(name) {
        return existing;
    }
    let leaked: &'static str = Box::leak(name.to_string().into_boxed_str());
    names.insert(leaked);
    leaked
}

/// cudarc loads the driver and NVRTC libraries lazily and panics when they
/// are missing; turn that into an error.
fn catch_loader<T>(what: &str, f: impl FnOnce() -> T) -> std::result::Result<T, String> {
    panic::catch_unwind(AssertUnwindSafe(f)).map_err(|_| format!("{} library could not be loaded", what))
}

pub struct CudaQueue {
    device: Arc<CudaDevice>,
    stream: CudaStream,
}

pub struct CudaBuffer {
    slice: CudaSlice<f32>,
}

/// Destroys an event on every exit path of `finish`.
struct EventGuard(sys::CUevent);

impl Drop for EventGuard {
    fn drop(&mut self) {
        unsafe {
            event::destroy(self.0).ok();
        }
    }
}

/// CUDA driver backend.
#[derive(Debug, Default)]
pub struct CudaBackend;

impl CudaBackend {
    pub fn new() -> Self {
        Self
    }
}

impl ComputeBackend for CudaBackend {
    type Context = Arc<CudaDevice>;
    type Queue = CudaQueue;
    type Program = CudaFunction;
    type Buffer = CudaBuffer;

    fn name(&self) -> &'static str {
        "cuda"
    }

    fn platforms(&self) -> Result<Vec<PlatformInfo>> {
        match catch_loader("CUDA driver", driver::init) {
            Ok(Ok(())) => Ok(vec![PlatformInfo {
                name: "NVIDIA CUDA".to_string(),
                vendor: "NVIDIA Corporation".to_string(),
            }]),
            Ok(Err(e)) => {
                tracing::warn!("CUDA driver init failed: {:?}", e);
                Ok(Vec::new())
            }
            Err(msg) => {
                tracing::warn!("{}", msg);
                Ok(Vec::new())
            }
        }
    }

    fn devices(&self, platform: usize) -> Result<Vec<DeviceInfo>> {
        if platform != 0 {
            return Ok(Vec::new());
        }
        let count = CudaDevice::count().map_err(|e| {
            DeviceError::ContextCreationFailed(format!("device enumeration failed: {:?}", e))
        })?;
        Ok((0..count.max(0) as usize)
            .map(|index| DeviceInfo {
                name: format!("cuda:{}", index),
                kind: DeviceKind::Gpu,
                platform: 0,
                index,
            })
            .collect())
    }

    fn create_context(&self, device: &DeviceInfo) -> Result<Arc<CudaDevice>> {
        CudaDevice::new(device.index).map_err(|e| {
            DeviceError::ContextCreationFailed(format!("{}: {:?}", device.name, e))
        })
    }

    fn create_queue(&self, context: &Arc<CudaDevice>) -> Result<CudaQueue> {
        let stream = context
            .fork_default_stream()
            .map_err(|e| DeviceError::ContextCreationFailed(format!("stream: {:?}", e)))?;
        Ok(CudaQueue {
            device: context.clone(),
            stream,
        })
    }

    fn build_program(&self, context: &Arc<CudaDevice>, source: &KernelSource) -> Result<CudaFunction> {
        let ptx = match catch_loader("NVRTC", || compile_ptx(&source.text)) {
            Ok(Ok(ptx)) => ptx,
            Ok(Err(CompileError::CompileError { log, .. })) => {
                return Err(DeviceError::BuildFailed {
                    log: log.to_string_lossy().into_owned(),
                })
            }
            Ok(Err(other)) => {
                return Err(DeviceError::BuildFailed {
                    log: format!("{:?}", other),
                })
            }
            Err(msg) => return Err(DeviceError::BuildFailed { log: msg }),
        };

        let module = source.module_name();
        let entry = intern(&source.entry);
        context
            .load_ptx(ptx, &module, &[entry])
            .map_err(|e| DeviceError::BuildFailed {
                log: format!("loading module {}: {:?}", module, e),
            })?;

        context
            .get_func(&module, entry)
            .ok_or_else(|| DeviceError::BuildFailed {
                log: format!("module {} has no entry point \"{}\"", module, entry),
            })
    }

    // Access flags are advisory here; the kernel's const qualifiers enforce them.
    fn create_buffer(&self, context: &Arc<CudaDevice>, len: usize, _access: BufferAccess) -> Result<CudaBuffer> {
        let slice = context
            .alloc_zeros::<f32>(len)
            .map_err(|e| DeviceError::execution("alloc", format!("{:?}", e)))?;
        Ok(CudaBuffer { slice })
    }

    fn write_buffer(&self, queue: &mut CudaQueue, buffer: &mut CudaBuffer, data: &[f32]) -> Result<()> {
        if data.len() != buffer.slice.len() {
            return Err(DeviceError::execution(
                "write_buffer",
                format!("{} elements into buffer of {}", data.len(), buffer.slice.len()),
            ));
        }
        queue
            .device
            .htod_sync_copy_into(data, &mut buffer.slice)
            .map_err(|e| DeviceError::execution("write_buffer", format!("{:?}", e)))
    }

    fn launch(
        &self,
        queue: &mut CudaQueue,
        program: &CudaFunction,
        args: KernelArgs<'_, CudaBuffer>,
        shape: LaunchShape,
    ) -> Result<()> {
        let shape = LaunchShape::cover(shape.global, shape.local.min(MAX_WORK_GROUP));
        let cfg = LaunchConfig {
            grid_dim: (shape.groups(), 1, 1),
            block_dim: (shape.local, 1, 1),
            shared_mem_bytes: 0,
        };
        let params = (
            &args.areas.slice,
            &args.temperatures.slice,
            &mut args.results.slice,
            args.count as i32,
        );
        unsafe { program.clone().launch_on_stream(&queue.stream, cfg, params) }
            .map_err(|e| DeviceError::execution("launch", format!("{:?}", e)))
    }

    fn finish(&self, queue: &mut CudaQueue, timeout: Duration) -> Result<()> {
        let done = EventGuard(
            event::create(sys::CUevent_flags_enum::CU_EVENT_DISABLE_TIMING)
                .map_err(|e| DeviceError::execution("finish", format!("{:?}", e)))?,
        );
        unsafe { event::record(done.0, queue.stream.stream) }
            .map_err(|e| DeviceError::execution("finish", format!("{:?}", e)))?;

        let deadline = Instant::now() + timeout;
        let err = loop {
            match unsafe { sys::lib().cuEventQuery(done.0) } {
                sys::CUresult::CUDA_SUCCESS => return Ok(()),
                sys::CUresult::CUDA_ERROR_NOT_READY => {
                    if Instant::now() >= deadline {
                        break DeviceError::Timeout(timeout);
                    }
                    thread::sleep(POLL_INTERVAL);
                }
                other => break DeviceError::execution("finish", format!("{:?}", other)),
            }
        };

        // Order the caller's buffer frees after the unfinished kernel.
        if let Err(e) = queue.device.wait_for(&queue.stream) {
            tracing::error!("Could not fence abandoned work on {}: {:?}", self.name(), e);
        }
        Err(err)
    }

    fn read_buffer(&self, queue: &mut CudaQueue, buffer: &CudaBuffer, out: &mut [f32]) -> Result<()> {
        if out.len() != buffer.slice.len() {
            return Err(DeviceError::execution(
                "read_buffer",
                format!("{} elements from buffer of {}", out.len(), buffer.slice.len()),
            ));
        }
        queue
            .device
            .dtoh_sync_copy_into(&buffer.slice, out)
            .map_err(|e| DeviceError::execution("read_buffer", format!("{:?}", e)))
    }

    // Dropping a cudarc handle frees it; modules stay loaded until the last
    // reference to the device goes away.
    fn release_buffer(&self, buffer: CudaBuffer) {
        drop(buffer);
    }

    fn release_program(&self, program: CudaFunction) {
        drop(program);
    }

    fn release_queue(&self, queue: CudaQueue) {
        drop(queue);
    }

    fn release_context(&self, context: Arc<CudaDevice>) {
        drop(context);
    }
}
