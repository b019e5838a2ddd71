//! # Emulated Backend
//!
//! A host-side stand-in for a real accelerator. Every handle it hands out is
//! recorded in a [`ResourceLedger`], so tests can assert that no context,
//! queue, program or buffer outlives its owner and that nothing is released
//! twice.
//!
//! "Compilation" runs a small front-end over the program text (non-empty,
//! balanced delimiters, a `__global__` entry point with four parameters) and
//! binds the entry point to a host implementation. Launches then execute lane
//! by lane on the calling thread. The arithmetic in the text is not
//! interpreted: a bound entry point always runs [`estimate_yield`].
//!
//! Faults can be injected through [`FaultPlan`] to drive every error path of
//! the engine.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use super::{
    BufferAccess, ComputeBackend, DeviceInfo, DeviceKind, KernelArgs, LaunchShape, PlatformInfo,
};
use crate::error::{DeviceError, Result};
use crate::kernel::{estimate_yield, KernelSource, YIELD_KERNEL_ENTRY};

/// Parameters the yield kernel's entry point must declare.
const KERNEL_ARITY: usize = 4;

/// Kind of a tracked handle.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Context,
    Queue,
    Program,
    Buffer,
}

/// Live-handle accounting for the emulated device.
#[derive(Debug, Default)]
pub struct ResourceLedger {
    next_id: AtomicU64,
    live: Mutex<HashMap<u64, ResourceKind>>,
    double_releases: AtomicUsize,
    builds: AtomicUsize,
    building: AtomicUsize,
    peak_building: AtomicUsize,
    launches: AtomicUsize,
    buffers_allocated: AtomicUsize,
}

impl ResourceLedger {
    fn acquire(&self, kind: ResourceKind) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.live.lock().insert(id, kind);
        if kind == ResourceKind::Buffer {
            self.buffers_allocated.fetch_add(1, Ordering::Relaxed);
        }
        id
    }

    fn release(&self, kind: ResourceKind, id: u64) {
        match self.live.lock().remove(&id) {
            Some(k) if k == kind => {}
            _ => {
                tracing::error!("Emulated {:?} #{} released twice or never acquired", kind, id);
                self.double_releases.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Outstanding handles of one kind
    pub fn live(&self, kind: ResourceKind) -> usize {
        self.live.lock().values().filter(|k| **k == kind).count()
    }

    pub fn live_contexts(&self) -> usize {
        self.live(ResourceKind::Context)
    }

    pub fn live_queues(&self) -> usize {
        self.live(ResourceKind::Queue)
    }

    pub fn live_programs(&self) -> usize {
        self.live(ResourceKind::Program)
    }

    pub fn live_buffers(&self) -> usize {
        self.live(ResourceKind::Buffer)
    }

    /// Releases of handles that were not live
    pub fn double_releases(&self) -> usize {
        self.double_releases.load(Ordering::Relaxed)
    }

    /// Compilations attempted, successful or not
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::Relaxed)
    }

    /// Most builds ever running at the same time
    pub fn peak_concurrent_builds(&self) -> usize {
        self.peak_building.load(Ordering::SeqCst)
    }

    /// Kernel launches accepted
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::Relaxed)
    }

    /// Buffers ever allocated
    pub fn buffers_allocated(&self) -> usize {
        self.buffers_allocated.load(Ordering::Relaxed)
    }

    /// Nothing outstanding and nothing released twice
    pub fn is_clean(&self) -> bool {
        self.live.lock().is_empty() && self.double_releases() == 0
    }
}

/// Faults to inject into the emulated device.
#[derive(Clone, Debug, Default)]
pub struct FaultPlan {
    /// Discovery reports no platforms
    pub no_platforms: bool,
    /// Discovery reports platforms without devices
    pub no_devices: bool,
    pub fail_context: bool,
    pub fail_queue: bool,
    pub fail_write: bool,
    pub fail_launch: bool,
    pub fail_read: bool,
    /// Launched work does not complete until this is cleared
    pub stall_queue: bool,
    /// Extra time spent inside every build
    pub build_delay: Option<Duration>,
}

/// Host implementation bound to a compiled entry point.
type HostKernel = fn(&[f32], &[f32], &mut [f32], u32, LaunchShape);

fn harvest_lanes(
    areas: &[f32],
    temperatures: &[f32],
    results: &mut [f32],
    count: u32,
    shape: LaunchShape,
) {
    for lane in 0..shape.padded() as usize {
        if lane < count as usize {
            results[lane] = estimate_yield(areas[lane], temperatures[lane]);
        }
    }
}

fn host_kernel(entry: &str) -> Option<HostKernel> {
    match entry {
        YIELD_KERNEL_ENTRY => Some(harvest_lanes as HostKernel),
        _ => None,
    }
}

pub struct EmuContext {
    id: u64,
    device: DeviceInfo,
}

pub struct EmuQueue {
    id: u64,
    stalled: bool,
}

pub struct EmuProgram {
    id: u64,
    entry: String,
    kernel: HostKernel,
}

pub struct EmuBuffer {
    id: u64,
    access: BufferAccess,
    data: Vec<f32>,
}

/// Host-side device with resource accounting.
pub struct EmulatedBackend {
    topology: Vec<(PlatformInfo, Vec<(String, DeviceKind)>)>,
    ledger: Arc<ResourceLedger>,
    faults: Mutex<FaultPlan>,
}

impl EmulatedBackend {
    /// One platform with a single CPU device.
    pub fn new() -> Self {
        Self::empty().with_platform("Host Emulation", &[("Emulated Lanes", DeviceKind::Cpu)])
    }

    /// A backend with no platforms; add them with [`Self::with_platform`].
    pub fn empty() -> Self {
        Self {
            topology: Vec::new(),
            ledger: Arc::new(ResourceLedger::default()),
            faults: Mutex::new(FaultPlan::default()),
        }
    }

    /// Append a platform with the given devices.
    pub fn with_platform(mut self, name: &str, devices: &[(&str, DeviceKind)]) -> Self {
        let platform = PlatformInfo {
            name: name.to_string(),
            vendor: "cropsim".to_string(),
        };
        let devices = devices
            .iter()
            .map(|(n, k)| (n.to_string(), *k))
            .collect();
        self.topology.push((platform, devices));
        self
    }

    pub fn ledger(&self) -> Arc<ResourceLedger> {
        self.ledger.clone()
    }

    pub fn set_faults(&self, plan: FaultPlan) {
        *self.faults.lock() = plan;
    }

    pub fn clear_faults(&self) {
        self.set_faults(FaultPlan::default());
    }

    fn faults(&self) -> FaultPlan {
        self.faults.lock().clone()
    }
}

impl Default for EmulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ComputeBackend for EmulatedBackend {
    type Context = EmuContext;
    type Queue = EmuQueue;
    type Program = EmuProgram;
    type Buffer = EmuBuffer;

    fn name(&self) -> &'static str {
        "emulated"
    }

    fn platforms(&self) -> Result<Vec<PlatformInfo>> {
        if self.faults().no_platforms {
            return Ok(Vec::new());
        }
        Ok(self.topology.iter().map(|(p, _)| p.clone()).collect())
    }

    fn devices(&self, platform: usize) -> Result<Vec<DeviceInfo>> {
        if self.faults().no_devices {
            return Ok(Vec::new());
        }
        let Some((_, devices)) = self.topology.get(platform) else {
            return Ok(Vec::new());
        };
        Ok(devices
            .iter()
            .enumerate()
            .map(|(index, (name, kind))| DeviceInfo {
                name: name.clone(),
                kind: *kind,
                platform,
                index,
            })
            .collect())
    }

    fn create_context(&self, device: &DeviceInfo) -> Result<EmuContext> {
        if self.faults().fail_context {
            return Err(DeviceError::ContextCreationFailed(format!(
                "injected failure on {}",
                device.name
            )));
        }
        Ok(EmuContext {
            id: self.ledger.acquire(ResourceKind::Context),
            device: device.clone(),
        })
    }

    fn create_queue(&self, context: &EmuContext) -> Result<EmuQueue> {
        if self.faults().fail_queue {
            return Err(DeviceError::ContextCreationFailed(format!(
                "injected queue failure on {}",
                context.device.name
            )));
        }
        Ok(EmuQueue {
            id: self.ledger.acquire(ResourceKind::Queue),
            stalled: false,
        })
    }

    fn build_program(&self, _context: &EmuContext, source: &KernelSource) -> Result<EmuProgram> {
        self.ledger.builds.fetch_add(1, Ordering::Relaxed);
        let in_flight = self.ledger.building.fetch_add(1, Ordering::SeqCst) + 1;
        self.ledger.peak_building.fetch_max(in_flight, Ordering::SeqCst);
        if let Some(delay) = self.faults().build_delay {
            thread::sleep(delay);
        }
        let checked = front_end(source);
        self.ledger.building.fetch_sub(1, Ordering::SeqCst);

        let kernel = checked.map_err(|log| DeviceError::BuildFailed { log })?;
        Ok(EmuProgram {
            id: self.ledger.acquire(ResourceKind::Program),
            entry: source.entry.clone(),
            kernel,
        })
    }

    fn create_buffer(&self, _context: &EmuContext, len: usize, access: BufferAccess) -> Result<EmuBuffer> {
        if len == 0 {
            return Err(DeviceError::execution("create_buffer", "zero-sized buffer"));
        }
        Ok(EmuBuffer {
            id: self.ledger.acquire(ResourceKind::Buffer),
            access,
            data: vec![0.0; len],
        })
    }

    fn write_buffer(&self, _queue: &mut EmuQueue, buffer: &mut EmuBuffer, data: &[f32]) -> Result<()> {
        if self.faults().fail_write {
            return Err(DeviceError::execution("write_buffer", "injected transfer failure"));
        }
        if data.len() > buffer.data.len() {
            return Err(DeviceError::execution(
                "write_buffer",
                format!("{} elements into buffer of {}", data.len(), buffer.data.len()),
            ));
        }
        buffer.data[..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn launch(
        &self,
        queue: &mut EmuQueue,
        program: &EmuProgram,
        args: KernelArgs<'_, EmuBuffer>,
        shape: LaunchShape,
    ) -> Result<()> {
        if self.faults().fail_launch {
            return Err(DeviceError::execution("launch", "injected launch failure"));
        }

        let count = args.count as usize;
        for (position, buffer, access) in [
            (0, &*args.areas, BufferAccess::ReadOnly),
            (1, &*args.temperatures, BufferAccess::ReadOnly),
            (2, &*args.results, BufferAccess::WriteOnly),
        ] {
            if buffer.access != access {
                return Err(DeviceError::execution(
                    "launch",
                    format!("argument {} of {} has access {:?}", position, program.entry, buffer.access),
                ));
            }
            if buffer.data.len() < count {
                return Err(DeviceError::execution(
                    "launch",
                    format!("argument {} holds {} elements, count is {}", position, buffer.data.len(), count),
                ));
            }
        }
        if shape.global as usize != count {
            return Err(DeviceError::execution(
                "launch",
                format!("global size {} does not match count {}", shape.global, count),
            ));
        }

        self.ledger.launches.fetch_add(1, Ordering::Relaxed);
        if self.faults().stall_queue {
            queue.stalled = true;
            return Ok(());
        }

        (program.kernel)(
            &args.areas.data,
            &args.temperatures.data,
            &mut args.results.data,
            args.count,
            shape,
        );
        Ok(())
    }

    fn finish(&self, queue: &mut EmuQueue, timeout: Duration) -> Result<()> {
        if queue.stalled {
            if !self.faults().stall_queue {
                // Fault lifted: the held-back work drains.
                queue.stalled = false;
                return Ok(());
            }
            thread::sleep(timeout);
            return Err(DeviceError::Timeout(timeout));
        }
        Ok(())
    }

    fn read_buffer(&self, _queue: &mut EmuQueue, buffer: &EmuBuffer, out: &mut [f32]) -> Result<()> {
        if self.faults().fail_read {
            return Err(DeviceError::execution("read_buffer", "injected transfer failure"));
        }
        if out.len() > buffer.data.len() {
            return Err(DeviceError::execution(
                "read_buffer",
                format!("{} elements from buffer of {}", out.len(), buffer.data.len()),
            ));
        }
        out.copy_from_slice(&buffer.data[..out.len()]);
        Ok(())
    }

    fn release_buffer(&self, buffer: EmuBuffer) {
        self.ledger.release(ResourceKind::Buffer, buffer.id);
    }

    fn release_program(&self, program: EmuProgram) {
        self.ledger.release(ResourceKind::Program, program.id);
    }

    fn release_queue(&self, queue: EmuQueue) {
        self.ledger.release(ResourceKind::Queue, queue.id);
    }

    fn release_context(&self, context: EmuContext) {
        self.ledger.release(ResourceKind::Context, context.id);
    }
}

/// Validate program text and bind its entry point. Errors are returned as a
/// compiler-style diagnostic log.
fn front_end(source: &KernelSource) -> std::result::Result<HostKernel, String> {
    let file = format!("{}.cu", source.module_name());

    if source.text.trim().is_empty() {
        return Err(format!("{}: error: program text is empty", file));
    }

    check_delimiters(&source.text).map_err(|(line, msg)| format!("{}({}): error: {}", file, line, msg))?;

    let arity = entry_arity(&source.text, &source.entry).ok_or_else(|| {
        format!(
            "{}: error: no __global__ function named \"{}\" found",
            file, source.entry
        )
    })?;
    if arity != KERNEL_ARITY {
        return Err(format!(
            "{}: error: \"{}\" declares {} parameters, expected {}",
            file, source.entry, arity, KERNEL_ARITY
        ));
    }

    host_kernel(&source.entry).ok_or_else(|| {
        format!(
            "{}: error: entry point \"{}\" has no host implementation",
            file, source.entry
        )
    })
}

fn check_delimiters(text: &str) -> std::result::Result<(), (usize, String)> {
    let mut stack: Vec<(char, usize)> = Vec::new();
    let mut line = 1;
    for c in text.chars() {
        match c {
            '\n' => line += 1,
            '(' | '{' | '[' => stack.push((c, line)),
            ')' | '}' | ']' => {
                let expected = match c {
                    ')' => '(',
                    '}' => '{',
                    _ => '[',
                };
                match stack.pop() {
                    Some((open, _)) if open == expected => {}
                    Some((open, opened_at)) => {
                        return Err((
                            line,
                            format!("'{}' does not close '{}' opened on line {}", c, open, opened_at),
                        ))
                    }
                    None => return Err((line, format!("unexpected '{}'", c))),
                }
            }
            _ => {}
        }
    }
    match stack.pop() {
        Some((open, opened_at)) => Err((line, format!("'{}' opened on line {} is never closed", open, opened_at))),
        None => Ok(()),
    }
}

/// Parameter count of `__global__ ... entry(...)`, if declared.
fn entry_arity(text: &str, entry: &str) -> Option<usize> {
    let global = text.find("__global__")?;
    let rest = &text[global..];
    let name_at = rest.find(entry)?;
    let after_name = rest[name_at + entry.len()..].trim_start();
    let params = after_name.strip_prefix('(')?;
    let close = params.find(')')?;
    let params = params[..close].trim();
    if params.is_empty() || params == "void" {
        return Some(0);
    }
    Some(params.split(',').count())
}
