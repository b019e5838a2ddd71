//! # Batch Simulation Engine
//!
//! Runs the yield kernel over a batch of `(area, temperature)` samples.
//!
//! [`run`] is the single-batch pipeline:
//!
//! ```text
//!   request ──┬─ empty? ──────────────────────────────> []
//!             └─ lease queue (bounded)
//!                 ├─ alloc areas(RO) temps(RO) results(WO)
//!                 ├─ write areas, write temps          (blocking)
//!                 ├─ launch (areas, temps, results, count)
//!                 ├─ finish (bounded)
//!                 ├─ read results                      (blocking)
//!                 └─ buffers released, lease dropped   (every exit path)
//! ```
//!
//! [`SimulationEngine`] is the process-scoped owner of the device session and
//! the program cache. Both are created on first use (or by `warm_up`) and torn
//! down once by `shutdown`, instead of being rebuilt for every request.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::backend::{BufferAccess, ComputeBackend, KernelArgs, LaunchShape};
use crate::cache::{CompiledProgram, ProgramCache};
use crate::config::EngineConfig;
use crate::error::{DeviceError, Result};
use crate::guard::DeviceBuffer;
use crate::kernel::KernelSource;
use crate::model::{YieldRequest, YieldResult};
use crate::session::{DeviceSession, SessionId, SessionState};

/// Run `program` over `request` on `session`.
///
/// Blocks until the results are back in host memory. Either the full result
/// is returned or an error, never a partial result. The three device buffers
/// are released before this returns, whatever the outcome.
pub fn run<B: ComputeBackend>(
    session: &DeviceSession<B>,
    program: &CompiledProgram<B>,
    request: &YieldRequest,
    config: &EngineConfig,
) -> Result<YieldResult> {
    if request.is_empty() {
        return Ok(YieldResult::empty());
    }
    if program.session_id() != session.id() {
        return Err(DeviceError::execution(
            "run",
            format!("program {} does not belong to {}", program.key(), session.id()),
        ));
    }

    let len = request.len();
    // The kernel takes its item count as a signed 32-bit int.
    let count = i32::try_from(len)
        .map(|c| c as u32)
        .map_err(|_| DeviceError::execution("run", format!("batch of {} items is too large", len)))?;

    let started = Instant::now();
    let backend = session.backend();

    // The lease is held until every buffer below has been released.
    let mut lease = session.lease(config.timeout)?;
    let SessionState { queue, context } = &mut *lease;
    let context: &B::Context = context;

    let alloc = |access| -> Result<DeviceBuffer<B>> {
        let raw = backend.create_buffer(context, len, access)?;
        Ok(DeviceBuffer::new(backend.clone(), raw))
    };
    let mut areas = alloc(BufferAccess::ReadOnly)?;
    let mut temperatures = alloc(BufferAccess::ReadOnly)?;
    let mut results = alloc(BufferAccess::WriteOnly)?;

    backend.write_buffer(queue, &mut areas, &request.areas())?;
    backend.write_buffer(queue, &mut temperatures, &request.temperatures())?;

    let args: KernelArgs<'_, B::Buffer> = KernelArgs {
        areas: &*areas,
        temperatures: &*temperatures,
        results: &mut *results,
        count,
    };
    let shape = LaunchShape::cover(count, config.work_group);
    backend.launch(queue, program.raw(), args, shape)?;
    backend.finish(queue, config.timeout)?;

    let mut values = vec![0.0f32; len];
    backend.read_buffer(queue, &results, &mut values)?;

    debug!(
        "Ran {} item(s) in {} group(s) of {} on {} in {:.3} ms",
        len,
        shape.groups(),
        shape.local,
        session.id(),
        started.elapsed().as_secs_f64() * 1000.0
    );
    Ok(YieldResult::new(values))
}

/// Counters over the engine's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    /// Non-empty requests submitted
    pub requests: u64,
    /// Samples in successful requests
    pub items: u64,
    /// Requests that ended in an error
    pub failures: u64,
}

/// Process-scoped simulation service over one backend.
pub struct SimulationEngine<B: ComputeBackend> {
    backend: Arc<B>,
    config: EngineConfig,
    source: KernelSource,
    session: Mutex<Option<Arc<DeviceSession<B>>>>,
    cache: ProgramCache<B>,
    shut_down: AtomicBool,
    requests: AtomicU64,
    items: AtomicU64,
    failures: AtomicU64,
}

impl<B: ComputeBackend> SimulationEngine<B> {
    /// Create an engine. No device work happens until the first request or
    /// [`Self::warm_up`].
    pub fn new(backend: Arc<B>, config: EngineConfig) -> Self {
        Self {
            backend,
            config,
            source: KernelSource::yield_kernel(),
            session: Mutex::new(None),
            cache: ProgramCache::new(),
            shut_down: AtomicBool::new(false),
            requests: AtomicU64::new(0),
            items: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Use a different kernel source.
    pub fn with_source(mut self, source: KernelSource) -> Self {
        self.source = source;
        self
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn source(&self) -> &KernelSource {
        &self.source
    }

    pub fn cache(&self) -> &ProgramCache<B> {
        &self.cache
    }

    /// Id of the open session, if one has been opened.
    pub fn session_id(&self) -> Option<SessionId> {
        self.session.lock().as_ref().map(|s| s.id())
    }

    /// Open the session and build the kernel now rather than on first use.
    pub fn warm_up(&self) -> Result<()> {
        let session = self.session()?;
        self.cache.get_or_build(&session, &self.source)?;
        Ok(())
    }

    /// Estimate yields for every sample in `request`.
    pub fn simulate(&self, request: &YieldRequest) -> Result<YieldResult> {
        if request.is_empty() {
            return Ok(YieldResult::empty());
        }
        self.requests.fetch_add(1, Ordering::Relaxed);

        let outcome = self.session().and_then(|session| {
            let program = self.cache.get_or_build(&session, &self.source)?;
            run(&session, &program, request, &self.config)
        });

        match &outcome {
            Ok(_) => {
                self.items.fetch_add(request.len() as u64, Ordering::Relaxed);
            }
            Err(err) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!("Simulation of {} item(s) failed: {}", request.len(), err);
            }
        }
        outcome
    }

    /// Estimate the yield of a single sample.
    pub fn simulate_one(&self, area: f32, temperature: f32) -> Result<f32> {
        self.simulate(&YieldRequest::single(area, temperature))?
            .get(0)
            .ok_or_else(|| DeviceError::execution("simulate_one", "empty result"))
    }

    /// Drop every cached program and close the session. Runs once; later
    /// calls, and every later request, see a closed engine.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let session = self.session.lock().take();
        if let Some(session) = session {
            let evicted = self.cache.evict_session(session.id());
            session.close();
            info!(
                "Engine shut down ({}, {} program(s) evicted)",
                session.id(),
                evicted
            );
        }
        self.cache.clear();
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            requests: self.requests.load(Ordering::Relaxed),
            items: self.items.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }

    /// The shared session, opened on first use. A failed open is not
    /// remembered; the next call tries again.
    fn session(&self) -> Result<Arc<DeviceSession<B>>> {
        let mut slot = self.session.lock();
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(DeviceError::SessionClosed);
        }
        if let Some(session) = slot.as_ref() {
            return Ok(session.clone());
        }
        let session = Arc::new(DeviceSession::open(self.backend.clone(), self.config.device)?);
        *slot = Some(session.clone());
        Ok(session)
    }
}

impl<B: ComputeBackend> Drop for SimulationEngine<B> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
