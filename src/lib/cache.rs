//! # Program Cache
//!
//! Compiles a `KernelSource` against a `DeviceSession` once and hands out the
//! same `CompiledProgram` to every later request.
//!
//! Entries are keyed by `(session id, source name, source version)`. Each key
//! owns a slot with its own lock: the first caller builds while holding it and
//! concurrent callers for the same key block on that lock, then find the
//! finished program. Builds for different keys proceed in parallel.
//!
//! A failed build leaves the slot empty and returns the compiler's diagnostic
//! log in `DeviceError::BuildFailed`; the next call for that key builds again.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

use crate::backend::ComputeBackend;
use crate::error::{DeviceError, Result};
use crate::guard::{DeviceContext, DeviceProgram};
use crate::kernel::KernelSource;
use crate::session::{DeviceSession, SessionId};

/// Identity of a compiled artifact.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProgramKey {
    pub session: SessionId,
    pub name: String,
    pub version: u32,
}

impl ProgramKey {
    pub fn new(session: SessionId, source: &KernelSource) -> Self {
        Self {
            session,
            name: source.name.clone(),
            version: source.version,
        }
    }
}

impl fmt::Display for ProgramKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} v{} @ {}", self.name, self.version, self.session)
    }
}

/// A kernel built for one session. Keeps that session's context alive until
/// the program itself is released.
pub struct CompiledProgram<B: ComputeBackend> {
    key: ProgramKey,
    entry: String,
    program: DeviceProgram<B>,
    _context: Arc<DeviceContext<B>>,
}

impl<B: ComputeBackend> CompiledProgram<B> {
    pub fn key(&self) -> &ProgramKey {
        &self.key
    }

    pub fn session_id(&self) -> SessionId {
        self.key.session
    }

    pub(crate) fn raw(&self) -> &B::Program {
        &self.program
    }
}

impl<B: ComputeBackend> fmt::Debug for CompiledProgram<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledProgram")
            .field("key", &self.key)
            .field("entry", &self.entry)
            .finish()
    }
}

type Slot<B> = Arc<Mutex<Option<Arc<CompiledProgram<B>>>>>;

/// Compiled programs shared across requests.
pub struct ProgramCache<B: ComputeBackend> {
    slots: Mutex<HashMap<ProgramKey, Slot<B>>>,
}

impl<B: ComputeBackend> ProgramCache<B> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Return the program for `(session, source)`, compiling it if needed.
    pub fn get_or_build(
        &self,
        session: &DeviceSession<B>,
        source: &KernelSource,
    ) -> Result<Arc<CompiledProgram<B>>> {
        let key = ProgramKey::new(session.id(), source);
        loop {
            let slot = self.slots.lock().entry(key.clone()).or_default().clone();

            // Held for the whole build: same-key callers wait here.
            let mut entry = slot.lock();
            if !self.is_current(&key, &slot) {
                // Retired while we waited; start over on the live slot.
                continue;
            }
            if let Some(program) = entry.as_ref() {
                debug!("Program cache hit for {}", key);
                return Ok(program.clone());
            }

            let program = match self.build(session, source, &key) {
                Ok(program) => program,
                Err(err) => {
                    self.detach(&key, &slot);
                    return Err(err);
                }
            };
            *entry = Some(program.clone());
            return Ok(program);
        }
    }

    fn build(
        &self,
        session: &DeviceSession<B>,
        source: &KernelSource,
        key: &ProgramKey,
    ) -> Result<Arc<CompiledProgram<B>>> {
        let context = session.context()?;
        let backend = session.backend();
        let started = Instant::now();

        let raw = match backend.build_program(&context, source) {
            Ok(raw) => raw,
            Err(err) => {
                if let DeviceError::BuildFailed { log } = &err {
                    error!("Kernel build failed for {}:\n{}", key, log);
                } else {
                    error!("Kernel build failed for {}: {}", key, err);
                }
                return Err(err);
            }
        };

        info!(
            "Built {} on {} in {:.1} ms",
            key,
            backend.name(),
            started.elapsed().as_secs_f64() * 1000.0
        );
        Ok(Arc::new(CompiledProgram {
            key: key.clone(),
            entry: source.entry.clone(),
            program: DeviceProgram::new(backend.clone(), raw),
            _context: context,
        }))
    }

    /// Cached program for `(session, source)`, without building.
    pub fn get(&self, session: SessionId, source: &KernelSource) -> Option<Arc<CompiledProgram<B>>> {
        let slot = self.slots.lock().get(&ProgramKey::new(session, source))?.clone();
        let entry = slot.try_lock()?;
        entry.clone()
    }

    /// Drop the entry for `(session, source)` so the next request rebuilds.
    /// Waits for a build of that key already in flight.
    pub fn invalidate(&self, session: SessionId, source: &KernelSource) -> bool {
        let key = ProgramKey::new(session, source);
        let Some(slot) = self.slots.lock().get(&key).cloned() else {
            return false;
        };
        let removed = self.retire(&key, &slot);
        if removed {
            debug!("Invalidated {} v{} for {}", source.name, source.version, session);
        }
        removed
    }

    /// Drop every entry built for `session`.
    pub fn evict_session(&self, session: SessionId) -> usize {
        let evicted = self.retire_where(|key| key.session == session);
        if evicted > 0 {
            debug!("Evicted {} program(s) of {}", evicted, session);
        }
        evicted
    }

    /// Number of successfully built programs currently cached. Builds still in
    /// flight are not counted.
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|slot| slot.try_lock().is_some_and(|entry| entry.is_some()))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop everything.
    pub fn clear(&self) {
        self.retire_where(|_| true);
    }

    fn is_current(&self, key: &ProgramKey, slot: &Slot<B>) -> bool {
        self.slots
            .lock()
            .get(key)
            .is_some_and(|live| Arc::ptr_eq(live, slot))
    }

    /// Remove `slot` from the map if it is still the live slot for `key`.
    /// Callers hold the slot's lock; lock order is always slot, then map.
    fn detach(&self, key: &ProgramKey, slot: &Slot<B>) {
        let mut slots = self.slots.lock();
        if slots.get(key).is_some_and(|live| Arc::ptr_eq(live, slot)) {
            slots.remove(key);
        }
    }

    /// Empty and detach a slot, waiting out an in-flight build. Returns whether
    /// a program was dropped.
    fn retire(&self, key: &ProgramKey, slot: &Slot<B>) -> bool {
        let mut entry = slot.lock();
        let dropped = entry.take().is_some();
        self.detach(key, slot);
        dropped
    }

    fn retire_where(&self, pred: impl Fn(&ProgramKey) -> bool) -> usize {
        let doomed: Vec<(ProgramKey, Slot<B>)> = self
            .slots
            .lock()
            .iter()
            .filter(|(key, _)| pred(key))
            .map(|(key, slot)| (key.clone(), slot.clone()))
            .collect();
        doomed
            .iter()
            .filter(|(key, slot)| self.retire(key, slot))
            .count()
    }
}

impl<B: ComputeBackend> Default for ProgramCache<B> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{EmulatedBackend, FaultPlan};
    use crate::config::DevicePreference;
    use crate::kernel::YIELD_KERNEL_TEXT;
    use std::thread;
    use std::time::Duration;

    fn open() -> (Arc<EmulatedBackend>, DeviceSession<EmulatedBackend>) {
        let backend = Arc::new(EmulatedBackend::new());
        let session = DeviceSession::open(backend.clone(), DevicePreference::First).unwrap();
        (backend, session)
    }

    #[test]
    fn test_builds_once_per_key() {
        let (backend, session) = open();
        let cache = ProgramCache::new();
        let source = KernelSource::yield_kernel();

        let a = cache.get_or_build(&session, &source).unwrap();
        let b = cache.get_or_build(&session, &source).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(backend.ledger().builds(), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(a.session_id(), session.id());
    }

    #[test]
    fn test_corrupted_source_returns_log_and_caches_nothing() {
        let (backend, session) = open();
        let cache = ProgramCache::new();
        let corrupted = KernelSource::yield_kernel().revise(&YIELD_KERNEL_TEXT.replace('{', ""));

        let err = cache.get_or_build(&session, &corrupted).unwrap_err();
        match err {
            DeviceError::BuildFailed { log } => assert!(!log.is_empty()),
            other => panic!("expected BuildFailed, got {:?}", other),
        }
        assert!(cache.get(session.id(), &corrupted).is_none());
        assert!(cache.is_empty());
        assert_eq!(backend.ledger().live_programs(), 0);

        // The caller may retry; nothing was cached, so the build runs again.
        assert!(cache.get_or_build(&session, &corrupted).is_err());
        assert_eq!(backend.ledger().builds(), 2);
    }

    #[test]
    fn test_fixed_source_builds_after_failure() {
        let (_backend, session) = open();
        let cache = ProgramCache::new();
        let good = KernelSource::yield_kernel();
        let broken = good.revise("extern \"C\" __global__ void simulate_harvest(");

        assert!(cache.get_or_build(&session, &broken).is_err());
        let fixed = broken.revise(YIELD_KERNEL_TEXT);
        assert!(cache.get_or_build(&session, &fixed).is_ok());
    }

    #[test]
    fn test_concurrent_first_callers_share_one_build() {
        let (backend, session) = open();
        backend.set_faults(FaultPlan {
            build_delay: Some(Duration::from_millis(50)),
            ..Default::default()
        });
        let cache = ProgramCache::new();
        let source = KernelSource::yield_kernel();

        let programs: Vec<_> = thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| s.spawn(|| cache.get_or_build(&session, &source).unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert_eq!(backend.ledger().builds(), 1);
        assert!(programs.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[test]
    fn test_failed_build_leaves_no_slot() {
        let (_backend, session) = open();
        let cache = ProgramCache::new();
        let broken = KernelSource::yield_kernel().revise("");

        assert!(cache.get_or_build(&session, &broken).is_err());
        assert!(cache.slots.lock().is_empty());
    }

    #[test]
    fn test_invalidate_waits_for_in_flight_build() {
        let (backend, session) = open();
        backend.set_faults(FaultPlan {
            build_delay: Some(Duration::from_millis(200)),
            ..Default::default()
        });
        let cache = ProgramCache::new();
        let source = KernelSource::yield_kernel();

        thread::scope(|s| {
            let first = s.spawn(|| cache.get_or_build(&session, &source).unwrap());
            thread::sleep(Duration::from_millis(40));
            let invalidated = s.spawn(|| cache.invalidate(session.id(), &source));
            thread::sleep(Duration::from_millis(40));
            let second = s.spawn(|| cache.get_or_build(&session, &source).unwrap());

            first.join().unwrap();
            assert!(invalidated.join().unwrap());
            second.join().unwrap();
        });

        assert_eq!(backend.ledger().peak_concurrent_builds(), 1);
        assert!(backend.ledger().builds() <= 2);
    }

    #[test]
    fn test_clear_waits_for_in_flight_build() {
        let (backend, session) = open();
        backend.set_faults(FaultPlan {
            build_delay: Some(Duration::from_millis(150)),
            ..Default::default()
        });
        let cache = ProgramCache::new();
        let source = KernelSource::yield_kernel();

        thread::scope(|s| {
            let first = s.spawn(|| cache.get_or_build(&session, &source).unwrap());
            thread::sleep(Duration::from_millis(40));
            cache.clear();
            let second = cache.get_or_build(&session, &source).unwrap();
            assert!(!Arc::ptr_eq(&first.join().unwrap(), &second));
        });

        assert_eq!(backend.ledger().peak_concurrent_builds(), 1);
        assert_eq!(backend.ledger().builds(), 2);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_invalidate_forces_rebuild() {
        let (backend, session) = open();
        let cache = ProgramCache::new();
        let source = KernelSource::yield_kernel();

        drop(cache.get_or_build(&session, &source).unwrap());
        assert!(cache.invalidate(session.id(), &source));
        assert!(!cache.invalidate(session.id(), &source));
        assert_eq!(backend.ledger().live_programs(), 0);

        cache.get_or_build(&session, &source).unwrap();
        assert_eq!(backend.ledger().builds(), 2);
    }

    #[test]
    fn test_programs_are_per_session() {
        let backend = Arc::new(EmulatedBackend::new());
        let first = DeviceSession::open(backend.clone(), DevicePreference::First).unwrap();
        let second = DeviceSession::open(backend.clone(), DevicePreference::First).unwrap();
        let cache = ProgramCache::new();
        let source = KernelSource::yield_kernel();

        let a = cache.get_or_build(&first, &source).unwrap();
        let b = cache.get_or_build(&second, &source).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 2);

        assert_eq!(cache.evict_session(first.id()), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_program_keeps_context_alive_until_released() {
        let (backend, session) = open();
        let cache = ProgramCache::new();
        let program = cache.get_or_build(&session, &KernelSource::yield_kernel()).unwrap();

        cache.clear();
        session.close();
        assert_eq!(backend.ledger().live_queues(), 0);
        assert_eq!(backend.ledger().live_contexts(), 1);

        drop(program);
        assert!(backend.ledger().is_clean());
    }

    #[test]
    fn test_build_on_closed_session_fails() {
        let (_backend, session) = open();
        session.close();
        let cache = ProgramCache::new();
        let err = cache
            .get_or_build(&session, &KernelSource::yield_kernel())
            .unwrap_err();
        assert_eq!(err, DeviceError::SessionClosed);
    }
}
