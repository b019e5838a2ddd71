//! # Device Session
//!
//! A `DeviceSession` owns one device's execution context and its in-order
//! command queue for the lifetime of the process. It is opened once, shared by
//! every simulation request, and closed exactly once.
//!
//! The queue sits behind a mutex. A request holds that lock for as long as its
//! device buffers live, so submissions from concurrent requests are linearized
//! and buffers are never shared between them. Lock acquisition is bounded by a
//! timeout so a wedged device cannot block callers forever.

use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::backend::{ComputeBackend, DeviceInfo, PlatformInfo};
use crate::config::DevicePreference;
use crate::error::{DeviceError, Result};
use crate::guard::{DeviceContext, DeviceQueue};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a session. Never reused.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct SessionId(u64);

impl SessionId {
    fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

/// Live device state. Field order matters: the queue is released before the
/// session's reference to the context.
pub(crate) struct SessionState<B: ComputeBackend> {
    pub(crate) queue: DeviceQueue<B>,
    pub(crate) context: Arc<DeviceContext<B>>,
}

/// Exclusive access to an open session's queue and context.
pub(crate) type SessionLease<'a, B> = MappedMutexGuard<'a, SessionState<B>>;

/// An open context and command queue on one device.
pub struct DeviceSession<B: ComputeBackend> {
    id: SessionId,
    backend: Arc<B>,
    platform: PlatformInfo,
    device: DeviceInfo,
    state: Mutex<Option<SessionState<B>>>,
}

impl<B: ComputeBackend> DeviceSession<B> {
    /// Discover devices, select one according to `preference`, and create a
    /// context plus an in-order queue on it.
    pub fn open(backend: Arc<B>, preference: DevicePreference) -> Result<Self> {
        let (platform, device) = select_device(backend.as_ref(), preference)?;

        let context = DeviceContext::new(backend.clone(), backend.create_context(&device)?);
        // A queue failure drops `context`, releasing it before we return.
        let queue = DeviceQueue::new(backend.clone(), backend.create_queue(&context)?);

        let id = SessionId::next();
        info!(
            "Opened {} on {} device '{}' (platform '{}', {}:{})",
            id,
            backend.name(),
            device.name,
            platform.name,
            device.platform,
            device.index
        );

        Ok(Self {
            id,
            backend,
            platform,
            device,
            state: Mutex::new(Some(SessionState {
                queue,
                context: Arc::new(context),
            })),
        })
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    pub fn platform(&self) -> &PlatformInfo {
        &self.platform
    }

    pub fn device(&self) -> &DeviceInfo {
        &self.device
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().is_some()
    }

    /// Release the queue and this session's hold on the context. Closing an
    /// already closed session does nothing.
    pub fn close(&self) {
        let state = self.state.lock().take();
        match state {
            Some(state) => {
                drop(state);
                info!("Closed {}", self.id);
            }
            None => debug!("{} already closed", self.id),
        }
    }

    /// Shared handle to the context, for work that does not touch the queue
    /// (program builds).
    pub(crate) fn context(&self) -> Result<Arc<DeviceContext<B>>> {
        self.state
            .lock()
            .as_ref()
            .map(|state| state.context.clone())
            .ok_or(DeviceError::SessionClosed)
    }

    /// Lock the queue, waiting at most `timeout`.
    pub(crate) fn lease(&self, timeout: Duration) -> Result<SessionLease<'_, B>> {
        let guard = self
            .state
            .try_lock_for(timeout)
            .ok_or(DeviceError::Timeout(timeout))?;
        MutexGuard::try_map(guard, |state| state.as_mut()).map_err(|_| DeviceError::SessionClosed)
    }
}

impl<B: ComputeBackend> Drop for DeviceSession<B> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<B: ComputeBackend> fmt::Debug for DeviceSession<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("id", &self.id)
            .field("backend", &self.backend.name())
            .field("device", &self.device)
            .finish()
    }
}

/// Pick a device following `preference`. Deterministic for a given
/// discovery order; see [`crate::config`] for the policy table.
pub fn select_device<B: ComputeBackend>(
    backend: &B,
    preference: DevicePreference,
) -> Result<(PlatformInfo, DeviceInfo)> {
    let platforms = backend.platforms()?;
    if platforms.is_empty() {
        return Err(DeviceError::NoPlatform);
    }

    match preference {
        DevicePreference::First => {
            for (i, platform) in platforms.iter().enumerate() {
                if let Some(device) = backend.devices(i)?.into_iter().next() {
                    return Ok((platform.clone(), device));
                }
            }
            Err(DeviceError::NoDevice)
        }
        DevicePreference::Index { platform, device } => {
            let info = platforms.get(platform).ok_or(DeviceError::NoPlatform)?;
            let device = backend
                .devices(platform)?
                .into_iter()
                .nth(device)
                .ok_or(DeviceError::NoDevice)?;
            Ok((info.clone(), device))
        }
        DevicePreference::Kind(kind) => {
            for (i, platform) in platforms.iter().enumerate() {
                if let Some(device) = backend.devices(i)?.into_iter().find(|d| d.kind == kind) {
                    return Ok((platform.clone(), device));
                }
            }
            Err(DeviceError::NoDevice)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DeviceKind, EmulatedBackend, FaultPlan};

    fn two_platforms() -> EmulatedBackend {
        EmulatedBackend::empty()
            .with_platform("empty", &[])
            .with_platform("mixed", &[("cpu0", DeviceKind::Cpu), ("gpu0", DeviceKind::Gpu)])
            .with_platform("accel", &[("npu0", DeviceKind::Accelerator)])
    }

    #[test]
    fn test_first_skips_platforms_without_devices() {
        let (platform, device) = select_device(&two_platforms(), DevicePreference::First).unwrap();
        assert_eq!(platform.name, "mixed");
        assert_eq!(device.name, "cpu0");
        assert_eq!((device.platform, device.index), (1, 0));
    }

    #[test]
    fn test_select_by_kind_and_index() {
        let backend = two_platforms();

        let (_, gpu) = select_device(&backend, DevicePreference::Kind(DeviceKind::Gpu)).unwrap();
        assert_eq!(gpu.name, "gpu0");

        let (_, npu) = select_device(
            &backend,
            DevicePreference::Index {
                platform: 2,
                device: 0,
            },
        )
        .unwrap();
        assert_eq!(npu.kind, DeviceKind::Accelerator);

        let missing = select_device(
            &backend,
            DevicePreference::Index {
                platform: 1,
                device: 5,
            },
        );
        assert_eq!(missing.unwrap_err(), DeviceError::NoDevice);

        let no_platform = select_device(
            &backend,
            DevicePreference::Index {
                platform: 9,
                device: 0,
            },
        );
        assert_eq!(no_platform.unwrap_err(), DeviceError::NoPlatform);
    }

    #[test]
    fn test_open_reports_discovery_failures() {
        let backend = Arc::new(EmulatedBackend::new());

        backend.set_faults(FaultPlan {
            no_platforms: true,
            ..Default::default()
        });
        let err = DeviceSession::open(backend.clone(), DevicePreference::First).unwrap_err();
        assert_eq!(err, DeviceError::NoPlatform);

        backend.set_faults(FaultPlan {
            no_devices: true,
            ..Default::default()
        });
        let err = DeviceSession::open(backend.clone(), DevicePreference::First).unwrap_err();
        assert_eq!(err, DeviceError::NoDevice);

        backend.set_faults(FaultPlan {
            fail_context: true,
            ..Default::default()
        });
        let err = DeviceSession::open(backend.clone(), DevicePreference::First).unwrap_err();
        assert!(matches!(err, DeviceError::ContextCreationFailed(_)));
        assert!(backend.ledger().is_clean());
    }

    #[test]
    fn test_queue_failure_releases_context() {
        let backend = Arc::new(EmulatedBackend::new());
        backend.set_faults(FaultPlan {
            fail_queue: true,
            ..Default::default()
        });

        let err = DeviceSession::open(backend.clone(), DevicePreference::First).unwrap_err();
        assert!(matches!(err, DeviceError::ContextCreationFailed(_)));
        assert_eq!(backend.ledger().live_contexts(), 0);
        assert!(backend.ledger().is_clean());
    }

    #[test]
    fn test_close_is_idempotent() {
        let backend = Arc::new(EmulatedBackend::new());
        let session = DeviceSession::open(backend.clone(), DevicePreference::First).unwrap();
        assert!(session.is_open());
        assert_eq!(backend.ledger().live_contexts(), 1);
        assert_eq!(backend.ledger().live_queues(), 1);

        session.close();
        session.close();
        assert!(!session.is_open());
        assert!(backend.ledger().is_clean());

        assert_eq!(session.context().unwrap_err(), DeviceError::SessionClosed);
        assert_eq!(
            session.lease(Duration::from_millis(10)).err(),
            Some(DeviceError::SessionClosed)
        );

        drop(session);
        assert!(backend.ledger().is_clean());
    }

    #[test]
    fn test_sessions_get_distinct_ids() {
        let backend = Arc::new(EmulatedBackend::new());
        let a = DeviceSession::open(backend.clone(), DevicePreference::First).unwrap();
        let b = DeviceSession::open(backend.clone(), DevicePreference::First).unwrap();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_lease_times_out_while_held() {
        let backend = Arc::new(EmulatedBackend::new());
        let session = DeviceSession::open(backend, DevicePreference::First).unwrap();
        let timeout = Duration::from_millis(20);

        let held = session.lease(timeout).unwrap();
        assert_eq!(session.lease(timeout).err(), Some(DeviceError::Timeout(timeout)));
        drop(held);
        assert!(session.lease(timeout).is_ok());
    }
}
