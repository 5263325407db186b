//! Incoming socket manager: connection registry, idle sweep, admission.
//!
//! Each accepted socket registers a [`ConnectionHandle`]; the drive loop
//! owning the socket updates its in-progress flag and idle deadline, and
//! the sweeper closes handles that sat idle past their deadline. The
//! sweep piggybacks on connection arrival instead of running on a timer.

use crate::config::{ConnectionPolicy, IDLE_SWEEP_INTERVAL};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, RwLock,
    },
    time::Instant,
};
use tokio::sync::Notify;
use tracing::debug;

/// Wire form of the admission rejection.
pub(crate) const SERVICE_UNAVAILABLE: &[u8] =
    b"HTTP/1.1 503 Service Unavailable\r\nConnection: Close\r\nContent-Length: 0\r\n\r\n";

/// Manager-side state of one accepted socket. The socket itself is owned
/// by the drive loop; the handle only carries scheduling state and the
/// shutdown signal.
pub(crate) struct ConnectionHandle {
    id: u64,
    pub(crate) remote: String,
    in_progress: AtomicBool,
    idle_deadline: Mutex<Instant>,
    shutdown: Notify,
}

impl ConnectionHandle {
    fn new(id: u64, remote: String) -> Self {
        ConnectionHandle {
            id,
            remote,
            in_progress: AtomicBool::new(true),
            idle_deadline: Mutex::new(Instant::now()),
            shutdown: Notify::new(),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn set_in_progress(&self, in_progress: bool) {
        self.in_progress.store(in_progress, Ordering::Release);
    }

    pub(crate) fn set_idle_deadline(&self, deadline: Instant) {
        *self.idle_deadline.lock().unwrap() = deadline;
    }

    /// Resolves when the manager wants this connection closed.
    pub(crate) async fn closed(&self) {
        self.shutdown.notified().await;
    }

    pub(crate) fn close(&self) {
        // notify_one stores a permit, so a close before the drive loop
        // reaches its select is not lost.
        self.shutdown.notify_one();
    }

    fn idle_expired(&self, now: Instant) -> bool {
        !self.in_progress.load(Ordering::Acquire) && *self.idle_deadline.lock().unwrap() < now
    }
}

pub(crate) struct ConnectionManager {
    handles: RwLock<HashMap<u64, Arc<ConnectionHandle>>>,
    next_id: AtomicU64,
    policy: ConnectionPolicy,
    last_sweep: Mutex<Instant>,
}

impl ConnectionManager {
    pub(crate) fn new(policy: ConnectionPolicy) -> Self {
        ConnectionManager {
            handles: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            policy,
            last_sweep: Mutex::new(Instant::now()),
        }
    }

    /// Registers a newly accepted socket and returns its handle.
    pub(crate) fn register(&self, remote: String) -> Arc<ConnectionHandle> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let handle = Arc::new(ConnectionHandle::new(id, remote));
        self.handles.write().unwrap().insert(id, handle.clone());
        handle
    }

    /// Drops a handle after its drive loop has finished.
    pub(crate) fn release(&self, id: u64) {
        self.handles.write().unwrap().remove(&id);
    }

    pub(crate) fn count(&self) -> usize {
        self.handles.read().unwrap().len()
    }

    /// Admission check for a new connection. Runs the periodic sweep, and
    /// an eager one when the connection limit appears reached.
    pub(crate) fn admit(&self) -> bool {
        self.sweep(false);
        let Some(limit) = self.policy.max_connections else {
            return true;
        };
        if self.count() < limit {
            return true;
        }
        self.sweep(true);
        self.count() < limit
    }

    /// Closes idle handles past their deadline. Unless `force`, runs at
    /// most once per sweep interval. Never touches in-progress handles.
    fn sweep(&self, force: bool) {
        let now = Instant::now();
        {
            let mut last = self.last_sweep.lock().unwrap();
            if !force && now.duration_since(*last) < IDLE_SWEEP_INTERVAL {
                return;
            }
            *last = now;
        }

        let expired: Vec<Arc<ConnectionHandle>> = {
            let handles = self.handles.read().unwrap();
            handles
                .values()
                .filter(|h| h.idle_expired(now))
                .cloned()
                .collect()
        };
        if expired.is_empty() {
            return;
        }

        let mut handles = self.handles.write().unwrap();
        for handle in expired {
            debug!(remote = %handle.remote, "closing idle connection");
            handle.close();
            handles.remove(&handle.id);
        }
    }

    /// Closes every live handle; used by server shutdown.
    pub(crate) fn close_all(&self) {
        let mut handles = self.handles.write().unwrap();
        for handle in handles.values() {
            handle.close();
        }
        handles.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn manager(limit: Option<usize>) -> ConnectionManager {
        ConnectionManager::new(ConnectionPolicy {
            max_connections: limit,
        })
    }

    #[test]
    fn register_and_release() {
        let manager = manager(None);
        let a = manager.register("1.1.1.1:1".into());
        let b = manager.register("2.2.2.2:2".into());
        assert_eq!(manager.count(), 2);
        assert_ne!(a.id(), b.id());

        manager.release(a.id());
        assert_eq!(manager.count(), 1);
    }

    #[test]
    fn admission_without_limit_always_passes() {
        let manager = manager(None);
        for _ in 0..100 {
            manager.register("x:0".into());
        }
        assert!(manager.admit());
    }

    #[test]
    fn eager_sweep_frees_idle_slots() {
        let manager = manager(Some(1));
        let handle = manager.register("x:0".into());
        handle.set_in_progress(false);
        handle.set_idle_deadline(Instant::now() - Duration::from_secs(1));

        assert!(manager.admit());
        assert_eq!(manager.count(), 0);
    }

    #[test]
    fn sweep_never_touches_in_progress_handles() {
        let manager = manager(Some(1));
        let handle = manager.register("x:0".into());
        // In progress with an expired deadline: must survive the sweep.
        handle.set_idle_deadline(Instant::now() - Duration::from_secs(1));

        assert!(!manager.admit());
        assert_eq!(manager.count(), 1);
    }

    #[tokio::test]
    async fn close_signal_is_not_lost() {
        let manager = manager(None);
        let handle = manager.register("x:0".into());
        handle.close();
        // Permit stored before anyone waited.
        handle.closed().await;
    }

    #[test]
    fn close_all_empties_the_registry() {
        let manager = manager(None);
        manager.register("a:0".into());
        manager.register("b:0".into());
        manager.close_all();
        assert_eq!(manager.count(), 0);
    }
}
