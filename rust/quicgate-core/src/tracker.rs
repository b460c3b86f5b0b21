//! Live session tracking
//!
//! Every SOCKS5 session registers here for its lifetime, carrying its
//! target, how it was routed and live byte counters. Embedders poll the
//! tracker for the connection list a status UI shows.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;

static SESSION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// How a session's traffic leaves the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EgressKind {
    Direct,
    Tunnel,
    UdpAssociate,
}

impl EgressKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Tunnel => "tunnel",
            Self::UdpAssociate => "udp-associate",
        }
    }
}

/// One live session.
#[derive(Debug)]
pub struct TrackedSession {
    pub id: u64,
    pub target: String,
    pub egress: EgressKind,
    pub started: Instant,
    upload_bytes: AtomicU64,
    download_bytes: AtomicU64,
}

impl TrackedSession {
    fn new(target: String, egress: EgressKind) -> Self {
        Self {
            id: SESSION_ID_COUNTER.fetch_add(1, Ordering::Relaxed),
            target,
            egress,
            started: Instant::now(),
            upload_bytes: AtomicU64::new(0),
            download_bytes: AtomicU64::new(0),
        }
    }

    /// Counter for application-to-remote bytes; fed live by the copy loop.
    pub fn upload_counter(&self) -> &AtomicU64 {
        &self.upload_bytes
    }

    /// Counter for remote-to-application bytes.
    pub fn download_counter(&self) -> &AtomicU64 {
        &self.download_bytes
    }

    pub fn upload(&self) -> u64 {
        self.upload_bytes.load(Ordering::Relaxed)
    }

    pub fn download(&self) -> u64 {
        self.download_bytes.load(Ordering::Relaxed)
    }
}

/// Registry of live sessions plus lifetime totals.
#[derive(Default)]
pub struct SessionTracker {
    sessions: DashMap<u64, Arc<TrackedSession>>,
    total_sessions: AtomicU64,
    total_upload: AtomicU64,
    total_download: AtomicU64,
}

/// Removes the session from the registry on drop and rolls its byte
/// counters into the lifetime totals.
pub struct SessionGuard {
    tracker: Arc<SessionTracker>,
    session: Arc<TrackedSession>,
}

impl SessionGuard {
    pub fn session(&self) -> &Arc<TrackedSession> {
        &self.session
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.tracker
            .total_upload
            .fetch_add(self.session.upload(), Ordering::Relaxed);
        self.tracker
            .total_download
            .fetch_add(self.session.download(), Ordering::Relaxed);
        self.tracker.sessions.remove(&self.session.id);
    }
}

impl SessionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session for the lifetime of the returned guard.
    pub fn track(self: &Arc<Self>, target: String, egress: EgressKind) -> SessionGuard {
        let session = Arc::new(TrackedSession::new(target, egress));
        self.sessions.insert(session.id, Arc::clone(&session));
        self.total_sessions.fetch_add(1, Ordering::Relaxed);
        SessionGuard {
            tracker: Arc::clone(self),
            session,
        }
    }

    pub fn active_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn total_sessions(&self) -> u64 {
        self.total_sessions.load(Ordering::Relaxed)
    }

    /// Lifetime bytes in each direction, counting only finished sessions.
    pub fn totals(&self) -> (u64, u64) {
        (
            self.total_upload.load(Ordering::Relaxed),
            self.total_download.load(Ordering::Relaxed),
        )
    }

    /// Snapshot of the live session list.
    pub fn snapshot(&self) -> Vec<Arc<TrackedSession>> {
        self.sessions.iter().map(|e| Arc::clone(e.value())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn guard_registers_and_unregisters() {
        let tracker = Arc::new(SessionTracker::new());
        assert_eq!(tracker.active_count(), 0);
        {
            let a = tracker.track("example.com:443".into(), EgressKind::Tunnel);
            let _b = tracker.track("10.0.0.1:80".into(), EgressKind::Direct);
            assert_eq!(tracker.active_count(), 2);
            assert_eq!(a.session().target, "example.com:443");
        }
        assert_eq!(tracker.active_count(), 0);
        assert_eq!(tracker.total_sessions(), 2);
    }

    #[tokio::test]
    async fn totals_roll_up_on_drop() {
        let tracker = Arc::new(SessionTracker::new());
        {
            let guard = tracker.track("example.com:443".into(), EgressKind::Tunnel);
            guard.session().upload_counter().fetch_add(100, Ordering::Relaxed);
            guard.session().download_counter().fetch_add(2500, Ordering::Relaxed);
            assert_eq!(tracker.totals(), (0, 0));
        }
        assert_eq!(tracker.totals(), (100, 2500));
    }

    #[tokio::test]
    async fn snapshot_reflects_live_sessions() {
        let tracker = Arc::new(SessionTracker::new());
        let _guard = tracker.track("a.test:1".into(), EgressKind::UdpAssociate);
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].egress, EgressKind::UdpAssociate);
        assert_eq!(snapshot[0].egress.as_str(), "udp-associate");
    }

    #[test]
    fn ids_are_unique() {
        let a = TrackedSession::new("x:1".into(), EgressKind::Direct);
        let b = TrackedSession::new("x:1".into(), EgressKind::Direct);
        assert_ne!(a.id, b.id);
    }
}
