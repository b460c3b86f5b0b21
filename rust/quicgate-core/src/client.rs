//! Client instance lifecycle
//!
//! One running instance owns the loopback listener, the tunnel supervisor
//! and a root cancellation token every session derives from. `stop()` is
//! idempotent: it fires the token, which unwinds the accept loop, the
//! supervisor and every live association, then closes the tunnel with
//! application code 0.

use once_cell::sync::Lazy;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use quicgate_proto::BufferPool;

use crate::config::ClientConfig;
use crate::error::Result;
use crate::routing::SuffixRouter;
use crate::tracker::{SessionTracker, TrackedSession};
use crate::tunnel::Tunnel;
use crate::{logging, socks5};

/// Shared state every session task hangs off.
pub(crate) struct ClientState {
    pub(crate) config: ClientConfig,
    pub(crate) router: Arc<SuffixRouter>,
    pub(crate) tunnel: Arc<Tunnel>,
    pub(crate) pool: Arc<BufferPool>,
    pub(crate) tracker: Arc<SessionTracker>,
    pub(crate) cancel: CancellationToken,
}

/// A running client instance.
pub struct ClientHandle {
    state: Arc<ClientState>,
    local_addr: SocketAddr,
    running: Arc<AtomicBool>,
}

impl ClientHandle {
    /// Start a client: load rules, prepare the tunnel, bind the loopback
    /// SOCKS5 listener and spawn the supervisor and accept loop. The first
    /// dial happens in the background; a dead tunnel at startup is not an
    /// error, the supervisor keeps retrying.
    pub async fn start(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        logging::init_logging(config.log_level)?;

        let router = Arc::new(SuffixRouter::from_source(config.rules.as_ref())?);
        info!("router loaded with {} rules", router.rule_count());

        let cancel = CancellationToken::new();
        let tunnel = Arc::new(Tunnel::new(&config)?);

        let listener = socks5::bind_listener(SocketAddr::from((
            Ipv4Addr::LOCALHOST,
            config.local_port,
        )))?;
        let local_addr = listener.local_addr()?;

        let state = Arc::new(ClientState {
            config,
            router,
            tunnel: Arc::clone(&tunnel),
            pool: Arc::new(BufferPool::default()),
            tracker: Arc::new(SessionTracker::new()),
            cancel: cancel.clone(),
        });

        // First dial attempt up front so the common case has a warm tunnel
        // by the time the first CONNECT arrives.
        {
            let tunnel = Arc::clone(&tunnel);
            tokio::spawn(async move {
                if let Err(e) = tunnel.ensure().await {
                    warn!("initial tunnel dial failed (will retry): {}", e);
                }
            });
        }
        tunnel.spawn_supervisor(cancel.child_token());

        {
            let state = Arc::clone(&state);
            let cancel = cancel.clone();
            tokio::spawn(socks5::serve(listener, state, cancel));
        }

        info!("SOCKS5 proxy ready on {}", local_addr);
        info!("tunnel server: {}", state.config.server_addr);

        Ok(Self {
            state,
            local_addr,
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    /// Where the SOCKS5 listener actually bound. Useful with port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Number of sessions currently relaying.
    pub fn active_sessions(&self) -> usize {
        self.state.tracker.active_count()
    }

    /// Lifetime (upload, download) byte totals across finished sessions.
    pub fn traffic_totals(&self) -> (u64, u64) {
        self.state.tracker.totals()
    }

    /// Snapshot of the live session list.
    pub fn sessions(&self) -> Vec<Arc<TrackedSession>> {
        self.state.tracker.snapshot()
    }

    /// Stop the instance: cancel everything, close the tunnel.
    /// Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("stopping client");
        self.state.cancel.cancel();
        self.state.tunnel.close().await;
        info!("client stopped");
    }
}

static INSTANCE: Lazy<tokio::sync::Mutex<Option<ClientHandle>>> =
    Lazy::new(|| tokio::sync::Mutex::new(None));

/// Start the process-global client instance, replacing (and stopping) any
/// previous one. This is the surface embedding SDKs call.
pub async fn start(config: ClientConfig) -> Result<()> {
    let mut slot = INSTANCE.lock().await;
    if let Some(previous) = slot.take() {
        previous.stop().await;
    }
    *slot = Some(ClientHandle::start(config).await?);
    Ok(())
}

/// Stop the process-global instance. Idempotent.
pub async fn stop() {
    let mut slot = INSTANCE.lock().await;
    if let Some(handle) = slot.take() {
        handle.stop().await;
    }
}

/// Whether a process-global instance is currently running.
pub async fn is_running() -> bool {
    let slot = INSTANCE.lock().await;
    slot.as_ref().map(ClientHandle::is_running).unwrap_or(false)
}
