//! Service state machine
//!
//! Pure state machine: receives events, returns (new_state, action).
//! Caller (main.rs) executes the I/O implied by each action.
//!
//! Initializing → Starting → Running → Draining → Stopped

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::{Duration, Instant};

/// Runtime counters shared between handlers, the health endpoint and shutdown
#[derive(Debug, Clone)]
pub struct ServiceMetrics {
    pub requests_total: Arc<AtomicU64>,
    pub errors_total: Arc<AtomicU64>,
    /// HTTP requests currently being forwarded.
    pub in_flight: Arc<AtomicU64>,
    /// Relay sessions currently open.
    pub sessions_active: Arc<AtomicU64>,
    pub started_at: Instant,
}

impl ServiceMetrics {
    pub fn new() -> Self {
        Self {
            requests_total: Arc::new(AtomicU64::new(0)),
            errors_total: Arc::new(AtomicU64::new(0)),
            in_flight: Arc::new(AtomicU64::new(0)),
            sessions_active: Arc::new(AtomicU64::new(0)),
            started_at: Instant::now(),
        }
    }
}

impl Default for ServiceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceState {
    /// Loading config, building the key pool
    Initializing,
    /// Binding the HTTP listener
    Starting { listen_addr: SocketAddr },
    /// Accepting requests and relay sessions
    Running { listen_addr: SocketAddr },
    /// Graceful shutdown, finishing in-flight work
    Draining { deadline: Instant },
    /// Terminal state
    Stopped { exit_code: i32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
    /// Configuration parsed and validated
    ConfigLoaded { listen_addr: SocketAddr },
    /// Configuration or key pool setup failed
    StartupFailed(String),
    /// HTTP listener bound and ready
    ListenerReady,
    /// SIGTERM/SIGINT received
    ShutdownSignal,
    /// Server finished draining
    Drained,
    /// Drain deadline exceeded
    DrainTimeout,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceAction {
    /// Bind HTTP listener on the given address
    StartListener { addr: SocketAddr },
    /// Stop accepting, let in-flight work finish within the timeout
    BeginDrain { timeout: Duration },
    /// Exit the process
    Shutdown { exit_code: i32 },
    /// No-op
    None,
}

/// Drain timeout duration
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Handle a state transition. Pure function: no I/O.
pub fn handle_event(state: ServiceState, event: ServiceEvent) -> (ServiceState, ServiceAction) {
    match (state, event) {
        // --- Initializing ---
        (ServiceState::Initializing, ServiceEvent::ConfigLoaded { listen_addr }) => (
            ServiceState::Starting { listen_addr },
            ServiceAction::StartListener { addr: listen_addr },
        ),

        // --- Startup failure from any pre-running state ---
        (
            ServiceState::Initializing | ServiceState::Starting { .. },
            ServiceEvent::StartupFailed(_),
        ) => (
            ServiceState::Stopped { exit_code: 1 },
            ServiceAction::Shutdown { exit_code: 1 },
        ),

        // --- Starting ---
        (ServiceState::Starting { listen_addr }, ServiceEvent::ListenerReady) => (
            ServiceState::Running { listen_addr },
            ServiceAction::None,
        ),

        // --- Running ---
        (ServiceState::Running { .. }, ServiceEvent::ShutdownSignal) => (
            ServiceState::Draining {
                deadline: Instant::now() + DRAIN_TIMEOUT,
            },
            ServiceAction::BeginDrain {
                timeout: DRAIN_TIMEOUT,
            },
        ),

        // --- Draining ---
        (ServiceState::Draining { .. }, ServiceEvent::Drained | ServiceEvent::DrainTimeout) => (
            ServiceState::Stopped { exit_code: 0 },
            ServiceAction::Shutdown { exit_code: 0 },
        ),

        // A second signal while draining stops immediately
        (ServiceState::Draining { .. }, ServiceEvent::ShutdownSignal) => (
            ServiceState::Stopped { exit_code: 0 },
            ServiceAction::Shutdown { exit_code: 0 },
        ),

        // --- Terminal ---
        (state @ ServiceState::Stopped { .. }, _) => (state, ServiceAction::None),

        // --- Shutdown before running: nothing to drain ---
        (_, ServiceEvent::ShutdownSignal) => (
            ServiceState::Stopped { exit_code: 0 },
            ServiceAction::Shutdown { exit_code: 0 },
        ),

        // --- Invalid/unhandled transition: stay in current state ---
        (state, _event) => (state, ServiceAction::None),
    }
}
