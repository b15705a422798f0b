//! Shutdown Coordination
//!
//! Termination can arrive from an OS signal, a panic, or an explicit request, often
//! in quick succession. Only the first request wins; everything after it is logged
//! and ignored. Tasks hold a [`ShutdownToken`] and exit their loops once it fires.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tracing::{error, info, warn};

/// What triggered the shutdown
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownSignal {
    /// SIGTERM
    Terminate,
    /// SIGINT (Ctrl+C)
    Interrupt,
    /// SIGHUP
    Hangup,
    /// Uncaught panic on any task
    Panic(String),
    /// Programmatic request (CLI, tests)
    Requested(String),
}

impl std::fmt::Display for ShutdownSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShutdownSignal::Terminate => write!(f, "SIGTERM"),
            ShutdownSignal::Interrupt => write!(f, "SIGINT"),
            ShutdownSignal::Hangup => write!(f, "SIGHUP"),
            ShutdownSignal::Panic(msg) => write!(f, "panic: {}", msg),
            ShutdownSignal::Requested(reason) => write!(f, "{}", reason),
        }
    }
}

/// Idempotent shutdown trigger shared by every component
pub struct ShutdownCoordinator {
    requested: AtomicBool,
    signal: Mutex<Option<ShutdownSignal>>,
    tx: watch::Sender<bool>,
    rx: watch::Receiver<bool>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            requested: AtomicBool::new(false),
            signal: Mutex::new(None),
            tx,
            rx,
        }
    }

    /// Request shutdown. Returns true only for the first request.
    pub fn request(&self, signal: ShutdownSignal) -> bool {
        if self.requested.swap(true, Ordering::SeqCst) {
            warn!(%signal, "shutdown already requested, ignoring");
            return false;
        }

        info!(%signal, "shutdown requested");
        *self
            .signal
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(signal);
        let _ = self.tx.send(true);
        true
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// The signal that won, if any
    pub fn signal(&self) -> Option<ShutdownSignal> {
        self.signal
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn token(&self) -> ShutdownToken {
        ShutdownToken {
            rx: self.rx.clone(),
        }
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Cloneable handle that resolves once shutdown is requested
#[derive(Clone)]
pub struct ShutdownToken {
    rx: watch::Receiver<bool>,
}

impl ShutdownToken {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Wait until shutdown is requested. Returns immediately if it already was.
    pub async fn cancelled(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Route SIGTERM, SIGINT and SIGHUP into the coordinator
pub fn install_signal_handlers(shutdown: Arc<ShutdownCoordinator>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let kinds = [
            (SignalKind::terminate(), ShutdownSignal::Terminate),
            (SignalKind::interrupt(), ShutdownSignal::Interrupt),
            (SignalKind::hangup(), ShutdownSignal::Hangup),
        ];

        for (kind, shutdown_signal) in kinds {
            let shutdown = shutdown.clone();
            match signal(kind) {
                Ok(mut stream) => {
                    tokio::spawn(async move {
                        if stream.recv().await.is_some() {
                            info!(signal = %shutdown_signal, "received signal");
                            shutdown.request(shutdown_signal);
                        }
                    });
                }
                Err(e) => error!(signal = %shutdown_signal, error = %e, "failed to install signal handler"),
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received Ctrl+C");
                shutdown.request(ShutdownSignal::Interrupt);
            }
        });
    }
}

/// Chain a panic hook that turns any panic into a shutdown request
pub fn install_panic_hook(shutdown: Arc<ShutdownCoordinator>) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        let message = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        let location = info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_default();
        if super::ticker::in_contained_tick() {
            error!(%message, %location, "panic inside periodic tick");
            previous(info);
            return;
        }
        error!(%message, %location, "uncaught panic, shutting down");
        shutdown.request(ShutdownSignal::Panic(message));
        previous(info);
    }));
}
