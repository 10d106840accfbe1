use crate::config::types::{LabError, Result};
use log::info;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
/// Async-safe shutdown signalling for long-running labbox processes.
/// The handler only flips atomics; the serving loop polls them and tears
/// down every live terminal session from normal context.
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::{Duration, Instant};

/// Global shutdown flag (async-safe atomic)
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Last signal received, 0 if none
static SIGNAL_RECEIVED: AtomicI32 = AtomicI32::new(0);

/// Installed SIGINT/SIGTERM/SIGHUP handlers
pub struct SignalHandler;

impl SignalHandler {
    /// Install handlers. Call before spawning session threads.
    pub fn init() -> Result<Self> {
        let action = SigAction::new(
            SigHandler::Handler(Self::signal_handler),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );

        for sig in [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP] {
            // SAFETY: the handler only touches atomics.
            unsafe { signal::sigaction(sig, &action) }.map_err(|e| {
                LabError::Process(format!("Failed to install {} handler: {}", sig, e))
            })?;
        }

        info!("Signal handlers installed (SIGINT, SIGTERM, SIGHUP)");
        Ok(Self)
    }

    extern "C" fn signal_handler(signal: libc::c_int) {
        SIGNAL_RECEIVED.store(signal, Ordering::SeqCst);
        SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
    }

    pub fn shutdown_requested(&self) -> bool {
        SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
    }

    pub fn get_signal(&self) -> i32 {
        SIGNAL_RECEIVED.load(Ordering::SeqCst)
    }

    /// Returns true if a signal arrived before `timeout` elapsed
    pub fn wait_for_signal(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if self.shutdown_requested() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        false
    }
}

/// Request shutdown from normal code (end of input, fatal transport error)
pub fn request_shutdown() {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

/// Main loop helper: false once shutdown was requested
pub fn should_continue() -> bool {
    !SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

type CleanupFn = Box<dyn FnOnce() + Send>;

/// Runs registered cleanup once shutdown is requested
pub struct ShutdownCoordinator {
    signal_handler: SignalHandler,
    cleanup_handlers: Vec<CleanupFn>,
}

impl ShutdownCoordinator {
    pub fn new() -> Result<Self> {
        Ok(Self {
            signal_handler: SignalHandler::init()?,
            cleanup_handlers: Vec::new(),
        })
    }

    pub fn register_cleanup<F>(&mut self, cleanup_fn: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.cleanup_handlers.push(Box::new(cleanup_fn));
    }

    pub fn shutdown_requested(&self) -> bool {
        self.signal_handler.shutdown_requested()
    }

    pub fn get_signal(&self) -> i32 {
        self.signal_handler.get_signal()
    }

    /// Run cleanup handlers in registration order
    pub fn run_cleanup(self) {
        let signal = self.get_signal();
        if signal != 0 {
            info!("Running cleanup handlers after signal {}", signal);
        } else {
            info!("Running cleanup handlers");
        }

        for handler in self.cleanup_handlers {
            handler();
        }

        info!("Cleanup complete");
    }
}
