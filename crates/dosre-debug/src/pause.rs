use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use tracing::debug;

#[derive(Debug, Default)]
struct PauseFlags {
    pause_requested: bool,
    paused: bool,
    pause_ended: bool,
}

/// Cooperative pause handshake between the execution thread and a controller.
///
/// The execution thread calls [`PauseHandler::wait_if_paused`] at every
/// instruction boundary; a pause requested from another thread therefore takes
/// effect before the next instruction executes.
#[derive(Debug, Default)]
pub struct PauseHandler {
    // Mirror of `PauseFlags::pause_requested` for the hot path.
    requested: AtomicBool,
    flags: Mutex<PauseFlags>,
    changed: Condvar,
}

impl PauseHandler {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, PauseFlags> {
        self.flags.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn request_pause(&self) {
        let mut flags = self.lock();
        debug!("pause requested");
        flags.pause_requested = true;
        flags.pause_ended = false;
        self.requested.store(true, Ordering::Release);
        self.changed.notify_all();
    }

    /// Requests a pause and blocks until the execution thread has parked.
    ///
    /// Returns early if the request is withdrawn by [`PauseHandler::request_resume`]
    /// before the execution thread reaches an instruction boundary.
    pub fn request_pause_and_wait(&self) {
        self.request_pause();
        let flags = self.lock();
        let _flags = self
            .changed
            .wait_while(flags, |f| f.pause_requested && !f.paused)
            .unwrap_or_else(PoisonError::into_inner);
    }

    pub fn request_resume(&self) {
        let mut flags = self.lock();
        debug!("resume requested");
        flags.pause_requested = false;
        self.requested.store(false, Ordering::Release);
        self.changed.notify_all();
    }

    /// Parks the calling (execution) thread while a pause is requested.
    #[inline]
    pub fn wait_if_paused(&self) {
        if !self.requested.load(Ordering::Acquire) {
            return;
        }
        self.park();
    }

    fn park(&self) {
        let mut flags = self.lock();
        if !flags.pause_requested {
            return;
        }
        flags.paused = true;
        self.changed.notify_all();
        debug!("execution paused");
        flags = self
            .changed
            .wait_while(flags, |f| f.pause_requested)
            .unwrap_or_else(PoisonError::into_inner);
        flags.paused = false;
        flags.pause_ended = true;
        self.changed.notify_all();
        debug!("execution resumed");
    }

    pub fn is_pause_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.lock().paused
    }

    /// True once the execution thread has left the most recent pause.
    pub fn is_pause_ended(&self) -> bool {
        self.lock().pause_ended
    }
}
