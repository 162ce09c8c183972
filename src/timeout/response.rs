use super::{timeout_millis, ExceptionSink, Watchdog};
use crate::error::{TimeoutKind, TransportError};
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// One-shot: armed when the request has been sent, disarmed by the first sign
/// of a response.
pub struct ResponseTimeoutHandler {
    timeout: Duration,
    fired: Arc<AtomicBool>,
    watchdog: Watchdog,
}

impl ResponseTimeoutHandler {
    /// A zero `timeout` disables the handler.
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            fired: Arc::new(AtomicBool::new(false)),
            watchdog: Watchdog::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn handler_added(&self, sink: ExceptionSink) {
        if self.timeout.is_zero() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime available, response timeout not scheduled");
            return;
        };

        let timeout = self.timeout;
        let fired = self.fired.clone();
        self.watchdog.arm(runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if !fired.swap(true, Ordering::AcqRel) {
                let millis = timeout_millis(Some(timeout));
                debug!("No response within {}ms", millis);
                sink.fire_exception_caught(TransportError::timeout(TimeoutKind::Response, millis));
            }
        }));
    }

    pub fn response_received(&self) {
        self.watchdog.cancel();
    }

    pub fn handler_removed(&self) {
        self.watchdog.cancel();
    }

    pub fn is_scheduled(&self) -> bool {
        self.watchdog.is_scheduled()
    }
}
