use super::{ExceptionSink, IdleTimeout};
use crate::error::TimeoutKind;
use std::time::Duration;

/// Fires when no read completes within the window. Checked at a fixed rate.
pub struct ReadTimeoutHandler {
    inner: IdleTimeout,
}

impl ReadTimeoutHandler {
    /// A zero `timeout` disables the handler.
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: IdleTimeout::new(TimeoutKind::Read, timeout),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    pub fn handler_added(&self, sink: ExceptionSink) {
        self.inner.start(sink);
    }

    pub fn channel_read_complete(&self) {
        self.inner.record_activity();
    }

    pub fn handler_removed(&self) {
        self.inner.stop();
    }

    pub fn is_scheduled(&self) -> bool {
        self.inner.watchdog.is_scheduled()
    }
}
