use super::{ExceptionSink, IdleTimeout};
use crate::error::TimeoutKind;
use std::future::Future;
use std::io;
use std::time::Duration;

/// Fires when no write completes within the window. Only successful writes
/// count as progress.
pub struct WriteTimeoutHandler {
    inner: IdleTimeout,
}

impl WriteTimeoutHandler {
    /// A zero `timeout` disables the handler.
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: IdleTimeout::new(TimeoutKind::Write, timeout),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    pub fn handler_added(&self, sink: ExceptionSink) {
        self.inner.start(sink);
    }

    pub fn write_completed(&self) {
        self.inner.record_activity();
    }

    /// Awaits `write` and records progress if it succeeded.
    pub async fn track<F, T>(&self, write: F) -> io::Result<T>
    where
        F: Future<Output = io::Result<T>>,
    {
        let result = write.await;
        if result.is_ok() {
            self.write_completed();
        }
        result
    }

    pub fn handler_removed(&self) {
        self.inner.stop();
    }

    pub fn is_scheduled(&self) -> bool {
        self.inner.watchdog.is_scheduled()
    }
}
