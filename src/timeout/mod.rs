//! Per-connection read, write and response watchdogs.
//!
//! Each watchdog reports through an [`ExceptionSink`] and leaves closing the
//! connection to whoever drains the sink.

pub mod read;
pub mod response;
pub mod write;

pub use read::ReadTimeoutHandler;
pub use response::ResponseTimeoutHandler;
pub use write::WriteTimeoutHandler;

use crate::config::TimeoutConfig;
use crate::error::{TimeoutKind, TransportError};
use log::{debug, warn};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Inbound exception events of one connection.
#[derive(Debug, Clone)]
pub struct ExceptionSink {
    tx: UnboundedSender<TransportError>,
}

impl ExceptionSink {
    pub fn new(tx: UnboundedSender<TransportError>) -> Self {
        Self { tx }
    }

    pub fn channel() -> (Self, UnboundedReceiver<TransportError>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn fire_exception_caught(&self, error: TransportError) {
        if let Err(unsent) = self.tx.send(error) {
            debug!("Connection already gone, dropping exception: {}", unsent.0);
        }
    }
}

/// Whole milliseconds of `timeout`, with `None` meaning [`DEFAULT_TIMEOUT`].
pub fn timeout_millis(timeout: Option<Duration>) -> u64 {
    let timeout = timeout.unwrap_or(DEFAULT_TIMEOUT);
    u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)
}

/// Configured millisecond values are signed; negative ones disable the watchdog.
pub fn duration_from_millis(millis: i64) -> Duration {
    Duration::from_millis(millis.max(0) as u64)
}

struct ActivityClock {
    origin: Instant,
    last_millis: AtomicU64,
}

impl ActivityClock {
    fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_millis: AtomicU64::new(0),
        }
    }

    fn now_millis(&self) -> u64 {
        u64::try_from(self.origin.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn touch(&self) {
        self.last_millis.store(self.now_millis(), Ordering::Release);
    }

    fn idle_for(&self) -> Duration {
        let last = self.last_millis.load(Ordering::Acquire);
        Duration::from_millis(self.now_millis().saturating_sub(last))
    }
}

/// At most one scheduled task; re-arming aborts the previous one.
struct Watchdog {
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Watchdog {
    fn new() -> Self {
        Self {
            task: Mutex::new(None),
        }
    }

    fn arm(&self, task: JoinHandle<()>) {
        if let Ok(mut slot) = self.task.lock() {
            if let Some(previous) = slot.replace(task) {
                previous.abort();
            }
        }
    }

    fn cancel(&self) {
        if let Ok(mut slot) = self.task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }

    fn is_scheduled(&self) -> bool {
        self.task
            .lock()
            .map(|slot| slot.as_ref().is_some_and(|task| !task.is_finished()))
            .unwrap_or(false)
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Recurring check shared by the read and write handlers: fires once when no
/// activity was recorded for a whole window.
struct IdleTimeout {
    kind: TimeoutKind,
    timeout: Duration,
    clock: Arc<ActivityClock>,
    fired: Arc<AtomicBool>,
    watchdog: Watchdog,
}

impl IdleTimeout {
    fn new(kind: TimeoutKind, timeout: Duration) -> Self {
        Self {
            kind,
            timeout,
            clock: Arc::new(ActivityClock::new()),
            fired: Arc::new(AtomicBool::new(false)),
            watchdog: Watchdog::new(),
        }
    }

    fn start(&self, sink: ExceptionSink) {
        if self.timeout.is_zero() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No runtime available, {} timeout not scheduled", self.kind);
            return;
        };

        self.clock.touch();
        let kind = self.kind;
        let timeout = self.timeout;
        let clock = self.clock.clone();
        let fired = self.fired.clone();

        self.watchdog.arm(runtime.spawn(async move {
            let mut ticks = interval_at(Instant::now() + timeout, timeout);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                if clock.idle_for() < timeout {
                    continue;
                }
                if !fired.swap(true, Ordering::AcqRel) {
                    let millis = timeout_millis(Some(timeout));
                    debug!("{} timeout fired after {}ms of inactivity", kind, millis);
                    sink.fire_exception_caught(TransportError::timeout(kind, millis));
                }
                return;
            }
        }));
    }

    fn record_activity(&self) {
        self.clock.touch();
    }

    fn stop(&self) {
        self.watchdog.cancel();
    }
}

/// Read, write and response watchdogs for one connection, configured
/// independently.
pub struct TimeoutHandler {
    read: ReadTimeoutHandler,
    write: WriteTimeoutHandler,
    response: ResponseTimeoutHandler,
    sink: Mutex<Option<ExceptionSink>>,
}

impl TimeoutHandler {
    pub fn new(read: Option<Duration>, write: Option<Duration>, response: Option<Duration>) -> Self {
        Self {
            read: ReadTimeoutHandler::new(Duration::from_millis(timeout_millis(read))),
            write: WriteTimeoutHandler::new(Duration::from_millis(timeout_millis(write))),
            response: ResponseTimeoutHandler::new(Duration::from_millis(timeout_millis(response))),
            sink: Mutex::new(None),
        }
    }

    pub fn from_config(config: &TimeoutConfig) -> Self {
        Self::new(
            Some(config.read_timeout()),
            Some(config.write_timeout()),
            Some(config.response_timeout()),
        )
    }

    pub fn read(&self) -> &ReadTimeoutHandler {
        &self.read
    }

    pub fn write(&self) -> &WriteTimeoutHandler {
        &self.write
    }

    pub fn response(&self) -> &ResponseTimeoutHandler {
        &self.response
    }

    /// Starts the read and write watchdogs. The response watchdog waits for
    /// [`TimeoutHandler::request_sent`].
    pub fn handler_added(&self, sink: ExceptionSink) {
        self.read.handler_added(sink.clone());
        self.write.handler_added(sink.clone());
        if let Ok(mut slot) = self.sink.lock() {
            *slot = Some(sink);
        }
    }

    pub fn request_sent(&self) {
        let sink = self.sink.lock().ok().and_then(|slot| slot.clone());
        match sink {
            Some(sink) => self.response.handler_added(sink),
            None => debug!("Request sent before timeout handler was attached"),
        }
    }

    pub fn response_received(&self) {
        self.response.response_received();
    }

    pub fn channel_read_complete(&self) {
        self.read.channel_read_complete();
    }

    pub fn write_completed(&self) {
        self.write.write_completed();
    }

    pub fn handler_removed(&self) {
        self.read.handler_removed();
        self.write.handler_removed();
        self.response.handler_removed();
    }
}
