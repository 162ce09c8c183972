use proxy_transport::config::TimeoutConfig;
use proxy_transport::timeout::{ReadTimeoutHandler, ResponseTimeoutHandler, WriteTimeoutHandler};
use proxy_transport::{ExceptionSink, TimeoutHandler, TimeoutKind};
use std::time::Duration;
use tokio::time::{sleep, Instant};

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

#[tokio::test(start_paused = true)]
async fn test_read_timeout_fires_once_when_idle() {
    let handler = ReadTimeoutHandler::new(ms(100));
    let (sink, mut events) = ExceptionSink::channel();
    handler.handler_added(sink);
    assert!(handler.is_scheduled());

    sleep(ms(500)).await;
    let err = events.try_recv().unwrap();
    assert_eq!(err.timeout_kind(), Some(TimeoutKind::Read));
    assert!(err.is_timeout());

    sleep(ms(500)).await;
    assert!(events.try_recv().is_err());
    handler.handler_removed();
}

#[tokio::test(start_paused = true)]
async fn test_read_activity_defers_timeout_until_removed() {
    let handler = ReadTimeoutHandler::new(ms(500));
    let (sink, mut events) = ExceptionSink::channel();
    handler.handler_added(sink);

    sleep(ms(100)).await;
    handler.channel_read_complete();
    sleep(ms(450)).await;
    handler.handler_removed();
    assert!(!handler.is_scheduled());

    sleep(ms(2_000)).await;
    assert!(events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_write_completion_resets_window() {
    let handler = WriteTimeoutHandler::new(ms(200));
    let (sink, mut events) = ExceptionSink::channel();
    let started = Instant::now();
    handler.handler_added(sink);

    sleep(ms(150)).await;
    handler.write_completed();
    sleep(ms(150)).await;
    assert!(events.try_recv().is_err());

    let err = events.recv().await.unwrap();
    assert_eq!(err.timeout_kind(), Some(TimeoutKind::Write));
    assert!(started.elapsed() >= ms(350));
    handler.handler_removed();
}

#[tokio::test(start_paused = true)]
async fn test_failed_write_is_not_progress() {
    let handler = WriteTimeoutHandler::new(ms(200));
    let (sink, mut events) = ExceptionSink::channel();
    handler.handler_added(sink);

    sleep(ms(150)).await;
    let failed: std::io::Result<()> = handler
        .track(async { Err(std::io::Error::other("broken pipe")) })
        .await;
    assert!(failed.is_err());

    sleep(ms(100)).await;
    let err = events.try_recv().unwrap();
    assert_eq!(err.timeout_kind(), Some(TimeoutKind::Write));
}

#[tokio::test(start_paused = true)]
async fn test_response_received_cancels_watchdog() {
    let handler = ResponseTimeoutHandler::new(ms(100));
    let (sink, mut events) = ExceptionSink::channel();
    handler.handler_added(sink);
    assert!(handler.is_scheduled());

    sleep(ms(50)).await;
    handler.response_received();
    assert!(!handler.is_scheduled());

    sleep(ms(500)).await;
    assert!(events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_zero_thresholds_schedule_nothing() {
    let handler = TimeoutHandler::new(Some(Duration::ZERO), Some(Duration::ZERO), Some(Duration::ZERO));
    let (sink, mut events) = ExceptionSink::channel();

    handler.handler_added(sink);
    handler.request_sent();
    assert!(!handler.read().is_scheduled());
    assert!(!handler.write().is_scheduled());
    assert!(!handler.response().is_scheduled());

    sleep(ms(120_000)).await;
    assert!(events.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn test_negative_config_disables_watchdogs() {
    let config = TimeoutConfig {
        read_timeout_millis: Some(-1),
        write_timeout_millis: Some(-250),
        response_timeout_millis: None,
    };
    let handler = TimeoutHandler::from_config(&config);
    assert_eq!(handler.read().timeout(), Duration::ZERO);
    assert_eq!(handler.write().timeout(), Duration::ZERO);
    assert_eq!(handler.response().timeout(), ms(60_000));

    let (sink, _events) = ExceptionSink::channel();
    handler.handler_added(sink);
    assert!(!handler.read().is_scheduled());
    assert!(!handler.write().is_scheduled());
    handler.handler_removed();
}

#[tokio::test(start_paused = true)]
async fn test_removal_is_idempotent() {
    let handler = TimeoutHandler::new(Some(ms(100)), Some(ms(100)), Some(ms(100)));
    let (sink, mut events) = ExceptionSink::channel();
    handler.handler_added(sink);
    handler.request_sent();

    handler.handler_removed();
    handler.handler_removed();
    assert!(!handler.read().is_scheduled());
    assert!(!handler.write().is_scheduled());
    assert!(!handler.response().is_scheduled());

    sleep(ms(1_000)).await;
    assert!(events.try_recv().is_err());
}
