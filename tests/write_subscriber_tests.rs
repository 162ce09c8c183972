use bytes::Bytes;
use futures::stream;
use proxy_transport::reactive::StreamPublisher;
use proxy_transport::write_subscriber::write_publisher;
use proxy_transport::{ByteSink, TransportError, WriteSink};
use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Clone, Default)]
struct TrackingSink {
    written: Arc<Mutex<Vec<u8>>>,
    calls: Arc<AtomicUsize>,
}

impl ByteSink for TrackingSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.written.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
}

/// A writer that accepts at most `limit` bytes per call, like a socket with
/// a small send buffer.
#[derive(Clone)]
struct ShortWriter {
    written: Arc<Mutex<Vec<u8>>>,
    largest_call: Arc<AtomicUsize>,
    limit: usize,
}

impl Write for ShortWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = buf.len().min(self.limit);
        self.largest_call.fetch_max(n, Ordering::SeqCst);
        self.written.lock().unwrap().extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn buffer(size: usize, seed: u8) -> Bytes {
    (0..size).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

#[tokio::test]
async fn test_large_buffers_are_written_in_order() {
    let buffers = vec![buffer(4196, 1), buffer(16392, 2), buffer(131136, 3)];
    let expected: Vec<u8> = buffers.iter().flat_map(|b| b.iter().copied()).collect();

    let publisher = StreamPublisher::new(stream::iter(
        buffers.into_iter().map(Ok::<_, TransportError>).collect::<Vec<_>>(),
    ));
    let sink = TrackingSink::default();
    write_publisher(&publisher, sink.clone()).await.unwrap();

    assert_eq!(*sink.written.lock().unwrap(), expected);
    assert_eq!(sink.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_capped_writer_receives_every_byte() {
    let buffers = vec![buffer(4196, 7), buffer(16392, 8)];
    let expected: Vec<u8> = buffers.iter().flat_map(|b| b.iter().copied()).collect();

    let writer = ShortWriter {
        written: Arc::new(Mutex::new(Vec::new())),
        largest_call: Arc::new(AtomicUsize::new(0)),
        limit: 1500,
    };
    let sink = WriteSink::new(writer.clone()).with_max_bytes_per_write(Some(1024));

    let publisher = StreamPublisher::new(stream::iter(
        buffers.into_iter().map(Ok::<_, TransportError>).collect::<Vec<_>>(),
    ));
    write_publisher(&publisher, sink).await.unwrap();

    assert_eq!(*writer.written.lock().unwrap(), expected);
    assert_eq!(writer.largest_call.load(Ordering::SeqCst), 1024);
}

#[tokio::test]
async fn test_upstream_error_stops_writing() {
    let items = vec![
        Ok(Bytes::from_static(b"first")),
        Err(TransportError::Protocol("upstream broke".to_string())),
        Ok(Bytes::from_static(b"never")),
    ];
    let publisher = StreamPublisher::new(stream::iter(items));
    let sink = TrackingSink::default();

    let err = write_publisher(&publisher, sink.clone()).await.err().unwrap();
    assert!(matches!(err, TransportError::Protocol(_)));
    assert_eq!(*sink.written.lock().unwrap(), b"first");
}

#[tokio::test]
async fn test_empty_publisher_completes() {
    let publisher = StreamPublisher::new(stream::iter(Vec::<Result<Bytes, TransportError>>::new()));
    let sink = TrackingSink::default();

    write_publisher(&publisher, sink.clone()).await.unwrap();
    assert!(sink.written.lock().unwrap().is_empty());
    assert_eq!(sink.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_publisher_rejects_second_subscriber() {
    let publisher = StreamPublisher::new(stream::iter(vec![Ok::<_, TransportError>(Bytes::from_static(b"x"))]));

    write_publisher(&publisher, TrackingSink::default()).await.unwrap();
    let err = write_publisher(&publisher, TrackingSink::default()).await.err().unwrap();
    assert!(matches!(err, TransportError::IllegalState(_)));
}
