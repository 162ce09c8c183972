use bytes::Bytes;
use futures::StreamExt;
use http_body_util::BodyExt;
use hyper::body::Body;
use proxy_transport::file_source::{read_file, BlockingFileChannel};
use proxy_transport::reactive::SubscriberStream;
use proxy_transport::write_subscriber::write_publisher;
use proxy_transport::{ByteSink, ChunkedFileReadSource, FileRangeBody, TransportError};
use std::io::{self, Write};
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;

fn temp_file(contents: &[u8]) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents).unwrap();
    file.flush().unwrap();
    file
}

#[derive(Clone, Default)]
struct VecSink(Arc<Mutex<Vec<u8>>>);

impl ByteSink for VecSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
}

#[tokio::test]
async fn test_range_is_read_in_chunks() {
    let file = temp_file(b"hello there");
    let channel = BlockingFileChannel::open(file.path()).unwrap();
    let source = ChunkedFileReadSource::new(Arc::new(channel), 1, 1, 3);

    let chunks: Vec<Bytes> = SubscriberStream::new(&source)
        .map(|chunk| chunk.unwrap())
        .collect()
        .await;

    assert_eq!(chunks.len(), 3);
    assert_eq!(chunks.concat(), b"ell");
}

#[tokio::test]
async fn test_body_has_exact_size_hint() {
    let contents: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    let file = temp_file(&contents);

    let body = read_file(file.path(), 10, 50_000, 4096).await.unwrap();
    assert_eq!(body.size_hint().exact(), Some(50_000));

    let collected = body.collect().await.unwrap().to_bytes();
    assert_eq!(collected.len(), 50_000);
    assert_eq!(&collected[..], &contents[10..50_010]);
}

#[tokio::test]
async fn test_range_past_end_is_clamped() {
    let file = temp_file(b"short file");

    let body = read_file(file.path(), 6, 1_000, 4).await.unwrap();
    assert_eq!(body.size_hint().exact(), Some(4));
    let collected = body.collect().await.unwrap().to_bytes();
    assert_eq!(&collected[..], b"file");

    let body = read_file(file.path(), 50, 10, 4).await.unwrap();
    assert_eq!(body.size_hint().exact(), Some(0));
    assert!(body.collect().await.unwrap().to_bytes().is_empty());
}

#[tokio::test]
async fn test_shrunk_file_fails_body_instead_of_coming_up_short() {
    let file = temp_file(b"0123456789");
    let channel = BlockingFileChannel::open(file.path()).unwrap();
    file.as_file().set_len(4).unwrap();

    // The range was computed against the old length.
    let source = ChunkedFileReadSource::new(Arc::new(channel), 3, 0, 10);
    let mut body = FileRangeBody::new(&source);
    assert_eq!(body.size_hint().exact(), Some(10));

    let mut received = Vec::new();
    let err = loop {
        match body.frame().await {
            Some(Ok(frame)) => received.extend_from_slice(&frame.into_data().unwrap()),
            Some(Err(e)) => break e,
            None => panic!("body ended without reporting the short range"),
        }
    };
    assert_eq!(received, b"0123");
    match err {
        TransportError::Io(e) => assert_eq!(e.kind(), std::io::ErrorKind::UnexpectedEof),
        other => panic!("unexpected error {:?}", other),
    }
    assert!(body.frame().await.is_none());
}

#[tokio::test]
async fn test_source_alone_completes_at_end_of_file() {
    let file = temp_file(b"0123456789");
    let channel = BlockingFileChannel::open(file.path()).unwrap();
    file.as_file().set_len(4).unwrap();

    let source = ChunkedFileReadSource::new(Arc::new(channel), 3, 0, 10);
    let chunks: Vec<Bytes> = SubscriberStream::new(&source)
        .map(|chunk| chunk.unwrap())
        .collect()
        .await;
    assert_eq!(chunks.concat(), b"0123");
}

#[tokio::test]
async fn test_file_is_written_to_sink() {
    let contents: Vec<u8> = (0..20_000u32).map(|i| (i % 13) as u8).collect();
    let file = temp_file(&contents);
    let channel = BlockingFileChannel::open(file.path()).unwrap();
    let source = ChunkedFileReadSource::new(Arc::new(channel), 1024, 0, contents.len() as u64);

    let sink = VecSink::default();
    write_publisher(&source, sink.clone()).await.unwrap();
    assert_eq!(*sink.0.lock().unwrap(), contents);
}

#[tokio::test]
async fn test_missing_file_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = read_file(dir.path().join("missing.bin"), 0, 10, 16).await.err().unwrap();
    assert!(matches!(err, TransportError::Io(_)));
}
