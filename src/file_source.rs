//! Ranged file reads exposed as a backpressured chunk stream.

use crate::error::TransportError;
use crate::reactive::{add_cap, produced, Publisher, Subscriber, Subscription, SubscriberStream};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use hyper::body::{Body, Frame, SizeHint};
use log::{debug, trace};
use std::fs::File;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use tokio::runtime::Handle;

pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024;

/// Largest single read, in bytes.
pub const MAX_CHUNK_SIZE: usize = i32::MAX as usize;

const NOT_SET: u64 = u64::MAX;

#[derive(Debug)]
pub enum ReadOutcome {
    /// The bytes read. May be shorter than requested.
    Data(BytesMut),
    EndOfFile,
}

pub type ReadCallback = Box<dyn FnOnce(Result<ReadOutcome, TransportError>) + Send + 'static>;

/// Positional reads that complete through a callback.
pub trait AsyncFileChannel: Send + Sync + 'static {
    /// Reads up to `buffer.capacity()` bytes starting at `position`.
    fn read(&self, buffer: BytesMut, position: u64, callback: ReadCallback);
}

/// Runs positional reads of a std [`File`] on the blocking pool.
#[derive(Debug, Clone)]
pub struct BlockingFileChannel {
    file: Arc<File>,
    runtime: Handle,
}

impl BlockingFileChannel {
    pub fn new(file: File) -> Result<Self, TransportError> {
        let runtime = Handle::try_current()
            .map_err(|e| TransportError::IllegalState(format!("No tokio runtime for file reads: {}", e)))?;
        Ok(Self {
            file: Arc::new(file),
            runtime,
        })
    }

    pub fn open(path: &Path) -> Result<Self, TransportError> {
        Self::new(File::open(path)?)
    }

    pub fn file_len(&self) -> Result<u64, TransportError> {
        Ok(self.file.metadata()?.len())
    }
}

impl AsyncFileChannel for BlockingFileChannel {
    fn read(&self, mut buffer: BytesMut, position: u64, callback: ReadCallback) {
        let file = self.file.clone();
        self.runtime.spawn_blocking(move || {
            let outcome = read_at(&file, &mut buffer, position).map(|n| {
                if n == 0 {
                    ReadOutcome::EndOfFile
                } else {
                    ReadOutcome::Data(buffer)
                }
            });
            callback(outcome.map_err(TransportError::from));
        });
    }
}

fn read_at(file: &File, buffer: &mut BytesMut, position: u64) -> io::Result<usize> {
    let capacity = buffer.capacity();
    buffer.resize(capacity, 0);
    loop {
        match positional_read(file, &mut buffer[..], position) {
            Ok(n) => {
                buffer.truncate(n);
                return Ok(n);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

#[cfg(unix)]
fn positional_read(file: &File, buf: &mut [u8], position: u64) -> io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, position)
}

#[cfg(windows)]
fn positional_read(file: &File, buf: &mut [u8], position: u64) -> io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, position)
}

/// Bytes the next read may ask for when `remaining` bytes are left in the
/// range, clamped to [`MAX_CHUNK_SIZE`].
pub fn remaining_chunk_capacity(remaining: u64) -> usize {
    usize::try_from(remaining).unwrap_or(usize::MAX).min(MAX_CHUNK_SIZE)
}

/// `[offset, offset + length)` of a file, read lazily in chunks.
///
/// Each subscriber gets its own read state starting at `offset`. A read is
/// issued only when there is demand, and the next one as soon as the previous
/// chunk has been handed downstream.
pub struct ChunkedFileReadSource<C> {
    channel: Arc<C>,
    chunk_size: usize,
    offset: u64,
    length: u64,
}

impl<C: AsyncFileChannel> ChunkedFileReadSource<C> {
    pub fn new(channel: Arc<C>, chunk_size: usize, offset: u64, length: u64) -> Self {
        Self {
            channel,
            chunk_size: chunk_size.max(1),
            offset,
            length,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn length(&self) -> u64 {
        self.length
    }
}

impl<C: AsyncFileChannel> Publisher<Bytes> for ChunkedFileReadSource<C> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<Bytes>>) {
        let channel = self.channel.clone();
        let chunk_size = self.chunk_size;
        let offset = self.offset;
        let end = self.offset.saturating_add(self.length);

        let subscription = Arc::new_cyclic(|this| FileReadSubscription {
            this: this.clone(),
            channel,
            chunk_size,
            offset,
            end,
            position: AtomicU64::new(NOT_SET),
            requested: AtomicU64::new(0),
            wip: AtomicUsize::new(0),
            done: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            error: Mutex::new(None),
            next: Mutex::new(None),
            subscriber: Mutex::new(Some(subscriber.clone())),
        });
        subscriber.on_subscribe(subscription);
    }
}

struct FileReadSubscription<C> {
    this: Weak<FileReadSubscription<C>>,
    channel: Arc<C>,
    chunk_size: usize,
    offset: u64,
    end: u64,
    position: AtomicU64,
    requested: AtomicU64,
    wip: AtomicUsize,
    done: AtomicBool,
    cancelled: AtomicBool,
    error: Mutex<Option<TransportError>>,
    next: Mutex<Option<Bytes>>,
    subscriber: Mutex<Option<Arc<dyn Subscriber<Bytes>>>>,
}

impl<C: AsyncFileChannel> FileReadSubscription<C> {
    fn drain(&self) {
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }

        let mut missed = 1;
        loop {
            if self.is_cancelled() {
                self.clear();
                return;
            }

            let requested = self.requested.load(Ordering::Acquire);
            if requested > 0
                && self
                    .position
                    .compare_exchange(NOT_SET, self.offset, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
            {
                self.issue_read(self.offset);
            }

            let mut emitted = 0;
            while emitted < requested {
                if self.is_cancelled() {
                    self.clear();
                    return;
                }

                let done = self.done.load(Ordering::Acquire);
                let Some(chunk) = self.take_next() else {
                    if done {
                        self.terminate();
                        return;
                    }
                    break;
                };

                let Some(subscriber) = self.subscriber() else {
                    return;
                };
                subscriber.on_next(chunk);
                emitted += 1;

                if !self.done.load(Ordering::Acquire) {
                    self.issue_read(self.position.load(Ordering::Acquire));
                }
            }

            if emitted > 0 {
                produced(&self.requested, emitted);
            }

            if self.done.load(Ordering::Acquire) && self.has_no_next() {
                self.terminate();
                return;
            }

            missed = self.wip.fetch_sub(missed, Ordering::AcqRel) - missed;
            if missed == 0 {
                return;
            }
        }
    }

    fn issue_read(&self, position: u64) {
        if self.is_cancelled() {
            return;
        }
        let remaining = self.end.saturating_sub(position);
        if remaining == 0 {
            self.done.store(true, Ordering::Release);
            return;
        }
        let Some(this) = self.this.upgrade() else {
            return;
        };

        let size = self.chunk_size.min(remaining_chunk_capacity(remaining));
        trace!("Reading {} bytes at position {}", size, position);
        self.channel.read(
            BytesMut::with_capacity(size),
            position,
            Box::new(move |result| this.on_read_complete(position, result)),
        );
    }

    fn on_read_complete(&self, position: u64, result: Result<ReadOutcome, TransportError>) {
        if self.is_cancelled() {
            trace!("Discarding read at position {} after cancellation", position);
            return;
        }

        match result {
            Ok(ReadOutcome::Data(mut buffer)) => {
                let remaining = self.end.saturating_sub(position);
                let wanted = remaining_chunk_capacity(remaining).min(buffer.len());
                buffer.truncate(wanted);

                let new_position = position + wanted as u64;
                self.position.store(new_position, Ordering::Release);
                if wanted > 0 {
                    if let Ok(mut next) = self.next.lock() {
                        *next = Some(buffer.freeze());
                    }
                }
                if wanted == 0 || new_position >= self.end {
                    self.done.store(true, Ordering::Release);
                }
            }
            Ok(ReadOutcome::EndOfFile) => {
                debug!("End of file at position {} before range end {}", position, self.end);
                self.done.store(true, Ordering::Release);
            }
            Err(e) => {
                if let Ok(mut error) = self.error.lock() {
                    *error = Some(e);
                }
                self.done.store(true, Ordering::Release);
            }
        }

        self.drain();
    }

    fn terminate(&self) {
        let Some(subscriber) = self.subscriber.lock().ok().and_then(|mut slot| slot.take()) else {
            return;
        };
        let error = self.error.lock().ok().and_then(|mut slot| slot.take());
        match error {
            Some(e) => subscriber.on_error(e),
            None => subscriber.on_complete(),
        }
    }

    fn clear(&self) {
        if let Ok(mut subscriber) = self.subscriber.lock() {
            subscriber.take();
        }
        if let Ok(mut next) = self.next.lock() {
            next.take();
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn take_next(&self) -> Option<Bytes> {
        self.next.lock().ok().and_then(|mut next| next.take())
    }

    fn has_no_next(&self) -> bool {
        self.next.lock().map(|next| next.is_none()).unwrap_or(true)
    }

    fn subscriber(&self) -> Option<Arc<dyn Subscriber<Bytes>>> {
        self.subscriber.lock().ok().and_then(|slot| slot.clone())
    }
}

impl<C: AsyncFileChannel> Subscription for FileReadSubscription<C> {
    fn request(&self, n: u64) {
        if n == 0 {
            if let Ok(mut error) = self.error.lock() {
                error.get_or_insert_with(|| {
                    TransportError::IllegalState("Demand must be positive".to_string())
                });
            }
            self.done.store(true, Ordering::Release);
            if let Ok(mut next) = self.next.lock() {
                next.take();
            }
        } else {
            add_cap(&self.requested, n);
        }
        self.drain();
    }

    fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            self.drain();
        }
    }
}

/// A file range as an HTTP body with an exact length. A range that ends
/// early fails with `UnexpectedEof` instead of coming up short.
pub struct FileRangeBody {
    stream: SubscriberStream<Bytes>,
    remaining: u64,
}

impl FileRangeBody {
    pub fn new<C: AsyncFileChannel>(source: &ChunkedFileReadSource<C>) -> Self {
        Self {
            stream: SubscriberStream::new(source),
            remaining: source.length(),
        }
    }
}

impl Body for FileRangeBody {
    type Data = Bytes;
    type Error = TransportError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        match self.stream.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                self.remaining = self.remaining.saturating_sub(chunk.len() as u64);
                Poll::Ready(Some(Ok(Frame::data(chunk))))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e))),
            Poll::Ready(None) if self.remaining > 0 => {
                // The file shrank under us; the promised length can't be met.
                let missing = std::mem::take(&mut self.remaining);
                Poll::Ready(Some(Err(TransportError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("File range ended {} bytes short", missing),
                )))))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }

    fn size_hint(&self) -> SizeHint {
        SizeHint::with_exact(self.remaining)
    }
}

/// Streams `length` bytes of `path` from `offset`, clamped to the file's size.
pub async fn read_file(
    path: impl AsRef<Path>,
    offset: u64,
    length: u64,
    chunk_size: usize,
) -> Result<FileRangeBody, TransportError> {
    let file = tokio::fs::File::open(path.as_ref()).await?;
    let file_len = file.metadata().await?.len();
    let length = length.min(file_len.saturating_sub(offset));

    let channel = BlockingFileChannel::new(file.into_std().await)?;
    let source = ChunkedFileReadSource::new(Arc::new(channel), chunk_size, offset, length);
    Ok(FileRangeBody::new(&source))
}
