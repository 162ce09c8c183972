use crate::error::TransportError;
use crate::reactive::{default_hooks, DroppedSignalHooks, Publisher, Subscriber, Subscription};
use bytes::Bytes;
use log::debug;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::oneshot;

/// Destination for the bytes of a stream.
pub trait ByteSink: Send {
    /// Writes a prefix of `buf` and returns its length. The caller offers the
    /// rest again.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// [`ByteSink`] over any [`std::io::Write`], optionally handing the writer at
/// most `max_bytes_per_write` bytes per call.
#[derive(Debug)]
pub struct WriteSink<W> {
    writer: W,
    max_bytes_per_write: Option<usize>,
}

impl<W: Write + Send> WriteSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            max_bytes_per_write: None,
        }
    }

    pub fn with_max_bytes_per_write(mut self, max: Option<usize>) -> Self {
        self.max_bytes_per_write = max.filter(|max| *max > 0);
        self
    }

    pub fn get_ref(&self) -> &W {
        &self.writer
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write + Send> ByteSink for WriteSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let Some(max) = self.max_bytes_per_write else {
            return self.writer.write(buf);
        };

        let mut written = 0;
        while written < buf.len() {
            let end = buf.len().min(written + max);
            match self.writer.write(&buf[written..end]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if written > 0 => {
                    debug!("Partial write of {} bytes before error: {}", written, e);
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

pub type WriteResult = oneshot::Receiver<Result<(), TransportError>>;

/// Writes every buffer of a byte stream into a [`ByteSink`], one at a time.
///
/// The next buffer is requested only after the current one has been fully
/// written, so the sink never sees two buffers in flight. The outcome arrives
/// once on the receiver returned by [`ByteStreamWriteSubscriber::new`].
pub struct ByteStreamWriteSubscriber<S> {
    sink: Mutex<S>,
    subscription: OnceLock<Arc<dyn Subscription>>,
    terminated: AtomicBool,
    result: Mutex<Option<oneshot::Sender<Result<(), TransportError>>>>,
    hooks: Arc<dyn DroppedSignalHooks>,
}

impl<S: ByteSink> ByteStreamWriteSubscriber<S> {
    pub fn new(sink: S) -> (Arc<Self>, WriteResult) {
        Self::with_hooks(sink, default_hooks())
    }

    pub fn with_hooks(sink: S, hooks: Arc<dyn DroppedSignalHooks>) -> (Arc<Self>, WriteResult) {
        let (tx, rx) = oneshot::channel();
        let subscriber = Arc::new(Self {
            sink: Mutex::new(sink),
            subscription: OnceLock::new(),
            terminated: AtomicBool::new(false),
            result: Mutex::new(Some(tx)),
            hooks,
        });
        (subscriber, rx)
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    fn request_next(&self) {
        if let Some(subscription) = self.subscription.get() {
            subscription.request(1);
        }
    }

    fn cancel_upstream(&self) {
        if let Some(subscription) = self.subscription.get() {
            subscription.cancel();
        }
    }

    fn signal(&self, result: Result<(), TransportError>) {
        let sender = self.result.lock().ok().and_then(|mut slot| slot.take());
        if let Some(sender) = sender {
            if sender.send(result).is_err() {
                debug!("Write result receiver dropped");
            }
        }
    }

    fn write_buffer(&self, buffer: &[u8]) -> Result<(), TransportError> {
        let mut sink = self
            .sink
            .lock()
            .map_err(|_| TransportError::IllegalState("Byte sink lock poisoned".to_string()))?;

        let mut offset = 0;
        while offset < buffer.len() {
            let written = sink.write(&buffer[offset..])?;
            if written == 0 {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "Byte sink accepted no bytes").into());
            }
            offset += written;
        }
        Ok(())
    }
}

impl<S: ByteSink> Subscriber<Bytes> for ByteStreamWriteSubscriber<S> {
    fn on_subscribe(&self, subscription: Arc<dyn Subscription>) {
        if self.subscription.set(subscription.clone()).is_err() {
            debug!("Write subscriber already subscribed, cancelling new subscription");
            subscription.cancel();
            return;
        }
        subscription.request(1);
    }

    fn on_next(&self, buffer: Bytes) {
        if self.is_terminated() {
            self.hooks.on_next_dropped(&buffer);
            return;
        }
        if buffer.is_empty() {
            self.request_next();
            return;
        }

        match self.write_buffer(&buffer) {
            Ok(()) => self.request_next(),
            Err(e) => {
                if !self.terminated.swap(true, Ordering::AcqRel) {
                    self.cancel_upstream();
                    self.signal(Err(e));
                } else {
                    self.hooks.on_error_dropped(&e);
                }
            }
        }
    }

    fn on_error(&self, error: TransportError) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            self.hooks.on_error_dropped(&error);
            return;
        }
        self.cancel_upstream();
        self.signal(Err(error));
    }

    fn on_complete(&self) {
        if self.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        let flushed = match self.sink.lock() {
            Ok(mut sink) => sink.flush().map_err(TransportError::from),
            Err(_) => Err(TransportError::IllegalState("Byte sink lock poisoned".to_string())),
        };
        self.signal(flushed);
    }
}

/// Subscribes a fresh write subscriber to `publisher` and waits for the
/// transfer to finish.
pub async fn write_publisher<P, S>(publisher: &P, sink: S) -> Result<(), TransportError>
where
    P: Publisher<Bytes> + ?Sized,
    S: ByteSink + 'static,
{
    let (subscriber, result) = ByteStreamWriteSubscriber::new(sink);
    publisher.subscribe(subscriber);
    result.await.map_err(|_| {
        TransportError::IllegalState("Publisher finished without a terminal signal".to_string())
    })?
}
