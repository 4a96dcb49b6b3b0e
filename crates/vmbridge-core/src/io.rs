//! Serial I/O state shared between the guest and the outside world.
//!
//! - [`InputSender`] / [`InputQueue`]: cross-thread channel of input codes
//!   and the FIFO the guest drains through `keydown`/`rx`
//! - [`OutputAccumulator`]: output text scanned for the readiness sentinel
//! - [`OutputTransport`]: forwards raw output codes to the host
//! - [`Clock`]: reference point for `elapsed_us`

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use vmbridge_common::HostFunctionError;

/// Receiving end of the guest's output stream.
pub type OutputReceiver = mpsc::UnboundedReceiver<u32>;

/// Create a connected input sender and queue.
pub fn input_channel() -> (InputSender, InputQueue) {
    let (tx, rx) = mpsc::unbounded_channel();
    let queue = InputQueue {
        shared: Arc::new(Mutex::new(QueueInner {
            buffer: VecDeque::new(),
            rx,
        })),
    };
    (InputSender { tx }, queue)
}

/// Create a connected output transport and receiver.
pub fn output_channel() -> (OutputTransport, OutputReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    (OutputTransport { tx, closed: false }, rx)
}

/// Sending side of the input channel.
///
/// Cheap to clone and safe to use from any thread. Each message carries one
/// character code; messages reach the guest in the order they were sent.
#[derive(Debug, Clone)]
pub struct InputSender {
    tx: mpsc::UnboundedSender<u32>,
}

impl InputSender {
    /// Send one character code.
    pub fn send(&self, code: u32) -> Result<(), HostFunctionError> {
        self.tx
            .send(code)
            .map_err(|_| HostFunctionError::channel_closed("input"))
    }

    /// Send one character.
    pub fn send_char(&self, c: char) -> Result<(), HostFunctionError> {
        self.send(u32::from(c))
    }

    /// Send every character of `text`, in order.
    pub fn send_str(&self, text: &str) -> Result<(), HostFunctionError> {
        text.chars().try_for_each(|c| self.send_char(c))
    }
}

struct QueueInner {
    buffer: VecDeque<u32>,
    rx: mpsc::UnboundedReceiver<u32>,
}

impl QueueInner {
    fn deliver(&mut self) -> usize {
        let mut delivered = 0;
        while let Ok(code) = self.rx.try_recv() {
            self.buffer.push_back(code);
            delivered += 1;
        }
        delivered
    }
}

/// FIFO of input codes waiting for the guest.
///
/// Clones share the same queue. Messages from the [`InputSender`] are moved
/// into the queue whenever it is inspected, so arrival order is preserved
/// exactly.
#[derive(Clone)]
pub struct InputQueue {
    shared: Arc<Mutex<QueueInner>>,
}

impl InputQueue {
    /// Move every message that has arrived on the channel into the queue.
    pub fn deliver(&self) -> usize {
        self.shared.lock().deliver()
    }

    /// Append a code at the tail.
    pub fn enqueue(&self, code: u32) {
        let mut inner = self.shared.lock();
        inner.deliver();
        inner.buffer.push_back(code);
    }

    /// Returns `true` if at least one code is waiting.
    pub fn poll(&self) -> bool {
        let mut inner = self.shared.lock();
        inner.deliver();
        !inner.buffer.is_empty()
    }

    /// Remove and return the oldest code.
    ///
    /// Calling this on an empty queue is a caller contract violation.
    pub fn consume(&self) -> Result<u32, HostFunctionError> {
        let mut inner = self.shared.lock();
        inner.deliver();
        inner
            .buffer
            .pop_front()
            .ok_or(HostFunctionError::InputQueueEmpty)
    }

    /// Number of codes waiting, including undelivered messages.
    pub fn len(&self) -> usize {
        let mut inner = self.shared.lock();
        inner.deliver();
        inner.buffer.len()
    }

    /// Returns `true` if nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for InputQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InputQueue")
            .field("queued", &self.shared.lock().buffer.len())
            .finish_non_exhaustive()
    }
}

/// Append-only record of guest output with a one-way readiness flag.
#[derive(Debug)]
pub struct OutputAccumulator {
    text: String,
    sentinel: String,
    ready: watch::Sender<bool>,
}

impl OutputAccumulator {
    /// Create an accumulator that turns ready once `sentinel` is emitted.
    pub fn new(sentinel: impl Into<String>) -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            text: String::new(),
            sentinel: sentinel.into(),
            ready,
        }
    }

    /// Append one output code.
    ///
    /// Codes that are not Unicode scalar values are recorded as U+FFFD.
    /// Once ready, codes are no longer recorded. Returns `true` only for the
    /// call that completed the sentinel.
    pub fn push(&mut self, code: u32) -> bool {
        if self.is_ready() {
            return false;
        }

        self.text
            .push(char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER));

        // Checked after every append, so the first match is always a suffix
        if !self.text.ends_with(&self.sentinel) {
            return false;
        }

        self.ready.send_replace(true);
        info!(sentinel = %self.sentinel, output_len = self.text.len(), "Guest ready");
        true
    }

    /// Returns `true` once the sentinel has been seen.
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Subscribe to the readiness flag.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.ready.subscribe()
    }

    /// Output up to and including the code that completed the sentinel.
    ///
    /// Later output is only forwarded on the transport.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// The configured sentinel.
    pub fn sentinel(&self) -> &str {
        &self.sentinel
    }
}

/// Forwards raw output codes to the host.
#[derive(Debug)]
pub struct OutputTransport {
    tx: mpsc::UnboundedSender<u32>,
    closed: bool,
}

impl OutputTransport {
    /// Forward one code. Output is dropped once the receiver is gone.
    pub fn send(&mut self, code: u32) {
        if self.tx.send(code).is_err() && !self.closed {
            self.closed = true;
            warn!("Output receiver dropped; discarding guest output");
        }
    }

    /// Returns `true` once the receiver has been dropped.
    pub fn is_closed(&self) -> bool {
        self.closed || self.tx.is_closed()
    }
}

/// Monotonic reference point for elapsed-time queries.
#[derive(Debug, Clone)]
pub struct Clock {
    last: Instant,
}

impl Clock {
    /// Start the clock now.
    pub fn new() -> Self {
        Self {
            last: Instant::now(),
        }
    }

    /// Microseconds since the previous call (or since creation), then reset.
    pub fn elapsed_micros(&mut self) -> f64 {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last);
        self.last = now;
        elapsed.as_secs_f64() * 1_000_000.0
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
