//! Per-session store data and store creation.
//!
//! This module provides:
//! - [`BridgeContext`]: State reachable from host imports through [`wasmtime::Caller`]
//! - [`BridgeChannels`]: The host's ends of the guest's I/O channels
//! - [`BridgeMetrics`]: Serial traffic counters

use std::time::{Duration, Instant};

use tokio::sync::watch;
use wasmtime::Store;

use vmbridge_common::{BridgeConfig, HostFunctionError, IoConfig};

use crate::WasmEngine;
use crate::asyncify::{Asyncify, AsyncifyView};
use crate::io::{
    Clock, InputQueue, InputSender, OutputAccumulator, OutputReceiver, OutputTransport,
    input_channel, output_channel,
};

/// Store data for one guest session.
///
/// Owns the asyncify bridge state, the serial device and the clock the
/// guest's imports read. Everything here is only touched from the thread
/// currently driving the store; outside threads reach the guest exclusively
/// through [`BridgeChannels`].
pub struct BridgeContext {
    /// Unique session identifier for tracing.
    pub session_id: String,

    /// Serial traffic counters.
    pub metrics: BridgeMetrics,

    asyncify: Asyncify,
    input: InputQueue,
    output: OutputAccumulator,
    transport: OutputTransport,
    clock: Clock,
    io: IoConfig,
}

/// The host's ends of a session's I/O channels.
#[derive(Debug)]
pub struct BridgeChannels {
    /// Feeds the guest's input queue.
    pub input: InputSender,

    /// Every code the guest writes, in order.
    pub output: OutputReceiver,

    /// Flips to `true` once the readiness sentinel has been written.
    pub ready: watch::Receiver<bool>,
}

/// Serial traffic counters.
#[derive(Debug, Clone)]
pub struct BridgeMetrics {
    /// Codes consumed by the guest.
    pub bytes_in: u64,

    /// Codes written by the guest.
    pub bytes_out: u64,

    /// Number of busy-waits the guest requested.
    pub waits: u64,

    started_at: Instant,
}

impl BridgeMetrics {
    fn new() -> Self {
        Self {
            bytes_in: 0,
            bytes_out: 0,
            waits: 0,
            started_at: Instant::now(),
        }
    }

    /// Time since the session's store was created.
    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }
}

impl BridgeContext {
    /// Create the store data and the host's channel ends.
    pub fn new(session_id: String, config: &BridgeConfig) -> (Self, BridgeChannels) {
        let (input_tx, input) = input_channel();
        let (transport, output_rx) = output_channel();
        let output = OutputAccumulator::new(config.io.sentinel.clone());
        let ready = output.subscribe();

        let context = Self {
            session_id,
            metrics: BridgeMetrics::new(),
            asyncify: Asyncify::new(&config.asyncify),
            input,
            output,
            transport,
            clock: Clock::new(),
            io: config.io.clone(),
        };
        let channels = BridgeChannels {
            input: input_tx,
            output: output_rx,
            ready,
        };

        (context, channels)
    }

    /// Serial device settings.
    pub fn io_config(&self) -> &IoConfig {
        &self.io
    }

    /// The guest's input queue.
    pub fn input(&self) -> &InputQueue {
        &self.input
    }

    /// Take the oldest queued input code.
    pub fn consume_input(&mut self) -> Result<u32, HostFunctionError> {
        let code = self.input.consume()?;
        self.metrics.bytes_in += 1;
        Ok(code)
    }

    /// Record one output code and forward it to the host.
    ///
    /// Readiness is published before the code is forwarded. Returns `true`
    /// if this code made the guest ready.
    pub fn emit_output(&mut self, code: u32) -> bool {
        self.metrics.bytes_out += 1;
        let became_ready = self.output.push(code);
        self.transport.send(code);
        became_ready
    }

    /// Guest output up to readiness.
    pub fn output_text(&self) -> &str {
        self.output.text()
    }

    /// Returns `true` once the readiness sentinel has been written.
    pub fn is_ready(&self) -> bool {
        self.output.is_ready()
    }

    /// Microseconds since the previous query.
    pub fn elapsed_micros(&mut self) -> f64 {
        self.clock.elapsed_micros()
    }

    /// Read-only view of the bridge state.
    pub fn bridge(&self) -> &Asyncify {
        &self.asyncify
    }
}

impl AsyncifyView for BridgeContext {
    fn asyncify(&mut self) -> &mut Asyncify {
        &mut self.asyncify
    }
}

impl std::fmt::Debug for BridgeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeContext")
            .field("session_id", &self.session_id)
            .field("asyncify", &self.asyncify)
            .field("ready", &self.is_ready())
            .field("metrics", &self.metrics)
            .finish_non_exhaustive()
    }
}

/// Create a store for one guest session.
///
/// # Arguments
///
/// * `engine` - The shared Wasmtime engine
/// * `config` - Bridge configuration (asyncify header, sentinel, keydown policy)
/// * `session_id` - Unique session identifier
pub fn create_store(
    engine: &WasmEngine,
    config: &BridgeConfig,
    session_id: String,
) -> (Store<BridgeContext>, BridgeChannels) {
    let (context, channels) = BridgeContext::new(session_id, config);
    (Store::new(engine.inner(), context), channels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmbridge_common::EngineConfig;

    fn config() -> BridgeConfig {
        let mut config = BridgeConfig::default();
        config.io.sentinel = "ok".into();
        config
    }

    #[test]
    fn test_context_creation() {
        let (ctx, _channels) = BridgeContext::new("session-123".into(), &config());

        assert_eq!(ctx.session_id, "session-123");
        assert!(!ctx.is_ready());
        assert!(!ctx.bridge().has_pending());
        assert_eq!(ctx.metrics.bytes_out, 0);
    }

    #[test]
    fn test_emit_output_reaches_channels() {
        let (mut ctx, mut channels) = BridgeContext::new("s".into(), &config());

        assert!(!ctx.emit_output(u32::from('o')));
        assert!(ctx.emit_output(u32::from('k')));

        assert_eq!(channels.output.try_recv().unwrap(), u32::from('o'));
        assert_eq!(channels.output.try_recv().unwrap(), u32::from('k'));
        assert!(*channels.ready.borrow());
        assert_eq!(ctx.output_text(), "ok");
        assert_eq!(ctx.metrics.bytes_out, 2);
    }

    #[test]
    fn test_ready_published_before_completing_code() {
        let (mut ctx, channels) = BridgeContext::new("s".into(), &config());
        let BridgeChannels {
            mut output, ready, ..
        } = channels;

        let reader = std::thread::spawn(move || {
            let mut seen = Vec::new();
            while let Some(code) = output.blocking_recv() {
                seen.push((code, *ready.borrow()));
                if seen.len() == 2 {
                    break;
                }
            }
            seen
        });

        ctx.emit_output(u32::from('o'));
        ctx.emit_output(u32::from('k'));

        let seen = reader.join().unwrap();
        assert_eq!(seen[1], (u32::from('k'), true));
    }

    #[test]
    fn test_consume_input_counts_bytes() {
        let (mut ctx, channels) = BridgeContext::new("s".into(), &config());

        channels.input.send_char('z').unwrap();
        assert!(ctx.input().poll());
        assert_eq!(ctx.consume_input().unwrap(), u32::from('z'));
        assert_eq!(ctx.metrics.bytes_in, 1);
        assert!(ctx.consume_input().is_err());
        assert_eq!(ctx.metrics.bytes_in, 1);
    }

    #[test]
    fn test_store_creation() {
        let engine = WasmEngine::new(&EngineConfig::default()).unwrap();

        let (store, _channels) = create_store(&engine, &config(), "test-123".into());
        assert_eq!(store.data().session_id, "test-123");
    }
}
