//! Serial device host functions.
//!
//! The guest talks to a UART-like device through three imports: `tx` writes
//! one code, `keydown` reports whether input is waiting and `rx` takes the
//! oldest waiting code. `rx` is only valid after an affirmative `keydown`.

use tokio::task;
use tracing::trace;

use vmbridge_common::{HostFunctionError, KeydownPolicy};
use vmbridge_core::{BridgeContext, HostReturn};

/// Host implementation of the serial device.
pub struct SerialHost;

impl SerialHost {
    /// Write one output code.
    ///
    /// Returns `true` if this code completed the readiness sentinel.
    pub fn transmit(ctx: &mut BridgeContext, code: u32) -> bool {
        trace!(session_id = %ctx.session_id, code, "tx");
        ctx.emit_output(code)
    }

    /// Non-blocking check for waiting input.
    pub fn poll_input(ctx: &BridgeContext) -> bool {
        ctx.input().poll()
    }

    /// Answer a `keydown` query according to the configured policy.
    ///
    /// Input that is already queued is always reported immediately. On an
    /// empty queue, [`KeydownPolicy::Poll`] answers `false` right away while
    /// [`KeydownPolicy::Suspend`] suspends the guest and re-checks the queue
    /// after each of up to `keydown_poll_attempts` scheduler yields.
    pub fn keydown(ctx: &BridgeContext) -> HostReturn {
        if Self::poll_input(ctx) {
            return HostReturn::value(1i32);
        }

        let io = ctx.io_config();
        match io.keydown_policy {
            KeydownPolicy::Poll => HostReturn::value(0i32),
            KeydownPolicy::Suspend => {
                let queue = ctx.input().clone();
                let attempts = io.keydown_poll_attempts;
                HostReturn::deferred(async move {
                    for _ in 0..attempts {
                        task::yield_now().await;
                        if queue.poll() {
                            return 1i32;
                        }
                    }
                    0i32
                })
            }
        }
    }

    /// Take the oldest waiting input code.
    ///
    /// # Errors
    ///
    /// Returns [`HostFunctionError::InputQueueEmpty`] if nothing is waiting;
    /// the guest skipped its `keydown` check.
    pub fn receive(ctx: &mut BridgeContext) -> Result<u32, HostFunctionError> {
        let code = ctx.consume_input()?;
        trace!(session_id = %ctx.session_id, code, "rx");
        Ok(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmbridge_common::BridgeConfig;
    use vmbridge_core::BridgeChannels;

    fn context(policy: KeydownPolicy, attempts: u32) -> (BridgeContext, BridgeChannels) {
        let mut config = BridgeConfig::default();
        config.io.keydown_policy = policy;
        config.io.keydown_poll_attempts = attempts;
        BridgeContext::new("serial-test".into(), &config)
    }

    fn resolve(ret: HostReturn) -> Option<i32> {
        match ret {
            HostReturn::Ready(value) => value.and_then(|v| v.i32()),
            HostReturn::Deferred(future) => tokio_test::block_on(future).and_then(|v| v.i32()),
        }
    }

    #[test]
    fn test_transmit_flips_ready() {
        let (mut ctx, mut channels) = context(KeydownPolicy::Poll, 1);

        let flips: Vec<bool> = "login:"
            .chars()
            .map(|c| SerialHost::transmit(&mut ctx, u32::from(c)))
            .collect();

        assert_eq!(flips, vec![false, false, false, false, false, true]);
        assert_eq!(channels.output.try_recv().unwrap(), u32::from('l'));
    }

    #[test]
    fn test_keydown_poll_policy() {
        let (ctx, channels) = context(KeydownPolicy::Poll, 1);

        let ret = SerialHost::keydown(&ctx);
        assert!(!ret.is_deferred());
        assert_eq!(resolve(ret), Some(0));

        channels.input.send_char('a').unwrap();
        assert_eq!(resolve(SerialHost::keydown(&ctx)), Some(1));
    }

    #[test]
    fn test_keydown_suspend_with_queued_input_is_immediate() {
        let (ctx, channels) = context(KeydownPolicy::Suspend, 1);
        channels.input.send_char('a').unwrap();

        let ret = SerialHost::keydown(&ctx);
        assert!(!ret.is_deferred());
        assert_eq!(resolve(ret), Some(1));
    }

    #[test]
    fn test_keydown_suspend_gives_up() {
        let (ctx, _channels) = context(KeydownPolicy::Suspend, 3);

        let ret = SerialHost::keydown(&ctx);
        assert!(ret.is_deferred());
        assert_eq!(resolve(ret), Some(0));
    }

    #[test]
    fn test_keydown_suspend_sees_late_input() {
        let (ctx, channels) = context(KeydownPolicy::Suspend, 1);

        let ret = SerialHost::keydown(&ctx);
        assert!(ret.is_deferred());

        // Arrives while the guest is suspended
        channels.input.send_char('x').unwrap();
        assert_eq!(resolve(ret), Some(1));
    }

    #[test]
    fn test_receive_in_order() {
        let (mut ctx, channels) = context(KeydownPolicy::Poll, 1);
        channels.input.send_str("ab").unwrap();

        assert_eq!(SerialHost::receive(&mut ctx).unwrap(), u32::from('a'));
        assert_eq!(SerialHost::receive(&mut ctx).unwrap(), u32::from('b'));
    }

    #[test]
    fn test_receive_without_keydown() {
        let (mut ctx, _channels) = context(KeydownPolicy::Poll, 1);

        assert!(matches!(
            SerialHost::receive(&mut ctx),
            Err(HostFunctionError::InputQueueEmpty)
        ));
    }
}
