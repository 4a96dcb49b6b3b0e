//! Timer host functions.

use std::hint;
use std::time::{Duration, Instant};

use tracing::trace;

use vmbridge_core::BridgeContext;

/// Host implementation of the guest's timer.
pub struct TimerHost;

impl TimerHost {
    /// Microseconds since the guest last asked, then reset the reference point.
    pub fn elapsed_micros(ctx: &mut BridgeContext) -> f64 {
        ctx.elapsed_micros()
    }

    /// Spin for `micros` microseconds without yielding to the scheduler.
    pub fn busy_wait(ctx: &mut BridgeContext, micros: u32) {
        ctx.metrics.waits += 1;
        trace!(session_id = %ctx.session_id, micros, "wait");
        spin_for(Duration::from_micros(u64::from(micros)));
    }
}

/// Spin the current thread until `duration` has passed.
pub fn spin_for(duration: Duration) {
    let start = Instant::now();
    while start.elapsed() < duration {
        hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmbridge_common::BridgeConfig;

    #[test]
    fn test_spin_for_waits_at_least_duration() {
        let start = Instant::now();
        spin_for(Duration::from_micros(500));
        assert!(start.elapsed() >= Duration::from_micros(500));
    }

    #[test]
    fn test_spin_for_zero() {
        spin_for(Duration::ZERO);
    }

    #[test]
    fn test_busy_wait_advances_clock() {
        let (mut ctx, _channels) = BridgeContext::new("timer".into(), &BridgeConfig::default());

        TimerHost::elapsed_micros(&mut ctx);
        TimerHost::busy_wait(&mut ctx, 2_000);
        let elapsed = TimerHost::elapsed_micros(&mut ctx);

        assert!(elapsed >= 2_000.0, "elapsed = {elapsed}");
        assert_eq!(ctx.metrics.waits, 1);
    }
}
