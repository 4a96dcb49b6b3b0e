//! The run loop that single-steps the guest core.
//!
//! [`CoreDriver`] starts in [`DriverMode::Booting`], calling the step export
//! back-to-back until the guest writes its readiness sentinel. It then
//! switches to [`DriverMode::Running`] for good: bursts of `quantum` steps,
//! each followed by exactly one scheduler yield so queued input can be
//! delivered and output observed.

use std::convert::Infallible;
use std::fmt;
use std::thread;

use tokio::{runtime, task};
use tracing::{debug, error, info, instrument};

use vmbridge_common::{BridgeError, DriverConfig};
use vmbridge_core::{ExportHandle, GuestInstance};

/// Scheduling mode of the run loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverMode {
    /// One step per tick, no yields, until the guest is ready.
    Booting,
    /// `quantum` steps per tick followed by one yield.
    Running,
}

impl fmt::Display for DriverMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverMode::Booting => write!(f, "booting"),
            DriverMode::Running => write!(f, "running"),
        }
    }
}

/// Run loop counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverStats {
    /// Completed step calls.
    pub steps: u64,
    /// Completed Running bursts.
    pub bursts: u64,
    /// Scheduler yields between bursts.
    pub yields: u64,
}

/// Drives one guest instance for the lifetime of the process.
pub struct CoreDriver {
    guest: GuestInstance,
    step: ExportHandle,
    quantum: u32,
    mode: DriverMode,
    stats: DriverStats,
}

impl CoreDriver {
    /// Create a driver for `guest`, resolving its step export.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::ExportNotFound`] if the guest has no export
    /// named `config.step_export`.
    pub fn new(guest: GuestInstance, config: &DriverConfig) -> Result<Self, BridgeError> {
        let step = guest.require_export(&config.step_export)?;

        Ok(Self {
            guest,
            step,
            quantum: config.quantum,
            mode: DriverMode::Booting,
            stats: DriverStats::default(),
        })
    }

    /// Current scheduling mode.
    pub fn mode(&self) -> DriverMode {
        self.mode
    }

    /// Run loop counters.
    pub fn stats(&self) -> DriverStats {
        self.stats
    }

    /// Steps per Running burst.
    pub fn quantum(&self) -> u32 {
        self.quantum
    }

    /// The driven guest.
    pub fn guest(&self) -> &GuestInstance {
        &self.guest
    }

    /// Mutable access to the driven guest.
    pub fn guest_mut(&mut self) -> &mut GuestInstance {
        &mut self.guest
    }

    /// Call the step export once, through the bridge.
    pub async fn step(&mut self) -> Result<(), BridgeError> {
        self.guest.call(self.step, &[]).await?;
        self.stats.steps += 1;
        Ok(())
    }

    /// Run one iteration of the loop for the current mode.
    ///
    /// Returns the mode the driver is in afterwards.
    pub async fn tick(&mut self) -> Result<DriverMode, BridgeError> {
        match self.mode {
            DriverMode::Booting => {
                self.step().await?;
                if self.guest.context().is_ready() {
                    self.mode = DriverMode::Running;
                    info!(
                        session_id = %self.guest.context().session_id,
                        steps = self.stats.steps,
                        quantum = self.quantum,
                        "Guest ready, switching to running mode"
                    );
                }
            }
            DriverMode::Running => {
                for _ in 0..self.quantum {
                    self.step().await?;
                }
                self.stats.bursts += 1;

                task::yield_now().await;
                self.stats.yields += 1;
            }
        }
        Ok(self.mode)
    }

    /// Drive the guest forever.
    ///
    /// Never returns normally; the only way out is a fatal bridge error. To
    /// stop the loop from outside, drop the future.
    #[instrument(skip(self), fields(session_id = %self.guest.context().session_id))]
    pub async fn run(mut self) -> Result<Infallible, BridgeError> {
        debug!(quantum = self.quantum, "Run loop started");
        loop {
            if let Err(e) = self.tick().await {
                error!(
                    error = %e,
                    mode = %self.mode,
                    steps = self.stats.steps,
                    "Run loop stopped"
                );
                return Err(e);
            }
        }
    }
}

impl CoreDriver {
    /// Run the guest on a dedicated thread with its own current-thread runtime.
    ///
    /// A booting guest never yields, so tasks sharing its runtime worker do
    /// not run until readiness. The thread ends when [`CoreDriver::run`]
    /// returns a fatal error.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Io`] if the runtime or the thread cannot be
    /// created.
    pub fn spawn_thread(
        self,
    ) -> Result<thread::JoinHandle<Result<Infallible, BridgeError>>, BridgeError> {
        let runtime = runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let handle = thread::Builder::new()
            .name("vmbridge-core".into())
            .spawn(move || runtime.block_on(self.run()))?;
        Ok(handle)
    }
}

impl fmt::Debug for CoreDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreDriver")
            .field("mode", &self.mode)
            .field("quantum", &self.quantum)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}
