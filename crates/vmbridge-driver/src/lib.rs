//! Run loop and session lifecycle for vmbridge.
//!
//! This crate turns a compiled guest into a running machine:
//!
//! - [`Session`]: engine, configuration and host imports shared by guests
//! - [`CoreDriver`]: the boot/run loop that single-steps the guest core
//! - [`SessionHandle`]: input, output and readiness for the host side
//!
//! # Quick Start
//!
//! ```ignore
//! use vmbridge_common::BridgeConfig;
//! use vmbridge_driver::Session;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let session = Session::new(BridgeConfig::default())?;
//!     let module = session.load_file("guest.wasm")?;
//!     let (driver, mut handle) = session.start(&module)?;
//!
//!     let run = driver.spawn_thread()?;
//!     handle.wait_ready().await?;
//!     handle.send_str("root\n")?;
//!
//!     if let Ok(Err(e)) = run.join() {
//!         return Err(e.into());
//!     }
//!     Ok(())
//! }
//! ```

pub mod driver;
pub mod session;

pub use driver::{CoreDriver, DriverMode, DriverStats};
pub use session::{Session, SessionHandle};
