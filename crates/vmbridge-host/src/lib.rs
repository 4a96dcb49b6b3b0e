//! Host imports for vmbridge guests.
//!
//! This crate provides the host side of the guest's device interface. The
//! guest emulates a machine whose serial port and timer are backed by these
//! imports:
//!
//! - [`serial`]: `tx`, `keydown` and `rx` over the session's I/O channels
//! - [`timer`]: `elapsed_us` and `wait`
//! - [`linker`]: Registration of every import on an [`vmbridge_core::ImportTable`]
//!
//! # Keydown policy
//!
//! `keydown` is the only import that may suspend the guest. Whether it does
//! is decided per deployment by [`vmbridge_common::KeydownPolicy`]: `poll`
//! answers immediately, `suspend` hands control back to the scheduler for a
//! bounded number of yields while the input queue is empty.

pub mod linker;
pub mod serial;
pub mod timer;

pub use linker::{build_linker, register_all};
pub use serial::SerialHost;
pub use timer::TimerHost;
