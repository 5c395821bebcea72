//! # ikvm-server: BMC KVM-over-IP server
//!
//! Streams the host's video output, as captured by the BMC's video engine,
//! to RFB viewers, and relays the primary viewer's keyboard and pointer to
//! the host through the USB HID gadget.
//!
//! ## Modes
//!
//! - **Hardware**: capture engine, Hextile codec and HID gadget device nodes (Linux).
//! - **Simulation**: synthetic test pattern and codec, no input relay (`--simulate`).

pub mod config;
pub mod service;
