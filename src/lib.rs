//! # RayOS Display - virtual encoder
//!
//! Kickoff scheduling and resource control for one logical display output
//! made of up to four physical channels (horizontal tiles).
//!
//! ## Architecture
//!
//! - **Channels**: video-mode (vsync-completed) and command-mode
//!   (ping-pong-done completed) variants behind [`channel::PhysicalChannel`]
//! - **Kickoff**: flush and start sequencing, one combined flush through the
//!   master on split displays
//! - **Completion**: per-channel busy mask and frame-done watchdog
//! - **Resource control**: Off / PreOff / On / Idle state machine gating clocks
//!   and interrupt lines, with delayed idle power-down
//!
//! ## Example
//!
//! ```no_run
//! use rayos_display::hw::sim::{SimPower, SimTopology};
//! use rayos_display::{DisplayInfo, DisplayMode, EncoderConfig, IntfMode, IntfType, KickoffParams, VirtualEncoder};
//! use std::sync::Arc;
//!
//! fn main() -> anyhow::Result<()> {
//!     let topology = SimTopology::new(2);
//!     let display = DisplayInfo {
//!         intf_type: IntfType::Dsi,
//!         intf_mode: IntfMode::Video,
//!         h_tile_instance: vec![0, 1],
//!     };
//!     let enc = VirtualEncoder::setup(0, display, &topology, Arc::new(SimPower::default()), EncoderConfig::default())?;
//!     enc.mode_set(DisplayMode::dsi_1080p60())?;
//!     enc.enable()?;
//!     enc.prepare_kickoff(KickoffParams::default())?;
//!     enc.kickoff()?;
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod completion;
pub mod config;
pub mod encoder;
pub mod error;
pub mod hw;
pub mod kickoff;
pub mod resource_control;
pub mod sync;
pub mod types;
pub mod vsync;
pub mod worker;

pub use config::EncoderConfig;
pub use encoder::{EncoderStatus, FrameEventCallback, VblankCallback, VirtualEncoder};
pub use error::{ConfigError, EncoderError, HwError, Result};
pub use kickoff::KickoffReport;
pub use resource_control::{RcEvent, RcState};
pub use types::*;
