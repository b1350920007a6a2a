//! Core types shared by the encoder, its channels and the hardware collaborators.

use serde::Serialize;
use std::fmt;

/// Upper bound on physical channels behind one virtual encoder
/// (two horizontal tiles times two interface variants).
pub const MAX_CHANNELS: usize = 4;

/// Pending-flush bits reported by a control block.
pub type PendingFlushMask = u32;

/// Position of a channel inside a tiled/split configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Role {
    /// Only channel of the encoder
    Solo,
    /// Drives flush/start for the whole tile group
    Master,
    /// Follows the master; never starts on its own
    Slave,
}

impl Role {
    /// Role of the channel at `index` for a display with `tiles` tiles.
    pub fn for_tile(index: usize, tiles: usize) -> Self {
        if tiles <= 1 {
            Role::Solo
        } else if index == 0 {
            Role::Master
        } else {
            Role::Slave
        }
    }
}

/// Channel enable state, owned by the channel itself.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EnableState {
    Disabled = 0,
    Enabled = 1,
    /// A recoverable hardware fault was detected; reset before next trigger
    NeedsHardwareReset = 2,
}

impl EnableState {
    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            1 => EnableState::Enabled,
            2 => EnableState::NeedsHardwareReset,
            _ => EnableState::Disabled,
        }
    }
}

/// How a channel feeds the panel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IntfMode {
    /// Continuous scan-out driven by the timing engine
    Video,
    /// Panel with its own frame memory, updated on demand
    Command,
}

/// Physical interface family of the display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IntfType {
    Dsi,
    Hdmi,
    DisplayPort,
}

/// Interrupt sources a channel may register.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum InterruptKind {
    Vsync = 0,
    Underrun = 1,
    PingPongDone = 2,
    ReadPtr = 3,
    CtlStart = 4,
}

impl InterruptKind {
    pub const COUNT: usize = 5;

    pub const ALL: [InterruptKind; InterruptKind::COUNT] = [
        InterruptKind::Vsync,
        InterruptKind::Underrun,
        InterruptKind::PingPongDone,
        InterruptKind::ReadPtr,
        InterruptKind::CtlStart,
    ];

    pub fn slot(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            InterruptKind::Vsync => "vsync_irq",
            InterruptKind::Underrun => "underrun",
            InterruptKind::PingPongDone => "pp_done",
            InterruptKind::ReadPtr => "pp_rd_ptr",
            InterruptKind::CtlStart => "ctl_start",
        }
    }
}

/// Index of a line in the interrupt controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct IrqIndex(pub u32);

impl fmt::Display for IrqIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "irq{}", self.0)
    }
}

/// Frame lifecycle notifications delivered to the compositor.
///
/// `Done`, `Error` and `PanelDead` are siblings: a frame ends with exactly one
/// of them, through the same callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FrameEvent {
    Done,
    Error,
    PanelDead,
    /// Resources were released after the idle timeout
    Idle,
}

impl FrameEvent {
    /// Ends an outstanding frame (as opposed to a pure notification).
    pub fn completes_frame(self) -> bool {
        !matches!(self, FrameEvent::Idle)
    }

    pub(crate) fn severity(self) -> u8 {
        match self {
            FrameEvent::Idle => 0,
            FrameEvent::Done => 1,
            FrameEvent::Error => 2,
            FrameEvent::PanelDead => 3,
        }
    }
}

/// Events a caller can block on with `wait_for_event`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum WaitEvent {
    CommitDone,
    TxComplete,
    Vblank,
}

/// Adjusted display mode. Pixel clock is in kHz.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DisplayMode {
    pub clock_khz: u32,
    pub hdisplay: u32,
    pub htotal: u32,
    pub vdisplay: u32,
    pub vtotal: u32,
    pub vrefresh: u32,
}

impl DisplayMode {
    /// 1080x2340 at 60 Hz, a typical command/video DSI panel.
    pub fn dsi_1080p60() -> Self {
        Self {
            clock_khz: 167_000,
            hdisplay: 1080,
            htotal: 1184,
            vdisplay: 2340,
            vtotal: 2350,
            vrefresh: 60,
        }
    }
}

/// What the topology service knows about the connected display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayInfo {
    pub intf_type: IntfType,
    pub intf_mode: IntfMode,
    /// Controller id for each horizontal tile, left-most first
    pub h_tile_instance: Vec<u32>,
}

impl DisplayInfo {
    pub fn num_h_tiles(&self) -> usize {
        self.h_tile_instance.len()
    }
}

/// Per-frame submission parameters handed to `prepare_kickoff`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KickoffParams {
    /// Compositor frame sequence number, used for tracing
    pub frame: u64,
}

/// Read-only aggregation of what the channels consume.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct HwResources {
    pub display_num_of_h_tiles: usize,
    /// `(interface index, mode)` for every channel, in channel order
    pub intfs: Vec<(u32, IntfMode)>,
    /// Control blocks used, in channel order
    pub ctls: Vec<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_follow_tile_position() {
        assert_eq!(Role::for_tile(0, 1), Role::Solo);
        assert_eq!(Role::for_tile(0, 2), Role::Master);
        assert_eq!(Role::for_tile(1, 2), Role::Slave);
    }

    #[test]
    fn idle_is_not_a_completion() {
        assert!(FrameEvent::Done.completes_frame());
        assert!(FrameEvent::PanelDead.completes_frame());
        assert!(!FrameEvent::Idle.completes_frame());
        assert!(FrameEvent::PanelDead.severity() > FrameEvent::Error.severity());
    }
}
