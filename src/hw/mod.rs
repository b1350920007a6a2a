//! Contracts of the register-level collaborators.
//!
//! The scheduler never touches registers itself. Everything below is provided
//! by the platform (or by [`sim`] on a host).

pub mod sim;

use crate::error::HwError;
use crate::types::{IntfType, InterruptKind, IrqIndex, PendingFlushMask};
use std::sync::Arc;

/// Interrupt handler, invoked in interrupt-equivalent context.
pub type IrqHandler = Arc<dyn Fn(IrqIndex) + Send + Sync>;

/// Per-channel hardware control block (CTL).
pub trait ControlBlock: Send + Sync {
    fn index(&self) -> u32;

    fn trigger_flush(&self);

    fn trigger_start(&self);

    fn get_pending_flush(&self) -> PendingFlushMask;

    fn update_pending_flush(&self, bits: PendingFlushMask);

    fn clear_pending_flush(&self) {}

    /// Kick a pending (auto-refresh) update on command-mode panels.
    fn trigger_pending(&self) {}

    fn reset(&self) -> Result<(), HwError>;

    /// Check that a previous reset settled.
    fn wait_reset_status(&self) -> Result<(), HwError> {
        Ok(())
    }
}

pub trait InterruptController: Send + Sync {
    /// Resolve the interrupt line for `kind` on hardware block `hw_idx`.
    fn lookup(&self, kind: InterruptKind, hw_idx: u32) -> Option<IrqIndex>;

    fn register_callback(&self, irq: IrqIndex, handler: IrqHandler) -> Result<(), HwError>;

    fn unregister_callback(&self, irq: IrqIndex);

    fn enable(&self, irq: IrqIndex) -> Result<(), HwError>;

    fn disable(&self, irq: IrqIndex);

    /// Raw status of the line, regardless of whether it is enabled.
    fn read_status(&self, irq: IrqIndex, clear: bool) -> bool;
}

/// Interface timing generator.
pub trait TimingEngine: Send + Sync {
    /// Current scan line.
    fn line_count(&self) -> u32;

    fn set_enabled(&self, enabled: bool);

    fn is_enabled(&self) -> bool;
}

/// Clock/power votes. Reference counted by the implementation.
pub trait PowerService: Send + Sync {
    fn acquire(&self) -> Result<(), HwError>;

    fn release(&self);
}

/// Result of hardware-block reservation for one tile.
pub trait Topology: Send + Sync {
    fn bind(&self, intf_type: IntfType, controller_id: u32) -> Option<ChannelHw>;
}

/// The hardware one physical channel drives.
#[derive(Clone)]
pub struct ChannelHw {
    pub intf_index: u32,
    pub ctl: Arc<dyn ControlBlock>,
    pub irq: Arc<dyn InterruptController>,
    pub timing: Arc<dyn TimingEngine>,
}

impl std::fmt::Debug for ChannelHw {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelHw")
            .field("intf_index", &self.intf_index)
            .field("ctl", &self.ctl.index())
            .finish()
    }
}
