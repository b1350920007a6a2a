//! Video-mode channel: continuous scan-out, completion signalled by vsync.

use super::{ChannelCore, ChannelParams, PhysicalChannel};
use crate::error::Result;
use crate::sync::{IrqContext, MayBlock};
use crate::types::{EnableState, FrameEvent, IntfMode, InterruptKind, KickoffParams, Role};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

pub struct VideoChannel {
    core: ChannelCore,
    /// Timing engine is switched on at the first post-kickoff after enable
    timing_pending: AtomicBool,
}

impl VideoChannel {
    pub fn new(params: ChannelParams) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<Self>| {
            let me: Weak<dyn PhysicalChannel> = me.clone();
            Self {
                core: ChannelCore::new(params, me),
                timing_pending: AtomicBool::new(false),
            }
        })
    }

    /// A slave has no vsync line of its own; the master's vsync scans the
    /// whole group out, so its count is retired at the next frame boundary.
    fn retire_slave_kickoffs(&self) {
        let pending = self.core.pending_kickoff();
        if pending > 0 {
            log::trace!("intf{}: retiring {} slave kickoff(s)", self.intf(), pending);
            self.core.reset_pending();
        }
    }

    fn intf(&self) -> u32 {
        self.core.intf_index()
    }
}

impl PhysicalChannel for VideoChannel {
    fn core(&self) -> &ChannelCore {
        &self.core
    }

    fn intf_mode(&self) -> IntfMode {
        IntfMode::Video
    }

    fn on_irq(&self, ctx: &IrqContext<'_>, kind: InterruptKind) {
        let parent = self.core.parent();
        match kind {
            InterruptKind::Vsync => {
                self.core.note_vsync();
                if let Some(parent) = &parent {
                    parent.handle_vblank(ctx, self);
                }
                // The frame is on screen once the flush latched at vsync
                if self.core.complete_pending() {
                    if let Some(parent) = &parent {
                        parent.handle_frame_done(ctx, self, FrameEvent::Done);
                    }
                }
                self.core.wake();
            }
            InterruptKind::Underrun => {
                let count = self.core.note_underrun();
                log::trace!("intf{}: underrun #{}", self.intf(), count);
                if let Some(parent) = &parent {
                    parent.handle_underrun(ctx, self);
                }
            }
            other => log::debug!("intf{}: unexpected {} on video channel", self.intf(), other.name()),
        }
    }

    fn enable(&self, _token: &mut MayBlock) -> Result<()> {
        if self.core.enable_state() == EnableState::Enabled {
            log::debug!("intf{}: already enabled", self.intf());
            return Ok(());
        }
        self.timing_pending.store(true, Ordering::SeqCst);
        self.core.set_enable_state(EnableState::Enabled);
        Ok(())
    }

    fn disable(&self, token: &mut MayBlock) {
        if self.core.enable_state() == EnableState::Disabled {
            log::debug!("intf{}: already disabled", self.intf());
            return;
        }

        self.timing_pending.store(false, Ordering::SeqCst);
        self.core.hw().timing.set_enabled(false);

        // Let the last frame scan out before the engine stops
        if self.is_master() && self.core.pending_kickoff() > 0 {
            let pending = &self.core.pending_kickoff;
            if let Err(e) = self.core.wait_for_irq(token, InterruptKind::Vsync, pending) {
                log::error!("intf{}: final vsync not seen on disable: {}", self.intf(), e);
                self.core.reset_pending();
            }
        } else if !self.is_master() {
            self.retire_slave_kickoffs();
        }

        self.core.set_enable_state(EnableState::Disabled);
    }

    fn irq_control(&self, token: &mut MayBlock, enable: bool) -> Result<()> {
        if enable {
            self.control_vblank_irq(token, true)?;
            if let Err(e) = self.register_interrupt(token, InterruptKind::Underrun) {
                self.control_vblank_irq(token, false)?;
                return Err(e);
            }
        } else {
            self.control_vblank_irq(token, false)?;
            self.unregister_interrupt(token, InterruptKind::Underrun);
        }
        Ok(())
    }

    fn control_vblank_irq(&self, _token: &mut MayBlock, enable: bool) -> Result<()> {
        // Slaves do not report vblank
        if !self.is_master() {
            return Ok(());
        }
        self.core.control_vblank(InterruptKind::Vsync, enable)
    }

    fn needs_single_flush(&self) -> bool {
        self.core.role() != Role::Solo
    }

    fn prepare_for_kickoff(&self, _token: &mut MayBlock, params: &KickoffParams) -> Result<()> {
        if !self.is_master() {
            self.retire_slave_kickoffs();
        }
        if let Err(e) = self.core.ctl().wait_reset_status() {
            log::error!(
                "intf{}: ctl{} reset did not settle before frame {}: {}",
                self.intf(),
                self.core.ctl().index(),
                params.frame,
                e
            );
            self.core.set_enable_state(EnableState::NeedsHardwareReset);
        }
        Ok(())
    }

    fn handle_post_kickoff(&self) {
        if self.timing_pending.swap(false, Ordering::SeqCst) {
            log::debug!("intf{}: enabling timing engine", self.intf());
            self.core.hw().timing.set_enabled(true);
        }
    }

    fn restore(&self) {
        if self.core.enable_state() != EnableState::Disabled {
            self.timing_pending.store(true, Ordering::SeqCst);
        }
    }

    fn wait_for_commit_done(&self, token: &mut MayBlock) -> Result<()> {
        if !self.is_master() {
            return Ok(());
        }
        self.core.wait_for_irq(token, InterruptKind::Vsync, &self.core.pending_kickoff)
    }

    fn wait_for_vblank(&self, token: &mut MayBlock) -> Result<()> {
        if !self.is_master() {
            return Ok(());
        }
        self.core.wait_vblank(token, InterruptKind::Vsync)
    }
}
