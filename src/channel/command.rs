//! Command-mode channel: the panel keeps its own frame memory and each
//! kickoff is a one-shot transfer acknowledged by ping-pong-done.

use super::{ChannelCore, ChannelParams, PhysicalChannel};
use crate::error::{EncoderError, Result};
use crate::sync::{IrqContext, MayBlock};
use crate::types::{EnableState, FrameEvent, IntfMode, InterruptKind, KickoffParams};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

pub struct CommandChannel {
    core: ChannelCore,
    pending_ctlstart: AtomicI32,
    /// Consecutive ping-pong-done timeouts
    pp_timeouts: AtomicU32,
    pp_timeout_max_trials: u32,
    autorefresh: AtomicBool,
}

impl CommandChannel {
    pub fn new(params: ChannelParams) -> Arc<Self> {
        let max_trials = params.pp_timeout_max_trials;
        Arc::new_cyclic(|me: &Weak<Self>| {
            let me: Weak<dyn PhysicalChannel> = me.clone();
            Self {
                core: ChannelCore::new(params, me),
                pending_ctlstart: AtomicI32::new(0),
                pp_timeouts: AtomicU32::new(0),
                pp_timeout_max_trials: max_trials,
                autorefresh: AtomicBool::new(false),
            }
        })
    }

    fn intf(&self) -> u32 {
        self.core.intf_index()
    }

    pub fn pp_timeout_count(&self) -> u32 {
        self.pp_timeouts.load(Ordering::SeqCst)
    }

    /// Wait for the previous transfer to finish.
    fn wait_for_idle(&self, token: &mut MayBlock) -> Result<()> {
        match self.core.wait_for_irq(token, InterruptKind::PingPongDone, &self.core.pending_kickoff) {
            Err(EncoderError::Timeout(what)) => {
                self.handle_pp_timeout(token);
                Err(EncoderError::Timeout(what))
            }
            other => other,
        }
    }

    fn handle_pp_timeout(&self, token: &mut MayBlock) {
        let trials = self.pp_timeouts.fetch_add(1, Ordering::SeqCst) + 1;
        let event = if trials >= self.pp_timeout_max_trials {
            if trials == self.pp_timeout_max_trials {
                log::error!("intf{}: panel dead after {} pp_done timeouts", self.intf(), trials);
            }
            FrameEvent::PanelDead
        } else {
            log::error!("intf{}: pp_done timeout #{}", self.intf(), trials);
            FrameEvent::Error
        };

        self.core.complete_pending();
        // Reset the control block before the next kickoff
        self.core.set_enable_state(EnableState::NeedsHardwareReset);

        if let Some(parent) = self.core.parent() {
            let ctx = IrqContext::mask(token);
            parent.handle_frame_done(&ctx, self, event);
        }
    }
}

impl PhysicalChannel for CommandChannel {
    fn core(&self) -> &ChannelCore {
        &self.core
    }

    fn intf_mode(&self) -> IntfMode {
        IntfMode::Command
    }

    fn on_irq(&self, ctx: &IrqContext<'_>, kind: InterruptKind) {
        let parent = self.core.parent();
        match kind {
            InterruptKind::PingPongDone => {
                if !self.core.complete_pending() {
                    log::trace!("intf{}: pp_done with nothing in flight", self.intf());
                }
                self.pp_timeouts.store(0, Ordering::SeqCst);
                // Reported even when nothing was in flight (autorefresh)
                if let Some(parent) = &parent {
                    parent.handle_frame_done(ctx, self, FrameEvent::Done);
                }
                self.core.wake();
            }
            InterruptKind::ReadPtr => {
                self.core.note_vsync();
                if let Some(parent) = &parent {
                    parent.handle_vblank(ctx, self);
                }
                self.core.wake();
            }
            InterruptKind::CtlStart => {
                super::dec_unless_zero(&self.pending_ctlstart);
                self.core.wake();
            }
            InterruptKind::Underrun => {
                self.core.note_underrun();
                if let Some(parent) = &parent {
                    parent.handle_underrun(ctx, self);
                }
            }
            InterruptKind::Vsync => log::debug!("intf{}: unexpected vsync on command channel", self.intf()),
        }
    }

    fn enable(&self, _token: &mut MayBlock) -> Result<()> {
        if self.core.enable_state() == EnableState::Enabled {
            log::debug!("intf{}: already enabled", self.intf());
            return Ok(());
        }
        self.pp_timeouts.store(0, Ordering::SeqCst);
        self.core.set_enable_state(EnableState::Enabled);
        Ok(())
    }

    fn disable(&self, token: &mut MayBlock) {
        if self.core.enable_state() == EnableState::Disabled {
            log::debug!("intf{}: already disabled", self.intf());
            return;
        }
        if self.core.pending_kickoff() > 0 && self.wait_for_idle(token).is_err() {
            self.core.reset_pending();
        }
        self.pending_ctlstart.store(0, Ordering::SeqCst);
        self.autorefresh.store(false, Ordering::SeqCst);
        self.core.set_enable_state(EnableState::Disabled);
    }

    fn irq_control(&self, token: &mut MayBlock, enable: bool) -> Result<()> {
        let mut kinds = vec![InterruptKind::PingPongDone, InterruptKind::Underrun];
        if self.is_master() {
            kinds.push(InterruptKind::CtlStart);
        }

        if !enable {
            for kind in kinds {
                self.unregister_interrupt(token, kind);
            }
            return self.control_vblank_irq(token, false);
        }

        for (done, kind) in kinds.iter().enumerate() {
            if let Err(e) = self.register_interrupt(token, *kind) {
                for registered in &kinds[..done] {
                    self.unregister_interrupt(token, *registered);
                }
                return Err(e);
            }
        }
        if let Err(e) = self.control_vblank_irq(token, true) {
            for kind in kinds {
                self.unregister_interrupt(token, kind);
            }
            return Err(e);
        }
        Ok(())
    }

    fn control_vblank_irq(&self, _token: &mut MayBlock, enable: bool) -> Result<()> {
        // Slaves do not report vblank
        if !self.is_master() {
            return Ok(());
        }
        self.core.control_vblank(InterruptKind::ReadPtr, enable)
    }

    fn prepare_for_kickoff(&self, token: &mut MayBlock, params: &KickoffParams) -> Result<()> {
        if self.core.pending_kickoff() > 0 && self.wait_for_idle(token).is_err() {
            log::error!(
                "intf{}: previous transfer still pending at frame {}",
                self.intf(),
                params.frame
            );
            self.core.reset_pending();
        }
        Ok(())
    }

    fn trigger_start(&self) {
        if self.core.enable_state() == EnableState::Disabled {
            log::debug!("intf{}: start skipped, channel disabled", self.intf());
            return;
        }
        self.pending_ctlstart.fetch_add(1, Ordering::SeqCst);
        self.core.trigger_start();
    }

    fn restore(&self) {
        log::debug!("intf{}: restoring tear check", self.intf());
    }

    fn is_autorefresh_enabled(&self) -> bool {
        self.autorefresh.load(Ordering::SeqCst)
    }

    fn set_autorefresh(&self, enable: bool) -> bool {
        self.autorefresh.store(enable, Ordering::SeqCst);
        true
    }

    fn wait_for_commit_done(&self, token: &mut MayBlock) -> Result<()> {
        if !self.is_master() {
            return Ok(());
        }
        let result = self.core.wait_for_irq(token, InterruptKind::CtlStart, &self.pending_ctlstart);
        if result.is_err() {
            self.pending_ctlstart.store(0, Ordering::SeqCst);
        }
        result
    }

    fn wait_for_tx_complete(&self, token: &mut MayBlock) -> Result<()> {
        self.wait_for_idle(token)
    }

    fn wait_for_vblank(&self, token: &mut MayBlock) -> Result<()> {
        if !self.is_master() {
            return Ok(());
        }
        self.core.wait_vblank(token, InterruptKind::ReadPtr)
    }
}
