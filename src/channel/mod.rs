//! Physical channels: one hardware output pipe each.
//!
//! [`PhysicalChannel`] is the per-variant contract. The state every variant
//! shares (role, enable state, interrupt slots, in-flight kickoff counter)
//! lives in [`ChannelCore`], and the provided trait methods operate on it.

pub mod command;
pub mod video;

pub use command::CommandChannel;
pub use video::VideoChannel;

use crate::config::EncoderConfig;
use crate::error::{EncoderError, HwError, Result};
use crate::hw::{ChannelHw, ControlBlock, IrqHandler};
use crate::sync::{IrqContext, MayBlock, WaitQueue};
use crate::types::{
    DisplayMode, EnableState, FrameEvent, IntfMode, InterruptKind, IrqIndex, KickoffParams,
    PendingFlushMask, Role,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicI32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Notifications a channel sends to the encoder that owns it. All of them
/// run in interrupt-equivalent context.
pub trait EncoderEvents: Send + Sync {
    fn handle_vblank(&self, ctx: &IrqContext<'_>, channel: &dyn PhysicalChannel);

    fn handle_underrun(&self, ctx: &IrqContext<'_>, channel: &dyn PhysicalChannel);

    fn handle_frame_done(&self, ctx: &IrqContext<'_>, channel: &dyn PhysicalChannel, event: FrameEvent);
}

/// Everything needed to build a channel.
pub struct ChannelParams {
    pub index: usize,
    pub role: Role,
    pub hw: ChannelHw,
    pub parent: Weak<dyn EncoderEvents>,
    pub irq_timeout: Duration,
    pub coalesced_irq_fallback: bool,
    pub pp_timeout_max_trials: u32,
}

impl ChannelParams {
    pub fn new(
        index: usize,
        role: Role,
        hw: ChannelHw,
        parent: Weak<dyn EncoderEvents>,
        config: &EncoderConfig,
    ) -> Self {
        Self {
            index,
            role,
            hw,
            parent,
            irq_timeout: config.irq_wait_timeout(),
            coalesced_irq_fallback: config.coalesced_irq_fallback,
            pp_timeout_max_trials: config.pp_timeout_max_trials,
        }
    }
}

/// Build the channel variant for `mode`.
pub fn create_channel(mode: IntfMode, params: ChannelParams) -> Arc<dyn PhysicalChannel> {
    match mode {
        IntfMode::Video => VideoChannel::new(params),
        IntfMode::Command => CommandChannel::new(params),
    }
}

/// Registration record for one interrupt kind.
#[derive(Default)]
struct IrqSlot {
    /// `None` while not registered
    irq_idx: Option<IrqIndex>,
    handler: Option<IrqHandler>,
}

/// Channel state reported along with a diagnostic-dump request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelSnapshot {
    pub index: usize,
    pub role: Role,
    pub intf_index: u32,
    pub ctl_index: u32,
    pub enable_state: EnableState,
    pub pending_kickoff: i32,
    pub vsync_count: u64,
    pub underrun_count: u64,
    pub registered: Vec<&'static str>,
}

/// A hardware reset failed; the caller should dump diagnostics.
#[derive(Debug, Clone, thiserror::Error)]
#[error("reset of intf{} (ctl{}) failed: {}", .snapshot.intf_index, .snapshot.ctl_index, .reason)]
pub struct DiagnosticRequest {
    pub snapshot: ChannelSnapshot,
    pub reason: HwError,
}

pub struct ChannelCore {
    index: usize,
    role: Role,
    hw: ChannelHw,
    parent: Weak<dyn EncoderEvents>,
    me: Weak<dyn PhysicalChannel>,
    enable_state: AtomicU8,
    slots: Mutex<[IrqSlot; InterruptKind::COUNT]>,
    vblank_refs: Mutex<u32>,
    pending_kickoff: AtomicI32,
    pending_vblank: AtomicI32,
    vsync_count: AtomicU64,
    underrun_count: AtomicU64,
    wait: WaitQueue,
    irq_timeout: Duration,
    coalesced_irq_fallback: bool,
    mode: Mutex<Option<DisplayMode>>,
}

impl ChannelCore {
    pub(crate) fn new(params: ChannelParams, me: Weak<dyn PhysicalChannel>) -> Self {
        Self {
            index: params.index,
            role: params.role,
            hw: params.hw,
            parent: params.parent,
            me,
            enable_state: AtomicU8::new(EnableState::Disabled as u8),
            slots: Mutex::new(Default::default()),
            vblank_refs: Mutex::new(0),
            pending_kickoff: AtomicI32::new(0),
            pending_vblank: AtomicI32::new(0),
            vsync_count: AtomicU64::new(0),
            underrun_count: AtomicU64::new(0),
            wait: WaitQueue::new(),
            irq_timeout: params.irq_timeout,
            coalesced_irq_fallback: params.coalesced_irq_fallback,
            mode: Mutex::new(None),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn intf_index(&self) -> u32 {
        self.hw.intf_index
    }

    pub fn ctl(&self) -> &Arc<dyn ControlBlock> {
        &self.hw.ctl
    }

    pub fn enable_state(&self) -> EnableState {
        EnableState::from_u8(self.enable_state.load(Ordering::SeqCst))
    }

    pub(crate) fn set_enable_state(&self, state: EnableState) {
        let prev = EnableState::from_u8(self.enable_state.swap(state as u8, Ordering::SeqCst));
        if prev != state {
            log::debug!("intf{}: {:?} -> {:?}", self.hw.intf_index, prev, state);
        }
    }

    pub fn pending_kickoff(&self) -> i32 {
        self.pending_kickoff.load(Ordering::SeqCst)
    }

    pub(crate) fn reset_pending(&self) {
        self.pending_kickoff.store(0, Ordering::SeqCst);
        self.wait.wake_all();
    }

    /// Decrement the in-flight count unless it is already zero.
    pub(crate) fn complete_pending(&self) -> bool {
        dec_unless_zero(&self.pending_kickoff)
    }

    pub fn vsync_count(&self) -> u64 {
        self.vsync_count.load(Ordering::SeqCst)
    }

    pub fn underrun_count(&self) -> u64 {
        self.underrun_count.load(Ordering::SeqCst)
    }

    pub(crate) fn note_vsync(&self) {
        self.vsync_count.fetch_add(1, Ordering::SeqCst);
        dec_unless_zero(&self.pending_vblank);
    }

    pub(crate) fn note_underrun(&self) -> u64 {
        self.underrun_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn wake(&self) {
        self.wait.wake_all();
    }

    pub(crate) fn parent(&self) -> Option<Arc<dyn EncoderEvents>> {
        self.parent.upgrade()
    }

    pub fn mode(&self) -> Option<DisplayMode> {
        *self.mode.lock()
    }

    pub(crate) fn set_mode(&self, mode: DisplayMode) {
        *self.mode.lock() = Some(mode);
    }

    pub fn line_count(&self) -> u32 {
        self.hw.timing.line_count()
    }

    pub(crate) fn hw(&self) -> &ChannelHw {
        &self.hw
    }

    pub fn is_registered(&self, kind: InterruptKind) -> bool {
        self.slots.lock()[kind.slot()].handler.is_some()
    }

    fn hw_index(&self, kind: InterruptKind) -> u32 {
        match kind {
            InterruptKind::CtlStart => self.hw.ctl.index(),
            _ => self.hw.intf_index,
        }
    }

    pub(crate) fn register_interrupt(&self, kind: InterruptKind) -> Result<()> {
        let mut slots = self.slots.lock();
        let slot = &mut slots[kind.slot()];
        if slot.handler.is_some() {
            log::trace!("intf{}: {} already registered", self.hw.intf_index, kind.name());
            return Ok(());
        }

        let irq = self.hw.irq.lookup(kind, self.hw_index(kind)).ok_or_else(|| {
            EncoderError::InvalidArgument(format!(
                "no {} line for intf{}",
                kind.name(),
                self.hw.intf_index
            ))
        })?;

        let handler: IrqHandler = {
            let me = self.me.clone();
            Arc::new(move |_irq| {
                if let Some(channel) = me.upgrade() {
                    channel.on_irq(&IrqContext::enter(), kind);
                }
            })
        };

        self.hw.irq.register_callback(irq, handler.clone()).map_err(|e| {
            log::error!("intf{}: failed to register {} ({}): {}", self.hw.intf_index, kind.name(), irq, e);
            e
        })?;

        if let Err(e) = self.hw.irq.enable(irq) {
            log::error!("intf{}: failed to enable {} ({}): {}", self.hw.intf_index, kind.name(), irq, e);
            self.hw.irq.unregister_callback(irq);
            return Err(EncoderError::HardwareRejected(e));
        }

        slot.irq_idx = Some(irq);
        slot.handler = Some(handler);
        log::debug!("intf{}: registered {} on {}", self.hw.intf_index, kind.name(), irq);
        Ok(())
    }

    pub(crate) fn unregister_interrupt(&self, kind: InterruptKind) {
        let mut slots = self.slots.lock();
        let slot = &mut slots[kind.slot()];
        match (slot.irq_idx.take(), slot.handler.take()) {
            (Some(irq), Some(_)) => {
                self.hw.irq.disable(irq);
                self.hw.irq.unregister_callback(irq);
                log::debug!("intf{}: unregistered {} on {}", self.hw.intf_index, kind.name(), irq);
            }
            _ => log::warn!("intf{}: {} was not registered", self.hw.intf_index, kind.name()),
        }
    }

    /// Reference-counted registration of the vblank source `kind`.
    pub(crate) fn control_vblank(&self, kind: InterruptKind, enable: bool) -> Result<()> {
        let mut refs = self.vblank_refs.lock();
        if enable {
            if *refs == 0 {
                self.register_interrupt(kind)?;
            }
            *refs += 1;
        } else if *refs == 0 {
            log::warn!("intf{}: vblank refcount underflow", self.hw.intf_index);
        } else {
            *refs -= 1;
            if *refs == 0 {
                self.unregister_interrupt(kind);
            }
        }
        Ok(())
    }

    /// Count one more kickoff in flight, whether or not this channel was
    /// flushed itself.
    pub(crate) fn note_kickoff(&self) -> i32 {
        self.pending_kickoff.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn trigger_flush(&self, extra: PendingFlushMask) -> PendingFlushMask {
        if extra != 0 {
            self.hw.ctl.update_pending_flush(extra);
        }
        self.hw.ctl.trigger_flush();
        let pending = self.hw.ctl.get_pending_flush();
        log::trace!(
            "intf{}: flush ctl{} extra={:#x} pending={:#x}",
            self.hw.intf_index,
            self.hw.ctl.index(),
            extra,
            pending
        );
        pending
    }

    /// Returns whether the start was issued.
    pub(crate) fn trigger_start(&self) -> bool {
        if self.enable_state() == EnableState::Disabled {
            log::debug!("intf{}: start skipped, channel disabled", self.hw.intf_index);
            return false;
        }
        self.hw.ctl.trigger_start();
        true
    }

    pub(crate) fn hardware_reset(&self) -> std::result::Result<(), DiagnosticRequest> {
        match self.hw.ctl.reset() {
            Ok(()) => {
                self.set_enable_state(EnableState::Enabled);
                log::debug!("intf{}: ctl{} reset", self.hw.intf_index, self.hw.ctl.index());
                Ok(())
            }
            Err(reason) => {
                self.set_enable_state(EnableState::NeedsHardwareReset);
                Err(DiagnosticRequest { snapshot: self.snapshot(), reason })
            }
        }
    }

    pub fn snapshot(&self) -> ChannelSnapshot {
        let registered = {
            let slots = self.slots.lock();
            InterruptKind::ALL
                .iter()
                .filter(|kind| slots[kind.slot()].handler.is_some())
                .map(|kind| kind.name())
                .collect()
        };
        ChannelSnapshot {
            index: self.index,
            role: self.role,
            intf_index: self.hw.intf_index,
            ctl_index: self.hw.ctl.index(),
            enable_state: self.enable_state(),
            pending_kickoff: self.pending_kickoff(),
            vsync_count: self.vsync_count(),
            underrun_count: self.underrun_count(),
            registered,
        }
    }

    /// Wait for the next vblank from `kind`.
    pub(crate) fn wait_vblank(&self, token: &mut MayBlock, kind: InterruptKind) -> Result<()> {
        self.pending_vblank.store(1, Ordering::SeqCst);
        let result = self.wait_for_irq(token, kind, &self.pending_vblank);
        self.pending_vblank.store(0, Ordering::SeqCst);
        result
    }

    /// Wait until `counter` drops to zero, fed by interrupt `kind`.
    ///
    /// On timeout the raw status is read once. A latched status means the
    /// interrupt was coalesced: its handler is run here and the wait succeeds.
    pub(crate) fn wait_for_irq(
        &self,
        token: &mut MayBlock,
        kind: InterruptKind,
        counter: &AtomicI32,
    ) -> Result<()> {
        if self.enable_state() == EnableState::Disabled {
            return Err(EncoderError::WouldBlock);
        }

        let irq = match self.slots.lock()[kind.slot()].irq_idx {
            Some(irq) => irq,
            None => {
                log::debug!("intf{}: skip {} wait, not registered", self.hw.intf_index, kind.name());
                return Ok(());
            }
        };

        if self.wait.wait_until(token, self.irq_timeout, || counter.load(Ordering::SeqCst) <= 0) {
            return Ok(());
        }

        if self.coalesced_irq_fallback && self.hw.irq.read_status(irq, true) {
            log::debug!(
                "intf{}: {} not delivered but status latched, running handler",
                self.hw.intf_index,
                kind.name()
            );
            if let Some(channel) = self.me.upgrade() {
                let ctx = IrqContext::mask(token);
                channel.on_irq(&ctx, kind);
            }
            return Ok(());
        }

        log::error!(
            "intf{}: {} wait timed out after {:?} ({} pending)",
            self.hw.intf_index,
            kind.name(),
            self.irq_timeout,
            counter.load(Ordering::SeqCst)
        );
        Err(EncoderError::Timeout(kind.name()))
    }
}

fn dec_unless_zero(counter: &AtomicI32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| if v > 0 { Some(v - 1) } else { None })
        .is_ok()
}

/// One hardware output pipe.
///
/// Variant hooks have neutral defaults; the provided methods at the bottom
/// work on the shared [`ChannelCore`].
pub trait PhysicalChannel: Send + Sync {
    fn core(&self) -> &ChannelCore;

    fn intf_mode(&self) -> IntfMode;

    /// Dispatch a hardware interrupt.
    fn on_irq(&self, ctx: &IrqContext<'_>, kind: InterruptKind);

    fn enable(&self, token: &mut MayBlock) -> Result<()>;

    fn disable(&self, token: &mut MayBlock);

    /// Register (or drop) every interrupt the variant needs while powered.
    fn irq_control(&self, token: &mut MayBlock, enable: bool) -> Result<()>;

    fn control_vblank_irq(&self, _token: &mut MayBlock, _enable: bool) -> Result<()> {
        Ok(())
    }

    /// Whether this channel's flush must be merged into the master's.
    fn needs_single_flush(&self) -> bool {
        false
    }

    fn prepare_for_kickoff(&self, _token: &mut MayBlock, _params: &KickoffParams) -> Result<()> {
        Ok(())
    }

    fn handle_post_kickoff(&self) {}

    fn prepare_commit(&self) {}

    fn restore(&self) {}

    fn mode_set(&self, mode: &DisplayMode) {
        self.core().set_mode(*mode);
    }

    fn wait_for_commit_done(&self, _token: &mut MayBlock) -> Result<()> {
        Ok(())
    }

    fn wait_for_tx_complete(&self, _token: &mut MayBlock) -> Result<()> {
        Ok(())
    }

    fn wait_for_vblank(&self, _token: &mut MayBlock) -> Result<()> {
        Ok(())
    }

    /// Issue the start pulse. No-op while disabled.
    fn trigger_start(&self) {
        self.core().trigger_start();
    }

    fn index(&self) -> usize {
        self.core().index()
    }

    fn role(&self) -> Role {
        self.core().role()
    }

    fn is_master(&self) -> bool {
        self.core().role() != Role::Slave
    }

    fn enable_state(&self) -> EnableState {
        self.core().enable_state()
    }

    fn pending_kickoff_count(&self) -> i32 {
        self.core().pending_kickoff()
    }

    /// Idempotent. Rolls back the callback if the line cannot be enabled.
    fn register_interrupt(&self, _token: &mut MayBlock, kind: InterruptKind) -> Result<()> {
        self.core().register_interrupt(kind)
    }

    /// Unregistering an unregistered slot is logged and ignored.
    fn unregister_interrupt(&self, _token: &mut MayBlock, kind: InterruptKind) {
        self.core().unregister_interrupt(kind)
    }

    /// Program `extra` flush bits, flush, and report the resulting pending
    /// mask.
    fn trigger_flush(&self, extra: PendingFlushMask) -> PendingFlushMask {
        self.core().trigger_flush(extra)
    }

    /// Mark a kickoff in flight. Called for every enabled channel between
    /// the flushes and the start.
    fn note_kickoff(&self) -> i32 {
        self.core().note_kickoff()
    }

    /// Whether the panel refreshes itself from its own frame memory.
    fn is_autorefresh_enabled(&self) -> bool {
        false
    }

    /// Returns false when the variant has no self-refresh.
    fn set_autorefresh(&self, _enable: bool) -> bool {
        false
    }

    fn hardware_reset(&self, _token: &mut MayBlock) -> std::result::Result<(), DiagnosticRequest> {
        self.core().hardware_reset()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::hw::sim::SimTopology;
    use crate::hw::Topology;
    use crate::types::IntfType;

    /// Parent that records what its channels report.
    #[derive(Default)]
    pub struct RecordingEvents {
        pub vblanks: Mutex<Vec<usize>>,
        pub underruns: Mutex<Vec<usize>>,
        pub frames: Mutex<Vec<(usize, FrameEvent)>>,
    }

    impl EncoderEvents for RecordingEvents {
        fn handle_vblank(&self, _ctx: &IrqContext<'_>, channel: &dyn PhysicalChannel) {
            self.vblanks.lock().push(channel.index());
        }

        fn handle_underrun(&self, _ctx: &IrqContext<'_>, channel: &dyn PhysicalChannel) {
            self.underruns.lock().push(channel.index());
        }

        fn handle_frame_done(&self, _ctx: &IrqContext<'_>, channel: &dyn PhysicalChannel, event: FrameEvent) {
            self.frames.lock().push((channel.index(), event));
        }
    }

    pub fn params(
        topo: &SimTopology,
        index: usize,
        role: Role,
        parent: &Arc<RecordingEvents>,
    ) -> ChannelParams {
        let hw = topo.bind(IntfType::Dsi, index as u32).unwrap();
        let parent: Weak<dyn EncoderEvents> = Arc::downgrade(parent) as Weak<dyn EncoderEvents>;
        let config = EncoderConfig {
            irq_wait_timeout_ms: 20,
            ..Default::default()
        };
        ChannelParams::new(index, role, hw, parent, &config)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{params, RecordingEvents};
    use super::*;
    use crate::hw::sim::{SimInterruptController, SimTopology};
    use crate::hw::InterruptController;

    #[test]
    fn register_twice_is_idempotent() {
        let topo = SimTopology::new(1);
        let parent = Arc::new(RecordingEvents::default());
        let channel = VideoChannel::new(params(&topo, 0, Role::Solo, &parent));
        let mut token = MayBlock::process_context();
        let line = SimInterruptController::line(InterruptKind::Underrun, 0);

        channel.register_interrupt(&mut token, InterruptKind::Underrun).unwrap();
        channel.register_interrupt(&mut token, InterruptKind::Underrun).unwrap();

        assert_eq!(topo.irq.handler_count(line), 1);
        assert_eq!(topo.irq.enable_count(line), 1);
        assert!(channel.core().is_registered(InterruptKind::Underrun));
    }

    #[test]
    fn enable_failure_rolls_back_callback() {
        let topo = SimTopology::new(1);
        let parent = Arc::new(RecordingEvents::default());
        let channel = VideoChannel::new(params(&topo, 0, Role::Solo, &parent));
        let mut token = MayBlock::process_context();
        let line = SimInterruptController::line(InterruptKind::Vsync, 0);
        topo.irq.reject_enable(line, true);

        let err = channel.register_interrupt(&mut token, InterruptKind::Vsync).unwrap_err();
        assert!(matches!(err, EncoderError::HardwareRejected(_)));
        assert_eq!(topo.irq.handler_count(line), 0);
        assert!(!channel.core().is_registered(InterruptKind::Vsync));
    }

    #[test]
    fn unregister_unregistered_is_noop() {
        let topo = SimTopology::new(1);
        let parent = Arc::new(RecordingEvents::default());
        let channel = CommandChannel::new(params(&topo, 0, Role::Solo, &parent));
        let mut token = MayBlock::process_context();

        channel.unregister_interrupt(&mut token, InterruptKind::PingPongDone);
        channel.register_interrupt(&mut token, InterruptKind::PingPongDone).unwrap();
        channel.unregister_interrupt(&mut token, InterruptKind::PingPongDone);
        channel.unregister_interrupt(&mut token, InterruptKind::PingPongDone);

        let line = SimInterruptController::line(InterruptKind::PingPongDone, 0);
        assert!(!topo.irq.is_enabled(line));
        assert_eq!(topo.irq.handler_count(line), 0);
    }

    #[test]
    fn start_is_skipped_while_disabled() {
        let topo = SimTopology::new(1);
        let parent = Arc::new(RecordingEvents::default());
        let channel = VideoChannel::new(params(&topo, 0, Role::Solo, &parent));

        channel.trigger_start();
        assert_eq!(topo.channel(0).ctl.start_count(), 0);

        let mut token = MayBlock::process_context();
        channel.enable(&mut token).unwrap();
        channel.trigger_start();
        assert_eq!(topo.channel(0).ctl.start_count(), 1);
    }

    #[test]
    fn flush_merges_extra_bits_without_counting() {
        let topo = SimTopology::new(1);
        let parent = Arc::new(RecordingEvents::default());
        let channel = VideoChannel::new(params(&topo, 0, Role::Solo, &parent));
        topo.channel(0).ctl.stage(0x4);

        assert_eq!(channel.trigger_flush(0x1), 0x5);
        assert_eq!(channel.pending_kickoff_count(), 0);
        assert_eq!(channel.note_kickoff(), 1);
        assert_eq!(channel.pending_kickoff_count(), 1);
    }

    #[test]
    fn failed_reset_requests_dump() {
        let topo = SimTopology::new(1);
        let parent = Arc::new(RecordingEvents::default());
        let channel = VideoChannel::new(params(&topo, 0, Role::Solo, &parent));
        let mut token = MayBlock::process_context();
        channel.enable(&mut token).unwrap();
        topo.channel(0).ctl.set_fail_reset(true);

        let dump = channel.hardware_reset(&mut token).unwrap_err();
        assert_eq!(dump.snapshot.intf_index, 0);
        assert_eq!(channel.enable_state(), EnableState::NeedsHardwareReset);

        topo.channel(0).ctl.set_fail_reset(false);
        channel.hardware_reset(&mut token).unwrap();
        assert_eq!(channel.enable_state(), EnableState::Enabled);
    }

    #[test]
    fn wait_on_disabled_channel_would_block() {
        let topo = SimTopology::new(1);
        let parent = Arc::new(RecordingEvents::default());
        let channel = CommandChannel::new(params(&topo, 0, Role::Solo, &parent));
        let mut token = MayBlock::process_context();

        assert_eq!(channel.wait_for_tx_complete(&mut token), Err(EncoderError::WouldBlock));
    }

    #[test]
    fn coalesced_interrupt_is_recovered_by_status_read() {
        let topo = SimTopology::new(1);
        let parent = Arc::new(RecordingEvents::default());
        let channel = CommandChannel::new(params(&topo, 0, Role::Solo, &parent));
        let mut token = MayBlock::process_context();
        channel.enable(&mut token).unwrap();
        channel.irq_control(&mut token, true).unwrap();

        channel.trigger_flush(0);
        channel.note_kickoff();
        let line = SimInterruptController::line(InterruptKind::PingPongDone, 0);
        topo.irq.latch(line);

        channel.wait_for_tx_complete(&mut token).unwrap();
        assert_eq!(channel.pending_kickoff_count(), 0);
        assert_eq!(*parent.frames.lock(), vec![(0, FrameEvent::Done)]);
        assert!(!topo.irq.read_status(line, false));
    }

    #[test]
    fn fallback_can_be_disabled() {
        let topo = SimTopology::new(1);
        let parent = Arc::new(RecordingEvents::default());
        let mut p = params(&topo, 0, Role::Solo, &parent);
        p.coalesced_irq_fallback = false;
        let channel = VideoChannel::new(p);
        let mut token = MayBlock::process_context();
        channel.enable(&mut token).unwrap();
        channel.irq_control(&mut token, true).unwrap();

        channel.trigger_flush(0);
        channel.note_kickoff();
        topo.irq.latch(SimInterruptController::line(InterruptKind::Vsync, 0));

        assert_eq!(
            channel.wait_for_commit_done(&mut token),
            Err(EncoderError::Timeout("vsync_irq"))
        );
        assert!(parent.frames.lock().is_empty());
    }
}
