//! The virtual encoder: one logical display output built from up to
//! [`MAX_CHANNELS`] physical channels.
//!
//! Lock order is fixed: the process lock (channel list, enable flag, mode)
//! is taken before the interrupt-safe lock (busy mask, watchdog, callbacks),
//! and the latter is only ever taken nested through the former's token or
//! from interrupt context. Frame events and vblank notifications are
//! delivered while the interrupt-safe lock is held, so callbacks must not
//! call back into the encoder.


use crate::channel::{create_channel, ChannelParams, ChannelSnapshot, EncoderEvents, PhysicalChannel};
use crate::completion::{FrameCompletionTracker, WatchdogToken};
use crate::config::EncoderConfig;
use crate::error::{EncoderError, Result};
use crate::hw::{PowerService, Topology};
use crate::kickoff::{KickoffCoordinator, KickoffReport};
use crate::resource_control::{RcEvent, RcInputs, RcState, RcTransition, ResourceAction, ResourceControl};
use crate::sync::{IrqContext, IrqLock, MayBlock, ProcessLock, WaitQueue};
use crate::types::{
    DisplayInfo, DisplayMode, EnableState, FrameEvent, HwResources, IntfMode, IntfType, InterruptKind,
    KickoffParams, Role, WaitEvent, MAX_CHANNELS,
};
use crate::vsync;
use crate::worker::DelayedTask;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

/// Vblank notification for the compositor.
pub type VblankCallback = Box<dyn FnMut() + Send>;

/// Frame lifecycle notification for the compositor.
pub type FrameEventCallback = Box<dyn FnMut(FrameEvent) + Send>;

struct ControlState {
    channels: Vec<Arc<dyn PhysicalChannel>>,
    /// Re-resolved on every enable
    master: Option<Arc<dyn PhysicalChannel>>,
    mode: Option<DisplayMode>,
    enabled: bool,
}

struct IrqState {
    tracker: FrameCompletionTracker,
    vblank_cb: Option<VblankCallback>,
    frame_event_cb: Option<FrameEventCallback>,
}

/// Point-in-time view of an encoder, for logs and tooling.
#[derive(Debug, Clone, Serialize)]
pub struct EncoderStatus {
    pub id: u32,
    pub rc_state: RcState,
    pub enabled: bool,
    pub busy_mask: u32,
    pub watchdog_armed: bool,
    pub early_wakeups: u64,
    pub channels: Vec<ChannelSnapshot>,
}

struct EncoderShared {
    id: u32,
    config: EncoderConfig,
    display: DisplayInfo,
    power: Arc<dyn PowerService>,
    ctl: ProcessLock<ControlState>,
    irq: IrqLock<IrqState>,
    rc: ResourceControl,
    /// Mirror of the tracker's mask, readable without the lock
    busy_bits: AtomicU32,
    /// Kickoffs merged into the current busy period
    frames_in_flight: AtomicU32,
    idle_timeout_ms: AtomicU64,
    idle_gen: AtomicU64,
    vsync_gen: AtomicU64,
    /// Set between a successful prepare_kickoff and its kickoff
    commit_pending: AtomicBool,
    idle_task: DelayedTask,
    watchdog_task: DelayedTask,
    vsync_task: DelayedTask,
    frame_idle: WaitQueue,
    early_wakeups: AtomicU64,
    torn_down: AtomicBool,
}

type SharedLink = Arc<OnceLock<Weak<EncoderShared>>>;

fn job(link: &SharedLink, run: fn(&EncoderShared, u64)) -> impl FnMut(u64) + Send + 'static {
    let link = link.clone();
    move |cookie| {
        if let Some(shared) = link.get().and_then(Weak::upgrade) {
            run(&shared, cookie);
        }
    }
}

/// Handle to a virtual encoder. Cheap to clone.
#[derive(Clone)]
pub struct VirtualEncoder {
    shared: Arc<EncoderShared>,
}

impl std::fmt::Debug for VirtualEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualEncoder")
            .field("id", &self.shared.id)
            .field("rc_state", &self.shared.rc.state())
            .field("busy_mask", &self.busy_mask())
            .finish()
    }
}

impl VirtualEncoder {
    /// Build an encoder for `display`, one channel per horizontal tile.
    pub fn setup(
        id: u32,
        display: DisplayInfo,
        topology: &dyn Topology,
        power: Arc<dyn PowerService>,
        config: EncoderConfig,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| EncoderError::InvalidArgument(e.to_string()))?;

        let tiles = display.num_h_tiles();
        if tiles == 0 {
            return Err(EncoderError::InvalidArgument(format!("enc{}: display has no tiles", id)));
        }
        if tiles > MAX_CHANNELS {
            return Err(EncoderError::TooManyChannels(tiles));
        }

        let bindings = display
            .h_tile_instance
            .iter()
            .map(|&controller| {
                topology.bind(display.intf_type, controller).ok_or_else(|| {
                    EncoderError::InvalidArgument(format!(
                        "enc{}: no hardware bound to controller {}",
                        id, controller
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let link: SharedLink = Arc::new(OnceLock::new());
        let idle_task = DelayedTask::spawn("enc-idle", job(&link, EncoderShared::on_idle_timeout))?;
        let watchdog_task = DelayedTask::spawn("enc-watchdog", job(&link, EncoderShared::on_watchdog))?;
        let vsync_task = DelayedTask::spawn("enc-vsync", job(&link, EncoderShared::on_early_wakeup))?;

        let shared = Arc::new(EncoderShared {
            id,
            idle_timeout_ms: AtomicU64::new(config.idle_timeout_ms),
            config,
            display,
            power,
            ctl: ProcessLock::new(ControlState {
                channels: Vec::with_capacity(tiles),
                master: None,
                mode: None,
                enabled: false,
            }),
            irq: IrqLock::new(IrqState {
                tracker: FrameCompletionTracker::new(),
                vblank_cb: None,
                frame_event_cb: None,
            }),
            rc: ResourceControl::new(),
            busy_bits: AtomicU32::new(0),
            frames_in_flight: AtomicU32::new(0),
            idle_gen: AtomicU64::new(0),
            vsync_gen: AtomicU64::new(0),
            commit_pending: AtomicBool::new(false),
            idle_task,
            watchdog_task,
            vsync_task,
            frame_idle: WaitQueue::new(),
            early_wakeups: AtomicU64::new(0),
            torn_down: AtomicBool::new(false),
        });
        let _ = link.set(Arc::downgrade(&shared));

        let parent: Weak<dyn EncoderEvents> = Arc::downgrade(&shared) as Weak<dyn EncoderEvents>;
        let mode = shared.display.intf_mode;
        let mut token = MayBlock::process_context();
        {
            let mut ctl = shared.ctl.lock(&mut token);
            for (index, hw) in bindings.into_iter().enumerate() {
                let role = Role::for_tile(index, tiles);
                log::debug!("enc{}: channel {} on intf{} as {:?}", id, index, hw.intf_index, role);
                let params = ChannelParams::new(index, role, hw, parent.clone(), &shared.config);
                ctl.channels.push(create_channel(mode, params));
            }
        }

        log::info!(
            "enc{}: set up {:?} {:?} with {} channel(s)",
            id,
            shared.display.intf_type,
            mode,
            tiles
        );
        Ok(Self { shared })
    }

    pub fn id(&self) -> u32 {
        self.shared.id
    }

    /// Record the adjusted mode and hand it to every channel.
    pub fn mode_set(&self, mode: DisplayMode) -> Result<()> {
        let s = &self.shared;
        let mut token = MayBlock::process_context();
        let mut ctl = s.ctl.lock(&mut token);
        s.check_alive()?;

        for channel in &ctl.channels {
            channel.mode_set(&mode);
        }
        ctl.mode = Some(mode);
        log::debug!(
            "enc{}: mode {}x{}@{} clock={}kHz",
            s.id,
            mode.hdisplay,
            mode.vdisplay,
            mode.vrefresh,
            mode.clock_khz
        );
        Ok(())
    }

    /// Power up: resolve the master, enable resources, then enable the
    /// slaves followed by the master.
    pub fn enable(&self) -> Result<()> {
        let s = &self.shared;
        let mut token = MayBlock::process_context();
        let mut ctl = s.ctl.lock(&mut token);
        s.check_alive()?;
        let (state, token) = ctl.split();

        if state.enabled {
            log::debug!("enc{}: already enabled", s.id);
            return Ok(());
        }

        state.master = KickoffCoordinator::resolve_master(&state.channels);
        let master = match &state.master {
            Some(master) => master.clone(),
            None => {
                log::error!("enc{}: no master among {} channel(s)", s.id, state.channels.len());
                return Err(EncoderError::InvalidArgument("encoder has no master channel".into()));
            }
        };

        if let Err(e) = s.rc_transition(state, token, RcEvent::Kickoff) {
            log::error!("enc{}: resource control failed on enable: {}", s.id, e);
            state.master = None;
            return Err(e);
        }

        for channel in state.channels.iter().filter(|c| c.index() != master.index()) {
            channel.enable(token)?;
        }
        master.enable(token)?;
        state.enabled = true;

        log::info!("enc{}: enabled, master intf{}", s.id, master.core().intf_index());
        Ok(())
    }

    /// Power down. Blocks until an outstanding kickoff completes or its
    /// watchdog fires.
    pub fn disable(&self) -> Result<()> {
        let s = &self.shared;
        let mut token = MayBlock::process_context();
        s.check_alive()?;

        // Both jobs take the process lock
        s.idle_task.cancel_sync(&mut token);
        s.vsync_task.cancel_sync(&mut token);

        let mut ctl = s.ctl.lock(&mut token);
        let (state, token) = ctl.split();
        if !state.enabled {
            log::debug!("enc{}: already disabled", s.id);
            return Ok(());
        }
        state.enabled = false;
        s.commit_pending.store(false, Ordering::SeqCst);
        s.vsync_gen.fetch_add(1, Ordering::SeqCst);
        s.vsync_task.cancel();

        if let Err(e) = wait_channels(&state.channels, token, WaitEvent::TxComplete) {
            log::warn!("enc{}: transfer did not complete before disable: {}", s.id, e);
        }
        s.wait_frame_idle(token);

        if let Err(e) = s.rc_transition(state, token, RcEvent::PreStop) {
            log::error!("enc{}: pre-stop failed: {}", s.id, e);
        }

        s.drain_watchdog(state, token);

        for channel in &state.channels {
            channel.disable(token);
        }

        if let Err(e) = s.rc_transition(state, token, RcEvent::Stop) {
            log::error!("enc{}: stop failed: {}", s.id, e);
        }

        state.master = None;
        log::info!("enc{}: disabled", s.id);
        Ok(())
    }

    /// Per-channel pre-submission hook. Waits for the previous transfer where
    /// the variant requires it, powers resources back up, and resets every
    /// channel (in order) if any of them reported a recoverable fault.
    pub fn prepare_kickoff(&self, params: KickoffParams) -> Result<()> {
        let s = &self.shared;
        let mut token = MayBlock::process_context();
        s.check_alive()?;
        s.idle_task.cancel_sync(&mut token);

        let mut ctl = s.ctl.lock(&mut token);
        let (state, token) = ctl.split();
        if !state.enabled {
            return Err(EncoderError::NotEnabled);
        }

        let mut needs_reset = false;
        for channel in &state.channels {
            if let Err(e) = channel.prepare_for_kickoff(token, &params) {
                log::warn!("enc{}: channel {} prepare failed: {}", s.id, channel.index(), e);
            }
            if channel.enable_state() == EnableState::NeedsHardwareReset {
                needs_reset = true;
            }
        }

        s.rc_transition(state, token, RcEvent::Kickoff)?;

        if needs_reset {
            log::warn!("enc{}: resetting channels before frame {}", s.id, params.frame);
            s.reset_channels(&state.channels, token);
        }
        s.commit_pending.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Trigger all enabled channels. Returns once the triggers are issued;
    /// completion arrives through the frame-event callback.
    pub fn kickoff(&self) -> Result<KickoffReport> {
        let s = &self.shared;
        let mut token = MayBlock::process_context();
        let mut ctl = s.ctl.lock(&mut token);
        s.check_alive()?;
        let (state, token) = ctl.split();
        if !state.enabled {
            return Err(EncoderError::NotEnabled);
        }

        // An idle timer armed since prepare_kickoff must not power down under us
        s.idle_gen.fetch_add(1, Ordering::SeqCst);
        s.idle_task.cancel();
        s.commit_pending.store(false, Ordering::SeqCst);

        let vrefresh = state.mode.map_or(0, |m| m.vrefresh);
        let timeout = s.config.frame_done_timeout(vrefresh);

        let report = {
            let mut irq = s.irq.lock_nested(token);
            let report = KickoffCoordinator::kickoff(&state.channels, state.master.as_ref(), &mut irq.tracker);
            if !report.busy.is_empty() {
                let armed = irq.tracker.arm_watchdog(timeout, Instant::now());
                s.watchdog_task.schedule(timeout, armed.0);
                s.frames_in_flight.fetch_add(1, Ordering::SeqCst);
            }
            s.busy_bits.store(report.busy.bits(), Ordering::SeqCst);
            report
        };

        for channel in &state.channels {
            channel.handle_post_kickoff();
        }

        if s.display.intf_type == IntfType::Dsi && s.config.early_wakeup {
            if let Some(mode) = state.mode {
                let master = state.master.as_deref();
                if let Some(est) = vsync::estimate_next_vsync(master, &mode, Instant::now()) {
                    s.vsync_task.schedule(est.time_to_vsync, s.vsync_gen.load(Ordering::SeqCst));
                }
            }
        }

        log::trace!("enc{}: kickoff busy={} watchdog={:?}", s.id, report.busy, timeout);
        Ok(report)
    }

    /// Block on `event` for every channel, bounded by the interrupt wait
    /// timeout.
    pub fn wait_for_event(&self, event: WaitEvent) -> Result<()> {
        let s = &self.shared;
        let mut token = MayBlock::process_context();
        let channels = {
            let ctl = s.ctl.lock(&mut token);
            if s.torn_down.load(Ordering::SeqCst) {
                return Err(EncoderError::WouldBlock);
            }
            ctl.channels.clone()
        };
        wait_channels(&channels, &mut token, event)
    }

    /// Replace the vblank callback. `None` stops notification.
    pub fn register_vblank_callback(&self, cb: Option<VblankCallback>) -> Result<()> {
        let s = &self.shared;
        let mut token = MayBlock::process_context();
        let mut ctl = s.ctl.lock(&mut token);
        s.check_alive()?;
        let (state, token) = ctl.split();

        let enable = cb.is_some();
        let had = {
            let mut irq = s.irq.lock_nested(token);
            let had = irq.vblank_cb.is_some();
            irq.vblank_cb = cb;
            had
        };

        if enable != had {
            for channel in &state.channels {
                if let Err(e) = channel.control_vblank_irq(token, enable) {
                    log::error!("enc{}: vblank irq toggle failed on channel {}: {}", s.id, channel.index(), e);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Replace the frame-event callback. `None` stops notification.
    pub fn register_frame_event_callback(&self, cb: Option<FrameEventCallback>) -> Result<()> {
        let s = &self.shared;
        let mut token = MayBlock::process_context();
        let mut ctl = s.ctl.lock(&mut token);
        s.check_alive()?;
        let (_, token) = ctl.split();
        s.irq.lock_nested(token).frame_event_cb = cb;
        Ok(())
    }

    pub fn get_hw_resources(&self) -> Result<HwResources> {
        let s = &self.shared;
        let mut token = MayBlock::process_context();
        let ctl = s.ctl.lock(&mut token);
        s.check_alive()?;
        Ok(HwResources {
            display_num_of_h_tiles: s.display.num_h_tiles(),
            intfs: ctl
                .channels
                .iter()
                .map(|c| (c.core().intf_index(), c.intf_mode()))
                .collect(),
            ctls: ctl.channels.iter().map(|c| c.core().ctl().index()).collect(),
        })
    }

    /// Re-apply channel state after resume: slaves first, then the master.
    pub fn restore(&self) -> Result<()> {
        let s = &self.shared;
        let mut token = MayBlock::process_context();
        let ctl = s.ctl.lock(&mut token);
        s.check_alive()?;
        let master = match &ctl.master {
            Some(master) => master,
            None => {
                log::debug!("enc{}: nothing to restore, no master", s.id);
                return Ok(());
            }
        };
        for channel in ctl.channels.iter().filter(|c| c.index() != master.index()) {
            channel.restore();
        }
        master.restore();
        Ok(())
    }

    pub fn prepare_commit(&self) -> Result<()> {
        let s = &self.shared;
        let mut token = MayBlock::process_context();
        let ctl = s.ctl.lock(&mut token);
        s.check_alive()?;
        for channel in &ctl.channels {
            channel.prepare_commit();
        }
        Ok(())
    }

    /// Drop staged flush bits and, on a command-mode master, kick the
    /// pending (auto-refresh) update.
    pub fn trigger_kickoff_pending(&self) -> Result<()> {
        let s = &self.shared;
        let mut token = MayBlock::process_context();
        let ctl = s.ctl.lock(&mut token);
        s.check_alive()?;
        let master = ctl.master.as_ref().map(|m| m.index());
        for channel in &ctl.channels {
            let hw = channel.core().ctl();
            hw.clear_pending_flush();
            if Some(channel.index()) == master && channel.intf_mode() == IntfMode::Command {
                hw.trigger_pending();
            }
        }
        Ok(())
    }

    /// Interface mode of the master, else of the first channel.
    pub fn intf_mode(&self) -> Option<IntfMode> {
        let mut token = MayBlock::process_context();
        let ctl = self.shared.ctl.lock(&mut token);
        ctl.master
            .as_ref()
            .or_else(|| ctl.channels.first())
            .map(|c| c.intf_mode())
    }

    pub fn set_idle_timeout(&self, timeout: Duration) {
        let ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self.shared.idle_timeout_ms.store(ms, Ordering::SeqCst);
    }

    /// An update is on its way (input activity). Brings resources back from
    /// Idle, or pushes the idle timer out while On.
    pub fn early_wakeup(&self) -> Result<()> {
        let s = &self.shared;
        let mut token = MayBlock::process_context();
        let mut ctl = s.ctl.lock(&mut token);
        s.check_alive()?;
        let (state, token) = ctl.split();
        if !state.enabled {
            return Err(EncoderError::NotEnabled);
        }
        s.rc_transition(state, token, RcEvent::EarlyWakeup)?;
        Ok(())
    }

    /// Switch panel self-refresh on a command-mode master.
    pub fn set_autorefresh(&self, enable: bool) -> Result<()> {
        let s = &self.shared;
        let mut token = MayBlock::process_context();
        let ctl = s.ctl.lock(&mut token);
        s.check_alive()?;
        let master = ctl.master.as_ref().ok_or(EncoderError::NotEnabled)?;
        if !master.set_autorefresh(enable) {
            return Err(EncoderError::InvalidArgument(format!(
                "enc{}: {:?} master has no autorefresh",
                s.id,
                master.intf_mode()
            )));
        }
        log::debug!("enc{}: autorefresh {}", s.id, if enable { "on" } else { "off" });
        Ok(())
    }

    /// Disable if needed, drain every timer, then destroy the channels in
    /// index order. The encoder is unusable afterwards.
    pub fn teardown(&self) -> Result<()> {
        let s = &self.shared;
        s.check_alive()?;
        self.disable()?;

        let mut token = MayBlock::process_context();
        s.idle_task.cancel_sync(&mut token);
        s.watchdog_task.cancel_sync(&mut token);
        s.vsync_task.cancel_sync(&mut token);

        let mut ctl = s.ctl.lock(&mut token);
        let (state, token) = ctl.split();

        if let Some(busy) = state.channels.iter().find(|c| c.pending_kickoff_count() != 0) {
            let pending = busy.pending_kickoff_count();
            log::error!("enc{}: channel {} still has {} kickoff(s) in flight", s.id, busy.index(), pending);
            return Err(EncoderError::ChannelBusy { index: busy.index(), pending });
        }

        for channel in state.channels.drain(..) {
            for kind in InterruptKind::ALL {
                if channel.core().is_registered(kind) {
                    channel.unregister_interrupt(token, kind);
                }
            }
            log::debug!("enc{}: destroyed channel {}", s.id, channel.index());
        }
        state.master = None;

        {
            let mut irq = s.irq.lock_nested(token);
            irq.vblank_cb = None;
            irq.frame_event_cb = None;
        }
        s.torn_down.store(true, Ordering::SeqCst);
        log::info!("enc{}: torn down", s.id);
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        let mut token = MayBlock::process_context();
        self.shared.ctl.lock(&mut token).enabled
    }

    pub fn rc_state(&self) -> RcState {
        self.shared.rc.state()
    }

    pub fn busy_mask(&self) -> u32 {
        self.shared.busy_bits.load(Ordering::SeqCst)
    }

    /// Deadline of the armed frame-done watchdog, if any.
    pub fn frame_done_deadline(&self) -> Option<Instant> {
        let mut token = MayBlock::process_context();
        let deadline = self.shared.irq.lock_nested(&mut token).tracker.deadline();
        deadline
    }

    pub fn channels(&self) -> Vec<Arc<dyn PhysicalChannel>> {
        let mut token = MayBlock::process_context();
        self.shared.ctl.lock(&mut token).channels.clone()
    }

    pub fn master(&self) -> Option<Arc<dyn PhysicalChannel>> {
        let mut token = MayBlock::process_context();
        self.shared.ctl.lock(&mut token).master.clone()
    }

    pub fn early_wakeups(&self) -> u64 {
        self.shared.early_wakeups.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> EncoderStatus {
        let s = &self.shared;
        let mut token = MayBlock::process_context();
        let ctl = s.ctl.lock(&mut token);
        EncoderStatus {
            id: s.id,
            rc_state: s.rc.state(),
            enabled: ctl.enabled,
            busy_mask: s.busy_bits.load(Ordering::SeqCst),
            watchdog_armed: s.watchdog_task.is_pending(),
            early_wakeups: s.early_wakeups.load(Ordering::SeqCst),
            channels: ctl.channels.iter().map(|c| c.core().snapshot()).collect(),
        }
    }
}

fn wait_channels(
    channels: &[Arc<dyn PhysicalChannel>],
    token: &mut MayBlock,
    event: WaitEvent,
) -> Result<()> {
    for channel in channels {
        match event {
            WaitEvent::CommitDone => channel.wait_for_commit_done(token)?,
            WaitEvent::TxComplete => channel.wait_for_tx_complete(token)?,
            WaitEvent::Vblank => channel.wait_for_vblank(token)?,
        }
    }
    Ok(())
}

impl EncoderShared {
    fn check_alive(&self) -> Result<()> {
        if self.torn_down.load(Ordering::SeqCst) {
            return Err(EncoderError::TornDown);
        }
        Ok(())
    }

    fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms.load(Ordering::SeqCst))
    }

    fn rc_inputs(&self, frames_pending: bool, autorefresh: bool) -> RcInputs {
        RcInputs {
            intf_mode: self.display.intf_mode,
            idle_pc_supported: self.config.idle_pc_supported,
            busy: self.busy_bits.load(Ordering::SeqCst) != 0,
            frames_pending,
            autorefresh,
        }
    }

    /// Plan, apply and commit one transition under the process lock. A
    /// failed resource action leaves the state unchanged.
    fn rc_transition(
        &self,
        state: &ControlState,
        token: &mut MayBlock,
        event: RcEvent,
    ) -> Result<RcTransition> {
        let autorefresh = state.master.as_ref().is_some_and(|m| m.is_autorefresh_enabled());
        let inputs = self.rc_inputs(self.commit_pending.load(Ordering::SeqCst), autorefresh);
        let transition = self.rc.plan(event, inputs)?;

        if transition.effects.cancel_idle {
            self.idle_gen.fetch_add(1, Ordering::SeqCst);
            self.idle_task.cancel();
        }
        self.apply_resources(state, token, transition.effects.resources)?;
        self.rc.commit(token, &transition);

        if transition.effects.schedule_idle {
            // A commit usually follows a wakeup from idle late; give it longer
            let delay = if transition.from == RcState::Idle {
                self.config.early_wakeup_idle_timeout()
            } else {
                self.idle_timeout()
            };
            self.idle_task.schedule(delay, self.idle_gen.load(Ordering::SeqCst));
        }
        Ok(transition)
    }

    fn apply_resources(&self, state: &ControlState, token: &mut MayBlock, action: ResourceAction) -> Result<()> {
        match action {
            ResourceAction::None => Ok(()),
            ResourceAction::EnableAll => {
                self.power.acquire()?;
                if let Err(e) = self.irq_control(state, token, true) {
                    self.power.release();
                    return Err(e);
                }
                Ok(())
            }
            ResourceAction::EnableIrqs => self.irq_control(state, token, true),
            ResourceAction::DisableAll => {
                self.irq_control(state, token, false)?;
                self.power.release();
                Ok(())
            }
            ResourceAction::DisableIrqs => self.irq_control(state, token, false),
        }
    }

    fn irq_control(&self, state: &ControlState, token: &mut MayBlock, enable: bool) -> Result<()> {
        log::debug!("enc{}: irq control {}", self.id, if enable { "on" } else { "off" });
        for (done, channel) in state.channels.iter().enumerate() {
            if let Err(e) = channel.irq_control(token, enable) {
                log::error!("enc{}: irq control failed on channel {}: {}", self.id, channel.index(), e);
                if enable {
                    for registered in &state.channels[..done] {
                        let _ = registered.irq_control(token, false);
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn reset_channels(&self, channels: &[Arc<dyn PhysicalChannel>], token: &mut MayBlock) {
        for channel in channels {
            if let Err(dump) = channel.hardware_reset(token) {
                log::error!("enc{}: {}", self.id, dump);
                log::error!("enc{}: diagnostic dump: {:?}", self.id, dump.snapshot);
            }
        }
    }

    /// Wait for the busy mask to clear, bounded by the watchdog deadline.
    fn wait_frame_idle(&self, token: &mut MayBlock) {
        let deadline = self.irq.lock_nested(token).tracker.deadline();
        let Some(deadline) = deadline else {
            return;
        };

        let bound = deadline.saturating_duration_since(Instant::now()) + self.config.irq_wait_timeout();
        log::debug!("enc{}: waiting up to {:?} for frame completion", self.id, bound);
        let idle = self
            .frame_idle
            .wait_until(token, bound, || self.busy_bits.load(Ordering::SeqCst) == 0);
        if !idle {
            log::error!("enc{}: frame still busy past its watchdog deadline", self.id);
        }
    }

    /// Make sure no watchdog outlives the disable. One still armed here means
    /// a timeout was in flight: disarm it and reset the hardware.
    fn drain_watchdog(&self, state: &ControlState, token: &mut MayBlock) {
        let forced = {
            let mut irq = self.irq.lock_nested(token);
            let forced = irq.tracker.force_drain();
            if forced {
                self.busy_bits.store(0, Ordering::SeqCst);
                self.frames_in_flight.store(0, Ordering::SeqCst);
            }
            forced
        };
        self.watchdog_task.cancel_sync(token);

        if forced {
            log::error!("enc{}: frame still outstanding at disable, resetting hardware", self.id);
            self.reset_channels(&state.channels, token);
        }
    }

    fn deliver(&self, irq: &mut IrqState, event: FrameEvent) {
        match irq.frame_event_cb.as_mut() {
            Some(cb) => cb(event),
            None => log::trace!("enc{}: {:?} not delivered, no callback", self.id, event),
        }
    }

    fn on_idle_timeout(&self, cookie: u64) {
        let mut token = MayBlock::process_context();
        let mut ctl = self.ctl.lock(&mut token);
        if self.torn_down.load(Ordering::SeqCst) || cookie != self.idle_gen.load(Ordering::SeqCst) {
            log::debug!("enc{}: stale idle timer ignored", self.id);
            return;
        }
        let (state, token) = ctl.split();

        match self.rc_transition(state, token, RcEvent::EnterIdle) {
            Ok(transition) if transition.next == RcState::Idle => {
                log::debug!("enc{}: idle after {:?}", self.id, self.idle_timeout());
                let mut irq = self.irq.lock_nested(token);
                self.deliver(&mut irq, FrameEvent::Idle);
            }
            Ok(_) => {}
            Err(e) => log::debug!("enc{}: idle skipped: {}", self.id, e),
        }
    }

    fn on_watchdog(&self, cookie: u64) {
        let ctx = IrqContext::enter();
        {
            let mut irq = self.irq.lock_irq(&ctx);
            let Some(event) = irq.tracker.on_watchdog_expire(WatchdogToken(cookie)) else {
                return;
            };
            log::error!("enc{}: frame done timeout", self.id);
            self.busy_bits.store(0, Ordering::SeqCst);
            self.frames_in_flight.store(0, Ordering::SeqCst);
            self.deliver(&mut irq, event);
        }
        self.frame_idle.wake_all();
    }

    fn on_early_wakeup(&self, cookie: u64) {
        let mut token = MayBlock::process_context();
        let mut ctl = self.ctl.lock(&mut token);
        if self.torn_down.load(Ordering::SeqCst) || cookie != self.vsync_gen.load(Ordering::SeqCst) {
            log::debug!("enc{}: stale vsync wakeup ignored", self.id);
            return;
        }
        let (state, token) = ctl.split();
        if !state.enabled {
            return;
        }
        let count = self.early_wakeups.fetch_add(1, Ordering::SeqCst) + 1;
        log::trace!("enc{}: early vsync wakeup #{}", self.id, count);

        let master = state.master.as_deref();
        if master.is_some_and(|m| m.is_autorefresh_enabled()) {
            // The panel refreshes itself; follow its vsync
            let next = state
                .mode
                .and_then(|mode| vsync::estimate_next_vsync(master, &mode, Instant::now()));
            if let Some(est) = next {
                self.vsync_task.schedule(est.time_to_vsync, cookie);
            }
            return;
        }

        match self.rc_transition(state, token, RcEvent::EarlyWakeup) {
            Ok(transition) if transition.from == RcState::Idle => {
                log::debug!("enc{}: resources back up ahead of vsync", self.id);
            }
            Ok(_) => {}
            Err(e) => log::debug!("enc{}: early wakeup skipped: {}", self.id, e),
        }
    }
}

impl EncoderEvents for EncoderShared {
    fn handle_vblank(&self, ctx: &IrqContext<'_>, _channel: &dyn PhysicalChannel) {
        let mut irq = self.irq.lock_irq(ctx);
        if let Some(cb) = irq.vblank_cb.as_mut() {
            cb();
        }
    }

    fn handle_underrun(&self, _ctx: &IrqContext<'_>, channel: &dyn PhysicalChannel) {
        log::debug!(
            "enc{}: underrun on intf{} (total {})",
            self.id,
            channel.core().intf_index(),
            channel.core().underrun_count()
        );
    }

    fn handle_frame_done(&self, ctx: &IrqContext<'_>, channel: &dyn PhysicalChannel, event: FrameEvent) {
        {
            let mut irq = self.irq.lock_irq(ctx);
            if !event.completes_frame() {
                self.deliver(&mut irq, event);
                return;
            }

            let done = irq.tracker.on_channel_done(channel.index(), event);
            self.busy_bits.store(irq.tracker.busy().bits(), Ordering::SeqCst);
            let Some(final_event) = done else {
                return;
            };

            self.watchdog_task.cancel();
            let merged = self.frames_in_flight.swap(0, Ordering::SeqCst);
            match self.rc.frame_done(ctx, self.rc_inputs(merged > 1, false)) {
                Ok(true) => self
                    .idle_task
                    .schedule(self.idle_timeout(), self.idle_gen.load(Ordering::SeqCst)),
                Ok(false) => {}
                Err(e) => log::trace!("enc{}: frame done outside On: {}", self.id, e),
            }

            self.deliver(&mut irq, final_event);
        }
        self.frame_idle.wake_all();
    }
}
