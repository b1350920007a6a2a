//! Simulated display hardware for host runs and tests.

use super::{ChannelHw, ControlBlock, InterruptController, IrqHandler, PowerService, TimingEngine, Topology};
use crate::error::HwError;
use crate::types::{IntfMode, IntfType, InterruptKind, IrqIndex, PendingFlushMask};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::Arc;

/// Control block that records every trigger.
#[derive(Debug, Default)]
pub struct SimControlBlock {
    index: u32,
    pending: AtomicU32,
    /// Pending mask at each flush, in order
    flushes: Mutex<Vec<PendingFlushMask>>,
    starts: AtomicU32,
    resets: AtomicU32,
    pending_triggers: AtomicU32,
    fail_reset: AtomicBool,
    fail_reset_status: AtomicBool,
}

impl SimControlBlock {
    pub fn new(index: u32) -> Self {
        Self { index, ..Default::default() }
    }

    /// Program flush bits the way plane/mixer setup would.
    pub fn stage(&self, bits: PendingFlushMask) {
        self.pending.fetch_or(bits, Ordering::SeqCst);
    }

    pub fn flushes(&self) -> Vec<PendingFlushMask> {
        self.flushes.lock().clone()
    }

    pub fn flush_count(&self) -> usize {
        self.flushes.lock().len()
    }

    pub fn start_count(&self) -> u32 {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn reset_count(&self) -> u32 {
        self.resets.load(Ordering::SeqCst)
    }

    pub fn pending_trigger_count(&self) -> u32 {
        self.pending_triggers.load(Ordering::SeqCst)
    }

    pub fn set_fail_reset(&self, fail: bool) {
        self.fail_reset.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_reset_status(&self, fail: bool) {
        self.fail_reset_status.store(fail, Ordering::SeqCst);
    }
}

impl ControlBlock for SimControlBlock {
    fn index(&self) -> u32 {
        self.index
    }

    fn trigger_flush(&self) {
        let bits = self.pending.load(Ordering::SeqCst);
        self.flushes.lock().push(bits);
    }

    fn trigger_start(&self) {
        self.starts.fetch_add(1, Ordering::SeqCst);
    }

    fn get_pending_flush(&self) -> PendingFlushMask {
        self.pending.load(Ordering::SeqCst)
    }

    fn update_pending_flush(&self, bits: PendingFlushMask) {
        self.pending.fetch_or(bits, Ordering::SeqCst);
    }

    fn clear_pending_flush(&self) {
        self.pending.store(0, Ordering::SeqCst);
    }

    fn trigger_pending(&self) {
        self.pending_triggers.fetch_add(1, Ordering::SeqCst);
    }

    fn reset(&self) -> Result<(), HwError> {
        self.resets.fetch_add(1, Ordering::SeqCst);
        if self.fail_reset.load(Ordering::SeqCst) {
            return Err(HwError::Stuck { op: "ctl reset" });
        }
        self.pending.store(0, Ordering::SeqCst);
        Ok(())
    }

    fn wait_reset_status(&self) -> Result<(), HwError> {
        if self.fail_reset_status.load(Ordering::SeqCst) {
            return Err(HwError::Stuck { op: "ctl reset status" });
        }
        Ok(())
    }
}

#[derive(Default)]
struct IrqLines {
    handlers: HashMap<IrqIndex, Vec<IrqHandler>>,
    enabled: HashSet<IrqIndex>,
    status: HashSet<IrqIndex>,
    enables: HashMap<IrqIndex, u32>,
    reject: HashSet<IrqIndex>,
}

/// Interrupt controller whose lines are raised by hand.
#[derive(Default)]
pub struct SimInterruptController {
    lines: Mutex<IrqLines>,
}

impl SimInterruptController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn line(kind: InterruptKind, hw_idx: u32) -> IrqIndex {
        IrqIndex(hw_idx * 8 + kind as u32)
    }

    /// Fire `irq`. Delivered only when enabled; the status bit latches either
    /// way. Returns whether any handler ran.
    pub fn raise(&self, irq: IrqIndex) -> bool {
        let handlers = {
            let mut lines = self.lines.lock();
            if !lines.enabled.contains(&irq) {
                lines.status.insert(irq);
                return false;
            }
            lines.handlers.get(&irq).cloned().unwrap_or_default()
        };
        for handler in &handlers {
            handler(irq);
        }
        !handlers.is_empty()
    }

    /// Set the status bit without delivering the interrupt (a coalesced or
    /// lost interrupt).
    pub fn latch(&self, irq: IrqIndex) {
        self.lines.lock().status.insert(irq);
    }

    pub fn reject_enable(&self, irq: IrqIndex, reject: bool) {
        let mut lines = self.lines.lock();
        if reject {
            lines.reject.insert(irq);
        } else {
            lines.reject.remove(&irq);
        }
    }

    pub fn is_enabled(&self, irq: IrqIndex) -> bool {
        self.lines.lock().enabled.contains(&irq)
    }

    pub fn handler_count(&self, irq: IrqIndex) -> usize {
        self.lines.lock().handlers.get(&irq).map_or(0, Vec::len)
    }

    pub fn enable_count(&self, irq: IrqIndex) -> u32 {
        self.lines.lock().enables.get(&irq).copied().unwrap_or(0)
    }
}

impl InterruptController for SimInterruptController {
    fn lookup(&self, kind: InterruptKind, hw_idx: u32) -> Option<IrqIndex> {
        Some(Self::line(kind, hw_idx))
    }

    fn register_callback(&self, irq: IrqIndex, handler: IrqHandler) -> Result<(), HwError> {
        self.lines.lock().handlers.entry(irq).or_default().push(handler);
        Ok(())
    }

    fn unregister_callback(&self, irq: IrqIndex) {
        self.lines.lock().handlers.remove(&irq);
    }

    fn enable(&self, irq: IrqIndex) -> Result<(), HwError> {
        let mut lines = self.lines.lock();
        if lines.reject.contains(&irq) {
            return Err(HwError::Rejected { op: "irq enable" });
        }
        lines.enabled.insert(irq);
        *lines.enables.entry(irq).or_default() += 1;
        Ok(())
    }

    fn disable(&self, irq: IrqIndex) {
        self.lines.lock().enabled.remove(&irq);
    }

    fn read_status(&self, irq: IrqIndex, clear: bool) -> bool {
        let mut lines = self.lines.lock();
        if clear {
            lines.status.remove(&irq)
        } else {
            lines.status.contains(&irq)
        }
    }
}

#[derive(Debug, Default)]
pub struct SimTimingEngine {
    line: AtomicU32,
    enabled: AtomicBool,
}

impl SimTimingEngine {
    pub fn set_line(&self, line: u32) {
        self.line.store(line, Ordering::SeqCst);
    }
}

impl TimingEngine for SimTimingEngine {
    fn line_count(&self) -> u32 {
        self.line.load(Ordering::SeqCst)
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

/// Reference-counted clock vote.
#[derive(Debug, Default)]
pub struct SimPower {
    votes: AtomicI32,
    acquires: AtomicU32,
}

impl SimPower {
    pub fn votes(&self) -> i32 {
        self.votes.load(Ordering::SeqCst)
    }

    pub fn acquire_count(&self) -> u32 {
        self.acquires.load(Ordering::SeqCst)
    }
}

impl PowerService for SimPower {
    fn acquire(&self) -> Result<(), HwError> {
        self.votes.fetch_add(1, Ordering::SeqCst);
        self.acquires.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn release(&self) {
        let prev = self.votes.fetch_sub(1, Ordering::SeqCst);
        if prev <= 0 {
            log::warn!("Unbalanced power release ({} votes)", prev);
            self.votes.store(0, Ordering::SeqCst);
        }
    }
}

/// Hardware behind one tile.
#[derive(Clone)]
pub struct SimChannel {
    pub intf_index: u32,
    pub ctl: Arc<SimControlBlock>,
    pub timing: Arc<SimTimingEngine>,
}

/// A board with `n` interfaces sharing one interrupt controller.
pub struct SimTopology {
    pub irq: Arc<SimInterruptController>,
    channels: Vec<SimChannel>,
}

impl SimTopology {
    pub fn new(interfaces: u32) -> Self {
        let channels = (0..interfaces)
            .map(|i| SimChannel {
                intf_index: i,
                ctl: Arc::new(SimControlBlock::new(i)),
                timing: Arc::new(SimTimingEngine::default()),
            })
            .collect();
        Self {
            irq: Arc::new(SimInterruptController::new()),
            channels,
        }
    }

    pub fn channel(&self, controller_id: u32) -> &SimChannel {
        &self.channels[controller_id as usize]
    }

    /// Fire `kind` on interface `intf`.
    pub fn raise(&self, kind: InterruptKind, intf: u32) -> bool {
        self.irq.raise(SimInterruptController::line(kind, intf))
    }

    /// Signal a finished frame the way the panel would: vsync on the master
    /// in video mode; ctl-start on the master, then ping-pong-done on every
    /// interface in command mode. Returns how many lines had a handler.
    pub fn complete_frame(&self, mode: IntfMode) -> usize {
        let fired = match mode {
            IntfMode::Video => vec![self.raise(InterruptKind::Vsync, 0)],
            IntfMode::Command => {
                let mut fired = vec![self.raise(InterruptKind::CtlStart, 0)];
                fired.extend(
                    self.channels
                        .iter()
                        .map(|c| self.raise(InterruptKind::PingPongDone, c.intf_index)),
                );
                fired
            }
        };
        fired.into_iter().filter(|&f| f).count()
    }
}

impl Topology for SimTopology {
    fn bind(&self, _intf_type: IntfType, controller_id: u32) -> Option<ChannelHw> {
        let sim = self.channels.get(controller_id as usize)?;
        Some(ChannelHw {
            intf_index: sim.intf_index,
            ctl: sim.ctl.clone(),
            irq: self.irq.clone(),
            timing: sim.timing.clone(),
        })
    }
}
