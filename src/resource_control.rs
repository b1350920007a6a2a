//! Resource-control state machine: clocks and interrupts across the
//! Off / PreOff / On / Idle lifecycle.
//!
//! Transitions are decided here and applied by the encoder. Anything not in
//! the table is rejected and leaves the state untouched.

use crate::error::{EncoderError, Result};
use crate::sync::{IrqContext, MayBlock};
use crate::types::IntfMode;
use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RcState {
    Off = 0,
    PreOff = 1,
    On = 2,
    Idle = 3,
}

impl RcState {
    pub const ALL: [RcState; 4] = [RcState::Off, RcState::PreOff, RcState::On, RcState::Idle];

    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => RcState::PreOff,
            2 => RcState::On,
            3 => RcState::Idle,
            _ => RcState::Off,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum RcEvent {
    Kickoff,
    FrameDone,
    PreStop,
    Stop,
    EnterIdle,
    /// An update is expected soon (input activity, predicted vsync)
    EarlyWakeup,
}

impl RcEvent {
    pub const ALL: [RcEvent; 6] = [
        RcEvent::Kickoff,
        RcEvent::FrameDone,
        RcEvent::PreStop,
        RcEvent::Stop,
        RcEvent::EnterIdle,
        RcEvent::EarlyWakeup,
    ];
}

/// What to do with clocks and interrupt lines.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum ResourceAction {
    #[default]
    None,
    /// Acquire clocks, then register interrupts
    EnableAll,
    EnableIrqs,
    /// Unregister interrupts, then release clocks
    DisableAll,
    DisableIrqs,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RcEffects {
    pub cancel_idle: bool,
    pub resources: ResourceAction,
    pub schedule_idle: bool,
}

/// Facts about the encoder a transition depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RcInputs {
    pub intf_mode: IntfMode,
    pub idle_pc_supported: bool,
    /// A kickoff is outstanding
    pub busy: bool,
    /// More frames are queued behind the one that just completed, or a
    /// prepared commit is about to be kicked off
    pub frames_pending: bool,
    /// The master refreshes the panel on its own
    pub autorefresh: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RcTransition {
    pub from: RcState,
    pub event: RcEvent,
    pub next: RcState,
    pub effects: RcEffects,
}

pub struct ResourceControl {
    state: AtomicU8,
}

impl Default for ResourceControl {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceControl {
    pub fn new() -> Self {
        Self { state: AtomicU8::new(RcState::Off as u8) }
    }

    pub fn state(&self) -> RcState {
        RcState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Decide what `event` does in the current state. Pure: nothing changes
    /// until [`commit`](Self::commit).
    pub fn plan(&self, event: RcEvent, inputs: RcInputs) -> Result<RcTransition> {
        let from = self.state();
        let (next, effects) = Self::resolve(from, event, inputs).ok_or_else(|| {
            log::debug!("rc: {:?} rejected in {:?}", event, from);
            EncoderError::TransitionRejected { state: from, event }
        })?;
        Ok(RcTransition { from, event, next, effects })
    }

    /// Apply the state change of a planned transition. Process context only.
    pub fn commit(&self, _token: &mut MayBlock, transition: &RcTransition) {
        self.state.store(transition.next as u8, Ordering::SeqCst);
        if transition.from != transition.next {
            log::debug!(
                "rc: {:?} --{:?}--> {:?}",
                transition.from,
                transition.event,
                transition.next
            );
        }
    }

    /// FrameDone from interrupt context. Lock-free: never changes the state,
    /// only answers whether the idle task should be armed.
    pub fn frame_done(&self, _ctx: &IrqContext<'_>, inputs: RcInputs) -> Result<bool> {
        let transition = self.plan(RcEvent::FrameDone, inputs)?;
        Ok(transition.effects.schedule_idle)
    }

    fn resolve(from: RcState, event: RcEvent, inputs: RcInputs) -> Option<(RcState, RcEffects)> {
        use RcState::*;

        let video = inputs.intf_mode == IntfMode::Video;
        let stay = |effects: RcEffects| Some((from, effects));
        let to = |next: RcState, resources: ResourceAction, cancel_idle: bool| {
            Some((next, RcEffects { cancel_idle, resources, schedule_idle: false }))
        };

        // Without idle power collapse the idle events are accepted and ignored
        let idle_event = matches!(event, RcEvent::FrameDone | RcEvent::EnterIdle | RcEvent::EarlyWakeup);
        if !inputs.idle_pc_supported && idle_event {
            return stay(RcEffects::default());
        }

        match (from, event) {
            (Off, RcEvent::Kickoff) => to(On, ResourceAction::EnableAll, true),
            (Idle, RcEvent::Kickoff) if video => to(On, ResourceAction::EnableIrqs, true),
            (Idle, RcEvent::Kickoff) => to(On, ResourceAction::EnableAll, true),
            (On, RcEvent::Kickoff) => stay(RcEffects { cancel_idle: true, ..Default::default() }),

            (On, RcEvent::FrameDone) => stay(RcEffects {
                schedule_idle: !inputs.frames_pending,
                ..Default::default()
            }),

            (On, RcEvent::PreStop) => to(PreOff, ResourceAction::None, true),
            // Video idle kept the clocks; bring the lines back so Stop can release both
            (Idle, RcEvent::PreStop) if video => to(PreOff, ResourceAction::EnableIrqs, true),
            (Idle, RcEvent::PreStop) | (Off, RcEvent::PreStop) => {
                stay(RcEffects { cancel_idle: true, ..Default::default() })
            }

            (PreOff, RcEvent::Stop) => to(Off, ResourceAction::DisableAll, false),
            (Idle, RcEvent::Stop) => to(Off, ResourceAction::None, false),

            (On, RcEvent::EnterIdle) if inputs.busy => None,
            (On, RcEvent::EnterIdle) if video => to(Idle, ResourceAction::DisableIrqs, false),
            (On, RcEvent::EnterIdle) => to(Idle, ResourceAction::DisableAll, false),

            // Push the idle timer out unless a frame will arm it on completion
            (On, RcEvent::EarlyWakeup) => stay(RcEffects {
                schedule_idle: !inputs.busy && !inputs.frames_pending && !inputs.autorefresh,
                ..Default::default()
            }),
            (Idle, RcEvent::EarlyWakeup) => {
                let resources = if video { ResourceAction::EnableIrqs } else { ResourceAction::EnableAll };
                Some((On, RcEffects { cancel_idle: true, resources, schedule_idle: true }))
            }

            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(intf_mode: IntfMode) -> RcInputs {
        RcInputs {
            intf_mode,
            idle_pc_supported: true,
            busy: false,
            frames_pending: false,
            autorefresh: false,
        }
    }

    fn at(state: RcState) -> ResourceControl {
        let rc = ResourceControl::new();
        rc.state.store(state as u8, Ordering::SeqCst);
        rc
    }

    fn step(rc: &ResourceControl, event: RcEvent, inputs: RcInputs) -> Result<RcTransition> {
        let transition = rc.plan(event, inputs)?;
        rc.commit(&mut MayBlock::process_context(), &transition);
        Ok(transition)
    }

    #[test]
    fn full_lifecycle_command_mode() {
        let rc = ResourceControl::new();
        let cmd = inputs(IntfMode::Command);

        let t = step(&rc, RcEvent::Kickoff, cmd).unwrap();
        assert_eq!(t.effects.resources, ResourceAction::EnableAll);
        assert!(rc.frame_done(&IrqContext::enter(), cmd).unwrap());

        let t = step(&rc, RcEvent::EnterIdle, cmd).unwrap();
        assert_eq!(t.effects.resources, ResourceAction::DisableAll);
        assert_eq!(rc.state(), RcState::Idle);

        let t = step(&rc, RcEvent::Kickoff, cmd).unwrap();
        assert_eq!(t.effects.resources, ResourceAction::EnableAll);

        step(&rc, RcEvent::PreStop, cmd).unwrap();
        let t = step(&rc, RcEvent::Stop, cmd).unwrap();
        assert_eq!(t.effects.resources, ResourceAction::DisableAll);
        assert_eq!(rc.state(), RcState::Off);
    }

    #[test]
    fn video_idle_keeps_clocks() {
        let rc = at(RcState::On);
        let vid = inputs(IntfMode::Video);

        let t = step(&rc, RcEvent::EnterIdle, vid).unwrap();
        assert_eq!(t.effects.resources, ResourceAction::DisableIrqs);

        let t = step(&rc, RcEvent::PreStop, vid).unwrap();
        assert_eq!(t.effects.resources, ResourceAction::EnableIrqs);
        assert_eq!(rc.state(), RcState::PreOff);
    }

    #[test]
    fn stale_idle_timer_rejected_while_busy() {
        let rc = at(RcState::On);
        let busy = RcInputs { busy: true, ..inputs(IntfMode::Video) };
        assert!(matches!(
            rc.plan(RcEvent::EnterIdle, busy),
            Err(EncoderError::TransitionRejected { state: RcState::On, event: RcEvent::EnterIdle })
        ));
    }

    #[test]
    fn frames_pending_skips_idle() {
        let rc = at(RcState::On);
        let pending = RcInputs { frames_pending: true, ..inputs(IntfMode::Command) };
        assert!(!rc.frame_done(&IrqContext::enter(), pending).unwrap());
    }

    #[test]
    fn early_wakeup_powers_up_from_idle() {
        let cmd = at(RcState::Idle);
        let t = step(&cmd, RcEvent::EarlyWakeup, inputs(IntfMode::Command)).unwrap();
        assert_eq!(t.effects.resources, ResourceAction::EnableAll);
        assert!(t.effects.schedule_idle);
        assert_eq!(cmd.state(), RcState::On);

        let vid = at(RcState::Idle);
        let t = step(&vid, RcEvent::EarlyWakeup, inputs(IntfMode::Video)).unwrap();
        assert_eq!(t.effects.resources, ResourceAction::EnableIrqs);
        assert_eq!(vid.state(), RcState::On);
    }

    #[test]
    fn early_wakeup_while_on_only_extends_idle() {
        let rc = at(RcState::On);
        let t = step(&rc, RcEvent::EarlyWakeup, inputs(IntfMode::Command)).unwrap();
        assert_eq!(t.effects.resources, ResourceAction::None);
        assert!(t.effects.schedule_idle);

        let busy = RcInputs { busy: true, ..inputs(IntfMode::Command) };
        assert!(!step(&rc, RcEvent::EarlyWakeup, busy).unwrap().effects.schedule_idle);

        let prepared = RcInputs { frames_pending: true, ..inputs(IntfMode::Command) };
        assert!(!step(&rc, RcEvent::EarlyWakeup, prepared).unwrap().effects.schedule_idle);

        let refreshing = RcInputs { autorefresh: true, ..inputs(IntfMode::Command) };
        assert!(!step(&rc, RcEvent::EarlyWakeup, refreshing).unwrap().effects.schedule_idle);
        assert_eq!(rc.state(), RcState::On);
    }

    #[test]
    fn idle_events_ignored_without_idle_pc() {
        let no_pc = RcInputs { idle_pc_supported: false, ..inputs(IntfMode::Command) };
        for state in RcState::ALL {
            let rc = at(state);
            assert!(!rc.frame_done(&IrqContext::enter(), no_pc).unwrap());
            for event in [RcEvent::EnterIdle, RcEvent::EarlyWakeup] {
                let t = step(&rc, event, no_pc).unwrap();
                assert_eq!(t.effects, RcEffects::default());
                assert_eq!(rc.state(), state);
            }
        }
    }

    /// Every (state, event) pair outside the table leaves the state alone.
    #[test]
    fn unlisted_transitions_are_rejected() {
        let accepted = [
            (RcState::Off, RcEvent::Kickoff),
            (RcState::Idle, RcEvent::Kickoff),
            (RcState::On, RcEvent::Kickoff),
            (RcState::On, RcEvent::FrameDone),
            (RcState::On, RcEvent::PreStop),
            (RcState::Idle, RcEvent::PreStop),
            (RcState::Off, RcEvent::PreStop),
            (RcState::PreOff, RcEvent::Stop),
            (RcState::Idle, RcEvent::Stop),
            (RcState::On, RcEvent::EnterIdle),
            (RcState::On, RcEvent::EarlyWakeup),
            (RcState::Idle, RcEvent::EarlyWakeup),
        ];

        for mode in [IntfMode::Video, IntfMode::Command] {
            for state in RcState::ALL {
                for event in RcEvent::ALL {
                    let rc = at(state);
                    let result = step(&rc, event, inputs(mode));
                    if accepted.contains(&(state, event)) {
                        assert!(result.is_ok(), "{:?} in {:?} should be accepted", event, state);
                    } else {
                        assert_eq!(
                            result,
                            Err(EncoderError::TransitionRejected { state, event }),
                            "{:?} in {:?}",
                            event,
                            state
                        );
                        assert_eq!(rc.state(), state);
                    }
                }
            }
        }
    }
}
