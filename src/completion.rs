//! Frame completion tracking.
//!
//! One bit per channel with an outstanding kickoff, plus the watchdog that
//! fails the frame if the bits never clear. Every arm or disarm bumps a
//! generation number; an expiry carrying an older generation is ignored, so a
//! disarm always wins against a timer that already fired.

use crate::types::{FrameEvent, Role, MAX_CHANNELS};
use serde::Serialize;
use std::fmt;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BusyMask(u32);

impl BusyMask {
    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, index: usize) -> bool {
        Self::bit(index).is_some_and(|bit| self.0 & bit != 0)
    }

    /// Returns false for an index past [`MAX_CHANNELS`].
    fn set(&mut self, index: usize) -> bool {
        match Self::bit(index) {
            Some(bit) => {
                self.0 |= bit;
                true
            }
            None => false,
        }
    }

    fn clear(&mut self, index: usize) {
        if let Some(bit) = Self::bit(index) {
            self.0 &= !bit;
        }
    }

    fn bit(index: usize) -> Option<u32> {
        if index < MAX_CHANNELS {
            Some(1 << index)
        } else {
            None
        }
    }
}

impl fmt::Display for BusyMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06b}", self.0)
    }
}

/// Generation of an armed watchdog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WatchdogToken(pub u64);

#[derive(Debug, Clone, Copy)]
struct Armed {
    generation: u64,
    deadline: Instant,
}

#[derive(Debug, Default)]
pub struct FrameCompletionTracker {
    busy: BusyMask,
    generation: u64,
    armed: Option<Armed>,
    /// Most severe completion seen for the current frame
    worst: Option<FrameEvent>,
}

impl FrameCompletionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn busy(&self) -> BusyMask {
        self.busy
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.armed.map(|a| a.deadline)
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Mark channels as having an outstanding kickoff. Slaves never signal
    /// completion on their own and are skipped.
    pub fn mark_busy(&mut self, channels: &[(usize, Role)]) {
        for &(index, role) in channels {
            if role != Role::Slave && !self.busy.set(index) {
                log::error!("channel index {} out of range, not marked busy", index);
            }
        }
    }

    /// Record a completion from channel `index`. Returns the frame's final
    /// event once the last busy channel reports.
    pub fn on_channel_done(&mut self, index: usize, event: FrameEvent) -> Option<FrameEvent> {
        if self.busy.is_empty() {
            log::debug!("{:?} from channel {} ignored, nothing outstanding", event, index);
            return None;
        }
        if !self.busy.contains(index) {
            log::debug!("{:?} from channel {} ignored, not busy (mask {})", event, index, self.busy);
            return None;
        }

        self.busy.clear(index);
        self.worst = match self.worst {
            Some(seen) if seen.severity() >= event.severity() => Some(seen),
            _ => Some(event),
        };

        if !self.busy.is_empty() {
            return None;
        }
        self.disarm();
        self.worst.take()
    }

    pub fn arm_watchdog(&mut self, timeout: Duration, now: Instant) -> WatchdogToken {
        self.generation += 1;
        self.armed = Some(Armed {
            generation: self.generation,
            deadline: now + timeout,
        });
        WatchdogToken(self.generation)
    }

    pub fn disarm(&mut self) {
        self.generation += 1;
        self.armed = None;
    }

    /// Watchdog fired. Fails the frame only if `token` is still the armed
    /// generation and something is still outstanding.
    pub fn on_watchdog_expire(&mut self, token: WatchdogToken) -> Option<FrameEvent> {
        match self.armed {
            Some(armed) if armed.generation == token.0 && !self.busy.is_empty() => {
                log::debug!("watchdog gen {} expired with mask {}", token.0, self.busy);
                self.busy = BusyMask::default();
                self.worst = None;
                self.disarm();
                Some(FrameEvent::Error)
            }
            _ => {
                log::debug!("stale watchdog gen {} (current {})", token.0, self.generation);
                None
            }
        }
    }

    /// Drop whatever is outstanding. Returns whether anything was.
    pub fn force_drain(&mut self) -> bool {
        let outstanding = self.armed.is_some() || !self.busy.is_empty();
        self.busy = BusyMask::default();
        self.worst = None;
        self.disarm();
        outstanding
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn last_channel_completes_frame() {
        let mut tracker = FrameCompletionTracker::new();
        tracker.mark_busy(&[(0, Role::Master), (1, Role::Master)]);
        tracker.arm_watchdog(MS, Instant::now());

        assert_eq!(tracker.on_channel_done(0, FrameEvent::Done), None);
        assert!(tracker.is_armed());
        assert_eq!(tracker.on_channel_done(1, FrameEvent::Done), Some(FrameEvent::Done));
        assert!(tracker.busy().is_empty());
        assert!(!tracker.is_armed());
    }

    #[test]
    fn slaves_are_not_tracked() {
        let mut tracker = FrameCompletionTracker::new();
        tracker.mark_busy(&[(0, Role::Master), (1, Role::Slave)]);
        assert_eq!(tracker.busy().bits(), 0b01);
    }

    #[test]
    fn out_of_range_index_is_rejected() {
        let mut tracker = FrameCompletionTracker::new();
        tracker.mark_busy(&[(MAX_CHANNELS, Role::Solo), (40, Role::Master), (1, Role::Solo)]);

        assert_eq!(tracker.busy().bits(), 0b10);
        assert!(!tracker.busy().contains(40));
        assert_eq!(tracker.on_channel_done(40, FrameEvent::Done), None);
        assert_eq!(tracker.on_channel_done(1, FrameEvent::Done), Some(FrameEvent::Done));
    }

    #[test]
    fn stale_done_is_ignored() {
        let mut tracker = FrameCompletionTracker::new();
        assert_eq!(tracker.on_channel_done(0, FrameEvent::Done), None);
        assert!(!tracker.is_armed());
    }

    #[test]
    fn worst_event_wins() {
        let mut tracker = FrameCompletionTracker::new();
        tracker.mark_busy(&[(0, Role::Solo), (2, Role::Solo)]);
        tracker.arm_watchdog(MS, Instant::now());

        tracker.on_channel_done(2, FrameEvent::PanelDead);
        assert_eq!(tracker.on_channel_done(0, FrameEvent::Done), Some(FrameEvent::PanelDead));
    }

    #[test]
    fn expiry_with_old_generation_is_ignored() {
        let mut tracker = FrameCompletionTracker::new();
        tracker.mark_busy(&[(0, Role::Solo)]);
        let old = tracker.arm_watchdog(MS, Instant::now());
        tracker.disarm();
        let current = tracker.arm_watchdog(MS, Instant::now());
        assert_eq!(current.0, old.0 + 2);

        assert_eq!(tracker.on_watchdog_expire(old), None);
        assert_eq!(tracker.busy().bits(), 1);
        assert_eq!(tracker.on_watchdog_expire(current), Some(FrameEvent::Error));
        assert!(tracker.busy().is_empty());
        assert!(tracker.deadline().is_none());
        // Fires once
        assert_eq!(tracker.on_watchdog_expire(current), None);
    }

    #[test]
    fn disarm_beats_expiry_of_same_generation() {
        let mut tracker = FrameCompletionTracker::new();
        tracker.mark_busy(&[(0, Role::Solo)]);
        let token = tracker.arm_watchdog(MS, Instant::now());
        tracker.disarm();
        assert_eq!(tracker.on_watchdog_expire(token), None);
    }

    /// Random interleavings of kickoff, completion and expiry keep the mask
    /// and the deadline in step.
    #[test]
    fn mask_empty_iff_deadline_disarmed() {
        let mut rng = fastrand::Rng::with_seed(0x5eed_f00d);
        let roles = [Role::Master, Role::Slave, Role::Solo, Role::Solo];

        for _ in 0..200 {
            let mut tracker = FrameCompletionTracker::new();
            let mut tokens = Vec::new();

            for _ in 0..64 {
                match rng.u8(0..4) {
                    0 => {
                        let picked: Vec<(usize, Role)> = (0..roles.len())
                            .filter(|_| rng.bool())
                            .map(|i| (i, roles[i]))
                            .collect();
                        tracker.mark_busy(&picked);
                        if !tracker.busy().is_empty() {
                            tokens.push(tracker.arm_watchdog(MS, Instant::now()));
                        }
                    }
                    1 | 2 => {
                        let event = if rng.u8(0..8) == 0 { FrameEvent::Error } else { FrameEvent::Done };
                        tracker.on_channel_done(rng.usize(0..roles.len()), event);
                    }
                    _ => {
                        if !tokens.is_empty() {
                            let token = tokens[rng.usize(0..tokens.len())];
                            tracker.on_watchdog_expire(token);
                        }
                    }
                }
                assert_eq!(tracker.busy().is_empty(), !tracker.is_armed());
            }
        }
    }
}
