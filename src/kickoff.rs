//! Flush/start sequencing across the channels of one encoder.

use crate::channel::PhysicalChannel;
use crate::completion::{BusyMask, FrameCompletionTracker};
use crate::types::{EnableState, PendingFlushMask, Role};
use std::sync::Arc;

/// What one kickoff did to the hardware.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KickoffReport {
    pub busy: BusyMask,
    /// Channels flushed individually
    pub individual_flushes: usize,
    /// Pending bits merged into the master's flush, 0 when none
    pub combined_bits: PendingFlushMask,
    pub started: bool,
}

pub struct KickoffCoordinator;

impl KickoffCoordinator {
    /// Trigger every enabled channel, count the kickoff on each of them, then
    /// start the master.
    ///
    /// `tracker` is only reachable through the interrupt-safe lock, so the
    /// busy bits are complete before any completion can clear one.
    pub fn kickoff(
        channels: &[Arc<dyn PhysicalChannel>],
        master: Option<&Arc<dyn PhysicalChannel>>,
        tracker: &mut FrameCompletionTracker,
    ) -> KickoffReport {
        let mut report = KickoffReport::default();
        let mut combined: PendingFlushMask = 0;
        let enabled: Vec<&Arc<dyn PhysicalChannel>> = channels
            .iter()
            .filter(|c| c.enable_state() != EnableState::Disabled)
            .collect();

        for channel in &enabled {
            tracker.mark_busy(&[(channel.index(), channel.role())]);

            if channel.needs_single_flush() {
                combined |= channel.core().ctl().get_pending_flush();
            } else {
                channel.trigger_flush(0);
                report.individual_flushes += 1;
            }
        }

        if let Some(master) = master {
            if combined != 0 {
                master.trigger_flush(combined);
                report.combined_bits = combined;
            }
        }

        // Counted after the flushes and before the start, flushed or not
        for channel in &enabled {
            channel.note_kickoff();
        }

        match master {
            Some(master) => {
                report.started = master.enable_state() != EnableState::Disabled;
                master.trigger_start();
            }
            None if combined != 0 => {
                log::error!("combined flush {:#x} dropped, no master channel", combined);
            }
            None => {}
        }

        report.busy = tracker.busy();
        log::trace!(
            "kickoff: busy={} flushed={} combined={:#x}",
            report.busy,
            report.individual_flushes,
            report.combined_bits
        );
        report
    }

    /// The channel that drives flush/start for the group.
    pub fn resolve_master(channels: &[Arc<dyn PhysicalChannel>]) -> Option<Arc<dyn PhysicalChannel>> {
        channels
            .iter()
            .find(|c| matches!(c.role(), Role::Solo | Role::Master))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testing::{params, RecordingEvents};
    use crate::channel::{CommandChannel, VideoChannel};
    use crate::hw::sim::SimTopology;
    use crate::sync::MayBlock;

    fn video_pair(topo: &SimTopology, parent: &Arc<RecordingEvents>) -> Vec<Arc<dyn PhysicalChannel>> {
        let mut token = MayBlock::process_context();
        let channels: Vec<Arc<dyn PhysicalChannel>> = vec![
            VideoChannel::new(params(topo, 0, Role::Master, parent)),
            VideoChannel::new(params(topo, 1, Role::Slave, parent)),
        ];
        for channel in &channels {
            channel.enable(&mut token).unwrap();
        }
        channels
    }

    #[test]
    fn split_channels_share_one_flush_on_master() {
        let topo = SimTopology::new(2);
        let parent = Arc::new(RecordingEvents::default());
        let channels = video_pair(&topo, &parent);
        topo.channel(0).ctl.stage(0b0001);
        topo.channel(1).ctl.stage(0b0100);

        let master = KickoffCoordinator::resolve_master(&channels);
        let mut tracker = FrameCompletionTracker::new();
        let report = KickoffCoordinator::kickoff(&channels, master.as_ref(), &mut tracker);

        assert_eq!(topo.channel(0).ctl.flushes(), vec![0b0101]);
        assert_eq!(topo.channel(1).ctl.flush_count(), 0);
        assert_eq!(topo.channel(0).ctl.start_count(), 1);
        assert_eq!(topo.channel(1).ctl.start_count(), 0);
        assert_eq!(report.busy.bits(), 0b01);
        assert_eq!(report.individual_flushes, 0);
        assert_eq!(channels[0].pending_kickoff_count(), 1);
    }

    #[test]
    fn solo_channel_flushes_individually() {
        let topo = SimTopology::new(1);
        let parent = Arc::new(RecordingEvents::default());
        let channel: Arc<dyn PhysicalChannel> = CommandChannel::new(params(&topo, 0, Role::Solo, &parent));
        let mut token = MayBlock::process_context();
        channel.enable(&mut token).unwrap();
        let channels = vec![channel];

        let mut tracker = FrameCompletionTracker::new();
        let master = KickoffCoordinator::resolve_master(&channels);
        let report = KickoffCoordinator::kickoff(&channels, master.as_ref(), &mut tracker);

        assert_eq!(report.individual_flushes, 1);
        assert_eq!(report.combined_bits, 0);
        assert_eq!(topo.channel(0).ctl.flush_count(), 1);
        assert_eq!(topo.channel(0).ctl.start_count(), 1);
    }

    #[test]
    fn split_kickoff_without_staged_bits_still_counts_every_channel() {
        let topo = SimTopology::new(2);
        let parent = Arc::new(RecordingEvents::default());
        let channels = video_pair(&topo, &parent);

        let master = KickoffCoordinator::resolve_master(&channels);
        let mut tracker = FrameCompletionTracker::new();
        let report = KickoffCoordinator::kickoff(&channels, master.as_ref(), &mut tracker);

        assert_eq!(report.combined_bits, 0);
        assert_eq!(topo.channel(0).ctl.flush_count(), 0);
        assert_eq!(topo.channel(0).ctl.start_count(), 1);
        assert_eq!(channels[0].pending_kickoff_count(), 1);
        assert_eq!(channels[1].pending_kickoff_count(), 1);
    }

    #[test]
    fn disabled_channels_are_skipped() {
        let topo = SimTopology::new(2);
        let parent = Arc::new(RecordingEvents::default());
        let channels = video_pair(&topo, &parent);
        let mut token = MayBlock::process_context();
        channels[0].disable(&mut token);
        channels[1].disable(&mut token);

        let mut tracker = FrameCompletionTracker::new();
        let master = KickoffCoordinator::resolve_master(&channels);
        let report = KickoffCoordinator::kickoff(&channels, master.as_ref(), &mut tracker);

        assert!(report.busy.is_empty());
        assert_eq!(topo.channel(0).ctl.start_count(), 0);
        assert_eq!(channels[0].pending_kickoff_count(), 0);
    }
}
