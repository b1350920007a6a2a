//! Next-vsync estimation from the master's scan position.

use crate::channel::PhysicalChannel;
use crate::types::DisplayMode;
use serde::Serialize;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VsyncEstimate {
    pub line_time_ns: u64,
    pub current_line: u32,
    pub time_to_vsync: Duration,
    #[serde(skip)]
    pub at: Instant,
}

/// Duration of one scan line in ns, from a pixel clock in kHz.
///
/// The clock period is rounded up to whole picoseconds before scaling by
/// `htotal`.
pub fn line_time_ns(mode: &DisplayMode) -> Option<u64> {
    if mode.clock_khz == 0 {
        log::error!("pixel clock is 0, cannot compute line time");
        return None;
    }
    let period_ps = 1_000_000_000u64.div_ceil(u64::from(mode.clock_khz));
    let line_time = period_ps * u64::from(mode.htotal) / 1000;
    if line_time == 0 {
        log::error!("line time is 0 (clock {} kHz, htotal {})", mode.clock_khz, mode.htotal);
        return None;
    }
    Some(line_time)
}

/// When the master's panel will next hit vsync, as seen at `now`.
pub fn estimate_next_vsync(
    master: Option<&dyn PhysicalChannel>,
    mode: &DisplayMode,
    now: Instant,
) -> Option<VsyncEstimate> {
    let master = master?;
    let line_time = line_time_ns(mode)?;

    let current_line = master.core().line_count();
    let lines_left = if current_line >= mode.vtotal {
        mode.vtotal
    } else {
        mode.vtotal - current_line
    };

    let ns = line_time * u64::from(lines_left);
    if ns == 0 {
        log::error!("time to vsync is 0 (vtotal {})", mode.vtotal);
        return None;
    }

    let time_to_vsync = Duration::from_nanos(ns);
    log::trace!(
        "line={} vtotal={} line_time={}ns time_to_vsync={:?}",
        current_line,
        mode.vtotal,
        line_time,
        time_to_vsync
    );
    Some(VsyncEstimate {
        line_time_ns: line_time,
        current_line,
        time_to_vsync,
        at: now + time_to_vsync,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::testing::{params, RecordingEvents};
    use crate::channel::VideoChannel;
    use crate::hw::sim::SimTopology;
    use crate::types::Role;
    use std::sync::Arc;

    #[test]
    fn line_time_for_1080p60_panel() {
        // ceil(1e9 / 167000) = 5989 ps per pixel, 1184 pixels per line
        assert_eq!(line_time_ns(&DisplayMode::dsi_1080p60()), Some(7090));
    }

    #[test]
    fn degenerate_modes_have_no_estimate() {
        let topo = SimTopology::new(1);
        let parent = Arc::new(RecordingEvents::default());
        let master: Arc<dyn PhysicalChannel> = VideoChannel::new(params(&topo, 0, Role::Solo, &parent));
        let now = Instant::now();

        let no_clock = DisplayMode { clock_khz: 0, ..DisplayMode::dsi_1080p60() };
        assert!(estimate_next_vsync(Some(master.as_ref()), &no_clock, now).is_none());

        let no_htotal = DisplayMode { htotal: 0, ..DisplayMode::dsi_1080p60() };
        assert!(estimate_next_vsync(Some(master.as_ref()), &no_htotal, now).is_none());

        let no_vtotal = DisplayMode { vtotal: 0, ..DisplayMode::dsi_1080p60() };
        assert!(estimate_next_vsync(Some(master.as_ref()), &no_vtotal, now).is_none());

        assert!(estimate_next_vsync(None, &DisplayMode::dsi_1080p60(), now).is_none());
    }

    #[test]
    fn counts_remaining_lines() {
        let topo = SimTopology::new(1);
        let parent = Arc::new(RecordingEvents::default());
        let master: Arc<dyn PhysicalChannel> = VideoChannel::new(params(&topo, 0, Role::Solo, &parent));
        let mode = DisplayMode::dsi_1080p60();
        let now = Instant::now();

        topo.channel(0).timing.set_line(2000);
        let est = estimate_next_vsync(Some(master.as_ref()), &mode, now).unwrap();
        assert_eq!(est.time_to_vsync, Duration::from_nanos(7090 * 350));
        assert_eq!(est.at, now + est.time_to_vsync);

        // Past the last line: a full frame
        topo.channel(0).timing.set_line(5000);
        let est = estimate_next_vsync(Some(master.as_ref()), &mode, now).unwrap();
        assert_eq!(est.time_to_vsync, Duration::from_nanos(7090 * 2350));
    }
}
