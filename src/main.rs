//! RayOS display simulator
//!
//! Drives a virtual encoder over simulated hardware and prints what happened.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use rayos_display::hw::sim::{SimPower, SimTopology};
use rayos_display::{
    DisplayInfo, DisplayMode, EncoderConfig, EncoderStatus, FrameEvent, IntfMode, IntfType, KickoffParams,
    VirtualEncoder,
};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Mode {
    Video,
    Command,
}

#[derive(Parser)]
#[command(name = "display-sim")]
#[command(about = "RayOS Display - virtual encoder simulator", long_about = None)]
struct Cli {
    /// Path to encoder configuration (TOML)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Horizontal tiles (physical channels)
    #[arg(short, long, default_value = "1")]
    tiles: u32,

    /// Interface mode
    #[arg(short, long, value_enum, default_value = "video")]
    mode: Mode,

    /// Frames to submit
    #[arg(short = 'n', long, default_value = "10")]
    frames: u64,

    /// Swallow the completion interrupt of every Nth frame (0 = never)
    #[arg(short, long, default_value = "0")]
    drop_every: u64,

    /// Time between kickoff and the simulated completion (ms)
    #[arg(long, default_value = "16")]
    frame_ms: u64,
}

#[derive(Debug, Default, Serialize)]
struct FrameTally {
    done: u64,
    error: u64,
    panel_dead: u64,
    idle: u64,
}

impl FrameTally {
    fn record(&mut self, event: FrameEvent) {
        match event {
            FrameEvent::Done => self.done += 1,
            FrameEvent::Error => self.error += 1,
            FrameEvent::PanelDead => self.panel_dead += 1,
            FrameEvent::Idle => self.idle += 1,
        }
    }
}

#[derive(Serialize)]
struct Summary {
    frames: u64,
    dropped: u64,
    events: FrameTally,
    vblanks: u64,
    status: EncoderStatus,
}

fn main() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => EncoderConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => EncoderConfig::default(),
    };

    let intf_mode = match cli.mode {
        Mode::Video => IntfMode::Video,
        Mode::Command => IntfMode::Command,
    };
    let display = DisplayInfo {
        intf_type: IntfType::Dsi,
        intf_mode,
        h_tile_instance: (0..cli.tiles).collect(),
    };

    let mode = DisplayMode::dsi_1080p60();
    let settle = config.frame_done_timeout(mode.vrefresh) + config.irq_wait_timeout();
    let idle_wait = config.idle_timeout() + Duration::from_millis(50);

    let topology = SimTopology::new(cli.tiles);
    let power = Arc::new(SimPower::default());
    let enc = VirtualEncoder::setup(0, display, &topology, power.clone(), config)
        .context("setting up encoder")?;

    let (event_tx, event_rx) = crossbeam_channel::unbounded();
    enc.register_frame_event_callback(Some(Box::new(move |event: FrameEvent| {
        let _ = event_tx.send(event);
    })))?;

    let vblanks = Arc::new(AtomicU64::new(0));
    {
        let vblanks = vblanks.clone();
        enc.register_vblank_callback(Some(Box::new(move || {
            vblanks.fetch_add(1, Ordering::Relaxed);
        })))?;
    }

    enc.mode_set(mode)?;
    enc.enable()?;
    log::info!("Simulating {} {:?} frame(s) on {} tile(s)", cli.frames, cli.mode, cli.tiles);

    let mut tally = FrameTally::default();
    let mut dropped = 0;

    for frame in 1..=cli.frames {
        enc.prepare_kickoff(KickoffParams { frame })?;
        let report = enc.kickoff()?;
        log::debug!("frame {}: busy={} combined={:#x}", frame, report.busy, report.combined_bits);

        thread::sleep(Duration::from_millis(cli.frame_ms));

        if cli.drop_every != 0 && frame % cli.drop_every == 0 {
            log::warn!("frame {}: dropping completion interrupt", frame);
            dropped += 1;
        } else {
            let fired = topology.complete_frame(intf_mode);
            log::trace!("frame {}: {} completion line(s) fired", frame, fired);
        }

        match event_rx.recv_timeout(settle) {
            Ok(event) => {
                log::info!("frame {}: {:?}", frame, event);
                tally.record(event);
            }
            Err(_) => log::warn!("frame {}: no frame event within {:?}", frame, settle),
        }
    }

    // Let the idle timer run out
    thread::sleep(idle_wait);
    for event in event_rx.try_iter() {
        tally.record(event);
    }

    let status = enc.status();
    log::info!("Encoder state before shutdown: {:?}", status.rc_state);

    enc.teardown()?;
    log::info!("Power votes after teardown: {}", power.votes());

    let summary = Summary {
        frames: cli.frames,
        dropped,
        events: tally,
        vblanks: vblanks.load(Ordering::Relaxed),
        status,
    };
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}
