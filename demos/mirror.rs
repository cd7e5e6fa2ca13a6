use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use snow_mirror::convert::{SurfacePixelFormat, convert_surface_to_rgb565};
use snow_mirror::frame::Frame;
use snow_mirror::protocol::{CMD_DISPLAY_ON, DisplayProtocol};
use snow_mirror::{
    FrameLayout, FrameSource, MirrorConfig, MirrorResult, MirrorSession, PanelSimulator,
};

const WIDTH: u32 = 480;
const HEIGHT: u32 = 320;
const FRAMES: u32 = 300;
const TARGET_FPS: u64 = 60;

/// Renders a BGRA desktop-like scene: a static gradient wallpaper, a
/// window that slides across it, and a blinking caret.
struct SyntheticDesktop {
    surface: Vec<u8>,
    pitch: usize,
    tick: u32,
}

impl SyntheticDesktop {
    fn new() -> Self {
        let pitch = (WIDTH as usize * 4).next_multiple_of(256);
        Self {
            surface: vec![0; pitch * HEIGHT as usize],
            pitch,
            tick: 0,
        }
    }

    fn paint(&mut self) {
        let t = self.tick;
        let window_x = (t * 2) % (WIDTH - 160);
        let window_y = 40 + (t / 3) % (HEIGHT - 160);
        let caret_on = (t / 15) % 2 == 0;

        for y in 0..HEIGHT {
            let row = &mut self.surface[y as usize * self.pitch..][..WIDTH as usize * 4];
            for (x, px) in row.chunks_exact_mut(4).enumerate() {
                let x = x as u32;
                let in_window = (window_x..window_x + 160).contains(&x)
                    && (window_y..window_y + 120).contains(&y);
                let in_caret =
                    caret_on && (20..22).contains(&x) && (HEIGHT - 30..HEIGHT - 14).contains(&y);
                let (r, g, b) = if in_caret {
                    (0xFF, 0xFF, 0xFF)
                } else if in_window {
                    (0x30, 0x30, 0x38)
                } else {
                    ((x * 255 / WIDTH) as u8, (y * 255 / HEIGHT) as u8, 0x80)
                };
                px.copy_from_slice(&[b, g, r, 0xFF]);
            }
        }
    }
}

impl FrameSource for SyntheticDesktop {
    fn capture_into(&mut self, frame: &mut Frame) -> MirrorResult<bool> {
        if self.tick >= FRAMES {
            return Ok(false);
        }
        self.paint();
        convert_surface_to_rgb565(SurfacePixelFormat::Bgra8, &self.surface, self.pitch, frame)?;
        frame.metadata.sequence = u64::from(self.tick);
        frame.metadata.capture_time = Some(Instant::now());
        self.tick += 1;
        Ok(true)
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let layout = FrameLayout::packed(WIDTH, HEIGHT)?;
    // The simulator only decodes RGB565.
    let config = MirrorConfig {
        protocol: DisplayProtocol::default(),
        ..MirrorConfig::from_env()
    };
    let panel = PanelSimulator::new(layout, config.protocol)?;
    let mut session = MirrorSession::builder()
        .with_config(config)
        .build(layout, panel.clone())
        .context("failed to build mirror session")?;
    session.enqueue_command(CMD_DISPLAY_ON, &[0])?;

    let mut source = SyntheticDesktop::new();
    let mut frame = Frame::with_layout(layout)?;
    let frame_interval = Duration::from_micros(1_000_000 / TARGET_FPS);
    let start = Instant::now();

    println!("Mirroring {FRAMES} frames of {WIDTH}x{HEIGHT} with {config:?}");
    let mut next_deadline = Instant::now();
    while session.pump(&mut source, &mut frame)? {
        if frame.metadata.sequence % 60 == 59 {
            let snap = session.stats();
            println!(
                "  frame #{}: spans={} merges={} pixels={} backlog={}B stalls={} diff={:.3}ms",
                frame.metadata.sequence + 1,
                snap.spans_emitted,
                snap.merges,
                snap.pixels_queued,
                snap.backlog_bytes,
                snap.producer_stalls,
                snap.diff_latency_avg.as_secs_f64() * 1000.0,
            );
        }
        next_deadline += frame_interval;
        if let Some(wait) = next_deadline.checked_duration_since(Instant::now()) {
            std::thread::sleep(wait);
        }
    }

    if !session.wait_idle(Duration::from_secs(5))? {
        bail!("bus did not drain within 5s");
    }
    let in_sync = panel.matches(&frame)?;
    let stats = session.shutdown()?;
    let elapsed = start.elapsed();

    let full_bytes = u64::from(WIDTH * HEIGHT) * 2 * stats.frames_submitted;
    println!("\nResults ({elapsed:.2?}):");
    println!("  panel in sync:      {in_sync}");
    println!(
        "  frames:             {} ({} unchanged, {} interlaced, {} full)",
        stats.frames_submitted,
        stats.frames_unchanged,
        stats.interlaced_frames,
        stats.full_refreshes
    );
    println!("  tasks driven:       {}", stats.tasks_driven);
    println!(
        "  bus bytes:          {} ({:.1}% of full-frame updates)",
        stats.bytes_driven,
        stats.bytes_driven as f64 * 100.0 / full_bytes.max(1) as f64
    );
    println!("  producer stalls:    {}", stats.producer_stalls);
    println!("  queue wraps:        {}", stats.queue_wraps);
    println!("  bus errors:         {}", stats.bus_errors);

    if !in_sync {
        bail!("panel diverged from the last submitted frame");
    }
    Ok(())
}
