use std::hint::black_box;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use snow_mirror::frame::Frame;
use snow_mirror::{DiffEngine, DiffMode, FieldParity, MergePolicy, SpanList, merge_spans};

const DEFAULT_WARMUP_ITERS: usize = 16;
const DEFAULT_MEASURE_ITERS: usize = 200;

#[derive(Clone, Debug)]
struct Config {
    warmup_iters: usize,
    measure_iters: usize,
    scenario_filter: Option<String>,
    merge_threshold: u32,
}

/// How the "current" frame differs from the "previous" one.
#[derive(Clone, Copy, Debug)]
enum Change {
    /// A blinking caret.
    Caret,
    /// A window dragged by a few pixels.
    Window,
    /// Video playing in a quarter of the screen.
    Video,
    /// Every pixel.
    Everything,
}

#[derive(Clone, Copy, Debug)]
struct Scenario {
    name: &'static str,
    width: u32,
    height: u32,
    change: Change,
}

#[derive(Clone, Debug)]
struct BenchResult {
    scenario: String,
    mode: DiffMode,
    interlaced: bool,
    spans: usize,
    merged_spans: usize,
    pixels: u64,
    avg_ms: f64,
    p50_ms: f64,
    p95_ms: f64,
    p99_ms: f64,
    max_ms: f64,
}

fn parse_usize_arg(flag: &str, value: Option<&str>) -> Result<usize> {
    let Some(raw) = value else {
        bail!("{flag} requires a value");
    };
    raw.parse::<usize>()
        .with_context(|| format!("failed to parse {flag} value: {raw}"))
}

fn parse_args() -> Result<Config> {
    let mut warmup_iters = DEFAULT_WARMUP_ITERS;
    let mut measure_iters = DEFAULT_MEASURE_ITERS;
    let mut scenario_filter = None;
    let mut merge_threshold = MergePolicy::default().threshold;

    let args: Vec<String> = std::env::args().collect();
    let mut i = 1usize;
    while i < args.len() {
        match args[i].as_str() {
            "--warmup" => {
                warmup_iters = parse_usize_arg("--warmup", args.get(i + 1).map(String::as_str))?;
                i += 2;
            }
            "--iters" => {
                measure_iters = parse_usize_arg("--iters", args.get(i + 1).map(String::as_str))?;
                i += 2;
            }
            "--scenario" => {
                let Some(raw) = args.get(i + 1) else {
                    bail!("--scenario requires a value (scenario name or `all`)");
                };
                let trimmed = raw.trim();
                scenario_filter = (!trimmed.is_empty() && !trimmed.eq_ignore_ascii_case("all"))
                    .then(|| trimmed.to_ascii_lowercase());
                i += 2;
            }
            "--merge-threshold" => {
                let raw =
                    parse_usize_arg("--merge-threshold", args.get(i + 1).map(String::as_str))?;
                merge_threshold =
                    u32::try_from(raw).context("--merge-threshold does not fit in 32 bits")?;
                i += 2;
            }
            "--help" | "-h" => {
                println!(
                    "Usage: cargo run --release --example diff_benchmark -- [options]
  --warmup <n>              Warmup iterations per case (default: {DEFAULT_WARMUP_ITERS})
  --iters <n>               Measured iterations per case (default: {DEFAULT_MEASURE_ITERS})
  --scenario <name|all>     Scenario filter (default: all)
  --merge-threshold <n>     Unchanged pixels a merge may add (default: 320)"
                );
                std::process::exit(0);
            }
            other => {
                bail!("unknown argument: {other}");
            }
        }
    }

    if warmup_iters == 0 {
        bail!("--warmup must be >= 1");
    }
    if measure_iters == 0 {
        bail!("--iters must be >= 1");
    }

    Ok(Config {
        warmup_iters,
        measure_iters,
        scenario_filter,
        merge_threshold,
    })
}

fn scenario_catalog() -> Vec<Scenario> {
    vec![
        Scenario {
            name: "caret_480x320",
            width: 480,
            height: 320,
            change: Change::Caret,
        },
        Scenario {
            name: "window_drag_480x320",
            width: 480,
            height: 320,
            change: Change::Window,
        },
        Scenario {
            name: "video_800x480",
            width: 800,
            height: 480,
            change: Change::Video,
        },
        Scenario {
            name: "full_change_800x480",
            width: 800,
            height: 480,
            change: Change::Everything,
        },
    ]
}

fn fill_noise(frame: &mut Frame, seed: u64) {
    let mut state = seed;
    for px in frame.as_mut_pixels() {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        *px = (state >> 48) as u16;
    }
}

fn build_frames(scenario: Scenario) -> Result<(Frame, Frame)> {
    let mut previous = Frame::new(scenario.width, scenario.height)?;
    fill_noise(&mut previous, 0x9e37_79b9_7f4a_7c15);
    let mut current = Frame::new(scenario.width, scenario.height)?;
    current.copy_from(&previous.view())?;

    let (w, h) = (scenario.width, scenario.height);
    match scenario.change {
        Change::Caret => current.fill_rect(w / 3, h / 2, 2, 16, 0xFFFF),
        Change::Window => {
            current.fill_rect(w / 4, h / 4, w / 2, h / 2, 0x4208);
            current.fill_rect(w / 4 + 3, h / 4 + 2, w / 2, 18, 0x001F);
        }
        Change::Video => {
            let mut video = Frame::new(w / 2, h / 2)?;
            fill_noise(&mut video, 7);
            let (x0, x1) = ((w / 4) as usize, (w / 4 + w / 2) as usize);
            for y in 0..h / 2 {
                current.row_mut(y + h / 4)[x0..x1].copy_from_slice(video.row(y));
            }
        }
        Change::Everything => fill_noise(&mut current, 42),
    }
    Ok((current, previous))
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return 0.0;
    }
    let idx = ((n - 1) as f64 * p.clamp(0.0, 1.0)).round() as usize;
    sorted[idx]
}

fn run_case(
    config: &Config,
    scenario: Scenario,
    mode: DiffMode,
    interlaced: bool,
) -> Result<BenchResult> {
    let (current, previous) = build_frames(scenario)?;
    let engine = DiffEngine::new(mode, 320);
    let policy = MergePolicy {
        threshold: config.merge_threshold,
        ..MergePolicy::default()
    };
    let field = interlaced.then_some(FieldParity::Even);
    let mut spans = SpanList::for_layout(current.layout());

    let run = |spans: &mut SpanList| -> Result<usize> {
        let found = engine.diff(
            black_box(&current.view()),
            black_box(&previous.view()),
            field,
            spans,
        )?;
        merge_spans(spans, &policy);
        Ok(found)
    };

    for _ in 0..config.warmup_iters {
        run(&mut spans)?;
    }

    let mut samples_ms = Vec::with_capacity(config.measure_iters);
    let mut found = 0;
    for _ in 0..config.measure_iters {
        let t0 = Instant::now();
        found = run(&mut spans)?;
        samples_ms.push(t0.elapsed().as_secs_f64() * 1000.0);
        black_box(&spans);
    }

    let mut sorted = samples_ms.clone();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let avg_ms = samples_ms.iter().sum::<f64>() / samples_ms.len() as f64;

    Ok(BenchResult {
        scenario: scenario.name.to_string(),
        mode,
        interlaced,
        spans: found,
        merged_spans: spans.len(),
        pixels: spans.total_pixels(),
        avg_ms,
        p50_ms: percentile(&sorted, 0.50),
        p95_ms: percentile(&sorted, 0.95),
        p99_ms: percentile(&sorted, 0.99),
        max_ms: sorted.last().copied().unwrap_or(0.0),
    })
}

fn main() -> Result<()> {
    env_logger::init();
    let config = parse_args()?;

    let scenarios: Vec<Scenario> = scenario_catalog()
        .into_iter()
        .filter(|s| {
            config
                .scenario_filter
                .as_deref()
                .is_none_or(|filter| s.name == filter)
        })
        .collect();
    if scenarios.is_empty() {
        bail!("no scenario matches {:?}", config.scenario_filter);
    }

    println!(
        "Diff benchmark: warmup={} iters={} merge_threshold={}",
        config.warmup_iters, config.measure_iters, config.merge_threshold
    );
    println!(
        "{:<22} {:<10} {:>4} {:>7} {:>7} {:>9} {:>8} {:>8} {:>8} {:>8} {:>8}",
        "scenario", "mode", "int", "spans", "merged", "pixels", "avg_ms", "p50_ms", "p95_ms",
        "p99_ms", "max_ms"
    );

    for scenario in scenarios {
        for mode in [DiffMode::Coarse, DiffMode::Exact, DiffMode::FullFrame] {
            for interlaced in [false, true] {
                if interlaced && mode == DiffMode::FullFrame {
                    continue;
                }
                let r = run_case(&config, scenario, mode, interlaced)?;
                println!(
                    "{:<22} {:<10} {:>4} {:>7} {:>7} {:>9} {:>8.3} {:>8.3} {:>8.3} {:>8.3} {:>8.3}",
                    r.scenario,
                    format!("{:?}", r.mode),
                    if r.interlaced { "yes" } else { "no" },
                    r.spans,
                    r.merged_spans,
                    r.pixels,
                    r.avg_ms,
                    r.p50_ms,
                    r.p95_ms,
                    r.p99_ms,
                    r.max_ms,
                );
            }
        }
    }
    Ok(())
}
