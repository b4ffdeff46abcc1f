//! CLI driver: load parameters, run frames, export the final mesh.

use anyhow::{Context, Result};
use clap::Parser;
use morphogen_core::{
    FrameReport, GrowthConfig, MeshSnapshot, ProgressSink, Simulation,
};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "morphogen", about = "Differential growth of a cellular mesh")]
struct Cli {
    /// JSON parameter file; defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Number of frames to simulate.
    #[arg(long, default_value_t = 500)]
    frames: u64,

    /// Write the final snapshot as a Wavefront OBJ file.
    #[arg(long)]
    out: Option<PathBuf>,

    /// Override the configured RNG seed.
    #[arg(long)]
    seed: Option<u64>,

    /// Log a progress line every N frames.
    #[arg(long, default_value_t = 25)]
    report_interval: u64,
}

/// Forwards frame reports to the tracing subscriber.
struct TracingProgress {
    interval: u64,
}

impl ProgressSink for TracingProgress {
    fn on_frame(&mut self, report: &FrameReport) {
        let due = self.interval > 0 && report.frame.0 % self.interval == 0;
        if due || report.did_split {
            info!(
                frame = report.frame.0,
                population = report.population,
                births = report.births,
                frozen = report.frozen,
                "frame complete"
            );
        }
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn load_config(path: Option<&Path>) -> Result<GrowthConfig> {
    match path {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("couldn't read config from {}", path.display()))?;
            serde_json::from_str(&text)
                .with_context(|| format!("couldn't parse config from {}", path.display()))
        }
        None => Ok(GrowthConfig::default()),
    }
}

fn write_obj(snapshot: &MeshSnapshot, writer: &mut impl Write) -> std::io::Result<()> {
    for v in &snapshot.vertices {
        writeln!(writer, "v {} {} {}", v.x, v.y, v.z)?;
    }
    for n in &snapshot.normals {
        writeln!(writer, "vn {} {} {}", n.x, n.y, n.z)?;
    }
    for face in &snapshot.faces {
        let [a, b, c] = face.map(|i| i + 1);
        writeln!(writer, "f {a}//{a} {b}//{b} {c}//{c}")?;
    }
    Ok(())
}

fn export_obj(snapshot: &MeshSnapshot, path: &Path) -> Result<()> {
    let file = File::create(path)
        .with_context(|| format!("couldn't create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    write_obj(snapshot, &mut writer)
        .with_context(|| format!("couldn't write {}", path.display()))?;
    Ok(())
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref())?;
    if let Some(seed) = cli.seed {
        config.rng_seed = Some(seed);
    }

    let sink = TracingProgress {
        interval: cli.report_interval,
    };
    let mut sim = Simulation::with_progress(config, Box::new(sink))
        .context("couldn't bootstrap the simulation")?;
    info!(
        population = sim.population(),
        shape = ?sim.config().init_shape,
        food = ?sim.config().food_mode,
        "bootstrap complete"
    );

    for _ in 0..cli.frames {
        sim.step();
    }
    info!(
        frames = cli.frames,
        population = sim.population(),
        frozen = sim.frozen_count(),
        "run complete"
    );

    if let Some(out) = &cli.out {
        let snapshot = sim.snapshot();
        export_obj(&snapshot, out)?;
        info!(
            path = %out.display(),
            vertices = snapshot.vertices.len(),
            faces = snapshot.faces.len(),
            "snapshot exported"
        );
    }
    Ok(())
}
