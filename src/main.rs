use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use vio_fusion::calibration::Calibration;
use vio_fusion::config::FusionConfig;
use vio_fusion::system::{FusionEvent, Replay};

const USAGE: &str = "usage: vio_replay <capture.rc> [calibration.json] [--config cfg.yaml] [--trajectory out.csv] [--realtime]";

/// Resolution assumed when no calibration is found.
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;

struct Args {
    capture: PathBuf,
    calibration: Option<PathBuf>,
    config: Option<PathBuf>,
    trajectory: Option<PathBuf>,
    realtime: bool,
}

fn parse_args() -> Result<Args> {
    let mut positional = Vec::new();
    let mut config = None;
    let mut trajectory = None;
    let mut realtime = false;

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => config = Some(PathBuf::from(args.next().context("--config needs a file")?)),
            "--trajectory" => trajectory = Some(PathBuf::from(args.next().context("--trajectory needs a file")?)),
            "--realtime" => realtime = true,
            "-h" | "--help" => bail!(USAGE),
            flag if flag.starts_with("--") => bail!("unknown option {}\n{}", flag, USAGE),
            _ => positional.push(PathBuf::from(arg)),
        }
    }

    let mut positional = positional.into_iter();
    let capture = positional.next().context(USAGE)?;
    let calibration = positional.next();
    if positional.next().is_some() {
        bail!(USAGE);
    }
    Ok(Args {
        capture,
        calibration,
        config,
        trajectory,
        realtime,
    })
}

fn load_calibration(args: &Args) -> Result<Calibration> {
    let path = args
        .calibration
        .clone()
        .or_else(|| Replay::find_calibration(&args.capture));
    match path {
        Some(path) => {
            info!("Loading calibration from {}", path.display());
            Calibration::from_file(&path).with_context(|| format!("Failed to load calibration {}", path.display()))
        }
        None => {
            warn!("No calibration found, using defaults for a {}x{} camera", DEFAULT_WIDTH, DEFAULT_HEIGHT);
            Ok(Calibration::default_for_device(DEFAULT_WIDTH, DEFAULT_HEIGHT))
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = parse_args()?;
    let config = match &args.config {
        Some(path) => FusionConfig::from_yaml_file(path).with_context(|| format!("Failed to load config {}", path.display()))?,
        None => FusionConfig::default(),
    };
    let calibration = load_calibration(&args)?;

    let mut replay = Replay::open(&args.capture, calibration, config)?;
    replay.set_realtime(args.realtime);
    if let Some(path) = &args.trajectory {
        replay.write_trajectory(path)?;
    }

    println!("Replaying {}", args.capture.display());
    let result = replay.run(|event| match event {
        FusionEvent::Status(status) => info!("status: {}", status),
        FusionEvent::CalibrationFinished(_) => info!("calibration finished"),
        FusionEvent::Pose { .. } => {}
    })?;

    let t = result.final_pose.translation;
    let (roll, pitch, yaw) = result.final_pose.rotation.euler_angles();
    println!("Processed {} packets", result.packets);
    println!("Path length: {:.3} m", result.path_length_m);
    println!("Final position: [{:.3}, {:.3}, {:.3}] m", t.x, t.y, t.z);
    println!(
        "Final orientation (roll, pitch, yaw): [{:.2}, {:.2}, {:.2}] deg",
        roll.to_degrees(),
        pitch.to_degrees(),
        yaw.to_degrees()
    );
    println!("Final status: {}", result.final_status);
    println!("{}", result.queue_stats);
    Ok(())
}
