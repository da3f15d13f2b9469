use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use attitude_ekf::filters::attitude_ekf::{AttitudeEkf, FilterParams};
use attitude_ekf::replay::{self, DEFAULT_DT};
use clap::Parser;
use serde_json::json;

#[derive(Parser, Debug)]
struct Args {
    /// Path to a *.json[.gz] IMU log
    #[arg(long, conflicts_with = "log_dir")]
    log: Option<PathBuf>,

    /// Directory of logs to batch replay (processes *.json and *.json.gz)
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// JSON file with filter parameters (missing fields use defaults)
    #[arg(long)]
    params: Option<PathBuf>,

    /// Sample period assumed for the first reading (seconds)
    #[arg(long, default_value_t = DEFAULT_DT)]
    dt: f64,

    /// Quaternion process noise (q1)
    #[arg(long)]
    quaternion_noise: Option<f64>,

    /// Gyro bias process noise (q2)
    #[arg(long)]
    bias_noise: Option<f64>,

    /// Accelerometer measurement noise (r)
    #[arg(long)]
    accel_noise: Option<f64>,

    /// Bias covariance fading coefficient (lambda)
    #[arg(long)]
    fading: Option<f64>,

    /// Chi-square gating threshold (tau)
    #[arg(long)]
    chi2_threshold: Option<f64>,
}

fn load_params(args: &Args) -> anyhow::Result<FilterParams> {
    let mut params = match args.params.as_ref() {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
        }
        None => FilterParams::default(),
    };

    if let Some(v) = args.quaternion_noise {
        params.quaternion_noise = v;
    }
    if let Some(v) = args.bias_noise {
        params.bias_noise = v;
    }
    if let Some(v) = args.accel_noise {
        params.accel_noise = v;
    }
    if let Some(v) = args.fading {
        params.fading = v;
    }
    if let Some(v) = args.chi2_threshold {
        params.chi2_threshold = v;
    }

    params.validate()?;
    Ok(params)
}

fn run_once(path: &Path, params: FilterParams, dt: f64) -> anyhow::Result<serde_json::Value> {
    let log = replay::load_log(path)?;
    let mut ekf = AttitudeEkf::new(params)?;
    let summary = replay::replay(&mut ekf, &log, dt);

    Ok(json!({
        "log": path.display().to_string(),
        "params": params,
        "summary": summary,
    }))
}

fn is_log_file(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    path.is_file() && (name.ends_with(".json") || name.ends_with(".json.gz"))
}

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    if !(args.dt.is_finite() && args.dt > 0.0) {
        anyhow::bail!("--dt must be positive, got {}", args.dt);
    }
    let params = load_params(&args)?;
    log::info!("replaying with {params:?}");

    let mut results = Vec::new();
    if let Some(dir) = args.log_dir.as_ref() {
        let mut paths = Vec::new();
        for entry in fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
            let path = entry?.path();
            if is_log_file(&path) {
                paths.push(path);
            }
        }
        paths.sort();

        for path in paths {
            match run_once(&path, params, args.dt) {
                Ok(res) => results.push(res),
                Err(e) => log::error!("Failed {}: {:#}", path.display(), e),
            }
        }
    } else if let Some(log) = args.log.as_ref() {
        results.push(run_once(log, params, args.dt)?);
    } else {
        anyhow::bail!("Provide --log or --log-dir");
    }

    println!("{}", serde_json::to_string_pretty(&results)?);
    Ok(())
}
