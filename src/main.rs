use std::fs::File;
use std::io::BufReader;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use serde::Deserialize;

use msckf_vio::{FilterOptions, Pipeline};

#[derive(Parser)]
#[command(name = "msckf_replay")]
#[command(about = "Replays a recorded IMU + feature-track session through the MSCKF estimator", long_about = None)]
struct Args {
    /// Path to a recorded session (JSON, one record per line -- see `SessionRecord`).
    session: String,

    /// Optional estimator configuration (JSON). Falls back to `FilterOptions::default()`.
    #[arg(long)]
    config: Option<String>,

    /// Print every accepted image-epoch pose instead of only the final one.
    #[arg(long, default_value = "false")]
    verbose: bool,
}

/// One line of the replay session: either an IMU sample or a batch of feature
/// observations for a single image epoch.
#[derive(Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum SessionRecord {
    Imu {
        timestamp: f64,
        wm: [f64; 3],
        am: [f64; 3],
    },
    Image {
        timestamp: f64,
        tracks: Vec<FeatureTrack>,
    },
}

#[derive(Deserialize)]
struct FeatureTrack {
    id: usize,
    cam: usize,
    u: f64,
    v: f64,
    un: f64,
    vn: f64,
}

fn load_options(path: Option<&str>) -> Result<FilterOptions> {
    match path {
        Some(path) => {
            let file = File::open(path).with_context(|| format!("opening config {path}"))?;
            let options = serde_json::from_reader(BufReader::new(file)).with_context(|| format!("parsing config {path}"))?;
            Ok(options)
        }
        None => Ok(FilterOptions::default()),
    }
}

fn load_session(path: &str) -> Result<Vec<SessionRecord>> {
    let file = File::open(path).with_context(|| format!("opening session {path}"))?;
    let reader = BufReader::new(file);
    let records: Vec<SessionRecord> = serde_json::from_reader(reader).with_context(|| format!("parsing session {path}"))?;
    Ok(records)
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let options = load_options(args.config.as_deref())?;
    let records = load_session(&args.session)?;
    info!("loaded {} records from {}", records.len(), args.session);

    let mut pipeline = Pipeline::new(options);
    let mut epochs = 0usize;

    for record in records {
        match record {
            SessionRecord::Imu { timestamp, wm, am } => {
                pipeline.feed_imu(timestamp, wm.into(), am.into());
            }
            SessionRecord::Image { timestamp, tracks } => {
                for t in tracks {
                    pipeline.feed_feature(t.id, timestamp, t.cam, t.u, t.v, t.un, t.vn);
                }
                let ran = pipeline.process_image_epoch(timestamp)?;
                if ran {
                    epochs += 1;
                    if args.verbose {
                        print_pose(timestamp, &pipeline);
                    }
                }
            }
        }
    }

    if !args.verbose {
        if let Some((t, _)) = pipeline.state().clones.last() {
            print_pose(*t, &pipeline);
        } else {
            print_pose(pipeline.state().timestamp, &pipeline);
        }
    }
    info!("replay complete: {} image epochs processed, initialized={}", epochs, pipeline.is_initialized());
    Ok(())
}

fn print_pose(timestamp: f64, pipeline: &Pipeline) {
    let imu = &pipeline.state().imu;
    println!(
        "t={:.4} q_GtoI=[{:.6}, {:.6}, {:.6}, {:.6}] p_IinG=[{:.4}, {:.4}, {:.4}] v=[{:.4}, {:.4}, {:.4}] n_clones={} n_slam={}",
        timestamp,
        imu.q.x,
        imu.q.y,
        imu.q.z,
        imu.q.w,
        imu.p.x,
        imu.p.y,
        imu.p.z,
        imu.v.x,
        imu.v.y,
        imu.v.z,
        pipeline.state().n_clones(),
        pipeline.state().features_slam.len(),
    );
}
