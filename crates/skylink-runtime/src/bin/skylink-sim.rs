//! Skylink simulator
//!
//! Streams a synthetic swaying pose through a telemetry session and decodes
//! it at a ground station on the far side of the simulated link.
//!
//! Usage: `skylink-sim [config.json|-] [seconds]`
//!
//! `RUST_LOG` sets the filter, `SKYLINK_LOG_FORMAT=json` switches log lines
//! to JSON.

use std::time::Duration;

use skylink_core::{Keypoint, PoseFrame, POSE_LANDMARK_COUNT};
use skylink_runtime::{init_tracing, GroundStation, LogFormat, SkylinkConfig, TelemetrySession};
use tracing::{debug, info};

/// Camera rate offered to the session; the controller gates it down
const CAPTURE_INTERVAL: Duration = Duration::from_millis(33);

fn sway(step: u32) -> PoseFrame {
    let t = step as f32 * CAPTURE_INTERVAL.as_secs_f32();
    let offset = 0.05 * (t * 0.8).sin();
    PoseFrame::new(
        (0..POSE_LANDMARK_COUNT)
            .map(|i| {
                let row = i as f32 / POSE_LANDMARK_COUNT as f32;
                let x = 0.5 + offset * row + 0.1 * ((i % 3) as f32 - 1.0);
                Keypoint::new(x, 0.1 + 0.8 * row).with_confidence(0.9)
            })
            .collect(),
    )
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let format = std::env::var("SKYLINK_LOG_FORMAT")
        .ok()
        .map(|s| s.parse::<LogFormat>())
        .transpose()?
        .unwrap_or_default();
    init_tracing(format);

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) if path != "-" => SkylinkConfig::from_path(&path)?,
        _ => SkylinkConfig::default(),
    };
    let seconds: u64 = args.next().map(|s| s.parse()).transpose()?.unwrap_or(30);

    let mut session = TelemetrySession::start(config)?;
    let mut ground = GroundStation::new(session.link().clone());
    info!(seconds, "simulation running");

    let mut capture = tokio::time::interval(CAPTURE_INTERVAL);
    let mut report = tokio::time::interval(Duration::from_secs(1));
    let deadline = tokio::time::sleep(Duration::from_secs(seconds));
    tokio::pin!(deadline);

    let mut step = 0u32;
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            _ = capture.tick() => {
                session.process_frame(&sway(step));
                step = step.wrapping_add(1);
                while let Some(result) = ground.try_receive() {
                    if let Err(e) = result {
                        debug!(error = %e, "ground station skipped payload");
                    }
                }
            }
            _ = report.tick() => {
                let status = session.status();
                info!(
                    fps = %format!("{:.1}", status.fps),
                    quality = ?status.quality,
                    mode = %status.mode,
                    latency = %format!("{:.2}", status.link.average_latency),
                    bandwidth = status.link.bandwidth_estimate,
                    loss = %format!("{:.2}", status.link.packet_loss_rate),
                    decoded = ground.stats().keyframes + ground.stats().deltas,
                    "status"
                );
            }
        }
    }

    println!("{}", serde_json::to_string_pretty(&session.status())?);
    println!("{}", serde_json::to_string_pretty(ground.stats())?);
    session.shutdown().await;
    Ok(())
}
