use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;

#[zbus::proxy(
    interface = "org.facecheck.Daemon1",
    default_service = "org.facecheck.Daemon1",
    default_path = "/org/facecheck/Daemon1"
)]
trait Facecheck {
    async fn verify(&self, identity: &str) -> zbus::Result<String>;
    async fn enroll(&self, identity: &str) -> zbus::Result<String>;
    async fn cancel(&self) -> zbus::Result<bool>;
    async fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "facecheck", about = "facecheck attendance check-in CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify a face and record attendance
    Verify {
        /// Employee identity to verify against
        #[arg(short, long)]
        identity: String,
    },
    /// Enroll the four poses (front, left, right, up)
    Enroll {
        /// Employee identity to enroll
        #[arg(short, long)]
        identity: String,
    },
    /// Cancel the running session
    Cancel,
    /// Show daemon status
    Status,
    /// Run camera diagnostics directly, bypassing the daemon
    Test {
        /// V4L2 device to open
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        /// Write the captured still here
        #[arg(short, long)]
        save: Option<PathBuf>,
    },
}

/// One-line human summary of a session report.
fn summarize(report: &Value) -> String {
    let state = report["state"].as_str().unwrap_or("unknown");
    if let Some(error) = report["error"].as_str() {
        return format!("{state}: {error}");
    }
    if report["timedOut"].as_bool() == Some(true) {
        return "timed out".to_string();
    }
    match report["mode"].as_str() {
        Some("verification") if report["success"].as_bool() == Some(true) => {
            let who = report["displayName"]
                .as_str()
                .or_else(|| report["matchedId"].as_str())
                .unwrap_or("unknown");
            match report["confidence"].as_f64() {
                Some(c) => format!("verified: {who} (confidence {c:.2})"),
                None => format!("verified: {who}"),
            }
        }
        Some("enrollment") => {
            let poses: Vec<&str> = report["acceptedPoses"]
                .as_array()
                .map(|a| a.iter().filter_map(|p| p["pose"].as_str()).collect())
                .unwrap_or_default();
            format!("{state}: enrolled {}/4 poses [{}]", poses.len(), poses.join(", "))
        }
        _ => match report["message"].as_str() {
            Some(m) => format!("{state}: {m}"),
            None => state.to_string(),
        },
    }
}

async fn proxy() -> Result<FacecheckProxy<'static>> {
    let conn = zbus::connection::Builder::system()?
        .method_timeout(Duration::from_secs(180))
        .build()
        .await
        .context("connecting to the system bus")?;
    FacecheckProxy::new(&conn)
        .await
        .context("facecheckd is not reachable")
}

fn print_report(raw: &str) -> Result<bool> {
    let report: Value = serde_json::from_str(raw).context("malformed daemon reply")?;
    println!("{}", summarize(&report));
    tracing::debug!(report = %raw, "session report");
    Ok(report["success"].as_bool() == Some(true))
}

fn camera_test(device: &str, save: Option<PathBuf>) -> Result<()> {
    let devices = facecheck_hw::Camera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
    }
    for d in &devices {
        println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
    }

    let camera = facecheck_hw::Camera::open(device).with_context(|| format!("opening {device}"))?;
    println!(
        "Opened {device}: {}x{} {:?} ({:?})",
        camera.width,
        camera.height,
        camera.fourcc,
        camera.pixel_format()
    );

    let frame = camera.capture_lit_frame(10).context("capturing a lit frame")?;
    println!(
        "Captured frame #{}: brightness {:.1}, dark = {}",
        frame.sequence,
        frame.avg_brightness(),
        frame.is_dark
    );

    if let Some(path) = save {
        image::RgbImage::from_raw(frame.width, frame.height, frame.data)
            .context("frame buffer does not match its dimensions")?
            .save(&path)
            .with_context(|| format!("saving {}", path.display()))?;
        println!("Saved still to {}", path.display());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Verify { identity } => {
            println!("Look at the camera...");
            let ok = print_report(&proxy().await?.verify(&identity).await?)?;
            if !ok {
                std::process::exit(1);
            }
        }
        Commands::Enroll { identity } => {
            println!(
                "Enrolling {identity}: face the camera, then turn left, right and up when prompted"
            );
            let ok = print_report(&proxy().await?.enroll(&identity).await?)?;
            if !ok {
                std::process::exit(1);
            }
        }
        Commands::Cancel => {
            if proxy().await?.cancel().await? {
                println!("Session cancelled");
            } else {
                println!("No session running");
            }
        }
        Commands::Status => {
            let raw = proxy().await?.status().await?;
            let status: Value = serde_json::from_str(&raw).context("malformed daemon reply")?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Test { device, save } => {
            println!("Running camera diagnostics...");
            tokio::task::spawn_blocking(move || camera_test(&device, save)).await??;
        }
    }

    Ok(())
}
