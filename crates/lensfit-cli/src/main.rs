use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use lensfit_hw::V4l2Camera;
use std::path::PathBuf;
use std::time::Duration;

#[zbus::proxy(
    interface = "org.lensfit.Capture1",
    default_service = "org.lensfit.Capture1",
    default_path = "/org/lensfit/Capture1"
)]
trait Capture {
    fn start_camera(&self) -> zbus::Result<()>;
    fn stop_camera(&self) -> zbus::Result<()>;
    fn retake(&self) -> zbus::Result<()>;
    fn reset(&self) -> zbus::Result<()>;
    fn capture_now(&self) -> zbus::Result<()>;
    fn status(&self) -> zbus::Result<String>;
    fn captured_image(&self) -> zbus::Result<Vec<u8>>;
    fn analyze(&self) -> zbus::Result<String>;
}

const WATCH_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Parser)]
#[command(name = "lensfit", about = "Lensfit guided face capture CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Open the camera and start guided auto-capture
    Start,
    /// Stop auto-capture and release the camera
    Stop,
    /// Discard the captured photo and scan again
    Retake,
    /// Reset the capture session
    Reset,
    /// Capture immediately, skipping the countdown
    Capture,
    /// Show daemon status
    Status,
    /// Follow capture progress until a photo is taken
    Watch,
    /// Write the captured photo to a JPEG file
    Save {
        /// Output path
        path: PathBuf,
    },
    /// Submit the captured photo for face analysis
    Analyze,
    /// List video devices (bypasses the daemon)
    Devices,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Devices => list_devices(),
        command => run(command).await,
    }
}

async fn run(command: Commands) -> Result<()> {
    let conn = zbus::Connection::session()
        .await
        .context("failed to connect to the session bus")?;
    let proxy = CaptureProxy::new(&conn).await?;

    match command {
        Commands::Start => {
            proxy.start_camera().await.context("lensfitd: StartCamera")?;
            println!("Camera started; hold still inside the guide");
        }
        Commands::Stop => {
            proxy.stop_camera().await?;
            println!("Camera stopped");
        }
        Commands::Retake => {
            proxy.retake().await.context("lensfitd: Retake")?;
            println!("Photo discarded; scanning again");
        }
        Commands::Reset => {
            proxy.reset().await?;
            println!("Session reset");
        }
        Commands::Capture => {
            proxy.capture_now().await.context("lensfitd: CaptureNow")?;
            println!("Photo captured");
        }
        Commands::Status => {
            let status: serde_json::Value = serde_json::from_str(&proxy.status().await?)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Watch => watch(&proxy).await?,
        Commands::Save { path } => {
            let jpeg = proxy
                .captured_image()
                .await
                .context("lensfitd: CapturedImage")?;
            std::fs::write(&path, &jpeg)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("Saved {} bytes to {}", jpeg.len(), path.display());
        }
        Commands::Analyze => {
            println!("Analyzing photo...");
            let result: serde_json::Value =
                serde_json::from_str(&proxy.analyze().await.context("lensfitd: Analyze")?)?;
            let analysis = &result["analysis"];
            for key in ["gender", "skinColor", "faceShape"] {
                println!("  {key:<10} {}", analysis[key].as_str().unwrap_or("-"));
            }
        }
        Commands::Devices => list_devices()?,
    }

    Ok(())
}

/// Poll status and print each distinct state until capture or idle.
async fn watch(proxy: &CaptureProxy<'_>) -> Result<()> {
    let mut ticker = tokio::time::interval(WATCH_INTERVAL);
    let mut last = String::new();
    loop {
        ticker.tick().await;
        let status: serde_json::Value = serde_json::from_str(&proxy.status().await?)?;
        let state = &status["state"];
        let line = describe(state);
        if line != last {
            println!("{line}");
            tracing::debug!(%line, "state changed");
            last = line;
        }
        match state["phase"].as_str() {
            Some("captured") => return Ok(()),
            Some("idle") if !state["camera_active"].as_bool().unwrap_or(false) => return Ok(()),
            _ => {}
        }
    }
}

/// One-line summary of a session snapshot.
fn describe(state: &serde_json::Value) -> String {
    let phase = state["phase"].as_str().unwrap_or("unknown");
    let mut line = match phase {
        "countdown" => format!("countdown {}", state["countdown"]["remaining"]),
        other => other.replace('_', " "),
    };
    if state["countdown"]["cancelled"].as_bool() == Some(true) {
        line.push_str(" (countdown cancelled)");
    }
    if state["quality"]["no_face_hint"].as_bool() == Some(true) {
        line.push_str(" - no face detected");
    } else if state["quality"]["low_quality_warning"].as_bool() == Some(true) {
        line.push_str(" - move closer or improve lighting");
    }
    if let Some(err) = state["last_error"].as_str() {
        line.push_str(&format!(" [error: {err}]"));
    }
    line
}

fn list_devices() -> Result<()> {
    let devices = V4l2Camera::list_devices();
    if devices.is_empty() {
        println!("No video devices found");
        return Ok(());
    }
    for d in devices {
        println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
    }
    Ok(())
}
