//! cam-session binary for exploring cameras from the command line.
//!
//! ## Usage
//!
//! ```bash
//! # List simulated cameras
//! cam-session list
//!
//! # Show every feature of one camera
//! cam-session features sim-0
//!
//! # Stream 30 frames after changing features
//! cam-session stream sim-0 --frames 30 --set Width=320 --set PixelFormat=RGB8
//!
//! # Use V4L2 nodes instead (built with --features v4l2)
//! cam-session --v4l2 list
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use crossbeam::channel;
use tracing::{info, warn};

use cam_session::chunk::chunk_data_access;
use cam_session::validation::validate_frame_sequence;
use cam_session::{
    AccessMode, DeviceHandle, FeatureAccess, FeatureDescriptor, FeatureKind, FrameInfo, Streamer,
    System, SystemConfig,
};

#[derive(Parser)]
#[command(name = "cam-session", version, about = "Camera feature access and capture")]
struct Cli {
    /// TOML configuration with simulated camera profiles
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Use V4L2 devices instead of the simulator
    #[cfg(feature = "v4l2")]
    #[arg(long, global = true)]
    v4l2: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List reachable cameras
    List,
    /// Show features and current values of a camera
    Features {
        /// Camera id
        id: String,
    },
    /// Stream frames and report their metadata
    Stream {
        /// Camera id
        id: String,
        /// Frames to capture before stopping
        #[arg(long, default_value_t = 10)]
        frames: usize,
        /// Buffers in the capture ring
        #[arg(long, default_value_t = 3)]
        buffers: usize,
        /// Feature writes applied before streaming, as NAME=VALUE
        #[arg(long = "set", value_name = "NAME=VALUE")]
        writes: Vec<String>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("cam_session=info")),
        )
        .init();

    let cli = Cli::parse();
    let system = Arc::new(start_system(&cli)?);
    info!(version = %system.version(), "cam-session starting");

    let outcome = match cli.command {
        Command::List => list(&system),
        Command::Features { id } => features(&system, &id),
        Command::Stream {
            id,
            frames,
            buffers,
            writes,
        } => stream(&system, &id, frames, buffers, &writes),
    };
    system.shutdown();
    outcome
}

fn start_system(cli: &Cli) -> Result<System> {
    let config = SystemConfig::load(cli.config.as_deref()).context("loading configuration")?;

    #[cfg(feature = "v4l2")]
    if cli.v4l2 {
        let transport = Arc::new(cam_session::V4l2Transport::new());
        return System::startup(transport, &config).context("starting V4L2 transport");
    }

    System::simulated(&config).context("starting simulator")
}

fn list(system: &System) -> Result<()> {
    let cameras = system.cameras()?;
    if cameras.is_empty() {
        println!("No cameras found");
    }
    for camera in cameras {
        println!("{}", camera.id);
        println!("  Name:   {}", camera.name);
        println!("  Model:  {}", camera.model);
        println!("  Serial: {}", camera.serial);
    }
    Ok(())
}

fn features(system: &System, id: &str) -> Result<()> {
    let handle = system
        .open(id, AccessMode::Read)
        .with_context(|| format!("opening {id}"))?;

    let mut category = String::new();
    for descriptor in system.features_list(handle)? {
        if descriptor.category != category {
            category.clone_from(&descriptor.category);
            println!("{category}");
        }
        let value = describe_value(system, handle, &descriptor)
            .unwrap_or_else(|err| format!("<{err}>"));
        let access = match (descriptor.readable, descriptor.writeable) {
            (true, true) => "RW",
            (true, false) => "RO",
            (false, true) => "WO",
            (false, false) => "--",
        };
        println!("  {:<24} {access} {value}", descriptor.name);
    }

    system.close(handle)?;
    Ok(())
}

fn describe_value(
    system: &System,
    handle: DeviceHandle,
    descriptor: &FeatureDescriptor,
) -> cam_session::Result<String> {
    let name = descriptor.name.as_str();
    if !descriptor.readable {
        return Ok("<write-only>".to_owned());
    }
    Ok(match descriptor.kind() {
        FeatureKind::Integer => {
            let (min, max) = system.int_range(handle, name)?;
            format!("{} [{min}..{max}]", system.int_get(handle, name)?)
        }
        FeatureKind::Float => {
            let (min, max) = system.float_range(handle, name)?;
            format!("{} [{min}..{max}]", system.float_get(handle, name)?)
        }
        FeatureKind::Enum => format!(
            "{} {{{}}}",
            system.enum_get(handle, name)?,
            system.enum_range(handle, name)?.join(", ")
        ),
        FeatureKind::String => format!("{:?}", system.string_get(handle, name)?),
        FeatureKind::Boolean => system.bool_get(handle, name)?.to_string(),
        FeatureKind::Command => "<command>".to_owned(),
        FeatureKind::Raw => format!("<{} bytes>", system.raw_length(handle, name)?),
    })
}

fn apply_write(system: &System, handle: DeviceHandle, write: &str) -> Result<()> {
    let Some((name, value)) = write.split_once('=') else {
        bail!("expected NAME=VALUE, got {write}");
    };
    let descriptor = system.feature_info(handle, name)?;
    match descriptor.kind() {
        FeatureKind::Integer => system.int_set(handle, name, value.parse()?)?,
        FeatureKind::Float => system.float_set(handle, name, value.parse()?)?,
        FeatureKind::Enum => system.enum_set(handle, name, value)?,
        FeatureKind::String => system.string_set(handle, name, value)?,
        FeatureKind::Boolean => system.bool_set(handle, name, value.parse()?)?,
        FeatureKind::Command => system.command_run(handle, name)?,
        FeatureKind::Raw => bail!("{name} is a raw feature and cannot be set from the command line"),
    }
    info!(%name, %value, "feature written");
    Ok(())
}

fn stream(
    system: &Arc<System>,
    id: &str,
    frames: usize,
    buffers: usize,
    writes: &[String],
) -> Result<()> {
    let handle = system
        .open(id, AccessMode::Full)
        .with_context(|| format!("opening {id}"))?;
    for write in writes {
        apply_write(system, handle, write)?;
    }

    let (tx, rx) = channel::bounded::<(FrameInfo, Option<u64>)>(buffers.max(1) * 2);
    let mut streamer = Streamer::new(Arc::clone(system), handle);
    streamer.start(buffers, move |buffer| {
        let chunk_frame_id = chunk_data_access(buffer, |chunks| chunks.frame_id()).ok();
        let _ = tx.try_send((buffer.info(), chunk_frame_id));
    })?;

    let mut received = Vec::with_capacity(frames);
    while received.len() < frames {
        let Ok((info, chunk_frame_id)) = rx.recv_timeout(Duration::from_secs(5)) else {
            warn!(received = received.len(), "no frame within 5s, stopping");
            break;
        };
        println!(
            "Frame {}: {:?} {} bytes {}x{} {} at {:?}{}",
            info.frame_id,
            info.status,
            info.received_size,
            info.width,
            info.height,
            info.pixel_format,
            info.timestamp,
            chunk_frame_id.map_or_else(String::new, |id| format!(" (chunk id {id})")),
        );
        received.push(info);
    }

    streamer.stop()?;
    system.close(handle)?;

    if let Err(err) = validate_frame_sequence(&received) {
        warn!(error = %err, "frames were dropped");
    }
    Ok(())
}
