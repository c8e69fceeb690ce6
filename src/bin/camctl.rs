//! camctl - operator CLI for camera sources, events and manual triggers

use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;

use modetect::{
    CameraStore, Clock, EventPeriod, NewCameraSource, SqliteCameraStore, SystemClock,
};

#[derive(Parser, Debug)]
#[command(name = "camctl", author, version, about = "Manage cameras and browse motion events")]
struct Args {
    /// Path to the modetect database.
    #[arg(long, env = "MODETECT_DB_PATH", default_value = "modetect.db", global = true)]
    db_path: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register a camera source
    Add {
        #[arg(long)]
        name: String,
        /// Still-image URL (http or https).
        #[arg(long)]
        url: String,
        #[arg(long)]
        user: Option<String>,
        #[arg(long, env = "MODETECT_CAMERA_PASSWORD", hide_env_values = true)]
        password: Option<String>,
        #[arg(long, default_value_t = 1)]
        poll_max_fps: u32,
        #[arg(long, default_value_t = 10)]
        alert_max_fps: u32,
        /// Seconds without motion before an event closes.
        #[arg(long, default_value_t = 2.0)]
        close_delay: f64,
        /// Register without starting to poll.
        #[arg(long)]
        disabled: bool,
    },

    /// List camera sources
    List {
        #[arg(long)]
        all: bool,
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },

    /// Resume polling a camera
    Enable {
        #[arg(long)]
        camera: i64,
    },

    /// Pause polling a camera
    Disable {
        #[arg(long)]
        camera: i64,
    },

    /// Soft-delete a camera
    Delete {
        #[arg(long)]
        camera: i64,
    },

    /// List events for a camera
    Events {
        #[arg(long)]
        camera: i64,
        /// today|yesterday|week|month|all
        #[arg(long, default_value = "today")]
        period: EventPeriod,
    },

    /// List frames of an event
    Frames {
        #[arg(long)]
        event: i64,
    },

    /// Ask the daemon to open an event on the next frame
    Trigger {
        #[arg(long)]
        camera: i64,
        #[arg(long, env = "MODETECT_API_ADDR", default_value = "127.0.0.1:8798")]
        api_addr: String,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let clock = SystemClock;

    if let Command::Trigger { camera, api_addr } = &args.command {
        return trigger(api_addr, *camera);
    }

    let store = SqliteCameraStore::open(&args.db_path)?;
    match args.command {
        Command::Add {
            name,
            url,
            user,
            password,
            poll_max_fps,
            alert_max_fps,
            close_delay,
            disabled,
        } => {
            let source = NewCameraSource {
                auth_user: user,
                auth_pass: password,
                poll_max_fps,
                alert_max_fps,
                event_close_delay: close_delay,
                enabled: !disabled,
                ..NewCameraSource::new(name, url)
            };
            source.validate()?;
            let id = store.insert_source(&source, clock.now_ms())?;
            print_json(&store.get_source(id)?)?;
        }
        Command::List { all, limit } => {
            print_json(&store.list_sources(all, limit)?)?;
        }
        Command::Enable { camera } => {
            require_camera(&store, camera)?;
            store.set_source_enabled(camera, true, clock.now_ms())?;
            eprintln!("camera {} enabled; the watchdog starts polling within one sweep", camera);
        }
        Command::Disable { camera } => {
            require_camera(&store, camera)?;
            store.set_source_enabled(camera, false, clock.now_ms())?;
            eprintln!("camera {} disabled", camera);
        }
        Command::Delete { camera } => {
            require_camera(&store, camera)?;
            store.mark_source_deleted(camera, clock.now_ms())?;
            eprintln!("camera {} deleted", camera);
        }
        Command::Events { camera, period } => {
            require_camera(&store, camera)?;
            let range = period.range(clock.now_ms())?;
            print_json(&store.events_for_camera(camera, range)?)?;
        }
        Command::Frames { event } => {
            if store.get_event(event)?.is_none() {
                return Err(anyhow!("event {} not found", event));
            }
            print_json(&store.frames_for_event(event)?)?;
        }
        Command::Trigger { .. } => {}
    }
    Ok(())
}

fn require_camera(store: &SqliteCameraStore, camera: i64) -> Result<()> {
    match store.get_source(camera)? {
        Some(source) if !source.deleted => Ok(()),
        _ => Err(anyhow!("camera {} not found", camera)),
    }
}

fn trigger(api_addr: &str, camera: i64) -> Result<()> {
    let url = format!("http://{}/camera/trigger?camera={}", api_addr, camera);
    match ureq::post(&url).call() {
        Ok(response) => {
            let body = response.into_string()?;
            println!("{}", body);
            Ok(())
        }
        Err(ureq::Error::Status(404, _)) => Err(anyhow!("camera {} not found", camera)),
        Err(ureq::Error::Status(code, _)) => Err(anyhow!("trigger rejected with status {}", code)),
        Err(err) => Err(anyhow!("daemon unreachable at {}: {}", api_addr, err)),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
