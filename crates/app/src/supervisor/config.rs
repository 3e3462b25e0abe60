//! Configuration for the detector supervisor.
//!
//! Two sources feed this module: the deployment `config.json` that names the
//! detector network and video inputs, and CLI flags that tune the supervisor,
//! the stream emulator, and telemetry. Both are validated here so the rest of
//! the crate works with plain structs.

use std::{
    collections::HashMap,
    fs,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, anyhow, bail};
use clap::Args;
use detections::{REFERENCE_FRAME_SIZE, VideoSize};
use process_monitor::{MonitorConfig, RestartPolicy};
use serde::Deserialize;

const DEFAULT_EXECUTABLE: &str = "./uselib";
const LIBRARY_PATH_OVERRIDE: &str = "./";

/// Files making up one detector network.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct NetworkFiles {
    pub data: PathBuf,
    pub cfg: PathBuf,
    pub weights: PathBuf,
}

/// Video input arguments, either a single argument or an explicit list.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum VideoInputParams {
    Single(String),
    List(Vec<String>),
}

impl VideoInputParams {
    pub fn into_args(self) -> Vec<String> {
        match self {
            VideoInputParams::Single(arg) => vec![arg],
            VideoInputParams::List(args) => args,
        }
    }
}

/// Subset of the deployment `config.json` the supervisor reads. Unknown keys are ignored.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct DeploymentConfig {
    pub neural_network: String,
    pub neural_network_params: HashMap<String, NetworkFiles>,
    pub video_input: String,
    pub video_inputs_params: HashMap<String, VideoInputParams>,
    pub path_to_yolo_darknet: PathBuf,
    #[serde(default)]
    pub detector_executable: Option<String>,
}

impl DeploymentConfig {
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = fs::read(path)
            .with_context(|| format!("Failed to read deployment config {}", path.display()))?;
        serde_json::from_slice(&raw)
            .with_context(|| format!("Failed to parse deployment config {}", path.display()))
    }
}

/// Fully resolved invocation of the external detector.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessConfig {
    pub executable: String,
    pub network: NetworkFiles,
    pub extra_args: Vec<String>,
    pub working_dir: PathBuf,
    pub library_path: String,
}

impl ProcessConfig {
    /// Select the active network and video input. `video_params` overrides the configured input.
    pub fn select(deployment: &DeploymentConfig, video_params: Option<Vec<String>>) -> Result<Self> {
        let network = deployment
            .neural_network_params
            .get(&deployment.neural_network)
            .cloned()
            .ok_or_else(|| {
                anyhow!(
                    "Unknown neural network {:?} (known: {})",
                    deployment.neural_network,
                    known_keys(deployment.neural_network_params.keys())
                )
            })?;

        let extra_args = match video_params {
            Some(params) => params,
            None => deployment
                .video_inputs_params
                .get(&deployment.video_input)
                .cloned()
                .ok_or_else(|| {
                    anyhow!(
                        "Unknown video input {:?} (known: {})",
                        deployment.video_input,
                        known_keys(deployment.video_inputs_params.keys())
                    )
                })?
                .into_args(),
        };

        Ok(Self {
            executable: deployment
                .detector_executable
                .clone()
                .unwrap_or_else(|| DEFAULT_EXECUTABLE.to_string()),
            network,
            extra_args,
            working_dir: deployment.path_to_yolo_darknet.clone(),
            library_path: LIBRARY_PATH_OVERRIDE.to_string(),
        })
    }

    /// `[executable, data, cfg, weights, video args...]`
    pub fn command_line(&self) -> Vec<String> {
        let mut line = vec![
            self.executable.clone(),
            self.network.data.display().to_string(),
            self.network.cfg.display().to_string(),
            self.network.weights.display().to_string(),
        ];
        line.extend(self.extra_args.iter().cloned());
        line
    }

    /// Monitor settings: fixed working directory, library path override, whole-tree kill.
    pub fn monitor_config(&self, restart: RestartPolicy) -> Result<MonitorConfig> {
        let mut line = self.command_line();
        // Relative programs are resolved against the detector directory, not our cwd.
        if is_relative_path(&line[0]) {
            line[0] = self.working_dir.join(&line[0]).display().to_string();
        }
        Ok(MonitorConfig::new(line)?
            .with_working_dir(&self.working_dir)
            .with_env("LD_LIBRARY_PATH", &self.library_path)
            .with_restart_policy(restart))
    }
}

fn is_relative_path(program: &str) -> bool {
    let path = Path::new(program);
    path.is_relative() && path.components().count() > 1
}

fn known_keys<'a>(keys: impl Iterator<Item = &'a String>) -> String {
    let mut keys: Vec<_> = keys.map(String::as_str).collect();
    keys.sort_unstable();
    keys.join(", ")
}

/// Inclusive range of prerecorded frame indices the emulator loops over.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameWindow {
    pub first: u32,
    pub last: u32,
}

impl FrameWindow {
    /// Number of frames in the window; zero when `first > last`.
    pub fn len(&self) -> u64 {
        (u64::from(self.last) + 1).saturating_sub(u64::from(self.first))
    }

    pub fn indices(&self) -> impl Iterator<Item = u32> {
        self.first..=self.last
    }
}

/// Stream emulator settings used in simulation mode.
#[derive(Clone, Debug)]
pub struct EmulatorSettings {
    pub bind_host: IpAddr,
    pub image_port: u16,
    pub metadata_port: u16,
    pub frames_dir: PathBuf,
    pub detections_path: PathBuf,
    pub window: FrameWindow,
    pub frame_size: VideoSize,
    pub tick_interval: Duration,
    /// Delay emulating the detector's hardware initialisation.
    pub startup_delay: Duration,
    /// Read the whole frame window into memory at initialisation.
    pub preload_frames: bool,
}

impl Default for EmulatorSettings {
    fn default() -> Self {
        Self {
            bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            image_port: 8090,
            metadata_port: 8070,
            frames_dir: PathBuf::from("static/placeholder/frames"),
            detections_path: PathBuf::from("static/placeholder/alexeydetections30FPS.json"),
            window: FrameWindow {
                first: 16,
                last: 451,
            },
            frame_size: REFERENCE_FRAME_SIZE,
            tick_interval: Duration::from_millis(34),
            startup_delay: Duration::from_secs(5),
            preload_frames: false,
        }
    }
}

/// Settings the supervisor needs for either mode.
#[derive(Clone, Debug)]
pub struct SupervisorSettings {
    pub config_path: PathBuf,
    pub restart: RestartPolicy,
    pub emulator: EmulatorSettings,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("config.json"),
            restart: RestartPolicy::default(),
            emulator: EmulatorSettings::default(),
        }
    }
}

#[derive(Clone, Debug, Default)]
/// Optional telemetry knobs.
pub struct TelemetryOptions {
    /// Write a Chrome trace JSON file capturing supervisor spans.
    pub chrome_trace_path: Option<PathBuf>,
}

/// Canonical configuration of one `serve` run.
#[derive(Clone, Debug)]
pub struct ServeConfig {
    pub simulation: bool,
    pub video_params: Option<Vec<String>>,
    pub control_addr: SocketAddr,
    pub settings: SupervisorSettings,
    pub telemetry: TelemetryOptions,
}

/// CLI arguments accepted by the `serve` subcommand.
#[derive(Debug, Args)]
pub struct ServeCliArgs {
    /// Serve prerecorded frames and detections instead of running the detector.
    #[arg(long = "simulation", action = clap::ArgAction::SetTrue)]
    pub simulation: bool,
    /// Deployment config naming the network and video inputs.
    #[arg(long = "config", value_name = "PATH", default_value = "config.json")]
    pub config: PathBuf,
    /// Video input argument passed to the detector (repeatable, overrides the config).
    #[arg(long = "video-param", value_name = "ARG", allow_hyphen_values = true)]
    pub video_params: Vec<String>,
    /// Maximum automatic restarts of the detector (unlimited when omitted).
    #[arg(long = "max-restarts", value_name = "N")]
    pub max_restarts: Option<u32>,
    /// Pause between a detector exit and its restart.
    #[arg(long = "restart-backoff-ms", value_name = "MS", default_value_t = 1_000)]
    pub restart_backoff_ms: u64,
    /// Address of the control API.
    #[arg(long = "control-addr", value_name = "ADDR", default_value = "0.0.0.0:8080")]
    pub control_addr: SocketAddr,
    /// Interface the emulator endpoints bind to.
    #[arg(long = "bind-host", value_name = "IP", default_value = "0.0.0.0")]
    pub bind_host: IpAddr,
    /// MJPEG endpoint port (simulation).
    #[arg(long = "image-port", value_name = "PORT", default_value_t = 8090)]
    pub image_port: u16,
    /// JSON stream endpoint port (simulation).
    #[arg(long = "metadata-port", value_name = "PORT", default_value_t = 8070)]
    pub metadata_port: u16,
    /// Directory holding `NNN.jpg` frames.
    #[arg(long = "frames-dir", value_name = "DIR", default_value = "static/placeholder/frames")]
    pub frames_dir: PathBuf,
    /// Prerecorded detections (JSON array keyed by `frame_id`).
    #[arg(
        long = "detections",
        value_name = "PATH",
        default_value = "static/placeholder/alexeydetections30FPS.json"
    )]
    pub detections: PathBuf,
    /// First frame index of the loop.
    #[arg(long = "first-frame", value_name = "N", default_value_t = 16)]
    pub first_frame: u32,
    /// Last frame index of the loop.
    #[arg(long = "last-frame", value_name = "N", default_value_t = 451)]
    pub last_frame: u32,
    /// Emulator tick interval.
    #[arg(long = "tick-ms", value_name = "MS", default_value_t = 34)]
    pub tick_ms: u64,
    /// Simulated detector startup latency.
    #[arg(long = "startup-delay-ms", value_name = "MS", default_value_t = 5_000)]
    pub startup_delay_ms: u64,
    /// Load all frames into memory up front.
    #[arg(long = "preload-frames", action = clap::ArgAction::SetTrue)]
    pub preload_frames: bool,
    /// Emit Chrome trace JSON for post-mortem analysis.
    #[arg(long = "chrome-trace", value_name = "PATH")]
    pub chrome_trace: Option<PathBuf>,
}

impl TryFrom<ServeCliArgs> for ServeConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeCliArgs) -> Result<Self> {
        if args.first_frame > args.last_frame {
            bail!(
                "--first-frame ({}) must not exceed --last-frame ({})",
                args.first_frame,
                args.last_frame
            );
        }
        if args.tick_ms == 0 {
            bail!("--tick-ms must be at least 1");
        }
        if args.image_port != 0 && args.image_port == args.metadata_port {
            bail!("--image-port and --metadata-port must differ");
        }

        let video_params = if args.video_params.is_empty() {
            None
        } else {
            Some(args.video_params)
        };

        let emulator = EmulatorSettings {
            bind_host: args.bind_host,
            image_port: args.image_port,
            metadata_port: args.metadata_port,
            frames_dir: args.frames_dir,
            detections_path: args.detections,
            window: FrameWindow {
                first: args.first_frame,
                last: args.last_frame,
            },
            frame_size: REFERENCE_FRAME_SIZE,
            tick_interval: Duration::from_millis(args.tick_ms),
            startup_delay: Duration::from_millis(args.startup_delay_ms),
            preload_frames: args.preload_frames,
        };

        Ok(Self {
            simulation: args.simulation,
            video_params,
            control_addr: args.control_addr,
            settings: SupervisorSettings {
                config_path: args.config,
                restart: RestartPolicy {
                    max_restarts: args.max_restarts,
                    backoff: Duration::from_millis(args.restart_backoff_ms),
                },
                emulator,
            },
            telemetry: TelemetryOptions {
                chrome_trace_path: args.chrome_trace,
            },
        })
    }
}
