use crate::scheduler::BackendKind;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, error, warn};

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Failed to read config file {0}: {1}")]
    ReadFailed(PathBuf, #[source] std::io::Error),
    #[error("Config file is not valid YAML")]
    InvalidYaml(#[from] serde_yaml::Error),
    #[error("Config failed preflight checks")]
    PreflightFailed,
    #[error("Failed to determine working directory")]
    WorkingDirectory(#[source] std::io::Error),
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct RunnerConfig {
    #[serde(default)]
    pub paths: PathConfig,
    #[serde(default)]
    pub tokens: TokenConfig,
    #[serde(default)]
    pub api: ApiConfig,
    // host label of an experiment -> backend that runs it
    #[serde(default = "default_backends")]
    pub backends: BTreeMap<String, BackendConfig>,
    // name of the job session, used to tag and filter jobs on the backend
    #[serde(default = "default_session")]
    pub session: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct PathConfig {
    #[serde(default = "default_outputs")]
    pub outputs: PathBuf,
    #[serde(default = "default_inputs")]
    pub inputs: PathBuf,
    #[serde(default = "default_templates")]
    pub templates: PathBuf,
    #[serde(default = "default_ledger")]
    pub ledger: PathBuf,
}

/// Reserved value prefixes rewritten by the compiler
#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct TokenConfig {
    #[serde(default = "default_experiment_token")]
    pub experiment_dir: String,
    // has to match what the queue service puts in front of uploaded files
    #[serde(default = "default_input_token")]
    pub input_dir: String,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct ApiConfig {
    #[serde(default = "default_api_url")]
    pub url: String,
    pub tunnel: Option<TunnelConfig>,
    #[serde(default = "default_api_timeout")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub retry: RetrySettings,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct TunnelConfig {
    // ssh login of the machine the queue service runs on, e.g. root@localhost
    pub ssh: String,
    // address of the queue service as seen from the ssh host
    #[serde(default = "default_remote")]
    pub remote: String,
    // 0 picks any free loopback port
    #[serde(default)]
    pub local_port: u16,
    pub identity: Option<PathBuf>,
    #[serde(default = "default_tunnel_ready")]
    pub ready_timeout_ms: u64,
    // path prefix of the experiment routes on the queue service
    #[serde(default = "default_api_prefix")]
    pub prefix: String,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct RetrySettings {
    // total attempts per call, 0 retries forever
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    pub kind: BackendKind,
    // attach to an existing scheduler (docker host, slurm cluster)
    pub contact: Option<String>,
    #[serde(default)]
    pub parameter: BTreeMap<String, String>,
}

/// Absolute filesystem layout derived from `PathConfig` and `TokenConfig`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Layout {
    pub outputs: PathBuf,
    pub inputs: PathBuf,
    pub templates: PathBuf,
    pub ledger: PathBuf,
    pub experiment_token: String,
    pub input_token: String,
}

impl Layout {
    pub fn output_dir(&self, id: i64) -> PathBuf {
        self.outputs.join(id.to_string())
    }

    pub fn input_dir(&self, id: i64) -> PathBuf {
        self.inputs.join(id.to_string())
    }
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            outputs: default_outputs(),
            inputs: default_inputs(),
            templates: default_templates(),
            ledger: default_ledger(),
        }
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            experiment_dir: default_experiment_token(),
            input_dir: default_input_token(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            url: default_api_url(),
            tunnel: None,
            timeout_ms: default_api_timeout(),
            retry: RetrySettings::default(),
        }
    }
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            paths: PathConfig::default(),
            tokens: TokenConfig::default(),
            api: ApiConfig::default(),
            backends: default_backends(),
            session: default_session(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl RunnerConfig {
    /// Read the config from `path`, a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self, ConfigErrors> {
        match fs::read_to_string(path) {
            Ok(content) => Self::from_yaml(&content),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = ?path, "No config file found, falling back to defaults");

                Ok(Self::default())
            }
            Err(error) => Err(ConfigErrors::ReadFailed(path.to_path_buf(), error)),
        }
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigErrors> {
        Ok(serde_yaml::from_str(content)?)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Resolve all configured directories against `base`
    pub fn layout(&self, base: &Path) -> Layout {
        let absolute = |path: &PathBuf| {
            if path.is_absolute() {
                path.clone()
            } else {
                base.join(path)
            }
        };

        Layout {
            outputs: absolute(&self.paths.outputs),
            inputs: absolute(&self.paths.inputs),
            templates: absolute(&self.paths.templates),
            ledger: absolute(&self.paths.ledger),
            experiment_token: self.tokens.experiment_dir.clone(),
            input_token: self.tokens.input_dir.clone(),
        }
    }

    /// Resolve all configured directories against the current working directory
    pub fn current_layout(&self) -> Result<Layout, ConfigErrors> {
        let base = std::env::current_dir().map_err(ConfigErrors::WorkingDirectory)?;

        Ok(self.layout(&base))
    }

    /// Returns true if any error was found, every problem is logged
    pub fn preflight_checks(&self) -> bool {
        // report every problem, not just the first one
        let mut contains_error = false;

        if self.tokens.experiment_dir.is_empty() || self.tokens.input_dir.is_empty() {
            error!("tokens.experiment_dir and tokens.input_dir must not be empty");
            contains_error = true;
        }

        if self.tokens.input_dir.starts_with(&self.tokens.experiment_dir)
            && !self.tokens.experiment_dir.is_empty()
        {
            warn!(
                "tokens.input_dir starts with tokens.experiment_dir, values with that prefix will always resolve to the output directory"
            );
        }

        if self.paths.outputs == self.paths.inputs {
            error!("paths.outputs and paths.inputs must be different directories");
            contains_error = true;
        }

        if !self.paths.templates.is_dir() {
            warn!(
                "paths.templates ({}) is not a directory, every submission will fail",
                self.paths.templates.to_string_lossy()
            );
        }

        if self.backends.is_empty() {
            error!("No backend was defined, unable to submit any experiment");
            contains_error = true;
        }

        if self.session.is_empty() {
            error!("session must not be empty, it is used to find the jobs of this runner");
            contains_error = true;
        }

        if self.poll_interval_ms == 0 {
            error!("poll_interval_ms cannot be 0");
            contains_error = true;
        }

        if let Some(tunnel) = &self.api.tunnel {
            if !tunnel.ssh.contains('@') {
                warn!(
                    "api.tunnel.ssh ({}) has no user, the local user name will be used",
                    tunnel.ssh
                );
            }
            if !tunnel.remote.contains(':') {
                error!("api.tunnel.remote ({}) must be host:port", tunnel.remote);
                contains_error = true;
            }
        } else if !self.api.url.starts_with("http://") && !self.api.url.starts_with("https://") {
            error!("api.url ({}) must be an http(s) url", self.api.url);
            contains_error = true;
        }

        let labels = self.backends.keys().sorted().join(", ");
        debug!("Configured backend labels: {labels}");

        contains_error
    }
}

fn default_outputs() -> PathBuf {
    PathBuf::from("outputs")
}

fn default_inputs() -> PathBuf {
    PathBuf::from("inputs")
}

fn default_templates() -> PathBuf {
    PathBuf::from("../IPP-Experiment_Defintions")
}

fn default_ledger() -> PathBuf {
    PathBuf::from("jobs.json")
}

fn default_experiment_token() -> String {
    "$experdir".to_owned()
}

fn default_input_token() -> String {
    "inputs".to_owned()
}

fn default_api_url() -> String {
    "http://localhost:5000/experiments".to_owned()
}

fn default_remote() -> String {
    "localhost:5000".to_owned()
}

fn default_api_prefix() -> String {
    "/experiments".to_owned()
}

fn default_api_timeout() -> u64 {
    60_000
}

fn default_tunnel_ready() -> u64 {
    5_000
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay() -> u64 {
    500
}

fn default_max_delay() -> u64 {
    30_000
}

fn default_session() -> String {
    "jobsession".to_owned()
}

fn default_poll_interval() -> u64 {
    5_000
}

// in reality both labels may run on the same machine, these are the labels the frontend offers
fn default_backends() -> BTreeMap<String, BackendConfig> {
    BTreeMap::from([
        (
            "localhost".to_owned(),
            BackendConfig {
                kind: BackendKind::Docker,
                contact: None,
                parameter: BTreeMap::new(),
            },
        ),
        (
            "cubic".to_owned(),
            BackendConfig {
                kind: BackendKind::Slurm,
                contact: None,
                parameter: BTreeMap::new(),
            },
        ),
    ])
}
