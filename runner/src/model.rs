use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, path::PathBuf};

pub type ExperimentId = i64;

/// A unit of work requested against a named application, as handed out by the queue service.
///
/// The queue service and ledgers written by older runners use capitalised keys, both spellings
/// are accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Experiment {
    #[serde(alias = "Id")]
    pub id: ExperimentId,
    #[serde(alias = "App")]
    pub app: String,
    // logical backend label (e.g. "localhost", "cubic"), not a hostname
    #[serde(alias = "Host")]
    pub host: String,
    #[serde(alias = "User", default)]
    pub user: i64,
    #[serde(alias = "Params", default)]
    pub params: BTreeMap<String, String>,
}

/// Declarative description of how to turn parameter values into a command line
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppTemplate {
    #[serde(alias = "Executable", default)]
    pub executable: String,
    // parameter key -> flag prefix
    #[serde(alias = "Params", default)]
    pub params: BTreeMap<String, String>,
    // parameter key -> switch emitted regardless of the value
    #[serde(alias = "Binopts", default)]
    pub binopts: BTreeMap<String, String>,
    #[serde(alias = "Defaults", default)]
    pub defaults: BTreeMap<String, String>,
    // native resource request handed to cluster schedulers
    #[serde(alias = "SGEJobResources", default)]
    pub job_resources: String,
    #[serde(alias = "Container", default)]
    pub container: String,
}

/// Backend-ready job description compiled from an experiment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Empty when the container entry point supplies the executable
    pub command: String,
    pub args: Vec<String>,
    pub container: String,
    pub working_directory: PathBuf,
    pub job_resources: String,
}

impl JobSpec {
    pub fn is_containerized(&self) -> bool {
        !self.container.is_empty()
    }

    /// Staging root shared by all experiments, i.e. the parent of both `inputs/` and `outputs/`
    pub fn staging_root(&self) -> PathBuf {
        self.working_directory
            .parent()
            .and_then(|outputs| outputs.parent())
            .map(PathBuf::from)
            .unwrap_or_else(|| self.working_directory.clone())
    }
}

/// Observable state of a submitted job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Running,
    Done,
    Failed,
    /// The backend has no record of the job anymore
    Unknown,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "Running",
            Self::Done => "Done",
            Self::Failed => "Failed",
            Self::Unknown => "Undetermined",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
