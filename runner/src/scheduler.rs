pub mod command;
mod docker;
mod slurm;


use crate::{
    config::{BackendConfig, RunnerConfig},
    ledger::JobId,
    model::{JobSpec, JobState},
};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, info};

pub use docker::DockerScheduler;
pub use slurm::SlurmScheduler;

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Failed to run {0}")]
    Spawn(String, #[source] std::io::Error),
    #[error("{0} did not finish within {1:?}")]
    Timeout(String, Duration),
    #[error("{program} exited with {code:?}: {stderr}")]
    CommandFailed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },
    #[error("Backend returned no job id")]
    MissingJobId,
    #[error("Container backend requires a container image")]
    MissingImage,
    #[error("Job has neither a command nor a container")]
    EmptyJob,
    #[error("No backend configured for host {0:?}")]
    UnknownHost(String),
    #[error("Failed to prepare job files")]
    Io(#[from] std::io::Error),
}

/// Execution backend families
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// containers on a (possibly remote) docker engine
    Docker,
    /// batch jobs on a slurm cluster
    Slurm,
}

/// Narrows the live listing of a backend, `None` lists every job visible to the user
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub session: Option<String>,
}

impl JobFilter {
    pub fn session(name: impl Into<String>) -> Self {
        Self {
            session: Some(name.into()),
        }
    }
}

/// Uniform capability of an execution backend
pub trait Scheduler {
    fn kind(&self) -> BackendKind;

    /// Submit the job and return the backend assigned job id
    fn submit(&self, job: &JobSpec) -> Result<JobId, SchedulerError>;

    /// Ids of all jobs the backend still considers queued or running
    fn list_live(&self, filter: &JobFilter) -> Result<BTreeSet<JobId>, SchedulerError>;

    fn state(&self, job: &str) -> Result<JobState, SchedulerError>;

    /// Collect what the backend kept about a terminated job into its working directory and free it
    fn release(&self, _job: &str, _working_directory: &Path) -> Result<(), SchedulerError> {
        Ok(())
    }
}

/// All supported backends, dispatched statically
#[derive(Debug, Clone)]
pub enum Schedulers {
    Docker(DockerScheduler),
    Slurm(SlurmScheduler),
}

fn command_timeout(config: &BackendConfig) -> Duration {
    config
        .parameter
        .get("timeout_ms")
        .and_then(|value| value.parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_COMMAND_TIMEOUT)
}

impl Schedulers {
    pub fn load(config: &BackendConfig, session: &str) -> Self {
        let timeout = command_timeout(config);

        match config.kind {
            BackendKind::Docker => Self::Docker(DockerScheduler::new(config, session, timeout)),
            BackendKind::Slurm => Self::Slurm(SlurmScheduler::new(config, session, timeout)),
        }
    }
}

impl Scheduler for Schedulers {
    fn kind(&self) -> BackendKind {
        match self {
            Self::Docker(_) => BackendKind::Docker,
            Self::Slurm(_) => BackendKind::Slurm,
        }
    }

    fn submit(&self, job: &JobSpec) -> Result<JobId, SchedulerError> {
        match self {
            Self::Docker(scheduler) => scheduler.submit(job),
            Self::Slurm(scheduler) => scheduler.submit(job),
        }
    }

    fn list_live(&self, filter: &JobFilter) -> Result<BTreeSet<JobId>, SchedulerError> {
        match self {
            Self::Docker(scheduler) => scheduler.list_live(filter),
            Self::Slurm(scheduler) => scheduler.list_live(filter),
        }
    }

    fn state(&self, job: &str) -> Result<JobState, SchedulerError> {
        match self {
            Self::Docker(scheduler) => scheduler.state(job),
            Self::Slurm(scheduler) => scheduler.state(job),
        }
    }

    fn release(&self, job: &str, working_directory: &Path) -> Result<(), SchedulerError> {
        match self {
            Self::Docker(scheduler) => scheduler.release(job, working_directory),
            Self::Slurm(scheduler) => scheduler.release(job, working_directory),
        }
    }
}

/// Resolves the host label of an experiment to the backend that runs it
#[derive(Debug)]
pub struct Backends<S = Schedulers> {
    by_label: BTreeMap<String, S>,
    // forces a single backend for every label
    forced: Option<S>,
}

impl Backends<Schedulers> {
    /// Build all configured backends, `forced` replaces them with a single one
    pub fn load(config: &RunnerConfig, forced: Option<BackendConfig>) -> Self {
        let forced = forced.map(|backend| {
            info!(kind = ?backend.kind, contact = ?backend.contact, "Using a single backend for every host");

            Schedulers::load(&backend, &config.session)
        });

        let by_label = config
            .backends
            .iter()
            .map(|(label, backend)| {
                debug!(label = %label, kind = ?backend.kind, "Registered backend");

                (label.clone(), Schedulers::load(backend, &config.session))
            })
            .collect();

        Self { by_label, forced }
    }
}

impl<S: Scheduler> Backends<S> {
    pub fn new(by_label: BTreeMap<String, S>, forced: Option<S>) -> Self {
        Self { by_label, forced }
    }

    pub fn resolve(&self, host: &str) -> Result<&S, SchedulerError> {
        self.forced
            .as_ref()
            .or_else(|| self.by_label.get(host))
            .ok_or_else(|| SchedulerError::UnknownHost(host.to_owned()))
    }
}
