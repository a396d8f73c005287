//! Lifecycle of submitted experiments across process restarts.
//!
//! The submit phase turns pending experiments into backend jobs and records every job in the
//! ledger before the next experiment is processed. The reconcile phase compares the ledger with
//! the live jobs of each backend; a job that vanished from the listing is asked for its terminal
//! state, removed from the ledger and its results shipped to the queue service. Both phases only
//! share the ledger and can run in separate invocations.

use crate::{
    archive::{self, ArchiveError},
    compiler::{CompileError, Compiler},
    config::Layout,
    ledger::{JobId, Ledger, LedgerError},
    model::{Experiment, ExperimentId, JobSpec, JobState},
    remote::{Remote, RemoteError},
    scheduler::{Backends, JobFilter, Scheduler, SchedulerError, Schedulers},
    template::{TemplateError, TemplateStore},
};
use std::{
    collections::{BTreeMap, BTreeSet},
    fs, io,
    path::{Path, PathBuf},
    thread,
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("Failed to prepare {0}")]
    Io(PathBuf, #[source] io::Error),
    #[error("Job {0} is not tracked in the ledger")]
    NotTracked(JobId),
    #[error("Experiment {0} is already tracked as job {1}")]
    InFlight(ExperimentId, JobId),
}

impl TrackerError {
    /// Errors that will not go away by retrying the same experiment
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::Template(_)
                | Self::Compile(_)
                | Self::Scheduler(
                    SchedulerError::UnknownHost(_)
                        | SchedulerError::MissingImage
                        | SchedulerError::EmptyJob
                )
        )
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SubmitReport {
    pub submitted: Vec<(ExperimentId, JobId)>,
    // already tracked in the ledger
    pub skipped: Vec<ExperimentId>,
    pub failed: Vec<ExperimentId>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub completed: Vec<(JobId, ExperimentId, JobState)>,
    // still queued or running
    pub running: usize,
    // backend could not be asked, entries are kept
    pub unchecked: Vec<JobId>,
    // removed from the ledger, but shipping results failed
    pub failed: Vec<JobId>,
}

pub struct Tracker<R, S = Schedulers> {
    layout: Layout,
    templates: TemplateStore,
    ledger: Ledger,
    backends: Backends<S>,
    remote: R,
    filter: JobFilter,
    poll_interval: Duration,
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> TrackerError + '_ {
    move |error| TrackerError::Io(path.to_path_buf(), error)
}

/// Remove a directory tree, a missing tree is fine
fn remove_tree(path: &Path) {
    match fs::remove_dir_all(path) {
        Ok(()) => debug!(path = ?path, "Removed directory"),
        Err(error) if error.kind() == io::ErrorKind::NotFound => {}
        Err(error) => warn!(path = ?path, error = ?error, "Failed to remove directory"),
    }
}

impl<R: Remote, S: Scheduler> Tracker<R, S> {
    pub fn new(layout: Layout, ledger: Ledger, backends: Backends<S>, remote: R) -> Self {
        Self {
            templates: TemplateStore::new(&layout.templates),
            layout,
            ledger,
            backends,
            remote,
            filter: JobFilter::default(),
            poll_interval: Duration::from_secs(5),
        }
    }

    /// Only consider jobs of the named session when listing live jobs
    pub fn with_session(mut self, session: &str) -> Self {
        self.filter = JobFilter::session(session);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    pub fn backends(&self) -> &Backends<S> {
        &self.backends
    }

    /// Job id under which the experiment is tracked, if any
    pub fn job_of(&self, id: ExperimentId) -> Option<&JobId> {
        self.ledger
            .iter()
            .find(|(_, experiment)| experiment.id == id)
            .map(|(job, _)| job)
    }

    /// Submit every pending experiment, a failing experiment never stops the others
    #[instrument(skip(self), level = "info")]
    pub fn submit_pending(&mut self) -> Result<SubmitReport, TrackerError> {
        let queue = self.remote.queue()?;
        let mut report = SubmitReport::default();

        for experiment in queue {
            if let Some(job) = self.job_of(experiment.id) {
                info!(experiment = experiment.id, job = %job, "Experiment is already in flight, skipping");
                report.skipped.push(experiment.id);
                continue;
            }

            match self.submit(&experiment) {
                Ok(job) => report.submitted.push((experiment.id, job)),
                Err(error) => {
                    error!(experiment = experiment.id, error = %error, "Failed to submit experiment");

                    if error.is_permanent() {
                        if let Err(error) = self.remote.mark_failed(experiment.id, JobState::Failed)
                        {
                            warn!(experiment = experiment.id, error = %error, "Failed to report failure");
                        }
                    }

                    report.failed.push(experiment.id);
                }
            }
        }

        info!(
            "Submitted {} experiments, {} failed, {} skipped",
            report.submitted.len(),
            report.failed.len(),
            report.skipped.len()
        );

        Ok(report)
    }

    /// Stage, compile and submit one experiment, the job is in the ledger once this returns
    #[instrument(skip_all, fields(experiment = experiment.id, host = %experiment.host))]
    pub fn submit(&mut self, experiment: &Experiment) -> Result<JobId, TrackerError> {
        if let Some(job) = self.job_of(experiment.id) {
            return Err(TrackerError::InFlight(experiment.id, job.clone()));
        }

        let scheduler = self.backends.resolve(&experiment.host)?;
        let submitted = self
            .stage(experiment)
            .and_then(|spec| scheduler.submit(&spec).map_err(TrackerError::from));

        let job = match submitted {
            Ok(job) => job,
            Err(error) => {
                // nothing ran, both directories only hold what staging put there
                remove_tree(&self.layout.output_dir(experiment.id));
                remove_tree(&self.layout.input_dir(experiment.id));

                return Err(error);
            }
        };

        self.ledger.record(job.clone(), experiment.clone())?;
        info!(job = %job, "Recorded job");

        Ok(job)
    }

    /// Fetch inputs and compile the job, the working directory exists afterwards
    fn stage(&self, experiment: &Experiment) -> Result<JobSpec, TrackerError> {
        let template = self.templates.load(&experiment.app)?;
        let spec = Compiler::new(&self.layout).compile(experiment, &template)?;
        debug!(spec = ?spec, "Compiled job");

        fs::create_dir_all(&self.layout.inputs).map_err(io_error(&self.layout.inputs))?;
        let archive = self.layout.inputs.join(format!("{}.zip", experiment.id));
        self.remote.download_inputs(experiment.id, &archive)?;

        let unpacked = archive::unpack(&archive, &self.layout.input_dir(experiment.id));
        if let Err(error) = fs::remove_file(&archive) {
            warn!(archive = ?archive, error = ?error, "Failed to remove input archive");
        }
        unpacked?;

        fs::create_dir_all(&spec.working_directory).map_err(io_error(&spec.working_directory))?;

        Ok(spec)
    }

    /// Ship every job that vanished from the live listing of its backend
    #[instrument(skip(self), level = "info")]
    pub fn reconcile(&mut self) -> Result<ReconcileReport, TrackerError> {
        let mut report = ReconcileReport::default();

        let hosts = self
            .ledger
            .iter()
            .map(|(_, experiment)| experiment.host.clone())
            .collect::<BTreeSet<_>>();

        // a single listing per backend, `None` if it could not be listed
        let mut live: BTreeMap<String, Option<BTreeSet<JobId>>> = BTreeMap::new();
        for host in hosts {
            let listing = match self.backends.resolve(&host) {
                Ok(scheduler) => match scheduler.list_live(&self.filter) {
                    Ok(jobs) => Some(jobs),
                    Err(error) => {
                        error!(host = %host, error = %error, "Could not list live jobs");
                        None
                    }
                },
                Err(error) => {
                    error!(host = %host, error = %error, "Could not resolve backend");
                    None
                }
            };

            live.insert(host, listing);
        }

        let mut candidates = Vec::new();
        for (job, experiment) in self.ledger.iter() {
            match live.get(&experiment.host) {
                Some(Some(jobs)) if jobs.contains(job) => report.running += 1,
                Some(Some(_)) => candidates.push((job.clone(), experiment.clone())),
                _ => report.unchecked.push(job.clone()),
            }
        }

        for (job, experiment) in candidates {
            let state = self.terminal_state(&job, &experiment);

            if !state.is_terminal() {
                debug!(job = %job, "Job missing from listing but still running");
                report.running += 1;
                continue;
            }

            match self.complete(&job, &experiment, state) {
                Ok(()) => report.completed.push((job, experiment.id, state)),
                Err(error @ TrackerError::Ledger(_)) => return Err(error),
                Err(error) => {
                    error!(job = %job, experiment = experiment.id, error = %error, "Failed to ship results");
                    report.failed.push(job);
                }
            }
        }

        info!(
            "Reconciled {} jobs, {} still running, {} unchecked, {} failed",
            report.completed.len(),
            report.running,
            report.unchecked.len(),
            report.failed.len()
        );

        Ok(report)
    }

    /// Explicit state of a job that is missing from the listing, lost jobs are `Unknown`
    fn terminal_state(&self, job: &str, experiment: &Experiment) -> JobState {
        let state = self
            .backends
            .resolve(&experiment.host)
            .map_err(TrackerError::from)
            .and_then(|scheduler| scheduler.state(job).map_err(TrackerError::from));

        match state {
            Ok(state) => state,
            Err(error) => {
                warn!(job = %job, error = %error, "Failed to query job state, assuming it terminated");
                JobState::Unknown
            }
        }
    }

    /// Block until the job terminated, then ship it like a reconciliation would
    #[instrument(skip(self), level = "info")]
    pub fn wait_for(&mut self, job: &str) -> Result<JobState, TrackerError> {
        let experiment = self
            .ledger
            .get(job)
            .cloned()
            .ok_or_else(|| TrackerError::NotTracked(job.to_owned()))?;
        let scheduler = self.backends.resolve(&experiment.host)?;

        let state = loop {
            match scheduler.state(job)? {
                JobState::Running => {}
                // freshly submitted jobs may not be known to the accounting yet
                JobState::Unknown if scheduler.list_live(&self.filter)?.contains(job) => {}
                state => break state,
            }

            thread::sleep(self.poll_interval);
        };

        info!(job = %job, state = %state, "Job terminated");
        self.complete(job, &experiment, state)?;

        Ok(state)
    }

    /// Forget the job and hand its outcome to the queue service
    fn complete(
        &mut self,
        job: &str,
        experiment: &Experiment,
        state: JobState,
    ) -> Result<(), TrackerError> {
        let output_dir = self.layout.output_dir(experiment.id);

        if let Ok(scheduler) = self.backends.resolve(&experiment.host) {
            if let Err(error) = scheduler.release(job, &output_dir) {
                warn!(job = %job, error = %error, "Failed to release job on backend");
            }
        }

        self.ledger.forget(job)?;
        info!(job = %job, experiment = experiment.id, state = %state, "Job completed");

        let notified = if state == JobState::Failed {
            self.remote.mark_failed(experiment.id, state)
        } else {
            self.remote.delete_inputs(experiment.id)
        };
        if let Err(error) = &notified {
            warn!(job = %job, experiment = experiment.id, error = %error, "Failed to notify queue service, shipping results anyway");
        }

        // the ledger no longer knows the job, the outputs on disk are the only copy left
        if let Err(error) = self.upload_outputs(experiment.id, &output_dir) {
            error!(experiment = experiment.id, dir = ?output_dir, "Results were not shipped and are kept on disk");

            return Err(error);
        }

        remove_tree(&output_dir);
        remove_tree(&self.layout.input_dir(experiment.id));

        notified.map_err(TrackerError::from)
    }

    fn upload_outputs(&self, id: ExperimentId, output_dir: &Path) -> Result<(), TrackerError> {
        if !output_dir.is_dir() {
            warn!(experiment = id, dir = ?output_dir, "No outputs to upload");
            return Ok(());
        }

        let archive = self.layout.outputs.join(format!("{id}.zip"));
        let result = archive::pack(output_dir, &archive)
            .map_err(TrackerError::from)
            .and_then(|_| self.remote.upload_results(id, &archive).map_err(TrackerError::from));

        if let Err(error) = fs::remove_file(&archive) {
            debug!(archive = ?archive, error = ?error, "Failed to remove result archive");
        }

        result
    }
}
