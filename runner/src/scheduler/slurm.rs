use super::{
    command::{run, run_checked, shell_escape},
    BackendKind, JobFilter, Scheduler, SchedulerError,
};
use crate::{
    config::BackendConfig,
    ledger::JobId,
    model::{JobSpec, JobState},
};
use std::{
    collections::BTreeSet,
    ffi::OsString,
    fs, io,
    path::{Path, PathBuf},
    time::Duration,
};
use tracing::{debug, info, warn};

const OUTPUT_FILE: &str = "output.txt";

/// Batch script of the job, kept next to its working directory so it never ends up in the results
pub fn script_path(working_directory: &Path) -> PathBuf {
    working_directory.with_extension("sh")
}

/// Submits every job as a batch script to a slurm cluster
#[derive(Debug, Clone)]
pub struct SlurmScheduler {
    cluster: Option<String>,
    session: String,
    // runtime used for jobs with a container image
    container_runtime: String,
    sbatch_args: Vec<String>,
    timeout: Duration,
}

impl SlurmScheduler {
    pub fn new(config: &BackendConfig, session: &str, timeout: Duration) -> Self {
        Self {
            cluster: config.contact.clone().filter(|contact| !contact.is_empty()),
            session: session.to_owned(),
            container_runtime: config
                .parameter
                .get("container_runtime")
                .cloned()
                .unwrap_or_else(|| "apptainer".to_owned()),
            sbatch_args: config
                .parameter
                .get("sbatch_args")
                .map(|args| args.split_whitespace().map(String::from).collect())
                .unwrap_or_default(),
            timeout,
        }
    }

    fn cluster_args(&self) -> Vec<OsString> {
        match &self.cluster {
            Some(cluster) => vec![format!("--clusters={cluster}").into()],
            None => Vec::new(),
        }
    }

    /// Batch script running the job, every argument stays a single word
    pub fn script(&self, job: &JobSpec) -> Result<String, SchedulerError> {
        let mut words = Vec::new();

        if job.is_containerized() {
            let root = job.staging_root();
            let root = root.to_string_lossy();

            words.push(shell_escape(&self.container_runtime));
            words.push("exec".to_owned());
            words.push("--bind".to_owned());
            words.push(shell_escape(&format!("{root}:{root}")));
            words.push("--pwd".to_owned());
            words.push(shell_escape(&job.working_directory.to_string_lossy()));
            words.push(shell_escape(&format!("docker://{}", job.container)));
        } else if job.command.trim().is_empty() {
            return Err(SchedulerError::EmptyJob);
        }

        if !job.command.trim().is_empty() {
            words.push(shell_escape(&job.command));
        }
        words.extend(job.args.iter().map(|arg| shell_escape(arg)));

        Ok(format!(
            "#!/bin/sh\ncd {}\nexec {}\n",
            shell_escape(&job.working_directory.to_string_lossy()),
            words.join(" ")
        ))
    }

    /// Arguments of `sbatch` submitting `script` for the job
    pub fn sbatch_arguments(&self, job: &JobSpec, script: &Path) -> Vec<OsString> {
        let mut args = self.cluster_args();
        args.push("--parsable".into());
        args.push(format!("--job-name={}", self.session).into());
        args.extend(["--chdir".into(), job.working_directory.clone().into()]);
        args.extend([
            "--output".into(),
            job.working_directory.join(OUTPUT_FILE).into_os_string(),
        ]);
        args.extend(job.job_resources.split_whitespace().map(OsString::from));
        args.extend(self.sbatch_args.iter().map(OsString::from));
        args.push(script.as_os_str().to_owned());

        args
    }
}

impl Scheduler for SlurmScheduler {
    fn kind(&self) -> BackendKind {
        BackendKind::Slurm
    }

    fn submit(&self, job: &JobSpec) -> Result<JobId, SchedulerError> {
        let script = script_path(&job.working_directory);
        fs::write(&script, self.script(job)?)?;

        let output = run_checked("sbatch", &self.sbatch_arguments(job, &script), self.timeout)?;

        // --parsable prints `<id>[;<cluster>]`
        let id = output
            .lines()
            .last()
            .and_then(|line| line.split(';').next())
            .filter(|id| !id.is_empty())
            .map(String::from)
            .ok_or(SchedulerError::MissingJobId)?;
        info!(job = %id, "Submitted batch job");

        Ok(id)
    }

    fn list_live(&self, filter: &JobFilter) -> Result<BTreeSet<JobId>, SchedulerError> {
        let mut args = self.cluster_args();
        args.extend(["--noheader".into(), "--format=%i".into()]);

        if let Some(session) = &filter.session {
            args.push(format!("--name={session}").into());
        }

        let output = run_checked("squeue", &args, self.timeout)?;

        // listings across clusters are interleaved with `CLUSTER: <name>` lines
        Ok(output
            .lines()
            .filter(|line| !line.starts_with("CLUSTER"))
            .map(String::from)
            .collect())
    }

    fn state(&self, job: &str) -> Result<JobState, SchedulerError> {
        let mut args = self.cluster_args();
        args.extend([
            "--jobs".into(),
            job.into(),
            "--allocations".into(),
            "--noheader".into(),
            "--parsable2".into(),
            "--format=State".into(),
        ]);

        let output = run("sacct", &args, self.timeout)?;

        if !output.success {
            debug!(job = %job, stderr = %output.stderr.trim(), "sacct has no record of job");

            return Ok(JobState::Unknown);
        }

        let state = output
            .lines()
            .next()
            .map(parse_state)
            .unwrap_or(JobState::Unknown);

        Ok(state)
    }

    fn release(&self, job: &str, working_directory: &Path) -> Result<(), SchedulerError> {
        let script = script_path(working_directory);

        match fs::remove_file(&script) {
            Ok(()) => debug!(job = %job, script = ?script, "Removed batch script"),
            Err(error) if error.kind() == io::ErrorKind::NotFound => {}
            Err(error) => warn!(job = %job, error = ?error, "Failed to remove batch script"),
        }

        Ok(())
    }
}

/// Map a slurm job state as printed by `sacct`, e.g. `COMPLETED` or `CANCELLED by 0`
pub fn parse_state(state: &str) -> JobState {
    match state.split_whitespace().next().unwrap_or_default() {
        "PENDING" | "RUNNING" | "REQUEUED" | "RESIZING" | "SUSPENDED" | "CONFIGURING"
        | "COMPLETING" | "STAGE_OUT" | "SIGNALING" | "REQUEUE_HOLD" | "REQUEUE_FED" => {
            JobState::Running
        }
        "COMPLETED" => JobState::Done,
        "FAILED" | "CANCELLED" | "TIMEOUT" | "NODE_FAIL" | "OUT_OF_MEMORY" | "PREEMPTED"
        | "BOOT_FAIL" | "DEADLINE" | "REVOKED" => JobState::Failed,
        _ => JobState::Unknown,
    }
}
