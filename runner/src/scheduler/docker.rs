use super::{
    command::{run, run_checked},
    BackendKind, JobFilter, Scheduler, SchedulerError,
};
use crate::{
    config::BackendConfig,
    ledger::JobId,
    model::{JobSpec, JobState},
};
use std::{collections::BTreeSet, ffi::OsString, fs, path::Path, time::Duration};
use tracing::{debug, info, warn};

const SESSION_LABEL: &str = "ipp-runner.session";
const OUTPUT_FILE: &str = "output.txt";

/// Runs every job as a detached container on a docker engine
#[derive(Debug, Clone)]
pub struct DockerScheduler {
    program: String,
    host: Option<String>,
    session: String,
    // extra `docker run` arguments, e.g. resource limits
    run_args: Vec<String>,
    timeout: Duration,
}

impl DockerScheduler {
    pub fn new(config: &BackendConfig, session: &str, timeout: Duration) -> Self {
        Self {
            program: config
                .parameter
                .get("program")
                .cloned()
                .unwrap_or_else(|| "docker".to_owned()),
            host: config.contact.clone().filter(|contact| !contact.is_empty()),
            session: session.to_owned(),
            run_args: config
                .parameter
                .get("run_args")
                .map(|args| args.split_whitespace().map(String::from).collect())
                .unwrap_or_default(),
            timeout,
        }
    }

    fn base_args(&self) -> Vec<OsString> {
        match &self.host {
            Some(host) => vec!["--host".into(), host.into()],
            None => Vec::new(),
        }
    }

    /// Arguments of `docker run` for the job
    pub fn run_arguments(&self, job: &JobSpec) -> Result<Vec<OsString>, SchedulerError> {
        if !job.is_containerized() {
            return Err(SchedulerError::MissingImage);
        }

        let root = job.staging_root();
        let mut mount = root.clone().into_os_string();
        mount.push(":");
        mount.push(&root);

        let mut args = self.base_args();
        args.extend(["run".into(), "-d".into(), "--label".into()]);
        args.push(format!("{SESSION_LABEL}={}", self.session).into());
        args.extend(["--workdir".into(), job.working_directory.clone().into()]);
        // inputs and outputs are both reachable under the same paths as on the host
        args.extend(["--volume".into(), mount]);
        args.extend(self.run_args.iter().map(OsString::from));
        args.push(job.container.clone().into());

        if !job.command.trim().is_empty() {
            args.push(job.command.clone().into());
        }
        args.extend(job.args.iter().map(OsString::from));

        Ok(args)
    }
}

impl Scheduler for DockerScheduler {
    fn kind(&self) -> BackendKind {
        BackendKind::Docker
    }

    fn submit(&self, job: &JobSpec) -> Result<JobId, SchedulerError> {
        let args = self.run_arguments(job)?;
        let output = run_checked(&self.program, &args, self.timeout)?;

        let id = output
            .lines()
            .last()
            .map(String::from)
            .ok_or(SchedulerError::MissingJobId)?;
        info!(job = %id, image = %job.container, "Started container");

        Ok(id)
    }

    fn list_live(&self, filter: &JobFilter) -> Result<BTreeSet<JobId>, SchedulerError> {
        let mut args = self.base_args();
        args.extend(["ps".into(), "-q".into(), "--no-trunc".into()]);

        if let Some(session) = &filter.session {
            args.extend(["--filter".into(), format!("label={SESSION_LABEL}={session}").into()]);
        }

        let output = run_checked(&self.program, &args, self.timeout)?;

        Ok(output.lines().map(String::from).collect())
    }

    fn state(&self, job: &str) -> Result<JobState, SchedulerError> {
        let mut args = self.base_args();
        args.extend([
            "inspect".into(),
            "--format".into(),
            "{{.State.Status}} {{.State.ExitCode}}".into(),
            job.into(),
        ]);

        let output = run(&self.program, &args, self.timeout)?;

        if !output.success {
            if output.stderr.contains("No such") {
                debug!(job = %job, "Container is unknown to docker");

                return Ok(JobState::Unknown);
            }

            return Err(SchedulerError::CommandFailed {
                program: self.program.clone(),
                code: output.code,
                stderr: output.stderr.trim().to_owned(),
            });
        }

        Ok(parse_state(&output.stdout))
    }

    fn release(&self, job: &str, working_directory: &Path) -> Result<(), SchedulerError> {
        let mut logs = self.base_args();
        logs.extend(["logs".into(), job.into()]);

        match run(&self.program, &logs, self.timeout) {
            Ok(output) if output.success && working_directory.is_dir() => {
                fs::write(
                    working_directory.join(OUTPUT_FILE),
                    output.stdout + &output.stderr,
                )?;
            }
            Ok(output) => debug!(job = %job, stderr = %output.stderr.trim(), "No logs collected"),
            Err(error) => warn!(job = %job, error = %error, "Failed to collect container logs"),
        }

        let mut remove = self.base_args();
        remove.extend(["rm".into(), "--force".into(), job.into()]);
        run_checked(&self.program, &remove, self.timeout)?;

        debug!(job = %job, "Removed container");

        Ok(())
    }
}

/// Map `<status> <exit code>` as printed by `docker inspect`
pub fn parse_state(output: &str) -> JobState {
    let mut parts = output.split_whitespace();

    match (parts.next(), parts.next().map(str::parse::<i64>)) {
        (Some("created" | "running" | "restarting" | "paused"), _) => JobState::Running,
        (Some("exited"), Some(Ok(0))) => JobState::Done,
        (Some("exited" | "dead" | "removing"), _) => JobState::Failed,
        _ => JobState::Unknown,
    }
}
