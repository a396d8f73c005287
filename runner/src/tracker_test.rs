use crate::{
    config::Layout,
    ledger::{JobId, Ledger},
    model::{Experiment, ExperimentId, JobSpec, JobState},
    remote::{Remote, RemoteError},
    scheduler::{BackendKind, Backends, JobFilter, Scheduler, SchedulerError},
    tracker::{Tracker, TrackerError},
};
use std::{
    cell::RefCell,
    collections::{BTreeMap, BTreeSet},
    fs::{self, File},
    io::Write,
    path::Path,
    rc::Rc,
    time::Duration,
};
use tempfile::TempDir;
use zip::{write::FileOptions, ZipArchive, ZipWriter};

#[derive(Debug, Default)]
struct SchedulerState {
    next: u32,
    submitted: Vec<JobSpec>,
    live: BTreeSet<JobId>,
    states: BTreeMap<JobId, JobState>,
    released: Vec<JobId>,
    reject_submit: bool,
    listing_broken: bool,
}

#[derive(Debug, Clone, Default)]
struct FakeScheduler(Rc<RefCell<SchedulerState>>);

impl FakeScheduler {
    fn finish(&self, job: &str, state: JobState) {
        let mut inner = self.0.borrow_mut();
        inner.live.remove(job);
        inner.states.insert(job.to_owned(), state);
    }
}

impl Scheduler for FakeScheduler {
    fn kind(&self) -> BackendKind {
        BackendKind::Slurm
    }

    fn submit(&self, job: &JobSpec) -> Result<JobId, SchedulerError> {
        let mut inner = self.0.borrow_mut();

        if inner.reject_submit {
            return Err(SchedulerError::CommandFailed {
                program: "sbatch".to_owned(),
                code: Some(1),
                stderr: "queue is full".to_owned(),
            });
        }

        inner.next += 1;
        let id = format!("job-{}", inner.next);
        inner.submitted.push(job.clone());
        inner.live.insert(id.clone());

        Ok(id)
    }

    fn list_live(&self, _filter: &JobFilter) -> Result<BTreeSet<JobId>, SchedulerError> {
        let inner = self.0.borrow();

        if inner.listing_broken {
            return Err(SchedulerError::Timeout(
                "squeue".to_owned(),
                Duration::from_secs(1),
            ));
        }

        Ok(inner.live.clone())
    }

    fn state(&self, job: &str) -> Result<JobState, SchedulerError> {
        let inner = self.0.borrow();

        Ok(match inner.states.get(job) {
            Some(state) => *state,
            None if inner.live.contains(job) => JobState::Running,
            None => JobState::Unknown,
        })
    }

    fn release(&self, job: &str, _working_directory: &Path) -> Result<(), SchedulerError> {
        self.0.borrow_mut().released.push(job.to_owned());

        Ok(())
    }
}

#[derive(Debug, Default)]
struct RemoteState {
    queue: Vec<Experiment>,
    calls: Vec<String>,
    // entry names of every uploaded result archive
    uploads: BTreeMap<ExperimentId, Vec<String>>,
    // calls answered with 503, e.g. "delete"
    unavailable: BTreeSet<&'static str>,
}

#[derive(Debug, Clone, Default)]
struct FakeRemote(Rc<RefCell<RemoteState>>);

impl FakeRemote {
    fn calls(&self) -> Vec<String> {
        self.0.borrow().calls.clone()
    }

    fn called(&self, call: &str) -> bool {
        self.0.borrow().calls.iter().any(|c| c == call)
    }

    fn make_unavailable(&self, call: &'static str) {
        self.0.borrow_mut().unavailable.insert(call);
    }

    /// Record the call, failing it if it was made unavailable
    fn answer(&self, call: &'static str, id: ExperimentId) -> Result<(), RemoteError> {
        let mut inner = self.0.borrow_mut();
        inner.calls.push(format!("{call} {id}"));

        if inner.unavailable.contains(call) {
            return Err(RemoteError::Status {
                url: format!("http://localhost:5000/experiments/{id}/{call}"),
                status: 503,
                body: "Service Unavailable".to_owned(),
            });
        }

        Ok(())
    }
}

impl Remote for FakeRemote {
    fn queue(&self) -> Result<Vec<Experiment>, RemoteError> {
        let mut inner = self.0.borrow_mut();
        inner.calls.push("queue".to_owned());

        Ok(inner.queue.clone())
    }

    fn download_inputs(&self, id: ExperimentId, dest: &Path) -> Result<(), RemoteError> {
        self.0.borrow_mut().calls.push(format!("download {id}"));

        let mut zip = ZipWriter::new(File::create(dest).unwrap());
        zip.start_file("data.txt", FileOptions::default()).unwrap();
        zip.write_all(b"1 2 3\n").unwrap();
        zip.finish().unwrap();

        Ok(())
    }

    fn upload_results(&self, id: ExperimentId, archive: &Path) -> Result<(), RemoteError> {
        self.answer("upload", id)?;

        let mut zip = ZipArchive::new(File::open(archive).unwrap()).unwrap();
        let names = (0..zip.len())
            .map(|index| zip.by_index(index).unwrap().name().to_owned())
            .collect();

        self.0.borrow_mut().uploads.insert(id, names);

        Ok(())
    }

    fn delete_inputs(&self, id: ExperimentId) -> Result<(), RemoteError> {
        self.answer("delete", id)
    }

    fn mark_failed(&self, id: ExperimentId, state: JobState) -> Result<(), RemoteError> {
        self.0.borrow_mut().calls.push(format!("failed {id} {state}"));

        Ok(())
    }
}

const TEMPLATE: &str = r#"{
    "Executable": "/opt/sim/bin/sim",
    "Params": {"n": "-n", "data": "--data", "out": "--out"},
    "Binopts": {"verbose": "-v"},
    "Defaults": {"n": "10", "out": "$experdir/result.csv"}
}"#;

struct Fixture {
    _dir: TempDir,
    layout: Layout,
    scheduler: FakeScheduler,
    remote: FakeRemote,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout {
            outputs: dir.path().join("outputs"),
            inputs: dir.path().join("inputs"),
            templates: dir.path().join("templates"),
            ledger: dir.path().join("jobs.json"),
            experiment_token: "$experdir".to_owned(),
            input_token: "inputs".to_owned(),
        };

        fs::create_dir_all(&layout.templates).unwrap();
        fs::write(layout.templates.join("sim.json"), TEMPLATE).unwrap();

        Self {
            _dir: dir,
            layout,
            scheduler: FakeScheduler::default(),
            remote: FakeRemote::default(),
        }
    }

    fn enqueue(&self, experiments: Vec<Experiment>) {
        self.remote.0.borrow_mut().queue = experiments;
    }

    /// A fresh tracker reading the ledger from disk, as after a restart
    fn tracker(&self) -> Tracker<FakeRemote, FakeScheduler> {
        let ledger = Ledger::load(&self.layout.ledger).unwrap();
        let backends = Backends::new(
            BTreeMap::from([("cubic".to_owned(), self.scheduler.clone())]),
            None,
        );

        Tracker::new(self.layout.clone(), ledger, backends, self.remote.clone())
            .with_session("jobsession")
            .with_poll_interval(Duration::from_millis(1))
    }

    fn stored_ledger(&self) -> Ledger {
        Ledger::load(&self.layout.ledger).unwrap()
    }
}

fn experiment(id: ExperimentId, app: &str, host: &str) -> Experiment {
    Experiment {
        id,
        app: app.to_owned(),
        host: host.to_owned(),
        user: 4,
        params: BTreeMap::from([
            ("data".to_owned(), "inputs/data.txt".to_owned()),
            ("verbose".to_owned(), String::new()),
        ]),
    }
}

#[test]
pub fn submitted_jobs_are_persisted_with_staged_inputs() {
    let fixture = Fixture::new();
    fixture.enqueue(vec![experiment(1, "sim", "cubic"), experiment(2, "sim", "cubic")]);

    let report = fixture.tracker().submit_pending().unwrap();

    assert_eq!(
        report.submitted,
        vec![(1, "job-1".to_owned()), (2, "job-2".to_owned())]
    );
    assert!(report.failed.is_empty());

    let ledger = fixture.stored_ledger();
    assert_eq!(ledger.len(), 2);
    assert_eq!(ledger.get("job-2").map(|experiment| experiment.id), Some(2));

    let layout = &fixture.layout;
    assert!(layout.input_dir(1).join("data.txt").is_file());
    assert!(!layout.inputs.join("1.zip").exists());
    assert!(layout.output_dir(2).is_dir());

    let state = fixture.scheduler.0.borrow();
    assert_eq!(state.submitted[0].command, "/opt/sim/bin/sim");
    assert_eq!(state.submitted[0].working_directory, layout.output_dir(1));
    assert_eq!(
        state.submitted[0].args,
        vec![
            format!("--data {}", layout.input_dir(1).join("data.txt").display()),
            "-v".to_owned(),
            "-n 10".to_owned(),
            format!("--out {}", layout.output_dir(1).join("result.csv").display()),
        ]
    );
}

#[test]
pub fn permanent_failures_are_reported_and_do_not_stop_the_queue() {
    let fixture = Fixture::new();
    fixture.enqueue(vec![
        experiment(1, "sim", "nowhere"),
        experiment(2, "missing", "cubic"),
        experiment(3, "sim", "cubic"),
    ]);

    let report = fixture.tracker().submit_pending().unwrap();

    assert_eq!(report.failed, vec![1, 2]);
    assert_eq!(report.submitted, vec![(3, "job-1".to_owned())]);
    assert!(fixture.remote.called("failed 1 Failed"));
    assert!(fixture.remote.called("failed 2 Failed"));
    assert!(!fixture.remote.called("download 1"));
    assert!(!fixture.remote.called("download 2"));
    assert_eq!(fixture.stored_ledger().len(), 1);
}

#[test]
pub fn rejected_submission_leaves_no_ledger_entry() {
    let fixture = Fixture::new();
    fixture.enqueue(vec![experiment(1, "sim", "cubic")]);
    fixture.scheduler.0.borrow_mut().reject_submit = true;

    let mut tracker = fixture.tracker();
    let report = tracker.submit_pending().unwrap();

    assert_eq!(report.failed, vec![1]);
    assert!(tracker.ledger().is_empty());
    assert!(fixture.stored_ledger().is_empty());
    assert!(!fixture.layout.output_dir(1).exists());
    assert!(!fixture.layout.input_dir(1).exists());
    // the backend may accept it on the next run
    assert!(!fixture.remote.called("failed 1 Failed"));
}

#[test]
pub fn experiments_in_flight_are_not_submitted_twice() {
    let fixture = Fixture::new();
    fixture.enqueue(vec![experiment(1, "sim", "cubic")]);

    fixture.tracker().submit_pending().unwrap();
    let report = fixture.tracker().submit_pending().unwrap();

    assert_eq!(report.skipped, vec![1]);
    assert!(report.submitted.is_empty());
    assert_eq!(fixture.scheduler.0.borrow().submitted.len(), 1);
}

#[test]
pub fn reconcile_removes_exactly_the_terminated_jobs() {
    let fixture = Fixture::new();
    fixture.enqueue(vec![
        experiment(1, "sim", "cubic"),
        experiment(2, "sim", "cubic"),
        experiment(3, "sim", "cubic"),
    ]);
    fixture.tracker().submit_pending().unwrap();

    fixture.scheduler.finish("job-1", JobState::Done);
    fixture.scheduler.finish("job-2", JobState::Failed);
    fs::write(fixture.layout.output_dir(1).join("result.csv"), "a,b\n").unwrap();

    let report = fixture.tracker().reconcile().unwrap();

    assert_eq!(
        report.completed,
        vec![
            ("job-1".to_owned(), 1, JobState::Done),
            ("job-2".to_owned(), 2, JobState::Failed),
        ]
    );
    assert_eq!(report.running, 1);

    let ledger = fixture.stored_ledger();
    assert_eq!(ledger.len(), 1);
    assert!(ledger.contains("job-3"));

    assert!(fixture.remote.called("delete 1"));
    assert!(fixture.remote.called("upload 1"));
    assert!(fixture.remote.called("failed 2 Failed"));
    assert!(fixture.remote.called("upload 2"));
    assert!(!fixture.remote.called("delete 2"));
    assert!(fixture.remote.0.borrow().uploads[&1].contains(&"1/result.csv".to_owned()));

    assert!(!fixture.layout.output_dir(1).exists());
    assert!(!fixture.layout.input_dir(1).exists());
    assert!(!fixture.layout.outputs.join("1.zip").exists());
    assert!(fixture.layout.output_dir(3).exists());
    assert_eq!(
        fixture.scheduler.0.borrow().released,
        vec!["job-1".to_owned(), "job-2".to_owned()]
    );
}

#[test]
pub fn jobs_missing_from_listing_but_still_running_are_kept() {
    let fixture = Fixture::new();
    fixture.enqueue(vec![experiment(1, "sim", "cubic")]);
    fixture.tracker().submit_pending().unwrap();
    fixture.scheduler.finish("job-1", JobState::Running);

    let report = fixture.tracker().reconcile().unwrap();

    assert!(report.completed.is_empty());
    assert_eq!(report.running, 1);
    assert!(fixture.stored_ledger().contains("job-1"));
}

#[test]
pub fn lost_jobs_ship_whatever_outputs_exist() {
    let fixture = Fixture::new();
    fixture.enqueue(vec![experiment(1, "sim", "cubic")]);
    fixture.tracker().submit_pending().unwrap();

    // vanished without a trace, the backend reports nothing about it
    fixture.scheduler.0.borrow_mut().live.clear();

    let report = fixture.tracker().reconcile().unwrap();

    assert_eq!(
        report.completed,
        vec![("job-1".to_owned(), 1, JobState::Unknown)]
    );
    assert!(fixture.remote.called("delete 1"));
    assert!(fixture.remote.called("upload 1"));
    assert!(fixture.stored_ledger().is_empty());
}

#[test]
pub fn unlistable_backend_keeps_its_entries() {
    let fixture = Fixture::new();
    fixture.enqueue(vec![experiment(1, "sim", "cubic")]);
    fixture.tracker().submit_pending().unwrap();

    {
        let mut state = fixture.scheduler.0.borrow_mut();
        state.live.clear();
        state.listing_broken = true;
    }

    let report = fixture.tracker().reconcile().unwrap();

    assert_eq!(report.unchecked, vec!["job-1".to_owned()]);
    assert!(report.completed.is_empty());
    assert!(fixture.stored_ledger().contains("job-1"));
    assert_eq!(fixture.remote.calls(), vec!["queue", "download 1"]);
}

#[test]
pub fn reconcile_with_empty_ledger_touches_nothing() {
    let fixture = Fixture::new();

    let report = fixture.tracker().reconcile().unwrap();

    assert_eq!(report, Default::default());
    assert!(fixture.remote.calls().is_empty());
    assert!(!fixture.layout.ledger.exists());
}

#[test]
pub fn wait_for_ships_the_job_once_it_terminated() {
    let fixture = Fixture::new();
    fixture.enqueue(vec![experiment(1, "sim", "cubic")]);

    let mut tracker = fixture.tracker();
    tracker.submit_pending().unwrap();
    fixture.scheduler.finish("job-1", JobState::Done);

    assert_eq!(tracker.wait_for("job-1").unwrap(), JobState::Done);
    assert!(tracker.ledger().is_empty());
    assert!(fixture.remote.called("upload 1"));

    assert!(matches!(
        tracker.wait_for("job-1"),
        Err(TrackerError::NotTracked(job)) if job == "job-1"
    ));
}

#[test]
pub fn results_are_shipped_even_if_input_deletion_fails() {
    let fixture = Fixture::new();
    fixture.enqueue(vec![experiment(1, "sim", "cubic")]);
    fixture.tracker().submit_pending().unwrap();

    fixture.scheduler.finish("job-1", JobState::Done);
    fs::write(fixture.layout.output_dir(1).join("result.csv"), "a,b\n").unwrap();
    fixture.remote.make_unavailable("delete");

    let report = fixture.tracker().reconcile().unwrap();

    assert_eq!(report.failed, vec!["job-1".to_owned()]);
    assert!(report.completed.is_empty());
    assert_eq!(
        fixture.remote.calls(),
        vec!["queue", "download 1", "delete 1", "upload 1"]
    );
    assert!(fixture.remote.0.borrow().uploads[&1].contains(&"1/result.csv".to_owned()));
    assert!(fixture.stored_ledger().is_empty());
    assert!(!fixture.layout.output_dir(1).exists());
}

#[test]
pub fn outputs_stay_on_disk_when_upload_fails() {
    let fixture = Fixture::new();
    fixture.enqueue(vec![experiment(1, "sim", "cubic")]);
    fixture.tracker().submit_pending().unwrap();

    fixture.scheduler.finish("job-1", JobState::Done);
    fs::write(fixture.layout.output_dir(1).join("result.csv"), "a,b\n").unwrap();
    fixture.remote.make_unavailable("upload");

    let report = fixture.tracker().reconcile().unwrap();

    assert_eq!(report.failed, vec!["job-1".to_owned()]);
    assert!(fixture.remote.called("delete 1"));
    assert!(fixture.layout.output_dir(1).join("result.csv").is_file());
    assert!(!fixture.layout.outputs.join("1.zip").exists());
}

#[test]
pub fn tracked_experiments_are_refused_by_submit() {
    let fixture = Fixture::new();
    fixture.enqueue(vec![experiment(1, "sim", "cubic")]);

    let mut tracker = fixture.tracker();
    tracker.submit_pending().unwrap();

    assert!(matches!(
        tracker.submit(&experiment(1, "sim", "cubic")),
        Err(TrackerError::InFlight(1, job)) if job == "job-1"
    ));
    // staged files of the running job are left alone
    assert!(fixture.layout.input_dir(1).join("data.txt").is_file());
    assert!(fixture.layout.output_dir(1).is_dir());
}
