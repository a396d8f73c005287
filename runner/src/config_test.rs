use crate::{
    config::{ConfigErrors, RunnerConfig},
    retry::RetryConfig,
    scheduler::BackendKind,
};
use std::{
    path::{Path, PathBuf},
    time::Duration,
};

const CONFIG: &str = r#"
paths:
  outputs: /data/outputs
  inputs: staging/inputs
  templates: /etc/ipp/templates
tokens:
  experiment_dir: "$out"
api:
  tunnel:
    ssh: root@host.docker.internal
    local_port: 5001
  retry:
    max_attempts: 0
backends:
  localhost:
    kind: docker
  cubic:
    kind: slurm
    contact: cubic
    parameter:
      sbatch_args: --partition=short
session: nightly
poll_interval_ms: 250
"#;

#[test]
pub fn parses_full_config() {
    let config = RunnerConfig::from_yaml(CONFIG).unwrap();

    assert_eq!(config.tokens.experiment_dir, "$out");
    assert_eq!(config.tokens.input_dir, "inputs");
    assert_eq!(config.session, "nightly");
    assert_eq!(config.poll_interval(), Duration::from_millis(250));

    let cubic = &config.backends["cubic"];
    assert_eq!(cubic.kind, BackendKind::Slurm);
    assert_eq!(cubic.contact.as_deref(), Some("cubic"));
    assert_eq!(cubic.parameter["sbatch_args"], "--partition=short");

    let tunnel = config.api.tunnel.as_ref().unwrap();
    assert_eq!(tunnel.local_port, 5001);
    assert_eq!(tunnel.remote, "localhost:5000");
    assert_eq!(tunnel.prefix, "/experiments");

    assert_eq!(RetryConfig::from(&config.api.retry).max_attempts, 0);
    assert!(!config.preflight_checks());
}

#[test]
pub fn empty_config_uses_defaults() {
    let config = RunnerConfig::from_yaml("{}").unwrap();

    assert_eq!(config.paths.ledger, PathBuf::from("jobs.json"));
    assert_eq!(config.tokens.experiment_dir, "$experdir");
    assert_eq!(config.api.url, "http://localhost:5000/experiments");
    assert!(config.api.tunnel.is_none());
    assert_eq!(config.backends["localhost"].kind, BackendKind::Docker);
    assert_eq!(config.backends["cubic"].kind, BackendKind::Slurm);
    assert_eq!(config.session, "jobsession");
}

#[test]
pub fn missing_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();

    let config = RunnerConfig::load(&dir.path().join("runner.yaml")).unwrap();

    assert_eq!(config.poll_interval_ms, 5000);
}

#[test]
pub fn unknown_fields_are_rejected() {
    let result = RunnerConfig::from_yaml("backend: docker\n");

    assert!(matches!(result, Err(ConfigErrors::InvalidYaml(_))));
}

#[test]
pub fn layout_resolves_relative_paths_against_base() {
    let config = RunnerConfig::from_yaml(CONFIG).unwrap();

    let layout = config.layout(Path::new("/srv/runner"));

    assert_eq!(layout.outputs, PathBuf::from("/data/outputs"));
    assert_eq!(layout.inputs, PathBuf::from("/srv/runner/staging/inputs"));
    assert_eq!(layout.ledger, PathBuf::from("/srv/runner/jobs.json"));
    assert_eq!(layout.output_dir(42), PathBuf::from("/data/outputs/42"));
    assert_eq!(
        layout.input_dir(42),
        PathBuf::from("/srv/runner/staging/inputs/42")
    );
    assert_eq!(layout.experiment_token, "$out");
}

#[test]
pub fn preflight_collects_errors() {
    let mut config = RunnerConfig::default();
    assert!(!config.preflight_checks());

    config.paths.inputs = config.paths.outputs.clone();
    assert!(config.preflight_checks());

    let mut config = RunnerConfig::default();
    config.backends.clear();
    assert!(config.preflight_checks());

    let mut config = RunnerConfig::default();
    config.api.url = "localhost:5000".to_owned();
    assert!(config.preflight_checks());

    let mut config = RunnerConfig::default();
    config.poll_interval_ms = 0;
    assert!(config.preflight_checks());
}
