//! Translates an experiment and its application template into a backend-ready `JobSpec`.
//!
//! Every parameter of the experiment produces exactly one argument, followed by one argument for
//! each template default the experiment did not mention. Arguments are emitted in key order, the
//! order carries no meaning for the executables but keeps compiled jobs reproducible.

use crate::{
    config::Layout,
    model::{AppTemplate, Experiment, JobSpec},
};
use std::path::Path;
use thiserror::Error;
use tracing::{debug, trace, warn};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("Parameter {0:?} is neither a flag nor a switch of the application")]
    UnknownParameter(String),
}

/// Join the remainder after a reserved token onto `base`, the remainder is always relative
fn join_remainder(base: &Path, remainder: &str) -> String {
    let remainder = remainder.trim_start_matches('/');

    if remainder.is_empty() {
        base.to_string_lossy().into_owned()
    } else {
        base.join(remainder).to_string_lossy().into_owned()
    }
}

/// Flag and value share one token, an empty side leaves just the other one
fn flag_token(flag: &str, value: &str) -> String {
    match (flag.is_empty(), value.is_empty()) {
        (false, false) => format!("{flag} {value}"),
        (true, _) => value.to_owned(),
        (false, true) => flag.to_owned(),
    }
}

/// Render the token of `key`, `None` if the application knows neither a flag nor a switch for it
fn emit(template: &AppTemplate, key: &str, value: &str) -> Option<String> {
    match template.params.get(key) {
        Some(flag) => Some(flag_token(flag, value)),
        None => template.binopts.get(key).cloned(),
    }
}

pub struct Compiler<'a> {
    layout: &'a Layout,
}

impl<'a> Compiler<'a> {
    pub fn new(layout: &'a Layout) -> Self {
        Self { layout }
    }

    /// Rewrite reserved prefixes, the experiment directory wins over the input directory
    fn rewrite(&self, id: i64, value: String, allow_inputs: bool) -> String {
        if let Some(remainder) = value.strip_prefix(self.layout.experiment_token.as_str()) {
            join_remainder(&self.layout.output_dir(id), remainder)
        } else if let Some(remainder) = allow_inputs
            .then(|| value.strip_prefix(self.layout.input_token.as_str()))
            .flatten()
        {
            join_remainder(&self.layout.input_dir(id), remainder)
        } else {
            value
        }
    }

    #[tracing::instrument(level = "debug", skip_all, fields(experiment = experiment.id, app = %experiment.app))]
    pub fn compile(
        &self,
        experiment: &Experiment,
        template: &AppTemplate,
    ) -> Result<JobSpec, CompileError> {
        let mut remaining_defaults = template.defaults.clone();
        let mut args = Vec::with_capacity(experiment.params.len() + remaining_defaults.len());

        for (key, value) in experiment.params.iter() {
            // emitted here, never again from the defaults below
            remaining_defaults.remove(key);

            let value = if value.is_empty() {
                template.defaults.get(key).cloned().unwrap_or_default()
            } else {
                value.clone()
            };
            let value = self.rewrite(experiment.id, value, true);

            if value.is_empty() && template.params.contains_key(key) {
                warn!(key = %key, "Flag has no value and no default, passing the flag alone");
            }

            trace!(key = %key, value = %value, "Resolved parameter");
            let token = emit(template, key, &value)
                .ok_or_else(|| CompileError::UnknownParameter(key.to_owned()))?;
            args.push(token);
        }

        // uploaded files are never referenced by defaults, only the experiment dir is rewritten
        for (key, value) in remaining_defaults {
            let value = self.rewrite(experiment.id, value, false);

            trace!(key = %key, value = %value, "Resolved default");
            let token = emit(template, &key, &value).unwrap_or_else(|| {
                warn!(key = %key, "Default is neither a flag nor a switch, passing its value alone");
                value
            });
            args.push(token);
        }

        // the container entry point supplies the executable
        let command = if template.container.is_empty() {
            template.executable.clone()
        } else {
            String::new()
        };

        debug!("Compiled {} arguments", args.len());

        Ok(JobSpec {
            command,
            args,
            container: template.container.clone(),
            working_directory: self.layout.output_dir(experiment.id),
            job_resources: template.job_resources.clone(),
        })
    }
}

/// Shorthand for `Compiler::new(layout).compile(experiment, template)`
pub fn compile(
    experiment: &Experiment,
    template: &AppTemplate,
    layout: &Layout,
) -> Result<JobSpec, CompileError> {
    Compiler::new(layout).compile(experiment, template)
}
