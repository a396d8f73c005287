use crate::model::AppTemplate;
use std::{
    fs,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("Application name {0:?} is not a valid template name")]
    InvalidName(String),
    #[error("No template found for application {0:?}")]
    NotFound(String),
    #[error("Failed to read template {0}")]
    Read(PathBuf, #[source] std::io::Error),
    #[error("Template for application {0:?} is not valid JSON")]
    Parse(String, #[source] serde_json::Error),
}

/// Read-only directory of per-application JSON templates, one `<app>.json` per application
#[derive(Debug, Clone)]
pub struct TemplateStore {
    root: PathBuf,
}

impl TemplateStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, app: &str) -> Result<PathBuf, TemplateError> {
        if app.is_empty() || app.contains(['/', '\\']) || app == "." || app.contains("..") {
            return Err(TemplateError::InvalidName(app.to_owned()));
        }

        Ok(self.root.join(format!("{app}.json")))
    }

    /// Load a fresh copy of the template, callers are free to mutate it
    pub fn load(&self, app: &str) -> Result<AppTemplate, TemplateError> {
        let path = self.path_for(app)?;
        debug!(path = ?path, "Loading application template");

        let data = match fs::read(&path) {
            Ok(data) => data,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Err(TemplateError::NotFound(app.to_owned()))
            }
            Err(error) => return Err(TemplateError::Read(path, error)),
        };

        serde_json::from_slice(&data).map_err(|error| TemplateError::Parse(app.to_owned(), error))
    }
}
