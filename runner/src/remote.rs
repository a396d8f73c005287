use crate::{
    model::{Experiment, ExperimentId, JobState},
    retry::{retry_with_backoff, RetryConfig},
};
use reqwest::blocking::{multipart::Form, Client, RequestBuilder, Response};
use std::{
    fs::File,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Request to queue service failed")]
    Http(#[from] reqwest::Error),
    #[error("Queue service answered {status} for {url}: {body}")]
    Status {
        url: String,
        status: u16,
        body: String,
    },
    #[error("Failed to access {0}")]
    Io(PathBuf, #[source] std::io::Error),
    #[error("Queue service returned malformed experiments")]
    Decode(#[from] serde_json::Error),
}

impl RemoteError {
    /// Whether repeating the request may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(error) => error.is_timeout() || error.is_connect() || error.is_request(),
            Self::Status { status, .. } => *status >= 500 || *status == 429,
            Self::Io(..) | Self::Decode(_) => false,
        }
    }
}

/// Boundary to the queue service handing out experiments and receiving their results
pub trait Remote {
    /// Pending experiments, in no particular order
    fn queue(&self) -> Result<Vec<Experiment>, RemoteError>;

    /// Store the input archive of the experiment at `dest`
    fn download_inputs(&self, id: ExperimentId, dest: &Path) -> Result<(), RemoteError>;

    fn upload_results(&self, id: ExperimentId, archive: &Path) -> Result<(), RemoteError>;

    /// Signal that the staged inputs of the experiment may be discarded
    fn delete_inputs(&self, id: ExperimentId) -> Result<(), RemoteError>;

    fn mark_failed(&self, id: ExperimentId, state: JobState) -> Result<(), RemoteError>;
}

/// HTTP client for the experiment routes of the queue service
#[derive(Debug, Clone)]
pub struct ApiClient {
    base: String,
    client: Client,
    retry: RetryConfig,
}

impl ApiClient {
    pub fn new(base: &str, timeout: Duration, retry: RetryConfig) -> Result<Self, RemoteError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            base: base.trim_end_matches('/').to_owned(),
            client,
            retry,
        })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path.trim_start_matches('/'))
    }

    /// Send a single request, non-2xx answers are errors
    fn send_once(&self, request: RequestBuilder) -> Result<Response, RemoteError> {
        let response = request.send()?;
        let status = response.status();

        if status.is_success() {
            Ok(response)
        } else {
            Err(RemoteError::Status {
                url: response.url().to_string(),
                status: status.as_u16(),
                body: response.text().unwrap_or_default(),
            })
        }
    }

    /// Send the request built by `request`, retrying transient failures
    fn send<F>(&self, operation: &str, request: F) -> Result<Response, RemoteError>
    where
        F: Fn(&Client) -> Result<RequestBuilder, RemoteError>,
    {
        retry_with_backoff(
            &self.retry,
            operation,
            || self.send_once(request(&self.client)?),
            RemoteError::is_transient,
        )
    }
}

impl Remote for ApiClient {
    fn queue(&self) -> Result<Vec<Experiment>, RemoteError> {
        let url = self.url("queue");
        let body = self
            .send("fetch_queue", |client| Ok(client.get(&url)))?
            .bytes()?;

        // an empty queue may be encoded as null
        let queue: Option<Vec<Experiment>> = serde_json::from_slice(&body)?;
        let queue = queue.unwrap_or_default();
        info!("Fetched {} pending experiments", queue.len());

        Ok(queue)
    }

    fn download_inputs(&self, id: ExperimentId, dest: &Path) -> Result<(), RemoteError> {
        let url = self.url(&format!("{id}/files"));

        retry_with_backoff(
            &self.retry,
            "download_inputs",
            || {
                let mut response = self.send_once(self.client.get(&url))?;
                let mut file =
                    File::create(dest).map_err(|error| RemoteError::Io(dest.to_path_buf(), error))?;
                response.copy_to(&mut file)?;

                Ok(())
            },
            RemoteError::is_transient,
        )?;
        debug!(experiment = id, dest = ?dest, "Downloaded inputs");

        Ok(())
    }

    fn upload_results(&self, id: ExperimentId, archive: &Path) -> Result<(), RemoteError> {
        let url = self.url(&format!("{id}/results"));

        self.send("upload_results", |client| {
            let form = Form::new()
                .file("results", archive)
                .map_err(|error| RemoteError::Io(archive.to_path_buf(), error))?;

            Ok(client.post(&url).multipart(form))
        })?;
        info!(experiment = id, "Uploaded results");

        Ok(())
    }

    fn delete_inputs(&self, id: ExperimentId) -> Result<(), RemoteError> {
        let url = self.url(&format!("{id}/delete"));

        self.send("delete_inputs", |client| Ok(client.delete(&url)))?;
        debug!(experiment = id, "Deleted remote inputs");

        Ok(())
    }

    fn mark_failed(&self, id: ExperimentId, state: JobState) -> Result<(), RemoteError> {
        let url = self.url(&format!("{id}/failed"));

        self.send("mark_failed", |client| {
            Ok(client.post(&url).form(&[("exit_code", state.as_str())]))
        })?;
        info!(experiment = id, state = %state, "Marked experiment as failed");

        Ok(())
    }
}
