use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use super::{CommitStatus, HostingApi, PublishError};
use crate::config::{PublishConfig, Secret};

const USER_AGENT: &str = concat!("sisyphus-lite/", env!("CARGO_PKG_VERSION"));
const MAX_ERROR_BODY: usize = 500;

/// GitHub REST client. Calls are blocking and run on the blocking pool.
#[derive(Clone)]
pub struct GitHubApi {
    agent: ureq::Agent,
    api_url: String,
    uploads_url: String,
    token: Secret,
}

impl GitHubApi {
    pub fn new(config: &PublishConfig, token: Secret) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .user_agent(USER_AGENT)
            .build();
        Self {
            agent,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            uploads_url: config.uploads_url.trim_end_matches('/').to_string(),
            token,
        }
    }

    fn authorized(&self, request: ureq::Request) -> ureq::Request {
        request
            .set("Authorization", &format!("Bearer {}", self.token.expose()))
            .set("Accept", "application/vnd.github+json")
            .set("X-GitHub-Api-Version", "2022-11-28")
    }

    fn post_json(
        &self,
        operation: &str,
        url: &str,
        body: &serde_json::Value,
    ) -> Result<String, PublishError> {
        let response = self
            .authorized(self.agent.post(url))
            .set("Content-Type", "application/json")
            .send_string(&body.to_string())
            .map_err(|e| map_error(operation, e))?;
        read_body(operation, response)
    }

    fn release_id(&self, repo: &str, tag: &str) -> Result<u64, PublishError> {
        let operation = "look up release";
        let url = format!("{}/repos/{}/releases/tags/{}", self.api_url, repo, tag);
        let response = self
            .authorized(self.agent.get(&url))
            .call()
            .map_err(|e| map_error(operation, e))?;
        let body = read_body(operation, response)?;
        let value: serde_json::Value =
            serde_json::from_str(&body).map_err(|e| PublishError::Transport {
                operation: operation.to_string(),
                reason: format!("invalid response: {}", e),
            })?;
        value["id"].as_u64().ok_or_else(|| PublishError::Transport {
            operation: operation.to_string(),
            reason: "release response has no id".to_string(),
        })
    }

    fn upload_blocking(
        &self,
        repo: &str,
        tag: &str,
        name: &str,
        path: &Path,
    ) -> Result<(), PublishError> {
        let operation = "upload release asset";
        let bytes = std::fs::read(path).map_err(|e| PublishError::Artifact {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let id = self.release_id(repo, tag)?;
        let url = format!("{}/repos/{}/releases/{}/assets", self.uploads_url, repo, id);
        let result = self
            .authorized(self.agent.post(&url))
            .query("name", name)
            .set("Content-Type", "application/octet-stream")
            .send_bytes(&bytes);
        match result {
            Ok(response) => read_body(operation, response).map(|_| ()),
            // Uploading the same asset twice is a no-op for re-runs
            Err(ureq::Error::Status(422, _)) => {
                tracing::info!(repo, tag, asset = %name, "Release asset already exists");
                Ok(())
            }
            Err(e) => Err(map_error(operation, e)),
        }
    }
}

impl std::fmt::Debug for GitHubApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitHubApi")
            .field("api_url", &self.api_url)
            .field("uploads_url", &self.uploads_url)
            .field("token", &self.token)
            .finish()
    }
}

fn read_body(operation: &str, response: ureq::Response) -> Result<String, PublishError> {
    response.into_string().map_err(|e| PublishError::Transport {
        operation: operation.to_string(),
        reason: e.to_string(),
    })
}

fn map_error(operation: &str, error: ureq::Error) -> PublishError {
    match error {
        ureq::Error::Status(status, response) => {
            let body = response.into_string().unwrap_or_default();
            PublishError::Http {
                operation: operation.to_string(),
                status,
                body: body.chars().take(MAX_ERROR_BODY).collect(),
            }
        }
        ureq::Error::Transport(transport) => PublishError::Transport {
            operation: operation.to_string(),
            reason: transport.to_string(),
        },
    }
}

async fn blocking<T, F>(operation: &'static str, call: F) -> Result<T, PublishError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, PublishError> + Send + 'static,
{
    tokio::task::spawn_blocking(call)
        .await
        .map_err(|e| PublishError::Transport {
            operation: operation.to_string(),
            reason: e.to_string(),
        })?
}

#[async_trait]
impl HostingApi for GitHubApi {
    async fn set_commit_status(
        &self,
        repo: &str,
        sha: &str,
        status: &CommitStatus,
    ) -> Result<(), PublishError> {
        let api = self.clone();
        let url = format!("{}/repos/{}/statuses/{}", self.api_url, repo, sha);
        let body = json!({
            "state": status.state,
            "context": status.context,
            "description": status.description,
            "target_url": status.target_url,
        });
        blocking("set commit status", move || {
            api.post_json("set commit status", &url, &body).map(|_| ())
        })
        .await
    }

    async fn post_comment(&self, repo: &str, number: u64, body: &str) -> Result<(), PublishError> {
        let api = self.clone();
        let url = format!("{}/repos/{}/issues/{}/comments", self.api_url, repo, number);
        let body = json!({ "body": body });
        blocking("post comment", move || {
            api.post_json("post comment", &url, &body).map(|_| ())
        })
        .await
    }

    async fn upload_release_asset(
        &self,
        repo: &str,
        tag: &str,
        name: &str,
        path: &Path,
    ) -> Result<(), PublishError> {
        let api = self.clone();
        let (repo, tag, name, path) = (
            repo.to_string(),
            tag.to_string(),
            name.to_string(),
            path.to_path_buf(),
        );
        blocking("upload release asset", move || {
            api.upload_blocking(&repo, &tag, &name, &path)
        })
        .await
    }
}
