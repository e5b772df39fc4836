//! GitHub REST client: runner releases and registration tokens

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tracing::{debug, error};
use url::Url;

use crate::errors::ManagerError;
use crate::runtime::{RegistryClient, TokenIssuer};

pub const DEFAULT_API_URL: &str = "https://api.github.com";

/// Repository whose releases version the runner images
pub const RUNNER_RELEASES_REPO: &str = "actions/runner";

#[derive(Debug, Deserialize)]
struct Release {
    tag_name: String,
}

#[derive(Debug, Deserialize)]
struct RegistrationToken {
    token: String,
}

/// HTTP client for the GitHub API
#[derive(Debug, Clone)]
pub struct GithubClient {
    client: Client,
    api_url: String,
    releases_repo: String,
}

impl GithubClient {
    pub fn new() -> Result<Self, ManagerError> {
        Self::with_api_url(DEFAULT_API_URL)
    }

    /// Client against another API root, e.g. GitHub Enterprise
    pub fn with_api_url(api_url: &str) -> Result<Self, ManagerError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("runner-manager/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            releases_repo: RUNNER_RELEASES_REPO.to_string(),
        })
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Registration-token endpoint for an organization or repository URL
    pub fn registration_endpoint(&self, org_url: &str) -> Result<String, ManagerError> {
        let parsed = Url::parse(org_url)
            .map_err(|e| ManagerError::ConfigError(format!("Invalid org_url {}: {}", org_url, e)))?;

        let segments: Vec<&str> = parsed
            .path_segments()
            .map(|s| s.filter(|seg| !seg.is_empty()).collect())
            .unwrap_or_default();

        match segments.as_slice() {
            [org] => Ok(format!(
                "{}/orgs/{}/actions/runners/registration-token",
                self.api_url, org
            )),
            [owner, repo] => Ok(format!(
                "{}/repos/{}/{}/actions/runners/registration-token",
                self.api_url, owner, repo
            )),
            _ => Err(ManagerError::ConfigError(format!(
                "org_url must be https://github.com/<org> or https://github.com/<owner>/<repo>: {}",
                org_url
            ))),
        }
    }
}

#[async_trait]
impl RegistryClient for GithubClient {
    async fn latest_tag(&self, image_repo: &str) -> Result<String, ManagerError> {
        let url = format!("{}/repos/{}/releases/latest", self.api_url, self.releases_repo);
        debug!("GET {} (for {})", url, image_repo);

        let response = self
            .client
            .get(&url)
            .header(header::ACCEPT, "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| ManagerError::external("registry lookup", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("Release lookup failed: {} - {}", status, body);
            return Err(ManagerError::external("registry lookup", status));
        }

        let release: Release = response
            .json()
            .await
            .map_err(|e| ManagerError::external("registry lookup", e))?;

        Ok(release
            .tag_name
            .strip_prefix('v')
            .unwrap_or(&release.tag_name)
            .to_string())
    }
}

#[async_trait]
impl TokenIssuer for GithubClient {
    async fn issue_registration_token(
        &self,
        org_url: &str,
        credential: &SecretString,
    ) -> Result<SecretString, ManagerError> {
        let url = self.registration_endpoint(org_url)?;
        debug!("POST {}", url);

        let response = self
            .client
            .post(&url)
            .header(header::ACCEPT, "application/vnd.github+json")
            .bearer_auth(credential.expose_secret())
            .send()
            .await
            .map_err(|e| ManagerError::external("registration token", e))?;

        if response.status() != StatusCode::CREATED {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!("Registration token request failed: {} - {}", status, body);
            return Err(ManagerError::external("registration token", status));
        }

        let token: RegistrationToken = response
            .json()
            .await
            .map_err(|e| ManagerError::external("registration token", e))?;

        Ok(SecretString::from(token.token))
    }
}
