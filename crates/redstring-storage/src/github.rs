// github.rs — Remote Storage Provider over the GitHub contents API.
//
// Surface used:
//   GET  /repos/{owner}/{repo}                      repository-existence check
//   GET  /repos/{owner}/{repo}/contents/{path}      read file / list dir (404 → not found / empty)
//   PUT  /repos/{owner}/{repo}/contents/{path}      create or update (body carries `sha` on update)
//   GET  /user | /installation/repositories         availability + auth check
//
// File bodies travel base64-encoded. A 401 triggers exactly one credential
// refresh and retry; a second 401 surfaces as `StorageError::Auth`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use reqwest::{Method, RequestBuilder, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::auth::{AuthContext, AuthMethod, CredentialSource};
use crate::clock::SharedClock;
use crate::error::StorageError;
use crate::remote::{DirEntry, EntryKind, RemoteFile, RemoteProvider, RepoRef};

/// Remote provider configuration (the `[provider]` table of redstring.toml).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// API root, e.g. `https://api.github.com` or a GHES `/api/v3` URL.
    #[serde(default = "default_api_base")]
    pub api_base: String,

    /// Branch all reads and writes target.
    #[serde(default = "default_branch")]
    pub branch: String,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Attempts made by `is_available` before reporting false.
    #[serde(default = "default_availability_attempts")]
    pub availability_attempts: u32,

    /// Linear back-off step between availability attempts (attempt n waits n × step).
    #[serde(default = "default_availability_backoff_ms")]
    pub availability_backoff_ms: u64,

    /// Per-request timeout.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Commit message used for content writes.
    #[serde(default = "default_commit_message")]
    pub commit_message: String,

    /// Refresh the credential this long before it expires.
    #[serde(default = "default_refresh_skew_secs")]
    pub refresh_skew_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            branch: default_branch(),
            user_agent: default_user_agent(),
            availability_attempts: default_availability_attempts(),
            availability_backoff_ms: default_availability_backoff_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            commit_message: default_commit_message(),
            refresh_skew_secs: default_refresh_skew_secs(),
        }
    }
}

// Serde default functions
fn default_api_base() -> String {
    "https://api.github.com".to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

fn default_user_agent() -> String {
    format!("redstring-sync/{}", env!("CARGO_PKG_VERSION"))
}

fn default_availability_attempts() -> u32 {
    3
}

fn default_availability_backoff_ms() -> u64 {
    1_000
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_commit_message() -> String {
    "Update workspace".to_string()
}

fn default_refresh_skew_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize)]
struct ContentItem {
    #[serde(rename = "type")]
    kind: String,
    name: String,
    path: String,
    sha: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    encoding: Option<String>,
    #[serde(default)]
    download_url: Option<String>,
}

#[derive(Debug, Serialize)]
struct PutContentRequest<'a> {
    message: &'a str,
    content: String,
    branch: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct PutContentResponse {
    content: PutContentItem,
}

#[derive(Debug, Deserialize)]
struct PutContentItem {
    sha: String,
}

/// GitHub-backed remote provider.
pub struct GitHubProvider {
    client: reqwest::Client,
    config: ProviderConfig,
    credentials: Arc<dyn CredentialSource>,
    clock: SharedClock,
    cached: Mutex<Option<AuthContext>>,
}

impl GitHubProvider {
    pub fn new(
        config: ProviderConfig,
        credentials: Arc<dyn CredentialSource>,
        clock: SharedClock,
    ) -> Result<Self, StorageError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| StorageError::Network(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            config,
            credentials,
            clock,
            cached: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    fn store_credential(&self, ctx: &AuthContext) {
        if let Ok(mut cached) = self.cached.lock() {
            *cached = Some(ctx.clone());
        }
    }

    fn cached_credential(&self) -> Option<AuthContext> {
        self.cached.lock().ok().and_then(|c| c.clone())
    }

    fn url(&self, segments: &[&str]) -> Result<Url, StorageError> {
        let mut url = Url::parse(&self.config.api_base)
            .map_err(|e| StorageError::Network(format!("invalid api_base: {}", e)))?;
        url.path_segments_mut()
            .map_err(|_| StorageError::Network("api_base cannot be a base URL".to_string()))?
            .pop_if_empty()
            .extend(segments.iter().filter(|s| !s.is_empty()));
        Ok(url)
    }

    fn contents_url(&self, repo: &RepoRef, path: &str) -> Result<Url, StorageError> {
        let mut segments = vec!["repos", repo.owner.as_str(), repo.name.as_str(), "contents"];
        segments.extend(path.split('/').filter(|s| !s.is_empty()));
        self.url(&segments)
    }

    fn request(&self, method: Method, url: Url, token: &str) -> RequestBuilder {
        self.client
            .request(method, url)
            .bearer_auth(token)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    /// Send a request, refreshing the credential once on a 401.
    async fn send<F>(&self, build: F) -> Result<Response, StorageError>
    where
        F: Fn(&str) -> RequestBuilder + Send + Sync,
    {
        let ctx = self.authenticate().await?;
        let response = build(&ctx.token).send().await.map_err(network_error)?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        tracing::warn!(method = %ctx.method, "credential rejected; refreshing once");
        let fresh = self.credentials.refresh().await?;
        self.store_credential(&fresh);
        let response = build(&fresh.token).send().await.map_err(network_error)?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(StorageError::Auth(
                "credential rejected after refresh; re-authentication required".to_string(),
            ));
        }
        Ok(response)
    }

    async fn get_contents(&self, repo: &RepoRef, path: &str) -> Result<Response, StorageError> {
        let mut url = self.contents_url(repo, path)?;
        url.query_pairs_mut().append_pair("ref", &self.config.branch);
        self.send(|token| self.request(Method::GET, url.clone(), token))
            .await
    }

    async fn fetch_raw(&self, download_url: &str) -> Result<String, StorageError> {
        let url = Url::parse(download_url)
            .map_err(|e| StorageError::Network(format!("invalid download url: {}", e)))?;
        let response = self
            .send(|token| self.request(Method::GET, url.clone(), token))
            .await?;
        let response = check_status(response, download_url).await?;
        response.text().await.map_err(network_error)
    }

    fn availability_url(&self, method: AuthMethod) -> Result<Url, StorageError> {
        match method {
            AuthMethod::Oauth => self.url(&["user"]),
            AuthMethod::AppInstallation => {
                let mut url = self.url(&["installation", "repositories"])?;
                url.query_pairs_mut().append_pair("per_page", "1");
                Ok(url)
            }
        }
    }

    async fn check_once(&self) -> Result<(), StorageError> {
        let ctx = self.authenticate().await?;
        let url = self.availability_url(ctx.method)?;
        let response = self
            .send(|token| self.request(Method::GET, url.clone(), token))
            .await?;
        check_status(response, "availability check").await.map(|_| ())
    }
}

fn network_error(e: reqwest::Error) -> StorageError {
    if e.is_timeout() {
        StorageError::Timeout {
            operation: "remote request".to_string(),
            millis: 0,
        }
    } else {
        StorageError::Network(e.to_string())
    }
}

/// Map a non-success response onto the storage taxonomy.
async fn check_status(response: Response, path: &str) -> Result<Response, StorageError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(classify_status(status, path, &body))
}

fn classify_status(status: StatusCode, path: &str, body: &str) -> StorageError {
    match status {
        StatusCode::NOT_FOUND => StorageError::NotFound {
            path: path.to_string(),
        },
        // 409: sha does not match; 422: sha missing for an existing file.
        StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => StorageError::Conflict {
            path: path.to_string(),
            expected: None,
        },
        StatusCode::UNAUTHORIZED => StorageError::Auth(format!("{} rejected credential", path)),
        StatusCode::FORBIDDEN if body.to_ascii_lowercase().contains("rate limit") => {
            StorageError::Network(format!("rate limited on {}", path))
        }
        StatusCode::FORBIDDEN => StorageError::Auth(format!("access to {} forbidden", path)),
        other => StorageError::Network(format!("{} on {}: {}", other, path, truncate(body, 200))),
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

fn decode_content(item: &ContentItem) -> Result<String, StorageError> {
    let raw = item.content.as_deref().unwrap_or_default();
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = BASE64
        .decode(compact.as_bytes())
        .map_err(|e| StorageError::Network(format!("invalid base64 for {}: {}", item.path, e)))?;
    String::from_utf8(bytes)
        .map_err(|e| StorageError::Network(format!("{} is not UTF-8: {}", item.path, e)))
}

#[async_trait]
impl RemoteProvider for GitHubProvider {
    fn name(&self) -> &str {
        "github"
    }

    async fn authenticate(&self) -> Result<AuthContext, StorageError> {
        let now = self.clock.now();
        let skew = Duration::from_secs(self.config.refresh_skew_secs);

        let ctx = match self.cached_credential() {
            Some(ctx) if !ctx.expires_within(now, skew) => return Ok(ctx),
            Some(ctx) => {
                tracing::debug!(method = %ctx.method, "credential expiring; refreshing");
                self.credentials.refresh().await?
            }
            None => self.credentials.current().await?,
        };
        if ctx.is_expired(now) {
            return Err(StorageError::Auth(format!(
                "{} token expired; re-authentication required",
                ctx.method
            )));
        }
        self.store_credential(&ctx);
        Ok(ctx)
    }

    async fn is_available(&self) -> bool {
        let attempts = self.config.availability_attempts.max(1);
        let step = Duration::from_millis(self.config.availability_backoff_ms);

        for attempt in 1..=attempts {
            match self.check_once().await {
                Ok(()) => return true,
                Err(e) => {
                    tracing::warn!(attempt, attempts, error = %e, "remote availability check failed");
                    if attempt < attempts {
                        self.clock.sleep(step * attempt).await;
                    }
                }
            }
        }
        false
    }

    async fn repository_exists(&self, repo: &RepoRef) -> Result<bool, StorageError> {
        let url = self.url(&["repos", &repo.owner, &repo.name])?;
        let response = self
            .send(|token| self.request(Method::GET, url.clone(), token))
            .await?;
        match check_status(response, &repo.to_string()).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn read_file(&self, repo: &RepoRef, path: &str) -> Result<RemoteFile, StorageError> {
        let response = self.get_contents(repo, path).await?;
        let response = check_status(response, path).await?;
        let value: Value = response.json().await.map_err(network_error)?;
        if value.is_array() {
            // The path names a directory.
            return Err(StorageError::NotFound {
                path: path.to_string(),
            });
        }
        let item: ContentItem = serde_json::from_value(value)?;

        // Files over 1 MB come back without inline content.
        let content = match (item.encoding.as_deref(), item.download_url.as_deref()) {
            (Some("none"), Some(download)) => self.fetch_raw(download).await?,
            _ => decode_content(&item)?,
        };
        Ok(RemoteFile {
            path: item.path,
            content,
            revision: item.sha,
        })
    }

    async fn file_revision(&self, repo: &RepoRef, path: &str) -> Result<Option<String>, StorageError> {
        let response = self.get_contents(repo, path).await?;
        let response = match check_status(response, path).await {
            Ok(r) => r,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        let value: Value = response.json().await.map_err(network_error)?;
        Ok(value
            .get("sha")
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    async fn write_file(
        &self,
        repo: &RepoRef,
        path: &str,
        content: &str,
        revision: Option<&str>,
    ) -> Result<String, StorageError> {
        let url = self.contents_url(repo, path)?;
        let body = PutContentRequest {
            message: &self.config.commit_message,
            content: BASE64.encode(content.as_bytes()),
            branch: &self.config.branch,
            sha: revision,
        };
        let response = self
            .send(|token| self.request(Method::PUT, url.clone(), token).json(&body))
            .await?;
        let response = match check_status(response, path).await {
            Ok(r) => r,
            Err(StorageError::Conflict { path, .. }) => {
                return Err(StorageError::Conflict {
                    path,
                    expected: revision.map(str::to_string),
                })
            }
            Err(e) => return Err(e),
        };
        let written: PutContentResponse = response.json().await.map_err(network_error)?;
        tracing::debug!(repo = %repo, path, revision = %written.content.sha, "remote write");
        Ok(written.content.sha)
    }

    async fn list_directory(&self, repo: &RepoRef, path: &str) -> Result<Vec<DirEntry>, StorageError> {
        let response = self.get_contents(repo, path).await?;
        let response = match check_status(response, path).await {
            Ok(r) => r,
            Err(e) if e.is_not_found() => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let value: Value = response.json().await.map_err(network_error)?;
        let Value::Array(items) = value else {
            tracing::warn!(path, "listing a file path; returning empty listing");
            return Ok(Vec::new());
        };

        let mut entries = Vec::new();
        for item in items {
            let Ok(item) = serde_json::from_value::<ContentItem>(item) else {
                continue;
            };
            let kind = match item.kind.as_str() {
                "file" => EntryKind::File,
                "dir" => EntryKind::Dir,
                // symlinks and submodules are not workspaces
                _ => continue,
            };
            entries.push(DirEntry {
                name: item.name,
                path: item.path,
                kind,
            });
        }
        Ok(entries)
    }
}
