use std::env;
use std::error;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};

const DEFAULT_API_URL: &str = "https://api.github.com";
const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_millis(300);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const USER_AGENT: &str = concat!("gitvault_logger/", env!("CARGO_PKG_VERSION"));

const CREATE_MESSAGE: &str = "Create log archive via automated upload";
const UPDATE_MESSAGE: &str = "Update log archive via automated upload";

/// Custom error type for archival client construction.
#[derive(Debug)]
pub enum Error {
    EnvVarMissing(String),
    ClientBuild(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::EnvVarMissing(var) => write!(f, "Missing environment variable: {var}"),
            Error::ClientBuild(msg) => write!(f, "HTTP client configuration error: {msg}"),
        }
    }
}

impl error::Error for Error {}

/// One HTTP connection pool for the whole process. Every client clones this
/// handle; only the token, owner, and base URL vary per instance.
static HTTP_POOL: OnceCell<reqwest::Client> = OnceCell::new();

fn shared_http() -> Result<reqwest::Client, Error> {
    HTTP_POOL
        .get_or_try_init(|| {
            reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .user_agent(USER_AGENT)
                .build()
                .map_err(|e| Error::ClientBuild(e.to_string()))
        })
        .cloned()
}

/// Identity recorded on archive commits when one is configured.
#[derive(Debug, Clone, Serialize)]
pub struct CommitAuthor {
    pub name: String,
    pub email: String,
}

/// Result of a single contents-API PUT. `Conflict` is the one retryable
/// outcome: it means the precondition sha went stale between the lookup and
/// the write.
#[derive(Debug)]
pub enum PutOutcome {
    Success,
    Conflict,
    Failed(String),
}

#[derive(Deserialize)]
struct RemoteContent {
    sha: String,
}

#[derive(Serialize)]
struct PutContentsBody<'a> {
    message: &'a str,
    content: &'a str,
    branch: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    committer: Option<&'a CommitAuthor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    author: Option<&'a CommitAuthor>,
}

/// Client for the GitHub contents API, scoped to one owner. Uploads go
/// through `PUT /repos/{owner}/{repo}/contents/{path}` with the current blob
/// sha as a precondition, so concurrent writers conflict instead of silently
/// overwriting each other.
#[derive(Debug, Clone)]
pub struct GithubClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    owner: String,
    max_attempts: u32,
    retry_delay: Duration,
    author: Option<CommitAuthor>,
}

impl GithubClient {
    /// Builds a client against `base_url` with a 30 second request timeout.
    /// An empty token means unauthenticated requests, which only work against
    /// public repositories or a test server.
    pub fn new(base_url: String, token: String, owner: String) -> Result<Self, Error> {
        Ok(GithubClient {
            http: shared_http()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            owner,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry_delay: RETRY_DELAY,
            author: None,
        })
    }

    /// Builds a client from the environment.
    ///
    /// `GITHUB_OWNER` is required. `GITHUB_API_URL`, `GITHUB_TOKEN`, and
    /// `GITHUB_MAX_RETRIES` are optional; `GITHUB_COMMIT_AUTHOR` and
    /// `GITHUB_COMMIT_EMAIL` set the commit identity only when both are
    /// present.
    pub fn from_env() -> Result<Self, Error> {
        let owner = env::var("GITHUB_OWNER")
            .map_err(|_| Error::EnvVarMissing("GITHUB_OWNER".to_string()))?;
        let base_url = env::var("GITHUB_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.to_string());
        let token = env::var("GITHUB_TOKEN").unwrap_or_default();
        let max_attempts = env::var("GITHUB_MAX_RETRIES")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(DEFAULT_MAX_ATTEMPTS);

        let mut client = GithubClient::new(base_url, token, owner)?.with_max_attempts(max_attempts);
        if let (Ok(name), Ok(email)) =
            (env::var("GITHUB_COMMIT_AUTHOR"), env::var("GITHUB_COMMIT_EMAIL"))
        {
            client = client.with_author(CommitAuthor { name, email });
        }
        Ok(client)
    }

    /// Caps the total number of upload attempts, clamped to at least one.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Overrides the fixed delay between conflict retries.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_author(mut self, author: CommitAuthor) -> Self {
        self.author = Some(author);
        self
    }

    fn contents_url(&self, repository: &str, remote_path: &str) -> String {
        format!("{}/repos/{}/{}/contents/{}", self.base_url, self.owner, repository, remote_path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = request.header(reqwest::header::ACCEPT, "application/vnd.github+json");
        if self.token.is_empty() { request } else { request.bearer_auth(&self.token) }
    }

    /// Looks up the blob sha of `remote_path` on `branch`. `Ok(None)` means
    /// the file does not exist yet; any status other than success or 404 is
    /// an error, because uploading without the real sha would clobber or
    /// duplicate the remote copy.
    async fn fetch_remote_sha(
        &self,
        repository: &str,
        branch: &str,
        remote_path: &str,
    ) -> Result<Option<String>, String> {
        let request = self.authorize(
            self.http.get(self.contents_url(repository, remote_path)).query(&[("ref", branch)]),
        );
        let response = request.send().await.map_err(|e| e.to_string())?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(format!("unexpected status {status} while checking the remote file"));
        }
        let content: RemoteContent = response.json().await.map_err(|e| e.to_string())?;
        Ok(Some(content.sha))
    }

    async fn put_contents(
        &self,
        repository: &str,
        branch: &str,
        remote_path: &str,
        content: &str,
        sha: Option<&str>,
        message: &str,
    ) -> PutOutcome {
        let body = PutContentsBody {
            message,
            content,
            branch,
            sha,
            committer: self.author.as_ref(),
            author: self.author.as_ref(),
        };
        let request =
            self.authorize(self.http.put(self.contents_url(repository, remote_path))).json(&body);
        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return PutOutcome::Failed(e.to_string()),
        };
        let status = response.status();
        if status == reqwest::StatusCode::CONFLICT {
            return PutOutcome::Conflict;
        }
        if status.is_success() {
            return PutOutcome::Success;
        }
        let detail = response.text().await.unwrap_or_default();
        PutOutcome::Failed(format!("status {status}: {detail}"))
    }

    /// One full upload attempt: read the local file, base64 it, look up the
    /// current remote sha, then PUT. The sha lookup runs inside the attempt
    /// so a retry always carries a fresh precondition.
    async fn try_upload(
        &self,
        repository: &str,
        branch: &str,
        local_path: &Path,
        remote_path: &str,
        message: Option<&str>,
    ) -> PutOutcome {
        let bytes = match tokio::fs::read(local_path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                return PutOutcome::Failed(format!("failed to read {}: {e}", local_path.display()));
            }
        };
        let content = STANDARD.encode(&bytes);
        let sha = match self.fetch_remote_sha(repository, branch, remote_path).await {
            Ok(sha) => sha,
            Err(e) => return PutOutcome::Failed(format!("failed to check the remote file: {e}")),
        };
        let message =
            message.unwrap_or(if sha.is_some() { UPDATE_MESSAGE } else { CREATE_MESSAGE });
        self.put_contents(repository, branch, remote_path, &content, sha.as_deref(), message).await
    }

    /// Uploads a local file to `repository` on `branch` as `remote_path`,
    /// creating or updating it as needed. Returns whether the remote copy was
    /// persisted.
    ///
    /// Only a 409 conflict is retried, after a fixed delay and with a
    /// re-fetched sha, up to the configured number of total attempts. Any
    /// other failure gives up immediately.
    ///
    /// # Arguments
    /// * `repository` - Repository name under this client's owner
    /// * `branch` - Target branch for the commit
    /// * `local_path` - File on disk to upload
    /// * `remote_path` - Path of the file inside the repository
    /// * `message` - Commit message; `None` picks a create or update default
    pub async fn upload_file(
        &self,
        repository: &str,
        branch: &str,
        local_path: &Path,
        remote_path: &str,
        message: Option<&str>,
    ) -> bool {
        for attempt in 1..=self.max_attempts {
            match self.try_upload(repository, branch, local_path, remote_path, message).await {
                PutOutcome::Success => {
                    log::debug!("Archived {remote_path} in {attempt} attempt(s)");
                    return true;
                }
                PutOutcome::Conflict if attempt < self.max_attempts => {
                    log::debug!("Sha conflict for {remote_path}, retrying (attempt {attempt})");
                    tokio::time::sleep(self.retry_delay).await;
                }
                PutOutcome::Conflict => {
                    log::error!(
                        "Failed to archive {remote_path}: sha conflict after {} attempts",
                        self.max_attempts
                    );
                }
                PutOutcome::Failed(reason) => {
                    log::error!("Failed to archive {remote_path}: {reason}");
                    return false;
                }
            }
        }
        false
    }
}
