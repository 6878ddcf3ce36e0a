use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use thiserror::Error;
use url::Url;

const DEFAULT_BASE_URL: &str = "https://open-api.123pan.com";
const DEFAULT_UPLOAD_BASE_URL: &str = "https://openapi-upload.123242.com";

#[derive(Debug, Error)]
pub enum PanError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned http {status}: {body}")]
    Http { status: StatusCode, body: String },
    #[error("api error {code}: {message}")]
    Api { code: i64, message: String },
    #[error("api response missing data")]
    MissingData,
    #[error("unknown offline job status: {0}")]
    UnknownJobStatus(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

impl PanError {
    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            PanError::Http { status, .. } => Some(classify_http_status(*status)),
            PanError::Api { code, message } => Some(classify_api_error(*code, message)),
            PanError::Request(err) if err.is_timeout() || err.is_connect() => {
                Some(ApiErrorClass::Transient)
            }
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.classification(),
            Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
        )
    }

    pub fn is_auth(&self) -> bool {
        matches!(self.classification(), Some(ApiErrorClass::Auth))
    }
}

fn classify_http_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

// The provider reports most failures inside the JSON envelope, with an HTTP
// 200 around them. Code 401 is the documented token failure; rate limiting is
// only recognisable from the localized message text.
fn classify_api_error(code: i64, message: &str) -> ApiErrorClass {
    let lowered = message.to_lowercase();
    if code == 401 || lowered.contains("token is expired") || lowered.contains("token expired") {
        ApiErrorClass::Auth
    } else if message.contains("频繁") || message.contains("请稍后") || lowered.contains("too many")
    {
        ApiErrorClass::RateLimit
    } else {
        ApiErrorClass::Permanent
    }
}

/// Status of a provider offline-download job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    InProgress,
    Failed,
    Succeeded,
    Retrying,
}

impl JobStatus {
    fn from_code(code: i64) -> Result<Self, PanError> {
        match code {
            0 => Ok(JobStatus::InProgress),
            1 => Ok(JobStatus::Failed),
            2 => Ok(JobStatus::Succeeded),
            3 => Ok(JobStatus::Retrying),
            other => Err(PanError::UnknownJobStatus(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JobProgress {
    pub progress: f64,
    pub status: JobStatus,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteFile {
    pub file_id: i64,
    pub filename: String,
    #[serde(default)]
    pub parent_file_id: i64,
    #[serde(rename = "type")]
    pub kind: i64,
    #[serde(default)]
    pub size: i64,
    #[serde(default)]
    pub etag: String,
    #[serde(default)]
    pub status: i64,
    #[serde(default)]
    pub category: i64,
    #[serde(default)]
    pub trashed: i64,
    #[serde(default)]
    pub create_at: String,
}

impl RemoteFile {
    pub fn is_dir(&self) -> bool {
        self.kind == 1
    }

    pub fn is_trashed(&self) -> bool {
        self.trashed != 0
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    code: i64,
    #[serde(default)]
    message: Option<String>,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct MkdirData {
    #[serde(rename = "dirID")]
    dir_id: i64,
}

#[derive(Debug, Deserialize)]
struct FileListData {
    #[serde(rename = "fileList", default)]
    file_list: Vec<RemoteFile>,
}

#[derive(Debug, Deserialize)]
struct OfflineSubmitData {
    #[serde(rename = "taskID")]
    task_id: i64,
}

#[derive(Debug, Deserialize)]
struct OfflineProcessData {
    process: f64,
    status: i64,
}

/// Stateless client for the provider open API. The bearer token is passed
/// into every call so one client can serve any number of tenants.
#[derive(Clone)]
pub struct PanClient {
    http: Client,
    base_url: Url,
    upload_base_url: Url,
}

impl PanClient {
    pub fn new() -> Result<Self, PanError> {
        Ok(Self {
            http: Client::new(),
            base_url: Url::parse(DEFAULT_BASE_URL)?,
            upload_base_url: Url::parse(DEFAULT_UPLOAD_BASE_URL)?,
        })
    }

    /// Points both the API and the upload endpoints at one base, which is
    /// what tests against a single mock server want.
    pub fn with_base_url(base_url: &str) -> Result<Self, PanError> {
        let parsed = Url::parse(base_url)?;
        Ok(Self {
            http: Client::new(),
            base_url: parsed.clone(),
            upload_base_url: parsed,
        })
    }

    pub async fn create_folder(
        &self,
        token: &str,
        name: &str,
        parent_id: i64,
    ) -> Result<i64, PanError> {
        let url = self.endpoint("/upload/v1/file/mkdir")?;
        let response = self
            .http
            .post(url)
            .header("Authorization", bearer(token))
            .header("Platform", "open_platform")
            .json(&serde_json::json!({ "name": name, "parentID": parent_id }))
            .send()
            .await?;
        let data: MkdirData = Self::handle_response(response).await?;
        Ok(data.dir_id)
    }

    pub async fn list_folder(
        &self,
        token: &str,
        parent_id: i64,
        limit: u32,
    ) -> Result<Vec<RemoteFile>, PanError> {
        let mut url = self.endpoint("/api/v2/file/list")?;
        url.query_pairs_mut()
            .append_pair("parentFileId", &parent_id.to_string())
            .append_pair("limit", &limit.to_string());
        let response = self
            .http
            .get(url)
            .header("Authorization", bearer(token))
            .header("Platform", "open_platform")
            .send()
            .await?;
        let data: FileListData = Self::handle_response(response).await?;
        Ok(data.file_list)
    }

    pub async fn submit_offline_download(
        &self,
        token: &str,
        download_url: &str,
        dir_id: i64,
        file_name: Option<&str>,
    ) -> Result<i64, PanError> {
        let url = self.endpoint("/api/v1/offline/download")?;
        let mut body = serde_json::json!({ "url": download_url, "dirID": dir_id });
        if let Some(file_name) = file_name {
            body["fileName"] = serde_json::Value::String(file_name.to_string());
        }
        let response = self
            .http
            .post(url)
            .header("Authorization", bearer(token))
            .header("Platform", "open_platform")
            .json(&body)
            .send()
            .await?;
        let data: OfflineSubmitData = Self::handle_response(response).await?;
        Ok(data.task_id)
    }

    pub async fn offline_download_progress(
        &self,
        token: &str,
        job_id: i64,
    ) -> Result<JobProgress, PanError> {
        let mut url = self.endpoint("/api/v1/offline/download/process")?;
        url.query_pairs_mut()
            .append_pair("taskID", &job_id.to_string());
        let response = self
            .http
            .get(url)
            .header("Authorization", bearer(token))
            .header("Platform", "open_platform")
            .send()
            .await?;
        let data: OfflineProcessData = Self::handle_response(response).await?;
        Ok(JobProgress {
            progress: data.process,
            status: JobStatus::from_code(data.status)?,
        })
    }

    pub async fn rename_file(
        &self,
        token: &str,
        file_id: i64,
        new_name: &str,
    ) -> Result<(), PanError> {
        let url = self.endpoint("/api/v1/file/name")?;
        let response = self
            .http
            .put(url)
            .header("Authorization", bearer(token))
            .header("Platform", "open_platform")
            .json(&serde_json::json!({ "fileId": file_id, "fileName": new_name }))
            .send()
            .await?;
        Self::handle_empty_response(response).await
    }

    pub async fn upload_cover(
        &self,
        token: &str,
        parent_id: i64,
        file_name: &str,
        etag: &str,
        bytes: Vec<u8>,
    ) -> Result<(), PanError> {
        let url = self.upload_base_url.join("/upload/v2/file/single/create")?;
        let size = bytes.len();
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name.to_string())
            .mime_str("image/jpeg")?;
        let form = reqwest::multipart::Form::new()
            .text("parentFileID", parent_id.to_string())
            .text("filename", file_name.to_string())
            .text("etag", etag.to_string())
            .text("size", size.to_string())
            .part("file", part);
        let response = self
            .http
            .post(url)
            .header("Authorization", bearer(token))
            .header("Platform", "open_platform")
            .multipart(form)
            .send()
            .await?;
        Self::handle_empty_response(response).await
    }

    fn endpoint(&self, path: &str) -> Result<Url, PanError> {
        Ok(self.base_url.join(path)?)
    }

    async fn handle_response<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, PanError> {
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(PanError::Http { status, body });
        }
        let envelope = response.json::<Envelope<T>>().await?;
        if envelope.code != 0 {
            return Err(PanError::Api {
                code: envelope.code,
                message: envelope.message.unwrap_or_default(),
            });
        }
        envelope.data.ok_or(PanError::MissingData)
    }

    async fn handle_empty_response(response: reqwest::Response) -> Result<(), PanError> {
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(PanError::Http { status, body });
        }
        let envelope = response.json::<Envelope<serde_json::Value>>().await?;
        if envelope.code != 0 {
            return Err(PanError::Api {
                code: envelope.code,
                message: envelope.message.unwrap_or_default(),
            });
        }
        Ok(())
    }
}

// Account-login tokens already carry the "Bearer " prefix.
fn bearer(token: &str) -> String {
    if token.starts_with("Bearer ") {
        token.to_string()
    } else {
        format!("Bearer {token}")
    }
}
