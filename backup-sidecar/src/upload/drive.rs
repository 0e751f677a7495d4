//! Google Drive v3 remote store.
//!
//! Authenticates with an OAuth2 "authorized user" file (`token.json` with
//! `client_id`, `client_secret`, `refresh_token`). The access token is
//! refreshed on first use and once more whenever Drive answers 401.

use super::progress_stream::ProgressStream;
use super::{RemoteObject, RemoteStore};
use crate::utils::errors::StoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::{CONTENT_LENGTH, LOCATION};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const FILES_URL: &str = "https://www.googleapis.com/drive/v3/files";
const UPLOAD_URL: &str = "https://www.googleapis.com/upload/drive/v3/files";
const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const ARTIFACT_MIME: &str = "application/zstd";

#[derive(Clone, Deserialize)]
struct AuthorizedUser {
    client_id: String,
    client_secret: String,
    refresh_token: String,
    #[serde(default)]
    token: Option<String>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: String,
    #[serde(default)]
    created_time: Option<DateTime<Utc>>,
    /// Drive reports sizes as decimal strings.
    #[serde(default)]
    size: Option<String>,
}

impl DriveFile {
    fn into_object(self) -> RemoteObject {
        RemoteObject {
            created_at: self.created_time.unwrap_or(DateTime::<Utc>::UNIX_EPOCH),
            size: self.size.and_then(|s| s.parse().ok()).unwrap_or(0),
            remote_id: self.id,
            name: self.name,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
    #[serde(default)]
    next_page_token: Option<String>,
}

pub struct DriveStore {
    client: Client,
    credentials: AuthorizedUser,
    access_token: RwLock<Option<String>>,
}

impl DriveStore {
    /// Load credentials from an authorized-user JSON file.
    pub async fn from_token_file(path: &Path) -> Result<Self, StoreError> {
        let raw = tokio::fs::read(path).await?;
        let credentials: AuthorizedUser = serde_json::from_slice(&raw).map_err(|e| {
            StoreError::Auth(format!("invalid token file {}: {}", path.display(), e))
        })?;
        Self::new(credentials)
    }

    fn new(credentials: AuthorizedUser) -> Result<Self, StoreError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .user_agent(concat!("backup-sidecar/", env!("CARGO_PKG_VERSION")))
            .build()?;
        let cached = credentials.token.clone();
        Ok(Self {
            client,
            credentials,
            access_token: RwLock::new(cached),
        })
    }

    /// Exchange the refresh token for a fresh access token.
    pub async fn refresh(&self) -> Result<(), StoreError> {
        let params = [
            ("grant_type", "refresh_token"),
            ("client_id", self.credentials.client_id.as_str()),
            ("client_secret", self.credentials.client_secret.as_str()),
            ("refresh_token", self.credentials.refresh_token.as_str()),
        ];
        let response = self.client.post(TOKEN_URL).form(&params).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match status {
                StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED => {
                    StoreError::Auth(format!("token refresh rejected: {}", body))
                }
                _ => StoreError::Status {
                    status: status.as_u16(),
                    body,
                },
            });
        }
        let token: TokenResponse = response.json().await?;
        *self.access_token.write().await = Some(token.access_token);
        debug!("Refreshed Drive access token");
        Ok(())
    }

    async fn token(&self) -> Result<String, StoreError> {
        if let Some(token) = self.access_token.read().await.clone() {
            return Ok(token);
        }
        self.refresh().await?;
        self.access_token
            .read()
            .await
            .clone()
            .ok_or_else(|| StoreError::Auth("no access token after refresh".to_string()))
    }

    /// Send an authorized request, refreshing the token once on 401.
    async fn send_authed<F>(&self, build: F) -> Result<Response, StoreError>
    where
        F: Fn(&str) -> RequestBuilder,
    {
        let token = self.token().await?;
        let response = build(&token).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return check(response).await;
        }

        debug!("Drive returned 401, refreshing token");
        self.refresh().await?;
        let token = self.token().await?;
        let response = build(&token).send().await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Auth(body));
        }
        check(response).await
    }

    async fn query(&self, q: &str) -> Result<Vec<DriveFile>, StoreError> {
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let page = page_token.clone();
            let response = self
                .send_authed(|token| {
                    let mut request = self.client.get(FILES_URL).bearer_auth(token).query(&[
                        ("q", q),
                        ("fields", "nextPageToken, files(id, name, createdTime, size)"),
                        ("pageSize", "1000"),
                    ]);
                    if let Some(page) = &page {
                        request = request.query(&[("pageToken", page.as_str())]);
                    }
                    request
                })
                .await?;
            let list: FileList = response.json().await?;
            files.extend(list.files);
            match list.next_page_token {
                Some(next) if !next.is_empty() => page_token = Some(next),
                _ => return Ok(files),
            }
        }
    }
}

async fn check(response: Response) -> Result<Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        let body = response.text().await.unwrap_or_default();
        Err(StoreError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

/// Quote a value for a Drive `q` expression.
fn escape_query(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

#[async_trait]
impl RemoteStore for DriveStore {
    async fn upload(&self, path: &Path, folder_id: &str, name: &str) -> Result<String, StoreError> {
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        let metadata = json!({ "name": name, "parents": [folder_id] });

        let session = self
            .send_authed(|token| {
                self.client
                    .post(UPLOAD_URL)
                    .query(&[("uploadType", "resumable"), ("fields", "id")])
                    .bearer_auth(token)
                    .header("X-Upload-Content-Type", ARTIFACT_MIME)
                    .header("X-Upload-Content-Length", size)
                    .json(&metadata)
            })
            .await?;
        let location = session
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| StoreError::InvalidResponse("missing resumable session URI".to_string()))?
            .to_string();

        let body = ProgressStream::new(ReaderStream::new(file), name, size);
        let token = self.token().await?;
        let response = self
            .client
            .put(&location)
            .bearer_auth(token)
            .header(CONTENT_LENGTH, size)
            .body(reqwest::Body::wrap_stream(body))
            .send()
            .await?;
        let created: DriveFile = check(response).await?.json().await?;

        info!(name, remote_id = %created.id, bytes = size, "Uploaded to Drive");
        Ok(created.id)
    }

    async fn list(&self, folder_id: &str) -> Result<Vec<RemoteObject>, StoreError> {
        let q = format!(
            "'{}' in parents and trashed = false and mimeType != '{}'",
            escape_query(folder_id),
            FOLDER_MIME
        );
        let files = self.query(&q).await?;
        Ok(files.into_iter().map(DriveFile::into_object).collect())
    }

    async fn delete(&self, remote_id: &str) -> Result<(), StoreError> {
        let url = format!("{}/{}", FILES_URL, remote_id);
        match self
            .send_authed(|token| self.client.delete(&url).bearer_auth(token))
            .await
        {
            Ok(_) => Ok(()),
            Err(StoreError::Status { status: 404, .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn ensure_folder(&self, parent_id: &str, name: &str) -> Result<String, StoreError> {
        let q = format!(
            "name = '{}' and '{}' in parents and mimeType = '{}' and trashed = false",
            escape_query(name),
            escape_query(parent_id),
            FOLDER_MIME
        );
        if let Some(existing) = self.query(&q).await?.into_iter().next() {
            return Ok(existing.id);
        }

        let metadata = json!({ "name": name, "mimeType": FOLDER_MIME, "parents": [parent_id] });
        let response = self
            .send_authed(|token| {
                self.client
                    .post(FILES_URL)
                    .query(&[("fields", "id, name")])
                    .bearer_auth(token)
                    .json(&metadata)
            })
            .await?;
        let created: DriveFile = response.json().await?;
        info!(name, folder_id = %created.id, parent_id, "Created Drive folder");
        Ok(created.id)
    }
}
