//! Google Drive v3 upload with a service account.
//!
//! Authentication uses the OAuth2 JWT bearer flow: an RS256-signed assertion
//! from the service-account key is exchanged for an access token. A file with
//! the same name in the destination folder is updated in place, otherwise a
//! new one is created there.

use anyhow::{anyhow, bail, Context, Result};
use base64::{engine::general_purpose, Engine as _};
use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

const DRIVE_API: &str = "https://www.googleapis.com/drive/v3/files";
const DRIVE_UPLOAD_API: &str = "https://www.googleapis.com/upload/drive/v3/files";
const DRIVE_SCOPE: &str = "https://www.googleapis.com/auth/drive";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const XLSX_MIME: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";
const UPLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// Fields of a service-account key file that the upload needs.
#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub token_uri: Option<String>,
}

impl std::fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("client_email", &self.client_email)
            .field("private_key", &"***")
            .finish()
    }
}

impl ServiceAccountKey {
    /// Parse a key given either as raw JSON or as base64-encoded JSON.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        let json = if raw.starts_with('{') {
            raw.to_string()
        } else {
            let decoded = general_purpose::STANDARD
                .decode(raw)
                .context("GDRIVE_SA_JSON is neither JSON nor base64")?;
            String::from_utf8(decoded).context("GDRIVE_SA_JSON base64 is not UTF-8")?
        };

        serde_json::from_str(&json).context("Invalid service account JSON")
    }

    fn token_uri(&self) -> &str {
        self.token_uri.as_deref().unwrap_or(DEFAULT_TOKEN_URI)
    }
}

#[derive(Debug, Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
}

#[derive(Debug, Deserialize)]
struct DriveFile {
    id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateFile<'a> {
    name: &'a str,
    parents: [&'a str; 1],
    mime_type: &'a str,
}

/// Uploads report files into one Drive folder.
pub struct DriveUploader {
    http: Client,
    key: ServiceAccountKey,
    folder_id: String,
}

impl DriveUploader {
    pub fn new(key: ServiceAccountKey, folder_id: String) -> Result<Self> {
        let http = Client::builder()
            .timeout(UPLOAD_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            http,
            key,
            folder_id,
        })
    }

    /// Create from `GDRIVE_SA_JSON` and `GDRIVE_FOLDER_ID`.
    ///
    /// Returns `None` when both are unset, which disables uploads.
    pub fn from_env() -> Result<Option<Self>> {
        Self::from_parts(
            std::env::var("GDRIVE_SA_JSON").ok(),
            std::env::var("GDRIVE_FOLDER_ID").ok(),
        )
    }

    /// Build from an optional key and folder; one without the other is an error.
    pub fn from_parts(raw_key: Option<String>, folder_id: Option<String>) -> Result<Option<Self>> {
        let raw_key = raw_key.filter(|v| !v.trim().is_empty());
        let folder_id = folder_id.filter(|v| !v.trim().is_empty());

        match (raw_key, folder_id) {
            (Some(raw_key), Some(folder_id)) => {
                let key = ServiceAccountKey::parse(&raw_key)?;
                Ok(Some(Self::new(key, folder_id.trim().to_string())?))
            }
            (Some(_), None) => bail!("GDRIVE_SA_JSON is set but GDRIVE_FOLDER_ID is missing"),
            (None, Some(_)) => bail!("GDRIVE_FOLDER_ID is set but GDRIVE_SA_JSON is missing"),
            (None, None) => Ok(None),
        }
    }

    /// Upload `contents` as `file_name`, returning the Drive file id.
    pub async fn upload(&self, file_name: &str, contents: Vec<u8>) -> Result<String> {
        let token = self.access_token().await?;

        let file_id = match self.find_file(&token, file_name).await? {
            Some(id) => {
                debug!(file_id = %id, file = %file_name, "Updating existing Drive file");
                id
            }
            None => self.create_file(&token, file_name).await?,
        };

        let url = format!(
            "{}/{}?uploadType=media&supportsAllDrives=true",
            DRIVE_UPLOAD_API, file_id
        );
        let resp = self
            .http
            .patch(&url)
            .bearer_auth(&token)
            .header(reqwest::header::CONTENT_TYPE, XLSX_MIME)
            .body(contents)
            .send()
            .await
            .context("Failed to upload file contents")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("Drive upload failed: {} - {}", status, body);
        }

        Ok(file_id)
    }

    async fn access_token(&self) -> Result<String> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            iss: &self.key.client_email,
            scope: DRIVE_SCOPE,
            aud: self.key.token_uri(),
            iat: now,
            exp: now + 3600,
        };

        let encoding_key = EncodingKey::from_rsa_pem(self.key.private_key.as_bytes())
            .context("Invalid service account private key")?;
        let assertion = encode(&Header::new(Algorithm::RS256), &claims, &encoding_key)
            .context("Failed to sign token request")?;

        let resp = self
            .http
            .post(self.key.token_uri())
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .context("Failed to request access token")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("Token exchange failed: {} - {}", status, body);
        }

        let token: TokenResponse = resp.json().await.context("Failed to parse token response")?;
        Ok(token.access_token)
    }

    async fn find_file(&self, token: &str, file_name: &str) -> Result<Option<String>> {
        let query = file_query(file_name, &self.folder_id);
        let resp = self
            .http
            .get(DRIVE_API)
            .bearer_auth(token)
            .query(&[
                ("q", query.as_str()),
                ("fields", "files(id,name)"),
                ("spaces", "drive"),
                ("supportsAllDrives", "true"),
                ("includeItemsFromAllDrives", "true"),
            ])
            .send()
            .await
            .context("Failed to search Drive folder")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("Drive search failed: {} - {}", status, body);
        }

        let list: FileList = resp.json().await.context("Failed to parse Drive file list")?;
        Ok(list.files.into_iter().next().map(|f| f.id))
    }

    async fn create_file(&self, token: &str, file_name: &str) -> Result<String> {
        let metadata = CreateFile {
            name: file_name,
            parents: [self.folder_id.as_str()],
            mime_type: XLSX_MIME,
        };

        let resp = self
            .http
            .post(format!("{}?supportsAllDrives=true", DRIVE_API))
            .bearer_auth(token)
            .json(&metadata)
            .send()
            .await
            .context("Failed to create Drive file")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("Drive create failed: {} - {}", status, body);
        }

        let file: DriveFile = resp.json().await.context("Failed to parse created file")?;
        if file.id.is_empty() {
            return Err(anyhow!("Drive returned an empty file id"));
        }
        debug!(file_id = %file.id, file = %file_name, "Created Drive file");
        Ok(file.id)
    }
}

/// Drive search query for a non-trashed file by name inside a folder.
fn file_query(file_name: &str, folder_id: &str) -> String {
    format!(
        "name='{}' and '{}' in parents and trashed=false",
        escape(file_name),
        escape(folder_id)
    )
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}
