//! Google Drive v3 REST client.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use snapsync_common::{Error, Result};

use super::auth::TokenManager;

/// Google Drive API base URL.
const DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";
/// Google Drive upload API base URL.
const DRIVE_UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";

/// MIME type Drive uses for folders.
pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

/// Resumable chunks must be multiples of 256 KiB.
const CHUNK_SIZE: usize = 4 * 256 * 1024;

const FILE_FIELDS: &str = "id,name,mimeType,size,parents";
const LIST_FIELDS: &str = "files(id,name,mimeType,size,parents),nextPageToken";

/// File or folder metadata returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    /// File ID.
    pub id: String,
    /// File name.
    pub name: String,
    /// MIME type.
    pub mime_type: String,
    /// Size in bytes, as a decimal string (files only).
    #[serde(default)]
    pub size: Option<String>,
    /// Parent folder IDs.
    #[serde(default)]
    pub parents: Vec<String>,
}

impl DriveFile {
    /// Check if this is a folder.
    pub fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME_TYPE
    }

    /// Get size as u64.
    pub fn size_bytes(&self) -> Option<u64> {
        self.size.as_ref().and_then(|s| s.parse().ok())
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileListResponse {
    files: Vec<DriveFile>,
    #[serde(default)]
    next_page_token: Option<String>,
}

/// Build the `q` parameter selecting the live children of a folder.
fn children_query(parent_id: &str, name: Option<&str>, folders_only: bool) -> String {
    let mut query = format!("'{}' in parents and trashed = false", escape(parent_id));
    if let Some(name) = name {
        query.push_str(&format!(" and name = '{}'", escape(name)));
    }
    if folders_only {
        query.push_str(&format!(" and mimeType = '{}'", FOLDER_MIME_TYPE));
    }
    query
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Google Drive API client.
pub struct DriveClient {
    http: Client,
    token_manager: Arc<TokenManager>,
}

impl DriveClient {
    /// Create a new Drive client.
    pub fn new(token_manager: Arc<TokenManager>) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("snapsync/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            token_manager,
        })
    }

    async fn auth_header(&self) -> Result<String> {
        let token = self.token_manager.get_access_token().await?;
        Ok(format!("Bearer {}", token))
    }

    /// Create a folder under `parent_id`.
    pub async fn create_folder(&self, name: &str, parent_id: &str) -> Result<DriveFile> {
        let url = format!("{}/files", DRIVE_API_BASE);
        let auth = self.auth_header().await?;

        let metadata = serde_json::json!({
            "name": name,
            "mimeType": FOLDER_MIME_TYPE,
            "parents": [parent_id],
        });

        let response = self
            .http
            .post(&url)
            .header(header::AUTHORIZATION, auth)
            .query(&[("fields", FILE_FIELDS)])
            .json(&metadata)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to create folder: {}", e)))?;

        self.handle_response(response).await
    }

    /// List the live children of a folder, following pagination.
    pub async fn list_children(&self, parent_id: &str, folders_only: bool) -> Result<Vec<DriveFile>> {
        let query = children_query(parent_id, None, folders_only);
        let mut all_files = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let url = format!("{}/files", DRIVE_API_BASE);
            let auth = self.auth_header().await?;

            let mut request = self
                .http
                .get(&url)
                .header(header::AUTHORIZATION, auth)
                .query(&[
                    ("q", query.as_str()),
                    ("fields", LIST_FIELDS),
                    ("pageSize", "1000"),
                ]);

            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token.as_str())]);
            }

            let response = request
                .send()
                .await
                .map_err(|e| Error::Network(format!("Failed to list folder: {}", e)))?;

            let page: FileListResponse = self.handle_response(response).await?;
            all_files.extend(page.files);

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        Ok(all_files)
    }

    /// Find a child of `parent_id` by exact name.
    pub async fn find_child(
        &self,
        name: &str,
        parent_id: &str,
        folders_only: bool,
    ) -> Result<Option<DriveFile>> {
        let url = format!("{}/files", DRIVE_API_BASE);
        let auth = self.auth_header().await?;
        let query = children_query(parent_id, Some(name), folders_only);

        let response = self
            .http
            .get(&url)
            .header(header::AUTHORIZATION, auth)
            .query(&[
                ("q", query.as_str()),
                ("fields", LIST_FIELDS),
                ("pageSize", "1"),
            ])
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to find file: {}", e)))?;

        let page: FileListResponse = self.handle_response(response).await?;
        Ok(page.files.into_iter().next())
    }

    /// Upload a small file in one multipart request.
    pub async fn upload_simple(
        &self,
        name: &str,
        parent_id: &str,
        data: Vec<u8>,
    ) -> Result<DriveFile> {
        let url = format!("{}/files", DRIVE_UPLOAD_BASE);
        let auth = self.auth_header().await?;

        let metadata = serde_json::json!({
            "name": name,
            "parents": [parent_id],
        });
        let boundary = format!("snapsync-{}", uuid::Uuid::new_v4().simple());
        let body = multipart_body(&boundary, &serde_json::to_vec(&metadata)?, &data);

        let response = self
            .http
            .post(&url)
            .header(header::AUTHORIZATION, auth)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/related; boundary={}", boundary),
            )
            .query(&[("uploadType", "multipart"), ("fields", FILE_FIELDS)])
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to upload file: {}", e)))?;

        self.handle_response(response).await
    }

    /// Replace the content of an existing file.
    pub async fn update_file(&self, file_id: &str, data: Vec<u8>) -> Result<DriveFile> {
        let url = format!("{}/files/{}", DRIVE_UPLOAD_BASE, file_id);
        let auth = self.auth_header().await?;

        let response = self
            .http
            .patch(&url)
            .header(header::AUTHORIZATION, auth)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .query(&[("uploadType", "media"), ("fields", FILE_FIELDS)])
            .body(data)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to update file: {}", e)))?;

        self.handle_response(response).await
    }

    /// Open a resumable upload session and return its URI.
    pub async fn start_resumable_upload(
        &self,
        name: &str,
        parent_id: &str,
        total_size: u64,
    ) -> Result<String> {
        let url = format!("{}/files", DRIVE_UPLOAD_BASE);
        let auth = self.auth_header().await?;

        let metadata = serde_json::json!({
            "name": name,
            "parents": [parent_id],
        });

        let response = self
            .http
            .post(&url)
            .header(header::AUTHORIZATION, auth)
            .header("X-Upload-Content-Length", total_size.to_string())
            .query(&[("uploadType", "resumable")])
            .json(&metadata)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to start resumable upload: {}", e)))?;

        if !response.status().is_success() {
            return Err(error_for_status(response).await);
        }

        response
            .headers()
            .get(header::LOCATION)
            .ok_or_else(|| Error::Remote("No upload URI in response".to_string()))?
            .to_str()
            .map(str::to_string)
            .map_err(|e| Error::Remote(format!("Invalid upload URI: {}", e)))
    }

    /// Send one chunk of a resumable upload.
    ///
    /// Returns the file once the final chunk is accepted, `None` while more
    /// bytes are expected.
    pub async fn upload_chunk(
        &self,
        upload_uri: &str,
        data: Vec<u8>,
        start_byte: u64,
        total_size: u64,
    ) -> Result<Option<DriveFile>> {
        let end_byte = start_byte + data.len() as u64 - 1;
        let content_range = format!("bytes {}-{}/{}", start_byte, end_byte, total_size);

        let response = self
            .http
            .put(upload_uri)
            .header(header::CONTENT_LENGTH, data.len().to_string())
            .header(header::CONTENT_RANGE, content_range)
            .body(data)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to upload chunk: {}", e)))?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED => self.handle_response(response).await.map(Some),
            // 308 Resume Incomplete
            StatusCode::PERMANENT_REDIRECT => Ok(None),
            _ => Err(error_for_status(response).await),
        }
    }

    /// Upload a large file from a byte stream using a resumable session.
    pub async fn upload_resumable<S>(
        &self,
        name: &str,
        parent_id: &str,
        stream: S,
        total_size: u64,
    ) -> Result<DriveFile>
    where
        S: Stream<Item = std::io::Result<Bytes>> + Send,
    {
        let upload_uri = self
            .start_resumable_upload(name, parent_id, total_size)
            .await?;

        let mut stream = std::pin::pin!(stream);
        let mut bytes_uploaded = 0u64;
        let mut buffer = Vec::with_capacity(CHUNK_SIZE);

        while let Some(piece) = stream.next().await {
            buffer.extend_from_slice(&piece?);

            while buffer.len() >= CHUNK_SIZE {
                let chunk: Vec<u8> = buffer.drain(..CHUNK_SIZE).collect();
                let len = chunk.len() as u64;
                if let Some(file) = self
                    .upload_chunk(&upload_uri, chunk, bytes_uploaded, total_size)
                    .await?
                {
                    return Ok(file);
                }
                bytes_uploaded += len;
            }
        }

        if !buffer.is_empty() {
            if let Some(file) = self
                .upload_chunk(&upload_uri, buffer, bytes_uploaded, total_size)
                .await?
            {
                return Ok(file);
            }
        }

        Err(Error::Remote(format!("Upload of {} did not complete", name)))
    }

    /// Delete a file or folder (folders take their contents with them).
    pub async fn delete(&self, file_id: &str) -> Result<()> {
        let url = format!("{}/files/{}", DRIVE_API_BASE, file_id);
        let auth = self.auth_header().await?;

        let response = self
            .http
            .delete(&url)
            .header(header::AUTHORIZATION, auth)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to delete file: {}", e)))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(error_for_status(response).await)
        }
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T> {
        if response.status().is_success() {
            response
                .json()
                .await
                .map_err(|e| Error::Remote(format!("Failed to parse response: {}", e)))
        } else {
            Err(error_for_status(response).await)
        }
    }
}

/// Map a failed response to an error variant.
async fn error_for_status(response: reqwest::Response) -> Error {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();

    match status {
        StatusCode::NOT_FOUND => Error::NotFound(format!("Drive resource not found: {}", body)),
        StatusCode::UNAUTHORIZED => Error::Authentication("Invalid or expired token".to_string()),
        StatusCode::FORBIDDEN => Error::PermissionDenied(format!("Access denied: {}", body)),
        s if s == StatusCode::TOO_MANY_REQUESTS || s.is_server_error() => {
            Error::Network(format!("Drive unavailable: {} - {}", s, body))
        }
        s => Error::Remote(format!("API error: {} - {}", s, body)),
    }
}

fn multipart_body(boundary: &str, metadata: &[u8], data: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(metadata.len() + data.len() + 256);

    body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
    body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
    body.extend_from_slice(metadata);
    body.extend_from_slice(b"\r\n");

    body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(data);
    body.extend_from_slice(b"\r\n");

    body.extend_from_slice(format!("--{}--", boundary).as_bytes());
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive_file(mime_type: &str, size: Option<&str>) -> DriveFile {
        DriveFile {
            id: "1".to_string(),
            name: "entry".to_string(),
            mime_type: mime_type.to_string(),
            size: size.map(str::to_string),
            parents: vec![],
        }
    }

    #[test]
    fn test_drive_file_kind_and_size() {
        let folder = drive_file(FOLDER_MIME_TYPE, None);
        assert!(folder.is_folder());
        assert_eq!(folder.size_bytes(), None);

        let file = drive_file("text/plain", Some("12345"));
        assert!(!file.is_folder());
        assert_eq!(file.size_bytes(), Some(12345));
    }

    #[test]
    fn test_drive_file_from_api_json() {
        let json = r#"{"id":"abc","name":"a.txt","mimeType":"text/plain","size":"3"}"#;
        let file: DriveFile = serde_json::from_str(json).unwrap();
        assert_eq!(file.id, "abc");
        assert!(file.parents.is_empty());
    }

    #[test]
    fn test_children_query_escapes_names() {
        let query = children_query("p1", Some("it's"), true);
        assert_eq!(
            query,
            "'p1' in parents and trashed = false and name = 'it\\'s' and mimeType = 'application/vnd.google-apps.folder'"
        );
        assert_eq!(
            children_query("p1", None, false),
            "'p1' in parents and trashed = false"
        );
    }

    #[test]
    fn test_multipart_body_layout() {
        let body = multipart_body("B", b"{}", b"data");
        let text = String::from_utf8(body).unwrap();
        assert!(text.starts_with("--B\r\n"));
        assert!(text.contains("\r\n\r\n{}\r\n--B\r\n"));
        assert!(text.ends_with("data\r\n--B--"));
    }
}
