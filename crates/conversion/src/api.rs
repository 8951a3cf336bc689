//! REST client for the conversion endpoints.
//!
//! Wraps the backend's upload-for-conversion and converted-file download
//! endpoints using [`reqwest`].

use bitzomax_core::error::CoreError;
use bitzomax_core::naming::converted_file_url;
use serde::Deserialize;

/// HTTP client for the conversion backend.
#[derive(Clone)]
pub struct ConversionApi {
    client: reqwest::Client,
    api_url: String,
    token: Option<String>,
}

/// A media file to upload for conversion.
#[derive(Debug, Clone)]
pub struct MediaUpload {
    pub file_name: String,
    pub bytes: Vec<u8>,
    /// MIME type, e.g. `video/mp4`. Left to the server when `None`.
    pub content_type: Option<String>,
}

impl MediaUpload {
    pub fn new(file_name: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            bytes,
            content_type: None,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// Response from `POST /admin/files/convert-to-webm`.
///
/// Every field is optional; the backend omits what it does not know.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionResponse {
    #[serde(default)]
    pub file_name: Option<String>,
    /// Server-assigned job id; may differ from the one sent.
    #[serde(default)]
    pub file_id: Option<String>,
    #[serde(default)]
    pub file_download_uri: Option<String>,
    #[serde(default)]
    pub file_type: Option<String>,
    #[serde(default)]
    pub size: Option<String>,
}

/// Errors from the conversion REST layer.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The backend returned a non-2xx status code.
    #[error("{message}")]
    Api { status: u16, message: String },

    #[error(transparent)]
    Url(#[from] CoreError),
}

#[derive(Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

impl ConversionApi {
    /// * `api_url` - Base API URL, e.g. `http://host:8080/api`.
    pub fn new(api_url: String) -> Self {
        Self::with_client(reqwest::Client::new(), api_url)
    }

    /// Reuse an existing [`reqwest::Client`] for connection pooling.
    pub fn with_client(client: reqwest::Client, api_url: String) -> Self {
        Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            token: None,
        }
    }

    /// Send `Authorization: Bearer <token>` with every request.
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|t| !t.is_empty());
        self
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Upload a file for WebM conversion under the client's `file_id`.
    ///
    /// Sends a multipart `POST {api_url}/admin/files/convert-to-webm` with
    /// the `file` and `fileId` fields.
    pub async fn convert_to_webm(
        &self,
        upload: MediaUpload,
        file_id: &str,
    ) -> Result<ConversionResponse, ApiError> {
        let mut part = reqwest::multipart::Part::bytes(upload.bytes).file_name(upload.file_name);
        if let Some(content_type) = &upload.content_type {
            part = part.mime_str(content_type)?;
        }
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("fileId", file_id.to_string());

        let request = self
            .client
            .post(format!("{}/admin/files/convert-to-webm", self.api_url))
            .multipart(form);
        let response = self.authorize(request).send().await?;

        Self::parse_response(response).await
    }

    /// Download URL of a converted file.
    pub fn converted_file_url(&self, file_name: &str) -> Result<String, ApiError> {
        Ok(converted_file_url(&self.api_url, file_name)?)
    }

    /// Fetch the bytes of a converted file.
    pub async fn download_converted(&self, file_name: &str) -> Result<Vec<u8>, ApiError> {
        let mut request = self.client.get(self.converted_file_url(file_name)?);
        if let Some(token) = &self.token {
            request = request.query(&[("token", token)]);
        }
        let response = self.authorize(request).send().await?;
        let response = Self::ensure_success(response).await?;
        Ok(response.bytes().await?.to_vec())
    }

    // ---- private helpers ----

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    /// Ensure the response has a success status code. On failure the
    /// error carries the JSON `message` field when the body has one.
    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorBody>(&body)
                .ok()
                .and_then(|b| b.message)
                .filter(|m| !m.is_empty())
                .unwrap_or_else(|| format!("HTTP error {}", status.as_u16()));
            return Err(ApiError::Api {
                status: status.as_u16(),
                message,
            });
        }
        Ok(response)
    }

    async fn parse_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ApiError> {
        let response = Self::ensure_success(response).await?;
        Ok(response.json::<T>().await?)
    }
}
