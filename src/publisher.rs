use reqwest::{
    Client,
    multipart::{Form, Part},
};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("upload request failed: {0}")]
    Request(String),
    #[error("upload rejected with HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unexpected upload response: {0}")]
    Malformed(String),
}

/// Anonymous file host client. One POST per artifact, no retries.
#[derive(Clone)]
pub struct Publisher {
    client: Client,
    endpoint: String,
    url_prefix: String,
}

impl Publisher {
    pub fn new(client: Client, endpoint: impl Into<String>, url_prefix: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            url_prefix: url_prefix.into(),
        }
    }

    pub async fn publish(&self, bytes: Vec<u8>, filename: &str) -> Result<String, UploadError> {
        let size = bytes.len();
        let part = Part::bytes(bytes)
            .file_name(filename.to_string())
            .mime_str("image/png")
            .map_err(|err| UploadError::Request(err.to_string()))?;
        let form = Form::new()
            .text("reqtype", "fileupload")
            .part("fileToUpload", part);

        let response = self
            .client
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(|err| UploadError::Request(err.to_string()))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| UploadError::Request(err.to_string()))?;

        if status.as_u16() != 200 {
            return Err(UploadError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let url = body.trim();
        if !url.starts_with(&self.url_prefix) {
            return Err(UploadError::Malformed(body));
        }
        info!(target = "sorteio.publisher", %filename, bytes = size, %url, "artifact published");
        Ok(url.to_string())
    }
}
