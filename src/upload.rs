//! Client side of the two-step upload protocol.
//!
//! 1. `POST {api}/presigned` returns a short-lived credential:
//!    `{"message": "...", "url": "...", "fields": {...}}`.
//! 2. A multipart form `POST` to `url` carrying every returned field, then
//!    the document under the field name `file`.
//!
//! The credential pins the content type to `application/pdf`; storage
//! rejects anything else. A non-2xx answer in step 1 surfaces the issuer's
//! `message`; a non-2xx answer in step 2 surfaces as "Failed to upload file".

use crate::error::PipelineError;
use crate::event::PDF_CONTENT_TYPE;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

/// Field name the storage endpoint expects the document under.
pub const FILE_FIELD: &str = "file";

/// A short-lived upload credential.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadCredential {
    #[serde(default)]
    pub message: String,
    pub url: String,
    /// Form fields to send verbatim before the file.
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl UploadCredential {
    /// The object key the upload will land under. `${filename}` is replaced
    /// by storage with the uploaded file's name.
    pub fn object_key(&self, file_name: &str) -> Option<String> {
        self.fields
            .get("key")
            .map(|k| k.replace("${filename}", file_name))
    }
}

pub struct UploadClient {
    client: reqwest::Client,
    api_url: String,
}

impl UploadClient {
    pub fn new(api_url: impl Into<String>) -> Result<Self, PipelineError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("edgequake-pdfvision/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PipelineError::InvalidConfig(format!("HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn credential_endpoint(&self) -> String {
        format!("{}/presigned", self.api_url)
    }

    /// Step 1: ask the issuer for a credential.
    pub async fn request_credential(&self) -> Result<UploadCredential, PipelineError> {
        let url = self.credential_endpoint();
        let response = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| PipelineError::Http {
                url: url.clone(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| PipelineError::Http {
            url: url.clone(),
            reason: e.to_string(),
        })?;

        if !status.is_success() {
            return Err(PipelineError::CredentialRejected {
                status: status.as_u16(),
                message: issuer_message(&body, status.as_u16()),
            });
        }

        let credential: UploadCredential =
            serde_json::from_str(&body).map_err(|e| PipelineError::Http {
                url,
                reason: format!("malformed credential: {e}"),
            })?;
        debug!("Credential issued for {}", credential.url);
        Ok(credential)
    }

    /// Step 2: post the document with the credential's fields.
    pub async fn upload(
        &self,
        credential: &UploadCredential,
        file_name: &str,
        bytes: Vec<u8>,
    ) -> Result<(), PipelineError> {
        let mut form = Form::new();
        for (name, value) in form_fields(credential) {
            form = form.text(name, value);
        }
        let part = Part::bytes(bytes)
            .file_name(file_name.to_string())
            .mime_str(PDF_CONTENT_TYPE)
            .map_err(|e| PipelineError::Internal(format!("invalid MIME type: {e}")))?;
        form = form.part(FILE_FIELD, part);

        let response = self
            .client
            .post(&credential.url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| PipelineError::Http {
                url: credential.url.clone(),
                reason: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(PipelineError::UploadFailed {
                status: response.status().as_u16(),
            });
        }
        Ok(())
    }

    /// Both steps for a local file. Returns the object key when the
    /// credential names one.
    pub async fn upload_file(&self, path: &Path) -> Result<Option<String>, PipelineError> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| PipelineError::InvalidConfig(format!("'{}' has no file name", path.display())))?
            .to_string();
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| PipelineError::Internal(format!("cannot read '{}': {e}", path.display())))?;

        let credential = self.request_credential().await?;
        self.upload(&credential, &file_name, bytes).await?;

        let key = credential.object_key(&file_name);
        info!(
            "Uploaded '{}' as {}",
            path.display(),
            key.as_deref().unwrap_or(&file_name)
        );
        Ok(key)
    }
}

/// Text fields in send order. The file part always follows them.
pub fn form_fields(credential: &UploadCredential) -> Vec<(String, String)> {
    credential
        .fields
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn issuer_message(body: &str, status: u16) -> String {
    serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| format!("Credential request failed with status {status}"))
}
