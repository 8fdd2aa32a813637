use std::path::Path;

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::Client;
use shared::protocol::ClientPush;
use url::Url;

use crate::error::AttachmentError;

const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPayload {
    pub file_name: String,
    pub mime_type: String,
    pub size_bytes: u64,
    pub data_b64: String,
}

impl EncodedPayload {
    pub fn decode_bytes(&self) -> Result<Vec<u8>, AttachmentError> {
        STANDARD
            .decode(self.data_b64.as_bytes())
            .map_err(|err| AttachmentError::InvalidEncoding(err.to_string()))
    }

    pub fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data_b64)
    }

    pub fn to_push(&self) -> ClientPush {
        ClientPush::FileMessage {
            file_data: self.data_b64.clone(),
            file_name: self.file_name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResourceRef {
    Remote(Url),
    Relative(String),
    Inline { mime_type: String, bytes: Vec<u8> },
    Opaque(String),
}

#[derive(Debug, Clone)]
pub struct AttachmentCodec {
    max_bytes: u64,
}

impl AttachmentCodec {
    pub fn new(max_bytes: u64) -> Self {
        Self { max_bytes }
    }

    pub async fn encode(&self, path: impl AsRef<Path>) -> Result<EncodedPayload, AttachmentError> {
        let path = path.as_ref();
        let unreadable = |source| AttachmentError::UnreadableFile {
            path: path.to_path_buf(),
            source,
        };
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| {
                unreadable(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    "path has no file name",
                ))
            })?;

        let metadata = tokio::fs::metadata(path).await.map_err(unreadable)?;
        self.check_size(&file_name, metadata.len())?;
        let bytes = tokio::fs::read(path).await.map_err(unreadable)?;
        self.encode_bytes(file_name, &bytes)
    }

    pub fn encode_bytes(
        &self,
        file_name: impl Into<String>,
        bytes: &[u8],
    ) -> Result<EncodedPayload, AttachmentError> {
        let file_name = file_name.into();
        self.check_size(&file_name, bytes.len() as u64)?;
        let mime_type = mime_guess::from_path(&file_name)
            .first_raw()
            .unwrap_or(DEFAULT_MIME_TYPE)
            .to_string();
        Ok(EncodedPayload {
            file_name,
            mime_type,
            size_bytes: bytes.len() as u64,
            data_b64: STANDARD.encode(bytes),
        })
    }

    /// Maps a confirmed attachment URL to a displayable resource. Never fails:
    /// anything unrecognised is carried through as [`ResourceRef::Opaque`].
    pub fn decode(confirmed_url: &str) -> ResourceRef {
        let trimmed = confirmed_url.trim();
        if trimmed.is_empty() {
            return ResourceRef::Opaque(confirmed_url.to_string());
        }
        if let Some(rest) = trimmed.strip_prefix("data:") {
            return parse_data_url(rest).unwrap_or_else(|| ResourceRef::Opaque(trimmed.to_string()));
        }
        match Url::parse(trimmed) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => ResourceRef::Remote(url),
            Ok(_) => ResourceRef::Opaque(trimmed.to_string()),
            Err(url::ParseError::RelativeUrlWithoutBase) => {
                ResourceRef::Relative(trimmed.to_string())
            }
            Err(_) => ResourceRef::Opaque(trimmed.to_string()),
        }
    }

    fn check_size(&self, file_name: &str, size: u64) -> Result<(), AttachmentError> {
        if size > self.max_bytes {
            return Err(AttachmentError::TooLarge {
                file_name: file_name.to_string(),
                size,
                limit: self.max_bytes,
            });
        }
        Ok(())
    }
}

fn parse_data_url(rest: &str) -> Option<ResourceRef> {
    let (header, data) = rest.split_once(',')?;
    let mime_type = header.strip_suffix(";base64")?;
    let bytes = STANDARD.decode(data.as_bytes()).ok()?;
    let mime_type = if mime_type.is_empty() {
        DEFAULT_MIME_TYPE.to_string()
    } else {
        mime_type.to_string()
    };
    Some(ResourceRef::Inline { mime_type, bytes })
}

pub struct AttachmentFetcher {
    http: Client,
    base_url: Option<Url>,
}

impl AttachmentFetcher {
    pub fn new(server_url: &str) -> Self {
        Self {
            http: Client::new(),
            base_url: http_base_url(server_url),
        }
    }

    pub async fn fetch(&self, resource: &ResourceRef) -> Result<Vec<u8>> {
        let url = match resource {
            ResourceRef::Inline { bytes, .. } => return Ok(bytes.clone()),
            ResourceRef::Remote(url) => url.clone(),
            ResourceRef::Relative(path) => {
                let base = self
                    .base_url
                    .as_ref()
                    .ok_or_else(|| anyhow!("no server base url to resolve {path}"))?;
                base.join(path)
                    .with_context(|| format!("invalid attachment path: {path}"))?
            }
            ResourceRef::Opaque(raw) => return Err(anyhow!("unsupported attachment url: {raw}")),
        };

        let bytes = self
            .http
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("failed to fetch attachment {url}"))?
            .error_for_status()?
            .bytes()
            .await?;
        Ok(bytes.to_vec())
    }
}

fn http_base_url(server_url: &str) -> Option<Url> {
    let mut url = Url::parse(server_url).ok()?;
    let scheme = match url.scheme() {
        "ws" | "http" => "http",
        "wss" | "https" => "https",
        _ => return None,
    };
    url.set_scheme(scheme).ok()?;
    url.set_path("/");
    url.set_query(None);
    Some(url)
}

#[cfg(test)]
#[path = "tests/attachment_tests.rs"]
mod tests;
