//! Thin HTTP client for the S3-compatible blob store. Upload and delete only;
//! a non-success status is fatal to the caller, except a delete hitting 404,
//! which counts as already absent.

use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob store url is empty")]
    EmptyBaseUrl,
    #[error("blob request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("blob {action} returned status {status}")]
    UnexpectedStatus {
        action: &'static str,
        status: StatusCode,
    },
}

#[derive(Clone)]
pub struct BlobClient {
    base_url: String,
    api_key: Option<String>,
    http: reqwest::Client,
}

impl BlobClient {
    pub fn new(base_url: String, api_key: Option<String>) -> Result<Self, BlobError> {
        let trimmed = base_url.trim();
        if trimmed.is_empty() {
            return Err(BlobError::EmptyBaseUrl);
        }
        Ok(Self {
            base_url: trimmed.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|value| !value.trim().is_empty()),
            http: reqwest::Client::new(),
        })
    }

    pub async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<(), BlobError> {
        let response = self
            .request(Method::PUT, bucket, key)
            .header(CONTENT_TYPE, content_type)
            .header(CONTENT_LENGTH, bytes.len())
            .body(bytes)
            .send()
            .await?;
        ensure_success("upload", response)
    }

    pub async fn delete_object(&self, bucket: &str, key: &str) -> Result<(), BlobError> {
        let response = self
            .request(Method::DELETE, bucket, key)
            .header(CONTENT_LENGTH, 0)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        ensure_success("delete", response)
    }

    pub fn object_url(&self, bucket: &str, key: &str) -> String {
        object_url(&self.base_url, bucket, key)
    }

    fn request(&self, method: Method, bucket: &str, key: &str) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, self.object_url(bucket, key));
        if let Some(api_key) = &self.api_key {
            builder.bearer_auth(api_key)
        } else {
            builder
        }
    }
}

/// Object addressing: when the endpoint host is virtual-hosted per bucket
/// (host begins with `bucket.`) the object path is the key alone, otherwise
/// `bucket/key`.
pub fn object_url(base_url: &str, bucket: &str, key: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let virtual_hosted = host_of(base)
        .to_lowercase()
        .starts_with(&format!("{}.", bucket.to_lowercase()));
    if virtual_hosted {
        format!("{base}/{key}")
    } else {
        format!("{base}/{bucket}/{key}")
    }
}

fn host_of(url: &str) -> &str {
    let rest = url.split_once("://").map(|(_, rest)| rest).unwrap_or(url);
    let host_port = rest.split('/').next().unwrap_or(rest);
    host_port.split(':').next().unwrap_or(host_port)
}

fn ensure_success(action: &'static str, response: reqwest::Response) -> Result<(), BlobError> {
    let status = response.status();
    if status.is_success() {
        Ok(())
    } else {
        Err(BlobError::UnexpectedStatus { action, status })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_url_uses_path_style_by_default() {
        assert_eq!(
            object_url("https://storage.example.com", "nm-media", "avatars/u1/f1"),
            "https://storage.example.com/nm-media/avatars/u1/f1"
        );
    }

    #[test]
    fn object_url_detects_virtual_hosted_buckets() {
        assert_eq!(
            object_url("https://nm-media.storage.example.com/", "nm-media", "avatars/u1/f1"),
            "https://nm-media.storage.example.com/avatars/u1/f1"
        );
        assert_eq!(
            object_url("https://NM-Media.storage.example.com", "nm-media", "k"),
            "https://NM-Media.storage.example.com/k"
        );
    }

    #[test]
    fn object_url_ignores_ports_when_matching_hosts() {
        assert_eq!(
            object_url("http://nm-media.localhost:9000", "nm-media", "k"),
            "http://nm-media.localhost:9000/k"
        );
        assert_eq!(
            object_url("http://localhost:9000", "nm-media", "k"),
            "http://localhost:9000/nm-media/k"
        );
    }

    #[test]
    fn client_rejects_blank_base_url() {
        assert!(BlobClient::new("   ".to_string(), None).is_err());
        assert!(BlobClient::new("http://blob:9000/".to_string(), None).is_ok());
    }
}
