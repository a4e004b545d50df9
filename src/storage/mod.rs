use std::future::Future;
use std::time::Duration;

use reqwest::{header, Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::utils::error::StorageError;

/// An object store held in process memory.
pub mod memory;

/// Metadata stored next to an object.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub content_type: Option<String>,
    pub filename: Option<String>,
}

/// Describes the key-value blob store that replay files live in.
///
/// Keys are hierarchical strings separated by `/`. There is no rename: moving an object is a copy
/// followed by a separate delete of the source.
#[allow(async_fn_in_trait)]
pub trait ObjectStore {
    /// Stores `bytes` under `key`, replacing whatever was there.
    async fn upload(
        &self,
        key: &str,
        bytes: Vec<u8>,
        metadata: &ObjectMetadata,
    ) -> Result<(), StorageError>;

    /// Retrieves the bytes stored under `key`.
    async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Copies the object under `source` to `destination`, leaving the source in place.
    async fn copy(&self, source: &str, destination: &str) -> Result<(), StorageError>;

    /// Deletes the object under `key`. Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// Checks whether an object exists under `key`.
    async fn exists(&self, key: &str) -> Result<bool, StorageError>;
}

/// Runs an object store call with an upper bound on its duration.
///
/// A call that runs out of time counts as failed, never as done.
pub async fn bounded<T, F>(after: Duration, key: &str, call: F) -> Result<T, StorageError>
where
    F: Future<Output = Result<T, StorageError>>,
{
    match tokio::time::timeout(after, call).await {
        Ok(result) => result,
        Err(_) => Err(StorageError::Timeout {
            key: key.to_string(),
            after,
        }),
    }
}

/// The object store endpoint to send requests to.
#[derive(Debug, Clone)]
pub struct Endpoint {
    url: String,
}

impl Endpoint {
    pub fn new(url: impl Into<String>) -> Self {
        let mut url = url.into();
        if !url.ends_with('/') {
            url.push('/');
        }
        Self { url }
    }

    /// The URL of an object. Each segment of the key is percent-encoded on its own so the key's
    /// hierarchy survives.
    pub fn object_url(&self, key: &str) -> String {
        let path: Vec<String> = key
            .split('/')
            .map(|segment| urlencoding::encode(segment).into_owned())
            .collect();
        let mut full_url = self.url.clone();
        full_url.push_str(&path.join("/"));
        full_url
    }
}

/// An object store reachable over plain HTTP: `PUT`, `GET`, `HEAD` and `DELETE` on
/// `{endpoint}/{key}`, authenticated with a bearer token.
#[derive(Debug, Clone)]
pub struct HttpObjectStore {
    /// The reqwest client used to make HTTP requests to the store.
    client: Client,
    endpoint: Endpoint,
    token: Option<String>,
}

impl HttpObjectStore {
    pub fn new(endpoint: Endpoint, token: Option<String>) -> Self {
        Self {
            client: Client::new(),
            endpoint,
            token,
        }
    }

    fn request(&self, method: reqwest::Method, key: &str) -> reqwest::RequestBuilder {
        let builder = self.client.request(method, self.endpoint.object_url(key));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn fetch(&self, key: &str) -> Result<(Vec<u8>, ObjectMetadata), StorageError> {
        let response = check(self.request(reqwest::Method::GET, key).send().await?, key)?;
        let metadata = ObjectMetadata {
            content_type: header_value(&response, header::CONTENT_TYPE),
            filename: header_value(&response, header::CONTENT_DISPOSITION)
                .and_then(|value| disposition_filename(&value)),
        };
        let bytes = response.bytes().await?.to_vec();
        Ok((bytes, metadata))
    }
}

/// Maps the status of a store response onto the storage error taxonomy.
fn check(response: Response, key: &str) -> Result<Response, StorageError> {
    match response.status() {
        status if status.is_success() => Ok(response),
        StatusCode::NOT_FOUND => Err(StorageError::NotFound(key.to_string())),
        status => Err(StorageError::Status {
            status,
            key: key.to_string(),
        }),
    }
}

fn header_value(response: &Response, name: header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn disposition_filename(value: &str) -> Option<String> {
    value
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix("filename="))
        .map(|name| name.trim_matches('"').to_string())
}

impl ObjectStore for HttpObjectStore {
    async fn upload(
        &self,
        key: &str,
        bytes: Vec<u8>,
        metadata: &ObjectMetadata,
    ) -> Result<(), StorageError> {
        let mut request = self.request(reqwest::Method::PUT, key).body(bytes);
        if let Some(content_type) = &metadata.content_type {
            request = request.header(header::CONTENT_TYPE, content_type);
        }
        if let Some(filename) = &metadata.filename {
            request = request.header(
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", filename),
            );
        }
        check(request.send().await?, key)?;
        debug!("Uploaded object {}", key);
        Ok(())
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        Ok(self.fetch(key).await?.0)
    }

    async fn copy(&self, source: &str, destination: &str) -> Result<(), StorageError> {
        let (bytes, metadata) = self.fetch(source).await?;
        self.upload(destination, bytes, &metadata).await?;
        debug!("Copied object {} to {}", source, destination);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        match check(self.request(reqwest::Method::DELETE, key).send().await?, key) {
            Ok(_) | Err(StorageError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        match check(self.request(reqwest::Method::HEAD, key).send().await?, key) {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_url_keeps_hierarchy() {
        let endpoint = Endpoint::new("https://files.example.org/bucket");
        assert_eq!(
            endpoint.object_url("replays/match_4/game 1.aoe2record"),
            "https://files.example.org/bucket/replays/match_4/game%201.aoe2record"
        );
    }

    #[test]
    fn filename_is_read_from_disposition() {
        assert_eq!(
            disposition_filename("attachment; filename=\"final.aoe2record\""),
            Some("final.aoe2record".to_string())
        );
        assert_eq!(disposition_filename("inline"), None);
    }

    #[tokio::test]
    async fn slow_calls_time_out() {
        let result: Result<(), StorageError> = bounded(Duration::from_millis(10), "temp/x", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        assert!(matches!(result, Err(StorageError::Timeout { .. })));
    }
}
