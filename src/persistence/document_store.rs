//! Cloud document store access
//!
//! Documents are JSON objects addressed by `(collection, id)`. The HTTP
//! store talks to a small REST document service:
//!
//! - `POST {endpoint}/auth/anonymous` -> `{"token": "..."}`
//! - `GET {endpoint}/{collection}` -> `{"documents": [{"id": "...", "data": {...}}]}`
//! - `GET | PUT | DELETE {endpoint}/{collection}/{id}`

use super::BackendError;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Authenticate; must succeed before any other call
    async fn sign_in(&self) -> Result<(), BackendError>;

    /// Every document in a collection as (id, data)
    async fn list(&self, collection: &str) -> Result<Vec<(String, Value)>, BackendError>;

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, BackendError>;

    /// Create or fully replace a document
    async fn put(&self, collection: &str, id: &str, data: &Value) -> Result<(), BackendError>;

    /// Deleting a missing document is not an error
    async fn delete(&self, collection: &str, id: &str) -> Result<(), BackendError>;
}

#[derive(Deserialize)]
struct SignInResponse {
    token: String,
}

#[derive(Deserialize)]
struct ListResponse {
    #[serde(default)]
    documents: Vec<DocumentEntry>,
}

#[derive(Deserialize)]
struct DocumentEntry {
    id: String,
    #[serde(default)]
    data: Value,
}

pub struct HttpDocumentStore {
    client: Client,
    endpoint: url::Url,
    api_key: Option<String>,
    token: RwLock<Option<String>>,
}

impl HttpDocumentStore {
    pub fn new(endpoint: &str, api_key: Option<&str>, timeout: Duration) -> Result<Self, BackendError> {
        let mut endpoint = url::Url::parse(endpoint)
            .map_err(|e| BackendError::Transport(format!("bad endpoint {:?}: {}", endpoint, e)))?;
        if !endpoint.path().ends_with('/') {
            let path = format!("{}/", endpoint.path());
            endpoint.set_path(&path);
        }
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            endpoint,
            api_key: api_key.filter(|k| !k.is_empty()).map(str::to_string),
            token: RwLock::new(None),
        })
    }

    /// Join path segments onto the endpoint, percent-encoding each one
    pub fn document_url(&self, segments: &[&str]) -> Result<url::Url, BackendError> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| BackendError::Transport("endpoint cannot be a base URL".into()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder, BackendError> {
        let token = self.token.read().await.clone();
        let Some(token) = token else {
            return Err(BackendError::Auth("not signed in".into()));
        };
        Ok(request.bearer_auth(token))
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, BackendError> {
        let response = self
            .authorized(request)
            .await?
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        Self::check(response).await
    }

    async fn check(response: Response) -> Result<Response, BackendError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => BackendError::Auth(body),
            StatusCode::NOT_FOUND => BackendError::NotFound(body),
            _ => BackendError::Transport(format!("HTTP {}: {}", status.as_u16(), body)),
        })
    }
}

#[async_trait]
impl DocumentStore for HttpDocumentStore {
    async fn sign_in(&self) -> Result<(), BackendError> {
        let url = self.document_url(&["auth", "anonymous"])?;
        debug!("POST {}", url);
        let mut request = self.client.post(url);
        if let Some(key) = &self.api_key {
            request = request.header("x-api-key", key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        let body: SignInResponse = Self::check(response)
            .await?
            .json()
            .await
            .map_err(|e| BackendError::Data(e.to_string()))?;
        *self.token.write().await = Some(body.token);
        Ok(())
    }

    async fn list(&self, collection: &str) -> Result<Vec<(String, Value)>, BackendError> {
        let url = self.document_url(&[collection])?;
        debug!("GET {}", url);
        let listing: ListResponse = match self.send(self.client.get(url)).await {
            Ok(response) => response
                .json()
                .await
                .map_err(|e| BackendError::Data(e.to_string()))?,
            // A collection that was never written
            Err(BackendError::NotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        Ok(listing
            .documents
            .into_iter()
            .map(|doc| (doc.id, doc.data))
            .collect())
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, BackendError> {
        let url = self.document_url(&[collection, id])?;
        debug!("GET {}", url);
        match self.send(self.client.get(url)).await {
            Ok(response) => response
                .json()
                .await
                .map(Some)
                .map_err(|e| BackendError::Data(e.to_string())),
            Err(BackendError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn put(&self, collection: &str, id: &str, data: &Value) -> Result<(), BackendError> {
        let url = self.document_url(&[collection, id])?;
        debug!("PUT {}", url);
        self.send(self.client.put(url).json(data)).await?;
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), BackendError> {
        let url = self.document_url(&[collection, id])?;
        debug!("DELETE {}", url);
        match self.send(self.client.delete(url)).await {
            Ok(_) | Err(BackendError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// In-process store with switchable failures
#[cfg(test)]
pub struct MemoryDocumentStore {
    docs: std::sync::Mutex<std::collections::BTreeMap<(String, String), Value>>,
    reject_sign_in: std::sync::atomic::AtomicBool,
    fail_writes: std::sync::atomic::AtomicBool,
    fail_reads: std::sync::atomic::AtomicBool,
}

#[cfg(test)]
impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self {
            docs: Default::default(),
            reject_sign_in: Default::default(),
            fail_writes: Default::default(),
            fail_reads: Default::default(),
        }
    }

    pub fn reject_sign_in(&self, on: bool) {
        self.reject_sign_in.store(on, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn fail_writes(&self, on: bool) {
        self.fail_writes.store(on, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn fail_reads(&self, on: bool) {
        self.fail_reads.store(on, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn ids(&self, collection: &str) -> Vec<String> {
        self.docs
            .lock()
            .unwrap()
            .keys()
            .filter(|(c, _)| c == collection)
            .map(|(_, id)| id.clone())
            .collect()
    }

    fn check(&self, flag: &std::sync::atomic::AtomicBool) -> Result<(), BackendError> {
        if flag.load(std::sync::atomic::Ordering::SeqCst) {
            Err(BackendError::Transport("offline".into()))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn sign_in(&self) -> Result<(), BackendError> {
        if self.reject_sign_in.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(BackendError::Auth("anonymous sign-in disabled".into()));
        }
        Ok(())
    }

    async fn list(&self, collection: &str) -> Result<Vec<(String, Value)>, BackendError> {
        self.check(&self.fail_reads)?;
        Ok(self
            .docs
            .lock()
            .unwrap()
            .iter()
            .filter(|((c, _), _)| c == collection)
            .map(|((_, id), data)| (id.clone(), data.clone()))
            .collect())
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, BackendError> {
        self.check(&self.fail_reads)?;
        Ok(self
            .docs
            .lock()
            .unwrap()
            .get(&(collection.to_string(), id.to_string()))
            .cloned())
    }

    async fn put(&self, collection: &str, id: &str, data: &Value) -> Result<(), BackendError> {
        self.check(&self.fail_writes)?;
        self.docs
            .lock()
            .unwrap()
            .insert((collection.to_string(), id.to_string()), data.clone());
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), BackendError> {
        self.check(&self.fail_writes)?;
        self.docs
            .lock()
            .unwrap()
            .remove(&(collection.to_string(), id.to_string()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_url_encodes_segments() {
        let store =
            HttpDocumentStore::new("https://docs.example.com/v1", None, Duration::from_secs(1)).unwrap();
        assert_eq!(
            store.document_url(&["widgets", "sensor.front_door"]).unwrap().as_str(),
            "https://docs.example.com/v1/widgets/sensor.front_door"
        );
        assert_eq!(
            store.document_url(&["widgets", "a/b"]).unwrap().as_str(),
            "https://docs.example.com/v1/widgets/a%2Fb"
        );
        assert!(HttpDocumentStore::new("not a url", None, Duration::from_secs(1)).is_err());
    }

    #[tokio::test]
    async fn test_requests_need_sign_in() {
        let store =
            HttpDocumentStore::new("http://127.0.0.1:9/", Some(""), Duration::from_millis(50)).unwrap();
        assert!(store.api_key.is_none());
        let err = store.get("widgets", "x").await.unwrap_err();
        assert!(err.is_auth());
    }

    #[tokio::test]
    async fn test_memory_store_failures() {
        let store = MemoryDocumentStore::new();
        store.put("widgets", "a", &serde_json::json!({})).await.unwrap();
        store.fail_writes(true);
        assert!(store.put("widgets", "b", &serde_json::json!({})).await.is_err());
        assert_eq!(store.ids("widgets"), vec!["a".to_string()]);
    }
}
