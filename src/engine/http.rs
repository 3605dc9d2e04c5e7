//! reqwest-backed [`Engine`] talking to the engine's dynamic volume REST API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use super::{Engine, EngineError, NewVolume, StorageServerInterface, Volume};

/// Base URL used when none is configured.
pub const DEFAULT_ENGINE_URL: &str = "https://engine.anexia-it.com";

const VOLUMES_PATH: &str = "/api/dynamic_volume/v1/volumes.json";
const STORAGE_SERVER_INTERFACES_PATH: &str =
    "/api/dynamic_volume/v1/storage_server_interfaces.json";
const LIST_PAGE_LIMIT: u32 = 100;

/// Connection settings for [`HttpEngine`].
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub url: String,
    pub token: String,
    /// Per-request timeout; the create deadline is enforced separately.
    pub request_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_ENGINE_URL.to_string(),
            token: String::new(),
            request_timeout: Duration::from_secs(30),
        }
    }
}

pub struct HttpEngine {
    client: reqwest::Client,
    base_url: Url,
    token: String,
}

/// Responses of list endpoints: either paged or a bare array.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ListResponse<T> {
    Bare(Vec<T>),
    Paged(Page<T>),
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    #[serde(default)]
    page: u32,
    #[serde(default)]
    total_pages: u32,
    #[serde(default = "Vec::new")]
    data: Vec<T>,
}

#[derive(Debug, Serialize)]
struct SizeUpdate<'a> {
    identifier: &'a str,
    size: i64,
}

impl HttpEngine {
    pub fn new(config: &EngineConfig) -> Result<Self, EngineError> {
        let base_url = Url::parse(&config.url)?;
        let client = reqwest::Client::builder()
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            client,
            base_url,
            token: config.token.clone(),
        })
    }

    fn collection_url(&self, path: &str) -> Result<Url, EngineError> {
        Ok(self.base_url.join(path)?)
    }

    fn resource_url(&self, path: &str, identifier: &str) -> Result<Url, EngineError> {
        let mut url = self.collection_url(path)?;
        url.path_segments_mut()
            .map_err(|()| url::ParseError::RelativeUrlWithCannotBeABaseBase)?
            .push(identifier);
        Ok(url)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, EngineError> {
        let response = request
            .header(AUTHORIZATION, format!("Token {}", self.token))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = match body.trim() {
            "" => status.canonical_reason().unwrap_or("no response body").to_string(),
            trimmed => trimmed.to_string(),
        };
        Err(EngineError::Http {
            status: status.as_u16(),
            message,
        })
    }

    async fn fetch<T: DeserializeOwned>(&self, url: Url) -> Result<T, EngineError> {
        let response = self.send(self.client.get(url)).await?;
        Ok(response.json().await?)
    }
}

/// Value of the `filters` query parameter selecting resources by name.
fn name_filter(name: &str) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .append_pair("name", name)
        .finish()
}

#[async_trait]
impl Engine for HttpEngine {
    async fn create_volume(&self, volume: &NewVolume) -> Result<Volume, EngineError> {
        let url = self.collection_url(VOLUMES_PATH)?;
        debug!(name = %volume.name, size = volume.size_bytes, "engine: create volume");
        let response = self.send(self.client.post(url).json(volume)).await?;
        Ok(response.json().await?)
    }

    async fn get_volume(&self, identifier: &str) -> Result<Volume, EngineError> {
        self.fetch(self.resource_url(VOLUMES_PATH, identifier)?).await
    }

    async fn update_volume_size(
        &self,
        identifier: &str,
        size_bytes: i64,
    ) -> Result<(), EngineError> {
        let url = self.resource_url(VOLUMES_PATH, identifier)?;
        debug!(identifier, size = size_bytes, "engine: update volume");
        let body = SizeUpdate {
            identifier,
            size: size_bytes,
        };
        self.send(self.client.put(url).json(&body)).await?;
        Ok(())
    }

    async fn destroy_volume(&self, identifier: &str) -> Result<(), EngineError> {
        let url = self.resource_url(VOLUMES_PATH, identifier)?;
        debug!(identifier, "engine: destroy volume");
        self.send(self.client.delete(url)).await?;
        Ok(())
    }

    async fn list_volumes_by_name(&self, name: &str) -> Result<Vec<Volume>, EngineError> {
        let filter = name_filter(name);
        let mut volumes = Vec::new();
        let mut page = 1u32;

        loop {
            let mut url = self.collection_url(VOLUMES_PATH)?;
            url.query_pairs_mut()
                .append_pair("page", &page.to_string())
                .append_pair("limit", &LIST_PAGE_LIMIT.to_string())
                .append_pair("filters", &filter);

            match self.fetch::<ListResponse<Volume>>(url).await? {
                ListResponse::Bare(data) => {
                    volumes.extend(data);
                    return Ok(volumes);
                }
                ListResponse::Paged(paged) => {
                    let done = paged.data.is_empty() || paged.page.max(page) >= paged.total_pages;
                    volumes.extend(paged.data);
                    if done {
                        return Ok(volumes);
                    }
                    page += 1;
                }
            }
        }
    }

    async fn get_storage_server_interface(
        &self,
        identifier: &str,
    ) -> Result<StorageServerInterface, EngineError> {
        self.fetch(self.resource_url(STORAGE_SERVER_INTERFACES_PATH, identifier)?)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::LifecycleState;

    fn engine(url: &str) -> HttpEngine {
        HttpEngine::new(&EngineConfig {
            url: url.to_string(),
            token: "secret".to_string(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn resource_urls_append_identifier() {
        let engine = engine("https://engine.example");
        let url = engine.resource_url(VOLUMES_PATH, "abc123").unwrap();
        assert_eq!(
            url.as_str(),
            "https://engine.example/api/dynamic_volume/v1/volumes.json/abc123"
        );

        let url = engine
            .resource_url(STORAGE_SERVER_INTERFACES_PATH, "srv-1")
            .unwrap();
        assert_eq!(
            url.as_str(),
            "https://engine.example/api/dynamic_volume/v1/storage_server_interfaces.json/srv-1"
        );
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        let err = HttpEngine::new(&EngineConfig {
            url: "not a url".to_string(),
            ..Default::default()
        })
        .err()
        .unwrap();
        assert!(matches!(err, EngineError::Url(_)));
    }

    #[test]
    fn name_filter_is_form_encoded() {
        assert_eq!(name_filter("pvc-1"), "name=pvc-1");
        assert_eq!(name_filter("a b&c"), "name=a+b%26c");
    }

    #[test]
    fn decodes_volume_with_state_object() {
        let volume: Volume = serde_json::from_str(
            r#"{
                "identifier": "v-1",
                "name": "foo",
                "size": 12345,
                "ads_class": "ENT2",
                "path": "/foo/bar/baz",
                "storage_server_interfaces": [{"identifier": "srv-1", "name": "nfs-1"}],
                "state": {"id": "0", "text": "OK", "type": 0}
            }"#,
        )
        .unwrap();

        assert_eq!(volume.identifier, "v-1");
        assert_eq!(volume.size_bytes, 12345);
        assert_eq!(volume.storage_class, "ENT2");
        assert_eq!(volume.path, "/foo/bar/baz");
        assert_eq!(volume.state, LifecycleState::Ready);
        assert_eq!(
            volume.storage_server_interfaces.unwrap()[0].identifier,
            "srv-1"
        );
    }

    #[test]
    fn decodes_state_types() {
        let state = |json: &str| serde_json::from_str::<LifecycleState>(json).unwrap();
        assert_eq!(state(r#"{"type": 1, "text": "Error"}"#), LifecycleState::Error);
        assert_eq!(state(r#"{"type": 2}"#), LifecycleState::Pending);
        assert_eq!(state(r#"{}"#), LifecycleState::Pending);
    }

    #[test]
    fn volume_without_state_is_pending() {
        let volume: Volume = serde_json::from_str(r#"{"identifier": "v-1", "name": "foo"}"#).unwrap();
        assert_eq!(volume.state, LifecycleState::Pending);
        assert!(volume.storage_server_interfaces.is_none());
    }

    #[test]
    fn decodes_storage_server_interface_network_name() {
        let ssi: StorageServerInterface = serde_json::from_str(
            r#"{
                "identifier": "srv-1",
                "name": "nfs-1",
                "ip_address": {"identifier": "ip-1", "name": "10.0.0.7"},
                "location": {"identifier": "loc-1", "code": "ANX04", "name": "Vienna"},
                "state": {"type": 0}
            }"#,
        )
        .unwrap();
        assert_eq!(ssi.network_name(), Some("10.0.0.7"));
        assert_eq!(ssi.location.unwrap().code, "ANX04");
    }

    #[test]
    fn decodes_paged_and_bare_lists() {
        let paged: ListResponse<Volume> = serde_json::from_str(
            r#"{"page": 1, "total_pages": 2, "data": [{"identifier": "a"}]}"#,
        )
        .unwrap();
        match paged {
            ListResponse::Paged(page) => {
                assert_eq!(page.total_pages, 2);
                assert_eq!(page.data.len(), 1);
            }
            ListResponse::Bare(_) => panic!("expected paged response"),
        }

        let bare: ListResponse<Volume> =
            serde_json::from_str(r#"[{"identifier": "a"}, {"identifier": "b"}]"#).unwrap();
        assert!(matches!(bare, ListResponse::Bare(ref v) if v.len() == 2));
    }

    #[test]
    fn create_body_uses_engine_field_names() {
        let body = serde_json::to_value(NewVolume {
            name: "foo".to_string(),
            size_bytes: 12345,
            storage_class: "ENT2".to_string(),
            storage_server_ref: "srv-1".to_string(),
        })
        .unwrap();

        assert_eq!(
            body,
            serde_json::json!({
                "name": "foo",
                "size": 12345,
                "ads_class": "ENT2",
                "storage_server_interfaces": "srv-1"
            })
        );
    }
}
