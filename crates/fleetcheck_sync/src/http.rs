//! HTTP implementations of the remote store and the secret authority.
//!
//! The remote store speaks a drive-style API where items are addressed by
//! path relative to the drive root:
//!
//! - `GET  {drive}/root:/{path}:/children` lists a folder (paged through
//!   `@odata.nextLink`)
//! - `GET  {drive}/root:/{path}:/content` downloads a file
//! - `PUT  {drive}/root:/{path}:/content` uploads a file
//! - `POST {drive}/root:/{parent}:/children` creates a folder
//! - `DELETE {drive}/root:/{path}` deletes a folder and its content

use crate::config::HttpStoreConfig;
use crate::credentials::CredentialProvider;
use crate::error::{SyncError, SyncResult};
use crate::remote::{RemoteEntry, RemoteStore};
use crate::secret::{OrganizationSecret, SecretAuthority};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

const CONFLICT_BEHAVIOR: &str = "@microsoft.graph.conflictBehavior";

#[derive(Debug, Deserialize)]
struct ChildrenPage {
    #[serde(default)]
    value: Vec<DriveItem>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DriveItem {
    name: String,
    id: Option<String>,
    size: Option<u64>,
    folder: Option<serde_json::Value>,
}

impl From<DriveItem> for RemoteEntry {
    fn from(item: DriveItem) -> Self {
        let is_folder = item.folder.is_some();
        RemoteEntry {
            name: item.name,
            id: item.id,
            is_folder,
            size: if is_folder { None } else { item.size },
        }
    }
}

fn build_client(timeout: std::time::Duration) -> SyncResult<Client> {
    Client::builder()
        .timeout(timeout)
        .user_agent(concat!("fleetcheck/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(|e| SyncError::transport_fatal(format!("failed to build http client: {e}")))
}

fn map_request_error(e: reqwest::Error) -> SyncError {
    if e.is_timeout() {
        SyncError::Timeout
    } else if e.is_connect() {
        SyncError::NotConnected
    } else {
        SyncError::transport_retryable(e.to_string())
    }
}

/// Maps a non-success status to the sync error taxonomy.
fn status_error(status: StatusCode, path: &str, body: &str) -> SyncError {
    match status.as_u16() {
        401 => SyncError::Unauthorized(format!("{path}: {body}")),
        404 => SyncError::NotFound(path.to_string()),
        409 => SyncError::AlreadyExists(path.to_string()),
        408 | 429 => SyncError::transport_retryable(format!("{path}: HTTP {status}")),
        _ if status.is_server_error() => {
            SyncError::transport_retryable(format!("{path}: HTTP {status}"))
        }
        _ => SyncError::transport_fatal(format!("{path}: HTTP {status}: {body}")),
    }
}

async fn check(response: Response, path: &str) -> SyncResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(status_error(status, path, &body))
}

/// Remote store over a drive-style HTTP API.
pub struct HttpRemoteStore {
    client: Client,
    drive: Url,
    credentials: Arc<dyn CredentialProvider>,
}

impl HttpRemoteStore {
    /// Creates a store for `config.store_url`.
    pub fn new(
        config: &HttpStoreConfig,
        credentials: Arc<dyn CredentialProvider>,
    ) -> SyncResult<Self> {
        let drive = Url::parse(config.store_url.trim_end_matches('/'))
            .map_err(|e| SyncError::transport_fatal(format!("invalid store url: {e}")))?;
        if drive.cannot_be_a_base() {
            return Err(SyncError::transport_fatal(format!(
                "store url cannot be a base: {drive}"
            )));
        }
        Ok(Self {
            client: build_client(config.timeout)?,
            drive,
            credentials,
        })
    }

    /// URL of an item, optionally followed by an action segment.
    ///
    /// The root itself is `root`, `root/children` and so on; any other item
    /// is `root:/a/b` or `root:/a/b:/children`.
    fn item_url(&self, path: &str, action: Option<&str>) -> Url {
        let mut url = self.drive.clone();
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if let Ok(mut parts) = url.path_segments_mut() {
            parts.pop_if_empty();
            match segments.split_last() {
                None => {
                    parts.push("root");
                }
                Some((last, parents)) => {
                    parts.push("root:");
                    parts.extend(parents);
                    if action.is_some() {
                        parts.push(&format!("{last}:"));
                    } else {
                        parts.push(last);
                    }
                }
            }
            if let Some(action) = action {
                parts.push(action);
            }
        }
        url
    }

    async fn send(&self, request: RequestBuilder, path: &str) -> SyncResult<Response> {
        let token = self.credentials.bearer_token().await?;
        let response = request
            .bearer_auth(token)
            .send()
            .await
            .map_err(map_request_error)?;
        check(response, path).await
    }
}

impl std::fmt::Debug for HttpRemoteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRemoteStore")
            .field("drive", &self.drive.as_str())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn list_children(&self, path: &str) -> SyncResult<Vec<RemoteEntry>> {
        let mut entries = Vec::new();
        let mut next = Some(self.item_url(path, Some("children")));

        while let Some(url) = next.take() {
            let response = self.send(self.client.get(url), path).await?;
            let page: ChildrenPage = response
                .json()
                .await
                .map_err(|e| SyncError::Protocol(format!("{path}: bad listing: {e}")))?;
            entries.extend(page.value.into_iter().map(RemoteEntry::from));
            next = page
                .next_link
                .map(|link| Url::parse(&link))
                .transpose()
                .map_err(|e| SyncError::Protocol(format!("{path}: bad next link: {e}")))?;
        }
        debug!(path, children = entries.len(), "listed remote folder");
        Ok(entries)
    }

    async fn read_file(&self, path: &str) -> SyncResult<Vec<u8>> {
        let url = self.item_url(path, Some("content"));
        let response = self.send(self.client.get(url), path).await?;
        let bytes = response.bytes().await.map_err(map_request_error)?;
        debug!(path, bytes = bytes.len(), "downloaded remote file");
        Ok(bytes.to_vec())
    }

    async fn write_file(&self, path: &str, bytes: &[u8], overwrite: bool) -> SyncResult<()> {
        let mut url = self.item_url(path, Some("content"));
        url.query_pairs_mut().append_pair(
            CONFLICT_BEHAVIOR,
            if overwrite { "replace" } else { "fail" },
        );
        let request = self
            .client
            .put(url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes.to_vec());
        self.send(request, path).await?;
        debug!(path, bytes = bytes.len(), "uploaded remote file");
        Ok(())
    }

    async fn create_folder(&self, path: &str) -> SyncResult<()> {
        let trimmed = path.trim_matches('/');
        let (parent, name) = trimmed.rsplit_once('/').unwrap_or(("", trimmed));
        if name.is_empty() {
            return Err(SyncError::AlreadyExists(path.to_string()));
        }
        let body = serde_json::json!({
            "name": name,
            "folder": {},
            (CONFLICT_BEHAVIOR): "fail",
        });
        let url = self.item_url(parent, Some("children"));
        self.send(self.client.post(url).json(&body), path).await?;
        debug!(path, "created remote folder");
        Ok(())
    }

    async fn delete_folder(&self, path: &str) -> SyncResult<()> {
        let url = self.item_url(path, None);
        self.send(self.client.delete(url), path).await?;
        debug!(path, "deleted remote folder");
        Ok(())
    }
}

/// Secret authority reached over HTTP with the user's bearer token.
pub struct HttpSecretAuthority {
    client: Client,
    url: String,
    credentials: Arc<dyn CredentialProvider>,
}

impl HttpSecretAuthority {
    /// Creates an authority for `config.authority_url`.
    pub fn new(
        config: &HttpStoreConfig,
        credentials: Arc<dyn CredentialProvider>,
    ) -> SyncResult<Self> {
        Ok(Self {
            client: build_client(config.timeout)?,
            url: format!(
                "{}/organization/secret",
                config.authority_url.trim_end_matches('/')
            ),
            credentials,
        })
    }
}

impl std::fmt::Debug for HttpSecretAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSecretAuthority")
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl SecretAuthority for HttpSecretAuthority {
    async fn fetch_secret(&self) -> SyncResult<OrganizationSecret> {
        let token = self.credentials.bearer_token().await?;
        let response = self
            .client
            .get(&self.url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(map_request_error)?;
        let response = check(response, &self.url).await?;
        let secret: OrganizationSecret = response
            .json()
            .await
            .map_err(|e| SyncError::Authority(format!("bad secret response: {e}")))?;
        if secret.secret.is_empty() {
            return Err(SyncError::Authority("authority returned an empty secret".into()));
        }
        Ok(secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::StaticCredentials;
    use wiremock::matchers::{body_bytes, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn store(server: &MockServer) -> HttpRemoteStore {
        let config = HttpStoreConfig::new(format!("{}/drive", server.uri()), server.uri());
        HttpRemoteStore::new(&config, Arc::new(StaticCredentials::new("tok"))).unwrap()
    }

    #[tokio::test]
    async fn item_urls() {
        let server = MockServer::start().await;
        let store = store(&server);
        let base = format!("{}/drive", server.uri());

        assert_eq!(
            store.item_url("", Some("children")).as_str(),
            format!("{base}/root/children")
        );
        assert_eq!(
            store.item_url("FleetCheck/acme/Data", Some("children")).as_str(),
            format!("{base}/root:/FleetCheck/acme/Data:/children")
        );
        assert_eq!(
            store.item_url("FleetCheck/acme/Data/x", None).as_str(),
            format!("{base}/root:/FleetCheck/acme/Data/x")
        );
    }

    #[tokio::test]
    async fn lists_children_across_pages() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/drive/root:/FleetCheck:/children"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "value": [
                    { "name": "acme", "id": "1", "folder": { "childCount": 2 } },
                ],
                "@odata.nextLink": format!("{}/drive/page2", server.uri()),
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/drive/page2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "value": [ { "name": "notes.json", "id": "2", "size": 12 } ],
            })))
            .mount(&server)
            .await;

        let entries = store(&server).list_children("FleetCheck").await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].is_folder);
        assert_eq!(entries[0].id.as_deref(), Some("1"));
        assert!(!entries[1].is_folder);
        assert_eq!(entries[1].size, Some(12));
    }

    #[tokio::test]
    async fn status_codes_map_to_errors() {
        let server = MockServer::start().await;
        for (dir, status) in [("gone", 404), ("locked", 401), ("busy", 503), ("bad", 400)] {
            Mock::given(method("GET"))
                .and(path(format!("/drive/root:/{dir}:/children")))
                .respond_with(ResponseTemplate::new(status))
                .mount(&server)
                .await;
        }
        let store = store(&server);

        assert!(store.list_children("gone").await.unwrap_err().is_not_found());
        assert!(store.list_children("locked").await.unwrap_err().is_unauthorized());
        assert!(store.list_children("busy").await.unwrap_err().is_retryable());
        let bad = store.list_children("bad").await.unwrap_err();
        assert!(!bad.is_retryable());
        assert!(!bad.is_unauthorized());
    }

    #[tokio::test]
    async fn writes_with_conflict_behavior() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/drive/root:/Data/a.json:/content"))
            .and(query_param(CONFLICT_BEHAVIOR, "replace"))
            .and(body_bytes(b"payload".to_vec()))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/drive/root:/Data/b.json:/content"))
            .and(query_param(CONFLICT_BEHAVIOR, "fail"))
            .respond_with(ResponseTemplate::new(409))
            .mount(&server)
            .await;

        let store = store(&server);
        store.write_file("Data/a.json", b"payload", true).await.unwrap();
        let err = store.write_file("Data/b.json", b"x", false).await.unwrap_err();
        assert!(matches!(err, SyncError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn reads_file_content() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/drive/root:/Data/a.json:/content"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"{\"n\":1}".to_vec()))
            .mount(&server)
            .await;

        let bytes = store(&server).read_file("Data/a.json").await.unwrap();
        assert_eq!(bytes, b"{\"n\":1}");
    }

    #[tokio::test]
    async fn creates_folder_under_parent() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/drive/root:/FleetCheck:/children"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/drive/root/children"))
            .respond_with(ResponseTemplate::new(409))
            .mount(&server)
            .await;

        let store = store(&server);
        store.create_folder("FleetCheck/acme").await.unwrap();
        let err = store.create_folder("FleetCheck").await.unwrap_err();
        assert!(matches!(err, SyncError::AlreadyExists(_)));

        let requests = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body["name"], "acme");
        assert_eq!(body[CONFLICT_BEHAVIOR], "fail");
    }

    #[tokio::test]
    async fn deletes_folder() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/drive/root:/Data/x"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        store(&server).delete_folder("Data/x").await.unwrap();
    }

    #[tokio::test]
    async fn fetches_organization_secret() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/organization/secret"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "secret": "s3cret",
                "organizationName": "Acme",
                "updatedAt": "2024-05-01T08:30:00Z",
            })))
            .mount(&server)
            .await;

        let config = HttpStoreConfig::new(server.uri(), format!("{}/", server.uri()));
        let authority =
            HttpSecretAuthority::new(&config, Arc::new(StaticCredentials::new("tok"))).unwrap();
        let secret = authority.fetch_secret().await.unwrap();
        assert_eq!(secret.secret, "s3cret");
        assert_eq!(secret.organization_name, "Acme");
    }

    #[tokio::test]
    async fn empty_secret_is_an_authority_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/organization/secret"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({ "secret": "" })),
            )
            .mount(&server)
            .await;

        let config = HttpStoreConfig::new(server.uri(), server.uri());
        let authority =
            HttpSecretAuthority::new(&config, Arc::new(StaticCredentials::new("tok"))).unwrap();
        let err = authority.fetch_secret().await.unwrap_err();
        assert!(matches!(err, SyncError::Authority(_)));
    }
}
