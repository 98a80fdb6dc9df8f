//! [`CatalogApi`] over HTTP.
//!
//! Catalogs are managed through the management API (`api/management/v1/catalogs`), everything
//! below them through the Iceberg REST API (`api/catalog/v1/{catalog}/...`). Multi-level
//! namespaces are joined with the unit separator `0x1F` in paths and query parameters.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use reqwest::{Method, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};

use super::{ActionError, ActionResult, CatalogApi, EntityDefinition, EntityInfo};
use crate::auth::Credential;
use crate::dataset::{EntityDescriptor, EntityKind};
use crate::error::{Error, Result};

/// Separator between namespace levels on the wire.
const NAMESPACE_SEPARATOR: &str = "\u{1F}";

/// Default realm header of the catalog service.
pub const DEFAULT_REALM_HEADER: &str = "Polaris-Realm";

/// A catalog service reachable over HTTP.
#[derive(Debug)]
pub struct HttpCatalog {
    client: reqwest::Client,
    base_url: Url,
    realm: Option<(String, String)>,
    storage_location: String,
}

impl HttpCatalog {
    /// Creates a catalog client for the service at `base_url`.
    ///
    /// Timeouts are taken from `client`.
    pub fn new(client: reqwest::Client, base_url: &str) -> Result<Self> {
        let base_url =
            Url::parse(base_url).map_err(|e| Error::invalid("catalog.base_url", e.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(Error::invalid("catalog.base_url", "must be a hierarchical URL"));
        }

        Ok(Self {
            client,
            base_url,
            realm: None,
            storage_location: "file:///tmp/catalog-loadtest".to_owned(),
        })
    }

    /// Sends `realm` in the header `header` with every request.
    pub fn with_realm(mut self, header: impl Into<String>, realm: impl Into<String>) -> Self {
        self.realm = Some((header.into(), realm.into()));
        self
    }

    /// Base location under which created catalogs store their data.
    pub fn with_storage_location(mut self, location: impl Into<String>) -> Self {
        self.storage_location = location.into().trim_end_matches('/').to_owned();
        self
    }

    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        // Checked in `new`.
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn catalog_url(&self, name: &str) -> Url {
        self.url(&["api", "management", "v1", "catalogs", name])
    }

    /// The collection endpoint for entities of `kind` in `namespace`.
    fn collection_url(&self, catalog: &str, kind: EntityKind, namespace: &[String]) -> Url {
        match kind {
            EntityKind::Catalog => self.url(&["api", "management", "v1", "catalogs"]),
            EntityKind::Namespace => self.url(&["api", "catalog", "v1", catalog, "namespaces"]),
            EntityKind::Table | EntityKind::View => self.url(&[
                "api",
                "catalog",
                "v1",
                catalog,
                "namespaces",
                &namespace.join(NAMESPACE_SEPARATOR),
                collection(kind),
            ]),
        }
    }

    fn entity_url(&self, entity: &EntityDescriptor) -> Url {
        let catalog = entity.catalog();
        match entity.kind {
            EntityKind::Catalog => self.catalog_url(&entity.name),
            EntityKind::Namespace => self.url(&[
                "api",
                "catalog",
                "v1",
                catalog,
                "namespaces",
                &entity.levels().join(NAMESPACE_SEPARATOR),
            ]),
            EntityKind::Table | EntityKind::View => {
                let mut url = self.collection_url(catalog, entity.kind, entity.namespace());
                if let Ok(mut path) = url.path_segments_mut() {
                    path.push(&entity.name);
                }
                url
            }
        }
    }

    fn request(&self, method: Method, url: Url, credential: &Credential) -> RequestBuilder {
        let mut request = self
            .client
            .request(method, url)
            .bearer_auth(credential.token());
        if let Some((header, realm)) = &self.realm {
            request = request.header(header.as_str(), realm.as_str());
        }
        request
    }

    async fn send(&self, request: RequestBuilder) -> ActionResult<Response> {
        let response = request.send().await.map_err(transport)?;
        check_status(response.status())?;
        Ok(response)
    }

    /// Fetches all pages of a listing endpoint, following `next-page-token`.
    async fn list_pages<T: DeserializeOwned>(
        &self,
        credential: &Credential,
        url: Url,
        query: &[(&str, &str)],
    ) -> ActionResult<Vec<T>> {
        let mut items = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self
                .request(Method::GET, url.clone(), credential)
                .query(query);
            if let Some(token) = &page_token {
                request = request.query(&[("pageToken", token)]);
            }

            let page: Page<T> = self.send(request).await?.json().await.map_err(transport)?;
            items.extend(page.items);

            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => return Ok(items),
            }
        }
    }

    fn create_body(&self, entity: &EntityDescriptor, definition: &EntityDefinition) -> Value {
        match entity.kind {
            EntityKind::Catalog => {
                let location = format!("{}/{}", self.storage_location, entity.name);
                let mut properties = definition.properties.clone();
                properties.insert("default-base-location".to_owned(), location.clone());
                json!({
                    "catalog": {
                        "type": "INTERNAL",
                        "name": entity.name,
                        "properties": properties,
                        "storageConfigInfo": {
                            "storageType": storage_type(&location),
                            "allowedLocations": [location],
                        },
                    }
                })
            }
            EntityKind::Namespace => json!({
                "namespace": entity.levels(),
                "properties": definition.properties,
            }),
            EntityKind::Table => json!({
                "name": entity.name,
                "schema": schema(&definition.columns),
                "properties": definition.properties,
            }),
            EntityKind::View => json!({
                "name": entity.name,
                "schema": schema(&definition.columns),
                "view-version": {
                    "version-id": 1,
                    "schema-id": 0,
                    "timestamp-ms": timestamp_ms(),
                    "summary": { "engine-name": "catalog-loadtest" },
                    "representations": [{
                        "type": "sql",
                        "sql": select_sql(&definition.columns),
                        "dialect": "ansi",
                    }],
                    "default-namespace": entity.namespace(),
                },
                "properties": definition.properties,
            }),
        }
    }
}

fn collection(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Catalog => "catalogs",
        EntityKind::Namespace => "namespaces",
        EntityKind::Table => "tables",
        EntityKind::View => "views",
    }
}

fn storage_type(location: &str) -> &'static str {
    if location.starts_with("s3://") {
        "S3"
    } else if location.starts_with("gs://") {
        "GCS"
    } else {
        "FILE"
    }
}

fn schema(columns: &[String]) -> Value {
    let fields: Vec<_> = columns
        .iter()
        .enumerate()
        .map(|(i, name)| json!({ "id": i + 1, "name": name, "type": "string", "required": false }))
        .collect();
    json!({ "type": "struct", "schema-id": 0, "fields": fields })
}

fn select_sql(columns: &[String]) -> String {
    if columns.is_empty() {
        "SELECT 1".to_owned()
    } else {
        format!("SELECT {}", columns.join(", "))
    }
}

fn timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}

fn check_status(status: StatusCode) -> ActionResult<()> {
    match status {
        status if status.is_success() => Ok(()),
        StatusCode::NOT_FOUND => Err(ActionError::NotFound),
        StatusCode::CONFLICT => Err(ActionError::Conflict),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(ActionError::Unauthorized),
        status => Err(ActionError::Status(status.as_u16())),
    }
}

fn transport(error: reqwest::Error) -> ActionError {
    if error.is_timeout() {
        ActionError::Timeout
    } else {
        ActionError::Transport(error.to_string())
    }
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    #[serde(
        alias = "namespaces",
        alias = "identifiers",
        alias = "catalogs",
        default = "Vec::new"
    )]
    items: Vec<T>,
    #[serde(rename = "next-page-token", default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TableIdentifier {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
struct Properties {
    #[serde(default)]
    properties: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct CatalogResponse {
    name: String,
    #[serde(default)]
    properties: BTreeMap<String, String>,
    #[serde(rename = "entityVersion", default)]
    entity_version: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct NamespaceResponse {
    namespace: Vec<String>,
    #[serde(default)]
    properties: BTreeMap<String, String>,
}

/// `LoadTableResult` and `LoadViewResult` share this shape.
#[derive(Debug, Deserialize)]
struct LoadResponse {
    #[serde(default)]
    metadata: Properties,
}

#[async_trait::async_trait]
impl CatalogApi for HttpCatalog {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn create_entity(
        &self,
        credential: &Credential,
        entity: &EntityDescriptor,
        definition: &EntityDefinition,
    ) -> ActionResult<()> {
        let url = self.collection_url(entity.catalog(), entity.kind, entity.namespace());
        let request = self
            .request(Method::POST, url, credential)
            .json(&self.create_body(entity, definition));
        self.send(request).await?;
        Ok(())
    }

    async fn get_entity(
        &self,
        credential: &Credential,
        entity: &EntityDescriptor,
    ) -> ActionResult<EntityInfo> {
        let request = self.request(Method::GET, self.entity_url(entity), credential);
        let response = self.send(request).await?;

        let info = match entity.kind {
            EntityKind::Catalog => {
                let catalog: CatalogResponse = response.json().await.map_err(transport)?;
                EntityInfo {
                    name: catalog.name,
                    properties: catalog.properties,
                }
            }
            EntityKind::Namespace => {
                let namespace: NamespaceResponse = response.json().await.map_err(transport)?;
                EntityInfo {
                    name: namespace.namespace.last().cloned().unwrap_or_default(),
                    properties: namespace.properties,
                }
            }
            EntityKind::Table | EntityKind::View => {
                let loaded: LoadResponse = response.json().await.map_err(transport)?;
                EntityInfo {
                    name: entity.name.clone(),
                    properties: loaded.metadata.properties,
                }
            }
        };

        Ok(info)
    }

    async fn list_children(
        &self,
        credential: &Credential,
        parent: &EntityDescriptor,
        kind: EntityKind,
    ) -> ActionResult<Vec<String>> {
        let catalog = parent.catalog();
        match (parent.kind, kind) {
            (EntityKind::Catalog, EntityKind::Namespace) => {
                let url = self.collection_url(catalog, kind, &[]);
                let namespaces: Vec<Vec<String>> = self.list_pages(credential, url, &[]).await?;
                Ok(namespaces.into_iter().filter_map(|mut n| n.pop()).collect())
            }
            (EntityKind::Namespace, EntityKind::Namespace) => {
                let url = self.collection_url(catalog, kind, &[]);
                let parent = parent.levels().join(NAMESPACE_SEPARATOR);
                let namespaces: Vec<Vec<String>> = self
                    .list_pages(credential, url, &[("parent", &parent)])
                    .await?;
                Ok(namespaces.into_iter().filter_map(|mut n| n.pop()).collect())
            }
            (EntityKind::Namespace, EntityKind::Table | EntityKind::View) => {
                let url = self.collection_url(catalog, kind, &parent.levels());
                let identifiers: Vec<TableIdentifier> =
                    self.list_pages(credential, url, &[]).await?;
                Ok(identifiers.into_iter().map(|id| id.name).collect())
            }
            _ => Ok(Vec::new()),
        }
    }

    async fn entity_exists(
        &self,
        credential: &Credential,
        entity: &EntityDescriptor,
    ) -> ActionResult<bool> {
        // The management API has no HEAD endpoint for catalogs.
        let method = match entity.kind {
            EntityKind::Catalog => Method::GET,
            _ => Method::HEAD,
        };

        let request = self.request(method, self.entity_url(entity), credential);
        match self.send(request).await {
            Ok(_) => Ok(true),
            Err(ActionError::NotFound) => Ok(false),
            Err(error) => Err(error),
        }
    }

    async fn update_properties(
        &self,
        credential: &Credential,
        entity: &EntityDescriptor,
        updates: &BTreeMap<String, String>,
    ) -> ActionResult<()> {
        let url = self.entity_url(entity);
        let request = match entity.kind {
            EntityKind::Catalog => {
                let current = self.request(Method::GET, url.clone(), credential);
                let current: CatalogResponse =
                    self.send(current).await?.json().await.map_err(transport)?;

                let mut properties = current.properties;
                properties.extend(updates.clone());
                self.request(Method::PUT, url, credential).json(&json!({
                    "currentEntityVersion": current.entity_version,
                    "properties": properties,
                }))
            }
            EntityKind::Namespace => {
                let mut url = url;
                if let Ok(mut path) = url.path_segments_mut() {
                    path.push("properties");
                }
                self.request(Method::POST, url, credential)
                    .json(&json!({ "updates": updates, "removals": [] }))
            }
            EntityKind::Table | EntityKind::View => {
                self.request(Method::POST, url, credential).json(&json!({
                    "identifier": { "namespace": entity.namespace(), "name": entity.name },
                    "requirements": [],
                    "updates": [{ "action": "set-properties", "updates": updates }],
                }))
            }
        };

        self.send(request).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use catalog_loadtest_test::server::TestServer;

    use super::*;
    use crate::dataset::DatasetWalker;
    use crate::topology::ShapeParameters;

    fn walker() -> DatasetWalker {
        let shape = ShapeParameters {
            tree_width: 2,
            tree_depth: 2,
            tables_per_leaf: 1,
            views_per_leaf: 1,
            namespace_properties: 1,
            table_properties: 1,
            columns_per_table: 2,
            ..Default::default()
        };
        DatasetWalker::new(&shape, "C").unwrap()
    }

    fn catalog(server: &TestServer) -> HttpCatalog {
        HttpCatalog::new(reqwest::Client::new(), &server.url("/"))
            .unwrap()
            .with_realm(DEFAULT_REALM_HEADER, "test-realm")
    }

    #[test]
    fn rejects_invalid_base_url() {
        let error = HttpCatalog::new(reqwest::Client::new(), "not a url").unwrap_err();
        assert!(error.to_string().contains("catalog.base_url"));
        assert!(HttpCatalog::new(reqwest::Client::new(), "mailto:someone@example.com").is_err());
    }

    #[test]
    fn urls() {
        let catalog = HttpCatalog::new(reqwest::Client::new(), "http://localhost:8181/").unwrap();
        let walker = walker();

        let namespace = walker.descriptor(EntityKind::Namespace, 1).unwrap();
        assert_eq!(
            catalog.entity_url(&namespace).as_str(),
            "http://localhost:8181/api/catalog/v1/C_0/namespaces/NS_0%1FNS_1"
        );

        let table = walker.descriptor(EntityKind::Table, 1).unwrap();
        assert_eq!(
            catalog.entity_url(&table).as_str(),
            "http://localhost:8181/api/catalog/v1/C_0/namespaces/NS_0%1FNS_2/tables/T_1"
        );

        let c0 = walker.descriptor(EntityKind::Catalog, 0).unwrap();
        assert_eq!(
            catalog.entity_url(&c0).as_str(),
            "http://localhost:8181/api/management/v1/catalogs/C_0"
        );
    }

    #[tokio::test]
    async fn creates_tables_with_schema() {
        let server = TestServer::new().await;
        let path = "/api/catalog/v1/C_0/namespaces/NS_0%1FNS_1/tables";
        server.respond(Method::POST, path, StatusCode::OK, json!({}));

        let walker = walker();
        let table = walker.descriptor(EntityKind::Table, 0).unwrap();
        catalog(&server)
            .create_entity(
                &Credential::fixed("abc"),
                &table,
                &walker.definition(&table),
            )
            .await
            .unwrap();

        let requests = server.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].header("authorization"), Some("Bearer abc"));
        assert_eq!(requests[0].header("polaris-realm"), Some("test-realm"));

        let body = requests[0].json();
        assert_eq!(body["name"], "T_0");
        assert_eq!(body["properties"]["InitialAttribute_0"], "0");
        assert_eq!(body["schema"]["fields"][1]["name"], "column1");
        assert_eq!(body["schema"]["fields"][1]["id"], 2);
    }

    #[tokio::test]
    async fn maps_status_codes() {
        let server = TestServer::new().await;
        let walker = walker();
        let catalog = catalog(&server);
        let credential = Credential::fixed("abc");

        server.respond(
            Method::POST,
            "/api/catalog/v1/C_0/namespaces",
            StatusCode::CONFLICT,
            json!({ "error": { "code": 409 } }),
        );
        server.respond(
            Method::GET,
            "/api/management/v1/catalogs/C_0",
            StatusCode::FORBIDDEN,
            Value::Null,
        );

        let namespace = walker.descriptor(EntityKind::Namespace, 0).unwrap();
        let result = catalog
            .create_entity(&credential, &namespace, &walker.definition(&namespace))
            .await;
        assert_eq!(result, Err(ActionError::Conflict));

        let c0 = walker.descriptor(EntityKind::Catalog, 0).unwrap();
        let result = catalog.get_entity(&credential, &c0).await;
        assert_eq!(result, Err(ActionError::Unauthorized));

        // Nothing is registered for tables.
        let table = walker.descriptor(EntityKind::Table, 0).unwrap();
        let result = catalog.get_entity(&credential, &table).await;
        assert_eq!(result, Err(ActionError::NotFound));
        assert!(!catalog.entity_exists(&credential, &table).await.unwrap());
    }

    #[tokio::test]
    async fn reads_entities() {
        let server = TestServer::new().await;
        server.respond(
            Method::GET,
            "/api/catalog/v1/C_0/namespaces/NS_0",
            StatusCode::OK,
            json!({ "namespace": ["NS_0"], "properties": { "InitialAttribute_0": "0" } }),
        );
        server.respond(
            Method::GET,
            "/api/catalog/v1/C_0/namespaces/NS_0%1FNS_2/views/V_1",
            StatusCode::OK,
            json!({ "metadata-location": "file:///x", "metadata": { "properties": { "a": "b" } } }),
        );

        let walker = walker();
        let catalog = catalog(&server);
        let credential = Credential::fixed("abc");

        let root = walker.descriptor(EntityKind::Namespace, 0).unwrap();
        let info = catalog.get_entity(&credential, &root).await.unwrap();
        assert_eq!(info.name, "NS_0");
        assert_eq!(info.properties["InitialAttribute_0"], "0");

        let view = walker.descriptor(EntityKind::View, 1).unwrap();
        let info = catalog.get_entity(&credential, &view).await.unwrap();
        assert_eq!(info.name, "V_1");
        assert_eq!(info.properties["a"], "b");
    }

    #[tokio::test]
    async fn lists_children() {
        let server = TestServer::new().await;
        server.respond(
            Method::GET,
            "/api/catalog/v1/C_0/namespaces",
            StatusCode::OK,
            json!({ "namespaces": [["NS_0", "NS_1"], ["NS_0", "NS_2"]] }),
        );
        server.respond(
            Method::GET,
            "/api/catalog/v1/C_0/namespaces/NS_0%1FNS_1/tables",
            StatusCode::OK,
            json!({ "identifiers": [{ "namespace": ["NS_0", "NS_1"], "name": "T_0" }] }),
        );

        let walker = walker();
        let catalog = catalog(&server);
        let credential = Credential::fixed("abc");

        let root = walker.descriptor(EntityKind::Namespace, 0).unwrap();
        let children = catalog
            .list_children(&credential, &root, EntityKind::Namespace)
            .await
            .unwrap();
        assert_eq!(children, vec!["NS_1", "NS_2"]);

        let leaf = walker.descriptor(EntityKind::Namespace, 1).unwrap();
        let tables = catalog
            .list_children(&credential, &leaf, EntityKind::Table)
            .await
            .unwrap();
        assert_eq!(tables, vec!["T_0"]);

        let requests = server.requests();
        assert_eq!(requests[0].query.as_deref(), Some("parent=NS_0"));
    }

    #[tokio::test]
    async fn commits_table_properties() {
        let server = TestServer::new().await;
        let path = "/api/catalog/v1/C_0/namespaces/NS_0%1FNS_1/tables/T_0";
        server.respond(Method::POST, path, StatusCode::OK, json!({}));

        let walker = walker();
        let table = walker.descriptor(EntityKind::Table, 0).unwrap();
        let updates = BTreeMap::from([("commit_7".to_owned(), "7".to_owned())]);
        catalog(&server)
            .update_properties(&Credential::fixed("abc"), &table, &updates)
            .await
            .unwrap();

        let body = server.requests()[0].json();
        assert_eq!(body["updates"][0]["action"], "set-properties");
        assert_eq!(body["updates"][0]["updates"]["commit_7"], "7");
        assert_eq!(body["identifier"]["namespace"], json!(["NS_0", "NS_1"]));
    }
}
