use std::sync::Arc;
use std::time::Duration;

use catalog_loadtest::auth::oauth::OAuthAuthenticator;
use catalog_loadtest::auth::{
    AuthError, Authenticator, ClientCredentials, Credential, StaticAuthenticator, TokenManager,
    TokenSettings,
};
use catalog_loadtest::catalog::ActionError;
use catalog_loadtest::catalog::http::HttpCatalog;
use catalog_loadtest::catalog::in_memory::InMemoryCatalog;
use catalog_loadtest::{
    ActionKind, DatasetWalker, EntityKind, Error, Orchestrator, Phase, ShapeParameters,
};
use catalog_loadtest_test::server::TestServer;
use reqwest::{Method, StatusCode};
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

fn walker() -> DatasetWalker {
    let shape = ShapeParameters {
        num_catalogs: 2,
        tree_width: 2,
        tree_depth: 3,
        tables_per_leaf: 3,
        views_per_leaf: 2,
        namespace_properties: 3,
        table_properties: 3,
        view_properties: 3,
        ..Default::default()
    };
    DatasetWalker::new(&shape, "C").unwrap()
}

fn phase(name: &str, action: ActionKind, kind: EntityKind, walker: &DatasetWalker) -> Phase {
    Phase::builder(name, action, kind)
        .concurrency(4)
        .build(walker)
        .unwrap()
}

fn static_manager() -> TokenManager {
    TokenManager::new(
        Arc::new(StaticAuthenticator::new("token")),
        ClientCredentials::new("id", "secret"),
        TokenSettings::default(),
    )
}

#[tokio::test]
async fn builds_the_dataset_phase_by_phase() {
    catalog_loadtest_test::tracing::init();
    let walker = walker();
    let catalog = InMemoryCatalog::new().with_latency(Duration::from_millis(1));

    let phases = vec![
        phase("create catalogs", ActionKind::Create, EntityKind::Catalog, &walker),
        phase("create namespaces", ActionKind::Create, EntityKind::Namespace, &walker),
        phase("create tables", ActionKind::Create, EntityKind::Table, &walker),
        phase("create views", ActionKind::Create, EntityKind::View, &walker),
        phase("verify namespaces", ActionKind::Verify, EntityKind::Namespace, &walker),
        phase("list namespaces", ActionKind::ListChildren, EntityKind::Namespace, &walker),
        phase("views exist", ActionKind::Exists, EntityKind::View, &walker),
    ];
    // (operation, kind) issued by each phase, in phase order.
    let order = [
        ("create_entity", EntityKind::Catalog),
        ("create_entity", EntityKind::Namespace),
        ("create_entity", EntityKind::Table),
        ("create_entity", EntityKind::View),
        ("get_entity", EntityKind::Namespace),
        ("list_children", EntityKind::Namespace),
        ("entity_exists", EntityKind::View),
    ];

    let handle = static_manager().start(CancellationToken::new()).await.unwrap();
    let orchestrator =
        Orchestrator::new(Box::new(catalog.clone()), walker.clone(), handle.reader());
    let report = orchestrator.run(phases).await;
    handle.shutdown().await;

    assert!(report.is_success());
    assert_eq!(report.phases.len(), 7);
    for phase in &report.phases {
        // Creating a child before its parent fails, so a clean run proves the ordering.
        assert_eq!(phase.metrics.failure_count(), 0, "phase {}", phase.name);
        assert!(phase.is_complete(), "phase {}", phase.name);
    }
    for kind in EntityKind::ALL {
        assert_eq!(catalog.count(kind) as u64, walker.count(kind));
    }

    let positions: Vec<_> = catalog
        .requests()
        .iter()
        .map(|request| {
            order
                .iter()
                .position(|&(operation, kind)| {
                    operation == request.operation && kind == request.kind
                })
                .unwrap()
        })
        .collect();
    assert!(positions.windows(2).all(|pair| pair[0] <= pair[1]));
    assert!(catalog.requests().iter().all(|r| r.token == "token"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_namespace_creation_waits_for_parents() {
    let shape = ShapeParameters {
        num_catalogs: 1,
        tree_width: 2,
        tree_depth: 4,
        ..Default::default()
    };
    let walker = DatasetWalker::new(&shape, "C").unwrap();
    let catalog = InMemoryCatalog::new().with_latency(Duration::from_millis(5));

    let namespaces = Phase::builder("create namespaces", ActionKind::Create, EntityKind::Namespace)
        .concurrency(8)
        .build(&walker)
        .unwrap();
    let phases = vec![
        phase("create catalogs", ActionKind::Create, EntityKind::Catalog, &walker),
        namespaces,
    ];

    let handle = static_manager().start(CancellationToken::new()).await.unwrap();
    let orchestrator =
        Orchestrator::new(Box::new(catalog.clone()), walker.clone(), handle.reader());
    let report = orchestrator.run(phases).await;
    handle.shutdown().await;

    assert!(report.is_success());
    let created = &report.phases[1];
    assert_eq!(created.metrics.failure_count(), 0, "{:?}", created.metrics.failures);
    assert_eq!(
        catalog.count(EntityKind::Namespace) as u64,
        walker.count(EntityKind::Namespace)
    );

    // Requests arrive one tree level after another.
    let topology = walker.topology();
    let depths: Vec<_> = catalog
        .requests()
        .iter()
        .filter(|r| r.kind == EntityKind::Namespace)
        .map(|r| topology.ancestry(r.ordinal).len())
        .collect();
    assert_eq!(depths.len(), 15);
    assert!(depths.windows(2).all(|pair| pair[0] <= pair[1]), "{depths:?}");
}

#[tokio::test]
async fn action_failures_do_not_abort_the_run() {
    let walker = walker();
    let catalog = InMemoryCatalog::new();
    catalog.populate(&walker);
    catalog.inject_failure(EntityKind::Table, 3, ActionError::NotFound);
    catalog.inject_failure(EntityKind::Table, 5, ActionError::Status(503));
    catalog.inject_failure(EntityKind::Table, 7, ActionError::Unauthorized);

    let phases = vec![
        phase("verify tables", ActionKind::Verify, EntityKind::Table, &walker),
        phase("verify views", ActionKind::Verify, EntityKind::View, &walker),
    ];

    let handle = static_manager().start(CancellationToken::new()).await.unwrap();
    let orchestrator = Orchestrator::new(Box::new(catalog), walker.clone(), handle.reader());
    let report = orchestrator.run(phases).await;
    handle.shutdown().await;

    assert!(report.is_success());
    let tables = &report.phases[0];
    assert_eq!(tables.metrics.successes, walker.count(EntityKind::Table) - 3);
    assert_eq!(tables.metrics.failures["not_found"], 1);
    assert_eq!(tables.metrics.failures["status"], 1);
    assert_eq!(tables.metrics.failures["unauthorized"], 1);
    assert_eq!(
        report.phases[1].metrics.successes,
        walker.count(EntityKind::View)
    );
}

#[tokio::test]
async fn commits_replay_onto_existing_tables() {
    let walker = walker();
    let catalog = InMemoryCatalog::new();
    catalog.populate(&walker);

    let commits = Phase::builder("commits", ActionKind::Commit, EntityKind::Table)
        .concurrency(3)
        .count(100)
        .build(&walker)
        .unwrap();

    let handle = static_manager().start(CancellationToken::new()).await.unwrap();
    let orchestrator =
        Orchestrator::new(Box::new(catalog.clone()), walker.clone(), handle.reader());
    let report = orchestrator.run(vec![commits]).await;
    handle.shutdown().await;

    assert!(report.is_success());
    assert_eq!(report.phases[0].metrics.successes, 100);

    let tables = walker.count(EntityKind::Table);
    let requests = catalog.requests();
    assert_eq!(requests.len(), 100);
    assert!(requests.iter().all(|r| r.ordinal < tables));
}

/// Hands out one short-lived token and rejects every refresh.
#[derive(Debug)]
struct ExpiringAuthenticator {
    ttl: Duration,
    refresh_interval: Duration,
}

#[async_trait::async_trait]
impl Authenticator for ExpiringAuthenticator {
    async fn acquire_token(&self, _: &ClientCredentials) -> Result<Credential, AuthError> {
        Ok(Credential::new(
            "short-lived",
            Instant::now() + self.ttl,
            self.refresh_interval,
        ))
    }

    async fn refresh_token(
        &self,
        _: &ClientCredentials,
        _: &Credential,
    ) -> Result<Credential, AuthError> {
        Err(AuthError::Status {
            code: 401,
            message: "client revoked".into(),
        })
    }
}

#[tokio::test(start_paused = true)]
async fn lost_credential_aborts_between_actions() {
    let walker = walker();
    let catalog = InMemoryCatalog::new();
    catalog.populate(&walker);

    let authenticator = ExpiringAuthenticator {
        ttl: Duration::from_secs(5),
        refresh_interval: Duration::from_secs(2),
    };
    let manager = TokenManager::new(
        Arc::new(authenticator),
        ClientCredentials::new("id", "secret"),
        TokenSettings::default(),
    );
    let abort = CancellationToken::new();
    let handle = manager.start(abort.clone()).await.unwrap();

    // Paced at 10 commits per second, this phase would take 20 seconds.
    let commits = Phase::builder("commits", ActionKind::Commit, EntityKind::Table)
        .concurrency(2)
        .count(200)
        .rate(10.0)
        .build(&walker)
        .unwrap();
    let verify = phase("verify views", ActionKind::Verify, EntityKind::View, &walker);

    let orchestrator = Orchestrator::new(Box::new(catalog.clone()), walker, handle.reader())
        .with_cancellation(abort.clone());
    let report = orchestrator.run(vec![commits, verify]).await;
    handle.shutdown().await;

    assert!(abort.is_cancelled());
    assert_eq!(report.phases.len(), 1);
    let processed = report.phases[0].processed();
    assert!(processed > 0 && processed < 200, "processed {processed}");
    assert!(catalog.requests().iter().all(|r| r.token == "short-lived"));

    match report.aborted {
        Some(Error::Aborted { phase, source }) => {
            assert_eq!(phase, "commits");
            assert!(matches!(
                *source,
                Error::AuthenticationExhausted { attempts: 1, .. }
            ));
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
}

#[tokio::test]
async fn drives_a_rest_catalog() {
    let server = TestServer::new().await;
    server.respond(
        Method::POST,
        "/api/catalog/v1/oauth/tokens",
        StatusCode::OK,
        json!({ "access_token": "abc", "token_type": "bearer", "expires_in": 3600 }),
    );
    server.respond(
        Method::POST,
        "/api/management/v1/catalogs",
        StatusCode::CREATED,
        json!({}),
    );
    server.respond(
        Method::POST,
        "/api/catalog/v1/C_0/namespaces",
        StatusCode::OK,
        json!({}),
    );

    let shape = ShapeParameters {
        num_catalogs: 1,
        tree_width: 2,
        tree_depth: 2,
        ..Default::default()
    };
    let walker = DatasetWalker::new(&shape, "C").unwrap();

    let client = reqwest::Client::new();
    let authenticator =
        OAuthAuthenticator::new(client.clone(), server.url("api/catalog/v1/oauth/tokens"));
    let manager = TokenManager::new(
        Arc::new(authenticator),
        ClientCredentials::new("root", "s3cr3t"),
        TokenSettings::default(),
    );
    let handle = manager.start(CancellationToken::new()).await.unwrap();

    let catalog = HttpCatalog::new(client, &server.url("")).unwrap();
    let phases = vec![
        phase("create catalogs", ActionKind::Create, EntityKind::Catalog, &walker),
        phase("create namespaces", ActionKind::Create, EntityKind::Namespace, &walker),
    ];
    let orchestrator = Orchestrator::new(Box::new(catalog), walker, handle.reader());
    let report = orchestrator.run(phases).await;
    handle.shutdown().await;

    assert!(report.is_success());
    assert_eq!(report.phases[0].metrics.successes, 1);
    assert_eq!(report.phases[1].metrics.successes, 3);

    let requests = server.requests();
    assert_eq!(requests.len(), 5);
    assert_eq!(requests[0].path, "/api/catalog/v1/oauth/tokens");
    assert!(requests[0].body.contains("grant_type=client_credentials"));
    assert_eq!(requests[1].path, "/api/management/v1/catalogs");
    for request in &requests[1..] {
        assert_eq!(request.header("authorization"), Some("Bearer abc"));
    }
    assert!(
        requests[2..]
            .iter()
            .all(|r| r.path == "/api/catalog/v1/C_0/namespaces")
    );
}
