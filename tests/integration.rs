//! Integration tests for the config provider

use std::net::SocketAddr;
use std::sync::Arc;

use routesmith::config::Config;
use routesmith::db::{
    Database, OrgRecord, ResourceRecord, RoutingSource, SiteRecord, SourceError, TargetRecord,
    TargetRow,
};
use routesmith::server::{ConfigServer, CONFIG_PATH};
use routesmith::traefik::ProviderSettings;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

struct FailingSource;

impl RoutingSource for FailingSource {
    fn load_targets(&self) -> Result<Vec<TargetRow>, SourceError> {
        Err(SourceError::Unavailable("database is locked".to_string()))
    }
}

/// Running provider bound to an ephemeral port
struct TestServer {
    port: u16,
    shutdown_tx: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn start(source: Arc<dyn RoutingSource>, config: &Config) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let addr: SocketAddr = format!("127.0.0.1:{}", port).parse().unwrap();
        let server = ConfigServer::new(
            addr,
            source,
            ProviderSettings::from_config(config),
            shutdown_rx,
        );
        let handle = tokio::spawn(async move {
            let _ = server.serve(listener).await;
        });

        Self {
            port,
            shutdown_tx,
            handle,
        }
    }

    async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.handle.await;
    }
}

/// Send a simple HTTP request and get response
async fn http_get(port: u16, path: &str) -> Result<String, Box<dyn std::error::Error>> {
    let mut stream = TcpStream::connect(format!("127.0.0.1:{}", port)).await?;

    let request = format!(
        "GET {} HTTP/1.1\r\nHost: 127.0.0.1:{}\r\nConnection: close\r\n\r\n",
        path, port
    );
    stream.write_all(request.as_bytes()).await?;

    let mut response = String::new();
    stream.read_to_string(&mut response).await?;
    Ok(response)
}

fn status_line(response: &str) -> &str {
    response.lines().next().unwrap_or("")
}

fn body(response: &str) -> &str {
    response
        .split_once("\r\n\r\n")
        .map(|(_, body)| body)
        .unwrap_or("")
}

fn seeded_database() -> Database {
    let db = Database::open_in_memory().unwrap();

    db.create_org(&OrgRecord {
        org_id: "acme".to_string(),
        name: "Acme".to_string(),
        domain: Some("example.com".to_string()),
    })
    .unwrap();

    db.create_site(&SiteRecord {
        site_id: 1,
        org_id: "acme".to_string(),
        name: "office".to_string(),
        site_type: "newt".to_string(),
        subnet: Some("100.89.128.4/30".to_string()),
        pub_key: None,
        endpoint: None,
        listen_port: None,
    })
    .unwrap();

    db.create_site(&SiteRecord {
        site_id: 2,
        org_id: "acme".to_string(),
        name: "datacenter".to_string(),
        site_type: "wireguard".to_string(),
        subnet: None,
        pub_key: Some("wg-pubkey".to_string()),
        endpoint: Some("203.0.113.9".to_string()),
        listen_port: Some(51820),
    })
    .unwrap();

    db.create_resource(&ResourceRecord {
        resource_id: 10,
        site_id: 1,
        org_id: "acme".to_string(),
        name: "Grafana".to_string(),
        subdomain: Some("grafana".to_string()),
        ssl: true,
        enabled: true,
    })
    .unwrap();

    db.create_resource(&ResourceRecord {
        resource_id: 20,
        site_id: 2,
        org_id: "acme".to_string(),
        name: "Wiki".to_string(),
        subdomain: Some("wiki".to_string()),
        ssl: false,
        enabled: true,
    })
    .unwrap();

    db.create_resource(&ResourceRecord {
        resource_id: 30,
        site_id: 2,
        org_id: "acme".to_string(),
        name: "Unpublished".to_string(),
        subdomain: None,
        ssl: false,
        enabled: true,
    })
    .unwrap();

    db.create_target(&TargetRecord {
        target_id: 1,
        resource_id: 10,
        ip: "192.168.1.50".to_string(),
        method: "http".to_string(),
        port: 3000,
        internal_port: Some(20001),
        protocol: Some("tcp".to_string()),
        enabled: true,
    })
    .unwrap();

    db.create_target(&TargetRecord {
        target_id: 2,
        resource_id: 20,
        ip: "10.10.0.2".to_string(),
        method: "https".to_string(),
        port: 9000,
        internal_port: None,
        protocol: Some("tcp".to_string()),
        enabled: true,
    })
    .unwrap();

    db.create_target(&TargetRecord {
        target_id: 3,
        resource_id: 30,
        ip: "10.10.0.3".to_string(),
        method: "http".to_string(),
        port: 80,
        internal_port: None,
        protocol: Some("tcp".to_string()),
        enabled: true,
    })
    .unwrap();

    db
}

// ============================================================================
// Provider endpoint
// ============================================================================

#[tokio::test]
async fn test_provider_serves_synthesized_config() {
    let db = seeded_database();
    let server = TestServer::start(Arc::new(db), &Config::default()).await;

    let response = http_get(server.port, CONFIG_PATH).await.unwrap();
    assert!(status_line(&response).contains("200"), "{}", response);

    let document: Value = serde_json::from_str(body(&response)).unwrap();
    let http = &document["http"];

    let routers = http["routers"].as_object().unwrap();
    assert_eq!(routers.len(), 3);
    assert_eq!(routers["1-router"]["entryPoints"][0], "websecure");
    assert_eq!(routers["1-router"]["rule"], "Host(`grafana.example.com`)");
    assert_eq!(routers["1-router"]["tls"]["certResolver"], "letsencrypt");
    assert_eq!(routers["1-router-redirect"]["entryPoints"][0], "web");
    assert_eq!(routers["1-router-redirect"]["middlewares"][0], "redirect-to-https");
    assert_eq!(routers["2-router"]["entryPoints"][0], "web");
    assert!(routers["2-router"].get("tls").is_none());
    assert!(!routers.contains_key("3-router"));

    let services = http["services"].as_object().unwrap();
    assert_eq!(services.len(), 2);
    assert_eq!(
        services["1-service"]["loadBalancer"]["servers"][0]["url"],
        "http://100.89.128.4:20001"
    );
    assert_eq!(
        services["2-service"]["loadBalancer"]["servers"][0]["url"],
        "https://10.10.0.2:9000"
    );

    let middlewares = http["middlewares"].as_object().unwrap();
    assert_eq!(middlewares.len(), 2);
    assert_eq!(
        middlewares["badger"]["plugin"]["badger"]["apiBaseUrl"],
        "http://localhost:3001/api/v1"
    );
    assert_eq!(middlewares["redirect-to-https"]["redirectScheme"]["permanent"], true);

    server.stop().await;
}

#[tokio::test]
async fn test_provider_reflects_target_changes() {
    let db = seeded_database();
    let server = TestServer::start(Arc::new(db.clone()), &Config::default()).await;

    let before = http_get(server.port, CONFIG_PATH).await.unwrap();
    assert!(body(&before).contains("2-router"));

    assert!(db.set_target_enabled(2, false).unwrap());

    let after = http_get(server.port, CONFIG_PATH).await.unwrap();
    assert!(!body(&after).contains("2-router"));
    assert!(body(&after).contains("1-router"));

    server.stop().await;
}

#[tokio::test]
async fn test_provider_is_idempotent() {
    let server = TestServer::start(Arc::new(seeded_database()), &Config::default()).await;

    let first = http_get(server.port, CONFIG_PATH).await.unwrap();
    let second = http_get(server.port, CONFIG_PATH).await.unwrap();
    assert_eq!(body(&first), body(&second));

    server.stop().await;
}

#[tokio::test]
async fn test_provider_empty_database_returns_empty_object() {
    let db = Database::open_in_memory().unwrap();
    let server = TestServer::start(Arc::new(db), &Config::default()).await;

    let response = http_get(server.port, CONFIG_PATH).await.unwrap();
    assert!(status_line(&response).contains("200"));
    assert_eq!(body(&response), "{}");

    server.stop().await;
}

#[tokio::test]
async fn test_provider_wildcard_cert_preference() {
    let mut config = Config::default();
    config.traefik.prefer_wildcard_cert = true;
    config.traefik.cert_resolver = "staging".to_string();

    let server = TestServer::start(Arc::new(seeded_database()), &config).await;

    let response = http_get(server.port, CONFIG_PATH).await.unwrap();
    let document: Value = serde_json::from_str(body(&response)).unwrap();
    let tls = &document["http"]["routers"]["1-router"]["tls"];

    assert_eq!(tls["certResolver"], "staging");
    assert_eq!(tls["domains"][0]["main"], "*.example.com");

    server.stop().await;
}

#[tokio::test]
async fn test_provider_read_failure_returns_server_error() {
    let server = TestServer::start(Arc::new(FailingSource), &Config::default()).await;

    let response = http_get(server.port, CONFIG_PATH).await.unwrap();
    assert!(status_line(&response).contains("500"), "{}", response);

    let error: Value = serde_json::from_str(body(&response)).unwrap();
    assert_eq!(error["error"], "Failed to build traefik config");
    assert!(error.get("http").is_none());

    server.stop().await;
}

// ============================================================================
// Auxiliary routes
// ============================================================================

#[tokio::test]
async fn test_root_reports_healthy() {
    let server = TestServer::start(Arc::new(seeded_database()), &Config::default()).await;

    let response = http_get(server.port, "/").await.unwrap();
    assert!(status_line(&response).contains("200"));
    assert!(body(&response).contains("\"message\":\"Healthy\""));

    let response = http_get(server.port, "/health").await.unwrap();
    assert!(status_line(&response).contains("200"));
    assert_eq!(body(&response), "ok");

    server.stop().await;
}

#[tokio::test]
async fn test_version_endpoint() {
    let server = TestServer::start(Arc::new(seeded_database()), &Config::default()).await;

    let response = http_get(server.port, "/version").await.unwrap();
    let info: Value = serde_json::from_str(body(&response)).unwrap();
    assert_eq!(info["name"], "routesmith");
    assert_eq!(info["version"], env!("CARGO_PKG_VERSION"));

    server.stop().await;
}

#[tokio::test]
async fn test_unknown_path_returns_404() {
    let server = TestServer::start(Arc::new(seeded_database()), &Config::default()).await;

    let response = http_get(server.port, "/api/v1/nothing-here").await.unwrap();
    assert!(status_line(&response).contains("404"));
    assert!(response.contains("NOT_FOUND"));

    server.stop().await;
}
