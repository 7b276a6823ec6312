use crate::db::RoutingSource;
use crate::error::{json_error_response, ErrorCode};
use crate::traefik::{synthesize, ProviderSettings};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Version information for the provider
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Path the data plane polls for its dynamic configuration
pub const CONFIG_PATH: &str = "/api/v1/traefik-config";

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

/// State shared by every connection
struct Shared {
    source: Arc<dyn RoutingSource>,
    settings: ProviderSettings,
}

/// HTTP server the data plane polls for routing configuration
pub struct ConfigServer {
    bind_addr: SocketAddr,
    shared: Arc<Shared>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ConfigServer {
    pub fn new(
        bind_addr: SocketAddr,
        source: Arc<dyn RoutingSource>,
        settings: ProviderSettings,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            shared: Arc::new(Shared { source, settings }),
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener until shutdown is signalled
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(%addr, "Config provider listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let shared = Arc::clone(&self.shared);
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, shared).await {
                                    debug!(addr = %addr, error = %e, "Provider connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept provider connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Config provider shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection<S>(stream: S, shared: Arc<Shared>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let shared = Arc::clone(&shared);
        async move { handle_request(req, shared).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Provider connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    shared: Arc<Shared>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let path = req.uri().path();
    let method = req.method();

    debug!(%method, %path, "Provider request");

    let response = match (method, path) {
        (&Method::GET, "/") => json_response(
            StatusCode::OK,
            serde_json::json!({ "message": "Healthy" }).to_string(),
        ),

        (&Method::GET, "/health") => response(StatusCode::OK, "ok"),

        (&Method::GET, "/version") => {
            let version_info = serde_json::json!({
                "name": PKG_NAME,
                "version": VERSION,
            });
            json_response(StatusCode::OK, version_info.to_string())
        }

        (&Method::GET, CONFIG_PATH) => traefik_config_response(shared).await,

        _ => json_error_response(ErrorCode::NotFound, "not found"),
    };

    Ok(response)
}

/// Synthesize off the async executor, the read holds the database lock
async fn traefik_config_response(shared: Arc<Shared>) -> Response<Full<Bytes>> {
    let result = tokio::task::spawn_blocking(move || {
        synthesize(shared.source.as_ref(), &shared.settings)
    })
    .await;

    let document = match result {
        Ok(Ok(document)) => document,
        Ok(Err(e)) => {
            error!(error = %e, "Failed to build traefik config");
            return json_error_response(
                ErrorCode::ConfigBuildFailed,
                "Failed to build traefik config",
            );
        }
        Err(e) => {
            error!(error = %e, "Config synthesis task failed");
            return json_error_response(ErrorCode::InternalError, "Failed to build traefik config");
        }
    };

    match document.to_json() {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(e) => {
            error!(error = %e, "Failed to serialize traefik config");
            json_error_response(ErrorCode::InternalError, "Failed to build traefik config")
        }
    }
}
