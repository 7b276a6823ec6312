//! Dynamic routing configuration for the reverse-proxy data plane
//!
//! The data plane polls for a document of routers, services and
//! middlewares. Each call reads one snapshot of enabled targets and runs
//! three pure steps over it:
//! - [`filter_routable`] drops rows missing a resource, subdomain, org
//!   domain or site, and resolves how the data plane reaches each target
//! - [`derive_routes`] computes the routers and service for one target
//! - [`assemble`] places every target's routes next to the fixed middlewares
//!
//! Maps are ordered so an unchanged snapshot always serializes to the same
//! bytes.

use crate::config::Config;
use crate::db::{RoutingSource, SiteRecord, SourceError, TargetRecord, TargetRow};
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::debug;

/// Auth gateway middleware attached to every primary router
pub const BADGER_MIDDLEWARE: &str = "badger";

/// Permanent http to https redirect used by redirect routers
pub const REDIRECT_MIDDLEWARE: &str = "redirect-to-https";

/// Process-wide values the synthesizer reads, fixed at startup
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderSettings {
    pub cert_resolver: String,
    pub http_entrypoint: String,
    pub https_entrypoint: String,
    pub prefer_wildcard_cert: bool,
    pub api_base_url: String,
    pub resource_session_cookie_name: String,
    pub user_session_cookie_name: String,
    pub session_query_parameter: String,
}

impl ProviderSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            cert_resolver: config.traefik.cert_resolver.clone(),
            http_entrypoint: config.traefik.http_entrypoint.clone(),
            https_entrypoint: config.traefik.https_entrypoint.clone(),
            prefer_wildcard_cert: config.traefik.prefer_wildcard_cert,
            api_base_url: config.server.internal_api_base_url(),
            resource_session_cookie_name: config.badger.resource_session_cookie_name.clone(),
            user_session_cookie_name: config.server.session_cookie_name.clone(),
            session_query_parameter: config.badger.session_query_parameter.clone(),
        }
    }
}

// ==================== Document ====================

/// Top-level document; serializes to `{}` when there is nothing to route
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConfigDocument {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpConfig>,
}

impl ConfigDocument {
    pub fn is_empty(&self) -> bool {
        self.http.is_none()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HttpConfig {
    pub routers: BTreeMap<String, Router>,
    pub services: BTreeMap<String, Service>,
    pub middlewares: BTreeMap<String, Middleware>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Router {
    pub entry_points: Vec<String>,
    pub middlewares: Vec<String>,
    pub service: String,
    pub rule: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<RouterTls>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouterTls {
    pub cert_resolver: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub domains: Vec<TlsDomain>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TlsDomain {
    pub main: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub load_balancer: LoadBalancer,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoadBalancer {
    pub servers: Vec<Server>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Server {
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Middleware {
    Plugin(BTreeMap<String, BadgerPlugin>),
    RedirectScheme(RedirectScheme),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BadgerPlugin {
    pub api_base_url: String,
    pub resource_session_cookie_name: String,
    pub user_session_cookie_name: String,
    pub session_query_parameter: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RedirectScheme {
    pub scheme: String,
    pub permanent: bool,
}

// ==================== Filtering ====================

/// How the data plane reaches a target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upstream {
    /// Behind a tunnel client, reached through the site's gateway address
    Tunnel { gateway_ip: String, internal_port: u16 },
    /// Reachable over an established WireGuard peer
    WireGuard { ip: String, port: u16 },
}

impl Upstream {
    pub fn url(&self, method: &str) -> String {
        match self {
            Upstream::Tunnel {
                gateway_ip,
                internal_port,
            } => format!("{}://{}:{}", method, gateway_ip, internal_port),
            Upstream::WireGuard { ip, port } => format!("{}://{}:{}", method, ip, port),
        }
    }
}

/// A target row with every field routing needs present
#[derive(Debug, Clone, PartialEq)]
pub struct RoutableTarget {
    pub target_id: i64,
    pub method: String,
    pub subdomain: String,
    pub org_domain: String,
    pub ssl: bool,
    /// None when the site type is unknown or its address data is incomplete
    pub upstream: Option<Upstream>,
}

/// Keep rows that can be routed, skipping partial joins
pub fn filter_routable(rows: Vec<TargetRow>) -> Vec<RoutableTarget> {
    rows.into_iter()
        .filter_map(|row| {
            let target_id = row.target.target_id;
            let routable = routable_target(row);
            if routable.is_none() {
                debug!(target_id, "Skipping target without a public domain or site");
            }
            routable
        })
        .collect()
}

fn routable_target(row: TargetRow) -> Option<RoutableTarget> {
    if !row.target.enabled {
        return None;
    }
    let resource = row.resource?;
    let subdomain = resource.subdomain?;
    let org_domain = row.org?.domain?;
    let site = row.site?;

    let upstream = resolve_upstream(&site, &row.target);

    Some(RoutableTarget {
        target_id: row.target.target_id,
        method: row.target.method,
        subdomain,
        org_domain,
        ssl: resource.ssl,
        upstream,
    })
}

fn resolve_upstream(site: &SiteRecord, target: &TargetRecord) -> Option<Upstream> {
    match site.site_type.as_str() {
        "newt" | "tunnel" => {
            let internal_port = target.internal_port.and_then(|port| u16::try_from(port).ok());
            let (Some(subnet), Some(internal_port)) = (site.subnet.as_deref(), internal_port)
            else {
                debug!(
                    site_id = site.site_id,
                    target_id = target.target_id,
                    internal_port = ?target.internal_port,
                    "Tunnel target lacks a subnet or valid internal port, no service emitted"
                );
                return None;
            };
            Some(Upstream::Tunnel {
                gateway_ip: subnet_address(subnet).to_string(),
                internal_port,
            })
        }
        "wireguard" => match u16::try_from(target.port) {
            Ok(port) => Some(Upstream::WireGuard {
                ip: target.ip.clone(),
                port,
            }),
            Err(_) => {
                debug!(
                    target_id = target.target_id,
                    port = target.port,
                    "WireGuard target port out of range, no service emitted"
                );
                None
            }
        },
        other => {
            debug!(
                site_id = site.site_id,
                site_type = other,
                "Unknown site type, no service emitted"
            );
            None
        }
    }
}

/// Address part of a CIDR string (`10.0.0.1/24` -> `10.0.0.1`)
pub fn subnet_address(subnet: &str) -> &str {
    subnet.split_once('/').map_or(subnet, |(addr, _)| addr)
}

// ==================== Derivation ====================

pub fn full_domain(subdomain: &str, org_domain: &str) -> String {
    format!("{}.{}", subdomain, org_domain)
}

/// Wildcard covering the parent zone of `domain`
///
/// Two labels or fewer get a wildcard below the domain itself.
pub fn wildcard_domain(domain: &str) -> String {
    match domain.split_once('.') {
        Some((_, parent)) if parent.contains('.') => format!("*.{}", parent),
        _ => format!("*.{}", domain),
    }
}

pub fn router_name(target_id: i64) -> String {
    format!("{}-router", target_id)
}

pub fn redirect_router_name(target_id: i64) -> String {
    format!("{}-router-redirect", target_id)
}

pub fn service_name(target_id: i64) -> String {
    format!("{}-service", target_id)
}

/// Routers and service contributed by one target
#[derive(Debug, Clone, PartialEq)]
pub struct TargetRoutes {
    pub routers: Vec<(String, Router)>,
    pub service: Option<(String, Service)>,
}

pub fn derive_routes(target: &RoutableTarget, settings: &ProviderSettings) -> TargetRoutes {
    let domain = full_domain(&target.subdomain, &target.org_domain);
    let rule = format!("Host(`{}`)", domain);
    let service = service_name(target.target_id);

    let tls = target.ssl.then(|| RouterTls {
        cert_resolver: settings.cert_resolver.clone(),
        domains: if settings.prefer_wildcard_cert {
            vec![TlsDomain {
                main: wildcard_domain(&domain),
            }]
        } else {
            Vec::new()
        },
    });

    let entrypoint = if target.ssl {
        &settings.https_entrypoint
    } else {
        &settings.http_entrypoint
    };

    let mut routers = vec![(
        router_name(target.target_id),
        Router {
            entry_points: vec![entrypoint.clone()],
            middlewares: vec![BADGER_MIDDLEWARE.to_string()],
            service: service.clone(),
            rule: rule.clone(),
            tls,
        },
    )];

    // Plaintext listener for TLS resources so http:// links redirect
    if target.ssl {
        routers.push((
            redirect_router_name(target.target_id),
            Router {
                entry_points: vec![settings.http_entrypoint.clone()],
                middlewares: vec![REDIRECT_MIDDLEWARE.to_string()],
                service: service.clone(),
                rule,
                tls: None,
            },
        ));
    }

    let service = target.upstream.as_ref().map(|upstream| {
        (
            service,
            Service {
                load_balancer: LoadBalancer {
                    servers: vec![Server {
                        url: upstream.url(&target.method),
                    }],
                },
            },
        )
    });

    TargetRoutes { routers, service }
}

// ==================== Assembly ====================

/// Middlewares declared on every document, used or not
pub fn fixed_middlewares(settings: &ProviderSettings) -> BTreeMap<String, Middleware> {
    let badger = BadgerPlugin {
        api_base_url: settings.api_base_url.clone(),
        resource_session_cookie_name: settings.resource_session_cookie_name.clone(),
        user_session_cookie_name: settings.user_session_cookie_name.clone(),
        session_query_parameter: settings.session_query_parameter.clone(),
    };

    BTreeMap::from([
        (
            BADGER_MIDDLEWARE.to_string(),
            Middleware::Plugin(BTreeMap::from([(BADGER_MIDDLEWARE.to_string(), badger)])),
        ),
        (
            REDIRECT_MIDDLEWARE.to_string(),
            Middleware::RedirectScheme(RedirectScheme {
                scheme: "https".to_string(),
                permanent: true,
            }),
        ),
    ])
}

pub fn assemble(routes: Vec<TargetRoutes>, settings: &ProviderSettings) -> ConfigDocument {
    let mut http = HttpConfig {
        middlewares: fixed_middlewares(settings),
        ..Default::default()
    };

    for target_routes in routes {
        http.routers.extend(target_routes.routers);
        if let Some((name, service)) = target_routes.service {
            http.services.insert(name, service);
        }
    }

    ConfigDocument { http: Some(http) }
}

/// Build the routing document from one snapshot of `source`
///
/// An empty snapshot yields an empty document. A read failure yields an
/// error and no document.
pub fn synthesize(
    source: &dyn RoutingSource,
    settings: &ProviderSettings,
) -> Result<ConfigDocument, SourceError> {
    let rows = source.load_targets()?;
    if rows.is_empty() {
        debug!("No routable targets, returning empty configuration");
        return Ok(ConfigDocument::default());
    }

    let row_count = rows.len();
    let routes = filter_routable(rows)
        .iter()
        .map(|target| derive_routes(target, settings))
        .collect::<Vec<_>>();
    let document = assemble(routes, settings);

    if let Some(http) = &document.http {
        debug!(
            rows = row_count,
            routers = http.routers.len(),
            services = http.services.len(),
            "Synthesized routing configuration"
        );
    }

    Ok(document)
}
