//! Routesmith - dynamic routing configuration for tunneled sites
//!
//! This library turns the routing facts of a self-hosted tunnel platform
//! (orgs, sites, resources, targets) into the dynamic configuration a
//! reverse-proxy data plane polls:
//! - Reads one snapshot of enabled targets from SQLite per poll
//! - Derives host rules, entry points, TLS and wildcard certificates
//! - Resolves service addresses per site type (tunnel or WireGuard)
//! - Declares the auth gateway and https redirect middlewares
//! - Serves the document over HTTP/1.1 and HTTP/2

pub mod config;
pub mod db;
pub mod error;
pub mod server;
pub mod traefik;
