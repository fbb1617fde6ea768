//! Request routing.
//!
//! One [`Router`] exists per bound `host:port` pair. It picks the virtual
//! server by name among the servers sharing that pair, then the location
//! with the longest matching path prefix.

pub mod path;

use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{Config, Limits, Location, VirtualServer};
use crate::http::parser::BodyLimit;
use crate::http::request::Request;
use path::PathEscape;

/// The outcome of routing a request.
#[derive(Debug, Clone, Copy)]
pub struct Route<'a> {
    pub server: &'a VirtualServer,
    /// `None` when no location prefix matches the path.
    pub location: Option<&'a Location>,
    /// The decoded request path with the location prefix removed.
    pub relative: &'a str,
}

impl Route<'_> {
    /// Filesystem path for the request under the location's files root.
    pub fn resolve(&self) -> Result<Option<PathBuf>, PathEscape> {
        match self.location {
            Some(location) => path::resolve(location.files_root(), self.relative).map(Some),
            None => Ok(None),
        }
    }

    pub fn max_body_size(&self) -> u64 {
        match self.location {
            Some(location) => location.max_body_size(),
            None => self.server.client_max_body_size.as_u64(),
        }
    }
}

pub struct Router {
    config: Arc<Config>,
    servers: Vec<usize>,
}

impl Router {
    /// `servers` are indices into `config.servers`, in config order.
    pub fn new(config: Arc<Config>, servers: Vec<usize>) -> Self {
        let servers = servers
            .into_iter()
            .filter(|&i| i < config.servers.len())
            .collect();
        Self { config, servers }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn limits(&self) -> &Limits {
        &self.config.limits
    }

    /// The server named by `authority`, else the first server on this address.
    pub fn select_server(&self, authority: Option<&str>) -> Option<&VirtualServer> {
        let mut candidates = self.servers.iter().map(|&i| &self.config.servers[i]);
        if let Some(host) = authority.map(host_of) {
            if let Some(server) = candidates.clone().find(|s| s.matches_name(host)) {
                return Some(server);
            }
        }
        candidates.next()
    }

    /// Longest prefix on a segment boundary; the first of equal length wins.
    pub fn find_location<'a>(server: &'a VirtualServer, path: &str) -> Option<&'a Location> {
        let mut best: Option<&Location> = None;
        for location in &server.locations {
            if !path::has_segment_prefix(path, &location.path) {
                continue;
            }
            if best.is_none_or(|b| location.path.len() > b.path.len()) {
                best = Some(location);
            }
        }
        best
    }

    pub fn route<'a>(&'a self, request: &'a Request) -> Option<Route<'a>> {
        let server = self.select_server(request.host())?;
        let location = Self::find_location(server, &request.path);
        let relative = match location {
            Some(location) if location.path != "/" => &request.path[location.path.len()..],
            _ => request.path.strip_prefix('/').unwrap_or(&request.path),
        };
        Some(Route {
            server,
            location,
            relative,
        })
    }
}

impl BodyLimit for Router {
    fn max_body_size(&self, request: &Request) -> u64 {
        self.route(request)
            .map(|route| route.max_body_size())
            .unwrap_or(0)
    }
}

/// Host part of an authority: the port is stripped, IPv6 brackets kept out.
pub fn host_of(authority: &str) -> &str {
    let authority = authority.trim();
    if let Some(rest) = authority.strip_prefix('[') {
        return rest.split(']').next().unwrap_or(rest);
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if port.bytes().all(|b| b.is_ascii_digit()) => host,
        _ => authority,
    }
}
