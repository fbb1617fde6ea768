//! Request dispatch.
//!
//! [`Dispatcher::dispatch`] turns a parsed request into a response:
//! route → redirect → OPTIONS → method check → path resolution → CGI or
//! static handling → custom error pages.

pub mod autoindex;
pub mod error_pages;
pub mod multipart;
pub mod static_files;
pub mod upload;

use std::fs;
use tracing::{debug, warn};

use crate::cgi::{self, CgiGateway, CgiRequest};
use crate::http::connection::ConnInfo;
use crate::http::request::{Method, Request};
use crate::http::response::{Response, ResponseBuilder, StatusCode};
use crate::router::{Route, Router, host_of};

/// Methods advertised for `OPTIONS *`.
const SERVER_METHODS: &str = "GET, HEAD, POST, PUT, DELETE, OPTIONS";

pub struct Dispatcher {
    router: Router,
    gateway: CgiGateway,
}

impl Dispatcher {
    pub fn new(router: Router) -> Self {
        let gateway = CgiGateway::from_limits(router.limits());
        Self { router, gateway }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub async fn dispatch(&self, request: &Request, conn: &ConnInfo) -> Response {
        let Some(route) = self.router.route(request) else {
            return Response::not_found();
        };
        let response = self.handle(&route, request, conn).await;
        error_pages::apply(response, Some(route.server), route.location)
    }

    /// Response for a request that could not be parsed.
    ///
    /// Uses the error pages of the default server on this address.
    pub fn fault_response(&self, status: StatusCode) -> Response {
        let mut response = Response::error(status);
        response.close = true;
        error_pages::apply(response, self.router.select_server(None), None)
    }

    async fn handle(&self, route: &Route<'_>, request: &Request, conn: &ConnInfo) -> Response {
        if request.path == "*" {
            return ResponseBuilder::new(StatusCode::NoContent)
                .header("Allow", SERVER_METHODS)
                .build();
        }
        let Some(location) = route.location else {
            debug!(path = %request.path, "no matching location");
            return Response::not_found();
        };

        if let Some(redirect) = &location.redirect {
            let status = StatusCode::from_u16(redirect.code).unwrap_or(StatusCode::MovedPermanently);
            return Response::redirect(status, redirect.target.clone());
        }
        if request.method == Method::OPTIONS {
            return ResponseBuilder::new(StatusCode::NoContent)
                .header("Allow", location.allow_header())
                .build();
        }
        if !location.allows(request.method) {
            return Response::method_not_allowed(location.allow_header());
        }

        let path = match route.resolve() {
            Ok(Some(path)) => path,
            Ok(None) => return Response::not_found(),
            Err(_) => {
                warn!(path = %request.path, "path escapes the location root");
                return Response::error(StatusCode::Forbidden);
            }
        };

        if let Some(target) = cgi::locate_script(location, route.relative) {
            return self.run_cgi(route, &target, request, conn).await;
        }

        match request.method {
            Method::GET | Method::HEAD => static_files::serve(location, &path, request),
            Method::DELETE => static_files::delete(location, &path),
            Method::PUT => upload::put(location, route.relative, request),
            Method::POST => upload::post(location, route.relative, request),
            _ => Response::error(StatusCode::NotImplemented),
        }
    }

    async fn run_cgi(
        &self,
        route: &Route<'_>,
        target: &cgi::ScriptTarget,
        request: &Request,
        conn: &ConnInfo,
    ) -> Response {
        let Some(location) = route.location else {
            return Response::not_found();
        };
        let Some(interpreter) = location.cgi_interpreter(&target.extension) else {
            return Response::not_found();
        };
        let Ok(script) = crate::router::path::resolve(&location.root, &target.script) else {
            return Response::error(StatusCode::Forbidden);
        };
        let script_path = match fs::canonicalize(&script) {
            Ok(path) if path.is_file() => path,
            Ok(_) => return Response::not_found(),
            Err(e) => return static_files::io_error_response(&e, &script),
        };
        match static_files::is_contained(&location.root, &script_path) {
            Ok(true) => {}
            Ok(false) => return Response::error(StatusCode::Forbidden),
            Err(e) => return static_files::io_error_response(&e, &script),
        }

        let script_name = if location.path == "/" {
            format!("/{}", target.script)
        } else {
            format!("{}/{}", location.path, target.script)
        };
        let path_translated = if target.path_info.is_empty() {
            None
        } else {
            crate::router::path::resolve(&location.root, &target.path_info).ok()
        };
        let server_name = request
            .host()
            .map(host_of)
            .map(str::to_string)
            .or_else(|| route.server.server_names.first().cloned())
            .unwrap_or_else(|| conn.local.ip().to_string());

        let cgi = CgiRequest {
            request,
            interpreter,
            script_path,
            script_name,
            path_info: target.path_info.clone(),
            path_translated,
            server_name,
            server_port: conn.local.port(),
            remote: conn.peer,
        };
        match self.gateway.execute(&cgi).await {
            Ok(response) => response,
            Err(e) => {
                warn!(script = %cgi.script_name, error = %e, "CGI failed");
                Response::error(e.status())
            }
        }
    }
}
