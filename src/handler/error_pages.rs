//! Custom error pages.

use bytes::Bytes;
use std::path::Path;
use tracing::warn;

use crate::config::{Location, VirtualServer};
use crate::http::mime;
use crate::http::response::{Response, ResponseBody};

/// Replaces the body of an error response with the configured page.
///
/// The location's pages are consulted before the server's. The status is
/// left unchanged, and an unreadable page keeps the built-in body.
pub fn apply(
    mut response: Response,
    server: Option<&VirtualServer>,
    location: Option<&Location>,
) -> Response {
    if !response.status.is_error() {
        return response;
    }
    let code = response.status.as_u16();
    let page = location
        .and_then(|l| l.error_pages.get(&code))
        .or_else(|| server.and_then(|s| s.error_pages.get(&code)));
    let Some(page) = page else {
        return response;
    };

    match read_page(page) {
        Ok(content) => {
            response.headers.insert("Content-Type", mime::content_type_for(page));
            response.body = ResponseBody::Bytes(content);
        }
        Err(e) => {
            warn!(page = %page.display(), status = code, error = %e, "error page unreadable");
        }
    }
    response
}

fn read_page(page: &Path) -> std::io::Result<Bytes> {
    std::fs::read(page).map(Bytes::from)
}
