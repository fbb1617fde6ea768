//! GET, HEAD and DELETE on files under a location's files root.

use std::fs::{self, File};
use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tracing::{debug, error, warn};

use crate::config::Location;
use crate::handler::autoindex;
use crate::http::mime;
use crate::http::request::Request;
use crate::http::response::{Response, ResponseBuilder, StatusCode};

/// Serves a file or directory for GET and HEAD.
pub fn serve(location: &Location, path: &Path, request: &Request) -> Response {
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) => return io_error_response(&e, path),
    };
    match is_contained(location.files_root(), path) {
        Ok(true) => {}
        Ok(false) => {
            warn!(path = %path.display(), "path leaves the location root");
            return Response::error(StatusCode::Forbidden);
        }
        Err(e) => return io_error_response(&e, path),
    }

    if !meta.is_dir() {
        return serve_file(path, request);
    }

    if !request.path.ends_with('/') {
        let mut target = format!("{}/", request.raw_path);
        if let Some(query) = &request.query {
            target.push('?');
            target.push_str(query);
        }
        return Response::redirect(StatusCode::MovedPermanently, target);
    }

    for index in &location.index {
        let candidate = path.join(index);
        if candidate.is_file() {
            return serve_file(&candidate, request);
        }
    }

    if location.autoindex {
        return match autoindex::listing(path, &request.path) {
            Ok(response) => response,
            Err(e) => io_error_response(&e, path),
        };
    }

    debug!(path = %path.display(), "directory without index");
    Response::error(StatusCode::Forbidden)
}

fn serve_file(path: &Path, request: &Request) -> Response {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) => return io_error_response(&e, path),
    };
    let meta = match file.metadata() {
        Ok(meta) => meta,
        Err(e) => return io_error_response(&e, path),
    };

    let modified = meta.modified().ok().map(truncate_to_seconds);
    if let (Some(modified), Some(since)) = (modified, request.header("If-Modified-Since")) {
        if is_not_modified_since(since, modified) {
            return ResponseBuilder::new(StatusCode::NotModified)
                .header("Last-Modified", httpdate::fmt_http_date(modified))
                .build();
        }
    }

    let mut builder = ResponseBuilder::new(StatusCode::Ok).header("Content-Type", mime::content_type_for(path));
    if let Some(modified) = modified {
        builder = builder.header("Last-Modified", httpdate::fmt_http_date(modified));
    }
    builder.file(file, meta.len()).build()
}

/// Removes a file. Directories are never deleted.
pub fn delete(location: &Location, path: &Path) -> Response {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) => return io_error_response(&e, path),
    };
    if meta.is_dir() {
        return Response::error(StatusCode::Forbidden);
    }
    if let Some(parent) = path.parent() {
        match is_contained(location.files_root(), parent) {
            Ok(true) => {}
            Ok(false) => return Response::error(StatusCode::Forbidden),
            Err(e) => return io_error_response(&e, path),
        }
    }
    match fs::remove_file(path) {
        Ok(()) => {
            debug!(path = %path.display(), "file deleted");
            ResponseBuilder::new(StatusCode::Ok)
                .header("Content-Type", "text/plain")
                .body(format!("Deleted {}\n", path.file_name().map(|n| n.to_string_lossy()).unwrap_or_default()))
                .build()
        }
        Err(e) => io_error_response(&e, path),
    }
}

/// Maps a filesystem error onto a response.
///
/// Anything other than a missing file or a permission problem is a resource
/// fault; the connection is closed after the 500.
pub fn io_error_response(e: &io::Error, path: &Path) -> Response {
    match e.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::NotADirectory => Response::error(StatusCode::NotFound),
        io::ErrorKind::PermissionDenied => Response::error(StatusCode::Forbidden),
        io::ErrorKind::IsADirectory => Response::error(StatusCode::Forbidden),
        _ => {
            error!(path = %path.display(), error = %e, "filesystem error");
            let mut response = Response::internal_error();
            response.close = true;
            response
        }
    }
}

/// True when the canonical form of `path` stays inside the canonical `root`.
pub(crate) fn is_contained(root: &Path, path: &Path) -> io::Result<bool> {
    let root = fs::canonicalize(root)?;
    let path = fs::canonicalize(path)?;
    Ok(path.starts_with(root))
}

fn truncate_to_seconds(time: SystemTime) -> SystemTime {
    let since_epoch = time
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    SystemTime::UNIX_EPOCH + Duration::from_secs(since_epoch.as_secs())
}

fn is_not_modified_since(header: &str, last_modified: SystemTime) -> bool {
    match httpdate::parse_http_date(header) {
        Ok(client_time) => last_modified <= client_time,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modified_since_uses_whole_seconds() {
        let modified = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let header = httpdate::fmt_http_date(modified);
        assert!(is_not_modified_since(&header, modified));
        assert!(!is_not_modified_since(&header, modified + Duration::from_secs(1)));
        assert!(!is_not_modified_since("yesterday", modified));
    }

    #[test]
    fn truncation_drops_subseconds() {
        let t = SystemTime::UNIX_EPOCH + Duration::from_millis(1_500);
        assert_eq!(truncate_to_seconds(t), SystemTime::UNIX_EPOCH + Duration::from_secs(1));
    }
}
