//! PUT and POST uploads.

use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

use crate::config::Location;
use crate::handler::multipart::{self, MultipartError};
use crate::handler::static_files::{io_error_response, is_contained};
use crate::http::mime;
use crate::http::request::Request;
use crate::http::response::{Response, ResponseBuilder, StatusCode};
use crate::router::path;

const NAME: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'?')
    .add(b'<')
    .add(b'>');

static UPLOAD_SEQ: AtomicU64 = AtomicU64::new(0);

/// Stores the request body at the request path.
///
/// Files land under the location's upload directory, or its root when none
/// is configured. Answers 201 for a new file and 200 for an overwrite.
pub fn put(location: &Location, relative: &str, request: &Request) -> Response {
    let base = location.files_root();
    let segments = match path::normalize(relative) {
        Ok(segments) => segments,
        Err(_) => return Response::error(StatusCode::Forbidden),
    };
    if segments.is_empty() {
        return Response::error(StatusCode::Forbidden);
    }
    let Ok(target) = path::resolve(base, relative) else {
        return Response::error(StatusCode::Forbidden);
    };
    if target.is_dir() {
        return Response::error(StatusCode::Forbidden);
    }

    let existed = target.is_file();
    let result = request
        .body
        .reader()
        .and_then(|reader| store(base, &target, reader));
    match result {
        Ok(None) => Response::error(StatusCode::Forbidden),
        Ok(Some(len)) => {
            info!(path = %target.display(), bytes = len, created = !existed, "stored upload");
            if existed {
                ResponseBuilder::new(StatusCode::Ok)
                    .header("Content-Type", "text/plain")
                    .body("Updated\n")
                    .build()
            } else {
                ResponseBuilder::new(StatusCode::Created)
                    .header("Location", request.raw_path.clone())
                    .header("Content-Type", "text/plain")
                    .body("Created\n")
                    .build()
            }
        }
        Err(e) => io_error_response(&e, &target),
    }
}

/// Stores a POSTed body (raw or `multipart/form-data`) in the upload directory.
pub fn post(location: &Location, relative: &str, request: &Request) -> Response {
    let Some(upload_dir) = location.upload_dir.as_deref() else {
        return Response::error(StatusCode::Forbidden);
    };
    let Ok(target) = path::resolve(upload_dir, relative) else {
        return Response::error(StatusCode::Forbidden);
    };

    // A path naming a file (not the upload directory itself) doubles as the
    // stored name.
    let names_file = !path::normalize(relative).is_ok_and(|s| s.is_empty()) && !target.is_dir();
    let (dir, path_hint, url_base) = if names_file {
        let parent = target.parent().unwrap_or(upload_dir).to_path_buf();
        let hint = target.file_name().and_then(|n| n.to_str()).map(str::to_string);
        let base = match request.raw_path.rsplit_once('/') {
            Some((base, _)) => format!("{base}/"),
            None => "/".to_string(),
        };
        (parent, hint, base)
    } else {
        let mut base = request.raw_path.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        (target, None, base)
    };

    let stored = match request.content_type().and_then(multipart::parse_boundary) {
        Some(boundary) => store_multipart(upload_dir, &dir, &boundary, request),
        None => store_raw(upload_dir, &dir, path_hint, request).map(|name| name.into_iter().collect()),
    };

    match stored {
        Ok(names) if names.is_empty() => Response::error(StatusCode::BadRequest),
        Ok(names) => {
            let location_url = format!("{url_base}{}", utf8_percent_encode(&names[0], NAME));
            let mut listing = String::new();
            for name in &names {
                listing.push_str(&format!("Stored {name}\n"));
            }
            info!(dir = %dir.display(), files = ?names, "stored upload");
            ResponseBuilder::new(StatusCode::Created)
                .header("Location", location_url)
                .header("Content-Type", "text/plain")
                .body(listing)
                .build()
        }
        Err(UploadError::Multipart(e)) => {
            warn!(error = %e, "rejected multipart body");
            Response::error(StatusCode::BadRequest)
        }
        Err(UploadError::Escape) => Response::error(StatusCode::Forbidden),
        Err(UploadError::Io(e)) => io_error_response(&e, &dir),
    }
}

#[derive(Debug)]
enum UploadError {
    Multipart(MultipartError),
    Escape,
    Io(io::Error),
}

impl From<io::Error> for UploadError {
    fn from(e: io::Error) -> Self {
        UploadError::Io(e)
    }
}

fn store_multipart(
    base: &Path,
    dir: &Path,
    boundary: &str,
    request: &Request,
) -> Result<Vec<String>, UploadError> {
    let body = request.body.to_bytes()?;
    let parts = multipart::parse(&body, boundary).map_err(UploadError::Multipart)?;
    let mut names = Vec::new();
    for part in parts {
        let Some(name) = part.filename.as_deref().and_then(sanitize_filename) else {
            debug!(field = ?part.name, "skipping non-file part");
            continue;
        };
        match store(base, &dir.join(&name), &part.data[..])? {
            Some(_) => names.push(name),
            None => return Err(UploadError::Escape),
        }
    }
    Ok(names)
}

fn store_raw(
    base: &Path,
    dir: &Path,
    path_hint: Option<String>,
    request: &Request,
) -> Result<Option<String>, UploadError> {
    let name = request
        .header("Content-Disposition")
        .and_then(|d| multipart::disposition_param(d, "filename"))
        .as_deref()
        .and_then(sanitize_filename)
        .or_else(|| path_hint.as_deref().and_then(sanitize_filename))
        .unwrap_or_else(|| generated_name(request.content_type()));
    match store(base, &dir.join(&name), request.body.reader()?)? {
        Some(_) => Ok(Some(name)),
        None => Err(UploadError::Escape),
    }
}

/// Writes `reader` to `target`, creating parent directories.
///
/// Returns `Ok(None)` when the parent resolves outside `base` through a
/// symlink, or when `target` itself is a symlink.
fn store(base: &Path, target: &Path, mut reader: impl Read) -> io::Result<Option<u64>> {
    let parent = target.parent().unwrap_or(base);
    fs::create_dir_all(base)?;
    fs::create_dir_all(parent)?;
    if !is_contained(base, parent)? {
        return Ok(None);
    }
    match fs::symlink_metadata(target) {
        Ok(meta) if meta.file_type().is_symlink() => {
            warn!(path = %target.display(), "refusing to write through a symlink");
            return Ok(None);
        }
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    let mut file = File::create(target)?;
    let written = io::copy(&mut reader, &mut file)?;
    file.sync_data()?;
    Ok(Some(written))
}

/// Keeps the final path component of a client-supplied name.
pub fn sanitize_filename(name: &str) -> Option<String> {
    let base = name.rsplit(|c: char| c == '/' || c == '\\').next()?.trim();
    if base.is_empty() || base == "." || base == ".." {
        return None;
    }
    let cleaned: String = base.chars().filter(|c| !c.is_control()).collect();
    if cleaned.is_empty() { None } else { Some(cleaned) }
}

fn generated_name(content_type: Option<&str>) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let seq = UPLOAD_SEQ.fetch_add(1, Ordering::Relaxed);
    let ext = content_type.and_then(mime::extension_for).unwrap_or("bin");
    format!("upload-{millis}-{seq}.{ext}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_keeps_basename() {
        assert_eq!(sanitize_filename("../../etc/passwd").as_deref(), Some("passwd"));
        assert_eq!(sanitize_filename("C:\\Users\\me\\a.txt").as_deref(), Some("a.txt"));
        assert_eq!(sanitize_filename(".."), None);
        assert_eq!(sanitize_filename("dir/"), None);
    }

    #[test]
    fn generated_names_are_unique() {
        let a = generated_name(Some("image/png"));
        let b = generated_name(None);
        assert_ne!(a, b);
        assert!(a.starts_with("upload-") && a.ends_with(".png"));
        assert!(b.ends_with(".bin"));
    }
}
