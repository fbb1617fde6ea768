//! Generated directory listings.

use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use std::fs;
use std::io;
use std::path::Path;
use std::time::SystemTime;

use crate::http::response::{Response, ResponseBuilder, StatusCode, html_escape};

/// Characters escaped in listing links.
const HREF: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}');

struct Entry {
    name: String,
    is_dir: bool,
    size: u64,
    modified: Option<SystemTime>,
}

/// Renders the `Index of <path>` page for `dir`.
///
/// `url_path` is the decoded request path and always ends with `/`.
pub fn listing(dir: &Path, url_path: &str) -> io::Result<Response> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        // broken symlinks and races with deletion are skipped
        let Ok(meta) = fs::metadata(entry.path()) else {
            continue;
        };
        entries.push(Entry {
            name,
            is_dir: meta.is_dir(),
            size: meta.len(),
            modified: meta.modified().ok(),
        });
    }
    entries.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name)));

    let title = format!("Index of {}", html_escape(url_path));
    let mut page = format!(
        "<!DOCTYPE html>\n<html>\n<head><title>{title}</title></head>\n<body>\n<h1>{title}</h1>\n<hr>\n<table>\n<tr><th>Name</th><th>Last modified</th><th>Size</th></tr>\n"
    );
    if url_path != "/" {
        page.push_str("<tr><td><a href=\"../\">../</a></td><td></td><td>-</td></tr>\n");
    }
    for entry in &entries {
        let suffix = if entry.is_dir { "/" } else { "" };
        let modified = entry
            .modified
            .map(httpdate::fmt_http_date)
            .unwrap_or_default();
        let size = if entry.is_dir {
            "-".to_string()
        } else {
            entry.size.to_string()
        };
        page.push_str(&format!(
            "<tr><td><a href=\"{href}{suffix}\">{name}{suffix}</a></td><td>{modified}</td><td>{size}</td></tr>\n",
            href = utf8_percent_encode(&entry.name, HREF),
            name = html_escape(&entry.name),
        ));
    }
    page.push_str("</table>\n<hr>\n</body>\n</html>\n");

    Ok(ResponseBuilder::new(StatusCode::Ok)
        .header("Content-Type", "text/html; charset=utf-8")
        .body(page)
        .build())
}
