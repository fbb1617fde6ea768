//! MIME type detection based on file extensions.

use std::path::Path;

/// Content type to announce for a file, `application/octet-stream` when the
/// extension is unknown. Text types are labelled UTF-8.
pub fn content_type_for(path: &Path) -> String {
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    if mime.type_() == mime_guess::mime::TEXT && mime.get_param(mime_guess::mime::CHARSET).is_none() {
        format!("{}; charset=utf-8", mime.essence_str())
    } else {
        mime.to_string()
    }
}

/// Extensions preferred over the alphabetically first candidate.
const PREFERRED: [(&str, &str); 8] = [
    ("text/plain", "txt"),
    ("text/html", "html"),
    ("text/css", "css"),
    ("application/json", "json"),
    ("application/javascript", "js"),
    ("application/octet-stream", "bin"),
    ("image/jpeg", "jpg"),
    ("image/svg+xml", "svg"),
];

/// Preferred file extension for a content type, without the dot.
pub fn extension_for(content_type: &str) -> Option<&'static str> {
    let essence = content_type.split(';').next()?.trim();
    if let Some((_, ext)) = PREFERRED.iter().find(|(mime, _)| mime.eq_ignore_ascii_case(essence)) {
        return Some(*ext);
    }
    let candidates = mime_guess::get_mime_extensions_str(essence)?;
    // a candidate that maps back to the same type beats an alias
    candidates
        .iter()
        .find(|ext| {
            mime_guess::from_ext(ext)
                .first()
                .is_some_and(|m| m.essence_str().eq_ignore_ascii_case(essence))
        })
        .or_else(|| candidates.first())
        .copied()
}
