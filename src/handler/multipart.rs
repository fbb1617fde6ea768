//! `multipart/form-data` bodies.

use bytes::Bytes;
use thiserror::Error;

use crate::http::find_bytes;
use crate::http::headers::Headers;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MultipartError {
    #[error("missing multipart boundary")]
    MissingBoundary,
    #[error("body does not start with the boundary delimiter")]
    MissingDelimiter,
    #[error("multipart body ends inside a part")]
    UnterminatedPart,
    #[error("malformed part headers")]
    InvalidPartHeaders,
}

/// One part of a multipart body.
#[derive(Debug, Clone)]
pub struct Part {
    pub name: Option<String>,
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub data: Bytes,
}

/// Extracts the boundary parameter of a `multipart/form-data` content type.
///
/// # Example
///
/// ```
/// # use webserv::handler::multipart::parse_boundary;
/// assert_eq!(
///     parse_boundary("multipart/form-data; boundary=\"abc\"").as_deref(),
///     Some("abc")
/// );
/// assert_eq!(parse_boundary("text/plain"), None);
/// ```
pub fn parse_boundary(content_type: &str) -> Option<String> {
    let mut params = content_type.split(';');
    let essence = params.next()?.trim();
    if !essence.eq_ignore_ascii_case("multipart/form-data") {
        return None;
    }
    params
        .filter_map(|p| p.split_once('='))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_, v)| v.trim().trim_matches('"').to_string())
        .filter(|b| !b.is_empty())
}

/// Value of a parameter such as `filename` in a `Content-Disposition` header.
///
/// The disposition type may be left out, as in `filename=a.txt`.
///
/// ```
/// # use webserv::handler::multipart::disposition_param;
/// assert_eq!(disposition_param("attachment; filename=\"a.txt\"", "filename").as_deref(), Some("a.txt"));
/// assert_eq!(disposition_param("filename=b.txt", "filename").as_deref(), Some("b.txt"));
/// ```
pub fn disposition_param(disposition: &str, param: &str) -> Option<String> {
    disposition
        .split(';')
        .filter_map(|p| p.split_once('='))
        .find(|(k, _)| k.trim().eq_ignore_ascii_case(param))
        .map(|(_, v)| v.trim().trim_matches('"').to_string())
}

/// Splits a complete multipart body into its parts.
pub fn parse(body: &[u8], boundary: &str) -> Result<Vec<Part>, MultipartError> {
    if boundary.is_empty() {
        return Err(MultipartError::MissingBoundary);
    }
    let delimiter = format!("--{boundary}").into_bytes();
    let separator = format!("\r\n--{boundary}").into_bytes();

    let start = find_bytes(body, &delimiter).ok_or(MultipartError::MissingDelimiter)?;
    let mut rest = &body[start + delimiter.len()..];
    let mut parts = Vec::new();

    loop {
        if rest.starts_with(b"--") {
            return Ok(parts);
        }
        rest = rest
            .strip_prefix(b"\r\n")
            .ok_or(MultipartError::InvalidPartHeaders)?;

        let head_end = find_bytes(rest, b"\r\n\r\n").ok_or(MultipartError::UnterminatedPart)?;
        let headers = parse_part_headers(&rest[..head_end])?;
        rest = &rest[head_end + 4..];

        let data_end = find_bytes(rest, &separator).ok_or(MultipartError::UnterminatedPart)?;
        let data = Bytes::copy_from_slice(&rest[..data_end]);
        rest = &rest[data_end + separator.len()..];

        let disposition = headers.get("Content-Disposition").unwrap_or("");
        parts.push(Part {
            name: disposition_param(disposition, "name"),
            filename: disposition_param(disposition, "filename"),
            content_type: headers.get("Content-Type").map(str::to_string),
            data,
        });
    }
}

fn parse_part_headers(block: &[u8]) -> Result<Headers, MultipartError> {
    let text = std::str::from_utf8(block).map_err(|_| MultipartError::InvalidPartHeaders)?;
    let mut headers = Headers::new();
    for line in text.split("\r\n").filter(|l| !l.is_empty()) {
        let (name, value) = line
            .split_once(':')
            .ok_or(MultipartError::InvalidPartHeaders)?;
        headers.append(name.trim(), value.trim());
    }
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &[u8] = b"--XyZ\r\n\
Content-Disposition: form-data; name=\"file\"; filename=\"hello.txt\"\r\n\
Content-Type: text/plain\r\n\
\r\n\
hello\r\nworld\r\n\
--XyZ\r\n\
Content-Disposition: form-data; name=\"note\"\r\n\
\r\n\
hi\r\n\
--XyZ--\r\n";

    #[test]
    fn parses_file_and_field_parts() {
        let parts = parse(BODY, "XyZ").unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].filename.as_deref(), Some("hello.txt"));
        assert_eq!(parts[0].content_type.as_deref(), Some("text/plain"));
        assert_eq!(&parts[0].data[..], b"hello\r\nworld");
        assert_eq!(parts[1].name.as_deref(), Some("note"));
        assert_eq!(parts[1].filename, None);
    }

    #[test]
    fn disposition_without_type() {
        assert_eq!(
            disposition_param("filename=delete_me.txt", "filename").as_deref(),
            Some("delete_me.txt")
        );
        assert_eq!(disposition_param("form-data; name=\"f\"", "filename"), None);
        assert_eq!(disposition_param("form-data; filename=\"x\"", "name"), None);
    }

    #[test]
    fn missing_close_delimiter_is_an_error() {
        let truncated = &BODY[..40];
        assert_eq!(parse(truncated, "XyZ").unwrap_err(), MultipartError::UnterminatedPart);
        assert_eq!(parse(b"garbage", "XyZ").unwrap_err(), MultipartError::MissingDelimiter);
    }
}
