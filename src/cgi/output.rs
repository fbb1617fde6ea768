//! Parsing of the header block a CGI script prints before its body.

use super::CgiError;
use crate::http::headers::Headers;
use crate::http::is_token_byte;
use crate::http::response::StatusCode;

/// Status and headers announced by a script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CgiHead {
    pub status: StatusCode,
    pub headers: Headers,
}

/// Locates the blank line ending the header block.
///
/// Returns the offset of the terminator and its length; both `\r\n\r\n`
/// and `\n\n` are accepted.
pub fn find_header_boundary(data: &[u8]) -> Option<(usize, usize)> {
    for i in 0..data.len() {
        if data[i..].starts_with(b"\r\n\r\n") {
            return Some((i, 4));
        }
        if data[i..].starts_with(b"\n\n") {
            return Some((i, 2));
        }
    }
    None
}

/// Parses the header block and returns it with the offset where the body
/// starts.
///
/// Output without a blank line is taken to be all headers. Lines that are
/// not `name: value` are skipped; output with no usable header at all is
/// rejected.
pub fn split_output(output: &[u8]) -> Result<(CgiHead, usize), CgiError> {
    let (head_end, body_start) = match find_header_boundary(output) {
        Some((at, len)) => (at, at + len),
        None => (output.len(), output.len()),
    };
    Ok((parse_head(&output[..head_end])?, body_start))
}

pub fn parse_head(block: &[u8]) -> Result<CgiHead, CgiError> {
    let text = String::from_utf8_lossy(block);
    let mut status = None;
    let mut headers = Headers::new();
    let mut parsed = 0usize;

    for line in text.split('\n') {
        let line = line.trim_end_matches('\r');
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.is_empty() || !name.bytes().all(is_token_byte) {
            continue;
        }
        let value = value.trim();
        if name.eq_ignore_ascii_case("Status") {
            let code = value
                .split_whitespace()
                .next()
                .and_then(|c| c.parse::<u16>().ok())
                .and_then(StatusCode::from_u16);
            match code {
                Some(code) => status = Some(code),
                None => continue,
            }
        } else {
            headers.append(name, value);
        }
        parsed += 1;
    }

    if parsed == 0 {
        return Err(CgiError::InvalidOutput);
    }
    let status = status.unwrap_or(if headers.contains("Location") {
        StatusCode::Found
    } else {
        StatusCode::Ok
    });
    Ok(CgiHead { status, headers })
}
