//! CGI/1.1 meta-variables (RFC 3875 §4.1).

use std::collections::HashMap;

use super::CgiRequest;
use crate::http::writer::SERVER_NAME;

/// Maximum number of HTTP_* variables passed to a script.
const MAX_HTTP_HEADERS: usize = 100;

/// Host variables passed through to scripts.
const PASSTHROUGH: [&str; 3] = ["PATH", "LANG", "TZ"];

/// Builds the complete environment of a CGI child.
pub fn build(cgi: &CgiRequest<'_>) -> HashMap<String, String> {
    let request = cgi.request;
    let mut env = HashMap::new();
    env.insert("GATEWAY_INTERFACE".into(), "CGI/1.1".into());
    env.insert("SERVER_PROTOCOL".into(), request.version.as_str().into());
    env.insert("SERVER_SOFTWARE".into(), SERVER_NAME.into());
    env.insert("SERVER_NAME".into(), cgi.server_name.clone());
    env.insert("SERVER_PORT".into(), cgi.server_port.to_string());
    env.insert("REQUEST_METHOD".into(), request.method.as_str().into());
    env.insert("REQUEST_URI".into(), request.target.clone());
    env.insert("QUERY_STRING".into(), request.query.clone().unwrap_or_default());
    env.insert("SCRIPT_NAME".into(), cgi.script_name.clone());
    env.insert(
        "SCRIPT_FILENAME".into(),
        cgi.script_path.to_string_lossy().into_owned(),
    );
    env.insert("PATH_INFO".into(), cgi.path_info.clone());
    if let Some(translated) = &cgi.path_translated {
        env.insert(
            "PATH_TRANSLATED".into(),
            translated.to_string_lossy().into_owned(),
        );
    }
    env.insert("REMOTE_ADDR".into(), cgi.remote.ip().to_string());
    env.insert("REMOTE_PORT".into(), cgi.remote.port().to_string());
    // php-cgi refuses to run without it
    env.insert("REDIRECT_STATUS".into(), "200".into());

    if !request.body.is_empty() || request.method.requires_body_framing() {
        env.insert("CONTENT_LENGTH".into(), request.body.len().to_string());
    }
    if let Some(content_type) = request.content_type() {
        env.insert("CONTENT_TYPE".into(), content_type.to_string());
    }

    let connection_tokens: Vec<String> = request
        .headers
        .get_all("Connection")
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    let mut header_count = 0;
    for (name, value) in request.headers.iter() {
        let lower = name.to_ascii_lowercase();
        if is_hop_by_hop_header(&lower)
            || connection_tokens.contains(&lower)
            || lower == "content-length"
            || lower == "content-type"
        {
            continue;
        }
        let key = format!("HTTP_{}", name.to_ascii_uppercase().replace('-', "_"));
        if let Some(existing) = env.get_mut(&key) {
            existing.push_str(", ");
            existing.push_str(value);
            continue;
        }
        if header_count >= MAX_HTTP_HEADERS {
            continue;
        }
        env.insert(key, value.to_string());
        header_count += 1;
    }

    for var in PASSTHROUGH {
        if let Ok(value) = std::env::var(var) {
            env.insert(var.to_string(), value);
        }
    }

    env
}

/// Check if a header name is a hop-by-hop or sensitive header.
fn is_hop_by_hop_header(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy"
            | "proxy-connection"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}
