use percent_encoding::percent_decode_str;
use serde::Deserialize;
use std::fmt;

use crate::http::body::Body;
use crate::http::headers::Headers;
use crate::http::parser::ParseError;

/// HTTP request methods.
///
/// Every method in this enum is recognized by the parser. Whether a method is
/// accepted for a given path is decided per location by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum Method {
    /// GET - Retrieve a resource
    GET,
    /// POST - Create or submit data
    POST,
    /// PUT - Replace a resource
    PUT,
    /// DELETE - Delete a resource
    DELETE,
    /// HEAD - Like GET but without the response body
    HEAD,
    /// OPTIONS - Describe communication options
    OPTIONS,
    /// PATCH - Partial modification of a resource
    PATCH,
}

impl Method {
    /// Parses an HTTP method from a string.
    ///
    /// # Arguments
    ///
    /// * `s` - String representation of the method (case-sensitive, typically uppercase)
    ///
    /// # Returns
    ///
    /// `Some(Method)` if the string matches a known method, `None` otherwise.
    ///
    /// # Example
    ///
    /// ```
    /// # use webserv::http::request::Method;
    /// assert_eq!(Method::from_str("GET"), Some(Method::GET));
    /// assert_eq!(Method::from_str("get"), None);
    /// ```
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "GET" => Some(Method::GET),
            "POST" => Some(Method::POST),
            "PUT" => Some(Method::PUT),
            "DELETE" => Some(Method::DELETE),
            "HEAD" => Some(Method::HEAD),
            "OPTIONS" => Some(Method::OPTIONS),
            "PATCH" => Some(Method::PATCH),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::GET => "GET",
            Method::POST => "POST",
            Method::PUT => "PUT",
            Method::DELETE => "DELETE",
            Method::HEAD => "HEAD",
            Method::OPTIONS => "OPTIONS",
            Method::PATCH => "PATCH",
        }
    }

    /// Methods whose requests must announce a body length.
    pub fn requires_body_framing(&self) -> bool {
        matches!(self, Method::POST | Method::PUT)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Protocol version of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    pub fn as_str(&self) -> &'static str {
        match self {
            Version::Http10 => "HTTP/1.0",
            Version::Http11 => "HTTP/1.1",
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request target split into its routing components.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Percent-decoded path, e.g. `/my files/a.txt`
    pub path: String,
    /// Path exactly as it appeared on the wire
    pub raw_path: String,
    /// Query string without the leading `?`
    pub query: Option<String>,
    /// Authority of an absolute-form target (`host[:port]`)
    pub authority: Option<String>,
}

impl Target {
    /// Splits and decodes a request target.
    ///
    /// Accepts origin-form (`/path?query`), absolute-form
    /// (`http://host:port/path`) and the asterisk form used by `OPTIONS *`.
    pub fn parse(target: &str) -> Result<Self, ParseError> {
        if target == "*" {
            return Ok(Self {
                path: "*".to_string(),
                raw_path: "*".to_string(),
                query: None,
                authority: None,
            });
        }

        let (raw_path, query, authority) = if target.starts_with('/') {
            match target.split_once('?') {
                Some((path, query)) => (path.to_string(), Some(query.to_string()), None),
                None => (target.to_string(), None, None),
            }
        } else if is_absolute_form(target) {
            let url = url::Url::parse(target).map_err(|_| ParseError::InvalidTarget)?;
            let host = url.host_str().ok_or(ParseError::InvalidTarget)?;
            let authority = match url.port() {
                Some(port) => format!("{host}:{port}"),
                None => host.to_string(),
            };
            (
                url.path().to_string(),
                url.query().map(str::to_string),
                Some(authority),
            )
        } else {
            return Err(ParseError::InvalidTarget);
        };

        let path = percent_decode_str(&raw_path)
            .decode_utf8()
            .map_err(|_| ParseError::InvalidTarget)?
            .into_owned();
        if path.contains('\0') {
            return Err(ParseError::InvalidTarget);
        }

        Ok(Self {
            path,
            raw_path,
            query,
            authority,
        })
    }
}

fn is_absolute_form(target: &str) -> bool {
    let lower = target.get(..8).unwrap_or(target).to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Represents a parsed HTTP request from a client.
///
/// Contains all information extracted from the request line and headers,
/// plus the fully received body. Requests are immutable once the parser
/// hands them out.
#[derive(Debug)]
pub struct Request {
    /// The HTTP method (GET, POST, etc.)
    pub method: Method,
    /// The request target as received (e.g. "/search?q=rust")
    pub target: String,
    /// Percent-decoded path without the query (e.g. "/search")
    pub path: String,
    /// Undecoded path, used when echoing the path back (redirects)
    pub raw_path: String,
    /// Query string without the leading `?`
    pub query: Option<String>,
    pub version: Version,
    /// Authority from an absolute-form target; wins over `Host`
    pub authority: Option<String>,
    pub headers: Headers,
    pub body: Body,
}

impl Request {
    /// Retrieves the first value of a header (case-insensitive).
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key)
    }

    /// Authority used for virtual-host selection.
    pub fn host(&self) -> Option<&str> {
        self.authority.as_deref().or_else(|| self.header("Host"))
    }

    /// Number of body bytes received.
    pub fn content_length(&self) -> u64 {
        self.body.len()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("Content-Type")
    }

    /// Determines whether the connection should remain open after the response.
    ///
    /// HTTP/1.1 keeps the connection unless `Connection: close` is sent;
    /// HTTP/1.0 only keeps it when the client asks for `keep-alive`.
    pub fn keep_alive(&self) -> bool {
        if self.headers.has_token("Connection", "close") {
            return false;
        }
        match self.version {
            Version::Http11 => true,
            Version::Http10 => self.headers.has_token("Connection", "keep-alive"),
        }
    }
}

/// Builder for constructing Request objects.
pub struct RequestBuilder {
    method: Option<Method>,
    target: Option<String>,
    version: Version,
    headers: Headers,
    body: Body,
}

impl Default for RequestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestBuilder {
    pub fn new() -> Self {
        Self {
            method: None,
            target: None,
            version: Version::Http11,
            headers: Headers::new(),
            body: Body::Empty,
        }
    }

    pub fn method(mut self, method: Method) -> Self {
        self.method = Some(method);
        self
    }

    pub fn target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.append(key, value);
        self
    }

    pub fn body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    pub fn build(self) -> Result<Request, &'static str> {
        let target = self.target.ok_or("target missing")?;
        let parts = Target::parse(&target).map_err(|_| "invalid target")?;
        Ok(Request {
            method: self.method.ok_or("method missing")?,
            target,
            path: parts.path,
            raw_path: parts.raw_path,
            query: parts.query,
            version: self.version,
            authority: parts.authority,
            headers: self.headers,
            body: self.body,
        })
    }
}
