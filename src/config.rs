//! Server configuration.
//!
//! The configuration is a YAML document read once at startup. After
//! [`Config::validate`] every location carries its effective settings
//! (root, index files, body limit), so request handling never has to walk
//! back up to the server block.
//!
//! ```yaml
//! servers:
//!   - listen: ["127.0.0.1:8080"]
//!     server_names: [localhost]
//!     root: ./www
//!     error_pages: { 404: ./www/errors/404.html }
//!     locations:
//!       - path: /
//!         methods: [GET, POST]
//!       - path: /cgi-bin
//!         cgi: { .py: /usr/bin/python3 }
//! ```

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::http::request::Method;

/// Environment variable consulted when no config path is given on the command line.
pub const CONFIG_ENV: &str = "WEBSERV_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "webserv.yaml";
pub const DEFAULT_INDEX: &str = "index.html";

/// Picks the configuration file: command-line argument, then
/// `WEBSERV_CONFIG`, then `webserv.yaml`.
pub fn resolve_path(arg: Option<String>) -> PathBuf {
    arg.or_else(|| std::env::var(CONFIG_ENV).ok())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string())
        .into()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub limits: Limits,
    pub servers: Vec<VirtualServer>,
}

/// Daemon-wide limits and timeouts.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Limits {
    pub keepalive_timeout_secs: u64,
    pub cgi_timeout_secs: u64,
    pub max_uri_length: usize,
    pub max_header_bytes: usize,
    /// Request bodies above this size are spooled to disk.
    pub body_memory_threshold: ByteSize,
    /// CGI output above this size is streamed instead of buffered.
    pub cgi_buffer_limit: ByteSize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            keepalive_timeout_secs: 60,
            cgi_timeout_secs: 10,
            max_uri_length: 8192,
            max_header_bytes: 8192,
            body_memory_threshold: ByteSize(1024 * 1024),
            cgi_buffer_limit: ByteSize(4 * 1024 * 1024),
        }
    }
}

impl Limits {
    pub fn keepalive_timeout(&self) -> Duration {
        Duration::from_secs(self.keepalive_timeout_secs)
    }

    pub fn cgi_timeout(&self) -> Duration {
        Duration::from_secs(self.cgi_timeout_secs)
    }
}

/// A byte count written as an integer or with a `K`, `M` or `G` suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "SizeRepr")]
pub struct ByteSize(pub u64);

#[derive(Deserialize)]
#[serde(untagged)]
enum SizeRepr {
    Number(u64),
    Text(String),
}

impl TryFrom<SizeRepr> for ByteSize {
    type Error = String;

    fn try_from(repr: SizeRepr) -> Result<Self, Self::Error> {
        match repr {
            SizeRepr::Number(n) => Ok(ByteSize(n)),
            SizeRepr::Text(text) => ByteSize::parse(&text),
        }
    }
}

impl ByteSize {
    /// Parses `"512"`, `"10K"`, `"1M"` or `"2G"` (suffix case-insensitive).
    ///
    /// # Example
    ///
    /// ```
    /// # use webserv::config::ByteSize;
    /// assert_eq!(ByteSize::parse("1M"), Ok(ByteSize(1024 * 1024)));
    /// assert!(ByteSize::parse("1X").is_err());
    /// ```
    pub fn parse(text: &str) -> Result<Self, String> {
        let text = text.trim();
        let (digits, multiplier) = match text.chars().last().map(|c| c.to_ascii_uppercase()) {
            Some('K') => (&text[..text.len() - 1], 1024),
            Some('M') => (&text[..text.len() - 1], 1024 * 1024),
            Some('G') => (&text[..text.len() - 1], 1024 * 1024 * 1024),
            _ => (text, 1),
        };
        let value: u64 = digits
            .parse()
            .map_err(|_| format!("invalid size {text:?}"))?;
        value
            .checked_mul(multiplier)
            .map(ByteSize)
            .ok_or_else(|| format!("size {text:?} is too large"))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn as_usize(&self) -> usize {
        usize::try_from(self.0).unwrap_or(usize::MAX)
    }
}

fn default_body_size() -> ByteSize {
    ByteSize(1024 * 1024)
}

/// An `interface:port` pair a virtual server listens on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub struct ListenAddr {
    pub host: String,
    pub port: u16,
}

impl TryFrom<String> for ListenAddr {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let (host, port) = match value.rsplit_once(':') {
            Some((host, port)) => (host.trim_matches(|c| c == '[' || c == ']'), port),
            None => ("0.0.0.0", value.as_str()),
        };
        let port: u16 = port
            .parse()
            .map_err(|_| format!("invalid port in listen address {value:?}"))?;
        if port == 0 {
            return Err(format!("port 0 is not allowed in {value:?}"));
        }
        let host = if host.is_empty() { "0.0.0.0" } else { host };
        Ok(ListenAddr {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// One `server` block.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VirtualServer {
    pub listen: Vec<ListenAddr>,
    #[serde(default)]
    pub server_names: Vec<String>,
    #[serde(default)]
    pub root: Option<PathBuf>,
    #[serde(default)]
    pub index: Vec<String>,
    #[serde(default)]
    pub error_pages: HashMap<u16, PathBuf>,
    #[serde(default = "default_body_size")]
    pub client_max_body_size: ByteSize,
    pub locations: Vec<Location>,
}

impl VirtualServer {
    pub fn matches_name(&self, host: &str) -> bool {
        self.server_names.iter().any(|n| n.eq_ignore_ascii_case(host))
    }
}

/// Per-path settings inside a virtual server.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Location {
    pub path: String,
    #[serde(default)]
    pub methods: Vec<Method>,
    /// Filled from the server's root by `validate` when absent.
    #[serde(default)]
    pub root: PathBuf,
    #[serde(default)]
    pub index: Vec<String>,
    #[serde(default)]
    pub autoindex: bool,
    /// Script extension (with leading dot) → interpreter.
    #[serde(default)]
    pub cgi: HashMap<String, PathBuf>,
    #[serde(default)]
    pub upload_dir: Option<PathBuf>,
    #[serde(default)]
    pub redirect: Option<Redirect>,
    #[serde(default)]
    pub client_max_body_size: Option<ByteSize>,
    #[serde(default)]
    pub error_pages: HashMap<u16, PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Redirect {
    #[serde(default = "default_redirect_code")]
    pub code: u16,
    pub target: String,
}

fn default_redirect_code() -> u16 {
    301
}

impl Location {
    /// HEAD rides along with GET; OPTIONS is always answered.
    pub fn allows(&self, method: Method) -> bool {
        match method {
            Method::OPTIONS => true,
            Method::HEAD => self.methods.contains(&Method::HEAD) || self.methods.contains(&Method::GET),
            other => self.methods.contains(&other),
        }
    }

    /// Value for the `Allow` header.
    pub fn allow_header(&self) -> String {
        let mut methods: Vec<&str> = self.methods.iter().map(Method::as_str).collect();
        if self.methods.contains(&Method::GET) && !self.methods.contains(&Method::HEAD) {
            methods.push("HEAD");
        }
        if !self.methods.contains(&Method::OPTIONS) {
            methods.push("OPTIONS");
        }
        methods.join(", ")
    }

    /// Interpreter registered for a script extension such as `.py`.
    pub fn cgi_interpreter(&self, extension: &str) -> Option<&Path> {
        self.cgi
            .iter()
            .find(|(ext, _)| ext.eq_ignore_ascii_case(extension))
            .map(|(_, interpreter)| interpreter.as_path())
    }

    /// Directory that file requests read from and write to: the upload
    /// directory when one is configured, else the root.
    pub fn files_root(&self) -> &Path {
        self.upload_dir.as_deref().unwrap_or(&self.root)
    }

    pub fn is_cgi(&self) -> bool {
        !self.cgi.is_empty()
    }

    pub fn max_body_size(&self) -> u64 {
        self.client_max_body_size.unwrap_or_else(default_body_size).as_u64()
    }
}

impl Config {
    /// Reads, parses and validates the configuration file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::from_yaml_str(&text)
            .with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let mut config: Config = serde_yaml::from_str(text).context("failed to parse YAML")?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the configuration and applies server-to-location inheritance.
    pub fn validate(&mut self) -> Result<()> {
        if self.servers.is_empty() {
            bail!("no servers configured");
        }
        if self.limits.keepalive_timeout_secs == 0 || self.limits.cgi_timeout_secs == 0 {
            bail!("timeouts must be at least one second");
        }
        for (i, server) in self.servers.iter_mut().enumerate() {
            validate_server(server).with_context(|| format!("server #{}", i + 1))?;
        }
        Ok(())
    }

    /// Groups servers by listen address, keeping config order within each group.
    ///
    /// The first server of a group is the default for that address.
    pub fn listen_groups(&self) -> Vec<(ListenAddr, Vec<usize>)> {
        let mut groups: Vec<(ListenAddr, Vec<usize>)> = Vec::new();
        for (i, server) in self.servers.iter().enumerate() {
            for addr in &server.listen {
                match groups.iter_mut().find(|(a, _)| a == addr) {
                    Some((_, members)) => {
                        if !members.contains(&i) {
                            members.push(i);
                        }
                    }
                    None => groups.push((addr.clone(), vec![i])),
                }
            }
        }
        groups
    }
}

fn validate_server(server: &mut VirtualServer) -> Result<()> {
    if server.listen.is_empty() {
        bail!("missing listen address");
    }
    if server.locations.is_empty() {
        bail!("at least one location is required");
    }
    if server.index.is_empty() {
        server.index.push(DEFAULT_INDEX.to_string());
    }
    check_error_codes(&server.error_pages)?;

    let mut seen = HashSet::new();
    for location in &mut server.locations {
        if !location.path.starts_with('/') {
            bail!("location path {:?} must start with '/'", location.path);
        }
        if location.path.len() > 1 {
            let trimmed = location.path.trim_end_matches('/');
            location.path = if trimmed.is_empty() { "/".to_string() } else { trimmed.to_string() };
        }
        if !seen.insert(location.path.clone()) {
            bail!("duplicate location {:?}", location.path);
        }

        if location.root.as_os_str().is_empty() {
            match &server.root {
                Some(root) => location.root = root.clone(),
                None => bail!("location {:?} has no root", location.path),
            }
        }
        if location.index.is_empty() {
            location.index = server.index.clone();
        }
        if location.methods.is_empty() {
            location.methods.push(Method::GET);
        }
        if location.client_max_body_size.is_none() {
            location.client_max_body_size = Some(server.client_max_body_size);
        }
        if let Some(redirect) = &location.redirect {
            if !(300..400).contains(&redirect.code) {
                bail!("location {:?}: redirect code {} is not 3xx", location.path, redirect.code);
            }
        }
        location.cgi = std::mem::take(&mut location.cgi)
            .into_iter()
            .map(|(ext, interpreter)| {
                let ext = if ext.starts_with('.') { ext } else { format!(".{ext}") };
                (ext, interpreter)
            })
            .collect();
        check_error_codes(&location.error_pages)?;
    }
    Ok(())
}

fn check_error_codes(pages: &HashMap<u16, PathBuf>) -> Result<()> {
    for code in pages.keys() {
        if !(300..=599).contains(code) {
            bail!("error page for invalid status {code}");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_size_suffixes() {
        assert_eq!(ByteSize::parse("10").unwrap(), ByteSize(10));
        assert_eq!(ByteSize::parse("10k").unwrap(), ByteSize(10 * 1024));
        assert_eq!(ByteSize::parse("2G").unwrap(), ByteSize(2 * 1024 * 1024 * 1024));
        assert!(ByteSize::parse("").is_err());
        assert!(ByteSize::parse("M").is_err());
    }

    #[test]
    fn listen_addr_forms() {
        let addr = ListenAddr::try_from("127.0.0.1:8080".to_string()).unwrap();
        assert_eq!((addr.host.as_str(), addr.port), ("127.0.0.1", 8080));
        let addr = ListenAddr::try_from("8081".to_string()).unwrap();
        assert_eq!(addr.to_string(), "0.0.0.0:8081");
        assert!(ListenAddr::try_from("host:http".to_string()).is_err());
        assert!(ListenAddr::try_from("host:0".to_string()).is_err());
    }
}
