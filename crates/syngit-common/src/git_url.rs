//! Git repository URL handling
//!
//! Only URL-shaped remotes are supported (`http`, `https`, and `file` for local
//! bare repositories). The host is what RemoteUsers are matched against.

use std::sync::LazyLock;

use regex::Regex;

use crate::{Error, Result};

static URL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?P<scheme>https?|file)://(?:(?P<userinfo>[^@/]*)@)?(?P<host>[^/:@]*)(?::(?P<port>[0-9]+))?(?P<path>/.*)?$",
    )
    .expect("static regex")
});

static STRICT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https?://[A-Za-z0-9]([A-Za-z0-9.-]*[A-Za-z0-9])?(:[0-9]{1,5})?(/[A-Za-z0-9._~%+@-]+)+/?$")
        .expect("static regex")
});

/// Parsed Git remote URL
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GitUrl {
    /// `http`, `https` or `file`
    pub scheme: String,
    /// Host name without port; `localhost` for `file:///path`
    pub host: String,
    /// Explicit port
    pub port: Option<u16>,
    /// Path including the leading `/`
    pub path: String,
}

impl GitUrl {
    /// Parse a repository URL
    pub fn parse(url: &str) -> Result<Self> {
        let parse_err = |message: &str| Error::GitUrlParse {
            url: url.to_string(),
            message: message.to_string(),
        };

        let caps = URL_RE
            .captures(url.trim())
            .ok_or_else(|| parse_err("expected <scheme>://<host>/<path> with scheme http, https or file"))?;

        let scheme = caps["scheme"].to_string();
        let mut host = caps
            .name("host")
            .map(|m| m.as_str().to_ascii_lowercase())
            .unwrap_or_default();
        if host.is_empty() {
            if scheme != "file" {
                return Err(parse_err("missing host"));
            }
            host = "localhost".to_string();
        }
        let port = match caps.name("port") {
            Some(p) => Some(p.as_str().parse::<u16>().map_err(|_| parse_err("invalid port"))?),
            None => None,
        };
        let path = caps
            .name("path")
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();
        if path.trim_matches('/').is_empty() {
            return Err(parse_err("missing repository path"));
        }

        Ok(Self {
            scheme,
            host,
            port,
            path,
        })
    }

    /// Path on the local filesystem for `file` URLs
    pub fn local_path(&self) -> Option<&str> {
        (self.scheme == "file").then_some(self.path.as_str())
    }
}

/// Host of a repository URL, the key RemoteUsers are matched on
pub fn host_of(url: &str) -> Result<String> {
    GitUrl::parse(url).map(|u| u.host)
}

/// Whether `url` is an acceptable `remoteRepository` for a RemoteSyncer
pub fn is_valid_git_uri(url: &str) -> bool {
    STRICT_RE.is_match(url)
}
