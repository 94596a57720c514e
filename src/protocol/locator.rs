//! Resource locators: `scheme://[user[:pass]@]host[:port]/path[?query]`.
//!
//! User, password and path are held decoded; `%XX` escapes are resolved on
//! parse and reapplied by `Display`.

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Bytes escaped in a displayed path.
const PATH: &AsciiSet = &CONTROLS
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

/// Bytes escaped in a displayed user name.
const USERINFO: &AsciiSet = &PATH
    .add(b'/')
    .add(b':')
    .add(b';')
    .add(b'=')
    .add(b'@')
    .add(b'[')
    .add(b'\\')
    .add(b']')
    .add(b'^')
    .add(b'|');

fn decode(s: &str) -> String {
    percent_decode_str(s).decode_utf8_lossy().into_owned()
}

/// Error returned when a locator string cannot be parsed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LocatorError {
    #[error("missing scheme in '{0}'")]
    MissingScheme(String),

    #[error("invalid scheme '{0}'")]
    InvalidScheme(String),

    #[error("invalid port '{0}'")]
    InvalidPort(String),
}

/// Target of a job.
///
/// The password is never included in the `Display` output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Locator {
    pub scheme: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
    #[serde(default)]
    pub host: String,
    /// `0` means the protocol default.
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

impl Locator {
    /// Build a local locator (`<scheme>:///path`).
    pub fn local(scheme: &str, path: impl Into<String>) -> Self {
        let mut path = path.into();
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        Self {
            scheme: scheme.to_string(),
            path,
            ..Default::default()
        }
    }

    /// Convenience constructor for `file:` locators.
    pub fn file(path: impl AsRef<std::path::Path>) -> Self {
        Self::local("file", path.as_ref().to_string_lossy().into_owned())
    }

    /// Replace the path, keeping the authority.
    pub fn with_path(&self, path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            query: None,
            ..self.clone()
        }
    }

    /// Last path segment, or the empty string for the root.
    pub fn file_name(&self) -> &str {
        self.path
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or("")
    }

    /// The same locator without its password.
    pub fn without_password(&self) -> Self {
        Self {
            pass: None,
            ..self.clone()
        }
    }
}

impl FromStr for Locator {
    type Err = LocatorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, rest) = s
            .split_once(':')
            .ok_or_else(|| LocatorError::MissingScheme(s.to_string()))?;

        let valid_scheme = scheme
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic())
            && scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
        if !valid_scheme {
            return Err(LocatorError::InvalidScheme(scheme.to_string()));
        }

        let mut locator = Locator {
            scheme: scheme.to_ascii_lowercase(),
            ..Default::default()
        };

        let rest = match rest.split_once('?') {
            Some((before, query)) => {
                locator.query = Some(query.to_string());
                before
            }
            None => rest,
        };

        let Some(after_slashes) = rest.strip_prefix("//") else {
            // `scheme:path` form
            locator.path = decode(rest);
            return Ok(locator);
        };

        let (authority, path) = match after_slashes.find('/') {
            Some(idx) => after_slashes.split_at(idx),
            None => (after_slashes, ""),
        };
        locator.path = decode(path);

        let host_port = match authority.rsplit_once('@') {
            Some((userinfo, host_port)) => {
                match userinfo.split_once(':') {
                    Some((user, pass)) => {
                        locator.user = Some(decode(user));
                        locator.pass = Some(decode(pass));
                    }
                    None => locator.user = Some(decode(userinfo)),
                }
                host_port
            }
            None => authority,
        };

        // Bracketed IPv6 hosts keep their colons.
        let (host, port) = if let Some(stripped) = host_port.strip_prefix('[') {
            match stripped.split_once(']') {
                Some((host, tail)) => (host, tail.strip_prefix(':')),
                None => (host_port, None),
            }
        } else {
            match host_port.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (host_port, None),
            }
        };

        locator.host = host.to_string();
        if let Some(port) = port.filter(|p| !p.is_empty()) {
            locator.port = port
                .parse()
                .map_err(|_| LocatorError::InvalidPort(port.to_string()))?;
        }

        Ok(locator)
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://", self.scheme)?;
        if let Some(user) = &self.user {
            write!(f, "{}@", utf8_percent_encode(user, USERINFO))?;
        }
        if self.host.contains(':') {
            write!(f, "[{}]", self.host)?;
        } else {
            write!(f, "{}", self.host)?;
        }
        if self.port != 0 {
            write!(f, ":{}", self.port)?;
        }
        write!(f, "{}", utf8_percent_encode(&self.path, PATH))?;
        if let Some(query) = &self.query {
            write!(f, "?{}", query)?;
        }
        Ok(())
    }
}
