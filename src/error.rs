//! Application error types.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use serde::Serialize;

/// Application error carrying a stable kind plus a free-form key/value payload.
#[derive(Debug)]
pub struct AppError {
    payload: HashMap<String, String>,
    kind: ErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Instance not found
    InstanceNotFound,
    /// Instance is currently running
    InstanceRunning,
    /// Directory is not a usable server installation
    InvalidInstallation,
    /// Executable is already registered as an instance
    DuplicateInstance,
    /// Configuration error
    Config,
    /// File system error
    Io,
    /// Network error
    Network,
    /// Process error
    Process,
    /// File watcher error
    Watch,
    /// General error
    Other,
}

impl ErrorKind {
    pub fn code(&self) -> u32 {
        match self {
            Self::InstanceNotFound => 1001,
            Self::InstanceRunning => 1002,
            Self::InvalidInstallation => 1004,
            Self::DuplicateInstance => 1005,
            Self::Config => 2001,
            Self::Io => 2002,
            Self::Network => 2003,
            Self::Watch => 2004,
            Self::Process => 3001,
            Self::Other => 9999,
        }
    }
}

impl AppError {
    pub fn new(kind: ErrorKind, payload: HashMap<String, String>) -> Self {
        Self { payload, kind }
    }

    /// Create an error with a single "detail" key from a non-empty string,
    /// or an empty payload if the string is empty.
    fn with_detail(kind: ErrorKind, detail: impl Into<String>) -> Self {
        let detail = detail.into();
        let payload = if detail.is_empty() {
            HashMap::new()
        } else {
            HashMap::from([("detail".to_string(), detail)])
        };
        Self::new(kind, payload)
    }

    pub fn instance_not_found(id: &str) -> Self {
        Self::new(
            ErrorKind::InstanceNotFound,
            HashMap::from([("id".to_string(), id.to_string())]),
        )
    }

    pub fn instance_running() -> Self {
        Self::new(ErrorKind::InstanceRunning, HashMap::new())
    }

    pub fn invalid_installation(dir: &Path) -> Self {
        Self::new(
            ErrorKind::InvalidInstallation,
            HashMap::from([("dir".to_string(), dir.display().to_string())]),
        )
    }

    pub fn duplicate_instance(exe: &Path) -> Self {
        Self::new(
            ErrorKind::DuplicateInstance,
            HashMap::from([("exe".to_string(), exe.display().to_string())]),
        )
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Config, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Io, message)
    }

    pub fn network(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Network, message)
    }

    pub fn network_with_url(url: &str, detail: impl Into<String>) -> Self {
        Self::new(
            ErrorKind::Network,
            HashMap::from([
                ("url".to_string(), url.to_string()),
                ("detail".to_string(), detail.into()),
            ]),
        )
    }

    pub fn process(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Process, message)
    }

    pub fn watch(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Watch, message)
    }

    pub fn other(message: impl Into<String>) -> Self {
        Self::with_detail(ErrorKind::Other, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn detail(&self, key: &str) -> Option<&str> {
        self.payload.get(key).map(String::as_str)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.payload.is_empty() {
            write!(f, "{:?}", self.kind)
        } else {
            let mut pairs: Vec<String> = self
                .payload
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect();
            pairs.sort();
            write!(f, "{:?}: {}", self.kind, pairs.join(", "))
        }
    }
}

impl std::error::Error for AppError {}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct as _;
        let mut s = serializer.serialize_struct("AppError", 2)?;
        s.serialize_field("code", &self.kind.code())?;
        s.serialize_field("payload", &self.payload)?;
        s.end()
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<toml::ser::Error> for AppError {
    fn from(err: toml::ser::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        Self::network(err.to_string())
    }
}

impl From<walkdir::Error> for AppError {
    fn from(err: walkdir::Error) -> Self {
        Self::io(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::config(err.to_string())
    }
}

impl From<notify::Error> for AppError {
    fn from(err: notify::Error) -> Self {
        Self::watch(err.to_string())
    }
}

/// Convenient Result type alias.
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_lists_payload_sorted() {
        let err = AppError::network_with_url("https://example.invalid/v.json", "status 503");
        assert_eq!(err.kind(), ErrorKind::Network);
        assert_eq!(
            err.to_string(),
            "Network: detail=status 503, url=https://example.invalid/v.json"
        );
    }

    #[test]
    fn empty_detail_produces_bare_kind() {
        let err = AppError::io("");
        assert_eq!(err.to_string(), "Io");
        assert!(err.detail("detail").is_none());
    }

    #[test]
    fn serializes_code_and_payload() {
        let err = AppError::instance_not_found("abc");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], 1001);
        assert_eq!(json["payload"]["id"], "abc");
    }
}
