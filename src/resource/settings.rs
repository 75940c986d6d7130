//! The managed server's `settings.xml`.
//!
//! The document is a root element whose direct children are `<key>value</key>`
//! pairs, some of them repeated (`<resource>`). Only those children are read
//! or rewritten; everything else in the file is preserved byte for byte.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

pub const DEFAULT_HOSTNAME: &str = "HappinessMP";
pub const DEFAULT_PORT: u16 = 9999;
pub const MAX_PLAYERS_LIMIT: u32 = 100;
pub const DEFAULT_HOST_ADDRESS: &str = "::";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerLogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Critical,
    Off,
}

impl ServerLogLevel {
    const ALL: [Self; 7] = [
        Self::Trace,
        Self::Debug,
        Self::Info,
        Self::Warn,
        Self::Error,
        Self::Critical,
        Self::Off,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
            Self::Critical => "critical",
            Self::Off => "off",
        }
    }
}

impl fmt::Display for ServerLogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServerLogLevel {
    type Err = AppError;

    /// Accepts the level name or its numeric index.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if let Ok(index) = s.parse::<usize>() {
            return Self::ALL
                .get(index)
                .copied()
                .ok_or_else(|| AppError::config(format!("Unknown log level {}", s)));
        }
        Self::ALL
            .into_iter()
            .find(|level| level.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| AppError::config(format!("Unknown log level {}", s)))
    }
}

/// One direct child of the root element, as byte ranges into the document.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Element {
    name: String,
    start: usize,
    end: usize,
    /// `None` for self-closing elements.
    content: Option<(usize, usize)>,
}

/// Direct children of the root element plus the position of the root's closing tag.
fn scan_children(doc: &str) -> Result<(Vec<Element>, usize)> {
    let mut children = Vec::new();
    let mut depth = 0usize;
    let mut open: Option<(String, usize, usize)> = None;
    let mut pos = 0;

    while let Some(rel) = doc[pos..].find('<') {
        let tag_start = pos + rel;
        let rest = &doc[tag_start..];

        let skip_to = |terminator: &str| {
            rest.find(terminator)
                .map(|i| tag_start + i + terminator.len())
                .ok_or_else(|| AppError::config("Unterminated markup in settings document"))
        };
        if rest.starts_with("<!--") {
            pos = skip_to("-->")?;
            continue;
        }
        if rest.starts_with("<![CDATA[") {
            pos = skip_to("]]>")?;
            continue;
        }
        if rest.starts_with("<?") {
            pos = skip_to("?>")?;
            continue;
        }
        if rest.starts_with("<!") {
            pos = skip_to(">")?;
            continue;
        }

        let tag_end = skip_to(">")?;
        let inner = &doc[tag_start + 1..tag_end - 1];

        if let Some(closing) = inner.strip_prefix('/') {
            if depth == 0 {
                return Err(AppError::config("Unbalanced closing tag in settings document"));
            }
            depth -= 1;
            if depth == 0 {
                return Ok((children, tag_start));
            }
            if depth == 1 {
                if let Some((name, start, content_start)) = open.take() {
                    if name == closing.trim() {
                        children.push(Element {
                            name,
                            start,
                            end: tag_end,
                            content: Some((content_start, tag_start)),
                        });
                    }
                }
            }
        } else {
            let self_closing = inner.ends_with('/');
            let name: String = inner
                .trim_end_matches('/')
                .split(|c: char| c.is_whitespace())
                .next()
                .unwrap_or_default()
                .to_string();
            if self_closing {
                if depth == 1 {
                    children.push(Element {
                        name,
                        start: tag_start,
                        end: tag_end,
                        content: None,
                    });
                }
            } else {
                if depth == 1 {
                    open = Some((name, tag_start, tag_end));
                }
                depth += 1;
            }
        }
        pos = tag_end;
    }
    Err(AppError::config("Settings document has no closed root element"))
}

fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn element_value(doc: &str, element: &Element) -> String {
    element
        .content
        .map(|(start, end)| unescape(doc[start..end].trim()))
        .unwrap_or_default()
}

/// Replace the first `<name>` child's value, or append a new child before the root closes.
fn set_value(doc: &str, name: &str, value: &str) -> Result<String> {
    let (children, root_close) = scan_children(doc)?;
    let value = escape(value);
    let mut out = String::with_capacity(doc.len() + value.len() + name.len() * 2 + 8);

    match children.iter().find(|e| e.name == name) {
        Some(Element {
            content: Some((start, end)),
            ..
        }) => {
            out.push_str(&doc[..*start]);
            out.push_str(&value);
            out.push_str(&doc[*end..]);
        }
        Some(element) => {
            out.push_str(&doc[..element.start]);
            out.push_str(&format!("<{name}>{value}</{name}>"));
            out.push_str(&doc[element.end..]);
        }
        None => {
            let line_start = doc[..root_close].rfind('\n').map_or(root_close, |i| i + 1);
            let indent_only = doc[line_start..root_close].trim().is_empty();
            let insert_at = if indent_only { line_start } else { root_close };
            out.push_str(&doc[..insert_at]);
            if !indent_only {
                out.push('\n');
            }
            out.push_str(&format!("    <{name}>{value}</{name}>\n"));
            out.push_str(&doc[insert_at..]);
        }
    }
    Ok(out)
}

pub struct ServerSettings {
    path: PathBuf,
    document: RwLock<Option<String>>,
    self_saved: AtomicBool,
    write_lock: Mutex<()>,
}

impl ServerSettings {
    /// Bind to `path` and load it. A missing or unreadable file leaves the
    /// document empty and every getter at its default.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let settings = Self {
            path: path.into(),
            document: RwLock::new(None),
            self_saved: AtomicBool::new(false),
            write_lock: Mutex::new(()),
        };
        if let Err(e) = settings.reload() {
            log::warn!("Failed to load {:?}: {}", settings.path, e);
        }
        settings
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_loaded(&self) -> bool {
        self.document
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Read the document again from disk.
    pub fn reload(&self) -> Result<()> {
        let content = std::fs::read_to_string(&self.path)?;
        scan_children(&content)?;
        *self.document.write().unwrap_or_else(|e| e.into_inner()) = Some(content);
        Ok(())
    }

    /// Consume the marker left by the last [`Self::set`].
    pub fn take_self_save(&self) -> bool {
        self.self_saved.swap(false, Ordering::AcqRel)
    }

    pub fn get(&self, name: &str) -> Option<String> {
        let document = self.document.read().unwrap_or_else(|e| e.into_inner());
        let doc = document.as_deref()?;
        let (children, _) = scan_children(doc).ok()?;
        children
            .iter()
            .find(|e| e.name == name)
            .map(|e| element_value(doc, e))
    }

    pub fn get_or<T: FromStr>(&self, name: &str, default: T) -> T {
        self.get(name)
            .and_then(|value| value.parse().ok())
            .unwrap_or(default)
    }

    /// Every value of a repeated child element.
    pub fn nodes(&self, name: &str) -> Vec<String> {
        let document = self.document.read().unwrap_or_else(|e| e.into_inner());
        let Some(doc) = document.as_deref() else {
            return Vec::new();
        };
        let Ok((children, _)) = scan_children(doc) else {
            return Vec::new();
        };
        children
            .iter()
            .filter(|e| e.name == name)
            .map(|e| element_value(doc, e))
            .filter(|value| !value.is_empty())
            .collect()
    }

    /// Update (or create) one child element and write the file.
    pub fn set(&self, name: &str, value: &str) -> Result<()> {
        let _write = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        let updated = {
            let document = self.document.read().unwrap_or_else(|e| e.into_inner());
            let doc = document
                .as_deref()
                .ok_or_else(|| AppError::config("Settings document is not loaded"))?;
            set_value(doc, name, value)?
        };

        self.self_saved.store(true, Ordering::Release);
        if let Err(e) = std::fs::write(&self.path, &updated) {
            self.self_saved.store(false, Ordering::Release);
            return Err(AppError::config(format!(
                "Failed to write {:?}: {}",
                self.path, e
            )));
        }
        *self.document.write().unwrap_or_else(|e| e.into_inner()) = Some(updated);
        Ok(())
    }

    pub fn hostname(&self) -> String {
        self.get("hostname")
            .unwrap_or_else(|| DEFAULT_HOSTNAME.to_string())
    }

    pub fn set_hostname(&self, hostname: &str) -> Result<()> {
        self.set("hostname", hostname)
    }

    pub fn port(&self) -> u16 {
        let port: u32 = self.get_or("port", u32::from(DEFAULT_PORT));
        u16::try_from(port).unwrap_or(u16::MAX)
    }

    pub fn set_port(&self, port: u32) -> Result<()> {
        self.set("port", &port.min(u32::from(u16::MAX)).to_string())
    }

    pub fn max_players(&self) -> u32 {
        self.get_or("maxplayers", MAX_PLAYERS_LIMIT)
            .min(MAX_PLAYERS_LIMIT)
    }

    pub fn set_max_players(&self, players: u32) -> Result<()> {
        self.set("maxplayers", &players.min(MAX_PLAYERS_LIMIT).to_string())
    }

    pub fn listed(&self) -> bool {
        self.get_or("listed", false)
    }

    pub fn set_listed(&self, listed: bool) -> Result<()> {
        self.set("listed", &listed.to_string())
    }

    pub fn chat(&self) -> bool {
        self.get_or("chat", true)
    }

    pub fn set_chat(&self, chat: bool) -> Result<()> {
        self.set("chat", &chat.to_string())
    }

    pub fn host_address(&self) -> String {
        self.get("host_address")
            .unwrap_or_else(|| DEFAULT_HOST_ADDRESS.to_string())
    }

    pub fn set_host_address(&self, address: &str) -> Result<()> {
        self.set("host_address", address)
    }

    pub fn log_level(&self) -> ServerLogLevel {
        self.get_or("log_level", ServerLogLevel::default())
    }

    pub fn set_log_level(&self, level: ServerLogLevel) -> Result<()> {
        self.set("log_level", level.as_str())
    }
}
