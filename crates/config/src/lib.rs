//! Configuration provider for the image browser caches.
//!
//! Components read their settings once at construction time through the
//! [`ConfigProvider`] trait, a flat `section.key -> value` lookup. [`Settings`]
//! is the stock provider: a sectioned key/value file that can be loaded,
//! edited, saved back, and overridden from environment variables.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::warn;

/// One megabyte in bytes.
pub const MB: usize = 1024 * 1024;

/// Errors that can occur while loading or saving configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Invalid value for a configuration parameter
    #[error("invalid value for configuration key: {0}")]
    InvalidValue(String),
    /// Malformed line in a settings file
    #[error("parse error on line {line}: {message}")]
    Parse { line: usize, message: String },
    /// I/O error reading or writing a settings file
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Read-only `section.key -> value` lookup.
///
/// Implementors only supply raw string values; typed access with defaults is
/// provided by [`ConfigExt`].
pub trait ConfigProvider: Send + Sync {
    /// Returns the raw value stored under `section.key`, if any.
    fn raw(&self, section: &str, key: &str) -> Option<String>;

    /// Returns true if `section.key` has a value.
    fn has(&self, section: &str, key: &str) -> bool {
        self.raw(section, key).is_some()
    }
}

/// Typed lookups with defaults, available on every [`ConfigProvider`].
pub trait ConfigExt {
    /// Parses `section.key` as `T`, returning `default` when the key is absent
    /// or its value does not parse.
    fn get_or<T: FromStr>(&self, section: &str, key: &str, default: T) -> T;

    /// Boolean lookup accepting `true/false`, `yes/no`, `on/off` and `1/0`.
    fn get_bool_or(&self, section: &str, key: &str, default: bool) -> bool;
}

impl<P: ConfigProvider + ?Sized> ConfigExt for P {
    fn get_or<T: FromStr>(&self, section: &str, key: &str, default: T) -> T {
        match self.raw(section, key) {
            Some(value) => match value.trim().parse::<T>() {
                Ok(parsed) => parsed,
                Err(_) => {
                    warn!(section, key, value = %value, "Unparseable config value, using default");
                    default
                }
            },
            None => default,
        }
    }

    fn get_bool_or(&self, section: &str, key: &str, default: bool) -> bool {
        match self.raw(section, key) {
            Some(value) => match value.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => true,
                "false" | "no" | "off" | "0" => false,
                _ => {
                    warn!(section, key, value = %value, "Unparseable boolean config value, using default");
                    default
                }
            },
            None => default,
        }
    }
}

/// Sectioned settings store.
///
/// File format:
/// ```text
/// # comment
/// [cache]
/// l1_size = 1000
/// disk_cache_dir = "/path/to/cache"
///
/// [memory]
/// max_pool_size = 104857600
/// ```
///
/// When an environment prefix is set, a variable named
/// `<PREFIX>_<SECTION>_<KEY>` (upper-case) takes precedence over the stored
/// value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Settings {
    sections: BTreeMap<String, BTreeMap<String, String>>,
    env_prefix: Option<String>,
}

impl Settings {
    /// Creates an empty settings store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads settings from a file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or contains a malformed line.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::parse(&contents)
    }

    /// Parses settings from a string.
    ///
    /// A value wrapped in double quotes loses exactly one pair of quotes and
    /// has `\\`, `\"`, `\n`, `\r` and `\t` unescaped. Other values are taken
    /// verbatim after trimming.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let mut settings = Self::default();
        let mut section = String::new();

        for (index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some(rest) = line.strip_prefix('[') {
                let name = rest.strip_suffix(']').ok_or_else(|| ConfigError::Parse {
                    line: index + 1,
                    message: "unterminated section header".to_string(),
                })?;
                section = name.trim().to_string();
                continue;
            }

            let (key, value) = line.split_once('=').ok_or_else(|| ConfigError::Parse {
                line: index + 1,
                message: format!("expected `key = value`, found `{}`", line),
            })?;
            settings.set(&section, key.trim(), unquote(value.trim()));
        }

        Ok(settings)
    }

    /// Saves settings to a file in the format accepted by [`Settings::parse`].
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        fs::write(path.as_ref(), self.to_text())?;
        Ok(())
    }

    /// Renders the settings in file format.
    pub fn to_text(&self) -> String {
        let mut out = String::from("# StarBrowse configuration\n");
        for (section, entries) in &self.sections {
            if !section.is_empty() {
                out.push_str(&format!("\n[{}]\n", section));
            }
            for (key, value) in entries {
                out.push_str(&format!("{} = \"{}\"\n", key, escape(value)));
            }
        }
        out
    }

    /// Enables environment overrides with the given prefix.
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = Some(prefix.into());
        self
    }

    /// Sets `section.key` to `value`, replacing any previous value.
    pub fn set(&mut self, section: &str, key: &str, value: impl ToString) {
        self.sections
            .entry(section.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
    }

    /// Builder form of [`Settings::set`].
    pub fn with(mut self, section: &str, key: &str, value: impl ToString) -> Self {
        self.set(section, key, value);
        self
    }

    /// Removes `section.key`, returning the previous value.
    pub fn remove(&mut self, section: &str, key: &str) -> Option<String> {
        self.sections.get_mut(section)?.remove(key)
    }

    fn env_var_name(prefix: &str, section: &str, key: &str) -> String {
        format!("{}_{}_{}", prefix, section, key).to_ascii_uppercase()
    }
}

impl ConfigProvider for Settings {
    fn raw(&self, section: &str, key: &str) -> Option<String> {
        if let Some(prefix) = &self.env_prefix {
            if let Ok(value) = std::env::var(Self::env_var_name(prefix, section, key)) {
                return Some(value);
            }
        }
        self.sections.get(section)?.get(key).cloned()
    }
}

/// Returns the default cache directory for the current platform.
///
/// - macOS: ~/Library/Caches/starbrowse
/// - Linux: ~/.cache/starbrowse
/// - Windows: %LOCALAPPDATA%\starbrowse
pub fn default_cache_dir() -> PathBuf {
    if let Some(cache_dir) = dirs::cache_dir() {
        cache_dir.join("starbrowse")
    } else {
        PathBuf::from("cache")
    }
}

/// Escapes a value for use inside double quotes.
fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out
}

/// Reverses [`escape`] for a quoted value; unquoted values pass through.
fn unquote(value: &str) -> String {
    let Some(inner) = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
    else {
        return value.to_string();
    };

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}
