//! Sectioned key/value configuration store.
//!
//! INI-shaped text: `[section]` headers, `name = value` (or `name: value`)
//! options, `#`/`;` comments. Section and option lookup is case-insensitive
//! while the original spelling is preserved for enumeration. Values may
//! reference sibling options as `%(name)s`; expansion is recursive, cached,
//! and leaves unknown or cyclic references as literal text.

use std::collections::HashMap;
use std::path::Path;

use tracing::warn;

/// Errors from parsing or typed access.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("config syntax error at line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("option '{option}' has non-boolean value '{value}'")]
    BadBoolean { option: String, value: String },
}

#[derive(Debug)]
struct ConfigOption {
    /// Spelling as first written.
    name: String,
    raw: String,
}

#[derive(Debug)]
struct ConfigSection {
    name: String,
    /// Keyed by lowercased option name.
    options: HashMap<String, ConfigOption>,
}

/// The store. `get` takes `&mut self` because expanded values are cached
/// in place; `set` drops the cache.
#[derive(Debug, Default)]
pub struct Config {
    /// Keyed by lowercased section name.
    sections: HashMap<String, ConfigSection>,
    expansions: HashMap<(String, String), String>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse_str(&text)
    }

    pub fn parse_str(text: &str) -> Result<Self, ConfigError> {
        let mut config = Self::new();
        let mut current: Option<String> = None;
        for (idx, raw_line) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(rest) = line.strip_prefix('[') {
                let name = rest.strip_suffix(']').ok_or(ConfigError::Syntax {
                    line: line_no,
                    message: "unterminated section header".to_string(),
                })?;
                let name = name.trim();
                if name.is_empty() {
                    return Err(ConfigError::Syntax {
                        line: line_no,
                        message: "empty section name".to_string(),
                    });
                }
                config.ensure_section(name);
                current = Some(name.to_string());
                continue;
            }
            let Some(section) = &current else {
                return Err(ConfigError::Syntax {
                    line: line_no,
                    message: format!("option '{line}' before any section header"),
                });
            };
            let split = line
                .find(['=', ':'])
                .ok_or_else(|| ConfigError::Syntax {
                    line: line_no,
                    message: format!("expected 'name = value', found '{line}'"),
                })?;
            let name = line[..split].trim();
            let value = line[split + 1..].trim();
            if name.is_empty() {
                return Err(ConfigError::Syntax {
                    line: line_no,
                    message: "empty option name".to_string(),
                });
            }
            let section = section.clone();
            config.set(&section, name, value);
        }
        Ok(config)
    }

    fn ensure_section(&mut self, name: &str) -> &mut ConfigSection {
        self.sections
            .entry(name.to_ascii_lowercase())
            .or_insert_with(|| ConfigSection {
                name: name.to_string(),
                options: HashMap::new(),
            })
    }

    /// Sets an option, replacing any previous value and invalidating every
    /// cached expansion (any of them may have referenced the old value).
    pub fn set(&mut self, section: &str, option: &str, value: &str) {
        let section = self.ensure_section(section);
        section
            .options
            .entry(option.to_ascii_lowercase())
            .and_modify(|o| o.raw = value.to_string())
            .or_insert_with(|| ConfigOption {
                name: option.to_string(),
                raw: value.to_string(),
            });
        self.expansions.clear();
    }

    /// Returns the option's value with `%(name)s` references expanded
    /// against its own section.
    pub fn get(&mut self, section: &str, option: &str) -> Option<String> {
        let section_key = section.to_ascii_lowercase();
        let option_key = option.to_ascii_lowercase();
        self.sections
            .get(&section_key)?
            .options
            .get(&option_key)?;
        let cache_key = (section_key.clone(), option_key.clone());
        if let Some(hit) = self.expansions.get(&cache_key) {
            return Some(hit.clone());
        }
        let mut in_progress = vec![option_key.clone()];
        let expanded = self.expand(&section_key, &option_key, &mut in_progress)?;
        self.expansions.insert(cache_key, expanded.clone());
        Some(expanded)
    }

    /// Raw value, no expansion.
    pub fn get_raw(&self, section: &str, option: &str) -> Option<&str> {
        self.sections
            .get(&section.to_ascii_lowercase())?
            .options
            .get(&option.to_ascii_lowercase())
            .map(|o| o.raw.as_str())
    }

    fn expand(
        &self,
        section_key: &str,
        option_key: &str,
        in_progress: &mut Vec<String>,
    ) -> Option<String> {
        let raw = self
            .sections
            .get(section_key)?
            .options
            .get(option_key)?
            .raw
            .clone();
        let mut out = String::with_capacity(raw.len());
        let mut rest = raw.as_str();
        while let Some(start) = rest.find("%(") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            match after.find(")s") {
                Some(end) => {
                    let name = &after[..end];
                    let name_key = name.to_ascii_lowercase();
                    let resolved = if in_progress.contains(&name_key) {
                        warn!(section = section_key, option = name, "cyclic config expansion");
                        None
                    } else {
                        in_progress.push(name_key.clone());
                        let value = self.expand(section_key, &name_key, in_progress);
                        in_progress.pop();
                        value
                    };
                    match resolved {
                        Some(value) => out.push_str(&value),
                        // Unknown or cyclic reference stays literal.
                        None => {
                            out.push_str("%(");
                            out.push_str(name);
                            out.push_str(")s");
                        }
                    }
                    rest = &after[end + 2..];
                }
                None => {
                    out.push_str("%(");
                    rest = after;
                }
            }
        }
        out.push_str(rest);
        Some(out)
    }

    /// Typed boolean access: true/yes/on/1 and false/no/off/0, any case.
    pub fn get_bool(
        &mut self,
        section: &str,
        option: &str,
        default: bool,
    ) -> Result<bool, ConfigError> {
        let Some(value) = self.get(section, option) else {
            return Ok(default);
        };
        match value.to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Ok(true),
            "false" | "no" | "off" | "0" => Ok(false),
            _ => Err(ConfigError::BadBoolean {
                option: option.to_string(),
                value,
            }),
        }
    }

    /// Overlays `other` onto this store; on collision the incoming value
    /// wins.
    pub fn merge(&mut self, other: Config) {
        for (section_key, section) in other.sections {
            match self.sections.get_mut(&section_key) {
                Some(existing) => {
                    for (option_key, option) in section.options {
                        existing.options.insert(option_key, option);
                    }
                }
                None => {
                    self.sections.insert(section_key, section);
                }
            }
        }
        self.expansions.clear();
    }

    pub fn sections(&self) -> impl Iterator<Item = &str> {
        self.sections.values().map(|s| s.name.as_str())
    }

    pub fn options(&self, section: &str) -> impl Iterator<Item = &str> {
        self.sections
            .get(&section.to_ascii_lowercase())
            .into_iter()
            .flat_map(|s| s.options.values().map(|o| o.name.as_str()))
    }
}
