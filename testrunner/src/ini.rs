//! Settings file parsing with `%(name)s` interpolation
//!
//! Both the global `testrunner.cfg` and every fixture's `test_list` use
//! the same ini dialect: `[section]` headers, `key = value` or
//! `key: value` options, `#`/`;` comment lines, `;` inline comments after
//! whitespace, and indented continuation lines.

use log::warn;
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use crate::TestError;

/// Interpolation variables, keyed by lowercase name
pub type Vars = BTreeMap<String, String>;

const MAX_INTERPOLATION_DEPTH: usize = 10;

fn placeholder_regex() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"%(%|\(([^)]*)\)s)").expect("placeholder pattern is a valid regex")
    })
}

/// A parsed ini document
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IniFile {
    sections: BTreeMap<String, BTreeMap<String, String>>,
}

impl IniFile {
    /// Load a settings file; a missing file yields an empty document
    pub fn load(path: &Path) -> Result<Self, TestError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|e| {
            TestError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;

        Self::parse(&content)
            .map_err(|e| TestError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Parse ini text
    pub fn parse(content: &str) -> Result<Self, String> {
        let mut sections: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        let mut current: Option<String> = None;
        let mut last_key: Option<String> = None;

        for (index, raw_line) in content.lines().enumerate() {
            let line_number = index + 1;
            let trimmed = raw_line.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with(';') {
                continue;
            }

            // Indented lines continue the previous value
            if raw_line.starts_with(char::is_whitespace) {
                if let (Some(section), Some(key)) = (&current, &last_key) {
                    if let Some(value) = sections.get_mut(section).and_then(|s| s.get_mut(key)) {
                        value.push('\n');
                        value.push_str(trimmed);
                    }
                    continue;
                }
            }

            if let Some(rest) = trimmed.strip_prefix('[') {
                let Some(end) = rest.find(']') else {
                    return Err(format!("malformed section header at line {}", line_number));
                };
                let name = rest[..end].trim().to_string();
                sections.entry(name.clone()).or_default();
                current = Some(name);
                last_key = None;
                continue;
            }

            let Some(section) = &current else {
                return Err(format!("option outside of any section at line {}", line_number));
            };

            let Some(split_at) = trimmed.find(|c| c == '=' || c == ':') else {
                return Err(format!("expected 'key = value' at line {}: {}", line_number, trimmed));
            };

            let key = trimmed[..split_at].trim().to_lowercase();
            if key.is_empty() {
                return Err(format!("empty option name at line {}", line_number));
            }

            let mut value = strip_inline_comment(&trimmed[split_at + 1..]).trim().to_string();
            if value == "\"\"" {
                value.clear();
            }

            if let Some(options) = sections.get_mut(section) {
                options.insert(key.clone(), value);
            }
            last_key = Some(key);
        }

        Ok(Self { sections })
    }

    pub fn has_section(&self, section: &str) -> bool {
        self.sections.contains_key(section)
    }

    /// Uninterpolated option value
    pub fn raw(&self, section: &str, key: &str) -> Option<&str> {
        self.sections.get(section)?.get(&key.to_lowercase()).map(String::as_str)
    }

    /// Interpolated option value, `Ok(None)` if the option is absent
    pub fn get(&self, section: &str, key: &str, vars: &Vars) -> Result<Option<String>, String> {
        match self.raw(section, key) {
            Some(raw) => self.interpolate(section, raw, vars, 1).map(Some),
            None => Ok(None),
        }
    }

    /// Interpolated option value, falling back to `default` when the option
    /// is absent or cannot be interpolated
    pub fn get_or(&self, section: &str, key: &str, vars: &Vars, default: &str) -> String {
        match self.get(section, key, vars) {
            Ok(Some(value)) => value,
            Ok(None) => default.to_string(),
            Err(e) => {
                warn!("[{}] {}: {}; using '{}'", section, key, e, default);
                default.to_string()
            }
        }
    }

    fn interpolate(
        &self,
        section: &str,
        value: &str,
        vars: &Vars,
        depth: usize,
    ) -> Result<String, String> {
        if depth > MAX_INTERPOLATION_DEPTH {
            return Err(format!("interpolation too deep in '{}'", value));
        }

        let mut result = String::with_capacity(value.len());
        let mut last = 0;

        for captures in placeholder_regex().captures_iter(value) {
            let Some(whole) = captures.get(0) else { continue };
            result.push_str(&value[last..whole.start()]);
            last = whole.end();

            match captures.get(2) {
                None => result.push('%'),
                Some(name) => {
                    let name = name.as_str().to_lowercase();
                    if let Some(raw) = self.raw(section, &name) {
                        result.push_str(&self.interpolate(section, raw, vars, depth + 1)?);
                    } else if let Some(var) = vars.get(&name) {
                        result.push_str(var);
                    } else {
                        return Err(format!("unknown interpolation variable '{}'", name));
                    }
                }
            }
        }

        result.push_str(&value[last..]);
        Ok(result)
    }
}

/// Interpret a settings value as a boolean
pub fn is_true(value: &str) -> bool {
    matches!(value, "y" | "Y" | "yes" | "Yes" | "true" | "True" | "1")
}

fn strip_inline_comment(value: &str) -> &str {
    let bytes = value.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if *b == b';' && i > 0 && bytes[i - 1].is_ascii_whitespace() {
            return &value[..i];
        }
    }
    value
}
