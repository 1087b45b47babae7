use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// An installation's `.env` settings store. Lookups ignore key case; writes
/// keep the spelling a key already has in the file.
///
/// Comments, blank lines and untouched entries are written back exactly as
/// they were read. Values are read literally: `$NAME` is never expanded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvStore {
    path: PathBuf,
    lines: Vec<EnvLine>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum EnvLine {
    Verbatim(String),
    Entry {
        key: String,
        value: String,
        /// Original text, dropped once the entry is rewritten.
        raw: Option<String>,
    },
}

impl EnvStore {
    pub fn load(path: &Path) -> Result<Self> {
        let mut lines = Vec::new();
        if path.exists() {
            let content = fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            for (index, line) in content.lines().enumerate() {
                let parsed = parse_line(line).with_context(|| {
                    format!("failed to parse {} line {}", path.display(), index + 1)
                })?;
                lines.push(match parsed {
                    Some((key, value)) => EnvLine::Entry {
                        key,
                        value,
                        raw: Some(line.to_string()),
                    },
                    None => EnvLine::Verbatim(line.to_string()),
                });
            }
        }
        Ok(Self {
            path: path.to_path_buf(),
            lines,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Effective entries in file order; a key repeated later in the file
    /// overrides the earlier value.
    pub fn entries(&self) -> Vec<(String, String)> {
        let mut entries: Vec<(String, String)> = Vec::new();
        for (key, value) in self.iter_entries() {
            match entries
                .iter_mut()
                .find(|(existing, _)| existing.eq_ignore_ascii_case(key))
            {
                Some(slot) => slot.1 = value.to_string(),
                None => entries.push((key.to_string(), value.to_string())),
            }
        }
        entries
    }

    fn iter_entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.lines.iter().filter_map(|line| match line {
            EnvLine::Entry { key, value, .. } => Some((key.as_str(), value.as_str())),
            EnvLine::Verbatim(_) => None,
        })
    }

    fn last_entry(&self, key: &str) -> Option<(&str, &str)> {
        self.iter_entries()
            .filter(|(existing, _)| existing.eq_ignore_ascii_case(key))
            .last()
    }

    /// Returns the key as spelled in the store.
    pub fn resolve_key(&self, key: &str) -> Option<&str> {
        self.last_entry(key).map(|(existing, _)| existing)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.last_entry(key).map(|(_, value)| value)
    }

    /// Non-empty trimmed value, if any.
    pub fn get_non_empty(&self, key: &str) -> Option<&str> {
        self.get(key).map(str::trim).filter(|value| !value.is_empty())
    }

    /// Rewrites every line holding `key`, or appends a new entry.
    pub fn set(&mut self, key: &str, value: &str) {
        let mut found = false;
        for line in &mut self.lines {
            if let EnvLine::Entry {
                key: existing,
                value: current,
                raw,
            } = line
                && existing.eq_ignore_ascii_case(key)
            {
                found = true;
                if current.as_str() != value {
                    *current = value.to_string();
                    *raw = None;
                }
            }
        }
        if !found {
            self.lines.push(EnvLine::Entry {
                key: key.to_string(),
                value: value.to_string(),
                raw: None,
            });
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        let previous = self.get(key).map(str::to_string)?;
        self.lines.retain(|line| {
            !matches!(line, EnvLine::Entry { key: existing, .. } if existing.eq_ignore_ascii_case(key))
        });
        Some(previous)
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in &self.lines {
            match line {
                EnvLine::Verbatim(text) | EnvLine::Entry { raw: Some(text), .. } => {
                    out.push_str(text)
                }
                EnvLine::Entry {
                    key,
                    value,
                    raw: None,
                } => {
                    out.push_str(key);
                    out.push('=');
                    out.push_str(&quote_value(value));
                }
            }
            out.push('\n');
        }
        out
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(&self.path, self.render())
            .with_context(|| format!("failed to write {}", self.path.display()))
    }
}

/// Parses one line with dotenvy after escaping every `$` outside single
/// quotes, so quoting and escapes follow dotenv rules but nothing is
/// substituted. Comments and blank lines yield `None`.
fn parse_line(line: &str) -> Result<Option<(String, String)>> {
    let literal = escape_substitutions(line);
    match dotenvy::from_read_iter(literal.as_bytes()).next() {
        Some(item) => Ok(Some(item?)),
        None => Ok(None),
    }
}

fn escape_substitutions(line: &str) -> String {
    let mut out = String::with_capacity(line.len() + 4);
    let mut strong_quote = false;
    let mut weak_quote = false;
    let mut escaped = false;
    for ch in line.chars() {
        if strong_quote {
            strong_quote = ch != '\'';
        } else if escaped {
            escaped = false;
        } else {
            match ch {
                '$' => out.push('\\'),
                '\\' => escaped = true,
                '"' => weak_quote = !weak_quote,
                '\'' if !weak_quote => strong_quote = true,
                _ => {}
            }
        }
        out.push(ch);
    }
    out
}

fn quote_value(value: &str) -> String {
    let plain = value
        .chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.' | '/' | ':' | ',' | '@' | '+'));
    if plain {
        return value.to_string();
    }
    if !value.contains('\'') && !value.contains('\n') {
        return format!("'{value}'");
    }
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for ch in value.chars() {
        match ch {
            '"' | '\\' | '$' => {
                out.push('\\');
                out.push(ch);
            }
            '\n' => out.push_str("\\n"),
            _ => out.push(ch),
        }
    }
    out.push('"');
    out
}
