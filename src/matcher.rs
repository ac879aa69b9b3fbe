//! File name matchers and the semicolon-delimited matcher spec format.

use globset::{Glob, GlobBuilder};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, thiserror::Error)]
pub enum MatcherSpecError {
    #[error("empty token at position {position} in `{field}`")]
    EmptyToken { field: &'static str, position: usize },

    #[error("invalid wildcard pattern `{pattern}`: {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: globset::Error,
    },
}

/// A rule mapping a file name (or a content marker) to a classification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Matcher {
    Extension(String),
    ExactName { name: String, case_sensitive: bool },
    Wildcard(String),
    HashBang(String),
}

impl Matcher {
    pub fn extension(ext: &str) -> Self {
        Matcher::Extension(ext.trim_start_matches('.').to_lowercase())
    }

    pub fn exact(name: impl Into<String>) -> Self {
        Matcher::ExactName {
            name: name.into(),
            case_sensitive: true,
        }
    }

    pub fn exact_any_case(name: impl Into<String>) -> Self {
        Matcher::ExactName {
            name: name.into(),
            case_sensitive: false,
        }
    }

    pub fn hash_bang(marker: impl Into<String>) -> Self {
        Matcher::HashBang(marker.into())
    }

    /// Validates `pattern` as a glob and returns a wildcard matcher for it.
    pub fn wildcard(pattern: &str) -> Result<Self, MatcherSpecError> {
        build_glob(pattern)?;
        Ok(Matcher::Wildcard(pattern.to_string()))
    }

    /// Parses a user-facing pattern, collapsing the common shapes into
    /// their cheaper forms: `*.rs` becomes an extension matcher and a
    /// pattern without wildcard characters becomes an exact name.
    pub fn from_pattern(pattern: &str) -> Result<Self, MatcherSpecError> {
        if let Some(ext) = pattern.strip_prefix("*.")
            && !ext.is_empty()
            && !has_wildcards(ext)
            && !ext.contains('.')
        {
            return Ok(Matcher::extension(ext));
        }
        if !has_wildcards(pattern) {
            return Ok(Matcher::exact(pattern));
        }
        Matcher::wildcard(pattern)
    }

    /// Checks `file_name` against this matcher. Hash-bang matchers never
    /// match a file name.
    pub fn accepts(&self, file_name: &str) -> bool {
        match self {
            Matcher::Extension(ext) => extension_candidates(file_name).any(|c| c.eq_ignore_ascii_case(ext)),
            Matcher::ExactName {
                name,
                case_sensitive: true,
            } => name == file_name,
            Matcher::ExactName {
                name,
                case_sensitive: false,
            } => name.eq_ignore_ascii_case(file_name),
            Matcher::Wildcard(pattern) => build_glob(pattern)
                .map(|g| g.compile_matcher().is_match(file_name))
                .unwrap_or(false),
            Matcher::HashBang(_) => false,
        }
    }

    pub fn is_hash_bang(&self) -> bool {
        matches!(self, Matcher::HashBang(_))
    }
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Matcher::Extension(ext) => write!(f, "*.{ext}"),
            Matcher::ExactName { name, .. } => f.write_str(name),
            Matcher::Wildcard(pattern) => f.write_str(pattern),
            Matcher::HashBang(marker) => write!(f, "#!{marker}"),
        }
    }
}

/// Matcher declarations as supplied by a provider: four semicolon-delimited
/// token lists.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherSpec {
    pub extensions: String,
    pub file_names: String,
    pub file_names_case_insensitive: String,
    pub patterns: String,
}

impl MatcherSpec {
    pub fn extensions(mut self, raw: impl Into<String>) -> Self {
        self.extensions = raw.into();
        self
    }

    pub fn file_names(mut self, raw: impl Into<String>) -> Self {
        self.file_names = raw.into();
        self
    }

    pub fn file_names_case_insensitive(mut self, raw: impl Into<String>) -> Self {
        self.file_names_case_insensitive = raw.into();
        self
    }

    pub fn patterns(mut self, raw: impl Into<String>) -> Self {
        self.patterns = raw.into();
        self
    }

    pub fn parse(&self) -> Result<Vec<Matcher>, MatcherSpecError> {
        let mut out = Vec::new();
        for token in split_tokens("extensions", &self.extensions)? {
            out.push(Matcher::extension(token));
        }
        for token in split_tokens("file_names", &self.file_names)? {
            out.push(Matcher::exact(token));
        }
        for token in split_tokens(
            "file_names_case_insensitive",
            &self.file_names_case_insensitive,
        )? {
            out.push(Matcher::exact_any_case(token));
        }
        for token in split_tokens("patterns", &self.patterns)? {
            out.push(Matcher::from_pattern(token)?);
        }
        Ok(out)
    }
}

fn split_tokens<'a>(field: &'static str, raw: &'a str) -> Result<Vec<&'a str>, MatcherSpecError> {
    if raw.trim().is_empty() {
        return Ok(Vec::new());
    }
    raw.split(';')
        .enumerate()
        .map(|(position, token)| {
            let token = token.trim();
            if token.is_empty() {
                Err(MatcherSpecError::EmptyToken { field, position })
            } else {
                Ok(token)
            }
        })
        .collect()
}

fn has_wildcards(s: &str) -> bool {
    s.contains(['*', '?'])
}

/// Builds a glob where only `*` and `?` are special and `*` never crosses a
/// path separator.
pub(crate) fn build_glob(pattern: &str) -> Result<Glob, MatcherSpecError> {
    let mut escaped = String::with_capacity(pattern.len());
    for c in pattern.chars() {
        match c {
            '*' | '?' => escaped.push(c),
            _ => {
                let mut buf = [0u8; 4];
                escaped.push_str(&globset::escape(c.encode_utf8(&mut buf)));
            }
        }
    }
    GlobBuilder::new(&escaped)
        .literal_separator(true)
        .build()
        .map_err(|source| MatcherSpecError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })
}

/// Yields the extension candidates of `file_name`, longest first:
/// `a.tar.gz` yields `tar.gz` then `gz`.
pub(crate) fn extension_candidates(file_name: &str) -> impl Iterator<Item = &str> {
    file_name
        .match_indices('.')
        .map(move |(i, _)| &file_name[i + 1..])
        .filter(|candidate| !candidate.is_empty())
}

/// Extracts the interpreter named on a `#!` first line, looking through
/// `/usr/bin/env` and its flags.
pub fn hash_bang_command(text: &str) -> Option<&str> {
    let line = text.lines().next()?;
    let rest = line.strip_prefix("#!")?.trim();
    let mut tokens = rest.split_whitespace();
    let interpreter = basename(tokens.next()?);
    if interpreter != "env" {
        return Some(interpreter);
    }
    tokens
        .find(|t| !t.starts_with('-') && !t.contains('='))
        .map(basename)
}

/// `python3.11` -> `python`. `None` when there is no version suffix.
pub(crate) fn strip_version_suffix(command: &str) -> Option<&str> {
    let stripped = command.trim_end_matches(|c: char| c.is_ascii_digit() || c == '.');
    (!stripped.is_empty() && stripped.len() != command.len()).then_some(stripped)
}

fn basename(token: &str) -> &str {
    token.rsplit(['/', '\\']).next().unwrap_or(token)
}
