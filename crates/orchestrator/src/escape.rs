//! Shell quoting of caller-supplied parameters.
//!
//! Values are quoted exactly once, here. [`EscapedString`] has no public
//! constructor, so a plain `String` can never pass for a quoted one, and
//! [`shell_quote`] only accepts `&str`, so a quoted value cannot be quoted
//! again by accident.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::EscapeError;

/// A value that has been single-quoted for a POSIX shell.
#[derive(Clone, PartialEq, Eq)]
pub struct EscapedString(String);

impl EscapedString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EscapedString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for EscapedString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EscapedString({})", self.0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EscapedParams {
    values: BTreeMap<String, EscapedString>,
}

impl EscapedParams {
    pub fn get(&self, key: &str) -> Option<&EscapedString> {
        self.values.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Quotes one value: `'` becomes `'"'"'` inside a single-quoted word.
pub fn shell_quote(value: &str) -> EscapedString {
    let mut escaped = String::with_capacity(value.len() + 2);
    escaped.push('\'');
    for ch in value.chars() {
        if ch == '\'' {
            escaped.push_str("'\"'\"'");
        } else {
            escaped.push(ch);
        }
    }
    escaped.push('\'');
    EscapedString(escaped)
}

pub fn escape(params: &BTreeMap<String, String>) -> Result<EscapedParams, EscapeError> {
    let mut values = BTreeMap::new();
    for (key, value) in params {
        validate_key(key)?;
        if value.contains('\0') {
            return Err(EscapeError::NulByte { key: key.clone() });
        }
        values.insert(key.clone(), shell_quote(value));
    }
    Ok(EscapedParams { values })
}

/// Accepts raw bytes as received from the wire; a field that is not valid
/// UTF-8 is rejected rather than lossily converted.
pub fn escape_raw(params: &BTreeMap<String, Vec<u8>>) -> Result<EscapedParams, EscapeError> {
    let mut decoded = BTreeMap::new();
    for (key, bytes) in params {
        let value = std::str::from_utf8(bytes)
            .map_err(|_| EscapeError::InvalidUtf8 { key: key.clone() })?;
        decoded.insert(key.clone(), value.to_string());
    }
    escape(&decoded)
}

pub(crate) fn key_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static key regex"))
}

fn validate_key(key: &str) -> Result<(), EscapeError> {
    if key_pattern().is_match(key) {
        Ok(())
    } else {
        Err(EscapeError::InvalidKey {
            key: key.to_string(),
        })
    }
}
