use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum TargetClass {
    #[default]
    Server,
    App,
}

impl fmt::Display for TargetClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetClass::Server => f.write_str("server"),
            TargetClass::App => f.write_str("app"),
        }
    }
}

/// A named command template declared as data.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ScriptDefinition {
    pub id: String,
    pub template: String,
    #[serde(default)]
    pub success_markers: Vec<String>,
    #[serde(default)]
    pub failure_markers: Vec<String>,
    /// Parameter names whose values never appear in logs or audit records.
    #[serde(default)]
    pub secrets: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Ids travel in callback URL paths, so they are restricted to a URL-safe set.
pub fn is_valid_identifier(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'))
}

pub fn parse_ssh_destination(value: &str) -> Option<(&str, &str)> {
    let (user, host) = value.trim().split_once('@')?;
    if user.is_empty() || host.is_empty() || host.contains('@') {
        return None;
    }
    Some((user, host))
}
