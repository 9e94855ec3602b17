//! Component types and identifier rules shared across Kiln crates.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Maximum length of a component ID.
pub const MAX_COMPONENT_ID_LEN: usize = 128;

/// The closed set of component kinds Kiln knows how to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentType {
    /// Runs to completion and exits.
    Task,
    /// Long-running; stopped by the caller.
    Service,
}

impl ComponentType {
    pub const ALL: [ComponentType; 2] = [ComponentType::Task, ComponentType::Service];

    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentType::Task => "task",
            ComponentType::Service => "service",
        }
    }
}

impl fmt::Display for ComponentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown component type: {0:?} (expected one of: task, service)")]
pub struct UnknownComponentType(pub String);

impl FromStr for ComponentType {
    type Err = UnknownComponentType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ComponentType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownComponentType(s.to_string()))
    }
}

/// Why a component ID was rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidComponentId {
    #[error("component ID must not be empty")]
    Empty,

    #[error("component ID exceeds {MAX_COMPONENT_ID_LEN} characters")]
    TooLong,

    #[error("component ID {id:?} contains invalid character {ch:?} at position {position}")]
    InvalidChar { id: String, ch: char, position: usize },
}

/// Check that `id` can be used as a component ID.
///
/// IDs end up as image repository names, so they are limited to lowercase
/// ASCII letters, digits, `_`, `.` and `-`, and must start with a letter
/// or digit.
pub fn validate_component_id(id: &str) -> Result<(), InvalidComponentId> {
    if id.is_empty() {
        return Err(InvalidComponentId::Empty);
    }
    if id.len() > MAX_COMPONENT_ID_LEN {
        return Err(InvalidComponentId::TooLong);
    }
    for (position, ch) in id.chars().enumerate() {
        let ok = match ch {
            'a'..='z' | '0'..='9' => true,
            '_' | '.' | '-' => position > 0,
            _ => false,
        };
        if !ok {
            return Err(InvalidComponentId::InvalidChar {
                id: id.to_string(),
                ch,
                position,
            });
        }
    }
    Ok(())
}
