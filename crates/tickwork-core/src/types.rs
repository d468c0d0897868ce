use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Store-assigned job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for JobId {
    fn from(v: i64) -> Self {
        Self(v)
    }
}

/// Store-assigned trigger identifier.
///
/// Ordering matters: among triggers due at the same instant the lower id
/// fires first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TriggerId(pub i64);

impl fmt::Display for TriggerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for TriggerId {
    fn from(v: i64) -> Self {
        Self(v)
    }
}

/// Identifies one run of a job (all attempts of a single fire share it).
///
/// UUIDv7 so execution-log rows sort by creation time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Name of a scheduler instance, unique within its namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceName(pub String);

impl InstanceName {
    /// Generate a random instance name of the form `tickwork-<8 hex chars>`.
    pub fn generate() -> Self {
        let id = Uuid::new_v4().simple().to_string();
        Self(format!("tickwork-{}", &id[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for InstanceName {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for InstanceName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_instance_names_are_distinct() {
        let a = InstanceName::generate();
        let b = InstanceName::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("tickwork-"));
        assert_eq!(a.as_str().len(), "tickwork-".len() + 8);
    }

    #[test]
    fn trigger_ids_order_numerically() {
        let mut ids = vec![TriggerId(10), TriggerId(2), TriggerId(7)];
        ids.sort();
        assert_eq!(ids, vec![TriggerId(2), TriggerId(7), TriggerId(10)]);
    }

    #[test]
    fn run_id_round_trips_through_display() {
        let id = RunId::new();
        let parsed: RunId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }
}
