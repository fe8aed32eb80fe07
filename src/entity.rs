//! Entity declarations: test cases and fixtures.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A data-file dependency declared by an entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DataDependency {
    /// The path, relative to the bundle's data directory.
    pub path: String,
}

/// A declared test case or fixture.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Entity {
    /// Stable, unique name (e.g. `pkg.TestName`).
    pub name: String,
    /// The package path the entity is declared in.
    pub package: String,
    /// Human-readable description.
    pub description: String,
    /// Contacts (e.g. email addresses) responsible for this entity.
    pub contacts: Vec<String>,
    /// Free-form string tags.
    pub attributes: Vec<String>,
    /// Data-file dependencies.
    pub data: Vec<DataDependency>,
    /// Names of services this entity depends on.
    pub service_deps: Vec<String>,
    /// Software dependency expression (feature names, `&&`/`||`/`!`).
    pub software_deps: Option<String>,
    /// Hardware dependency expression.
    pub hardware_deps: Option<String>,
    /// Per-entity timeout.
    #[serde(with = "duration_secs")]
    pub timeout: Duration,
    /// The name of the parent fixture, if any.
    pub parent_fixture: Option<String>,
    /// Whether this entity is itself a fixture.
    pub is_fixture: bool,
}

impl Entity {
    /// Creates a bare test case with no dependencies and a 30-second
    /// default timeout.
    #[must_use]
    pub fn test_case(name: impl Into<String>, package: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            package: package.into(),
            description: String::new(),
            contacts: Vec::new(),
            attributes: Vec::new(),
            data: Vec::new(),
            service_deps: Vec::new(),
            software_deps: None,
            hardware_deps: None,
            timeout: Duration::from_secs(30),
            parent_fixture: None,
            is_fixture: false,
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}
