use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    #[default]
    Test,
    Fixture,
}

/// A test or fixture, as registered by a bundle.
///
/// `fixture` names the parent fixture within the same bundle, or is empty.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct Entity {
    pub name: String,
    #[serde(rename = "type", default)]
    pub entity_type: EntityType,
    #[serde(default)]
    pub fixture: String,
    #[serde(default)]
    pub bundle: String,
    #[serde(default, with = "duration_secs")]
    pub timeout: Duration,
}

impl Entity {
    pub fn test(
        name: impl Into<String>,
        bundle: impl Into<String>,
        fixture: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            entity_type: EntityType::Test,
            fixture: fixture.into(),
            bundle: bundle.into(),
            timeout: Duration::ZERO,
        }
    }

    pub fn fixture(
        name: impl Into<String>,
        bundle: impl Into<String>,
        parent: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            entity_type: EntityType::Fixture,
            fixture: parent.into(),
            bundle: bundle.into(),
            timeout: Duration::ZERO,
        }
    }

    pub fn is_test(&self) -> bool {
        self.entity_type == EntityType::Test
    }
}

/// An entity paired with the bundle that provides it and its distance from the orchestrator.
///
/// `hops == 0` means the bundle runs alongside the orchestrator (a remote bundle); anything
/// greater runs on the DUT (a local bundle).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BundleEntity {
    pub bundle: String,
    #[serde(default)]
    pub hops: u32,
    pub entity: Entity,
}

impl BundleEntity {
    pub fn is_local(&self) -> bool {
        self.hops > 0
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom(format!(
                "invalid timeout of {secs} seconds"
            )));
        }
        Ok(Duration::from_secs_f64(secs))
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::{BundleEntity, Entity, EntityType};

    #[test]
    fn deserializes_sparse_entity() {
        let entity: Entity = serde_json::from_str(r#"{"name": "pkg.Test"}"#).unwrap();
        assert_eq!(entity, Entity::test("pkg.Test", "", ""));
    }

    #[test]
    fn deserializes_bundle_fixture() {
        let entity: BundleEntity = serde_json::from_str(
            r#"{"bundle": "cros", "hops": 1,
                "entity": {"name": "fixt", "type": "fixture", "fixture": "parent", "timeout": 1.5}}"#,
        )
        .unwrap();
        assert!(entity.is_local());
        assert_eq!(entity.entity.entity_type, EntityType::Fixture);
        assert_eq!(entity.entity.fixture, "parent");
        assert_eq!(entity.entity.timeout, Duration::from_millis(1500));
    }

    #[test]
    fn rejects_negative_timeout() {
        let entity: Result<Entity, _> = serde_json::from_str(r#"{"name": "t", "timeout": -1}"#);
        assert!(entity.is_err());
    }
}
