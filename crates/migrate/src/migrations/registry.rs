//! Migration Registry - The ordered set of known migration units
//!
//! A registry is a plain value built once per invocation from a source. It is
//! never global, so separate runs (and separate tests) cannot observe each
//! other's units.

use std::collections::HashMap;

use super::definitions::{MigrationUnit, MigrationVersion};
use super::manager::MigrationSource;
use crate::error::{MigrationError, MigrationResult};

/// Strictly ordered, duplicate-free sequence of migration units
#[derive(Debug, Clone, Default)]
pub struct MigrationRegistry {
    units: Vec<MigrationUnit>,
}

impl MigrationRegistry {
    /// Discover every unit from a source and order them by version
    pub fn load_all(source: &dyn MigrationSource) -> MigrationResult<Self> {
        let units = source.discover()?;
        let registry = Self::from_units(units)?;
        tracing::debug!(
            source = %source.describe(),
            units = registry.len(),
            "loaded migration registry"
        );
        Ok(registry)
    }

    /// Order the given units, rejecting duplicate versions
    pub fn from_units(mut units: Vec<MigrationUnit>) -> MigrationResult<Self> {
        units.sort_by(|a, b| a.version.cmp(&b.version));

        if let Some(pair) = units.windows(2).find(|pair| pair[0].version == pair[1].version) {
            // Report the two origins in a stable order regardless of discovery order
            let (first, second) = if pair[0].origin <= pair[1].origin {
                (&pair[0], &pair[1])
            } else {
                (&pair[1], &pair[0])
            };
            return Err(MigrationError::DuplicateVersion {
                version: pair[0].version.to_string(),
                first: first.origin.clone(),
                second: second.origin.clone(),
            });
        }

        Ok(Self { units })
    }

    /// All units in ascending version order
    pub fn units(&self) -> &[MigrationUnit] {
        &self.units
    }

    /// Find a unit by version string
    pub fn get(&self, version: &str) -> Option<&MigrationUnit> {
        self.units
            .binary_search_by(|unit| unit.version.as_str().cmp(version))
            .ok()
            .map(|index| &self.units[index])
    }

    pub fn contains(&self, version: &str) -> bool {
        self.get(version).is_some()
    }

    /// The highest known version
    pub fn latest(&self) -> Option<&MigrationVersion> {
        self.units.last().map(|unit| &unit.version)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Version to unit lookup table
    pub fn by_version(&self) -> HashMap<&str, &MigrationUnit> {
        self.units
            .iter()
            .map(|unit| (unit.version.as_str(), unit))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrations::manager::StaticSource;

    fn unit(version: &str, origin: &str) -> MigrationUnit {
        MigrationUnit::sql(
            version,
            format!("unit {}", version),
            "CREATE TABLE t (id INTEGER);",
            "DROP TABLE t;",
        )
        .unwrap()
        .with_origin(origin)
    }

    fn versions(registry: &MigrationRegistry) -> Vec<&str> {
        registry.units().iter().map(|u| u.version.as_str()).collect()
    }

    #[test]
    fn test_order_is_independent_of_discovery_order() {
        let forward = vec![
            unit("20240101000000", "a"),
            unit("20240201000000", "b"),
            unit("20240301000000", "c"),
        ];
        let mut shuffled = vec![forward[2].clone(), forward[0].clone(), forward[1].clone()];

        let a = MigrationRegistry::from_units(forward).unwrap();
        let b = MigrationRegistry::from_units(shuffled.clone()).unwrap();
        shuffled.reverse();
        let c = MigrationRegistry::load_all(&StaticSource::new(shuffled)).unwrap();

        let expected = vec!["20240101000000", "20240201000000", "20240301000000"];
        assert_eq!(versions(&a), expected);
        assert_eq!(versions(&b), expected);
        assert_eq!(versions(&c), expected);
    }

    #[test]
    fn test_duplicate_version_is_fatal() {
        let err = MigrationRegistry::from_units(vec![
            unit("20240101000000", "b.sql"),
            unit("20240201000000", "c.sql"),
            unit("20240101000000", "a.sql"),
        ])
        .unwrap_err();

        match err {
            MigrationError::DuplicateVersion {
                version,
                first,
                second,
            } => {
                assert_eq!(version, "20240101000000");
                assert_eq!(first, "a.sql");
                assert_eq!(second, "b.sql");
            }
            other => panic!("expected DuplicateVersion, got {:?}", other),
        }
    }

    #[test]
    fn test_lookup_and_latest() {
        let registry = MigrationRegistry::from_units(vec![
            unit("20240201000000", "b"),
            unit("20240101000000", "a"),
        ])
        .unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.contains("20240101000000"));
        assert!(!registry.contains("20240115000000"));
        assert_eq!(registry.get("20240201000000").unwrap().origin, "b");
        assert_eq!(registry.latest().unwrap().as_str(), "20240201000000");
        assert!(MigrationRegistry::default().latest().is_none());
    }
}
