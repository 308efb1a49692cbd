use serde::{Deserialize, Serialize};
use std::fmt;

/// Record kinds the backend exposes.
///
/// Serialized in camelCase (`fuelRecord`). Unknown names round-trip through
/// [`EntityType::Other`] so newer clients can queue kinds this build does not know.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EntityType {
    Vehicle,
    FuelRecord,
    ServiceRecord,
    MotRecord,
    Part,
    Consumable,
    Insurance,
    Other(String),
}

impl EntityType {
    pub fn as_str(&self) -> &str {
        match self {
            EntityType::Vehicle => "vehicle",
            EntityType::FuelRecord => "fuelRecord",
            EntityType::ServiceRecord => "serviceRecord",
            EntityType::MotRecord => "motRecord",
            EntityType::Part => "part",
            EntityType::Consumable => "consumable",
            EntityType::Insurance => "insurance",
            EntityType::Other(name) => name,
        }
    }

    /// REST collection segment, e.g. `fuel-records` in `POST /fuel-records`.
    pub fn resource(&self) -> &str {
        match self {
            EntityType::Vehicle => "vehicles",
            EntityType::FuelRecord => "fuel-records",
            EntityType::ServiceRecord => "service-records",
            EntityType::MotRecord => "mot-records",
            EntityType::Part => "parts",
            EntityType::Consumable => "consumables",
            EntityType::Insurance => "insurance",
            EntityType::Other(name) => name,
        }
    }
}

impl From<String> for EntityType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "vehicle" => EntityType::Vehicle,
            "fuelRecord" => EntityType::FuelRecord,
            "serviceRecord" => EntityType::ServiceRecord,
            "motRecord" => EntityType::MotRecord,
            "part" => EntityType::Part,
            "consumable" => EntityType::Consumable,
            "insurance" => EntityType::Insurance,
            _ => EntityType::Other(s),
        }
    }
}

impl From<EntityType> for String {
    fn from(t: EntityType) -> Self {
        match t {
            EntityType::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
