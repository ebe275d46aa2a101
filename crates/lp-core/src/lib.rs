//! Core domain model for the LunchPlanner catalog sync.

use std::fmt;

use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "lp-core";

/// Top-level cuisine category as delivered by the source, with its nested
/// refinements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kitchen {
    pub id: i32,
    pub description_de: String,
    pub description_en: String,
    pub image_url: String,
    #[serde(default)]
    pub sub_kitchens: Vec<SubKitchen>,
}

/// Refinement category under a [`Kitchen`]. `kitchen_id` is filled in from the
/// parent while decoding the snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubKitchen {
    pub id: i32,
    pub description_de: String,
    pub description_en: String,
    pub kitchen_id: i32,
}

impl SubKitchen {
    /// Business filter: a sub-kitchen that is blank in every language is never
    /// persisted (and is not an error).
    pub fn has_description(&self) -> bool {
        !(self.description_de.trim().is_empty() && self.description_en.trim().is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

/// One deliverable/pickup-able venue for the configured delivery area.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Restaurant {
    pub id: String,
    pub name: String,
    pub logo_url: Option<String>,
    pub city: String,
    pub street: String,
    pub delivery: bool,
    pub pickup: bool,
    pub location: Option<GeoPoint>,
    #[serde(default)]
    pub sub_kitchen_ids: Vec<i32>,
}

/// Many-to-many link row; composite identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestaurantSubKitchen {
    pub restaurant_id: String,
    pub sub_kitchen_id: i32,
}

/// The full hierarchical catalog fetched from the source in one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountrySnapshot {
    pub country_code: String,
    pub kitchens: Vec<Kitchen>,
}

/// Delivery area the restaurant list is requested for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryArea {
    pub postal_code: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// Entity discriminator used by the error sink and the run summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Kitchen,
    SubKitchen,
    Restaurant,
    Association,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Kitchen => "kitchen",
            EntityKind::SubKitchen => "subkitchen",
            EntityKind::Restaurant => "restaurant",
            EntityKind::Association => "association",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-entity outcome tally for one pipeline run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub filtered: usize,
}

impl fmt::Display for Counts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "attempted={} succeeded={} failed={} filtered={}",
            self.attempted, self.succeeded, self.failed, self.filtered
        )
    }
}
