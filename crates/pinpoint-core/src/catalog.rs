//! Location catalog that round targets are drawn from.

use std::collections::HashSet;

use rand::Rng;
use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};

use crate::round::{Coordinates, Target};

/// Broad geographic region used to filter target selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Region {
    Europe,
    Asia,
    Africa,
    NorthAmerica,
    SouthAmerica,
    Oceania,
}

/// Target-selection parameters chosen by the host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetSelection {
    /// Regions to draw from. Empty means the whole catalog.
    pub regions: Vec<Region>,
    /// Allow the same location twice in one game.
    pub allow_repeats: bool,
}

impl TargetSelection {
    fn admits(&self, region: Region) -> bool {
        self.regions.is_empty() || self.regions.contains(&region)
    }
}

/// A catalog entry. Clients only ever see the `id` until the round closes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub id: String,
    pub name: String,
    pub region: Region,
    pub coordinates: Coordinates,
}

/// Source of candidate locations.
pub trait LocationCatalog: Send + Sync {
    fn locations(&self) -> &[Location];
}

/// Pick a target for the next round.
///
/// Locations already in `used` are skipped unless repeats are allowed. When
/// the filtered pool is exhausted the draw falls back to the whole filtered
/// pool, and when the filter matches nothing it falls back to the catalog.
pub fn pick_target<R: Rng + ?Sized>(
    catalog: &dyn LocationCatalog,
    selection: &TargetSelection,
    used: &HashSet<String>,
    rng: &mut R,
) -> Option<Target> {
    let all = catalog.locations();
    let mut pool: Vec<&Location> = all.iter().filter(|l| selection.admits(l.region)).collect();
    if pool.is_empty() {
        tracing::debug!(regions = ?selection.regions, "No locations match selection, using full catalog");
        pool = all.iter().collect();
    }
    if !selection.allow_repeats {
        let fresh: Vec<&Location> = pool
            .iter()
            .copied()
            .filter(|l| !used.contains(&l.id))
            .collect();
        if !fresh.is_empty() {
            pool = fresh;
        }
    }
    pool.choose(rng).map(|l| Target {
        location_id: l.id.clone(),
        coordinates: l.coordinates,
        region: l.region,
    })
}

/// Small built-in catalog of well-known places.
pub struct BuiltinCatalog {
    locations: Vec<Location>,
}

impl Default for BuiltinCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl BuiltinCatalog {
    pub fn new() -> Self {
        const ENTRIES: &[(&str, &str, Region, f64, f64)] = &[
            ("eu-paris", "Paris", Region::Europe, 48.8566, 2.3522),
            ("eu-rome", "Rome", Region::Europe, 41.9028, 12.4964),
            ("eu-reykjavik", "Reykjavik", Region::Europe, 64.1466, -21.9426),
            ("eu-lisbon", "Lisbon", Region::Europe, 38.7223, -9.1393),
            ("eu-krakow", "Krakow", Region::Europe, 50.0647, 19.9450),
            ("as-tokyo", "Tokyo", Region::Asia, 35.6762, 139.6503),
            ("as-kathmandu", "Kathmandu", Region::Asia, 27.7172, 85.3240),
            ("as-hanoi", "Hanoi", Region::Asia, 21.0278, 105.8342),
            ("as-ulaanbaatar", "Ulaanbaatar", Region::Asia, 47.8864, 106.9057),
            ("as-istanbul", "Istanbul", Region::Asia, 41.0082, 28.9784),
            ("af-cairo", "Cairo", Region::Africa, 30.0444, 31.2357),
            ("af-nairobi", "Nairobi", Region::Africa, -1.2921, 36.8219),
            ("af-capetown", "Cape Town", Region::Africa, -33.9249, 18.4241),
            ("af-marrakesh", "Marrakesh", Region::Africa, 31.6295, -7.9811),
            ("na-newyork", "New York", Region::NorthAmerica, 40.7128, -74.0060),
            ("na-mexicocity", "Mexico City", Region::NorthAmerica, 19.4326, -99.1332),
            ("na-vancouver", "Vancouver", Region::NorthAmerica, 49.2827, -123.1207),
            ("na-anchorage", "Anchorage", Region::NorthAmerica, 61.2181, -149.9003),
            ("sa-lima", "Lima", Region::SouthAmerica, -12.0464, -77.0428),
            ("sa-buenosaires", "Buenos Aires", Region::SouthAmerica, -34.6037, -58.3816),
            ("sa-rio", "Rio de Janeiro", Region::SouthAmerica, -22.9068, -43.1729),
            ("oc-sydney", "Sydney", Region::Oceania, -33.8688, 151.2093),
            ("oc-auckland", "Auckland", Region::Oceania, -36.8485, 174.7633),
            ("oc-suva", "Suva", Region::Oceania, -18.1248, 178.4501),
        ];
        let locations = ENTRIES
            .iter()
            .map(|&(id, name, region, lat, lng)| Location {
                id: id.to_string(),
                name: name.to_string(),
                region,
                coordinates: Coordinates { lat, lng },
            })
            .collect();
        Self { locations }
    }
}

impl LocationCatalog for BuiltinCatalog {
    fn locations(&self) -> &[Location] {
        &self.locations
    }
}
