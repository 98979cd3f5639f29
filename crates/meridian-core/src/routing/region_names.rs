//! Canonical region names.
//!
//! User-supplied names are matched case- and whitespace-insensitively, so
//! `"westus2"`, `"West US 2"`, and `" WEST us 2 "` all resolve to `"West US 2"`.

use std::collections::HashMap;
use std::sync::LazyLock;

const KNOWN_REGIONS: &[&str] = &[
    "West US",
    "West US 2",
    "West Central US",
    "East US",
    "East US 2",
    "Central US",
    "South Central US",
    "North Central US",
    "West Europe",
    "North Europe",
    "East Asia",
    "Southeast Asia",
    "Japan East",
    "Japan West",
    "Australia East",
    "Australia Southeast",
    "Central India",
    "South India",
    "West India",
    "Canada East",
    "Canada Central",
    "China North",
    "China East",
    "China North 2",
    "China East 2",
    "Korea South",
    "Korea Central",
    "UK West",
    "UK South",
    "Brazil South",
    "USGov Arizona",
    "USGov Texas",
    "USGov Virginia",
    "East US 2 EUAP",
    "Central US EUAP",
    "France Central",
    "France South",
    "USDoD Central",
    "USDoD East",
    "Australia Central",
    "Australia Central 2",
    "South Africa North",
    "South Africa West",
    "UAE Central",
    "UAE North",
    "USNat East",
    "USNat West",
    "USSec East",
    "USSec West",
    "USSec West Central",
    "Switzerland North",
    "Switzerland West",
    "Germany North",
    "Germany West Central",
    "Norway East",
    "Norway West",
    "Brazil Southeast",
    "West US 3",
    "Jio India Central",
    "Jio India West",
    "East US SLV",
    "Sweden Central",
    "Sweden South",
    "Qatar Central",
    "China North 3",
    "China East 3",
    "Poland Central",
    "Malaysia South",
    "Italy North",
    "Israel Central",
    "Mexico Central",
    "Spain Central",
    "Taiwan North",
    "Taiwan Northwest",
    "New Zealand North",
    "Austria East",
    "Bleu France Central",
    "Bleu France South",
    "Indonesia Central",
    "Southeast US",
    "Southwest US",
    "Malaysia West",
    "Delos Cloud Germany Central",
    "Delos Cloud Germany North",
    "Chile Central",
    "South Central US 2",
    "Israel Northwest",
    "Belgium Central",
    "Denmark East",
    "Southeast US 3",
    "Southeast US 5",
];

static BY_KEY: LazyLock<HashMap<String, &'static str>> =
    LazyLock::new(|| KNOWN_REGIONS.iter().map(|name| (region_key(name), *name)).collect());

/// Lookup key: lowercase with all whitespace removed.
pub fn region_key(name: &str) -> String {
    name.chars().filter(|c| !c.is_whitespace()).flat_map(char::to_lowercase).collect()
}

/// Canonical name for `name`, or `None` if it is not a known region.
pub fn canonical_region_name(name: &str) -> Option<&'static str> {
    BY_KEY.get(&region_key(name)).copied()
}

/// Canonical name for known regions; unknown names pass through unchanged.
pub fn normalize_region_name(name: &str) -> String {
    canonical_region_name(name).map_or_else(|| name.to_string(), str::to_string)
}

/// Compare two region names ignoring case and whitespace.
pub fn same_region(a: &str, b: &str) -> bool {
    region_key(a) == region_key(b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalizes_spacing_and_case() {
        assert_eq!(normalize_region_name("westus2"), "West US 2");
        assert_eq!(normalize_region_name(" WEST us 2 "), "West US 2");
        assert_eq!(normalize_region_name("East US 2 EUAP"), "East US 2 EUAP");
    }

    #[test]
    fn test_unknown_passes_through() {
        assert_eq!(normalize_region_name("Mars Central"), "Mars Central");
        assert!(canonical_region_name("Mars Central").is_none());
    }

    #[test]
    fn test_same_region() {
        assert!(same_region("southeastasia", "Southeast Asia"));
        assert!(!same_region("West US", "West US 2"));
    }
}
