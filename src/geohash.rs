//! Geohash channel addresses.
//!
//! A channel is a geohash cell. One message is tagged with every prefix of
//! its cell from two characters up so it can be found at coarser zoom
//! levels without being republished.

use std::fmt;

use anyhow::{bail, Result};
use serde::Serialize;

const BASE32: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";

/// Longest geohash accepted. Twelve characters is already sub-metre.
pub const MAX_PRECISION: usize = 12;

/// Shortest prefix emitted as a hierarchical tag.
pub const MIN_TAG_LEN: usize = 2;

/// A validated latitude/longitude pair in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Location {
    pub lat: f64,
    pub lon: f64,
}

impl Location {
    pub fn new(lat: f64, lon: f64) -> Result<Self> {
        if !lat.is_finite() || !(-90.0..=90.0).contains(&lat) {
            bail!("latitude out of range: {lat}");
        }
        if !lon.is_finite() || !(-180.0..=180.0).contains(&lon) {
            bail!("longitude out of range: {lon}");
        }
        Ok(Self { lat, lon })
    }
}

/// Coarse naming of geohash precisions used for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GeohashLevel {
    Region,
    Province,
    City,
    Neighborhood,
    Block,
}

impl GeohashLevel {
    pub fn from_len(len: usize) -> Self {
        match len {
            0..=2 => GeohashLevel::Region,
            3..=4 => GeohashLevel::Province,
            5 => GeohashLevel::City,
            6 => GeohashLevel::Neighborhood,
            _ => GeohashLevel::Block,
        }
    }
}

impl fmt::Display for GeohashLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GeohashLevel::Region => "region",
            GeohashLevel::Province => "province",
            GeohashLevel::City => "city",
            GeohashLevel::Neighborhood => "neighborhood",
            GeohashLevel::Block => "block",
        };
        f.write_str(name)
    }
}

/// Encode a point as a geohash of `precision` characters.
pub fn encode(lat: f64, lon: f64, precision: usize) -> Result<String> {
    if !(1..=MAX_PRECISION).contains(&precision) {
        bail!("geohash precision must be between 1 and {MAX_PRECISION}, got {precision}");
    }
    Location::new(lat, lon)?;
    let (mut lat_lo, mut lat_hi) = (-90.0_f64, 90.0_f64);
    let (mut lon_lo, mut lon_hi) = (-180.0_f64, 180.0_f64);
    let mut out = String::with_capacity(precision);
    let mut even = true;
    let mut bits = 0;
    let mut idx = 0usize;
    while out.len() < precision {
        // Bits alternate longitude, latitude, starting with longitude.
        if even {
            let mid = (lon_lo + lon_hi) / 2.0;
            if lon >= mid {
                idx = idx * 2 + 1;
                lon_lo = mid;
            } else {
                idx *= 2;
                lon_hi = mid;
            }
        } else {
            let mid = (lat_lo + lat_hi) / 2.0;
            if lat >= mid {
                idx = idx * 2 + 1;
                lat_lo = mid;
            } else {
                idx *= 2;
                lat_hi = mid;
            }
        }
        even = !even;
        bits += 1;
        if bits == 5 {
            out.push(BASE32[idx] as char);
            bits = 0;
            idx = 0;
        }
    }
    Ok(out)
}

/// Decode a geohash to the centre of its cell.
pub fn decode(geohash: &str) -> Result<Location> {
    let geohash = normalize(geohash)?;
    let (mut lat_lo, mut lat_hi) = (-90.0_f64, 90.0_f64);
    let (mut lon_lo, mut lon_hi) = (-180.0_f64, 180.0_f64);
    let mut even = true;
    for c in geohash.bytes() {
        let idx = BASE32.iter().position(|b| *b == c).unwrap_or_default();
        for shift in (0..5).rev() {
            let bit = (idx >> shift) & 1 == 1;
            if even {
                let mid = (lon_lo + lon_hi) / 2.0;
                if bit {
                    lon_lo = mid;
                } else {
                    lon_hi = mid;
                }
            } else {
                let mid = (lat_lo + lat_hi) / 2.0;
                if bit {
                    lat_lo = mid;
                } else {
                    lat_hi = mid;
                }
            }
            even = !even;
        }
    }
    Location::new((lat_lo + lat_hi) / 2.0, (lon_lo + lon_hi) / 2.0)
}

/// Lowercase and validate a geohash string.
pub fn normalize(geohash: &str) -> Result<String> {
    let g = geohash.trim().to_ascii_lowercase();
    if g.is_empty() || g.len() > MAX_PRECISION {
        bail!("geohash must be 1 to {MAX_PRECISION} characters: {geohash:?}");
    }
    if let Some(bad) = g.bytes().find(|c| !BASE32.contains(c)) {
        bail!("invalid geohash character {:?} in {geohash:?}", bad as char);
    }
    Ok(g)
}

/// Every prefix of `geohash` from two characters up to the full string.
pub fn hierarchical_tags(geohash: &str) -> Vec<String> {
    let len = geohash.chars().count();
    (MIN_TAG_LEN..=len)
        .map(|n| geohash.chars().take(n).collect())
        .collect()
}

/// Two-directional prefix test: a message posted to `channel` belongs to the
/// local `region` when either code is a prefix of the other. Publishers and
/// readers may resolve their cell at different precisions.
pub fn is_member(channel: &str, region: &str) -> bool {
    if channel.is_empty() || region.is_empty() {
        return false;
    }
    let channel = channel.to_ascii_lowercase();
    let region = region.to_ascii_lowercase();
    channel.starts_with(&region) || region.starts_with(&channel)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_reference_point() {
        assert_eq!(encode(57.64911, 10.40744, 11).unwrap(), "u4pruydqqvj");
        assert_eq!(encode(57.64911, 10.40744, 5).unwrap(), "u4pru");
    }

    #[test]
    fn encode_is_deterministic_and_prefix_stable() {
        let long = encode(-33.8688, 151.2093, 9).unwrap();
        let short = encode(-33.8688, 151.2093, 4).unwrap();
        assert!(long.starts_with(&short));
        assert_eq!(long, encode(-33.8688, 151.2093, 9).unwrap());
    }

    #[test]
    fn encode_rejects_bad_input() {
        assert!(encode(0.0, 0.0, 0).is_err());
        assert!(encode(0.0, 0.0, 13).is_err());
        assert!(encode(91.0, 0.0, 5).is_err());
        assert!(encode(0.0, -181.0, 5).is_err());
        assert!(encode(f64::NAN, 0.0, 5).is_err());
    }

    #[test]
    fn decode_returns_cell_centre() {
        let loc = decode("u4pruydqqvj").unwrap();
        assert!((loc.lat - 57.64911).abs() < 0.001);
        assert!((loc.lon - 10.40744).abs() < 0.001);
        assert_eq!(encode(loc.lat, loc.lon, 5).unwrap(), "u4pru");
        assert!(decode("u4a!").is_err());
        assert!(decode("").is_err());
    }

    #[test]
    fn normalize_lowercases() {
        assert_eq!(normalize(" U4PRU ").unwrap(), "u4pru");
        assert!(normalize("u4pia").is_err());
    }

    #[test]
    fn hierarchical_tags_form_prefix_chain() {
        for g in ["u4pruydqqvj", "9q8yy", "gc", "r3gx2f"] {
            let tags = hierarchical_tags(g);
            assert_eq!(tags.len(), g.len() - 1);
            assert_eq!(tags.first().map(String::len), Some(2));
            assert_eq!(tags.last().map(String::as_str), Some(g));
            for pair in tags.windows(2) {
                assert_eq!(pair[1].len(), pair[0].len() + 1);
                assert!(pair[1].starts_with(&pair[0]));
            }
        }
        assert!(hierarchical_tags("u").is_empty());
    }

    #[test]
    fn membership_is_two_directional() {
        assert!(is_member("u4pru", "u4pru"));
        assert!(is_member("u4", "u4pru"));
        assert!(is_member("u4pruydq", "u4pru"));
        assert!(is_member("U4PRU", "u4pru"));
        assert!(!is_member("u4prv", "u4pru"));
        assert!(!is_member("bbxyz", "aaxyz"));
        assert!(!is_member("", "u4pru"));
    }

    #[test]
    fn levels_by_length() {
        assert_eq!(GeohashLevel::from_len(2), GeohashLevel::Region);
        assert_eq!(GeohashLevel::from_len(4), GeohashLevel::Province);
        assert_eq!(GeohashLevel::from_len(5), GeohashLevel::City);
        assert_eq!(GeohashLevel::from_len(6).to_string(), "neighborhood");
        assert_eq!(GeohashLevel::from_len(9), GeohashLevel::Block);
    }
}
