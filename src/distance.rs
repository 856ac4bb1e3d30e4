//! Great-circle ranking of relay endpoints.

use std::collections::{BTreeMap, HashSet};

use crate::{directory::RelayEndpoint, relay_set::normalize_url};

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Haversine distance in kilometres on a spherical Earth. Accurate enough to
/// rank relays, not to navigate by.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().min(1.0).asin()
}

/// The `n` endpoints nearest to `(lat, lon)`, nearest first. Equal distances
/// keep their input order.
pub fn closest_n(endpoints: &[RelayEndpoint], lat: f64, lon: f64, n: usize) -> Vec<RelayEndpoint> {
    if n == 0 {
        return vec![];
    }
    let mut ranked: Vec<(f64, &RelayEndpoint)> = endpoints
        .iter()
        .map(|e| (haversine_km(lat, lon, e.lat, e.lon), e))
        .collect();
    // `sort_by` is stable, which gives the input-order tie break.
    ranked.sort_by(|a, b| a.0.total_cmp(&b.0));
    ranked.into_iter().take(n).map(|(_, e)| e.clone()).collect()
}

/// Pick `n` endpoints spread across the globe.
///
/// The globe is cut into `cell_degrees`-sized lat/lon cells. Each round takes
/// the next unused relay from every populated cell, so no cell is drained
/// while another still has relays left. URLs are deduplicated.
pub fn globally_distributed_n(
    endpoints: &[RelayEndpoint],
    n: usize,
    cell_degrees: f64,
) -> Vec<RelayEndpoint> {
    if n == 0 || endpoints.is_empty() {
        return vec![];
    }
    let cell = if cell_degrees.is_finite() && cell_degrees > 0.0 {
        cell_degrees
    } else {
        30.0
    };
    let mut seen = HashSet::new();
    let mut cells: BTreeMap<(i64, i64), Vec<&RelayEndpoint>> = BTreeMap::new();
    for e in endpoints {
        if !seen.insert(normalize_url(&e.url)) {
            continue;
        }
        let key = (
            ((e.lat + 90.0) / cell).floor() as i64,
            ((e.lon + 180.0) / cell).floor() as i64,
        );
        cells.entry(key).or_default().push(e);
    }

    let mut picked = Vec::with_capacity(n);
    let mut round = 0;
    loop {
        let mut took_any = false;
        for bucket in cells.values() {
            if let Some(e) = bucket.get(round) {
                picked.push((*e).clone());
                took_any = true;
                if picked.len() == n {
                    return picked;
                }
            }
        }
        if !took_any {
            return picked;
        }
        round += 1;
    }
}
