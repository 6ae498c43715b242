// Longitude arithmetic that survives the international date line.

/// Signed shortest extent from `lon1` eastwards to `lon2`, in `[-180, 180)`.
#[inline]
pub fn longitudinal_extent(lon1: f64, lon2: f64) -> f64 {
    (lon2 - lon1 + 180.0).rem_euclid(360.0) - 180.0
}

/// Move `lon` into `[west, west + 360)` so that it compares monotonically
/// with unwrapped edges starting at `west`.
#[inline]
pub fn unwrap_lon(west: f64, lon: f64) -> f64 {
    west + (lon - west).rem_euclid(360.0)
}

/// `(west, east, north, south)` of the points; `west > east` when the box
/// straddles the date line.
pub fn spherical_bounding_box(lons: &[f64], lats: &[f64]) -> Option<(f64, f64, f64, f64)> {
    if lons.is_empty() || lons.len() != lats.len() {
        return None;
    }
    let fold = |it: &[f64]| {
        it.iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)))
    };
    let (mut west, mut east) = fold(lons);
    let (south, north) = fold(lats);
    if longitudinal_extent(west, east) < 0.0 {
        let positive: Vec<f64> = lons.iter().copied().filter(|&l| l >= 0.0).collect();
        let negative: Vec<f64> = lons.iter().copied().filter(|&l| l < 0.0).collect();
        west = fold(&positive).0;
        east = fold(&negative).1;
    }
    Some((west, east, north, south))
}

/// Number of bins [`lon_edges`] produces. Kept in floating point so that
/// absurd widths can be rejected before anything is allocated.
pub fn lon_bin_count(west: f64, east: f64, width: f64) -> f64 {
    let west = (west / width).floor() * width;
    let east = (east / width).ceil() * width;
    let extent = (east - west).rem_euclid(360.0);
    (extent / width).round().max(1.0)
}

/// Unwrapped longitude edges snapped to multiples of `width`.
pub fn lon_edges(west: f64, east: f64, width: f64) -> Vec<f64> {
    let start = (west / width).floor() * width;
    let n = lon_bin_count(west, east, width) as usize;
    (0..=n).map(|i| start + i as f64 * width).collect()
}

/// Number of bins [`lat_edges`] produces.
pub fn lat_bin_count(south: f64, north: f64, width: f64) -> f64 {
    ((north / width).ceil() - (south / width).floor()).max(1.0)
}

/// Latitude edges snapped to multiples of `width`.
pub fn lat_edges(south: f64, north: f64, width: f64) -> Vec<f64> {
    let k0 = (south / width).floor() as i64;
    let n = lat_bin_count(south, north, width) as i64;
    (k0..=k0 + n).map(|k| k as f64 * width).collect()
}
