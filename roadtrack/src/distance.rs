use crate::{TrackPoint, EARTH_RADIUS_KM};

/// Great-circle distance in kilometres between two points given in decimal degrees.
pub fn haversine_km(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    haversine_km_with_radius(EARTH_RADIUS_KM, lat1, lng1, lat2, lng2)
}

pub fn haversine_km_with_radius(radius_km: f64, lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    let to_rad = |deg: f64| deg.to_radians();
    let dlat = to_rad(lat2 - lat1);
    let dlng = to_rad(lng2 - lng1);
    let a = (dlat / 2.0).sin().powi(2)
        + to_rad(lat1).cos() * to_rad(lat2).cos() * (dlng / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    radius_km * c
}

pub(crate) fn segment_km(radius_km: f64, from: &TrackPoint, to: &TrackPoint) -> f64 {
    haversine_km_with_radius(
        radius_km,
        from.latitude,
        from.longitude,
        to.latitude,
        to.longitude,
    )
}

/// Sum of consecutive segment lengths; zero for fewer than two points.
pub fn track_length(points: &[TrackPoint], radius_km: f64) -> f64 {
    points
        .windows(2)
        .map(|pair| segment_km(radius_km, &pair[0], &pair[1]))
        .sum()
}
