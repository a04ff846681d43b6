/// Mean Earth radius in meters.
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Great-circle distance in meters between two WGS84 coordinates (haversine).
pub fn distance_meters(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    if lat1 == lat2 && lon1 == lon2 {
        return 0.0;
    }

    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();

    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_points_are_zero() {
        assert_eq!(distance_meters(48.3705, 10.8978, 48.3705, 10.8978), 0.0);
    }

    #[test]
    fn one_degree_of_latitude() {
        // One degree of latitude is ~111.2 km everywhere.
        let d = distance_meters(48.0, 10.0, 49.0, 10.0);
        assert!((d - 111_195.0).abs() < 100.0, "got {d}");
    }

    #[test]
    fn short_distance_is_plausible() {
        // Two points ~25m apart (0.000225 deg latitude).
        let d = distance_meters(37.5665, 126.9780, 37.566725, 126.9780);
        assert!(d > 20.0 && d < 30.0, "got {d}");
    }

    #[test]
    fn distance_is_symmetric() {
        let a = distance_meters(48.37, 10.89, 48.38, 10.91);
        let b = distance_meters(48.38, 10.91, 48.37, 10.89);
        assert!((a - b).abs() < 1e-9);
    }
}
