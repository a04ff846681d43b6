use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Address the HTTP server binds to.
    #[serde(default = "Config::default_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "Config::default_database_url")]
    pub database_url: String,
    /// Allowed CORS origins. Required unless cors_permissive is true.
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Explicitly allow all origins (development only). Defaults to false.
    #[serde(default)]
    pub cors_permissive: bool,
    /// Optional YAML fixture file, loaded only into an empty database.
    #[serde(default)]
    pub seed_file: Option<String>,
    /// Real-time tracking thresholds and sweep intervals.
    #[serde(default)]
    pub tracking: TrackingConfig,
}

impl Config {
    fn default_bind_addr() -> String {
        "0.0.0.0:3000".to_string()
    }

    fn default_database_url() -> String {
        "sqlite:database/shuttle.db?mode=rwc".to_string()
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::ReadError(e.to_string()))?;

        serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

/// Thresholds for the detection engine, lifecycle geofences and the
/// maintenance sweeps. All tunable; the defaults mirror field-tested values.
#[derive(Debug, Clone, Deserialize)]
pub struct TrackingConfig {
    /// Passenger-to-bus distance under which a boarding candidate counts (meters)
    #[serde(default = "TrackingConfig::default_boarding_radius_m")]
    pub boarding_radius_m: f64,
    /// Passenger-to-bus distance over which an alighting sample counts (meters)
    #[serde(default = "TrackingConfig::default_alighting_radius_m")]
    pub alighting_radius_m: f64,
    /// Consecutive confirming samples required before a board/alight commits
    #[serde(default = "TrackingConfig::default_consecutive_samples")]
    pub consecutive_samples: u32,
    /// Distance from the route origin within which a drive may start (meters)
    #[serde(default = "TrackingConfig::default_arrival_radius_m")]
    pub arrival_radius_m: f64,
    /// Radius used to snap a driver sample to the nearest route station (meters)
    #[serde(default = "TrackingConfig::default_station_radius_m")]
    pub station_radius_m: f64,
    /// How early a drive may start before its scheduled time (minutes)
    #[serde(default = "TrackingConfig::default_early_start_allowance_minutes")]
    pub early_start_allowance_minutes: i64,
    /// Location cache entries older than this are swept (seconds)
    #[serde(default = "TrackingConfig::default_location_ttl_secs")]
    pub location_ttl_secs: u64,
    /// Passenger detection states idle longer than this are swept (seconds)
    #[serde(default = "TrackingConfig::default_passenger_idle_ttl_secs")]
    pub passenger_idle_ttl_secs: u64,
    /// Operations past their scheduled end with no update for this long are
    /// force-closed (hours)
    #[serde(default = "TrackingConfig::default_abandoned_after_hours")]
    pub abandoned_after_hours: i64,
    #[serde(default = "TrackingConfig::default_cache_sweep_interval_secs")]
    pub cache_sweep_interval_secs: u64,
    #[serde(default = "TrackingConfig::default_autoclose_sweep_interval_secs")]
    pub autoclose_sweep_interval_secs: u64,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            boarding_radius_m: Self::default_boarding_radius_m(),
            alighting_radius_m: Self::default_alighting_radius_m(),
            consecutive_samples: Self::default_consecutive_samples(),
            arrival_radius_m: Self::default_arrival_radius_m(),
            station_radius_m: Self::default_station_radius_m(),
            early_start_allowance_minutes: Self::default_early_start_allowance_minutes(),
            location_ttl_secs: Self::default_location_ttl_secs(),
            passenger_idle_ttl_secs: Self::default_passenger_idle_ttl_secs(),
            abandoned_after_hours: Self::default_abandoned_after_hours(),
            cache_sweep_interval_secs: Self::default_cache_sweep_interval_secs(),
            autoclose_sweep_interval_secs: Self::default_autoclose_sweep_interval_secs(),
        }
    }
}

impl TrackingConfig {
    fn default_boarding_radius_m() -> f64 {
        25.0
    }
    fn default_alighting_radius_m() -> f64 {
        50.0
    }
    fn default_consecutive_samples() -> u32 {
        3
    }
    fn default_arrival_radius_m() -> f64 {
        50.0
    }
    fn default_station_radius_m() -> f64 {
        100.0
    }
    fn default_early_start_allowance_minutes() -> i64 {
        10
    }
    fn default_location_ttl_secs() -> u64 {
        600
    }
    fn default_passenger_idle_ttl_secs() -> u64 {
        600
    }
    fn default_abandoned_after_hours() -> i64 {
        2
    }
    fn default_cache_sweep_interval_secs() -> u64 {
        600
    }
    fn default_autoclose_sweep_interval_secs() -> u64 {
        3600
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),
    #[error("Failed to parse config: {0}")]
    ParseError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_gets_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:3000");
        assert!(!config.cors_permissive);
        assert_eq!(config.tracking.boarding_radius_m, 25.0);
        assert_eq!(config.tracking.alighting_radius_m, 50.0);
        assert_eq!(config.tracking.consecutive_samples, 3);
        assert_eq!(config.tracking.early_start_allowance_minutes, 10);
    }

    #[test]
    fn partial_tracking_overrides() {
        let yaml = r#"
bind_addr: "127.0.0.1:8080"
tracking:
  boarding_radius_m: 30.0
  consecutive_samples: 5
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.tracking.boarding_radius_m, 30.0);
        assert_eq!(config.tracking.consecutive_samples, 5);
        // untouched fields keep defaults
        assert_eq!(config.tracking.alighting_radius_m, 50.0);
    }
}
