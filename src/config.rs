use crate::estimator::EstimatorParams;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server_port: u16,
    pub data_dir: PathBuf,
    pub log_level: String,
    pub sample_interval_ms: u64,
    pub idle_grace_ms: u64,
    pub rotation_period_hours: u64,
    pub history_limit: usize,
    pub moving_average_window: usize,
    pub smoothing_alpha: f64,
    pub kalman_process_noise: f64,
    pub kalman_measurement_noise: f64,
    pub notification_capacity: usize,
    pub command_timeout_ms: u64,
    pub stats_dir: Option<PathBuf>,
    pub stats_upload_url: Option<String>,
    pub browser: String,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let builder = Config::builder()
            // Default settings
            .set_default("server_port", 7878)?
            .set_default("data_dir", "./data")?
            .set_default("log_level", "info")?
            .set_default("sample_interval_ms", 1000)?
            .set_default("idle_grace_ms", 5000)?
            .set_default("rotation_period_hours", 24)?
            .set_default("history_limit", 1000)?
            .set_default("moving_average_window", 5)?
            .set_default("smoothing_alpha", 0.2)?
            .set_default("kalman_process_noise", 0.01)?
            .set_default("kalman_measurement_noise", 0.1)?
            .set_default("notification_capacity", 256)?
            .set_default("command_timeout_ms", 10_000)?
            .set_default("browser", "unknown")?
            // Config file (optional)
            .add_source(File::with_name("config").required(false))
            // Environment variables (e.g. SPEEDWATCH_SERVER_PORT=9000)
            .add_source(Environment::with_prefix("SPEEDWATCH"));

        builder.build()?.try_deserialize()
    }

    pub fn estimator_params(&self) -> EstimatorParams {
        EstimatorParams {
            moving_average_window: self.moving_average_window,
            smoothing_alpha: self.smoothing_alpha,
            kalman_process_noise: self.kalman_process_noise,
            kalman_measurement_noise: self.kalman_measurement_noise,
        }
    }

    pub fn rotation_period(&self) -> Duration {
        Duration::from_secs(self.rotation_period_hours.saturating_mul(3600))
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms.max(1))
    }

    pub fn idle_grace(&self) -> Duration {
        Duration::from_millis(self.idle_grace_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("store.json")
    }
}

#[cfg(test)]
impl Settings {
    pub fn for_tests(data_dir: PathBuf) -> Self {
        Self {
            server_port: 0,
            data_dir,
            log_level: "info".to_string(),
            sample_interval_ms: 1000,
            idle_grace_ms: 5000,
            rotation_period_hours: 24,
            history_limit: 1000,
            moving_average_window: 5,
            smoothing_alpha: 0.2,
            kalman_process_noise: 0.01,
            kalman_measurement_noise: 0.1,
            notification_capacity: 64,
            command_timeout_ms: 2_000,
            stats_dir: None,
            stats_upload_url: None,
            browser: "test".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::new().unwrap();
        assert_eq!(settings.history_limit, 1000);
        assert_eq!(settings.sample_interval(), Duration::from_secs(1));
        assert_eq!(settings.rotation_period(), Duration::from_secs(24 * 3600));
        assert_eq!(settings.estimator_params().moving_average_window, 5);
        assert!(settings.stats_dir.is_none());
        assert_eq!(settings.command_timeout(), Duration::from_secs(10));
    }
}
