use std::env;
use std::str::FromStr;
use std::time::Duration;
use url::Url;

use crate::error::ConfigError;

const DEFAULT_BAUD: u32 = 115_200;
const DEFAULT_BATCH_SIZE: usize = 5000;
const DEFAULT_TICK_SECONDS: f64 = 90.0;
const DEFAULT_CONNECT_TIMEOUT_S: u64 = 5;
const DEFAULT_RELAY_PASSWORD: u16 = 0x04D2; // 1234
const DEFAULT_RELAY_NAME: &str = "DSD TECH";
const DEFAULT_RELAY_CHANNEL: u8 = 0x01;
const MIN_PHASE_SECS: f64 = 0.1;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub serial_port: Option<String>,
    pub baud: u32,
    pub default_latitude: Option<f64>,
    pub default_longitude: Option<f64>,
    pub batch_size: usize,
    pub tick_interval: Duration,
    pub connect_timeout: Duration,
    pub relay: RelayConfig,
}

/// Raw relay settings as configured; see [`AppConfig::duty_cycle`].
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub uptime_mins: f64,
    pub downtime_mins: f64,
    pub device_address: Option<String>,
    pub device_name: String,
    pub password: u16,
    pub channel: u8,
}

/// Validated duty-cycle settings, immutable for the controller's lifetime.
#[derive(Debug, Clone, PartialEq)]
pub struct DutyCycleConfig {
    pub on_duration: Duration,
    pub off_duration: Duration,
    pub device_address: String,
    pub device_name: String,
    pub password: u16,
    pub channel: u8,
}

impl DutyCycleConfig {
    /// Build from minute values. Returns None when either phase is not a
    /// positive, representable duration or no address is configured, which
    /// disables the relay.
    pub fn from_minutes(
        on_mins: f64,
        off_mins: f64,
        device_address: Option<&str>,
        device_name: &str,
        password: u16,
        channel: u8,
    ) -> Option<Self> {
        let device_address = device_address.map(str::trim).filter(|a| !a.is_empty())?;

        Some(DutyCycleConfig {
            on_duration: phase_duration(on_mins)?,
            off_duration: phase_duration(off_mins)?,
            device_address: device_address.to_string(),
            device_name: device_name.to_string(),
            password,
            channel,
        })
    }

}

fn phase_duration(minutes: f64) -> Option<Duration> {
    if !minutes.is_finite() || minutes <= 0.0 {
        return None;
    }
    Duration::try_from_secs_f64((minutes * 60.0).max(MIN_PHASE_SECS)).ok()
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load environment variables
        dotenv::dotenv().ok();

        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let database_url = get("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;
        // Report the parse error only; the URL may carry credentials
        if let Err(e) = Url::parse(&database_url) {
            return Err(ConfigError::Invalid {
                name: "DATABASE_URL",
                value: e.to_string(),
            });
        }

        let tick_seconds: f64 = parse_or(&get, "TICK_SECONDS", DEFAULT_TICK_SECONDS)?;
        let tick_interval = Some(tick_seconds)
            .filter(|s| *s > 0.0)
            .and_then(|s| Duration::try_from_secs_f64(s).ok())
            .filter(|d| !d.is_zero())
            .ok_or_else(|| ConfigError::Invalid {
                name: "TICK_SECONDS",
                value: tick_seconds.to_string(),
            })?;

        let batch_size: usize = parse_or(&get, "BATCH_SIZE", DEFAULT_BATCH_SIZE)?;
        if batch_size == 0 {
            return Err(ConfigError::Invalid {
                name: "BATCH_SIZE",
                value: "0".into(),
            });
        }

        let relay = RelayConfig {
            uptime_mins: parse_or(&get, "STARLINK_UPTIME_MINS", 0.0)?,
            downtime_mins: parse_or(&get, "STARLINK_DOWNTIME_MINS", 0.0)?,
            device_address: get("DSD_DEVICE_MAC").map(|v| v.trim().to_string()),
            device_name: get("DSD_DEVICE_NAME").unwrap_or_else(|| DEFAULT_RELAY_NAME.to_string()),
            password: parse_password(get("DSD_PASSWORD").as_deref()),
            channel: parse_or(&get, "DSD_CHANNEL", DEFAULT_RELAY_CHANNEL)?,
        };

        Ok(AppConfig {
            database_url,
            serial_port: get("SERIAL_PORT"),
            baud: parse_or(&get, "SERIAL_BAUD", DEFAULT_BAUD)?,
            default_latitude: parse_opt(&get, "DEFAULT_LAT")?,
            default_longitude: parse_opt(&get, "DEFAULT_LON")?,
            batch_size,
            tick_interval,
            connect_timeout: Duration::from_secs(parse_or(
                &get,
                "CONNECT_TIMEOUT_S",
                DEFAULT_CONNECT_TIMEOUT_S,
            )?),
            relay,
        })
    }

    pub fn duty_cycle(&self) -> Option<DutyCycleConfig> {
        DutyCycleConfig::from_minutes(
            self.relay.uptime_mins,
            self.relay.downtime_mins,
            self.relay.device_address.as_deref(),
            &self.relay.device_name,
            self.relay.password,
            self.relay.channel,
        )
    }
}

/// Parse the relay password as decimal or `0x` hex, masked to 16 bits.
/// Anything unparsable falls back to the factory default.
pub fn parse_password(value: Option<&str>) -> u16 {
    let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) else {
        return DEFAULT_RELAY_PASSWORD;
    };

    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse::<u64>(),
    };

    parsed
        .map(|v| (v & 0xFFFF) as u16)
        .unwrap_or(DEFAULT_RELAY_PASSWORD)
}

fn parse_or<G, T>(get: &G, name: &'static str, default: T) -> Result<T, ConfigError>
where
    G: Fn(&str) -> Option<String>,
    T: FromStr,
{
    Ok(parse_opt(get, name)?.unwrap_or(default))
}

fn parse_opt<G, T>(get: &G, name: &'static str) -> Result<Option<T>, ConfigError>
where
    G: Fn(&str) -> Option<String>,
    T: FromStr,
{
    match get(name) {
        Some(value) => value
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { name, value }),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_only_database_url_is_set() {
        let config = load(&[("DATABASE_URL", "postgres://u:p@db/farm")]).unwrap();
        assert_eq!(config.baud, 115_200);
        assert_eq!(config.batch_size, 5000);
        assert_eq!(config.tick_interval, Duration::from_secs(90));
        assert_eq!(config.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.default_latitude, None);
        assert_eq!(config.relay.password, 1234);
        assert_eq!(config.relay.device_name, "DSD TECH");
        assert!(config.duty_cycle().is_none());
    }

    #[test]
    fn missing_database_url_is_an_error() {
        let err = load(&[("SERIAL_BAUD", "9600")]).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("DATABASE_URL")));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn unparsable_numbers_are_rejected() {
        let err = load(&[("DATABASE_URL", "postgres://db"), ("SERIAL_BAUD", "fast")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "SERIAL_BAUD", .. }));
    }

    #[test]
    fn relay_enabled_with_fractional_minutes() {
        let config = load(&[
            ("DATABASE_URL", "postgres://db"),
            ("STARLINK_UPTIME_MINS", "5"),
            ("STARLINK_DOWNTIME_MINS", "0.5"),
            ("DSD_DEVICE_MAC", "AA:BB:CC:DD:EE:FF"),
            ("DSD_PASSWORD", "0x1A2B"),
        ])
        .unwrap();
        let duty = config.duty_cycle().unwrap();
        assert_eq!(duty.on_duration, Duration::from_secs(300));
        assert_eq!(duty.off_duration, Duration::from_secs(30));
        assert_eq!(duty.device_address, "AA:BB:CC:DD:EE:FF");
        assert_eq!(duty.password, 0x1A2B);
        assert_eq!(duty.channel, 1);
    }

    #[test]
    fn degenerate_duty_cycle_is_disabled() {
        assert!(DutyCycleConfig::from_minutes(0.0, 55.0, Some("AA"), "x", 1, 1).is_none());
        assert!(DutyCycleConfig::from_minutes(5.0, -1.0, Some("AA"), "x", 1, 1).is_none());
        assert!(DutyCycleConfig::from_minutes(5.0, 55.0, None, "x", 1, 1).is_none());
        assert!(DutyCycleConfig::from_minutes(5.0, 55.0, Some("  "), "x", 1, 1).is_none());
    }

    #[test]
    fn unrepresentable_phases_disable_the_relay() {
        assert!(DutyCycleConfig::from_minutes(f64::INFINITY, 55.0, Some("AA"), "x", 1, 1).is_none());
        assert!(DutyCycleConfig::from_minutes(5.0, f64::NAN, Some("AA"), "x", 1, 1).is_none());
        assert!(DutyCycleConfig::from_minutes(1e300, 55.0, Some("AA"), "x", 1, 1).is_none());

        let config = load(&[
            ("DATABASE_URL", "postgres://db"),
            ("STARLINK_UPTIME_MINS", "inf"),
            ("STARLINK_DOWNTIME_MINS", "55"),
            ("DSD_DEVICE_MAC", "AA:BB:CC:DD:EE:FF"),
        ])
        .unwrap();
        assert!(config.duty_cycle().is_none());
    }

    #[test]
    fn tiny_phases_are_clamped() {
        let duty = DutyCycleConfig::from_minutes(0.0001, 1.0, Some("AA"), "x", 1, 1).unwrap();
        assert_eq!(duty.on_duration, Duration::from_millis(100));
        assert_eq!(duty.off_duration, Duration::from_secs(60));
    }

    #[test]
    fn out_of_range_tick_is_a_config_error() {
        for value in ["1e20", "inf", "0", "-5", "NaN"] {
            let err = load(&[("DATABASE_URL", "postgres://db"), ("TICK_SECONDS", value)]).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid { name: "TICK_SECONDS", .. }), "{value}");
            assert_eq!(err.exit_code(), 2);
        }
    }

    #[test]
    fn unparsable_database_url_is_a_config_error() {
        let err = load(&[("DATABASE_URL", "not a url")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "DATABASE_URL", .. }));
        assert_eq!(err.exit_code(), 2);
    }

    #[test]
    fn password_parsing() {
        assert_eq!(parse_password(None), 1234);
        assert_eq!(parse_password(Some("4321")), 4321);
        assert_eq!(parse_password(Some("0x04D2")), 0x04D2);
        assert_eq!(parse_password(Some("0x1FFFF")), 0xFFFF);
        assert_eq!(parse_password(Some("garbage")), 1234);
    }
}
