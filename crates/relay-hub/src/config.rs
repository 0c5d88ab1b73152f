use clap::Parser;
use relay_core::wire::DEFAULT_MAX_FRAME_BYTES;
use std::time::Duration;

use crate::ws::SessionSettings;

const DEFAULT_PORT: u16 = 10000;

#[derive(Clone, Debug)]
pub struct Config {
    pub addr: String,
    pub debug: bool,
    pub sweep_interval: Duration,
    pub request_timeout: Duration,
    pub write_timeout: Duration,
    pub queue_capacity: usize,
    pub max_frame_bytes: usize,
    pub log_dir: String,
}

impl Config {
    pub fn session(&self) -> SessionSettings {
        SessionSettings {
            queue_capacity: self.queue_capacity,
            write_timeout: self.write_timeout,
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "relay-hub", about = "WebSocket relay between field agents and dashboards")]
pub struct Args {
    /// Listen address; falls back to RELAY_HUB_ADDR, then 0.0.0.0:$PORT.
    #[arg(long, default_value = "")]
    pub addr: String,
    #[arg(long, default_value_t = false)]
    pub debug: bool,
    /// Seconds between liveness sweeps; 0 disables them.
    #[arg(long, default_value_t = 30)]
    pub sweep_interval: u64,
    /// Default wait for correlated replies, seconds.
    #[arg(long, default_value_t = 15)]
    pub request_timeout: u64,
    #[arg(long, default_value_t = 5)]
    pub write_timeout: u64,
    #[arg(long, default_value_t = 256)]
    pub queue_capacity: usize,
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_BYTES)]
    pub max_frame_bytes: usize,
    #[arg(long, default_value = "")]
    pub log_dir: String,
}

pub fn load_config() -> Config {
    from_args(Args::parse())
}

pub fn from_args(args: Args) -> Config {
    let addr = resolve_addr_from(
        &args.addr,
        std::env::var("RELAY_HUB_ADDR").ok().as_deref(),
        std::env::var("PORT").ok().as_deref(),
    );
    let debug = args.debug || env_true("RELAY_HUB_DEBUG");
    let log_dir = resolve_log_dir_from(
        &args.log_dir,
        std::env::var("RELAY_LOG_DIR").ok().as_deref(),
    );
    Config {
        addr,
        debug,
        sweep_interval: Duration::from_secs(args.sweep_interval),
        request_timeout: Duration::from_secs(args.request_timeout),
        write_timeout: Duration::from_secs(args.write_timeout),
        queue_capacity: args.queue_capacity.max(1),
        max_frame_bytes: args.max_frame_bytes,
        log_dir,
    }
}

pub fn resolve_addr_from(addr_flag: &str, hub_addr: Option<&str>, port: Option<&str>) -> String {
    if !addr_flag.trim().is_empty() {
        return addr_flag.trim().to_string();
    }
    if let Some(value) = hub_addr.map(str::trim).filter(|value| !value.is_empty()) {
        return value.to_string();
    }
    let port = port
        .and_then(|value| value.trim().parse::<u16>().ok())
        .unwrap_or(DEFAULT_PORT);
    format!("0.0.0.0:{port}")
}

fn resolve_log_dir_from(log_dir_flag: &str, env_dir: Option<&str>) -> String {
    if !log_dir_flag.trim().is_empty() {
        return log_dir_flag.to_string();
    }
    env_dir
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_default()
}

pub fn env_true(key: &str) -> bool {
    std::env::var(key).map(|value| is_truthy(&value)).unwrap_or(false)
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addr_flag_wins_over_environment() {
        assert_eq!(
            resolve_addr_from("127.0.0.1:9000", Some("0.0.0.0:1"), Some("2")),
            "127.0.0.1:9000"
        );
        assert_eq!(
            resolve_addr_from("", Some(" 10.0.0.1:8080 "), Some("2")),
            "10.0.0.1:8080"
        );
    }

    #[test]
    fn port_env_and_default_fallback() {
        assert_eq!(resolve_addr_from("", None, Some("8443")), "0.0.0.0:8443");
        assert_eq!(resolve_addr_from(" ", Some(""), Some("nope")), "0.0.0.0:10000");
        assert_eq!(resolve_addr_from("", None, None), "0.0.0.0:10000");
    }

    #[test]
    fn log_dir_falls_back_to_env_then_stdout_only() {
        assert_eq!(resolve_log_dir_from("/var/log/relay", Some("/tmp")), "/var/log/relay");
        assert_eq!(resolve_log_dir_from("", Some("/tmp/relay")), "/tmp/relay");
        assert_eq!(resolve_log_dir_from("", None), "");
    }

    #[test]
    fn truthy_values() {
        for value in ["1", "true", " YES ", "on"] {
            assert!(is_truthy(value), "{value}");
        }
        for value in ["", "0", "off", "nah"] {
            assert!(!is_truthy(value), "{value}");
        }
    }

    #[test]
    fn flags_parse_into_durations() {
        let args = Args::parse_from([
            "relay-hub",
            "--addr",
            "127.0.0.1:7000",
            "--sweep-interval",
            "0",
            "--request-timeout",
            "3",
            "--queue-capacity",
            "0",
        ]);
        let config = from_args(args);
        assert_eq!(config.addr, "127.0.0.1:7000");
        assert!(config.sweep_interval.is_zero());
        assert_eq!(config.request_timeout, Duration::from_secs(3));
        assert_eq!(config.write_timeout, Duration::from_secs(5));
        assert_eq!(config.queue_capacity, 1);
        assert_eq!(config.max_frame_bytes, DEFAULT_MAX_FRAME_BYTES);
    }
}
