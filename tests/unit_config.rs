//! Configuration unit tests for `mtlsgate`
//!
//! Verifies TOML parsing, defaults, and validation outcomes against the
//! public configuration API.

use mtlsgate::config::ProxyConfig;

#[test]
fn test_minimal_config_is_valid() {
    let config_content = r#"
[[upstreams]]
address = "127.0.0.1:9001"
"#;

    let config: ProxyConfig = toml::from_str(config_content).expect("Failed to parse config");

    assert_eq!(config.server.bind_address, "0.0.0.0");
    assert_eq!(config.server.port, 8443);
    assert!(config.validate().is_ok());
}

#[test]
fn test_full_config_round_trip() {
    let config_content = r#"
[server]
bind_address = "127.0.0.1"
port = 9443

[tls]
cert_path = "/tmp/test.crt"
key_path = "/tmp/test.key"
ca_cert_path = "/tmp/ca.crt"

[forwarder]
quarantine_secs = 15
dial_timeout_ms = 1500

[rate_limiting]
burst = 10
rate_per_sec = 4.0

[logging]
level = "debug"
json = true
access_log = "/tmp/access.log"

[[upstreams]]
address = "10.0.0.1:6000"

[[upstreams]]
address = "10.0.0.2:6000"

[clients]
"svc-a" = ["10.0.0.1:6000"]
"svc-b" = ["10.0.0.1:6000", "10.0.0.2:6000"]
"#;

    let config: ProxyConfig = toml::from_str(config_content).expect("Failed to parse config");

    assert_eq!(config.server.port, 9443);
    assert_eq!(config.upstreams.len(), 2);
    assert_eq!(config.forwarder.quarantine().as_secs(), 15);
    assert_eq!(config.forwarder.dial_timeout().as_millis(), 1500);
    assert_eq!(config.rate_limiting.burst, 10);
    assert_eq!(config.logging.level, "debug");
    assert!(config.logging.json);
    assert_eq!(config.clients.len(), 2);
    assert!(config.validate().is_ok());
}

#[test]
fn test_config_without_upstreams_fails_validation() {
    let config: ProxyConfig = toml::from_str("").expect("Failed to parse config");
    assert!(config.validate().is_err());
}

#[test]
fn test_config_with_hostname_upstream_fails_validation() {
    // Upstream addresses must be concrete "ip:port" socket addresses.
    let config_content = r#"
[[upstreams]]
address = "backend.internal:9001"
"#;

    let config: ProxyConfig = toml::from_str(config_content).expect("Failed to parse config");
    assert!(config.validate().is_err());
}

#[test]
fn test_unknown_config_keys_are_rejected_by_struct_shape() {
    // A client list entry must be an array of upstream addresses.
    let config_content = r#"
[[upstreams]]
address = "127.0.0.1:9001"

[clients]
"svc-a" = "127.0.0.1:9001"
"#;

    let parsed: Result<ProxyConfig, _> = toml::from_str(config_content);
    assert!(parsed.is_err());
}
