use std::fs;
use std::time::Duration;

use serial_test::serial;
use tempfile::TempDir;

use super::settings::Settings;
use super::{TransportKind, load_config_from, millis};

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.server.host, "127.0.0.1");
    assert_eq!(settings.server.port, 8080);
    assert_eq!(settings.server.transport, TransportKind::Tcp);
    assert_eq!(settings.connection.buffer_bytes, 4096);
    assert_eq!(settings.connection.byte_limit(), None);
    assert_eq!(settings.connection.heartbeat_interval(), None);
    assert_eq!(
        settings.connection.write_timeout(),
        Some(Duration::from_millis(5000))
    );
    assert!(settings.accepter.handle_concurrently);
    assert_eq!(settings.admission.rate_limit_capacity, 0);
    assert!(settings.broker.topics.is_empty());
    assert_eq!(settings.logging.level, "info");
}

#[test]
fn test_millis_zero_means_none() {
    assert_eq!(millis(0), None);
    assert_eq!(millis(250), Some(Duration::from_millis(250)));
}

#[test]
#[serial]
fn load_config_from_file_overrides_defaults() {
    let tmp = TempDir::new().expect("create tempdir");
    let path = tmp.path().join("switchyard.toml");
    let toml = r#"
        [server]
        host = "0.0.0.0"
        port = 9000
        transport = "websocket"

        [connection]
        incoming_message_byte_limit = 1024

        [broker]
        topics = ["orders", "prices"]
        sync_timeout_ms = 250

        [admission]
        blacklist = ["10.0.0.1"]

        [resolver.sync_resolutions.prices]
        address = "127.0.0.1:7001"
        domain = "prices.local"
    "#;
    fs::write(&path, toml).expect("write config file");

    let cfg = load_config_from(path.to_str().unwrap()).expect("load_config failed");
    assert_eq!(cfg.server.host, "0.0.0.0");
    assert_eq!(cfg.server.port, 9000);
    assert_eq!(cfg.server.transport, TransportKind::Websocket);
    assert_eq!(cfg.connection.byte_limit(), Some(1024));
    // untouched fields keep their defaults
    assert_eq!(cfg.connection.buffer_bytes, 4096);
    assert_eq!(cfg.broker.topics, vec!["orders", "prices"]);
    assert_eq!(cfg.broker.sync_timeout_ms, 250);
    assert_eq!(cfg.broker.propagate_timeout_ms, 5000);
    assert_eq!(cfg.admission.blacklist, vec!["10.0.0.1"]);

    let prices = cfg.resolver.sync_resolutions.get("prices").unwrap();
    assert_eq!(prices.address, "127.0.0.1:7001");
    assert_eq!(prices.domain.as_deref(), Some("prices.local"));
    assert!(prices.tls_certificate.is_none());
    assert!(cfg.resolver.async_resolutions.is_empty());
}

#[test]
#[serial]
fn load_config_from_env_overrides_defaults() {
    temp_env::with_vars(
        [
            ("SWITCHYARD_SERVER__PORT", Some("9100")),
            ("SWITCHYARD_BROKER__TOPICS", Some("orders,volumes")),
            ("SWITCHYARD_ACCEPTER__HANDLE_CONCURRENTLY", Some("false")),
        ],
        || {
            let cfg = load_config_from("does/not/exist").expect("load_config failed");
            assert_eq!(cfg.server.port, 9100);
            assert_eq!(cfg.server.host, "127.0.0.1");
            assert_eq!(cfg.broker.topics, vec!["orders", "volumes"]);
            assert!(!cfg.accepter.handle_concurrently);
        },
    );
}
