//! Configuration validation and TOML loading.

use vigil::config::{Config, ConfigError, GuardDef};
use vigil::core::types::{Priority, ProbeKind, ProbeParams};

use crate::common::{registry_with, test_channel, test_config, ScriptedProbe};

fn registry() -> vigil::core::dispatcher::ProbeRegistry {
    registry_with(ScriptedProbe::always_ok())
}

#[test]
fn valid_configuration_passes() {
    let config = test_config(vec![test_channel("api", 60, 3)]);
    assert!(config.validate(&registry()).is_ok());
}

#[test]
fn duplicate_channel_ids_are_rejected() {
    let config = test_config(vec![
        test_channel("api", 60, 3),
        test_channel("api", 120, 3),
    ]);
    assert_eq!(
        config.validate(&registry()),
        Err(ConfigError::DuplicateChannelId("api".into()))
    );
}

#[test]
fn zero_threshold_is_rejected() {
    let config = test_config(vec![test_channel("api", 60, 0)]);
    assert_eq!(
        config.validate(&registry()),
        Err(ConfigError::ZeroThreshold("api".into()))
    );
}

#[test]
fn path_unsafe_channel_id_is_rejected() {
    let config = test_config(vec![test_channel("../escape", 60, 3)]);
    assert!(matches!(
        config.validate(&registry()),
        Err(ConfigError::InvalidChannelId(_))
    ));
}

#[test]
fn interval_outside_bounds_is_rejected() {
    let config = test_config(vec![test_channel("api", 5, 3)]);
    assert!(matches!(
        config.validate(&registry()),
        Err(ConfigError::IntervalOutOfRange { .. })
    ));

    let config = test_config(vec![test_channel("api", 4000, 3)]);
    assert!(matches!(
        config.validate(&registry()),
        Err(ConfigError::IntervalOutOfRange { .. })
    ));
}

#[test]
fn unregistered_probe_kind_is_rejected() {
    let mut channel = test_channel("deploy", 60, 3);
    channel.probe = ProbeParams::Task {
        label: "smoke".into(),
    };
    let config = test_config(vec![channel]);
    // The test registry only registers the http kind.
    assert_eq!(
        config.validate(&registry()),
        Err(ConfigError::UnsupportedKind {
            id: "deploy".into(),
            kind: "task".into()
        })
    );
}

#[test]
fn malformed_url_is_rejected() {
    let mut channel = test_channel("api", 60, 3);
    channel.probe = ProbeParams::Http {
        url: "not a url".into(),
        expect_status: None,
    };
    let config = test_config(vec![channel]);
    assert!(matches!(
        config.validate(&registry()),
        Err(ConfigError::InvalidUrl { .. })
    ));
}

#[test]
fn unknown_guard_reference_is_rejected() {
    let mut channel = test_channel("api", 60, 3);
    channel.guards = vec!["corp-dns".into()];
    let config = test_config(vec![channel]);
    assert_eq!(
        config.validate(&registry()),
        Err(ConfigError::UnknownGuard {
            id: "api".into(),
            guard: "corp-dns".into()
        })
    );
}

#[test]
fn guard_reference_resolves_against_definitions() {
    let mut channel = test_channel("api", 60, 3);
    channel.guards = vec!["corp-dns".into()];
    let mut config = test_config(vec![channel]);
    config.guards.insert(
        "corp-dns".into(),
        GuardDef::Dns {
            hostname: "internal.example.com".into(),
        },
    );
    assert!(config.validate(&registry()).is_ok());
}

#[test]
fn channel_fields_fall_back_to_defaults() {
    let config: Config = Default::default();
    assert_eq!(config.defaults.interval_sec, 60);
    assert_eq!(config.defaults.timeout_ms, 3000);
    assert_eq!(config.defaults.threshold, 3);
    assert_eq!(config.defaults.jitter_pct, 10);

    let mut channel = test_channel("api", 60, 3);
    channel.interval_sec = None;
    channel.timeout_ms = None;
    channel.threshold = None;
    channel.jitter_pct = None;
    assert_eq!(channel.baseline_sec(&config.defaults), 60);
    assert_eq!(channel.timeout(&config.defaults).as_millis(), 3000);
    assert_eq!(channel.threshold(&config.defaults), 3);
    assert_eq!(channel.jitter_pct(&config.defaults), 10);
}

#[cfg(feature = "cli")]
#[test]
fn toml_configuration_loads() {
    use std::io::Write;

    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
[defaults]
interval_sec = 120
threshold = 2

[guards.corp-dns]
kind = "dns"
hostname = "internal.example.com"

[[channels]]
id = "api"
kind = "http"
url = "https://api.example.com/health"
priority = "high"
guards = ["corp-dns"]

[[channels]]
id = "db"
kind = "tcp"
host = "db.example.com"
port = 5432
interval_sec = 30
"#
    )
    .unwrap();

    let config = vigil::config::file::load(file.path()).unwrap();
    assert_eq!(config.defaults.interval_sec, 120);
    assert_eq!(config.defaults.threshold, 2);
    assert_eq!(config.channels.len(), 2);

    let api = &config.channels[0];
    assert_eq!(api.kind(), ProbeKind::Http);
    assert_eq!(api.priority, Priority::High);
    assert!(api.enabled);

    let db = &config.channels[1];
    assert_eq!(db.kind(), ProbeKind::Tcp);
    assert_eq!(db.interval_sec, Some(30));
    assert!(matches!(
        &db.probe,
        ProbeParams::Tcp { host, port: 5432 } if host == "db.example.com"
    ));
}
