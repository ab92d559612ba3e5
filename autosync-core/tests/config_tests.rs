//! Configuration file error-message, document-shape and atomic-write tests.

use std::fs;
use std::time::Duration;

use assert_fs::prelude::*;
use autosync_core::{
    config, ConfigError, ControllerConfiguration, ProfileRole, RunMode, ServiceConfig,
    TriggerConfig,
};
use predicates::prelude::predicate;

const FULL_DOCUMENT: &str = r#"
settings:
  retry_count: 2
  retry_codes: [stopped-server-down]
  execution_stagger_interval_ms: 250
  run_mode: unsupported
  mail:
    enabled: true
    ignore_return_codes: [success, completed-no-objects]
agents:
  - agent_name: AD
    version: 4
    lock_agents: [HR]
    partitions:
      - id: 6f1c1c3a-1f7e-4a51-9b7c-1d1c0c3b2a10
        name: DC=corp,DC=example
        auto_import_enabled: true
        auto_import_interval_minutes: 15
        scheduled_import_run_profile_name: DI
        export_run_profile_name: EX
        confirming_import_run_profile_name: DI
        delta_sync_run_profile_name: DS
    triggers:
      - type: interval
        run_profile_name: FI
        interval_secs: 86400
      - type: file_watch
        path: /var/drop/hr
        run_profile_name: DI
  - agent_name: HR
    disabled: true
"#;

// ---------------------------------------------------------------------------
// 1. Load error messages
// ---------------------------------------------------------------------------

#[test]
fn load_corrupt_yaml_returns_parse_error_with_path() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let dir = home.child(".autosync");
    dir.create_dir_all().expect("mkdir");
    dir.child("config.yaml")
        .write_str(": : corrupt : yaml : !!!\n  - broken: [unclosed")
        .expect("write");

    let err = config::load_at(home.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }), "got: {err}");
    assert!(err.to_string().contains("config.yaml"), "must contain file path");
}

#[test]
fn load_wrong_type_yaml_returns_parse_error() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    home.child(".autosync/config.yaml")
        .write_str("- this is a list, not a mapping\n")
        .expect("write");

    let err = config::load_at(home.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }), "got: {err}");
}

#[test]
fn load_missing_config_names_expected_path() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let err = config::load_at(home.path()).unwrap_err();
    assert!(err.to_string().contains("configuration not found"));
    assert!(err.to_string().contains(".autosync"));
}

// ---------------------------------------------------------------------------
// 2. Document shape
// ---------------------------------------------------------------------------

#[test]
fn full_document_parses_agents_partitions_and_triggers() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    home.child(".autosync/config.yaml")
        .write_str(FULL_DOCUMENT)
        .expect("write");

    let cfg = config::load_at(home.path()).expect("load");
    assert_eq!(cfg.settings.retry_count, 2);
    assert_eq!(cfg.settings.run_mode, RunMode::Unsupported);
    assert_eq!(
        cfg.settings.execution_stagger_interval(),
        Duration::from_millis(250)
    );
    assert!(cfg.settings.mail.ignores("completed-no-objects"));

    let ad = cfg.agent("ad").expect("AD configured");
    assert_eq!(ad.version, 4);
    assert_eq!(ad.lock_agents, vec!["HR".to_string()]);
    let partition = ad.active_partition_named("dc=corp,dc=example").expect("partition");
    assert_eq!(partition.run_profile_for(ProfileRole::DeltaSync), Some("DS"));
    assert_eq!(partition.auto_import_interval(), Duration::from_secs(15 * 60));
    assert_eq!(ad.triggers.len(), 2);
    assert!(matches!(
        &ad.triggers[1],
        TriggerConfig::FileWatch { debounce_ms: 500, .. }
    ));

    let hr = cfg.agent("HR").expect("HR configured");
    assert!(!hr.is_runnable());
}

// ---------------------------------------------------------------------------
// 3. Atomic write safety
// ---------------------------------------------------------------------------

#[test]
fn save_cleans_up_tmp_file() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let cfg = ServiceConfig {
        agents: vec![ControllerConfiguration::new("AD")],
        ..ServiceConfig::default()
    };
    config::save_at(home.path(), &cfg).expect("save");

    home.child(".autosync/config.yaml")
        .assert(predicate::path::exists());
    home.child(".autosync/config.yaml.tmp")
        .assert(predicate::path::missing());
}

#[test]
fn save_refuses_invalid_document_and_writes_nothing() {
    let home = assert_fs::TempDir::new().expect("tempdir");
    let cfg = ServiceConfig {
        agents: vec![
            ControllerConfiguration::new("AD"),
            ControllerConfiguration::new("Ad"),
        ],
        ..ServiceConfig::default()
    };
    let err = config::save_at(home.path(), &cfg).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(_)));
    assert!(!config::config_path_at(home.path()).exists());
}

#[cfg(unix)]
#[test]
fn saved_file_is_owner_only() {
    use std::os::unix::fs::PermissionsExt;

    let home = assert_fs::TempDir::new().expect("tempdir");
    config::save_at(home.path(), &ServiceConfig::default()).expect("save");
    let mode = fs::metadata(config::config_path_at(home.path()))
        .expect("metadata")
        .permissions()
        .mode()
        & 0o777;
    assert_eq!(mode, 0o600);
}
