use chainwork::config::Config;
use std::path::PathBuf;
use std::time::Duration;

// Env-var tests share process state, so they run inside one test.
#[test]
fn config_from_env_reads_and_validates() {
    unsafe {
        std::env::remove_var("CHAINWORK_LEDGER");
        std::env::remove_var("CHAINWORK_WORKERS");
        std::env::remove_var("CHAINWORK_MAX_ATTEMPTS");
        std::env::remove_var("CHAINWORK_POLL_MS");
    }
    let defaults = Config::from_env().unwrap();
    assert_eq!(defaults.ledger_path, PathBuf::from("chainwork.db"));
    assert_eq!(defaults.scheduler().workers, 4);

    unsafe {
        std::env::set_var("CHAINWORK_LEDGER", "/tmp/ledger.db");
        std::env::set_var("CHAINWORK_WORKERS", "2");
        std::env::set_var("CHAINWORK_POLL_MS", "250");
    }
    let config = Config::from_env().unwrap();
    assert_eq!(config.ledger_path, PathBuf::from("/tmp/ledger.db"));
    let scheduler = config.scheduler();
    assert_eq!(scheduler.workers, 2);
    assert_eq!(scheduler.poll_interval, Duration::from_millis(250));
    assert_eq!(scheduler.default_max_attempts, 5);

    unsafe {
        std::env::set_var("CHAINWORK_WORKERS", "many");
    }
    assert!(matches!(Config::from_env(), Err(chainwork::Error::Config(_))));

    unsafe {
        std::env::set_var("CHAINWORK_WORKERS", "0");
    }
    assert!(Config::from_env().is_err());

    unsafe {
        std::env::remove_var("CHAINWORK_LEDGER");
        std::env::remove_var("CHAINWORK_WORKERS");
        std::env::remove_var("CHAINWORK_POLL_MS");
    }
}

#[test]
fn config_from_toml_fills_defaults() {
    let config = Config::from_toml(
        r#"
        ledger_path = "work.db"
        max_attempts = 3
        "#,
    )
    .unwrap();
    assert_eq!(config.ledger_path, PathBuf::from("work.db"));
    assert_eq!(config.log_level, "info");
    assert_eq!(config.scheduler().default_max_attempts, 3);
    assert_eq!(config.scheduler().workers, 4);
}

#[test]
fn config_from_toml_rejects_unknown_keys() {
    assert!(Config::from_toml("wrokers = 3").is_err());
    assert!(Config::from_toml("max_attempts = 0").is_err());
}

#[test]
fn config_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chainwork.toml");
    std::fs::write(&path, "workers = 8\npoll_ms = 100\n").unwrap();

    let config = Config::from_file(&path).unwrap();
    assert_eq!(config.scheduler().workers, 8);
    assert!(Config::from_file(dir.path().join("missing.toml")).is_err());
}
