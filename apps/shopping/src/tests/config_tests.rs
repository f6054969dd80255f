use super::{
    apply_env_overrides, apply_file_overrides, normalize_database_url, prepare_database_url,
    Settings,
};

use std::{collections::HashMap, fs};

#[test]
fn normalizes_plain_file_path_to_sqlite_url() {
    assert_eq!(
        normalize_database_url("./data/test.db"),
        "sqlite://./data/test.db"
    );
}

#[test]
fn keeps_memory_and_foreign_urls() {
    assert_eq!(normalize_database_url("sqlite::memory:"), "sqlite::memory:");
    assert_eq!(
        normalize_database_url("sqlite://./data/test.db"),
        "sqlite://./data/test.db"
    );
    assert_eq!(
        normalize_database_url("postgres://localhost/shop"),
        "postgres://localhost/shop"
    );
}

#[test]
fn blank_url_falls_back_to_default() {
    assert_eq!(normalize_database_url("   "), Settings::default().database_url);
}

#[test]
fn keeps_windows_absolute_path_with_single_sqlite_colon() {
    assert_eq!(
        normalize_database_url("sqlite:C:\\Users\\alice\\test.db"),
        "sqlite:C:/Users/alice/test.db"
    );
}

#[test]
fn normalizes_windows_plain_path_with_single_sqlite_colon() {
    assert_eq!(
        normalize_database_url("C:\\Users\\alice\\test.db"),
        "sqlite:C:/Users/alice/test.db"
    );
}

#[test]
fn converts_sqlite_double_slash_windows_path() {
    assert_eq!(
        normalize_database_url("sqlite://C:/Users/alice/test.db"),
        "sqlite:C:/Users/alice/test.db"
    );
}

#[test]
fn creates_parent_dir_for_sqlite_url() {
    let temp_root = tempfile::tempdir().expect("temp dir");
    let db_path = temp_root.path().join("data").join("test.db");

    let prepared =
        prepare_database_url(db_path.to_string_lossy().as_ref()).expect("prepare db url");
    assert!(prepared.starts_with("sqlite:"));
    assert!(temp_root.path().join("data").exists());
}

#[test]
fn file_overrides_defaults() {
    let temp_root = tempfile::tempdir().expect("temp dir");
    let path = temp_root.path().join("shopping.toml");
    fs::write(&path, "database_url = \"sqlite://./other.db\"\n").expect("write settings");

    let mut settings = Settings::default();
    apply_file_overrides(&mut settings, &path);
    assert_eq!(settings.database_url, "sqlite://./other.db");
    assert_eq!(settings.log_filter, "info");
}

#[test]
fn missing_or_malformed_file_keeps_defaults() {
    let temp_root = tempfile::tempdir().expect("temp dir");
    let mut settings = Settings::default();
    apply_file_overrides(&mut settings, &temp_root.path().join("absent.toml"));
    assert_eq!(settings, Settings::default());

    let path = temp_root.path().join("broken.toml");
    fs::write(&path, "database_url = [").expect("write settings");
    apply_file_overrides(&mut settings, &path);
    assert_eq!(settings, Settings::default());
}

#[test]
fn prefixed_env_wins_over_plain_env() {
    let env: HashMap<&str, &str> = HashMap::from([
        ("DATABASE_URL", "sqlite://./plain.db"),
        ("APP__DATABASE_URL", "sqlite://./prefixed.db"),
        ("APP__LOG_FILTER", "debug,sqlx=warn"),
    ]);

    let mut settings = Settings::default();
    apply_env_overrides(&mut settings, |key| env.get(key).map(|v| v.to_string()));
    assert_eq!(settings.database_url, "sqlite://./prefixed.db");
    assert_eq!(settings.log_filter, "debug,sqlx=warn");
}
