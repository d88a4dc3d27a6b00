use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::Value;

fn unique_temp_dir(prefix: &str) -> PathBuf {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|err| panic!("clock should be >= UNIX_EPOCH: {err}"))
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("{prefix}-{now}"));
    fs::create_dir_all(&dir)
        .unwrap_or_else(|err| panic!("failed to create temp dir {}: {err}", dir.display()));
    dir
}

fn run_heya<I, S>(args: I) -> Output
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    Command::new(env!("CARGO_BIN_EXE_heya"))
        .args(args)
        .env_remove("DSN")
        .env_remove("OPENAI_API_KEY")
        .env("LOG_LEVEL", "ERROR")
        .output()
        .unwrap_or_else(|err| panic!("failed to execute heya binary: {err}"))
}

fn run_json<I, S>(args: I) -> Value
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = run_heya(args);
    if !output.status.success() {
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        panic!(
            "heya command failed (status={}):\nstdout:\n{stdout}\nstderr:\n{stderr}",
            output.status
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
    serde_json::from_str(&stdout)
        .unwrap_or_else(|err| panic!("stdout is not valid JSON: {err}\nstdout:\n{stdout}"))
}

fn db_args(dir: &Path) -> [String; 4] {
    [
        "--db".to_string(),
        dir.join("heya.db").to_string_lossy().into_owned(),
        "--schema".to_string(),
        dir.join("schema.sql").to_string_lossy().into_owned(),
    ]
}

fn string_array(value: &Value, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(Value::as_array)
        .unwrap_or_else(|| panic!("missing array field `{key}` in payload: {value}"))
        .iter()
        .map(|item| {
            item.as_str()
                .unwrap_or_else(|| panic!("non-string entry under `{key}`: {value}"))
                .to_string()
        })
        .collect()
}

#[test]
fn migrate_status_then_run_then_status() {
    let dir = unique_temp_dir("heya-migrate");
    let base = db_args(&dir);

    let status = run_json(base.iter().map(String::as_str).chain(["migrate", "status"]));
    assert!(string_array(&status, "applied").is_empty());
    assert_eq!(
        string_array(&status, "pending"),
        ["migration/0001.sql", "migration/0002.sql"]
    );

    let run = run_json(base.iter().map(String::as_str).chain(["migrate", "run"]));
    assert_eq!(string_array(&run, "newly_applied").len(), 2);

    let schema = fs::read_to_string(dir.join("schema.sql"))
        .unwrap_or_else(|err| panic!("schema snapshot missing: {err}"));
    assert!(schema.contains("CREATE TABLE settings"));
    assert!(schema.contains("CREATE TABLE conversations"));
    assert!(schema.contains("CREATE TABLE migrations"));

    let status = run_json(base.iter().map(String::as_str).chain(["migrate", "status"]));
    assert_eq!(string_array(&status, "applied").len(), 2);
    assert!(string_array(&status, "pending").is_empty());

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn second_run_does_not_rewrite_snapshot() {
    let dir = unique_temp_dir("heya-snapshot");
    let base = db_args(&dir);

    run_json(base.iter().map(String::as_str).chain(["migrate", "run"]));
    fs::write(dir.join("schema.sql"), "sentinel")
        .unwrap_or_else(|err| panic!("failed to write sentinel: {err}"));

    // Nothing pending, so the exporter must be skipped entirely.
    run_json(base.iter().map(String::as_str).chain(["migrate", "run"]));
    let schema = fs::read_to_string(dir.join("schema.sql"))
        .unwrap_or_else(|err| panic!("schema snapshot missing: {err}"));
    assert_eq!(schema, "sentinel");

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn settings_show_bootstraps_defaults_and_set_updates() {
    let dir = unique_temp_dir("heya-settings");
    let base = db_args(&dir);

    let shown = run_json(base.iter().map(String::as_str).chain(["settings", "show"]));
    assert_eq!(shown.get("model").and_then(Value::as_str), Some("gpt-4"));
    assert_eq!(shown.get("editor").and_then(Value::as_str), Some("nvim"));
    assert_eq!(shown.get("codify").and_then(Value::as_bool), Some(false));
    assert_eq!(shown.get("temp").and_then(Value::as_i64), Some(10));

    let updated = run_json(base.iter().map(String::as_str).chain([
        "settings", "set", "--model", "gpt-4o", "--temp", "5",
    ]));
    assert_eq!(updated.get("model").and_then(Value::as_str), Some("gpt-4o"));
    assert_eq!(updated.get("temp").and_then(Value::as_i64), Some(5));

    let shown = run_json(base.iter().map(String::as_str).chain(["settings", "show"]));
    assert_eq!(shown.get("model").and_then(Value::as_str), Some("gpt-4o"));
    assert_eq!(shown.get("editor").and_then(Value::as_str), Some("nvim"));

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn migrate_new_scaffolds_sequential_files() {
    let dir = unique_temp_dir("heya-new-migration");
    let migration_dir = dir.join("migration").to_string_lossy().into_owned();
    let base = db_args(&dir);

    let first = run_json(base.iter().map(String::as_str).chain([
        "migrate",
        "new",
        "--dir",
        migration_dir.as_str(),
    ]));
    let first_path = first.get("created").and_then(Value::as_str).map(PathBuf::from);
    assert_eq!(
        first_path.as_deref().and_then(Path::file_name).and_then(OsStr::to_str),
        Some("0001.sql")
    );

    let second = run_json(base.iter().map(String::as_str).chain([
        "migrate",
        "new",
        "--dir",
        migration_dir.as_str(),
    ]));
    let second_path = second.get("created").and_then(Value::as_str).map(PathBuf::from);
    assert_eq!(
        second_path.as_deref().and_then(Path::file_name).and_then(OsStr::to_str),
        Some("0002.sql")
    );

    let _ = fs::remove_dir_all(&dir);
}

#[test]
fn ask_without_api_key_fails_with_config_error() {
    let dir = unique_temp_dir("heya-ask");
    let base = db_args(&dir);

    let output = run_heya(base.iter().map(String::as_str).chain(["ask", "hello"]));
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("OPENAI_API_KEY"), "stderr was:\n{stderr}");

    let _ = fs::remove_dir_all(&dir);
}
