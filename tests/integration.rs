use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn voc_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("voc");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let reviews_dir = root.join("reviews");
    fs::create_dir_all(&reviews_dir).unwrap();
    fs::write(reviews_dir.join("login.txt"), "App crashes on login, please fix").unwrap();
    fs::write(reviews_dir.join("dark.txt"), "Would love a dark mode option").unwrap();
    fs::write(reviews_dir.join("empty.txt"), "   \n").unwrap();
    fs::write(reviews_dir.join("notes.csv"), "not a review").unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/voc.sqlite"

[corpus]
root = "{root}/reviews"
include_globs = ["**/*.txt"]

[oracle]
provider = "stub"
dims = 128

[retry]
max_attempts = 2
base_delay_ms = 1
max_delay_ms = 2

[pipeline]
workers = 2
"#,
        root = root.display()
    );

    let config_path = config_dir.join("voc.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_voc(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = voc_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run voc binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn ingest(config_path: &Path) -> String {
    let (stdout, stderr, success) = run_voc(config_path, &["ingest", "--progress", "off"]);
    assert!(success, "ingest failed: stdout={}, stderr={}", stdout, stderr);
    stdout
}

#[test]
fn test_init_is_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_voc(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));

    let (_, _, success) = run_voc(&config_path, &["init"]);
    assert!(success, "Second init failed (not idempotent)");
}

#[test]
fn test_ingest_builds_graph() {
    let (_tmp, config_path) = setup_test_env();

    run_voc(&config_path, &["init"]);
    let stdout = ingest(&config_path);
    assert!(
        stdout.contains("Documents: 3 seen, 2 ingested, 1 empty, 0 already ingested"),
        "unexpected ingest output: {}",
        stdout
    );
    assert!(stdout.contains("Saved 3 entities, 1 relations, 2 communities"));
}

#[test]
fn test_ingest_twice_adds_nothing() {
    let (_tmp, config_path) = setup_test_env();

    run_voc(&config_path, &["init"]);
    ingest(&config_path);
    let stdout = ingest(&config_path);
    assert!(
        stdout.contains("0 ingested, 1 empty, 2 already ingested"),
        "unexpected second ingest output: {}",
        stdout
    );
    assert!(stdout.contains("Saved 3 entities"));
}

#[test]
fn test_ingest_appends_new_reviews() {
    let (tmp, config_path) = setup_test_env();

    run_voc(&config_path, &["init"]);
    ingest(&config_path);

    fs::write(
        tmp.path().join("reviews/again.txt"),
        "The app crashes on login again",
    )
    .unwrap();
    let stdout = ingest(&config_path);
    assert!(stdout.contains("1 ingested"), "got: {}", stdout);
    // "login crash" and "login" merge into the existing entities.
    assert!(stdout.contains("Entities:  0 created, 2 merged"), "got: {}", stdout);
}

#[test]
fn test_ingest_dry_run() {
    let (_tmp, config_path) = setup_test_env();

    run_voc(&config_path, &["init"]);
    let (stdout, _, success) = run_voc(&config_path, &["ingest", "--dry-run"]);
    assert!(success);
    assert!(stdout.contains("dry-run"));
    assert!(stdout.contains("to extract:         2"));

    let (_, stderr, success) = run_voc(&config_path, &["query", "anything"]);
    assert!(!success, "dry run must not save a knowledge base");
    assert!(stderr.contains("No knowledge base found"));
}

#[test]
fn test_query_cites_source_review() {
    let (_tmp, config_path) = setup_test_env();

    run_voc(&config_path, &["init"]);
    ingest(&config_path);

    let (stdout, stderr, success) = run_voc(&config_path, &["query", "What bugs are reported?"]);
    assert!(success, "query failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("Sources:"));
    assert!(stdout.contains("login.txt"), "got: {}", stdout);
}

#[test]
fn test_query_json_output() {
    let (_tmp, config_path) = setup_test_env();

    run_voc(&config_path, &["init"]);
    ingest(&config_path);

    let (stdout, _, success) = run_voc(
        &config_path,
        &["query", "dark mode", "--json", "--k", "2"],
    );
    assert!(success);
    let value: serde_json::Value = serde_json::from_str(&stdout).expect("valid JSON");
    assert!(value["answer"].as_str().is_some());
    assert!(value["hits"].as_array().unwrap().len() <= 2);
    assert!(value["context"]
        .as_str()
        .unwrap()
        .starts_with("CONTEXT FOR YOUR ANSWER:"));
    let documents = value["cited_sources"]["documents"].as_array().unwrap();
    assert!(documents.iter().any(|d| d == "dark.txt"));
}

#[test]
fn test_communities_lists_miscellaneous_bucket() {
    let (_tmp, config_path) = setup_test_env();

    run_voc(&config_path, &["init"]);
    ingest(&config_path);

    let (stdout, _, success) = run_voc(&config_path, &["communities"]);
    assert!(success);
    assert!(stdout.contains("c0 (2 members)"), "got: {}", stdout);
    assert!(stdout.contains("c1 (1 members) [miscellaneous]"), "got: {}", stdout);
    assert!(stdout.contains("dark mode (FEATURE_REQUEST"));
}

#[test]
fn test_stats_and_export() {
    let (tmp, config_path) = setup_test_env();

    run_voc(&config_path, &["init"]);
    ingest(&config_path);

    let (stdout, _, success) = run_voc(&config_path, &["stats"]);
    assert!(success);
    assert!(stdout.contains("Documents:    2"), "got: {}", stdout);
    assert!(stdout.contains("Entities:     3"));
    assert!(stdout.contains("Relations:    1"));
    assert!(stdout.contains("BUG_REPORT"));

    let out_path = tmp.path().join("out/graph.json");
    let (_, _, success) = run_voc(
        &config_path,
        &["export", "--output", out_path.to_str().unwrap()],
    );
    assert!(success);
    let value: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&out_path).unwrap()).unwrap();
    assert_eq!(value["entities"].as_array().unwrap().len(), 3);
    assert_eq!(value["relations"].as_array().unwrap().len(), 1);
    assert_eq!(value["index_model"], "stub-hash-bow");
}

#[test]
fn test_invalid_config_is_rejected() {
    let (tmp, _) = setup_test_env();
    let bad = tmp.path().join("config/bad.toml");
    fs::write(&bad, "[oracle]\nprovider = \"gemini\"\n").unwrap();

    let (_, stderr, success) = run_voc(&bad, &["init"]);
    assert!(!success);
    assert!(stderr.contains("Unknown oracle provider"), "got: {}", stderr);
}
