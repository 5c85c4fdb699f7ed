//! End-to-end tests that drive the compiled `docrag` binary.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn docrag_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("docrag");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();
    fs::write(
        files_dir.join("stairs.md"),
        "# Stairwells\n\nStairwell doors must be self-closing and carry a ninety minute fire rating.\n\nHandrails are required on both sides of every stair.",
    )
    .unwrap();
    fs::write(
        files_dir.join("concrete.txt"),
        "Concrete pours below five degrees Celsius require heated enclosures.\n\nCuring blankets stay in place for seven days.",
    )
    .unwrap();
    fs::write(
        files_dir.join("rooms.csv"),
        "room,area_sqft,finish\nlobby,1200,terrazzo\nboardroom,640,carpet\n",
    )
    .unwrap();
    fs::write(files_dir.join("ignored.bin"), [0u8, 1, 2, 3]).unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/docrag.sqlite"

[chunking]
chunk_size = 400
overlap = 80

[embedding]
provider = "hash"
dims = 128

[retrieval]
top_k = 3
min_score = 0.2

[ocr]
enabled = false
"#,
        root.display()
    );

    let config_path = config_dir.join("docrag.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_docrag(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = docrag_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run docrag binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn files_dir(config_path: &Path) -> String {
    config_path
        .parent()
        .unwrap()
        .parent()
        .unwrap()
        .join("files")
        .display()
        .to_string()
}

#[test]
fn test_init_is_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_docrag(&config_path, &["init"]);
    assert!(success, "init failed: {}", stderr);
    assert!(stdout.contains("Database initialized successfully"));

    let (_, stderr, success) = run_docrag(&config_path, &["init"]);
    assert!(success, "second init failed: {}", stderr);
}

#[test]
fn test_ingest_directory_and_query() {
    let (_tmp, config_path) = setup_test_env();
    let files = files_dir(&config_path);

    run_docrag(&config_path, &["init"]);
    let (stdout, stderr, success) = run_docrag(&config_path, &["ingest", &files]);
    assert!(success, "ingest failed: stdout={} stderr={}", stdout, stderr);
    assert!(
        stdout.contains("ingested 3 / 3 documents"),
        "unexpected ingest output: {}",
        stdout
    );
    assert!(!stdout.contains("ignored.bin"));

    let (stdout, _, success) = run_docrag(
        &config_path,
        &["query", "Stairwell doors must be self-closing and carry a ninety minute fire rating."],
    );
    assert!(success);
    assert!(stdout.starts_with("[1]"), "expected a cited chunk: {}", stdout);
    assert!(stdout.contains("stairs.md"));
}

#[test]
fn test_query_without_matches_reports_no_context() {
    let (_tmp, config_path) = setup_test_env();
    run_docrag(&config_path, &["init"]);

    let (stdout, stderr, success) = run_docrag(&config_path, &["query", "anything at all"]);
    assert!(success, "query on empty index failed: {}", stderr);
    assert!(stdout.contains("No relevant context found."));
}

#[test]
fn test_query_json_output() {
    let (_tmp, config_path) = setup_test_env();
    let files = files_dir(&config_path);
    run_docrag(&config_path, &["ingest", &files]);

    let (stdout, _, success) = run_docrag(
        &config_path,
        &["query", "Curing blankets stay in place for seven days.", "--json", "--top-k", "1"],
    );
    assert!(success);
    let value: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let chunks = value["chunks"].as_array().unwrap();
    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0]["metadata"]["filename"], "concrete.txt");
    assert!(chunks[0]["score"].as_f64().unwrap() > 0.2);
}

#[test]
fn test_query_filter_by_tag() {
    let (_tmp, config_path) = setup_test_env();
    let files = files_dir(&config_path);
    let stairs = format!("{}/stairs.md", files);
    let concrete = format!("{}/concrete.txt", files);

    run_docrag(&config_path, &["ingest", &stairs, "--tag", "trade=carpentry"]);
    run_docrag(&config_path, &["ingest", &concrete, "--tag", "trade=concrete"]);

    let (stdout, _, success) = run_docrag(
        &config_path,
        &[
            "query",
            "Stairwell doors must be self-closing",
            "--filter",
            "trade=concrete",
        ],
    );
    assert!(success);
    assert!(!stdout.contains("stairs.md"), "filter leaked: {}", stdout);
}

#[test]
fn test_list_get_delete() {
    let (_tmp, config_path) = setup_test_env();
    let files = files_dir(&config_path);
    let stairs = format!("{}/stairs.md", files);

    run_docrag(&config_path, &["ingest", &stairs, "--id", "stairs-doc"]);

    let (stdout, _, success) = run_docrag(&config_path, &["list"]);
    assert!(success);
    assert!(stdout.contains("stairs-doc"));
    assert!(stdout.contains("indexed"));

    let (stdout, _, success) = run_docrag(&config_path, &["get", "stairs-doc"]);
    assert!(success);
    assert!(stdout.contains("filename:     stairs.md"));
    assert!(stdout.contains("[chunk 0] chars 0.."));

    let (stdout, _, success) = run_docrag(&config_path, &["delete", "stairs-doc"]);
    assert!(success);
    assert!(stdout.contains("deleted stairs-doc"));

    // idempotent
    let (stdout, _, success) = run_docrag(&config_path, &["delete", "stairs-doc"]);
    assert!(success);
    assert!(stdout.contains("nothing to delete"));

    let (_, stderr, success) = run_docrag(&config_path, &["get", "stairs-doc"]);
    assert!(!success);
    assert!(stderr.contains("document not found"));
}

#[test]
fn test_unsupported_explicit_file_is_reported() {
    let (_tmp, config_path) = setup_test_env();
    let files = files_dir(&config_path);
    let bin = format!("{}/ignored.bin", files);

    let (stdout, _, success) = run_docrag(&config_path, &["ingest", &bin]);
    assert!(success);
    assert!(stdout.contains("failed"));
    assert!(stdout.contains("UnsupportedMediaType"));
}

#[test]
fn test_stats_and_clear() {
    let (_tmp, config_path) = setup_test_env();
    let files = files_dir(&config_path);
    run_docrag(&config_path, &["ingest", &files]);

    let (stdout, _, success) = run_docrag(&config_path, &["stats", "--json"]);
    assert!(success);
    let stats: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(stats["documents"]["indexed"], 3);
    assert_eq!(stats["dims"], 128);
    assert_eq!(stats["model"], "hash-v1-128");

    let (stdout, _, success) = run_docrag(&config_path, &["clear"]);
    assert!(success);
    assert!(stdout.contains("cleared 3 documents"));

    let (stdout, _, _) = run_docrag(&config_path, &["stats", "--json"]);
    let stats: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(stats["entries"], 0);
}

#[test]
fn test_reopen_with_different_dims_is_refused() {
    let (_tmp, config_path) = setup_test_env();
    let files = files_dir(&config_path);
    run_docrag(&config_path, &["ingest", &files]);

    let config = fs::read_to_string(&config_path)
        .unwrap()
        .replace("dims = 128", "dims = 256");
    fs::write(&config_path, config).unwrap();

    let (_, stderr, success) = run_docrag(&config_path, &["query", "concrete"]);
    assert!(!success);
    assert!(stderr.contains("dimension mismatch"), "stderr: {}", stderr);
}

#[test]
fn test_missing_config_fails() {
    let (stdout, stderr, success) = run_docrag(Path::new("/nonexistent/docrag.toml"), &["stats"]);
    assert!(!success, "stdout={}", stdout);
    assert!(stderr.contains("Failed to read config file"));
}
