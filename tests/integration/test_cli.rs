//! Runs the `kbsearch` binary against a throwaway workspace.

use std::path::{Path, PathBuf};
use std::process::Command;

use tempfile::TempDir;

const SETTINGS: &str = r#"data_dir = "data"

[embedding]
model = "hashing"
dimension = 64
"#;

const ARTICLES: &str = r#"[
    {"id": 1, "title": "Reset password", "content": "reset your password from the login page", "category_id": 1},
    {"id": 2, "title": "Shipping", "content": "orders ship within three business days", "category_id": 2},
    {"id": 3, "title": "Refunds", "content": "refunds arrive five days after approval", "category_id": 2}
]"#;

fn kbsearch_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_kbsearch"))
}

fn prepare_workspace(workspace: &Path) {
    let config_dir = workspace.join(".kbsearch");
    std::fs::create_dir_all(&config_dir).expect("create config dir");
    std::fs::write(config_dir.join("settings.toml"), SETTINGS).expect("write settings file");
    std::fs::write(workspace.join("articles.json"), ARTICLES).expect("write articles");
}

fn run_cli(workspace: &Path, args: &[&str]) -> (i32, String, String) {
    let output = Command::new(kbsearch_binary())
        .args(args)
        .current_dir(workspace)
        .env_remove("KB_LOG")
        .env("NO_COLOR", "1")
        .output()
        .expect("run kbsearch CLI");

    let code = output.status.code().unwrap_or(-1);
    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (code, stdout, stderr)
}

fn run_json(workspace: &Path, args: &[&str]) -> (i32, serde_json::Value) {
    let (code, stdout, stderr) = run_cli(workspace, args);
    let json = serde_json::from_str(&stdout)
        .unwrap_or_else(|e| panic!("invalid JSON ({e}): {stdout}\nstderr: {stderr}"));
    (code, json)
}

#[test]
fn test_init_refuses_to_overwrite() {
    let workspace = TempDir::new().unwrap();

    let (code, stdout, _) = run_cli(workspace.path(), &["init"]);
    assert_eq!(code, 0);
    assert!(stdout.contains("settings.toml"));
    assert!(workspace.path().join(".kbsearch/settings.toml").exists());

    let (code, _, stderr) = run_cli(workspace.path(), &["init"]);
    assert_eq!(code, 1);
    assert!(stderr.contains("--force"));

    let (code, _, _) = run_cli(workspace.path(), &["init", "--force"]);
    assert_eq!(code, 0);
}

#[test]
fn test_import_search_delete_flow() {
    let workspace = TempDir::new().unwrap();
    let root = workspace.path();
    prepare_workspace(root);

    let (code, stdout, stderr) = run_cli(root, &["import", "articles.json"]);
    assert_eq!(code, 0, "stderr: {stderr}");
    assert!(stdout.contains("Indexed"));

    let (code, json) = run_json(
        root,
        &[
            "search",
            "reset your password from the login page",
            "-k",
            "2",
            "--json",
        ],
    );
    assert_eq!(code, 0);
    assert_eq!(json["status"], "success");
    assert_eq!(json["data"][0]["article_id"], 1);

    let (code, json) = run_json(
        root,
        &["search", "refunds", "--category", "2", "--json"],
    );
    assert_eq!(code, 0);
    let hits = json["data"].as_array().unwrap();
    assert_eq!(hits.len(), 2);
    assert!(hits.iter().all(|hit| hit["article_id"] != 1));

    let (code, _, _) = run_cli(root, &["delete", "1"]);
    assert_eq!(code, 0);

    let (_, json) = run_json(root, &["health", "--verify", "--json"]);
    assert_eq!(json["data"]["corpus_size"], 2);
    assert_eq!(json["data"]["consistent"], true);
    assert_eq!(json["data"]["model"], "hashing-64");
}

#[test]
fn test_empty_index_search_exits_not_found() {
    let workspace = TempDir::new().unwrap();
    prepare_workspace(workspace.path());

    let (code, stdout, _) = run_cli(workspace.path(), &["search", "anything"]);
    assert_eq!(code, 3);
    assert!(stdout.contains("No matching articles"));
}

#[test]
fn test_reindex_unknown_article_reports_error() {
    let workspace = TempDir::new().unwrap();
    prepare_workspace(workspace.path());

    let (code, _, stderr) = run_cli(
        workspace.path(),
        &["reindex", "42", "--articles", "articles.json"],
    );
    assert_eq!(code, 3);
    assert!(stderr.contains("42"));
}
