use std::path::Path;
use std::process::{Command, Output};

use tempfile::tempdir;

fn residue(db: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_residue"))
        .arg("--db")
        .arg(db)
        .args(args)
        .env_remove("RESIDUE_API_KEY")
        .env_remove("OPENROUTER_API_KEY")
        .output()
        .unwrap()
}

#[derive(Debug, serde::Deserialize)]
struct Stats {
    total: i64,
    active: i64,
    inspiration_docs: i64,
    spend_today_usd: f64,
}

#[test]
fn cli_seed_stats_export_prune_smoke() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("events.sqlite");

    let nodes_path = dir.path().join("nodes.json");
    std::fs::write(
        &nodes_path,
        serde_json::to_string(&serde_json::json!([
            { "world_id": "medieval", "node_id": "shrine_01", "name": "Forgotten Shrine",
              "description": "A bell rings with no one near it." },
            { "world_id": "future", "node_id": "lab_03", "name": "Culture Vats" }
        ]))
        .unwrap(),
    )
    .unwrap();
    let profiles_path = dir.path().join("profiles.json");
    std::fs::write(
        &profiles_path,
        r#"[{"player_id": "p1", "play_style": "explorer", "total_runs": 3}]"#,
    )
    .unwrap();

    let out = residue(
        &db,
        &[
            "seed",
            "--nodes",
            nodes_path.to_str().unwrap(),
            "--profiles",
            profiles_path.to_str().unwrap(),
        ],
    );
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("seeded 2 nodes"));
    assert!(stdout.contains("seeded 1 profiles"));

    let out = residue(&db, &["stats"]);
    assert!(out.status.success());
    let stats: Stats = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(stats.total, 0);
    assert_eq!(stats.active, 0);
    assert_eq!(stats.inspiration_docs, 0);
    assert_eq!(stats.spend_today_usd, 0.0);

    let export_path = dir.path().join("events.jsonl");
    let out = residue(&db, &["export", "--out", export_path.to_str().unwrap()]);
    assert!(out.status.success());
    assert_eq!(std::fs::read_to_string(&export_path).unwrap(), "");

    let out = residue(&db, &["prune", "--max-age-days", "30"]);
    assert!(out.status.success());
    assert!(String::from_utf8_lossy(&out.stdout).contains("pruned 0 traces"));
}

#[test]
fn cli_retire_unknown_event_fails() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("events.sqlite");

    let out = residue(&db, &["retire", "ge_0000000000000000"]);
    assert!(!out.status.success());
}

#[test]
fn cli_resolve_without_api_key_fails_cleanly() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("events.sqlite");

    let out = residue(&db, &["resolve", "--world", "medieval", "--node", "shrine_01"]);
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("api_key"));
}
