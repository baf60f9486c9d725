//! Disk driver integration: persistence, stable identity, lazy loading, and
//! single-queue conflict behavior against a real backing directory.

use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use tempfile::TempDir;
use treedb::driver::DriverFactories;
use treedb::registry::FileTypeRegistry;
use treedb::{Config, Patch, PatchOp, PatchVerb, Repository, RepositoryOptions, TreeError};

fn repository(data: &Path) -> Repository {
    let types = FileTypeRegistry::new();
    types.register("db", ".db.json");
    let options = RepositoryOptions {
        config: Config {
            data: data.to_path_buf(),
            ..Config::default()
        },
        types,
        ..RepositoryOptions::default()
    };
    Repository::new(options, &DriverFactories::standard()).unwrap()
}

#[tokio::test]
async fn add_materializes_directories_and_files_on_disk() {
    let tmp = TempDir::new().unwrap();
    let repo = repository(tmp.path());
    repo.open().await.unwrap();

    let outcome = repo
        .add("a/b/c.db.json", Some(json!({"x": 1})))
        .await
        .unwrap();
    assert_eq!(outcome.tx, 1);
    assert_eq!(outcome.entry.name, "c.db.json");

    assert!(tmp.path().join("a/b").is_dir());
    let raw = std::fs::read_to_string(tmp.path().join("a/b/c.db.json")).unwrap();
    let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(value, json!({"x": 1}));

    // Three nodes created: a, a/b, a/b/c.db.json.
    assert_eq!(repo.entries().len(), 3);
    repo.close().await.unwrap();
}

#[tokio::test]
async fn ids_are_stable_across_restarts() {
    let tmp = TempDir::new().unwrap();
    let before: HashMap<String, String>;
    {
        let repo = repository(tmp.path());
        repo.open().await.unwrap();
        repo.add("docs/guide.db.json", Some(json!({"title": "one"})))
            .await
            .unwrap();
        repo.add("docs/extra", None).await.unwrap();
        before = repo
            .entries()
            .into_iter()
            .map(|e| (e.name.clone(), e.id.as_str().to_string()))
            .collect();
        repo.close().await.unwrap();
    }

    let repo = repository(tmp.path());
    repo.open().await.unwrap();
    let after: HashMap<String, String> = repo
        .entries()
        .into_iter()
        .map(|e| (e.name.clone(), e.id.as_str().to_string()))
        .collect();
    assert_eq!(before, after);
    repo.close().await.unwrap();
}

#[tokio::test]
async fn id_tags_match_node_kinds() {
    let tmp = TempDir::new().unwrap();
    let repo = repository(tmp.path());
    repo.open().await.unwrap();
    repo.add("dir/file.db.json", Some(json!(null))).await.unwrap();

    let mut ids = std::collections::HashSet::new();
    for entry in repo.entries() {
        let tag = entry.id.as_str().chars().next().unwrap();
        if entry.id.is_directory() {
            assert_eq!(tag, 'd');
        } else {
            assert_eq!(tag, 'f');
        }
        assert!(ids.insert(entry.id.clone()), "duplicate id {}", entry.id);
    }
    repo.close().await.unwrap();
}

#[tokio::test]
async fn registered_types_parse_eagerly_others_lazily() {
    let tmp = TempDir::new().unwrap();
    std::fs::create_dir_all(tmp.path().join("stuff")).unwrap();
    std::fs::write(
        tmp.path().join("stuff/eager.db.json"),
        r#"{"loaded": true}"#,
    )
    .unwrap();
    std::fs::write(tmp.path().join("stuff/lazy.json"), r#"{"loaded": false}"#).unwrap();

    let repo = repository(tmp.path());
    repo.open().await.unwrap();

    // Both tracked.
    assert!(repo.entry("stuff/eager.db.json").is_some());
    assert!(repo.entry("stuff/lazy.json").is_some());

    // The registered suffix is already parsed; reading it touches no driver.
    assert_eq!(
        repo.read("stuff/eager.db.json").await.unwrap(),
        json!({"loaded": true})
    );
    // The unregistered one loads on demand.
    assert_eq!(
        repo.read("stuff/lazy.json").await.unwrap(),
        json!({"loaded": false})
    );
    repo.close().await.unwrap();
}

#[tokio::test]
async fn move_renames_on_disk_and_keeps_ids() {
    let tmp = TempDir::new().unwrap();
    let repo = repository(tmp.path());
    repo.open().await.unwrap();
    repo.add("src/f.db.json", Some(json!({"v": 1}))).await.unwrap();
    let id = repo.entry("src/f.db.json").unwrap().id;

    repo.rename("src/f.db.json", "dst/deep/g.db.json")
        .await
        .unwrap();

    assert!(!tmp.path().join("src/f.db.json").exists());
    assert!(tmp.path().join("dst/deep/g.db.json").is_file());
    assert_eq!(repo.entry("dst/deep/g.db.json").unwrap().id, id);
    repo.close().await.unwrap();
}

#[tokio::test]
async fn copy_duplicates_subtree_with_new_ids() {
    let tmp = TempDir::new().unwrap();
    let repo = repository(tmp.path());
    repo.open().await.unwrap();
    repo.add("proj/data.db.json", Some(json!({"k": 2}))).await.unwrap();

    repo.copy("proj", "backup").await.unwrap();

    assert!(tmp.path().join("backup/data.db.json").is_file());
    let original = repo.entry("proj/data.db.json").unwrap();
    let copied = repo.entry("backup/data.db.json").unwrap();
    assert_ne!(original.id, copied.id);
    assert_eq!(repo.read("backup/data.db.json").await.unwrap(), json!({"k": 2}));
    repo.close().await.unwrap();
}

#[tokio::test]
async fn remove_deletes_from_disk_and_rejects_missing() {
    let tmp = TempDir::new().unwrap();
    let repo = repository(tmp.path());
    repo.open().await.unwrap();
    repo.add("gone/x.db.json", Some(json!(1))).await.unwrap();

    repo.remove("gone").await.unwrap();
    assert!(!tmp.path().join("gone").exists());
    assert_eq!(repo.entries().len(), 0);

    let err = repo.remove("gone").await.unwrap_err();
    assert!(err.is_not_found());
    // Store unchanged by the failed verb.
    assert_eq!(repo.entries().len(), 0);
    repo.close().await.unwrap();
}

#[tokio::test]
async fn second_patch_with_same_preimage_conflicts() {
    let tmp = TempDir::new().unwrap();
    let repo = repository(tmp.path());
    repo.open().await.unwrap();
    repo.add("f.db.json", Some(json!({"v": 1}))).await.unwrap();
    let ctime = repo.entry("f.db.json").unwrap().ctime;

    let patch = |value: i64| {
        Patch::new(
            vec![PatchOp {
                op: PatchVerb::Replace,
                path: "/v".to_string(),
                value: Some(json!(value)),
            }],
            ctime,
        )
    };

    // Processed in order by the single queue: first advances ctime, second
    // presents the now-stale pre-image.
    repo.patch("f.db.json", patch(2)).await.unwrap();
    let err = repo.patch("f.db.json", patch(3)).await.unwrap_err();
    assert!(err.is_conflict());

    assert_eq!(repo.read("f.db.json").await.unwrap(), json!({"v": 2}));
    repo.close().await.unwrap();
}

#[tokio::test]
async fn conditional_write_with_stale_ctime_conflicts() {
    let tmp = TempDir::new().unwrap();
    let repo = repository(tmp.path());
    repo.open().await.unwrap();
    repo.add("f.db.json", Some(json!({"v": 1}))).await.unwrap();
    let ctime = repo.entry("f.db.json").unwrap().ctime;

    repo.write("f.db.json", json!({"v": 2}), Some(ctime))
        .await
        .unwrap();
    let err = repo
        .write("f.db.json", json!({"v": 3}), Some(ctime))
        .await
        .unwrap_err();
    assert!(matches!(err, TreeError::Conflict { .. }));
    repo.close().await.unwrap();
}

#[tokio::test]
async fn noop_write_emits_no_change_and_keeps_tx() {
    let tmp = TempDir::new().unwrap();
    let repo = repository(tmp.path());
    repo.open().await.unwrap();
    repo.add("f.db.json", Some(json!({"v": 1}))).await.unwrap();
    let tx = repo.tx();
    let ctime = repo.entry("f.db.json").unwrap().ctime;
    let mut changes = repo.subscribe();

    repo.write("f.db.json", json!({"v": 1}), None).await.unwrap();

    assert_eq!(repo.tx(), tx);
    assert_eq!(repo.entry("f.db.json").unwrap().ctime, ctime);
    assert!(changes.try_recv().is_err());
    repo.close().await.unwrap();
}

#[tokio::test]
async fn dot_segments_never_reach_the_backing_root() {
    let tmp = TempDir::new().unwrap();
    let data = tmp.path().join("data");
    let repo = repository(&data);
    repo.open().await.unwrap();

    let err = repo
        .add("../escaped.json", Some(json!({"x": 1})))
        .await
        .unwrap_err();
    assert!(matches!(err, TreeError::InvalidParent(_)));
    assert!(!tmp.path().join("escaped.json").exists());
    assert_eq!(repo.entries().len(), 0);

    repo.add("a/f.db.json", Some(json!(1))).await.unwrap();
    let err = repo.rename("a/f.db.json", "../../f.db.json").await.unwrap_err();
    assert!(matches!(err, TreeError::InvalidParent(_)));
    assert!(tmp.path().join("data/a/f.db.json").is_file());
    repo.close().await.unwrap();
}

#[tokio::test]
async fn verbs_after_close_are_rejected() {
    let tmp = TempDir::new().unwrap();
    let repo = repository(tmp.path());
    repo.open().await.unwrap();
    repo.close().await.unwrap();
    let err = repo.add("x", None).await.unwrap_err();
    assert!(matches!(err, TreeError::Closed));
}
