use tempfile::TempDir;

use vidshard::worker::BackupStore;

#[tokio::test]
async fn test_receive_commit_and_find() {
    let dir = TempDir::new().unwrap();
    let store = BackupStore::new(dir.path().join("backup"));

    let mut writer = store.begin_receive("wedding", "mp4").await.unwrap();
    writer.write(b"part one ").await.unwrap();
    writer.write(b"part two").await.unwrap();
    let dest = writer.commit().await.unwrap();

    let found = store.find("wedding").await.unwrap();
    assert_eq!(found, dest);
    let bytes = tokio::fs::read(&found).await.unwrap();
    assert_eq!(bytes, b"part one part two");
}

#[tokio::test]
async fn test_uncommitted_replica_is_not_served() {
    let dir = TempDir::new().unwrap();
    let store = BackupStore::new(dir.path().join("backup"));

    let mut writer = store.begin_receive("partial", "mkv").await.unwrap();
    writer.write(b"incomplete").await.unwrap();
    drop(writer);

    assert!(store.find("partial").await.is_err());
    assert!(store.list().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_recommit_replaces_artifact() {
    let dir = TempDir::new().unwrap();
    let store = BackupStore::new(dir.path().join("backup"));

    let mut writer = store.begin_receive("talk", "mp4").await.unwrap();
    writer.write(b"old bytes").await.unwrap();
    writer.commit().await.unwrap();

    let mut writer = store.begin_receive("talk", "mp4").await.unwrap();
    writer.write(b"new bytes").await.unwrap();
    writer.commit().await.unwrap();

    let bytes = tokio::fs::read(store.find("talk").await.unwrap())
        .await
        .unwrap();
    assert_eq!(bytes, b"new bytes");
}

#[tokio::test]
async fn test_list_enumerates_jobs_and_containers() {
    let dir = TempDir::new().unwrap();
    let store = BackupStore::new(dir.path().join("backup"));

    for (job, container) in [("a", "mp4"), ("b", "mkv")] {
        let mut writer = store.begin_receive(job, container).await.unwrap();
        writer.write(b"x").await.unwrap();
        writer.commit().await.unwrap();
    }

    let mut entries = store.list().await.unwrap();
    entries.sort();
    assert_eq!(
        entries,
        vec![
            ("a".to_string(), "mp4".to_string()),
            ("b".to_string(), "mkv".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_empty_store_lists_nothing() {
    let dir = TempDir::new().unwrap();
    let store = BackupStore::new(dir.path().join("backup"));

    assert!(store.list().await.unwrap().is_empty());
    assert!(store.find("ghost").await.is_err());
}
