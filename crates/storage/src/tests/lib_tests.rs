use super::*;

async fn memory_storage() -> Storage {
    Storage::new("sqlite::memory:").await.expect("db")
}

#[tokio::test]
async fn health_check_succeeds_for_live_pool() {
    let storage = memory_storage().await;
    storage.health_check().await.expect("health check");
}

#[tokio::test]
async fn creates_database_file_when_missing() {
    let temp_root = tempfile::tempdir().expect("temp dir");
    let db_path = temp_root.path().join("nested").join("shopping_db.sqlite");
    let database_url = format!("sqlite://{}", db_path.to_string_lossy().replace('\\', "/"));

    let storage = Storage::new(&database_url).await.expect("db");
    storage.close().await;

    assert!(
        db_path.exists(),
        "database file should exist: {}",
        db_path.display()
    );
}

#[tokio::test]
async fn insert_assigns_id_and_round_trips() {
    let storage = memory_storage().await;
    let inserted = storage.insert(NewItem::new("Milk")).await.expect("insert");
    assert!(inserted.id.0 > 0);
    assert_eq!(inserted.name, "Milk");
    assert!(!inserted.is_bought);

    let listed = storage.list_all().await.expect("list");
    assert_eq!(listed, vec![inserted.clone()]);

    let found = storage.find(inserted.id).await.expect("find");
    assert_eq!(found, Some(inserted));
}

#[tokio::test]
async fn lists_newest_first() {
    let storage = memory_storage().await;
    let a = storage.insert(NewItem::new("A")).await.expect("a");
    let b = storage.insert(NewItem::new("B")).await.expect("b");
    let c = storage.insert(NewItem::new("C")).await.expect("c");

    let names: Vec<_> = storage
        .list_all()
        .await
        .expect("list")
        .into_iter()
        .map(|item| item.name)
        .collect();
    assert_eq!(names, vec!["C", "B", "A"]);
    assert!(a.id < b.id && b.id < c.id);
}

#[tokio::test]
async fn update_replaces_only_matching_row() {
    let storage = memory_storage().await;
    let milk = storage.insert(NewItem::new("Milk")).await.expect("milk");
    let bread = storage.insert(NewItem::new("Bread")).await.expect("bread");

    let updated = storage.update(&bread.toggled()).await.expect("update");
    assert!(updated);

    let listed = storage.list_all().await.expect("list");
    assert_eq!(listed, vec![bread.toggled(), milk]);
}

#[tokio::test]
async fn update_of_missing_row_is_silent() {
    let storage = memory_storage().await;
    let milk = storage.insert(NewItem::new("Milk")).await.expect("milk");

    let ghost = NewItem::new("Ghost").with_id(ItemId(milk.id.0 + 100));
    let updated = storage.update(&ghost).await.expect("update");
    assert!(!updated);
    assert_eq!(storage.list_all().await.expect("list"), vec![milk]);
}

#[tokio::test]
async fn delete_is_idempotent() {
    let storage = memory_storage().await;
    let milk = storage.insert(NewItem::new("Milk")).await.expect("milk");
    let bread = storage.insert(NewItem::new("Bread")).await.expect("bread");

    assert!(storage.delete(milk.id).await.expect("first delete"));
    assert!(!storage.delete(milk.id).await.expect("second delete"));
    assert!(!storage.delete(ItemId(999)).await.expect("missing delete"));

    assert_eq!(storage.list_all().await.expect("list"), vec![bread]);
}

#[tokio::test]
async fn ids_are_not_reused_after_delete() {
    let storage = memory_storage().await;
    let _first = storage.insert(NewItem::new("first")).await.expect("first");
    let second = storage.insert(NewItem::new("second")).await.expect("second");
    storage.delete(second.id).await.expect("delete");

    let third = storage.insert(NewItem::new("third")).await.expect("third");
    assert!(third.id > second.id);
}

#[tokio::test]
async fn insert_with_existing_id_replaces_row() {
    let storage = memory_storage().await;
    let milk = storage.insert(NewItem::new("Milk")).await.expect("milk");

    let replacement = ShoppingItem {
        id: milk.id,
        name: "Oat milk".into(),
        is_bought: true,
    };
    storage
        .insert_with_id(replacement.clone())
        .await
        .expect("replace");

    assert_eq!(storage.list_all().await.expect("list"), vec![replacement]);
}

#[test]
fn sqlite_path_ignores_memory_urls() {
    assert_eq!(sqlite_path("sqlite::memory:"), None);
    assert_eq!(sqlite_path("postgres://localhost/db"), None);
    assert_eq!(
        sqlite_path("sqlite://./data/shopping_db.sqlite?mode=rwc"),
        Some(PathBuf::from("./data/shopping_db.sqlite"))
    );
}
