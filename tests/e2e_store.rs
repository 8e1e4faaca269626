//! End-to-end tests for the store facade and entity CRUD side effects.
//!
//! Each test exercises the public surface: Store -> EntityHandle ->
//! MemoryProvider, checking the event chain and cleanup invariants.

use std::time::Instant;

use entidb::{
    json_record, EventFilter, ListOptions, MemoryProvider, RelateOptions, SchemaSource, Store,
};

fn blog_schema() -> SchemaSource {
    let mut source = SchemaSource::new();
    source.entity(
        "Post",
        [
            ("title", "string"),
            ("body", "markdown?"),
            ("author", "->Author.posts"),
        ],
    );
    source.entity("Author", [("name", "string"), ("posts", "<-Post.author")]);
    source
}

// ============================================================================
// 1. Create attaches $id/$type and appends both events, in order
// ============================================================================

#[tokio::test]
async fn test_create_event_chain_and_projection() {
    let store = Store::open_memory(&blog_schema()).unwrap();
    let post = store
        .entity("Post")
        .unwrap()
        .create(Some("p1"), json_record!({"title": "Hello"}))
        .await
        .unwrap();

    assert_eq!(post["$id"], "p1");
    assert_eq!(post["$type"], "Post");
    assert!(post.contains_key("createdAt"));
    assert!(post.contains_key("updatedAt"));

    let events = store
        .provider()
        .list_events(EventFilter::default())
        .await
        .unwrap();
    let names: Vec<&str> = events.iter().map(|e| e.event.as_str()).collect();
    assert_eq!(names, vec!["Post.created", "entity:created"]);

    // objectData carries the projection on both events.
    for event in &events {
        let data = event.object_data.as_ref().unwrap();
        assert_eq!(data["$id"], "p1");
        assert_eq!(data["$type"], "Post");
    }
}

// ============================================================================
// 2. Unknown entity types are refused by the schema-checked handle
// ============================================================================

#[tokio::test]
async fn test_unknown_type_is_refused() {
    let store = Store::open_memory(&blog_schema()).unwrap();
    assert!(store.entity("Ghost").is_err());
    assert!(store.entity("Post").is_ok());
}

// ============================================================================
// 3. Delete removes relations in both directions and artifacts
// ============================================================================

#[tokio::test]
async fn test_delete_cleans_relations_and_artifacts() {
    let store = Store::open_memory(&blog_schema()).unwrap();
    let db = store.provider();

    db.create("Author", Some("a1"), json_record!({"name": "Ada"}))
        .await
        .unwrap();
    db.create("Post", Some("p1"), json_record!({"title": "T"}))
        .await
        .unwrap();
    db.relate("Author", "a1", "posts", "Post", "p1", RelateOptions::default())
        .await
        .unwrap();
    db.relate("Post", "p1", "author", "Author", "a1", RelateOptions::default())
        .await
        .unwrap();

    assert!(db.delete("Post", "p1").await.unwrap());

    // No edges into or out of the deleted entity remain.
    assert!(db.related("Author", "a1", "posts").await.unwrap().is_empty());
    assert!(db.related("Post", "p1", "author").await.unwrap().is_empty());
    // Artifacts under Post/p1 are gone.
    assert!(db.list_artifacts("Post/p1").await.unwrap().is_empty());
    // Events were emitted for the delete.
    let deleted = db
        .list_events(EventFilter {
            event: Some("Post.deleted".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(deleted.len(), 1);
}

// ============================================================================
// 4. Update refreshes updatedAt, keeps createdAt
// ============================================================================

#[tokio::test]
async fn test_update_timestamps() {
    let store = Store::open_memory(&blog_schema()).unwrap();
    let handle = store.entity("Post").unwrap();
    let created = handle
        .create(Some("p1"), json_record!({"title": "v1"}))
        .await
        .unwrap();
    let updated = handle
        .update("p1", json_record!({"title": "v2"}))
        .await
        .unwrap();

    assert_eq!(created["createdAt"], updated["createdAt"]);
    assert!(updated["updatedAt"].as_str() >= created["updatedAt"].as_str());
    assert_eq!(updated["title"], "v2");
}

// ============================================================================
// 5. Oversized batches are rejected before any per-item work
// ============================================================================

#[tokio::test]
async fn test_batch_rejection_is_fast() {
    let db = MemoryProvider::new();
    let items: Vec<(Option<String>, entidb::Record)> =
        (0..100_000).map(|_| (None, entidb::Record::new())).collect();

    let start = Instant::now();
    let err = db.create_many("Post", items).await.unwrap_err();
    let elapsed = start.elapsed();

    assert!(matches!(err, entidb::Error::BatchTooLarge { .. }));
    assert!(elapsed.as_millis() < 100, "rejection took {elapsed:?}");
    assert!(db.list("Post", ListOptions::default()).await.unwrap().is_empty());
}

// ============================================================================
// 6. List over the handle respects schema typing and ordering
// ============================================================================

#[tokio::test]
async fn test_handle_list_and_search() {
    let store = Store::open_memory(&blog_schema()).unwrap();
    let posts = store.entity("Post").unwrap();
    for (id, title) in [("a", "Rust at scale"), ("b", "Cooking tips"), ("c", "Rust again")] {
        posts
            .create(Some(id), json_record!({"title": title}))
            .await
            .unwrap();
    }

    let all = posts.list(ListOptions::default()).await.unwrap();
    assert_eq!(all.len(), 3);

    let hits = posts
        .search("rust", entidb::SearchOptions::default())
        .await
        .unwrap();
    assert_eq!(hits.len(), 2);
    for hit in &hits {
        assert!(hit["$score"].as_f64().unwrap() > 0.0);
    }
}
