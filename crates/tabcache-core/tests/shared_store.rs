mod common;

use std::sync::Arc;

use chrono::Duration as ChronoDuration;
use serde_json::json;
use tabcache_core::testing::{json_item, text_item, ManualClock, StaticOrigin};
use tabcache_core::{
    CacheError, Content, ContentCache, ContentPatch, FileStore, MemoryStore, Storage, SyncBus,
    TabId, WriteOutcome,
};

use common::{config, engine, epoch};

struct Tabs {
    store: Arc<MemoryStore>,
    origin: Arc<StaticOrigin>,
    clock: Arc<ManualClock>,
    a: ContentCache,
    b: ContentCache,
}

fn two_tabs(origin: StaticOrigin) -> Tabs {
    let store = Arc::new(MemoryStore::new());
    let origin = Arc::new(origin);
    let clock = Arc::new(ManualClock::new(epoch()));
    let bus = SyncBus::default();
    let tab = |name: &str| {
        ContentCache::builder(store.clone(), origin.clone())
            .config(config())
            .clock(clock.clone())
            .bus(bus.clone())
            .tab_id(TabId::from(name))
            .init()
            .unwrap()
    };
    let a = tab("tab-a");
    let b = tab("tab-b");
    Tabs {
        store,
        origin,
        clock,
        a,
        b,
    }
}

#[tokio::test]
async fn test_concurrent_disjoint_writes_merge() {
    let tabs = two_tabs(StaticOrigin::new().with_item(json_item(
        "doc",
        json!({"title": "Hello", "body": "World", "tags": []}),
    )));
    tabs.a.get("doc").await.unwrap();
    tabs.b.get("doc").await.unwrap();

    // Advance the record to version 3 before the race
    tabs.a.update("doc", 1, &ContentPatch::new().set("tags", json!(["a"]))).unwrap();
    tabs.a.update("doc", 2, &ContentPatch::new().set("tags", json!(["a", "b"]))).unwrap();
    let base = tabs.b.peek("doc").unwrap().unwrap().version;
    assert_eq!(base, 3);

    let first = tabs.a.update("doc", 3, &ContentPatch::new().set("title", json!("Hi"))).unwrap();
    let second = tabs.b.update("doc", 3, &ContentPatch::new().set("body", json!("Everyone"))).unwrap();

    assert_eq!(first, WriteOutcome::Committed { version: 4 });
    assert_eq!(
        second,
        WriteOutcome::Merged {
            version: 5,
            merged_fields: vec!["body".to_string()]
        }
    );

    let record = tabs.a.peek("doc").unwrap().unwrap();
    assert_eq!(record.version, 5);
    assert_eq!(
        record.content,
        Content::Json(json!({"title": "Hi", "body": "Everyone", "tags": ["a", "b"]}))
    );
}

#[tokio::test]
async fn test_concurrent_same_field_writes_conflict() {
    let tabs = two_tabs(StaticOrigin::new().with_item(json_item("doc", json!({"title": "Hello"}))));
    tabs.a.get("doc").await.unwrap();

    tabs.a.update("doc", 1, &ContentPatch::new().set("title", json!("From A"))).unwrap();
    let outcome = tabs
        .b
        .update("doc", 1, &ContentPatch::new().set("title", json!("From B")))
        .unwrap();

    let (version, conflicts) = match outcome {
        WriteOutcome::Conflicted { version, conflicts } => (version, conflicts),
        other => panic!("expected a conflict, got {:?}", other),
    };
    assert_eq!(version, 2);
    assert_eq!(conflicts.len(), 1);
    assert_eq!(conflicts[0].field, "title");
    assert_eq!(conflicts[0].stored, Some(json!("From A")));
    assert_eq!(conflicts[0].incoming, Some(json!("From B")));

    // The stored value is kept, never guessed over
    let record = tabs.b.peek("doc").unwrap().unwrap();
    assert_eq!(record.content, Content::Json(json!({"title": "From A"})));
}

#[tokio::test]
async fn test_parallel_tabs_never_lose_field_writes() {
    const WRITES: usize = 100;
    let tabs = two_tabs(StaticOrigin::new().with_item(json_item("doc", json!({"title": "shared"}))));
    tabs.a.get("doc").await.unwrap();

    std::thread::scope(|scope| {
        for (name, tab) in [("a", &tabs.a), ("b", &tabs.b)] {
            scope.spawn(move || {
                for i in 0..WRITES {
                    let base = tab.peek("doc").unwrap().unwrap().version;
                    let patch = ContentPatch::new().set(format!("{}{}", name, i), json!(i));
                    let outcome = tab.update("doc", base, &patch).unwrap();
                    assert!(!outcome.is_conflicted(), "disjoint write conflicted: {:?}", outcome);
                }
            });
        }
    });

    let record = tabs.a.peek("doc").unwrap().unwrap();
    assert_eq!(record.version, 1 + 2 * WRITES as u64);
    let fields = record.content.fields();
    assert_eq!(fields.len(), 1 + 2 * WRITES);
    for i in 0..WRITES {
        assert_eq!(fields.get(&format!("a{}", i)), Some(&json!(i)));
        assert_eq!(fields.get(&format!("b{}", i)), Some(&json!(i)));
    }
}

#[tokio::test]
async fn test_other_tab_sees_new_records() {
    let tabs = two_tabs(
        StaticOrigin::new()
            .with_item(text_item("x", "one"))
            .with_item(text_item("y", "two")),
    );
    tabs.a.get("x").await.unwrap();
    tabs.b.get("y").await.unwrap();

    // Neither tab's index write lost the other's record
    assert_eq!(tabs.a.cached_ids().unwrap(), vec!["x", "y"]);
    assert_eq!(tabs.b.cached_ids().unwrap(), vec!["x", "y"]);

    tabs.origin.set_offline(true);
    let lookup = tabs.b.get("x").await.unwrap();
    assert_eq!(lookup.record().unwrap().content, Content::Text("one".into()));

    tabs.b.invalidate("x").unwrap();
    assert!(tabs.a.get("x").await.unwrap().is_missing());
}

#[tokio::test]
async fn test_index_rebuilt_from_records_on_init() {
    let tabs = two_tabs(
        StaticOrigin::new()
            .with_item(text_item("x", "one").with_category("notes"))
            .with_item(text_item("y", "two")),
    );
    tabs.a.get("x").await.unwrap();
    tabs.clock.advance(ChronoDuration::minutes(1));
    tabs.a.get("y").await.unwrap();

    tabs.store.set("tabcache_index", b"{not an index").unwrap();
    tabs.store.set("tabcache_content_z", b"[]").unwrap();

    let fresh = engine(tabs.store.clone(), tabs.origin.clone(), tabs.clock.clone(), config());
    assert_eq!(fresh.cached_ids().unwrap(), vec!["x", "y"]);
    assert_eq!(fresh.get_by_category("notes").unwrap().len(), 1);
    assert!(tabs.store.get("tabcache_content_z").unwrap().is_none());

    let metadata = fresh.metadata().unwrap();
    assert_eq!(metadata.total_items, 2);
    assert_eq!(metadata.stats.corruptions, 1);
}

#[tokio::test]
async fn test_maintenance_reconciles_storage_and_totals() {
    let tabs = two_tabs(
        StaticOrigin::new()
            .with_item(text_item("keep", "fresh"))
            .with_item(text_item("old", "stale"))
            .with_item(text_item("lost", "gone")),
    );
    for id in ["keep", "old", "lost"] {
        tabs.a.get(id).await.unwrap();
    }
    tabs.a.invalidate("old").unwrap();

    // Record deleted behind the index's back, and one written without it
    tabs.store.delete("tabcache_content_lost").unwrap();
    let stray = tabs.b.peek("keep").unwrap().unwrap();
    let mut orphan = stray.clone();
    orphan.id = "orphan".to_string();
    tabs.store
        .set("tabcache_content_orphan", &serde_json::to_vec(&orphan).unwrap())
        .unwrap();

    let report = tabs.a.maintain().unwrap();
    assert_eq!(report.adopted, vec!["orphan"]);
    assert_eq!(report.dangling, 1);
    assert_eq!(report.expired, vec!["old"]);
    assert!(report.evicted.is_empty());

    let metadata = tabs.a.metadata().unwrap();
    assert_eq!(metadata.total_items, 2);
    assert_eq!(metadata.total_size_bytes, stray.size_bytes * 2);
    assert_eq!(metadata.last_cleanup_at, Some(epoch()));
    assert!(tabs.store.get("tabcache_content_old").unwrap().is_none());

    // Tab b picks up the reconciled index
    let mut ids = tabs.b.cached_ids().unwrap();
    ids.sort();
    assert_eq!(ids, vec!["keep", "orphan"]);
}

#[tokio::test]
async fn test_maintenance_enforces_item_budget() {
    let origin = StaticOrigin::new();
    for i in 0..5 {
        origin.insert(format!("r{}", i), text_item(&format!("r{}", i), "body"));
    }
    let store = Arc::new(MemoryStore::new());
    let origin = Arc::new(origin);
    let clock = Arc::new(ManualClock::new(epoch()));
    let wide = engine(store.clone(), origin.clone(), clock.clone(), config());
    for i in 0..5 {
        wide.get(&format!("r{}", i)).await.unwrap();
    }

    let narrow = engine(store, origin, clock, config().with_max_items(3));
    let report = narrow.maintain().unwrap();
    assert_eq!(report.evicted, vec!["r0", "r1"]);
    assert_eq!(narrow.cached_ids().unwrap(), vec!["r2", "r3", "r4"]);
    assert_eq!(narrow.stats().evictions, 2);
}

#[tokio::test]
async fn test_file_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let origin = Arc::new(StaticOrigin::new().with_item(json_item("cfg", json!({"theme": "dark"}))));
    let clock = Arc::new(ManualClock::new(epoch()));

    {
        let store = Arc::new(FileStore::new(dir.path()).unwrap());
        let cache = engine(store, origin.clone(), clock.clone(), config());
        cache.get("cfg").await.unwrap();
        cache.teardown().unwrap();
    }

    origin.set_offline(true);
    let store = Arc::new(FileStore::new(dir.path()).unwrap());
    let cache = engine(store, origin, clock, config());
    let lookup = cache.get("cfg").await.unwrap();
    assert_eq!(
        lookup.into_record().unwrap().content,
        Content::Json(json!({"theme": "dark"}))
    );
    assert_eq!(cache.stats().hits, 2);
}

#[tokio::test]
async fn test_teardown_keeps_other_tabs_records_indexed() {
    let tabs = two_tabs(
        StaticOrigin::new()
            .with_item(text_item("x", "one"))
            .with_item(text_item("y", "two")),
    );
    tabs.a.get("x").await.unwrap();
    tabs.b.get("y").await.unwrap();
    tabs.a.teardown().unwrap();

    let fresh = engine(tabs.store.clone(), tabs.origin.clone(), tabs.clock.clone(), config());
    assert_eq!(fresh.cached_ids().unwrap(), vec!["x", "y"]);
}

#[tokio::test]
async fn test_reset_leaves_other_namespaces_alone() {
    let store = Arc::new(MemoryStore::new());
    let origin = Arc::new(StaticOrigin::new().with_item(text_item("a", "one")));
    let clock = Arc::new(ManualClock::new(epoch()));
    let foreign = ["app_v2_content_a", "app_v2_index", "app_v2_metadata"];
    for key in foreign {
        store.set(key, b"{}").unwrap();
    }

    let app = engine(store.clone(), origin, clock, config().with_namespace("app"));
    app.get("a").await.unwrap();
    app.reset().unwrap();

    assert_eq!(store.keys("app_").unwrap(), foreign);
}

#[test]
fn test_namespace_with_separator_is_rejected() {
    let err = ContentCache::builder(Arc::new(MemoryStore::new()), Arc::new(StaticOrigin::new()))
        .config(config().with_namespace("app_v2"))
        .init()
        .unwrap_err();
    assert!(matches!(err, CacheError::InvalidConfig(_)));
}

#[tokio::test]
async fn test_reset_clears_shared_namespace() {
    let tabs = two_tabs(StaticOrigin::new().with_item(text_item("x", "one")));
    tabs.a.get("x").await.unwrap();

    tabs.b.reset().unwrap();
    assert!(tabs.store.is_empty());
    assert!(tabs.a.cached_ids().unwrap().is_empty());
}
