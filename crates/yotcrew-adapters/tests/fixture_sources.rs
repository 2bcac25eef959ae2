use std::fs;

use tempfile::tempdir;
use yotcrew_adapters::{load_fixture_sources, SourcePlugin, SourceRegistry};
use yotcrew_core::Filters;

#[tokio::test]
async fn fixture_directory_loads_sorted_sources() {
    let dir = tempdir().expect("tempdir");
    fs::write(
        dir.path().join("b_crewseekers.json"),
        r#"{
            "source_id": "crewseekers",
            "base_url": "https://crewseekers.example.com",
            "filters": ["location"],
            "pages": [
                {"kind": "records", "records": [{"id": "c1", "title": "Deckhand"}]},
                {"kind": "transient_failure", "message": "503"}
            ]
        }"#,
    )
    .expect("write fixture");
    fs::write(
        dir.path().join("a_bluewater.json"),
        r#"{
            "source_id": "bluewater",
            "base_url": "https://bluewater.example.com",
            "reachable": false,
            "pages": []
        }"#,
    )
    .expect("write fixture");
    fs::write(dir.path().join("notes.txt"), "ignored").expect("write note");

    let plugins = load_fixture_sources(dir.path()).expect("load fixtures");
    let mut registry = SourceRegistry::new();
    for plugin in plugins {
        registry
            .register(std::sync::Arc::new(plugin))
            .expect("unique ids");
    }
    assert_eq!(registry.source_ids(), vec!["bluewater", "crewseekers"]);

    let bluewater = registry.get("bluewater").expect("registered");
    assert!(!bluewater.probe().await);

    let crewseekers = registry.get("crewseekers").expect("registered");
    assert!(crewseekers.probe().await);
    assert!(crewseekers.declared_filters().contains("location"));
    let page = crewseekers
        .fetch_page(0, &Filters::new())
        .await
        .expect("first page");
    assert_eq!(page.len(), 1);
    let err = crewseekers
        .fetch_page(1, &Filters::new())
        .await
        .expect_err("scripted failure");
    assert!(err.is_transient());
}

#[test]
fn malformed_fixture_reports_path() {
    let dir = tempdir().expect("tempdir");
    fs::write(dir.path().join("broken.json"), "{ not json").expect("write");
    let err = match load_fixture_sources(dir.path()) {
        Ok(_) => panic!("broken fixture must fail"),
        Err(err) => err,
    };
    assert!(format!("{err:#}").contains("broken.json"));
}
