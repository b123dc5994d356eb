//! Integration tests for the orchestrator: config-built registry, persistent
//! indexes and image writes against a mock Danbooru instance.

use std::collections::BTreeMap;

use harvester_core::config::{HarvesterConfig, ProcessorSettings, RetrievalSettings};
use harvester_core::{HarvestError, Harvester, RetrievalContext, Rule, Schema, WriteOptions};
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

mod support;
use support::socket_guard::start_mock_server_or_skip;

fn config_for(server: &MockServer, dir: &TempDir) -> HarvesterConfig {
    let mut processors = BTreeMap::new();
    processors.insert(
        "danbooru".to_string(),
        ProcessorSettings {
            base_url: Some(server.uri()),
            ..ProcessorSettings::default()
        },
    );
    HarvesterConfig {
        index_dir: Some(dir.path().join("indexes")),
        retrieval: RetrievalSettings {
            max_consecutive_failures: 2,
            page_attempts: 1,
            attempt_delay_ms: 0,
            rate_limit_cooldown_secs: 0,
            page_delay_ms: 0,
            ..RetrievalSettings::default()
        },
        processors,
        ..HarvesterConfig::default()
    }
}

fn post(server: &MockServer, id: u64, md5: &str) -> serde_json::Value {
    json!({
        "id": id,
        "md5": md5,
        "file_url": format!("{}/data/{md5}.jpg", server.uri()),
    })
}

async fn mount_listing(server: &MockServer, page: &str, body: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path("/posts.json"))
        .and(query_param("page", page))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_second_run_finds_nothing_and_leaves_index_untouched() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    let dir = TempDir::new().unwrap();
    mount_listing(&server, "1", json!([post(&server, 1, "aa01"), post(&server, 2, "bb02")])).await;
    mount_listing(&server, "2", json!([])).await;

    let harvester = Harvester::from_config(&config_for(&server, &dir)).unwrap();
    let schema = Schema::new("cats", "danbooru");

    let first = harvester.retrieve(&schema, &RetrievalContext::new()).await.unwrap();
    assert_eq!(first.len(), 2);

    let index_path = harvester.store().path_for("danbooru", "cats");
    let stored = std::fs::read(&index_path).unwrap();
    let modified = std::fs::metadata(&index_path).unwrap().modified().unwrap();

    let second = harvester.retrieve(&schema, &RetrievalContext::new()).await.unwrap();
    assert!(second.is_empty());
    assert_eq!(std::fs::read(&index_path).unwrap(), stored);
    assert_eq!(
        std::fs::metadata(&index_path).unwrap().modified().unwrap(),
        modified
    );

    let index = harvester.load_index("danbooru", "cats").await.unwrap();
    assert_eq!(index.owner(), Some("danbooru"));
    assert_eq!(index.len(), 2);
}

#[tokio::test]
async fn test_padded_query_and_processor_id_share_one_index() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    let dir = TempDir::new().unwrap();
    mount_listing(&server, "1", json!([post(&server, 1, "aa01"), post(&server, 2, "bb02")])).await;
    mount_listing(&server, "2", json!([])).await;

    let harvester = Harvester::from_config(&config_for(&server, &dir)).unwrap();
    let first = harvester
        .retrieve(&Schema::new("cats", "danbooru"), &RetrievalContext::new())
        .await
        .unwrap();
    assert_eq!(first.len(), 2);

    let second = harvester
        .retrieve(&Schema::new("cats ", " danbooru "), &RetrievalContext::new())
        .await
        .unwrap();
    assert!(second.is_empty());

    let stored: Vec<_> = std::fs::read_dir(dir.path().join("indexes").join("danbooru"))
        .unwrap()
        .collect();
    assert_eq!(stored.len(), 1);
    let index = harvester.load_index("danbooru", "cats ").await.unwrap();
    assert_eq!(index.id(), "cats");
    assert_eq!(index.len(), 2);
    assert!(index.entries().iter().all(|image| image.tag == "cats"));
}

#[tokio::test]
async fn test_fatal_run_keeps_first_pages_for_next_time() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    let dir = TempDir::new().unwrap();
    mount_listing(&server, "1", json!([post(&server, 1, "aa01")])).await;
    Mock::given(method("GET"))
        .and(path("/posts.json"))
        .and(query_param("page", "2"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let harvester = Harvester::from_config(&config_for(&server, &dir)).unwrap();
    let err = harvester
        .retrieve(&Schema::new("cats", "danbooru"), &RetrievalContext::new())
        .await
        .unwrap_err();

    assert!(matches!(err, HarvestError::Process(ref inner) if inner.is_fatal()));
    assert_eq!(err.partial_images().len(), 1);
    let index = harvester.load_index("danbooru", "cats").await.unwrap();
    assert_eq!(index.len(), 1);
}

#[tokio::test]
async fn test_rule_reports_unknown_processor_with_suggestion() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    let dir = TempDir::new().unwrap();
    mount_listing(&server, "1", json!([post(&server, 1, "aa01")])).await;
    mount_listing(&server, "2", json!([])).await;

    let harvester = Harvester::from_config(&config_for(&server, &dir)).unwrap();
    let rule = Rule::new("cats", ["danbooru", "danboru"]);
    let outcomes = harvester
        .retrieve_rule(&rule, &RetrievalContext::new())
        .await
        .unwrap();

    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[0].result.as_ref().unwrap().len(), 1);
    match &outcomes[1].result {
        Err(HarvestError::ProcessorNotFound { suggestion, .. }) => {
            assert_eq!(suggestion.as_deref(), Some("danbooru"));
        }
        other => panic!("expected not found, got {other:?}"),
    }
}

#[tokio::test]
async fn test_new_images_are_written_with_processor_filenames() {
    let Some(server) = start_mock_server_or_skip().await else {
        return;
    };
    let dir = TempDir::new().unwrap();
    mount_listing(&server, "1", json!([post(&server, 1, "aa01"), post(&server, 2, "bb02")])).await;
    mount_listing(&server, "2", json!([])).await;
    Mock::given(method("GET"))
        .and(path("/data/aa01.jpg"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"first".to_vec()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/data/bb02.jpg"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let harvester = Harvester::from_config(&config_for(&server, &dir)).unwrap();
    let images = harvester
        .retrieve(&Schema::new("cats", "danbooru"), &RetrievalContext::new())
        .await
        .unwrap();
    let out = dir.path().join("out");

    let report = harvester
        .write_images_to_file(
            &images,
            &out,
            WriteOptions {
                overwrite: false,
                mkdirs: true,
            },
        )
        .await
        .unwrap();

    assert_eq!(report.written, 1);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(std::fs::read(out.join("aa01.jpg")).unwrap(), b"first");
    assert!(!out.join("bb02.jpg").exists());
}
