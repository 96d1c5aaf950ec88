use festival_bootstrap::db::{Database, run_migrations};
use festival_bootstrap::error::LoaderError;
use festival_bootstrap::loader::coordinator::EVENTS_TABLE;
use festival_bootstrap::loader::{BootstrapOptions, Bootstrapper, TransactionOptions};
use festival_bootstrap::models::{BootstrapConfig, JsonFileSource, StaticSource};
use festival_bootstrap::test_support::{TestDatabase, TestFixtures, sample_config, sample_config_json};
use std::io::Write;

#[tokio::test]
async fn missing_config_file_exits_with_failure() {
    let db = TestDatabase::new().await;
    let loader = Bootstrapper::new(db.database(), BootstrapOptions::default());

    let run = loader.run(&JsonFileSource::new("/nonexistent/festival.json")).await;

    assert_eq!(run.exit_code(), 1);
    assert!(matches!(run.outcome, Err(LoaderError::Config(_))));
    assert!(run.summary().contains("failed to read"));
    assert_eq!(run.stats.queries, 0);
}

#[tokio::test]
async fn malformed_config_file_exits_with_failure() {
    let db = TestDatabase::new().await;
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "{{\"events\": [").unwrap();

    let run = Bootstrapper::new(db.database(), BootstrapOptions::default())
        .run(&JsonFileSource::new(file.path()))
        .await;

    assert_eq!(run.exit_code(), 1);
    assert!(run.error_message().unwrap().contains("failed to parse"));
}

#[tokio::test]
async fn config_file_round_trip_loads() {
    let db = TestDatabase::new().await;
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "{}", sample_config_json()).unwrap();

    let run = Bootstrapper::new(db.database(), BootstrapOptions::default())
        .run(&JsonFileSource::new(file.path()))
        .await;

    assert_eq!(run.exit_code(), 0, "{:?}", run.error_message());
    assert_eq!(TestFixtures::new(&db).count_rows(EVENTS_TABLE).await, 2);
}

#[tokio::test]
async fn failure_mid_load_rolls_back_earlier_steps() {
    let db = TestDatabase::new().await;
    let mut json = sample_config_json();
    json["admin_access"][1]["events"] = serde_json::json!(["no-such-event"]);
    let config: BootstrapConfig = serde_json::from_value(json).unwrap();

    let run = Bootstrapper::new(db.database(), BootstrapOptions::default())
        .run(&StaticSource(config))
        .await;

    assert_eq!(run.exit_code(), 1);
    assert!(matches!(run.outcome, Err(LoaderError::Validation(_))));
    // events and ticket types were written before the grant failed
    assert!(run.stats.inserts > 0);
    assert_eq!(TestFixtures::new(&db).count_rows(EVENTS_TABLE).await, 0);
}

#[tokio::test]
async fn integrity_violation_rolls_back_the_load() {
    let db = TestDatabase::new().await;
    let fixtures = TestFixtures::new(&db);
    fixtures.execute("PRAGMA foreign_keys = OFF").await;
    fixtures
        .execute("INSERT INTO ticket_types (event_id, name, price) VALUES (999, 'Orphan', 1.0)")
        .await;
    fixtures.execute("PRAGMA foreign_keys = ON").await;

    let run = Bootstrapper::new(db.database(), BootstrapOptions::default())
        .run(&StaticSource(sample_config()))
        .await;

    assert_eq!(run.exit_code(), 1);
    match &run.outcome {
        Err(LoaderError::IntegrityFailure { failures, first }) => {
            assert_eq!(*failures, 1);
            assert!(first.contains("ticket_types.event_id"), "{first}");
        }
        other => panic!("expected integrity failure, got {other:?}"),
    }
    assert_eq!(fixtures.count_rows(EVENTS_TABLE).await, 0);
    assert_eq!(fixtures.count_rows("ticket_types").await, 1);
}

#[tokio::test]
async fn concurrent_bootstrap_is_rejected_as_nested() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}", dir.path().join("festival.db").display());
    let db = Database::connect(&url, 4).await.unwrap();
    run_migrations(db.pool()).await.unwrap();

    let held = db
        .coordinator()
        .begin(TransactionOptions::default())
        .await
        .unwrap();

    let run = Bootstrapper::new(db.clone(), BootstrapOptions::default())
        .run(&StaticSource(sample_config()))
        .await;
    assert!(matches!(run.outcome, Err(LoaderError::NestedTransaction)));
    assert!(run.summary().contains("Cannot start nested transaction"));

    held.rollback().await.unwrap();

    let retried = Bootstrapper::new(db.clone(), BootstrapOptions::default())
        .run(&StaticSource(sample_config()))
        .await;
    assert_eq!(retried.exit_code(), 0, "{:?}", retried.error_message());
    db.close().await;
}
