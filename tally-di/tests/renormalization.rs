//! Re-normalization sweep tests
//!
//! A published rule-set version replays observations from the observation
//! store without touching the parser. These tests cover the reference
//! reinterpretation scenario, the version trail, cursor-based resume, and
//! cancellation between records.

mod common;

use common::{day_first_ruleset, statement, test_pool, us_ruleset};
use chrono::NaiveDate;
use tally_common::events::{EventBus, PipelineEvent};
use tally_di::models::{ObservationKey, SourceSelector, SourceType, WorkUnit};
use tally_di::normalize::Normalizer;
use tally_di::pipeline::{Coordinator, SweepRequest, SweepRunner};
use tally_di::store;
use tally_di::store::canonical::UpsertPolicy;
use tally_di::store::sweeps::{SweepProgress, SweepState};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

async fn ingest_reference_document(pool: &sqlx::SqlitePool, source_id: Uuid) {
    store::rulesets::publish(pool, &us_ruleset(1)).await.unwrap();
    let coordinator = Coordinator::new(pool.clone(), EventBus::new(16));
    let work = coordinator
        .run_ingest(
            WorkUnit::ingest(source_id),
            statement(source_id, &[("01/02/2024", "(50.00)", "  Coffee  ")]),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(work.report.upserted, 1);
}

#[tokio::test]
async fn new_ruleset_reinterprets_date_and_keeps_both_versions() {
    let (pool, _tmp) = test_pool().await;
    let source_id = Uuid::new_v4();
    ingest_reference_document(&pool, source_id).await;

    // Under v1 (month-first) the record reads January 2nd
    let v1_current = store::canonical::current_for_observation(&pool, source_id, 0)
        .await
        .unwrap();
    assert_eq!(
        v1_current[0].record.posted_on,
        NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()
    );
    assert_eq!(v1_current[0].record.amount.minor_units, -5000);
    assert_eq!(v1_current[0].record.description, "Coffee");

    // Publish v2 (day-first) and sweep
    store::rulesets::publish(&pool, &day_first_ruleset(2)).await.unwrap();
    let runner = SweepRunner::new(pool.clone(), EventBus::new(16));
    let progress = runner
        .run(
            SweepRequest {
                ruleset_version: 2,
                selector: SourceSelector::Source(source_id),
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(progress.state, SweepState::Completed);
    assert_eq!(progress.processed, 1);
    assert_eq!(progress.failed, 0);

    // The current view reads February 1st under v2
    let current = store::canonical::current_for_observation(&pool, source_id, 0)
        .await
        .unwrap();
    assert_eq!(current.len(), 1);
    assert_eq!(current[0].record.ruleset_version, 2);
    assert_eq!(
        current[0].record.posted_on,
        NaiveDate::from_ymd_opt(2024, 2, 1).unwrap()
    );
    assert_eq!(current[0].record.amount.minor_units, -5000);
    assert_eq!(current[0].record.description, "Coffee");

    // Both interpretations remain retrievable, tagged with their versions
    let trail = store::canonical::records_for_observation(&pool, source_id, 0)
        .await
        .unwrap();
    assert_eq!(trail.len(), 2);
    assert_eq!(trail[0].record.ruleset_version, 2);
    assert!(trail[0].is_current);
    assert_eq!(trail[1].record.ruleset_version, 1);
    assert!(!trail[1].is_current);
    assert_ne!(
        trail[0].record.record_key, trail[1].record.record_key,
        "date reinterpretation moves the business key"
    );
}

#[tokio::test]
async fn sweep_instances_skip_extraction_states() {
    let (pool, _tmp) = test_pool().await;
    let source_id = Uuid::new_v4();
    ingest_reference_document(&pool, source_id).await;
    store::rulesets::publish(&pool, &day_first_ruleset(2)).await.unwrap();

    let event_bus = EventBus::new(64);
    let mut events = event_bus.subscribe();
    let runner = SweepRunner::new(pool.clone(), event_bus);
    runner
        .run(
            SweepRequest {
                ruleset_version: 2,
                selector: SourceSelector::Source(source_id),
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();

    // The per-document instance moves EXTRACTED -> NORMALIZING ->
    // COMPLETED and never touches PENDING or EXTRACTING
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let PipelineEvent::WorkStateChanged {
            old_state,
            new_state,
            ..
        } = event
        {
            seen.push((old_state, new_state));
        }
    }
    assert!(seen.contains(&("EXTRACTED".to_string(), "NORMALIZING".to_string())));
    assert!(seen.contains(&("NORMALIZING".to_string(), "COMPLETED".to_string())));
    assert!(seen
        .iter()
        .all(|(old, new)| old != "PENDING" && new != "EXTRACTING"));
}

#[tokio::test]
async fn completed_sweep_is_idempotent() {
    let (pool, _tmp) = test_pool().await;
    let source_id = Uuid::new_v4();
    ingest_reference_document(&pool, source_id).await;
    store::rulesets::publish(&pool, &day_first_ruleset(2)).await.unwrap();

    let runner = SweepRunner::new(pool.clone(), EventBus::new(16));
    let request = SweepRequest {
        ruleset_version: 2,
        selector: SourceSelector::Source(source_id),
    };

    let first = runner.run(request, CancellationToken::new()).await.unwrap();
    let trail_len_after_first = store::canonical::records_for_observation(&pool, source_id, 0)
        .await
        .unwrap()
        .len();

    let second = runner.run(request, CancellationToken::new()).await.unwrap();
    assert_eq!(second, first, "completed sweep re-runs are no-ops");

    let trail_len_after_second = store::canonical::records_for_observation(&pool, source_id, 0)
        .await
        .unwrap()
        .len();
    assert_eq!(trail_len_after_first, trail_len_after_second);
}

#[tokio::test]
async fn cancelled_sweep_keeps_cursor_and_resumes() {
    let (pool, _tmp) = test_pool().await;
    let source_id = Uuid::new_v4();

    store::rulesets::publish(&pool, &us_ruleset(1)).await.unwrap();
    let coordinator = Coordinator::new(pool.clone(), EventBus::new(16));
    let rows: Vec<(String, String, String)> = (0..6)
        .map(|i| {
            (
                format!("01/{:02}/2024", i + 1),
                format!("{}.00", i + 1),
                format!("txn {}", i),
            )
        })
        .collect();
    let row_refs: Vec<(&str, &str, &str)> = rows
        .iter()
        .map(|(d, a, s)| (d.as_str(), a.as_str(), s.as_str()))
        .collect();
    coordinator
        .run_ingest(
            WorkUnit::ingest(source_id),
            statement(source_id, &row_refs),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    store::rulesets::publish(&pool, &day_first_ruleset(2)).await.unwrap();
    let runner = SweepRunner::new(pool.clone(), EventBus::new(16));
    let request = SweepRequest {
        ruleset_version: 2,
        selector: SourceSelector::Source(source_id),
    };

    // Cancel before the first record boundary: nothing processed, the
    // sweep is marked cancelled and fully resumable
    let cancelled_token = CancellationToken::new();
    cancelled_token.cancel();
    let suspended = runner.run(request, cancelled_token).await.unwrap();
    assert_eq!(suspended.state, SweepState::Cancelled);
    assert_eq!(suspended.processed, 0);
    assert_eq!(suspended.cursor, None);

    // Resume with a live token; the sweep finishes the whole selector
    let finished = runner.run(request, CancellationToken::new()).await.unwrap();
    assert_eq!(finished.state, SweepState::Completed);
    assert_eq!(finished.processed, 6);
    assert_eq!(
        finished.cursor,
        Some(ObservationKey { source_id, ordinal: 5 })
    );

    for ordinal in 0..6 {
        let current = store::canonical::current_for_observation(&pool, source_id, ordinal)
            .await
            .unwrap();
        assert_eq!(current[0].record.ruleset_version, 2);
    }
}

#[tokio::test]
async fn resumed_sweep_continues_after_persisted_cursor() {
    let (pool, _tmp) = test_pool().await;
    let source_id = Uuid::new_v4();

    store::rulesets::publish(&pool, &us_ruleset(1)).await.unwrap();
    let coordinator = Coordinator::new(pool.clone(), EventBus::new(16));
    let rows: Vec<(String, String, String)> = (0..6)
        .map(|i| {
            (
                format!("01/{:02}/2024", i + 1),
                format!("{}.00", i + 1),
                format!("txn {}", i),
            )
        })
        .collect();
    let row_refs: Vec<(&str, &str, &str)> = rows
        .iter()
        .map(|(d, a, s)| (d.as_str(), a.as_str(), s.as_str()))
        .collect();
    coordinator
        .run_ingest(
            WorkUnit::ingest(source_id),
            statement(source_id, &row_refs),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    store::rulesets::publish(&pool, &day_first_ruleset(2)).await.unwrap();

    // Rebuild the state an interrupted sweep leaves behind: records 0-2
    // durably re-normalized, cursor pointing at the last of them
    let normalizer = Normalizer::new();
    let rules = store::rulesets::get(&pool, 2).await.unwrap().unwrap();
    for ordinal in 0..3 {
        let obs = store::observations::get(&pool, ObservationKey { source_id, ordinal })
            .await
            .unwrap()
            .unwrap();
        let record = normalizer.normalize(&obs, &rules).unwrap();
        store::canonical::upsert(&pool, &record, UpsertPolicy::Supersede)
            .await
            .unwrap();
        store::canonical::supersede_for_observation(&pool, source_id, ordinal, &record.record_key)
            .await
            .unwrap();
    }
    let selector = SourceSelector::Source(source_id);
    let mut interrupted = SweepProgress::new(2, selector);
    interrupted.cursor = Some(ObservationKey { source_id, ordinal: 2 });
    interrupted.processed = 3;
    interrupted.state = SweepState::Cancelled;
    store::sweeps::save(&pool, &interrupted).await.unwrap();

    // The resumed sweep only walks records 3-5
    let runner = SweepRunner::new(pool.clone(), EventBus::new(16));
    let finished = runner
        .run(
            SweepRequest {
                ruleset_version: 2,
                selector,
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(finished.state, SweepState::Completed);
    assert_eq!(finished.processed, 6, "3 before interruption + 3 resumed");

    for ordinal in 0..6 {
        let current = store::canonical::current_for_observation(&pool, source_id, ordinal)
            .await
            .unwrap();
        assert_eq!(current[0].record.ruleset_version, 2);
    }
}

#[tokio::test]
async fn selector_limits_sweep_to_matching_source_type() {
    let (pool, _tmp) = test_pool().await;
    store::rulesets::publish(&pool, &us_ruleset(1)).await.unwrap();
    let coordinator = Coordinator::new(pool.clone(), EventBus::new(16));

    let us_doc = Uuid::new_v4();
    coordinator
        .run_ingest(
            WorkUnit::ingest(us_doc),
            statement(us_doc, &[("01/02/2024", "1.00", "us txn")]),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    // A second document of a different source type
    let eu_doc = Uuid::new_v4();
    let mut eu_document = statement(eu_doc, &[]);
    eu_document.source_type = SourceType::EuBankCsv;
    eu_document.content = "date;amount;description\n01/02/2024;1.00;eu txn\n".to_string();
    coordinator
        .run_ingest(WorkUnit::ingest(eu_doc), eu_document, CancellationToken::new())
        .await
        .unwrap();

    store::rulesets::publish(&pool, &day_first_ruleset(2)).await.unwrap();
    let runner = SweepRunner::new(pool.clone(), EventBus::new(16));
    let progress = runner
        .run(
            SweepRequest {
                ruleset_version: 2,
                selector: SourceSelector::SourceType(SourceType::UsBankCsv),
            },
            CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(progress.processed, 1);

    // US document re-normalized, EU document untouched
    let us_current = store::canonical::current_for_observation(&pool, us_doc, 0)
        .await
        .unwrap();
    assert_eq!(us_current[0].record.ruleset_version, 2);

    let eu_current = store::canonical::current_for_observation(&pool, eu_doc, 0)
        .await
        .unwrap();
    assert_eq!(eu_current[0].record.ruleset_version, 1);
}

#[tokio::test]
async fn sweep_requires_a_published_ruleset() {
    let (pool, _tmp) = test_pool().await;
    let runner = SweepRunner::new(pool.clone(), EventBus::new(16));

    let err = runner
        .run(
            SweepRequest {
                ruleset_version: 42,
                selector: SourceSelector::All,
            },
            CancellationToken::new(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, tally_common::Error::RuleSet(_)));
}
