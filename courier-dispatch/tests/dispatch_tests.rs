//! End-to-end dispatch runs against the in-memory ledger and a scripted
//! transport

#![allow(clippy::expect_used, clippy::unwrap_used)]

mod support;

use std::sync::Arc;

use ahash::AHashSet;
use courier_dispatch::{
    ColumnConfig, DispatchError, DispatchSession, RecipientLedger, Rotation, RotationPolicy,
    RotationReason, Rotator, ThresholdRange,
};
use courier_ledger::{
    AccountLedger, DeliveryLog, DeliveryStatus, IdentityStatus, Ledger, MemoryLedger, SqliteLedger,
};
use pretty_assertions::assert_eq;
use support::{BrokenUsageLedger, MockTransport, address, config, engine, progress_file, seed};

async fn load(path: &std::path::Path) -> RecipientLedger {
    RecipientLedger::load(path, &ColumnConfig::default())
        .await
        .expect("failed to load progress file")
}

#[tokio::test]
async fn test_fully_sent_file_sends_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let path = progress_file(
        dir.path(),
        &[("a@example.com", true), ("b@example.com", true), ("c@example.com", true)],
    )
    .await;

    let ledger = Arc::new(MemoryLedger::new());
    seed(ledger.as_ref(), &[("sender@example.com", 0, 100)]).await;
    let transport = MockTransport::accepting();

    let mut recipients = load(&path).await;
    let report = engine(ledger.clone(), transport.clone(), config(RotationPolicy::Fair, 5))
        .run(&mut recipients)
        .await
        .unwrap();

    assert_eq!(report.sent, 0);
    assert_eq!(report.failed, 0);
    assert_eq!(report.skipped, 3);
    assert!(ledger.records().is_empty());
    assert!(transport.binds().is_empty());
    assert_eq!(transport.attempts(), 0);
}

#[tokio::test]
async fn test_sends_and_marks_every_pending_recipient() {
    let dir = tempfile::tempdir().unwrap();
    let path = progress_file(
        dir.path(),
        &[
            ("a@example.com", false),
            ("b@example.com", true),
            ("c@example.com", false),
            ("A@Example.com", false),
            ("d@example.com", false),
        ],
    )
    .await;

    let ledger = Arc::new(MemoryLedger::new());
    seed(ledger.as_ref(), &[("sender@example.com", 0, 100)]).await;
    let transport = MockTransport::accepting();

    let mut recipients = load(&path).await;
    let report = engine(ledger.clone(), transport.clone(), config(RotationPolicy::Fair, 2))
        .run(&mut recipients)
        .await
        .unwrap();

    assert_eq!(report.sent, 3);
    assert_eq!(report.skipped, 2);
    assert!(report.is_complete());

    let sender = address("sender@example.com");
    let records = ledger.records();
    assert_eq!(records.len(), 3);
    assert!(records.iter().all(|r| r.status == DeliveryStatus::Success));
    assert!(records.iter().all(|r| r.from_identity == sender));
    assert!(records
        .iter()
        .all(|r| r.source_batch_file.as_deref() == Some("recipients.csv")));
    assert!(records.iter().all(|r| r.provider_message_id.is_some()));

    assert_eq!(ledger.get(&sender).await.unwrap().unwrap().sent_count, 3);
    assert_eq!(transport.closes(), vec![sender]);

    let reloaded = load(&path).await;
    assert!(reloaded.entries().iter().all(|entry| entry.already_sent));
    assert_eq!(reloaded.entries()[2].fields()[0], "Person 2");
}

#[tokio::test]
async fn test_rate_limited_identity_is_replaced_and_recipient_retried() {
    let dir = tempfile::tempdir().unwrap();
    let path = progress_file(dir.path(), &[("r@example.com", false)]).await;

    let ledger = Arc::new(MemoryLedger::new());
    // A is least used, so it is picked first.
    seed(
        ledger.as_ref(),
        &[("a@example.com", 0, 100), ("b@example.com", 1, 100)],
    )
    .await;
    let transport = MockTransport::builder()
        .rate_limited("a@example.com")
        .build();

    for policy in [RotationPolicy::Simple, RotationPolicy::Fair] {
        ledger.reset_all().await.unwrap();
        let before = ledger.records().len();
        tokio::fs::write(&path, "E-mail 1 - Value\nr@example.com\n")
            .await
            .unwrap();

        let mut recipients = load(&path).await;
        let report = engine(ledger.clone(), transport.clone(), config(policy, 5))
            .run(&mut recipients)
            .await
            .unwrap();

        assert_eq!(report.sent, 1, "{policy:?}");
        assert_eq!(report.failed, 0, "{policy:?}");

        let records = &ledger.records()[before..];
        assert_eq!(records.len(), 1, "{policy:?}");
        assert_eq!(records[0].from_identity, address("b@example.com"));
        assert_eq!(records[0].status, DeliveryStatus::Success);

        let a = ledger.get(&address("a@example.com")).await.unwrap().unwrap();
        assert!(a.rate_limited);
        assert_eq!(a.status, IdentityStatus::RateLimited);
        assert_eq!(a.sent_count, 0);
    }
}

#[tokio::test]
async fn test_every_identity_rate_limited_aborts_run() {
    let dir = tempfile::tempdir().unwrap();
    let path = progress_file(
        dir.path(),
        &[("r1@example.com", false), ("r2@example.com", false)],
    )
    .await;

    let ledger = Arc::new(MemoryLedger::new());
    seed(
        ledger.as_ref(),
        &[("a@example.com", 0, 100), ("b@example.com", 0, 100)],
    )
    .await;
    let transport = MockTransport::builder()
        .rate_limited("a@example.com")
        .rate_limited("b@example.com")
        .build();

    let mut recipients = load(&path).await;
    let report = engine(ledger.clone(), transport.clone(), config(RotationPolicy::Fair, 5))
        .run(&mut recipients)
        .await
        .unwrap();

    assert_eq!(report.sent, 0);
    assert_eq!(report.failed, 2);
    assert!(report.aborted.is_some());
    // Throttling produces no delivery records.
    assert!(ledger.records().is_empty());
    assert!(ledger.find_available().await.unwrap().is_none());
}

#[tokio::test]
async fn test_permanent_failure_is_recorded_and_run_continues() {
    let dir = tempfile::tempdir().unwrap();
    let path = progress_file(
        dir.path(),
        &[
            ("good1@example.com", false),
            ("bad@example.com", false),
            ("good2@example.com", false),
        ],
    )
    .await;

    let ledger = Arc::new(MemoryLedger::new());
    seed(ledger.as_ref(), &[("sender@example.com", 0, 100)]).await;
    let transport = MockTransport::builder()
        .failing_recipient("bad@example.com", "550 5.1.1 User unknown")
        .build();

    let mut recipients = load(&path).await;
    let report = engine(ledger.clone(), transport.clone(), config(RotationPolicy::Simple, 1))
        .run(&mut recipients)
        .await
        .unwrap();

    assert_eq!(report.sent, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.failures[0].recipient, address("bad@example.com"));
    assert!(report.failures[0].error.contains("User unknown"));

    let failed: Vec<_> = ledger
        .records()
        .into_iter()
        .filter(|r| r.status == DeliveryStatus::Failed)
        .collect();
    assert_eq!(failed.len(), 1);
    assert!(failed[0].error_message.as_deref().unwrap().contains("550"));

    let sender = ledger
        .get(&address("sender@example.com"))
        .await
        .unwrap()
        .unwrap();
    assert!(!sender.rate_limited);
    assert_eq!(sender.sent_count, 2);

    let reloaded = load(&path).await;
    let markers: Vec<_> = reloaded.entries().iter().map(|e| e.already_sent).collect();
    assert_eq!(markers, vec![true, false, true]);
}

#[tokio::test]
async fn test_quota_is_never_exceeded_within_a_batch() {
    let dir = tempfile::tempdir().unwrap();
    let recipients: Vec<String> = (0..5).map(|n| format!("r{n}@example.com")).collect();
    let rows: Vec<(&str, bool)> = recipients.iter().map(|r| (r.as_str(), false)).collect();
    let path = progress_file(dir.path(), &rows).await;

    let ledger = Arc::new(MemoryLedger::new());
    seed(ledger.as_ref(), &[("sender@example.com", 0, 2)]).await;
    let transport = MockTransport::accepting();

    let mut progress = load(&path).await;
    let report = engine(ledger.clone(), transport.clone(), config(RotationPolicy::Fair, 5))
        .run(&mut progress)
        .await
        .unwrap();

    assert_eq!(report.sent, 2);
    assert_eq!(report.failed, 3);
    assert_eq!(report.aborted.as_deref(), Some("no available accounts"));
    assert_eq!(transport.delivered().len(), 2);

    let sender = ledger
        .get(&address("sender@example.com"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(sender.sent_count, 2);

    let reloaded = load(&path).await;
    assert_eq!(reloaded.pending().count(), 3);
}

#[tokio::test]
async fn test_resumed_run_matches_uninterrupted_run() {
    let rows = [
        ("r1@example.com", false),
        ("r2@example.com", false),
        ("r3@example.com", false),
        ("r4@example.com", false),
        ("r5@example.com", false),
    ];

    // Uninterrupted
    let dir = tempfile::tempdir().unwrap();
    let path = progress_file(dir.path(), &rows).await;
    let ledger = Arc::new(MemoryLedger::new());
    seed(ledger.as_ref(), &[("sender@example.com", 0, 100)]).await;
    let mut progress = load(&path).await;
    engine(ledger.clone(), MockTransport::accepting(), config(RotationPolicy::Fair, 2))
        .run(&mut progress)
        .await
        .unwrap();
    let expected = tokio::fs::read_to_string(&path).await.unwrap();
    let mut expected_recipients: Vec<_> =
        ledger.records().into_iter().map(|r| r.to_recipient).collect();
    expected_recipients.sort();

    // Interrupted by quota exhaustion after two sends, then resumed
    let dir = tempfile::tempdir().unwrap();
    let path = progress_file(dir.path(), &rows).await;
    let ledger = Arc::new(MemoryLedger::new());
    let sender = address("sender@example.com");
    seed(ledger.as_ref(), &[("sender@example.com", 0, 2)]).await;

    let mut progress = load(&path).await;
    let first = engine(ledger.clone(), MockTransport::accepting(), config(RotationPolicy::Fair, 2))
        .run(&mut progress)
        .await
        .unwrap();
    assert_eq!(first.sent, 2);
    assert!(first.aborted.is_some());

    ledger.upsert(&sender, None, 100).await.unwrap();
    let mut progress = load(&path).await;
    let second = engine(ledger.clone(), MockTransport::accepting(), config(RotationPolicy::Fair, 2))
        .run(&mut progress)
        .await
        .unwrap();
    assert_eq!(second.sent, 3);
    assert_eq!(second.skipped, 2);

    let mut resumed_recipients: Vec<_> = ledger
        .records()
        .into_iter()
        .filter(|r| r.status == DeliveryStatus::Success)
        .map(|r| r.to_recipient)
        .collect();
    resumed_recipients.sort();

    assert_eq!(resumed_recipients, expected_recipients);
    assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), expected);
}

#[tokio::test]
async fn test_fair_threshold_rotation_spreads_sends() {
    let dir = tempfile::tempdir().unwrap();
    let recipients: Vec<String> = (0..6).map(|n| format!("r{n}@example.com")).collect();
    let rows: Vec<(&str, bool)> = recipients.iter().map(|r| (r.as_str(), false)).collect();
    let path = progress_file(dir.path(), &rows).await;

    let ledger = Arc::new(MemoryLedger::new());
    seed(
        ledger.as_ref(),
        &[
            ("a@example.com", 0, 100),
            ("b@example.com", 0, 100),
            ("c@example.com", 0, 100),
        ],
    )
    .await;
    let transport = MockTransport::accepting();

    let mut dispatch_config = config(RotationPolicy::Fair, 2);
    dispatch_config.rotation_threshold = ThresholdRange { min: 2, max: 2 };

    let mut progress = load(&path).await;
    let report = engine(ledger.clone(), transport.clone(), dispatch_config)
        .run(&mut progress)
        .await
        .unwrap();

    assert_eq!(report.sent, 6);
    let senders: AHashSet<_> = transport.delivered().into_iter().map(|(from, _)| from).collect();
    assert_eq!(senders.len(), 3);
    assert_eq!(transport.binds().len(), 3);
}

#[tokio::test]
async fn test_fair_rotation_visits_multiple_identities() {
    let ledger: Arc<dyn Ledger> = Arc::new(MemoryLedger::new());
    seed(
        ledger.as_ref(),
        &[("a@example.com", 0, 100), ("b@example.com", 0, 100)],
    )
    .await;
    let transport = MockTransport::accepting();
    let rotator = Rotator::new(RotationPolicy::Fair, ThresholdRange { min: 1, max: 3 });

    let mut session = DispatchSession::new();
    let first = rotator
        .rotate(ledger.as_ref(), transport.as_ref(), &mut session, RotationReason::Initial)
        .await
        .unwrap();
    assert!(matches!(first, Rotation::Switched(_)));
    assert!((1..=3).contains(&session.rotation_threshold()));

    let mut visited = AHashSet::new();
    visited.extend(session.current_address().cloned());
    for _ in 0..3 {
        let rotation = rotator
            .rotate(ledger.as_ref(), transport.as_ref(), &mut session, RotationReason::Threshold)
            .await
            .unwrap();
        assert!(matches!(rotation, Rotation::Switched(_)));
        visited.extend(session.current_address().cloned());
    }

    assert!(visited.len() >= 2);
    // Every switch closes the binding it replaces.
    assert_eq!(transport.closes().len(), 3);
    session.close().await;
    assert_eq!(transport.closes().len(), 4);
}

#[tokio::test]
async fn test_dispatch_against_sqlite_ledger() {
    let dir = tempfile::tempdir().unwrap();
    let path = progress_file(
        dir.path(),
        &[("r1@example.com", false), ("r2@example.com", false)],
    )
    .await;

    let ledger = Arc::new(
        SqliteLedger::open(dir.path().join("ledger.db"))
            .await
            .unwrap(),
    );
    seed(ledger.as_ref(), &[("sender@example.com", 0, 100)]).await;

    let mut progress = load(&path).await;
    let report = engine(ledger.clone(), MockTransport::accepting(), config(RotationPolicy::Simple, 5))
        .run(&mut progress)
        .await
        .unwrap();

    assert_eq!(report.sent, 2);
    assert!(ledger
        .was_sent(&address("r1@example.com"), Some("recipients.csv"))
        .await
        .unwrap());
    assert!(!ledger
        .was_sent(&address("r1@example.com"), Some("other.csv"))
        .await
        .unwrap());

    let stats = ledger
        .stats(&address("sender@example.com"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stats.sent_count, 2);
    assert_eq!(stats.delivered, 2);
}

#[tokio::test]
async fn test_unrecorded_delivery_is_still_marked_sent() {
    let dir = tempfile::tempdir().unwrap();
    let path = progress_file(
        dir.path(),
        &[("r1@example.com", false), ("r2@example.com", false)],
    )
    .await;

    let ledger = Arc::new(BrokenUsageLedger::default());
    seed(ledger.as_ref(), &[("sender@example.com", 0, 100)]).await;
    let transport = MockTransport::accepting();

    let mut progress = load(&path).await;
    let error = engine(ledger.clone(), transport.clone(), config(RotationPolicy::Simple, 1))
        .run(&mut progress)
        .await
        .unwrap_err();

    assert!(matches!(error, DispatchError::Ledger(_)));
    assert_eq!(transport.delivered().len(), 1);

    // The delivered recipient is not offered again on resume.
    let reloaded = load(&path).await;
    let markers: Vec<_> = reloaded.entries().iter().map(|e| e.already_sent).collect();
    assert_eq!(markers, vec![true, false]);
}

#[tokio::test]
async fn test_run_without_successes_preserves_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("recipients.csv");
    tokio::fs::write(
        &path,
        "Name,E-mail 1 - Value,Company\n\
         Ann,ann@example.com,\"Acme, Inc\"\n\
         Bob,bob@example.com,Globex\n\
         Cat,cat@example.com,\n",
    )
    .await
    .unwrap();

    let ledger = Arc::new(MemoryLedger::new());
    seed(ledger.as_ref(), &[("sender@example.com", 0, 100)]).await;
    let transport = MockTransport::builder()
        .failing_recipient("ann@example.com", "550 5.1.1 User unknown")
        .failing_recipient("bob@example.com", "550 5.1.1 User unknown")
        .failing_recipient("cat@example.com", "552 Mailbox full")
        .build();

    let mut progress = load(&path).await;
    let report = engine(ledger.clone(), transport, config(RotationPolicy::Fair, 2))
        .run(&mut progress)
        .await
        .unwrap();

    assert_eq!(report.sent, 0);
    assert_eq!(report.failed, 3);
    assert_eq!(
        tokio::fs::read_to_string(&path).await.unwrap(),
        "Name,E-mail 1 - Value,Company,Sent\n\
         Ann,ann@example.com,\"Acme, Inc\",no\n\
         Bob,bob@example.com,Globex,no\n\
         Cat,cat@example.com,,no\n"
    );
}
