use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;
use volley::{
    BulkSender, CanonicalIdentifier, DispatchErrorKind, InMemoryRecipientStore, MessagePayload,
    MockTransport, OUTSIDE_WINDOW_ERROR_CODE, PipelineConfig, RateGate, SendRequest,
    TransportError, VolleyError, classify,
};

fn raw(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

fn id(value: &str) -> CanonicalIdentifier {
    CanonicalIdentifier::parse(value).unwrap()
}

fn sender(
    store: &Arc<InMemoryRecipientStore>,
    mock: &MockTransport,
) -> BulkSender<InMemoryRecipientStore, MockTransport> {
    BulkSender::new(PipelineConfig::default(), store.clone(), Arc::new(mock.clone())).unwrap()
}

#[test_log::test(tokio::test)]
async fn test_check_then_send_records_history() {
    // Setup: one recipient already contacted
    let store = Arc::new(InMemoryRecipientStore::with_recipients(["+0987654321"]));
    let mock = MockTransport::new();
    let sender = sender(&store, &mock);

    let input = raw(&["+1234567890", "bad", "+1234567890", "+0987654321"]);
    let check = sender.check_recipients(&input).await.unwrap();
    assert_eq!(check.invalid, vec!["bad"]);
    assert_eq!(check.unique_new, vec![id("+1234567890")]);
    assert_eq!(check.persisted_duplicates, vec![id("+0987654321")]);

    // Caller decides to send to new recipients only
    let targets: Vec<String> = check.unique_new.iter().map(|c| c.to_string()).collect();
    let request = SendRequest::new(targets, MessagePayload::freeform("Hello!"))
        .with_metadata(json!({"campaign": "spring"}));
    let summary = sender
        .send_bulk(&request, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.total_sent, 1);
    assert_eq!(summary.total_failed, 0);

    sender.shutdown().await;

    let record = store.get(&id("+1234567890")).unwrap();
    assert_eq!(record.send_count, 1);
    assert_eq!(record.metadata, json!({"campaign": "spring"}));
    assert_eq!(store.get(&id("+0987654321")).unwrap().send_count, 0);

    // A second check now sees the recipient as already contacted
    let recheck = classify(&input, store.as_ref()).await.unwrap();
    assert!(recheck.unique_new.is_empty());
    assert_eq!(recheck.persisted_duplicates.len(), 2);
    assert!(recheck.is_partition_complete());
}

#[test_log::test(tokio::test)]
async fn test_outside_window_recipients_can_be_retried_with_template() {
    let store = Arc::new(InMemoryRecipientStore::new());
    let mock = MockTransport::new();
    mock.add_response(
        "+15550000002",
        Err(TransportError::provider(
            OUTSIDE_WINDOW_ERROR_CODE,
            "Message failed: outside the allowed window",
        )),
    );
    let sender = sender(&store, &mock);
    let cancel = CancellationToken::new();

    let freeform = SendRequest::new(
        raw(&["+15550000001", "+15550000002"]),
        MessagePayload::freeform("Are you still interested?"),
    );
    let summary = sender.send_bulk(&freeform, &cancel).await.unwrap();
    assert_eq!(summary.total_sent, 1);
    let retry: Vec<String> = summary
        .outside_window()
        .map(|o| o.identifier.clone())
        .collect();
    assert_eq!(retry, vec!["+15550000002"]);

    let template = SendRequest::new(
        retry,
        MessagePayload::Template {
            template_ref: "HX0123456789".to_string(),
            language: Some("en".to_string()),
            variables: vec!["Ada".to_string()],
        },
    );
    let summary = sender.send_bulk(&template, &cancel).await.unwrap();
    assert_eq!(summary.total_sent, 1);

    sender.shutdown().await;

    assert_eq!(store.len(), 2);
    let sends = store.template_sends();
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0].canonical, id("+15550000002"));
    assert_eq!(sends[0].template_ref, "HX0123456789");
}

#[test_log::test(tokio::test)]
async fn test_lookup_failure_aborts_check() {
    let store = Arc::new(InMemoryRecipientStore::new());
    store.set_fail_lookups(true);
    let mock = MockTransport::new();
    let sender = sender(&store, &mock);

    let result = sender
        .check_recipients(&raw(&["+15550000001", "+15550000002"]))
        .await;

    assert!(matches!(result, Err(VolleyError::Persistence(_))));
    assert_eq!(mock.call_count(), 0);
    sender.shutdown().await;
}

#[test_log::test(tokio::test)]
async fn test_history_failure_does_not_affect_send() {
    let store = Arc::new(InMemoryRecipientStore::new());
    store.set_fail_writes(true);
    let mock = MockTransport::new();
    let sender = sender(&store, &mock);

    let request = SendRequest::new(
        raw(&["+15550000001", "+15550000002"]),
        MessagePayload::freeform("hi"),
    );
    let summary = sender
        .send_bulk(&request, &CancellationToken::new())
        .await
        .unwrap();
    sender.shutdown().await;

    assert_eq!(summary.total_sent, 2);
    assert!(store.is_empty());
}

#[test_log::test(tokio::test)]
async fn test_every_input_lands_in_one_bucket() {
    let store = Arc::new(InMemoryRecipientStore::new());
    let mock = MockTransport::new();
    mock.add_response("+15550000003", Err(TransportError::other("connection reset")));
    let sender = sender(&store, &mock);

    let request = SendRequest::new(
        raw(&["+1 555 000 0001", "12", "+15550000003", "0015550000004"]),
        MessagePayload::freeform("hi"),
    );
    let summary = sender
        .send_bulk(&request, &CancellationToken::new())
        .await
        .unwrap();
    sender.shutdown().await;

    assert_eq!(summary.outcomes.len(), 4);
    assert_eq!(summary.total_sent + summary.total_failed, 4);
    let kinds: Vec<_> = summary.outcomes.iter().map(|o| o.error_kind).collect();
    assert_eq!(
        kinds,
        vec![
            None,
            Some(DispatchErrorKind::InvalidFormat),
            Some(DispatchErrorKind::Unknown),
            None,
        ]
    );
    // History keeps the raw spelling the caller submitted
    assert_eq!(store.get(&id("+15550000001")).unwrap().raw, "+1 555 000 0001");
    assert_eq!(store.len(), 2);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_concurrent_batches_share_rate_gates() {
    let gates = vec![
        Arc::new(RateGate::per_second(2).unwrap()),
        Arc::new(RateGate::per_minute(300).unwrap()),
    ];
    let mock = MockTransport::new();
    let build = |store: Arc<InMemoryRecipientStore>| {
        BulkSender::with_rate_gates(
            PipelineConfig::default(),
            store,
            Arc::new(mock.clone()),
            gates.clone(),
        )
        .unwrap()
    };
    let first = build(Arc::new(InMemoryRecipientStore::new()));
    let second = build(Arc::new(InMemoryRecipientStore::new()));

    let batch_a = SendRequest::new(
        (1..=4).map(|i| format!("+1555000000{i}")).collect(),
        MessagePayload::freeform("a"),
    );
    let batch_b = SendRequest::new(
        (5..=8).map(|i| format!("+1555000000{i}")).collect(),
        MessagePayload::freeform("b"),
    );
    let cancel = CancellationToken::new();

    let start = tokio::time::Instant::now();
    let (a, b) = tokio::join!(
        first.send_bulk(&batch_a, &cancel),
        second.send_bulk(&batch_b, &cancel)
    );
    let elapsed = start.elapsed();

    assert_eq!(a.unwrap().total_sent, 4);
    assert_eq!(b.unwrap().total_sent, 4);
    // 8 sends at 2 per second need at least three full windows after the first
    assert!(elapsed >= Duration::from_secs(3), "elapsed {elapsed:?}");
    assert_eq!(gates[1].in_window("whatsapp"), 8);

    first.shutdown().await;
    second.shutdown().await;
}

#[test_log::test(tokio::test(start_paused = true))]
async fn test_cancelled_batch_reports_unattempted() {
    let store = Arc::new(InMemoryRecipientStore::new());
    let mock = MockTransport::new();
    let config = PipelineConfig {
        max_per_second: 1,
        ..Default::default()
    };
    let sender =
        Arc::new(BulkSender::new(config, store.clone(), Arc::new(mock.clone())).unwrap());
    let cancel = CancellationToken::new();

    let request = SendRequest::new(
        raw(&["+15550000001", "+15550000002", "+15550000003"]),
        MessagePayload::freeform("hi"),
    );
    let handle = tokio::spawn({
        let sender = sender.clone();
        let cancel = cancel.clone();
        async move { sender.send_bulk(&request, &cancel).await }
    });

    // First send goes out immediately; the second waits on the per-second gate
    tokio::time::sleep(Duration::from_millis(500)).await;
    cancel.cancel();

    let summary = handle.await.unwrap().unwrap();
    assert!(summary.cancelled);
    assert_eq!(summary.total_sent, 1);
    assert_eq!(summary.not_attempted, vec!["+15550000002", "+15550000003"]);
    assert_eq!(mock.call_count(), 1);
}
