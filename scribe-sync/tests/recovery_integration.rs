//! Integration tests for outages: outbox flushing, rebasing, recovery
//! policies and terminal failure.

use std::sync::Arc;
use std::time::Duration;

use scribe_sync::{
    CheckpointStatus, ConnectionStatus, Delta, DocumentId, InboundEvent, LoopbackHub,
    LoopbackTransport, MemoryHistory, PipelineState, RecoveryPolicy, Session, SessionConfig,
    SessionError, SessionUpdate,
};
use tokio::time::timeout;

fn quiet_config() -> SessionConfig {
    SessionConfig {
        checkpoint_interval: Duration::from_secs(3600),
        ..SessionConfig::for_testing()
    }
}

async fn open_session(
    transport: Arc<LoopbackTransport>,
    history: &Arc<MemoryHistory>,
    config: SessionConfig,
    doc: &DocumentId,
) -> Session {
    let mut session = Session::connect(transport, history.clone(), config)
        .await
        .unwrap();
    session.open_document(doc.clone()).await.unwrap();
    timeout(Duration::from_secs(2), session.wait_ready(doc))
        .await
        .expect("document never became ready")
        .unwrap();
    session
}

fn statuses(updates: &[SessionUpdate]) -> Vec<ConnectionStatus> {
    updates
        .iter()
        .filter_map(|u| match u {
            SessionUpdate::StatusChanged(status) => Some(*status),
            _ => None,
        })
        .collect()
}

fn recovered(updates: &[SessionUpdate]) -> Option<(usize, usize)> {
    updates.iter().find_map(|u| match u {
        SessionUpdate::Recovered {
            flushed, reloaded, ..
        } => Some((*flushed, *reloaded)),
        _ => None,
    })
}

#[tokio::test]
async fn test_status_follows_lifecycle() {
    let hub = LoopbackHub::new();
    let history = Arc::new(MemoryHistory::new());
    let doc = DocumentId::new("doc-1");
    let ta = hub.connect();
    let mut a = open_session(ta.clone(), &history, quiet_config(), &doc).await;

    ta.disconnect().await;
    ta.begin_reconnect(1).await;
    ta.begin_reconnect(2).await;
    ta.reconnect().await;

    let updates = a.drain().await;
    assert_eq!(
        statuses(&updates),
        vec![
            ConnectionStatus::Disconnected,
            ConnectionStatus::Reconnecting { attempt: 1 },
            ConnectionStatus::Reconnecting { attempt: 2 },
            ConnectionStatus::Connected,
        ]
    );
    assert_eq!(recovered(&updates), Some((0, 0)));
    assert_eq!(a.status(), ConnectionStatus::Connected);
    // the edit channel was re-subscribed
    assert_eq!(hub.subscriber_count(&doc.edit_channel()).await, 1);
}

#[tokio::test]
async fn test_outbox_flushed_in_order_after_reconnect() {
    let hub = LoopbackHub::new();
    let history = Arc::new(MemoryHistory::new());
    let doc = DocumentId::new("doc-1");
    let ta = hub.connect();
    let mut a = open_session(ta.clone(), &history, quiet_config(), &doc).await;
    let mut b = open_session(hub.connect(), &history, quiet_config(), &doc).await;

    ta.disconnect().await;
    a.drain().await;
    assert_eq!(a.status(), ConnectionStatus::Disconnected);

    a.submit_local_edit(&doc, Delta::new().insert("one"))
        .await
        .unwrap();
    a.submit_local_edit(&doc, Delta::new().retain(3).insert(" two"))
        .await
        .unwrap();
    assert_eq!(a.outbox_len(&doc), Some(2));
    assert!(b.drain().await.is_empty());

    ta.reconnect().await;
    let updates = a.drain().await;
    assert_eq!(recovered(&updates), Some((2, 0)));
    assert_eq!(a.outbox_len(&doc), Some(0));

    b.drain().await;
    assert_eq!(b.content(&doc).unwrap().plain_text(), "one two");
    assert_eq!(a.content(&doc), b.content(&doc));
}

#[tokio::test]
async fn test_edits_during_outage_reach_reconnected_session() {
    let hub = LoopbackHub::new();
    let history = Arc::new(MemoryHistory::new());
    let doc = DocumentId::new("doc-1");
    let ta = hub.connect();
    let mut a = open_session(ta.clone(), &history, quiet_config(), &doc).await;
    let mut b = open_session(hub.connect(), &history, quiet_config(), &doc).await;

    ta.disconnect().await;
    a.drain().await;
    b.submit_local_edit(&doc, Delta::new().insert("missed"))
        .await
        .unwrap();

    ta.reconnect().await;
    let updates = a.drain().await;
    assert_eq!(recovered(&updates), Some((0, 0)));
    b.drain().await;
    assert_eq!(a.content(&doc).unwrap().plain_text(), "missed");
    assert_eq!(a.content(&doc), b.content(&doc));
}

#[tokio::test]
async fn test_redelivered_edit_rebased_over_outbox() {
    let hub = LoopbackHub::new();
    let history = Arc::new(MemoryHistory::new());
    let doc = DocumentId::new("doc-1");
    let ta = hub.connect();
    let mut a = open_session(ta.clone(), &history, quiet_config(), &doc).await;
    let mut b = open_session(hub.connect(), &history, quiet_config(), &doc).await;

    a.submit_local_edit(&doc, Delta::new().insert("ab")).await.unwrap();
    b.drain().await;

    ta.disconnect().await;
    a.drain().await;
    a.submit_local_edit(&doc, Delta::new().retain(2).insert("Y"))
        .await
        .unwrap();

    // b edits while a is offline; a hears of it before the hub's replay
    let from_b = b
        .submit_local_edit(&doc, Delta::new().insert("X"))
        .await
        .unwrap();
    let updates = a
        .handle_event(InboundEvent::Message {
            channel: doc.edit_channel(),
            payload: from_b.encode().unwrap(),
        })
        .await;
    assert_eq!(updates.len(), 1);
    assert_eq!(a.content(&doc).unwrap().plain_text(), "XabY");

    ta.reconnect().await;
    a.drain().await;
    b.drain().await;
    assert_eq!(b.content(&doc).unwrap().plain_text(), "XabY");
    assert_eq!(a.content(&doc), b.content(&doc));
}

#[tokio::test]
async fn test_reload_snapshots_policy() {
    let hub = LoopbackHub::new();
    let history = Arc::new(MemoryHistory::new());
    let doc = DocumentId::new("doc-1");
    let ta = hub.connect();
    let mut a = open_session(
        ta.clone(),
        &history,
        quiet_config().with_recovery_policy(RecoveryPolicy::ReloadSnapshots),
        &doc,
    )
    .await;
    let mut b = open_session(hub.connect(), &history, SessionConfig::for_testing(), &doc).await;

    b.submit_local_edit(&doc, Delta::new().insert("hello"))
        .await
        .unwrap();
    a.drain().await;

    ta.disconnect().await;
    a.drain().await;
    // replayed to a on reconnection, then superseded by the reload
    b.submit_local_edit(&doc, Delta::new().retain(5).insert(" world"))
        .await
        .unwrap();
    timeout(Duration::from_secs(2), async {
        while !matches!(
            b.checkpoint_status(&doc),
            Some(CheckpointStatus::Persisted { revision: 2, .. })
        ) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("b never checkpointed");

    a.submit_local_edit(&doc, Delta::new().insert("zzz"))
        .await
        .unwrap();
    assert_eq!(a.outbox_len(&doc), Some(1));

    ta.reconnect().await;
    let updates = a.drain().await;
    assert_eq!(recovered(&updates), Some((0, 1)));
    assert_eq!(a.outbox_len(&doc), Some(0));
    assert_eq!(a.document_state(&doc), Some(PipelineState::Loading));

    timeout(Duration::from_secs(2), a.wait_ready(&doc))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(a.content(&doc).unwrap().plain_text(), "hello world");
    // the discarded edit never reached b
    b.drain().await;
    assert_eq!(b.content(&doc).unwrap().plain_text(), "hello world");
}

#[tokio::test]
async fn test_reconnect_failed_refuses_edits() {
    let hub = LoopbackHub::new();
    let history = Arc::new(MemoryHistory::new());
    let doc = DocumentId::new("doc-1");
    let ta = hub.connect();
    let mut a = open_session(ta.clone(), &history, quiet_config(), &doc).await;

    ta.disconnect().await;
    ta.begin_reconnect(1).await;
    ta.fail().await;
    let updates = a.drain().await;
    assert_eq!(statuses(&updates).last(), Some(&ConnectionStatus::Failed));

    let result = a.submit_local_edit(&doc, Delta::new().insert("x")).await;
    assert!(matches!(result, Err(SessionError::Offline)));
    assert!(a.content(&doc).unwrap().is_empty());
    assert!(matches!(
        a.open_document(DocumentId::new("doc-2")).await,
        Err(SessionError::Offline)
    ));
}

#[tokio::test]
async fn test_full_outbox_refuses_edit_before_applying() {
    let hub = LoopbackHub::new();
    let history = Arc::new(MemoryHistory::new());
    let doc = DocumentId::new("doc-1");
    let ta = hub.connect();
    let config = SessionConfig {
        outbox_capacity: 2,
        ..quiet_config()
    };
    let mut a = open_session(ta.clone(), &history, config, &doc).await;

    ta.disconnect().await;
    a.drain().await;
    a.submit_local_edit(&doc, Delta::new().insert("a")).await.unwrap();
    a.submit_local_edit(&doc, Delta::new().insert("b")).await.unwrap();
    let result = a.submit_local_edit(&doc, Delta::new().insert("c")).await;
    assert!(matches!(result, Err(SessionError::Pipeline(_))));
    assert_eq!(a.content(&doc).unwrap().plain_text(), "ba");
}

#[tokio::test]
async fn test_document_opened_while_disconnected() {
    let hub = LoopbackHub::new();
    let history = Arc::new(MemoryHistory::new());
    let doc = DocumentId::new("doc-1");
    let ta = hub.connect();
    let mut a = Session::connect(ta.clone(), history.clone(), quiet_config())
        .await
        .unwrap();
    let mut b = open_session(hub.connect(), &history, quiet_config(), &doc).await;

    ta.disconnect().await;
    a.drain().await;
    a.open_document(doc.clone()).await.unwrap();
    timeout(Duration::from_secs(2), a.wait_ready(&doc))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(hub.subscriber_count(&doc.edit_channel()).await, 1);

    ta.reconnect().await;
    a.drain().await;
    assert_eq!(hub.subscriber_count(&doc.edit_channel()).await, 2);

    b.submit_local_edit(&doc, Delta::new().insert("late"))
        .await
        .unwrap();
    a.drain().await;
    assert_eq!(a.content(&doc).unwrap().plain_text(), "late");
}
