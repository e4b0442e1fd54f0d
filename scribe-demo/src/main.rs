//! Two participants editing one document over an in-process hub.
//!
//! Run with `RUST_LOG=debug cargo run -p scribe-demo` to watch the pipeline,
//! checkpoint writer and presence tracker at work.

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use scribe_sync::{
    CheckpointStatus, Delta, DocumentId, LoopbackHub, MemoryHistory, PresenceState, Session,
    SessionConfig, SessionUpdate,
};
use serde_json::json;

fn cursor(name: &str, index: usize) -> PresenceState {
    let mut state = PresenceState::new();
    state.insert("name".into(), json!(name));
    state.insert("cursor".into(), json!({ "index": index, "length": 0 }));
    state
}

fn report(who: &str, updates: &[SessionUpdate]) {
    for update in updates {
        match update {
            SessionUpdate::RemoteEdit { delta, .. } => {
                log::info!("[{who}] remote edit: {} ops", delta.ops.len())
            }
            SessionUpdate::PresenceChanged { channel } => {
                log::info!("[{who}] presence changed on {channel}")
            }
            other => log::info!("[{who}] {other:?}"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let hub = LoopbackHub::new();
    let history = Arc::new(MemoryHistory::new());
    let doc = DocumentId::new("doc-1");
    let config = SessionConfig {
        checkpoint_interval: Duration::from_millis(200),
        ..SessionConfig::default()
    };

    let alice_link = hub.connect();
    let mut alice = Session::connect(alice_link.clone(), history.clone(), config.clone()).await?;
    let mut bob = Session::connect(hub.connect(), history.clone(), config).await?;

    for session in [&mut alice, &mut bob] {
        session.open_document(doc.clone()).await?;
        session.wait_ready(&doc).await?;
    }

    let channel = doc.presence_channel();
    alice.enter_presence(&channel, cursor("alice", 0)).await?;
    bob.enter_presence(&channel, cursor("bob", 0)).await?;

    alice
        .submit_local_edit(&doc, Delta::new().insert("Hello world\n"))
        .await?;
    report("bob", &bob.drain().await);

    let mut bold = serde_json::Map::new();
    bold.insert("bold".into(), json!(true));
    bob.submit_local_edit(&doc, Delta::new().retain_with(5, bold))
        .await?;
    bob.update_presence(&channel, cursor("bob", 5)).await?;
    report("alice", &alice.drain().await);

    // alice drops off and keeps typing; the edit waits in the outbox
    alice_link.disconnect().await;
    report("alice", &alice.drain().await);
    alice
        .submit_local_edit(&doc, Delta::new().retain(11).insert("!"))
        .await?;
    println!(
        "alice queued {} edit(s) while offline",
        alice.outbox_len(&doc).unwrap_or(0)
    );

    alice_link.begin_reconnect(1).await;
    alice_link.reconnect().await;
    report("alice", &alice.drain().await);
    report("bob", &bob.drain().await);

    bob.submit_local_edit(&doc, Delta::new().insert(">> ")).await?;
    report("alice", &alice.drain().await);

    let alice_text = alice.content(&doc).map(|d| d.plain_text()).unwrap_or_default();
    let bob_text = bob.content(&doc).map(|d| d.plain_text()).unwrap_or_default();
    println!("alice sees: {alice_text:?}");
    println!("bob sees:   {bob_text:?}");

    for entry in bob.presence_members(&channel) {
        println!(
            "member {} at {}",
            entry.participant_id,
            entry.state.get("cursor").cloned().unwrap_or_default()
        );
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    if let Some(CheckpointStatus::Persisted { revision, .. }) = bob.checkpoint_status(&doc) {
        println!("bob checkpointed revision {revision}");
    }

    alice.shutdown().await;
    bob.shutdown().await;
    Ok(())
}
