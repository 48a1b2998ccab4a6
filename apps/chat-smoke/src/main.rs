use std::{sync::Arc, time::Duration};

use chat_core::{
    Actor, ChatSync, InMemoryTransport, MessageKind, SyncConfig, TransportError, TransportOp,
    WireMessage, WireUnreadInfo,
};
use serde_json::json;
use tracing::{info, warn};

mod logging;

const GROUP: &str = "household";

#[tokio::main]
async fn main() {
    logging::init();

    let config = match SyncConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Invalid configuration: {err}");
            std::process::exit(1);
        }
    };

    let actor = Actor::new("u-alice", "Alice");
    let transport = Arc::new(InMemoryTransport::new(actor.clone()));
    transport.seed_history(
        GROUP,
        vec![
            foreign("h1", "Anyone going shopping today?", "2024-05-01T08:00:00Z"),
            foreign("h2", "We are out of milk", "2024-05-01T08:01:00Z"),
        ],
    );
    transport.seed_unread(
        GROUP,
        WireUnreadInfo {
            unread_count: 2,
            last_read_message: None,
        },
    );

    let debounce = config.read_receipt_debounce;
    let sync = ChatSync::new(Arc::clone(&transport), actor, config);
    if let Err(err) = sync.mount_group(GROUP).await {
        eprintln!("Failed to mount {GROUP}: {err}");
        std::process::exit(1);
    }
    println!(
        "Mounted {GROUP}: {} messages, {} unread",
        sync.timeline(GROUP).len(),
        sync.unread(GROUP).unread_count
    );

    match sync.send(GROUP, "I'll grab some", MessageKind::Text, None).await {
        Ok(message) => println!("Sent message confirmed as {}", message.id),
        Err(err) => warn!(error = %err, "send failed"),
    }

    transport.fail_next(
        TransportOp::SendMessage,
        TransportError::network("simulated outage"),
    );
    if let Err(err) = sync.send(GROUP, "lost in transit", MessageKind::Text, None).await {
        println!("Send failed and was rolled back: {err}");
    }

    sync.set_view_active(GROUP, false);
    transport.publish_live(
        GROUP,
        foreign("l1", "Also bread please", "2024-05-01T08:05:00Z"),
    );
    tokio::time::sleep(Duration::from_millis(50)).await;
    println!(
        "Live message arrived while away: {} unread",
        sync.unread(GROUP).unread_count
    );

    sync.set_view_active(GROUP, true);
    let queued = sync.observe_visible(GROUP, ["h1", "h2", "l1"]);
    info!(queued, "waiting for read receipts to flush");
    tokio::time::sleep(debounce + Duration::from_millis(100)).await;
    println!(
        "Read receipts sent in {} batch(es); {} unread",
        transport.mark_read_batches().len(),
        sync.unread(GROUP).unread_count
    );

    for message in sync.timeline(GROUP) {
        println!(
            "  [{}] {}: {}",
            message.id, message.sender_display, message.content
        );
    }

    sync.unmount_group(GROUP);
    println!("Unmounted {GROUP}");
}

fn foreign(id: &str, content: &str, created_at: &str) -> WireMessage {
    WireMessage(json!({
        "_id": id,
        "group": GROUP,
        "sender": { "_id": "u-bob", "firstName": "Bob" },
        "content": content,
        "messageType": "text",
        "createdAt": created_at,
        "readBy": ["u-bob"],
    }))
}
