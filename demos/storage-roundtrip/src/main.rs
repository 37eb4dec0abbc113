//! # Storage Round-Trip Demo
//!
//! Stores a value through the in-memory protocol, fetches it back in all
//! three delivery modes, and watches the dispatched response with a
//! component listener.
//!
//! Run with `RUST_LOG=debug` to see the queue's debug printer.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use serde_json::json;
use tidings::{
    interceptor_fn, Applied, Component, Listener, MemoryProtocol, Message, MessageQueue,
    RequestMode, ResourceManager, ResourceRequest, TidingsConfig, Timepoint,
};
use tracing_subscriber::EnvFilter;

// ============================================================================
// Setup
// ============================================================================

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}

fn build(config: &TidingsConfig) -> (MessageQueue, ResourceManager) {
    let queue = MessageQueue::with_config(&config.queue);
    let manager = ResourceManager::with_config(queue.clone(), &config.resource);
    manager.register_protocol(Arc::new(MemoryProtocol::new()));
    (queue, manager)
}

// ============================================================================
// Main
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = TidingsConfig::load()?;
    let (queue, manager) = build(&config);

    // Stamp every successful response with the protocol that served it.
    manager.use_interceptor(
        interceptor_fn(|request, _, data, _| {
            json!({ "protocol": request.protocol(), "value": data }).into()
        }),
        Some(Timepoint::ON_SUCCEED),
    );

    let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();
    let watcher = Component::builder(&queue, "watcher")
        .with_config(&config.component)
        .on_response(&config.resource.response, move |response| {
            tracing::info!(status = ?response.status, data = %response.data, "response observed");
            let _ = done_tx.send(());
        })
        .build()?;

    // Synchronous: submit, then fetch.
    let submit = ResourceRequest::to(&manager, "storage:///greeting")?.submit("hello");
    let stored = manager.require_sync(submit)?;
    tracing::info!(status = ?stored.status(), data = %stored.data(), "stored");

    let fetch = ResourceRequest::to(&manager, "memory:///greeting")?.tag("demo");
    let fetched = manager.require_sync(fetch.clone())?;
    tracing::info!(status = ?fetched.status(), data = %fetched.data(), "fetched synchronously");

    // Deferred.
    if let Applied::Deferred(pending) = manager.apply(fetch.clone(), RequestMode::Deferred)? {
        let response = pending.await?;
        tracing::info!(data = %response.data(), "fetched deferred");
    }

    // Via dispatch: the watcher component sees the response.
    manager.publish(fetch)?;
    tokio::time::timeout(Duration::from_secs(1), done_rx.recv()).await?;

    // Plain messages.
    queue.register(
        Listener::on(2)
            .listen("COUNT")
            .map(|m| {
                let n = m.value().as_i64().unwrap_or_default();
                m.with_value(n + 1)
            }),
    )?;
    let counted = queue.send_sync(Message::sync().mark(2, "COUNT").with_value(41))?;
    tracing::info!(value = %counted.value(), "counted");

    queue.print_structure();
    watcher.destroy();
    Ok(())
}
