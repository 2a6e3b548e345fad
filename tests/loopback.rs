//! End-to-end integration over real WebRTC channels on loopback, with the
//! in-memory relay standing in for the signaling service.
//!
//! The library itself has no timeouts; every wait here is wrapped in one so
//! a broken handshake fails the test instead of hanging it.

use std::sync::Arc;
use std::time::Duration;

use spacedrop::config::CHUNK_SIZE;
use spacedrop::{
    FileEntry, LinkConfig, MemoryChunkStore, MemorySignaling, MemorySinkFactory, SpaceContext,
    TransferEngine,
};
use tokio::time::{sleep, timeout};
use uuid::Uuid;

fn loopback_config() -> LinkConfig {
    LinkConfig {
        control_ice_servers: Vec::new(),
        tunnel_ice_servers: Vec::new(),
        allow_loopback: true,
    }
}

struct Endpoint {
    ctx: SpaceContext,
    engine: TransferEngine,
    store: Arc<MemoryChunkStore>,
    sinks: Arc<MemorySinkFactory>,
}

fn endpoint(id: &str, io: &Arc<MemorySignaling>) -> Endpoint {
    let (ctx, events) = SpaceContext::open(id, io.clone(), loopback_config());
    let store = Arc::new(MemoryChunkStore::new());
    let sinks = Arc::new(MemorySinkFactory::new());
    let engine = TransferEngine::spawn(ctx.links(), store.clone(), sinks.clone(), events);
    Endpoint {
        ctx,
        engine,
        store,
        sinks,
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 239) as u8).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn transfer_streams_across_real_channels() {
    let _ = tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).try_init();
    let io = Arc::new(MemorySignaling::new());
    let alice = endpoint("alice", &io);
    let bob = endpoint("bob", &io);

    let space = Uuid::new_v4();
    let file_id = Uuid::new_v4();
    let data = pattern(2 * CHUNK_SIZE + 100);
    alice.store.put_file(space, file_id, &data, CHUNK_SIZE);

    let entry = FileEntry {
        space_id: space,
        id: file_id,
        name: "big.bin".into(),
        path: "/".into(),
        size: data.len() as u64,
        origin: "alice".into(),
    };

    timeout(Duration::from_secs(120), async {
        let transfer_id = bob
            .engine
            .start_transfer("download", "/", vec![entry])
            .await
            .expect("announce failed");
        while bob.sinks.finished("big.bin").is_none() {
            sleep(Duration::from_millis(50)).await;
        }
        let record = bob
            .engine
            .requesting_record(transfer_id)
            .await
            .expect("requesting record missing");
        assert!(record.is_done());
    })
    .await
    .expect("transfer did not complete in time");

    assert_eq!(bob.sinks.finished("big.bin").unwrap(), data);

    alice.ctx.close().await;
    bob.ctx.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn locally_resident_chunks_survive_a_restart_unsent() {
    let io = Arc::new(MemorySignaling::new());
    let alice = endpoint("alice", &io);
    let bob = endpoint("bob", &io);

    let space = Uuid::new_v4();
    let file_id = Uuid::new_v4();
    let data = pattern(3 * CHUNK_SIZE);
    alice.store.put_file(space, file_id, &data, CHUNK_SIZE);

    // An earlier, interrupted attempt already persisted chunk 0 on bob.
    bob.store.put_file(space, file_id, &data[..CHUNK_SIZE], CHUNK_SIZE);

    let entry = FileEntry {
        space_id: space,
        id: file_id,
        name: "resume.bin".into(),
        path: "/".into(),
        size: data.len() as u64,
        origin: "alice".into(),
    };

    timeout(Duration::from_secs(120), async {
        bob.engine
            .start_transfer("download", "/", vec![entry])
            .await
            .expect("announce failed");
        while bob.sinks.finished("resume.bin").is_none() {
            sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("resumed transfer did not complete in time");

    assert_eq!(bob.sinks.finished("resume.bin").unwrap(), data);

    // The server only ever saw two missing chunks for this entry.
    let serving = alice.engine.serving().await;
    assert_eq!(serving.len(), 1);
    assert!(serving[0].is_done());

    alice.ctx.close().await;
    bob.ctx.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn overlapping_connects_share_one_link_with_one_offerer() {
    let io = Arc::new(MemorySignaling::new());
    let (carol_ctx, _carol_events) = SpaceContext::open("carol", io.clone(), loopback_config());
    let (dave_ctx, _dave_events) = SpaceContext::open("dave", io.clone(), loopback_config());

    let carol_links = carol_ctx.links();
    let dave_links = dave_ctx.links();

    let connecting = {
        let links = carol_links.clone();
        tokio::spawn(async move { links.connect("dave").await })
    };

    // Dave's side registers the inbound link first, then connects back
    // while carol's handshake is still in flight.
    timeout(Duration::from_secs(30), async {
        while dave_links.peers().await.is_empty() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("inbound init never registered");

    timeout(Duration::from_secs(60), dave_links.connect("carol"))
        .await
        .expect("dave connect timed out")
        .expect("dave connect failed");
    timeout(Duration::from_secs(60), connecting)
        .await
        .expect("carol connect timed out")
        .unwrap()
        .expect("carol connect failed");

    assert_eq!(carol_links.peers().await, vec!["dave".to_string()]);
    assert_eq!(dave_links.peers().await, vec!["carol".to_string()]);

    let carol_link = carol_links.link_for("dave").await.unwrap();
    let dave_link = dave_links.link_for("carol").await.unwrap();
    assert!(
        carol_link.is_offerer() != dave_link.is_offerer(),
        "exactly one side offers"
    );
    assert!(carol_link.is_offerer(), "the ack observer is the offerer");

    carol_ctx.close().await;
    dave_ctx.close().await;
}
