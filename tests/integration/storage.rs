//! Chunk storage driven over the wire: Put/Get/Remove command codes against
//! a live broker, including replay across a broker restart.

use std::sync::Arc;

use conduit_core::block::BlockPool;
use conduit_core::wire::{
    BlockType, CommandFrame, ControlCode, FrameData, BLOCK_FLAG_IGNORE_IF_NOT_FOUND,
};
use conduit_core::{ChunkId, DataBlock, PeerId};
use conduit_messaging::storage::{ChunkStorage, MultiFileChunkStorage, SingleFileChunkStorage};
use conduit_messaging::transfer::{error_codes, BlockTransferConnection, FrameStream};
use conduit_messaging::ControlToken;
use tokio::net::TcpStream;

use crate::{start_broker, temp_dir, TestBroker};

/// Connect to the broker's inbound port the way a storage client does.
async fn storage_session(broker: &TestBroker, peer: PeerId) -> FrameStream<TcpStream> {
    let tcp = TcpStream::connect(("127.0.0.1", broker.port))
        .await
        .expect("connect to broker");
    let conn = BlockTransferConnection::connect(
        tcp,
        BlockPool::new(64 * 1024),
        peer,
        ControlToken::none(),
    )
    .await
    .expect("version exchange");
    conn.into_frames()
}

async fn put(
    frames: &mut FrameStream<TcpStream>,
    peer: PeerId,
    chunk: ChunkId,
    data: &[u8],
) -> CommandFrame {
    let mut frame = CommandFrame::command(ControlCode::Put, peer, chunk, BlockType::TransferOnly);
    frame.chunk_size = data.len() as u32;
    frames.write_frame(&frame, Some(data)).await.expect("write put");
    let (ack, _) = frames.read_frame().await.expect("read ack").expect("ack");
    ack
}

async fn get(
    frames: &mut FrameStream<TcpStream>,
    peer: PeerId,
    chunk: ChunkId,
) -> (CommandFrame, Option<DataBlock>) {
    let frame = CommandFrame::command(ControlCode::Get, peer, chunk, BlockType::TransferOnly);
    frames.write_frame(&frame, None).await.expect("write get");
    frames.read_frame().await.expect("read ack").expect("ack")
}

async fn remove(
    frames: &mut FrameStream<TcpStream>,
    peer: PeerId,
    chunk: ChunkId,
    ignore_missing: bool,
) -> CommandFrame {
    let mut frame =
        CommandFrame::command(ControlCode::Remove, peer, chunk, BlockType::TransferOnly);
    if ignore_missing {
        if let FrameData::BlockInfo { block_flags, .. } = &mut frame.data {
            *block_flags = BLOCK_FLAG_IGNORE_IF_NOT_FOUND;
        }
    }
    frames.write_frame(&frame, None).await.expect("write remove");
    let (ack, _) = frames.read_frame().await.expect("read ack").expect("ack");
    ack
}

/// Scenario: save two chunks, remove one, restart the broker on the same
/// root, and verify what survived — multi-file variant.
#[tokio::test]
async fn multi_file_storage_replays_across_restart() {
    let root = temp_dir("storage-multi");
    let peer = PeerId::generate();
    let id1 = ChunkId::generate();
    let id2 = ChunkId::generate();

    {
        let storage: Arc<dyn ChunkStorage> =
            Arc::new(MultiFileChunkStorage::open(&root).expect("open storage"));
        let broker = start_broker(None, Some(storage.clone())).await;
        let mut frames = storage_session(&broker, peer).await;

        assert!(!put(&mut frames, peer, id1, b"payload A").await.is_err());
        assert!(!put(&mut frames, peer, id2, b"payload B").await.is_err());
        assert!(!remove(&mut frames, peer, id1, false).await.is_err());

        broker.stop().await;
        storage.dispose();
    }

    // Fresh broker, same root.
    let storage: Arc<dyn ChunkStorage> =
        Arc::new(MultiFileChunkStorage::open(&root).expect("reopen storage"));
    let broker = start_broker(None, Some(storage)).await;
    let mut frames = storage_session(&broker, peer).await;

    let (ack, _) = get(&mut frames, peer, id1).await;
    assert!(ack.is_err());
    assert_eq!(ack.error_code, error_codes::CHUNK_NOT_FOUND);

    let (ack, payload) = get(&mut frames, peer, id2).await;
    assert!(!ack.is_err());
    assert_eq!(payload.expect("payload").as_slice(), b"payload B");

    broker.stop().await;
    let _ = std::fs::remove_dir_all(&root);
}

/// The same scenario against the single-file append log: the scanner must
/// reconstruct only the live record.
#[tokio::test]
async fn single_file_storage_replays_across_restart() {
    let root = temp_dir("storage-single");
    let peer = PeerId::generate();
    let id1 = ChunkId::generate();
    let id2 = ChunkId::generate();

    {
        let storage: Arc<dyn ChunkStorage> =
            Arc::new(SingleFileChunkStorage::open(&root).expect("open storage"));
        let broker = start_broker(None, Some(storage.clone())).await;
        let mut frames = storage_session(&broker, peer).await;

        assert!(!put(&mut frames, peer, id1, b"first payload").await.is_err());
        assert!(!put(&mut frames, peer, id2, b"second payload").await.is_err());
        assert!(!remove(&mut frames, peer, id1, false).await.is_err());

        broker.stop().await;
        storage.dispose();
    }

    // The log still physically contains both records.
    let log = root.join("chunks").join("data.bin");
    let len = std::fs::metadata(&log).expect("log exists").len();
    assert_eq!(len, 2 * 40 + 13 + 14, "two headers plus both payloads");

    let storage: Arc<dyn ChunkStorage> =
        Arc::new(SingleFileChunkStorage::open(&root).expect("reopen storage"));
    let broker = start_broker(None, Some(storage)).await;
    let mut frames = storage_session(&broker, peer).await;

    let (ack, _) = get(&mut frames, peer, id1).await;
    assert!(ack.is_err());
    assert_eq!(ack.error_code, error_codes::CHUNK_NOT_FOUND);

    let (ack, payload) = get(&mut frames, peer, id2).await;
    assert!(!ack.is_err());
    assert_eq!(payload.expect("payload").as_slice(), b"second payload");

    broker.stop().await;
    let _ = std::fs::remove_dir_all(&root);
}

/// Save-over-existing supersedes; double remove reports chunk-not-found
/// unless the ignore flag is set.
#[tokio::test]
async fn storage_laws_over_the_wire() {
    let root = temp_dir("storage-laws");
    let storage: Arc<dyn ChunkStorage> =
        Arc::new(MultiFileChunkStorage::open(&root).expect("open storage"));
    let broker = start_broker(None, Some(storage)).await;

    let peer = PeerId::generate();
    let chunk = ChunkId::generate();
    let mut frames = storage_session(&broker, peer).await;

    put(&mut frames, peer, chunk, b"A").await;
    put(&mut frames, peer, chunk, b"B").await;
    let (_, payload) = get(&mut frames, peer, chunk).await;
    assert_eq!(payload.expect("payload").as_slice(), b"B");

    assert!(!remove(&mut frames, peer, chunk, false).await.is_err());

    let again = remove(&mut frames, peer, chunk, false).await;
    assert!(again.is_err());
    assert_eq!(again.error_code, error_codes::CHUNK_NOT_FOUND);

    // The ignore flag turns the same condition into a success.
    assert!(!remove(&mut frames, peer, chunk, true).await.is_err());

    broker.stop().await;
    let _ = std::fs::remove_dir_all(&root);
}

/// Get with the ServerState block type runs the installed server-state
/// callback and returns its document.
#[tokio::test]
async fn server_state_query_runs_the_installed_callback() {
    let broker = start_broker(None, None).await;
    let peer = PeerId::generate();
    let mut frames = storage_session(&broker, peer).await;

    let frame = CommandFrame::command(
        ControlCode::Get,
        peer,
        conduit_core::ids::CHUNK_ID_DEFAULT,
        BlockType::ServerState,
    );
    frames.write_frame(&frame, None).await.expect("write query");

    let (ack, payload) = frames.read_frame().await.expect("read").expect("ack");
    assert!(ack.is_ack());
    assert!(!ack.is_err());

    let state: serde_json::Value =
        serde_json::from_slice(payload.expect("state document").as_slice())
            .expect("valid state JSON");
    assert_eq!(state["peerId"], broker.peer_id.to_string());

    broker.stop().await;
}

/// GetDataBlockSize reports the broker's pooled block capacity.
#[tokio::test]
async fn block_size_query_reports_pool_capacity() {
    let broker = start_broker(None, None).await;
    let peer = PeerId::generate();
    let mut frames = storage_session(&broker, peer).await;

    let frame = CommandFrame::value(ControlCode::GetDataBlockSize, peer, 0);
    frames.write_frame(&frame, None).await.expect("write query");

    let (ack, _) = frames.read_frame().await.expect("read").expect("ack");
    assert!(ack.is_ack());
    assert_eq!(ack.peer_id, broker.peer_id);
    assert_eq!(
        ack.data,
        FrameData::Value(broker.ctx.pool.block_capacity() as u32)
    );

    broker.stop().await;
}
