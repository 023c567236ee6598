//! Frame-level fault injection: a malformed frame tears down only the
//! offending connection and the broker keeps serving everyone else.

use std::time::Duration;

use conduit_core::block::BlockPool;
use conduit_core::wire::{BlockType, CommandFrame, ControlCode, FRAME_SIZE};
use conduit_core::{ChunkId, PeerId};
use conduit_messaging::backend::BackendProcessing;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::{connect_backend, plain_connector, start_broker, CollectingHandler};

/// Scenario: 48 header bytes claiming a 200 MiB chunk, no payload. The
/// broker rejects the frame before reading any payload and closes the
/// connection; nothing is surfaced to other peers.
#[tokio::test]
async fn oversized_frame_closes_only_the_offending_connection() {
    let broker = start_broker(None, None).await;

    // Build a syntactically valid Put frame, then corrupt the chunk size
    // beyond the limit (encode itself refuses to do this).
    let mut frame = CommandFrame::command(
        ControlCode::Put,
        PeerId::generate(),
        ChunkId::generate(),
        BlockType::Normal,
    );
    frame.chunk_size = 1;
    let mut bytes = frame.encode().expect("encode");
    bytes[40..44].copy_from_slice(&(200u32 * 1024 * 1024).to_be_bytes());
    assert_eq!(bytes.len(), FRAME_SIZE);

    let mut tcp = TcpStream::connect(("127.0.0.1", broker.port))
        .await
        .expect("connect");
    tcp.write_all(&bytes).await.expect("send the bad frame");

    // The broker must close without replying.
    let mut buf = [0u8; 64];
    let read = tokio::time::timeout(Duration::from_secs(3), tcp.read(&mut buf))
        .await
        .expect("broker closes promptly")
        .expect("read");
    assert_eq!(read, 0, "expected EOF, got {read} bytes");

    // Other peers are unaffected: a full round trip still works.
    let receiver_peer = PeerId::generate();
    let receiver_handler = CollectingHandler::new();
    let receiver = connect_backend(
        broker.port,
        receiver_peer,
        BlockPool::new(4096),
        receiver_handler.clone(),
        plain_connector(),
    )
    .await;

    let sender_pool = BlockPool::new(4096);
    let sender = connect_backend(
        broker.port,
        PeerId::generate(),
        sender_pool.clone(),
        CollectingHandler::new(),
        plain_connector(),
    )
    .await;

    let mut block = sender_pool.acquire();
    block.copy_from_slice(b"still alive");
    sender
        .dispatch_block(receiver_peer, block)
        .await
        .expect("broker still routes");
    receiver_handler.wait_for(1, Duration::from_secs(3)).await;

    sender.dispose();
    receiver.dispose();
    broker.stop().await;
}

/// Garbage that is not even a frame: same containment.
#[tokio::test]
async fn junk_bytes_do_not_disturb_the_broker() {
    let broker = start_broker(None, None).await;

    let mut tcp = TcpStream::connect(("127.0.0.1", broker.port))
        .await
        .expect("connect");
    tcp.write_all(&[0xffu8; FRAME_SIZE]).await.expect("send junk");

    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(3), tcp.read(&mut buf))
        .await
        .expect("broker closes promptly")
        .expect("read");
    assert_eq!(read, 0);

    // A clean immediate close (a probe) is silently tolerated too.
    let probe = TcpStream::connect(("127.0.0.1", broker.port))
        .await
        .expect("connect probe");
    drop(probe);

    broker.stop().await;
}
