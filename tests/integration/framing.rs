//! Command-frame properties: exact size, round-trip, and the chunk-size
//! bound, checked through the public wire API.

use conduit_core::ids::CHUNK_ID_DEFAULT;
use conduit_core::wire::{
    BlockType, CommandFrame, ControlCode, FrameData, WireError, FRAME_SIZE, MAX_CHUNK_SIZE,
    PROTOCOL_VERSION_SERVER,
};
use conduit_core::{ChunkId, PeerId};

fn sample_frames() -> Vec<CommandFrame> {
    let peer = PeerId::generate();
    let chunk = ChunkId::generate();

    let mut put = CommandFrame::command(ControlCode::Put, peer, chunk, BlockType::Normal);
    put.chunk_size = 4096;

    let mut get = CommandFrame::command(ControlCode::Get, peer, chunk, BlockType::TransferOnly);
    if let FrameData::BlockInfo {
        protocol_data_offset,
        ..
    } = &mut get.data
    {
        *protocol_data_offset = 128;
    }

    let remove =
        CommandFrame::command(ControlCode::Remove, peer, chunk, BlockType::TransferOnly);
    let flush = CommandFrame::command(
        ControlCode::FlushPeerSessions,
        peer,
        CHUNK_ID_DEFAULT,
        BlockType::Normal,
    );

    vec![
        CommandFrame::value(ControlCode::GetProtocolVersion, peer, 1),
        CommandFrame::value(ControlCode::SetProtocolVersion, peer, PROTOCOL_VERSION_SERVER),
        CommandFrame::value(ControlCode::GetDataBlockSize, peer, 0),
        put,
        get,
        remove,
        flush,
        put.ack(),
        put.error_ack(5),
    ]
}

#[test]
fn every_frame_round_trips_at_exactly_48_bytes() {
    for frame in sample_frames() {
        let bytes = frame.encode().expect("encode");
        assert_eq!(bytes.len(), FRAME_SIZE, "frame {:?}", frame.cntrl_code);

        let decoded = CommandFrame::decode(&bytes).expect("decode");
        assert_eq!(decoded, frame, "frame {:?}", frame.cntrl_code);
    }
}

#[test]
fn chunk_size_bound_is_enforced_before_any_payload() {
    let mut frame = CommandFrame::command(
        ControlCode::Put,
        PeerId::generate(),
        ChunkId::generate(),
        BlockType::Normal,
    );

    frame.chunk_size = MAX_CHUNK_SIZE;
    assert!(frame.encode().is_ok(), "the cap itself is legal");

    frame.chunk_size = MAX_CHUNK_SIZE + 1;
    assert!(matches!(frame.encode(), Err(WireError::ChunkTooLarge(_))));

    // And on the decode side, from raw bytes.
    frame.chunk_size = 0;
    let mut bytes = frame.encode().unwrap();
    bytes[40..44].copy_from_slice(&(MAX_CHUNK_SIZE + 1).to_be_bytes());
    assert!(matches!(
        CommandFrame::decode(&bytes),
        Err(WireError::ChunkTooLarge(_))
    ));
}

#[test]
fn unknown_tags_are_rejected_at_decode_time() {
    let frame = CommandFrame::value(ControlCode::GetProtocolVersion, PeerId::generate(), 1);
    let mut bytes = frame.encode().unwrap();

    bytes[0..2].copy_from_slice(&0u16.to_be_bytes()); // the None code
    assert!(matches!(
        CommandFrame::decode(&bytes),
        Err(WireError::UnknownControlCode(0))
    ));

    bytes[0..2].copy_from_slice(&42u16.to_be_bytes());
    assert!(matches!(
        CommandFrame::decode(&bytes),
        Err(WireError::UnknownControlCode(42))
    ));
}
