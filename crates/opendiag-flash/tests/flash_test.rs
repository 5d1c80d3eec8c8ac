//! End-to-end flash programming tests on a mocked UDS stack.

use std::sync::Arc;

use parking_lot::Mutex;

use opendiag_can::{CanConfig, CanId, CanProtocol, MockTransport};
use opendiag_flash::{
    FlashBlock, FlashConfig, FlashError, FlashFile, FlashFileFormat, FlashManager, FlashRegion,
    FlashState,
};
use opendiag_uds::{SeedToKey, UdsClient, UdsConfig};

fn response_id() -> CanId {
    CanId::standard(0x7E8).unwrap()
}

fn uds_over(transport: Arc<MockTransport>) -> Arc<UdsClient> {
    let can = Arc::new(CanProtocol::new(transport, CanConfig::default()).unwrap());
    let config = UdsConfig {
        timeout_ms: 250,
        ..UdsConfig::default()
    };
    Arc::new(UdsClient::new(can, config).unwrap())
}

fn xor_key() -> SeedToKey {
    Arc::new(|seed: &[u8], _level| seed.iter().take(4).map(|b| b ^ 0xFF).collect())
}

fn block_data() -> Vec<u8> {
    (0..512).map(|i| (i % 251) as u8).collect()
}

/// Script the happy-path UDS conversation for one 512-byte block at
/// 0x8000.
fn script_programming(transport: &MockTransport, read_back: &[u8]) {
    // Programming session
    transport.respond(
        vec![0x02, 0x10, 0x02],
        response_id(),
        vec![vec![0x02, 0x50, 0x02]],
    );
    // Security: seed then key (seed xor 0xFF)
    transport.respond(
        vec![0x02, 0x27, 0x01],
        response_id(),
        vec![vec![0x06, 0x67, 0x01, 0xAA, 0xBB, 0xCC, 0xDD]],
    );
    transport.respond(
        vec![0x06, 0x27, 0x02, 0x55, 0x44, 0x33, 0x22],
        response_id(),
        vec![vec![0x02, 0x67, 0x02]],
    );
    // Erase routine (region configured tests only; prefix match)
    transport.respond(
        vec![0x31, 0x01, 0xFF, 0x00],
        response_id(),
        vec![vec![0x05, 0x71, 0x01, 0xFF, 0x00, 0x00]],
    );
    // Download: maxNumberOfBlockLength 0x0102 -> 256 usable
    transport.respond(
        vec![0x34, 0x00, 0x44],
        response_id(),
        vec![vec![0x04, 0x74, 0x20, 0x01, 0x02]],
    );
    // Transfer data + exit
    transport.respond(vec![0x36], response_id(), vec![vec![0x02, 0x76, 0x01]]);
    transport.respond(vec![0x01, 0x37], response_id(), vec![vec![0x01, 0x77]]);
    // Verification read-back
    let mut verify_reply = vec![0x63];
    verify_reply.extend_from_slice(read_back);
    transport.respond(vec![0x23, 0x44], response_id(), vec![verify_reply]);
    // Cleanup path
    transport.respond(
        vec![0x02, 0x10, 0x01],
        response_id(),
        vec![vec![0x02, 0x50, 0x01]],
    );
}

fn single_block_file() -> FlashFile {
    FlashFile::from_blocks(
        FlashFileFormat::Binary,
        vec![FlashBlock::new(0x8000, block_data())],
    )
}

#[tokio::test]
async fn programs_one_block_in_two_chunks() {
    let transport = Arc::new(MockTransport::new());
    script_programming(&transport, &block_data());
    let uds = uds_over(transport.clone());

    let config = FlashConfig {
        seed_to_key: Some(xor_key()),
        regions: vec![FlashRegion {
            name: "application".into(),
            start_address: 0x8000,
            end_address: 0xFFFF,
            protected: false,
        }],
        ..FlashConfig::default()
    };
    let manager = FlashManager::new(uds, config);

    let stages: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = stages.clone();
    let stats = manager
        .program(
            &single_block_file(),
            Some(Arc::new(move |op, _cur, _total, _msg| {
                sink.lock().push(op.to_string());
            })),
        )
        .await
        .unwrap();

    assert_eq!(stats.blocks_written, 1);
    assert_eq!(stats.bytes_written, 512);
    assert_eq!(stats.blocks_failed, 0);
    assert_eq!(manager.state(), FlashState::Done);

    // Two TransferData chunks with sequence counters 1 and 2.
    let transfers: Vec<Vec<u8>> = transport
        .sent_payloads()
        .into_iter()
        .filter(|p| p.first() == Some(&0x36))
        .collect();
    assert_eq!(transfers.len(), 2);
    assert_eq!(transfers[0][1], 1);
    assert_eq!(transfers[1][1], 2);
    assert_eq!(transfers[0].len(), 2 + 256);
    assert_eq!(transfers[1].len(), 2 + 256);

    let stages = stages.lock();
    for expected in ["EnteringProgramming", "Unlocking", "Programming", "Verifying", "Complete"] {
        assert!(
            stages.iter().any(|s| s == expected),
            "missing stage {expected} in {stages:?}"
        );
    }
}

#[tokio::test]
async fn erase_routine_runs_for_overlapping_regions() {
    let transport = Arc::new(MockTransport::new());
    script_programming(&transport, &block_data());
    let uds = uds_over(transport.clone());

    let config = FlashConfig {
        seed_to_key: Some(xor_key()),
        erase_before_write: true,
        regions: vec![
            FlashRegion {
                name: "application".into(),
                start_address: 0x8000,
                end_address: 0xFFFF,
                protected: false,
            },
            FlashRegion {
                name: "calibration".into(),
                start_address: 0x1_0000,
                end_address: 0x1_FFFF,
                protected: false,
            },
        ],
        ..FlashConfig::default()
    };
    let manager = FlashManager::new(uds, config);
    manager.program(&single_block_file(), None).await.unwrap();

    // Only the overlapped region is erased.
    let erases: Vec<Vec<u8>> = transport
        .sent_payloads()
        .into_iter()
        .filter(|p| p.first() == Some(&0x31))
        .collect();
    assert_eq!(erases.len(), 1);
    // RoutineControl Start 0xFF00 with [addr:4BE][size:4BE]
    assert_eq!(&erases[0][..4], &[0x31, 0x01, 0xFF, 0x00]);
    assert_eq!(&erases[0][4..8], &0x8000u32.to_be_bytes());
    assert_eq!(&erases[0][8..12], &0x8000u32.to_be_bytes());
}

#[tokio::test]
async fn verification_mismatch_reports_the_address() {
    let transport = Arc::new(MockTransport::new());
    let mut corrupted = block_data();
    corrupted[3] ^= 0xFF;
    script_programming(&transport, &corrupted);
    let uds = uds_over(transport.clone());

    let config = FlashConfig {
        seed_to_key: Some(xor_key()),
        ..FlashConfig::default()
    };
    let manager = FlashManager::new(uds, config);

    let err = manager.program(&single_block_file(), None).await.unwrap_err();
    match err {
        FlashError::VerificationMismatch { address } => assert_eq!(address, 0x8003),
        other => panic!("expected VerificationMismatch, got {other:?}"),
    }
    assert_eq!(manager.state(), FlashState::Failed);
}

#[tokio::test]
async fn overlapping_blocks_are_rejected_before_any_traffic() {
    let transport = Arc::new(MockTransport::new());
    let uds = uds_over(transport.clone());
    let manager = FlashManager::new(uds, FlashConfig::default());

    let file = FlashFile::from_blocks(
        FlashFileFormat::Binary,
        vec![
            FlashBlock::new(0x0100, vec![0u8; 16]),
            FlashBlock::new(0x0108, vec![0u8; 16]),
        ],
    );
    assert!(!file.validate());

    let err = manager.program(&file, None).await.unwrap_err();
    assert!(matches!(err, FlashError::InvalidFile(_)));
    assert!(transport.sent_payloads().is_empty());
}

#[tokio::test]
async fn protected_region_blocks_the_run() {
    let transport = Arc::new(MockTransport::new());
    let uds = uds_over(transport.clone());
    let config = FlashConfig {
        regions: vec![FlashRegion {
            name: "bootloader".into(),
            start_address: 0x8000,
            end_address: 0xFFFF,
            protected: true,
        }],
        ..FlashConfig::default()
    };
    let manager = FlashManager::new(uds, config);

    let err = manager.program(&single_block_file(), None).await.unwrap_err();
    assert!(matches!(err, FlashError::RegionProtected(0x8000)));
    assert!(transport.sent_payloads().is_empty());
}

#[tokio::test]
async fn security_refusal_fails_the_run() {
    let transport = Arc::new(MockTransport::new());
    transport.respond(
        vec![0x02, 0x10, 0x02],
        response_id(),
        vec![vec![0x02, 0x50, 0x02]],
    );
    transport.respond(
        vec![0x02, 0x27, 0x01],
        response_id(),
        vec![vec![0x03, 0x7F, 0x27, 0x33]],
    );
    transport.respond(
        vec![0x02, 0x10, 0x01],
        response_id(),
        vec![vec![0x02, 0x50, 0x01]],
    );
    let uds = uds_over(transport);

    let config = FlashConfig {
        seed_to_key: Some(xor_key()),
        ..FlashConfig::default()
    };
    let manager = FlashManager::new(uds, config);

    let err = manager.program(&single_block_file(), None).await.unwrap_err();
    assert!(matches!(err, FlashError::SecurityDenied(_)));
    assert_eq!(manager.state(), FlashState::Failed);
}
