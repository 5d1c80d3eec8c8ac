//! End-to-end UDS client tests over the mock transport.

use std::sync::Arc;

use opendiag_can::{CanConfig, CanId, CanProtocol, MockTransport};
use opendiag_uds::{
    reset_type, RoutineControl, SeedToKey, UdsClient, UdsConfig, UdsError, UdsSession,
};

fn response_id() -> CanId {
    CanId::standard(0x7E8).unwrap()
}

fn client_over(transport: Arc<MockTransport>) -> UdsClient {
    let can = Arc::new(CanProtocol::new(transport, CanConfig::default()).unwrap());
    let config = UdsConfig {
        timeout_ms: 250,
        ..UdsConfig::default()
    };
    UdsClient::new(can, config).unwrap()
}

#[tokio::test]
async fn read_did_strips_the_echo() {
    let transport = Arc::new(MockTransport::new());
    transport.respond(
        vec![0x03, 0x22, 0xF1, 0x8C],
        response_id(),
        vec![vec![0x07, 0x62, 0xF1, 0x8C, 0x53, 0x4E, 0x30, 0x31]],
    );
    let client = client_over(transport);

    let data = client.read_data_by_id(0xF18C).await.unwrap();
    assert_eq!(data, b"SN01");
    client.shutdown();
}

#[tokio::test]
async fn pending_responses_resolve_to_the_final_positive() {
    // ECU answers `7F 22 78` three times before delivering the VIN; the
    // caller sees one successful exchange and one counted request.
    let transport = Arc::new(MockTransport::new());
    let vin = b"1HGCM82633A123456";
    let mut reply = vec![0x14, 0x62, 0xF1, 0x90];
    reply.extend_from_slice(vin);
    transport.respond(
        vec![0x03, 0x22, 0xF1, 0x90],
        response_id(),
        vec![
            vec![0x03, 0x7F, 0x22, 0x78],
            vec![0x03, 0x7F, 0x22, 0x78],
            vec![0x03, 0x7F, 0x22, 0x78],
            reply,
        ],
    );
    let client = client_over(transport);

    let data = client.read_data_by_id(0xF190).await.unwrap();
    assert_eq!(data, vin);

    let stats = client.statistics();
    assert_eq!(stats.requests_sent, 1);
    assert_eq!(stats.responses_received, 1);
    assert_eq!(stats.negative_responses, 0);
    client.shutdown();
}

#[tokio::test]
async fn session_change_invalidates_security_unlocks() {
    let transport = Arc::new(MockTransport::new());
    // Extended session
    transport.respond(
        vec![0x02, 0x10, 0x03],
        response_id(),
        vec![vec![0x06, 0x50, 0x03, 0x00, 0x19, 0x01, 0xF4]],
    );
    // Back to default
    transport.respond(
        vec![0x02, 0x10, 0x01],
        response_id(),
        vec![vec![0x06, 0x50, 0x01, 0x00, 0x19, 0x01, 0xF4]],
    );
    // Seed for level 1
    transport.respond(
        vec![0x02, 0x27, 0x01],
        response_id(),
        vec![vec![0x06, 0x67, 0x01, 0xAA, 0xBB, 0xCC, 0xDD]],
    );
    // Key = seed bytes xor 0xFF
    transport.respond(
        vec![0x06, 0x27, 0x02, 0x55, 0x44, 0x33, 0x22],
        response_id(),
        vec![vec![0x02, 0x67, 0x02]],
    );
    // Secured DID read is refused once the lock is back
    transport.respond(
        vec![0x03, 0x22, 0x12, 0x34],
        response_id(),
        vec![vec![0x03, 0x7F, 0x22, 0x33]],
    );
    let client = client_over(transport);

    client
        .diagnostic_session_control(UdsSession::ExtendedDiagnostic)
        .await
        .unwrap();
    assert_eq!(client.current_session(), UdsSession::ExtendedDiagnostic);

    let derive: SeedToKey = Arc::new(|seed, _level| seed.iter().map(|b| b ^ 0xFF).collect());
    client.unlock_security(1, &derive).await.unwrap();
    assert!(client.is_unlocked(1));

    client
        .diagnostic_session_control(UdsSession::Default)
        .await
        .unwrap();
    assert!(!client.is_unlocked(1));

    let err = client.read_data_by_id(0x1234).await.unwrap_err();
    match err {
        UdsError::SecurityDenied { service_id, nrc } => {
            assert_eq!(service_id, 0x22);
            assert_eq!(u8::from(nrc), 0x33);
        }
        other => panic!("expected SecurityDenied, got {other:?}"),
    }
    client.shutdown();
}

#[tokio::test]
async fn ecu_reset_drops_session_and_unlocks() {
    let transport = Arc::new(MockTransport::new());
    transport.respond(
        vec![0x02, 0x10, 0x02],
        response_id(),
        vec![vec![0x02, 0x50, 0x02]],
    );
    transport.respond(
        vec![0x02, 0x27, 0x01],
        response_id(),
        vec![vec![0x03, 0x67, 0x01, 0x00]], // zero seed: already unlocked
    );
    transport.respond(
        vec![0x02, 0x11, 0x01],
        response_id(),
        vec![vec![0x03, 0x51, 0x01, 0x05]],
    );
    let client = client_over(transport);

    client
        .diagnostic_session_control(UdsSession::Programming)
        .await
        .unwrap();
    let derive: SeedToKey = Arc::new(|seed, _| seed.to_vec());
    client.unlock_security(1, &derive).await.unwrap();
    assert!(client.is_unlocked(1));

    let power_down = client.ecu_reset(reset_type::HARD_RESET).await.unwrap();
    assert_eq!(power_down, Some(0x05));
    assert_eq!(client.current_session(), UdsSession::Default);
    assert!(!client.is_unlocked(1));
    client.shutdown();
}

#[tokio::test]
async fn routine_control_validates_the_rid_echo() {
    let transport = Arc::new(MockTransport::new());
    transport.respond(
        vec![0x04, 0x31, 0x01, 0xFF, 0x00],
        response_id(),
        vec![vec![0x05, 0x71, 0x01, 0xFF, 0x00, 0x00]],
    );
    let client = client_over(transport);

    let info = client
        .routine_control(RoutineControl::Start, 0xFF00, &[])
        .await
        .unwrap();
    assert_eq!(info, vec![0x00]);
    client.shutdown();
}

#[tokio::test]
async fn request_download_parses_max_block_length() {
    let transport = Arc::new(MockTransport::new());
    // lengthFormatIdentifier 0x20: two bytes of maxNumberOfBlockLength.
    // 0x0102 = 258, minus the two bytes of 0x36 overhead = 256 usable.
    transport.respond(
        vec![0x34, 0x00, 0x44],
        response_id(),
        vec![vec![0x04, 0x74, 0x20, 0x01, 0x02]],
    );
    let client = client_over(transport);

    let max = client.request_download(0x0000_8000, 512).await.unwrap();
    assert_eq!(max, 256);
    client.shutdown();
}

#[tokio::test]
async fn response_with_wrong_service_echo_is_rejected() {
    let transport = Arc::new(MockTransport::new());
    transport.respond(
        vec![0x02, 0x3E, 0x00],
        response_id(),
        vec![vec![0x02, 0x50, 0x01]], // SessionControl echo for a TesterPresent
    );
    let client = client_over(transport);

    let err = client.tester_present(false).await.unwrap_err();
    assert!(matches!(err, UdsError::InvalidResponse(_)));
    client.shutdown();
}

#[tokio::test]
async fn timeout_is_counted() {
    let transport = Arc::new(MockTransport::new());
    let client = client_over(transport);

    let err = client.read_data_by_id(0xF190).await.unwrap_err();
    assert!(matches!(err, UdsError::Timeout));
    assert_eq!(client.statistics().timeouts, 1);
    client.shutdown();
}
