//! Dispatch worker tests: filtering, sink ordering, statistics.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use opendiag_can::{
    CanConfig, CanFilter, CanFrame, CanId, CanProtocol, FrameSink, MockTransport,
};

struct RecordingSink {
    label: &'static str,
    log: Arc<Mutex<Vec<(&'static str, u32)>>>,
}

impl FrameSink for RecordingSink {
    fn on_frame(&self, frame: &CanFrame) {
        self.log.lock().push((self.label, frame.id.raw()));
    }
}

fn proto() -> (Arc<MockTransport>, Arc<CanProtocol>) {
    let transport = Arc::new(MockTransport::new());
    let proto = Arc::new(CanProtocol::new(transport.clone(), CanConfig::default()).unwrap());
    (transport, proto)
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn sinks_see_frames_in_receive_order() {
    let (transport, proto) = proto();
    let log = Arc::new(Mutex::new(Vec::new()));

    proto.subscribe(Arc::new(RecordingSink {
        label: "first",
        log: log.clone(),
    }));
    proto.subscribe(Arc::new(RecordingSink {
        label: "second",
        log: log.clone(),
    }));

    transport.inject(CanId::standard(0x100).unwrap(), vec![0x01]);
    transport.inject(CanId::standard(0x200).unwrap(), vec![0x02]);
    settle().await;

    let log = log.lock();
    // Each frame reaches every sink in subscription order before the next
    // frame is dispatched.
    assert_eq!(
        *log,
        vec![
            ("first", 0x100),
            ("second", 0x100),
            ("first", 0x200),
            ("second", 0x200),
        ]
    );
    drop(log);
    proto.shutdown().await;
}

#[tokio::test]
async fn drop_filter_suppresses_delivery() {
    let (transport, proto) = proto();
    let log = Arc::new(Mutex::new(Vec::new()));

    proto.install_filter(CanFilter::drop(CanId::standard(0x7E8).unwrap(), 0x7FF));
    proto.subscribe(Arc::new(RecordingSink {
        label: "sink",
        log: log.clone(),
    }));

    transport.inject(CanId::standard(0x7E8).unwrap(), vec![0xAA]);
    transport.inject(CanId::standard(0x7E9).unwrap(), vec![0xBB]);
    settle().await;

    assert_eq!(*log.lock(), vec![("sink", 0x7E9)]);

    let stats = proto.statistics();
    assert_eq!(stats.frames_received, 1);
    assert_eq!(stats.frames_filtered, 1);
    proto.shutdown().await;
}

#[tokio::test]
async fn filter_kind_must_match() {
    let (transport, proto) = proto();
    let log = Arc::new(Mutex::new(Vec::new()));

    // Drop extended 0x7E8; the standard frame with the same raw id passes.
    proto.install_filter(CanFilter::drop(
        CanId::extended(0x7E8).unwrap(),
        0x1FFF_FFFF,
    ));
    proto.subscribe(Arc::new(RecordingSink {
        label: "sink",
        log: log.clone(),
    }));

    transport.inject(CanId::standard(0x7E8).unwrap(), vec![0x01]);
    transport.inject(CanId::extended(0x7E8).unwrap(), vec![0x02]);
    settle().await;

    assert_eq!(*log.lock(), vec![("sink", 0x7E8)]);
    proto.shutdown().await;
}

#[tokio::test]
async fn unsubscribing_the_last_sink_pauses_dispatch() {
    let (transport, proto) = proto();
    let log = Arc::new(Mutex::new(Vec::new()));

    let id = proto.subscribe(Arc::new(RecordingSink {
        label: "sink",
        log: log.clone(),
    }));
    transport.inject(CanId::standard(0x100).unwrap(), vec![0x01]);
    settle().await;
    assert_eq!(log.lock().len(), 1);

    assert!(proto.unsubscribe(id));
    settle().await;
    let received_before = proto.statistics().frames_received;

    transport.inject(CanId::standard(0x100).unwrap(), vec![0x02]);
    settle().await;
    assert_eq!(log.lock().len(), 1);
    assert_eq!(proto.statistics().frames_received, received_before);
    proto.shutdown().await;
}
