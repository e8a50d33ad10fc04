use keycreator_core::{
    ClassicKey, Error, HitagParams, MifareClassicParams, SessionConfig, TransponderConfiguration,
};
use keycreator_erp::InMemoryErp;
use keycreator_hardware::mock::VirtualTag;
use keycreator_hardware::{AnyLink, ChannelOptions, CommandChannel, MockLink, Twn4Reader, VirtualReader};
use keycreator_session::{Maintenance, SessionCoordinator, SessionState};
use std::time::Duration;

const HITAG_UID: [u8; 4] = [0x04, 0x4A, 0x3C, 0x91];
const CLASSIC_UID: [u8; 4] = [0x9F, 0x3C, 0x11, 0x02];

fn reader(sim: &VirtualReader) -> Twn4Reader {
    let (link, _handle) = MockLink::with_responder(sim.clone());
    let (channel, _worker) = CommandChannel::spawn(AnyLink::Mock(link), ChannelOptions::default());
    Twn4Reader::new(channel)
}

fn config() -> TransponderConfiguration {
    TransponderConfiguration::new("TC-1", "CUST-1")
        .with_hitag(HitagParams { feig_coding: true })
        .with_mifare_classic(MifareClassicParams {
            key_a: ClassicKey::from_hex("A1B2C3D4E5F6").unwrap(),
            key_b: None,
            sector: 1,
            skip_bytes: 0,
            read_bytes: 4,
        })
}

fn settings() -> SessionConfig {
    SessionConfig {
        poll_interval_ms: 1,
        maintenance_grace_ms: 50,
        ..SessionConfig::default()
    }
}

fn setup() -> (VirtualReader, InMemoryErp, SessionCoordinator<InMemoryErp>) {
    let sim = VirtualReader::new();
    sim.place(VirtualTag::hitag(HITAG_UID));
    sim.place(VirtualTag::classic(CLASSIC_UID));
    let erp = InMemoryErp::new().with_configuration(config());
    let mut coordinator = SessionCoordinator::new(reader(&sim), erp.clone(), settings());
    coordinator.set_muted(true);
    (sim, erp, coordinator)
}

async fn wait_for(mut reached: impl FnMut() -> bool) {
    for _ in 0..1000 {
        if reached() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn test_format_pauses_loop_and_key_is_provisioned_again() {
    let (sim, erp, mut coordinator) = setup();
    coordinator.start_session(config(), Some("200017")).unwrap();

    let handle = coordinator.handle();
    let mut maintenance = Maintenance::new(
        reader(&sim),
        erp.clone(),
        handle.clone(),
        settings().maintenance_grace(),
    )
    .with_detection(5, Duration::from_millis(5));
    maintenance.set_muted(true);

    let (run, report) = tokio::join!(coordinator.run(), async {
        wait_for(|| erp.records().iter().any(|r| r.code == "200017")).await;
        let report = maintenance.format().await;
        wait_for(|| erp.records().iter().any(|r| r.code == "200018")).await;
        handle.cancel();
        report
    });

    run.unwrap();
    let report = report.unwrap();
    assert!(report.is_complete());
    assert_eq!(report.deleted, vec!["200017".to_string()]);

    let records = erp.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].hitag_uid.as_deref(), Some("044A3C91"));
    assert_eq!(records[0].mfcl_uid.as_deref(), Some("9F3C1102"));

    assert!(coordinator.machine().has_visited(SessionState::Paused));
    assert_eq!(coordinator.state(), SessionState::Idle);
}

#[tokio::test]
async fn test_newer_session_aborts_running_loop() {
    let (_sim, _erp, mut coordinator) = setup();
    let id = coordinator.start_session(config(), None).unwrap();
    let handle = coordinator.handle();

    let (run, ()) = tokio::join!(coordinator.run(), async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.stop();
    });

    let err = run.unwrap_err();
    assert!(matches!(err, Error::StaleSession { captured, .. } if captured == id));
}

#[tokio::test]
async fn test_exhausted_window_ends_session() {
    let (_sim, erp, mut coordinator) = setup();
    coordinator.start_session(config(), Some("899999")).unwrap();

    tokio::time::timeout(Duration::from_secs(5), coordinator.run())
        .await
        .expect("loop should end by itself")
        .unwrap();

    assert_eq!(erp.records()[0].code, "899999");
    assert_eq!(coordinator.current_number().unwrap().to_padded(), "899999");
    assert_eq!(coordinator.context().unwrap().provisioned(), 1);
}
