//! End-to-end flows through the engine: packets in, cycle ends, events out.

use std::sync::Arc;

use beaconwatch_core::events::CollectingSink;
use beaconwatch_core::{
    BeaconEngine, BeaconEvent, ChannelSink, Config, FileMonitoringStore, Identifier, ManualClock,
    MonitoringStore, RawPacket, RegionCriteria, RegionState, ScanPipeline,
};
use tempfile::TempDir;

const ADDRESS: &str = "0C:F3:EE:00:11:22";

fn altbeacon(minor: u8, rssi: i32) -> RawPacket {
    let mut bytes = vec![0x02, 0x01, 0x06, 0x1b, 0xff, 0x18, 0x01, 0xbe, 0xac];
    bytes.extend(1u8..=16);
    bytes.extend([0x00, 0x01, 0x00, minor, 0xc5, 0x00]);
    RawPacket::new(ADDRESS, rssi, bytes, 0)
}

fn eddystone_uid(rssi: i32) -> RawPacket {
    let mut bytes = vec![0x02, 0x01, 0x06, 0x03, 0x03, 0xaa, 0xfe, 0x17, 0x16, 0xaa, 0xfe, 0x00, 0xe7];
    bytes.extend(1u8..=10);
    bytes.extend([0, 0, 0, 0, 0, 7, 0, 0]);
    RawPacket::new(ADDRESS, rssi, bytes, 0)
}

fn eddystone_tlm() -> RawPacket {
    let bytes = vec![
        0x02, 0x01, 0x06, 0x11, 0x16, 0xaa, 0xfe, 0x20, 0x00, 0x0b, 0xb8, 0x10, 0x00, 0x00, 0x00,
        0x00, 0x10, 0x00, 0x00, 0x00, 0x20,
    ];
    RawPacket::new(ADDRESS, -70, bytes, 0)
}

fn desk_region() -> RegionCriteria {
    RegionCriteria::new("desk", vec![None, None, Some(Identifier::from_int(2))]).unwrap()
}

#[test]
fn test_telemetry_is_merged_into_ranged_uid_beacon() {
    let mut config = Config::default();
    config.parser.layouts = vec!["eddystone-uid".into()];
    let clock = Arc::new(ManualClock::new(0));
    let engine = BeaconEngine::builder(config)
        .clock(clock.clone())
        .build()
        .unwrap();
    engine
        .start_ranging(RegionCriteria::any("everything").unwrap())
        .unwrap();

    assert!(engine.process_packet(&eddystone_uid(-60)).is_some());
    assert!(engine.process_packet(&eddystone_tlm()).is_none(), "telemetry is folded");
    let merged = engine.process_packet(&eddystone_uid(-62)).unwrap();
    assert_eq!(merged.extra_data_fields(), &[0, 3000, 0x1000, 0x10, 0x20]);

    clock.advance(1_100);
    let report = engine.on_cycle_end();
    assert_eq!(report.beacon_count(), 1);
    let beacon = &report.ranging[0].beacons[0];
    assert_eq!(beacon.packet_count(), 2);
    assert_eq!(beacon.extra_data_fields(), &[0, 3000, 0x1000, 0x10, 0x20]);
    assert!(beacon.distance().is_some());
}

#[test]
fn test_monitoring_state_survives_restart() {
    let dir = TempDir::new().unwrap();
    let store: Arc<dyn MonitoringStore> = Arc::new(FileMonitoringStore::in_directory(dir.path()));

    {
        let sink = Arc::new(CollectingSink::new());
        let engine = BeaconEngine::builder(Config::default())
            .clock(Arc::new(ManualClock::new(0)))
            .store(Arc::clone(&store))
            .sink(sink.clone())
            .build()
            .unwrap();
        engine.start_monitoring(desk_region(), "kiosk").unwrap();
        engine.process_packet(&altbeacon(2, -60));
        engine.on_cycle_end();
        assert_eq!(sink.take().len(), 2);
    }

    let clock = Arc::new(ManualClock::new(50_000));
    let sink = Arc::new(CollectingSink::new());
    let engine = BeaconEngine::builder(Config::default())
        .clock(clock.clone())
        .store(store)
        .sink(sink.clone())
        .build()
        .unwrap();

    assert_eq!(engine.region_state("desk"), Some(RegionState::Inside));
    engine.start_monitoring(desk_region(), "kiosk").unwrap();
    engine.process_packet(&altbeacon(2, -60));
    assert!(sink.take().is_empty(), "no repeated entry after restart");

    clock.advance(10_000);
    let report = engine.on_cycle_end();
    assert_eq!(report.exits.len(), 1);
    match &sink.take()[..] {
        [BeaconEvent::RegionExited { target, .. }, BeaconEvent::RegionStateChanged { state, .. }] => {
            assert_eq!(target, "kiosk");
            assert_eq!(*state, RegionState::Outside);
        }
        other => panic!("unexpected events: {other:?}"),
    }
}

#[test]
fn test_disabled_persistence_starts_fresh() {
    let dir = TempDir::new().unwrap();
    let store: Arc<dyn MonitoringStore> = Arc::new(FileMonitoringStore::in_directory(dir.path()));
    let mut config = Config::default();
    config.monitoring.persistence_enabled = false;

    let engine = BeaconEngine::builder(config.clone())
        .store(Arc::clone(&store))
        .build()
        .unwrap();
    engine.start_monitoring(desk_region(), "kiosk").unwrap();
    assert!(store.load().unwrap().is_none());

    let restarted = BeaconEngine::builder(config).store(store).build().unwrap();
    assert!(restarted.monitored_regions().is_empty());
}

#[tokio::test]
async fn test_pipeline_delivers_ranging_events_per_region() {
    let (sink, mut events) = ChannelSink::new();
    let engine = BeaconEngine::builder(Config::default())
        .sink(Arc::new(sink))
        .build()
        .unwrap();
    engine.start_ranging(desk_region()).unwrap();
    engine
        .start_ranging(RegionCriteria::any("all").unwrap())
        .unwrap();
    let pipeline = ScanPipeline::new(Arc::new(engine), 4);

    for minor in 1..=3 {
        pipeline.submit(altbeacon(minor, -65)).await.unwrap();
    }
    let report = pipeline.end_cycle().await.unwrap();
    assert_eq!(report.ranging.len(), 2);

    let mut counts = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let BeaconEvent::Ranging { region, beacons } = event {
            counts.push((region.unique_id().to_string(), beacons.len()));
        }
    }
    assert_eq!(counts, vec![("all".to_string(), 3), ("desk".to_string(), 1)]);
    pipeline.shutdown().await;
}
