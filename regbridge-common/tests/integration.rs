//! Integration tests for regbridge-common.

use std::collections::BTreeMap;
use std::sync::{Arc, Barrier};
use std::thread;

use regbridge_common::{
    DeviceConfig, DeviceRegistry, DisplayCache, IngestConfig, IngestionGateway, RejectReason,
};

fn setup(devices: &[DeviceConfig]) -> (IngestionGateway, DisplayCache) {
    let registry = Arc::new(DeviceRegistry::new(devices, 2).expect("valid devices"));
    let gateway = IngestionGateway::new(
        Arc::clone(&registry),
        IngestConfig {
            min: 0.01,
            max: 200.0,
            display_precision: 2,
        },
    );
    (gateway, DisplayCache::new(registry))
}

#[test]
fn test_end_to_end_example() {
    let (gateway, cache) = setup(&[DeviceConfig::new(1, ["P", "Q"])]);

    let accepted = gateway.ingest(1, 0, 10.0).expect("accepted");
    assert_eq!(accepted.value, 10.0);

    let expected: BTreeMap<_, _> = [(
        1u8,
        BTreeMap::from([("P".to_string(), 10.0), ("Q".to_string(), 0.0)]),
    )]
    .into_iter()
    .collect();
    assert_eq!(cache.snapshot(), expected);

    let err = gateway.ingest(1, 1, 250.0).unwrap_err();
    assert_eq!(err.reason(), RejectReason::ValueOutOfRange);
    assert_eq!(cache.snapshot(), expected);

    let err = gateway.ingest(5, 0, 10.0).unwrap_err();
    assert_eq!(err.reason(), RejectReason::InvalidDevice);
    assert_eq!(cache.snapshot(), expected);
}

#[test]
fn test_accepted_value_is_visible_in_bank() {
    let devices: Vec<_> = (1..=4)
        .map(|id| DeviceConfig::new(id, (0..11).map(|i| format!("metric-{i}"))))
        .collect();
    let (gateway, _) = setup(&devices);

    for device in 1..=4i64 {
        for index in 0..11i64 {
            let value = 0.5 + (device * 11 + index) as f64 * 1.111;
            let accepted = gateway.ingest(device, index, value).expect("accepted");
            let bank = gateway.registry().get_bank(device as u8).unwrap();
            assert_eq!(bank.get(index as usize), Some(accepted.value));
        }
    }
}

#[test]
fn test_concurrent_ingest_distinct_devices() {
    let devices: Vec<_> = (1..=8).map(|id| DeviceConfig::new(id, ["A", "B"])).collect();
    let (gateway, cache) = setup(&devices);
    let gateway = Arc::new(gateway);
    let barrier = Arc::new(Barrier::new(devices.len()));

    let handles: Vec<_> = (1..=8i64)
        .map(|device| {
            let gateway = Arc::clone(&gateway);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for i in 1..=500 {
                    gateway
                        .ingest(device, i % 2, (i % 200) as f64 + 0.25)
                        .expect("accepted");
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    let snapshot = cache.snapshot();
    for device in 1..=8u8 {
        // Last writes: i = 499 to index 1, i = 500 to index 0.
        assert_eq!(snapshot[&device]["A"], 100.25);
        assert_eq!(snapshot[&device]["B"], 99.25);
    }
}

#[test]
fn test_concurrent_ingest_same_device_loses_nothing() {
    let metrics: Vec<_> = (0..6).map(|i| format!("m{i}")).collect();
    let (gateway, cache) = setup(&[DeviceConfig::new(3, metrics)]);
    let gateway = Arc::new(gateway);
    let barrier = Arc::new(Barrier::new(6));

    let handles: Vec<_> = (0..6i64)
        .map(|index| {
            let gateway = Arc::clone(&gateway);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for step in 1..=1000 {
                    let value = (step % 199 + 1) as f64;
                    gateway.ingest(3, index, value).expect("accepted");
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    // Each slot holds its own writer's final value.
    let bank = gateway.registry().get_bank(3).unwrap();
    let last = (1000 % 199 + 1) as f64;
    assert!(bank.values().iter().all(|v| *v == last));
    assert!(cache.snapshot()[&3].values().all(|v| *v == last));
}

#[test]
fn test_same_slot_last_writer_wins() {
    let (gateway, cache) = setup(&[DeviceConfig::new(1, ["P"])]);
    let gateway = Arc::new(gateway);

    let handles: Vec<_> = (1..=4)
        .map(|writer| {
            let gateway = Arc::clone(&gateway);
            thread::spawn(move || {
                for _ in 0..200 {
                    gateway.ingest(1, 0, writer as f64 * 10.0).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let value = gateway.registry().get_bank(1).unwrap().get(0).unwrap();
    assert!([10.0, 20.0, 30.0, 40.0].contains(&value));
    assert_eq!(cache.snapshot()[&1]["P"], value);
}
