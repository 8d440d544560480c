//! End-to-end scenarios against the in-memory backend.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use futures_util::StreamExt;

use audio_events::{
    AudioBridge, AudioDevice, BridgeConfig, BridgeError, DataFlow, DeviceCollectionEvent,
    DeviceState, EndpointVolume, FakeBackend, Notification, Role, Scope,
};

// ============================================================================
// Test Helpers
// ============================================================================

const WAIT: Duration = Duration::from_secs(2);

fn bridge(backend: &Arc<FakeBackend>) -> AudioBridge {
    AudioBridge::new(backend.clone(), BridgeConfig::default()).unwrap()
}

fn speaker(backend: &FakeBackend) {
    backend.add_device(AudioDevice::new(
        "spk",
        "Speakers",
        DataFlow::Render,
        DeviceState::ACTIVE,
    ));
    backend.set_volume_state(
        "spk",
        EndpointVolume {
            volume: 0.5,
            mute: false,
            channel_volumes: vec![0.5, 0.5],
        },
    );
}

// ============================================================================
// Collection
// ============================================================================

#[tokio::test]
async fn mic_lifecycle_is_observed_in_order() {
    let backend = Arc::new(FakeBackend::new());
    let bridge = bridge(&backend);
    let collection = bridge.collection().unwrap();
    let events = collection.events().unwrap();

    let producer = {
        let backend = backend.clone();
        thread::spawn(move || {
            backend.add_device(AudioDevice::new(
                "mic1",
                "Microphone",
                DataFlow::Capture,
                DeviceState::ACTIVE,
            ));
            backend.set_default("mic1", DataFlow::Capture, Role::Console);
            backend.set_device_state("mic1", DeviceState::DISABLED);
            backend.remove_device("mic1");
        })
    };

    let mut observed = Vec::new();
    while observed.len() < 4 {
        let item = tokio::time::timeout(WAIT, events.next())
            .await
            .expect("collection event did not arrive")
            .unwrap()
            .unwrap();
        observed.push(item.into_event().unwrap());
    }
    producer.join().unwrap();

    assert_eq!(
        observed,
        vec![
            DeviceCollectionEvent::Added {
                device_id: "mic1".to_string()
            },
            DeviceCollectionEvent::DefaultChanged {
                device_id: Some("mic1".to_string()),
                dataflow: DataFlow::Capture,
                role: Role::Console,
            },
            DeviceCollectionEvent::StateChanged {
                device_id: "mic1".to_string(),
                state: DeviceState::DISABLED,
            },
            DeviceCollectionEvent::Removed {
                device_id: "mic1".to_string()
            },
        ]
    );

    assert!(collection.is_empty());
    assert!(collection.default_input().is_none());
    assert!(collection
        .default_device(DataFlow::Capture, Role::Console)
        .is_none());
    assert_eq!(events.next_timeout(Duration::from_millis(20)).unwrap(), None);
}

#[tokio::test]
async fn snapshot_is_never_behind_the_consumer() {
    let backend = Arc::new(FakeBackend::new());
    let bridge = bridge(&backend);
    let collection = bridge.collection().unwrap();
    let events = collection.events().unwrap();

    for i in 0..10 {
        backend.add_device(AudioDevice::new(
            format!("mic{}", i),
            "Microphone",
            DataFlow::Capture,
            DeviceState::ACTIVE,
        ));
    }

    for _ in 0..10 {
        let item = events.next().await.unwrap().unwrap();
        let device_id = item.event().and_then(|e| e.device_id()).unwrap().to_string();
        assert!(collection.get(&device_id).is_ok());
    }
}

#[test]
fn closing_a_stream_twice_is_a_no_op() {
    let backend = Arc::new(FakeBackend::new());
    let bridge = bridge(&backend);
    let collection = bridge.collection().unwrap();

    let events = collection.events().unwrap();
    assert!(events.close());
    assert!(!events.close());
    assert_eq!(events.next_timeout(Duration::from_millis(10)).unwrap(), None);

    assert!(collection.close());
    assert!(!collection.close());
    drop(events);
    drop(collection);
    assert_eq!(backend.register_calls(), 1);
    assert_eq!(backend.unregister_calls(), 1);
}

#[tokio::test]
async fn stream_trait_drives_collection_events() {
    let backend = Arc::new(FakeBackend::new());
    let bridge = bridge(&backend);
    let collection = bridge.collection().unwrap();
    let mut events = collection.events().unwrap();

    backend.add_device(AudioDevice::new(
        "hp",
        "Headphones",
        DataFlow::Render,
        DeviceState::ACTIVE,
    ));
    backend.set_default("hp", DataFlow::Render, Role::Multimedia);

    let first: Vec<_> = (&mut events).take(2).collect().await;
    assert_eq!(first.len(), 2);
    assert_eq!(
        collection
            .default_device(DataFlow::Render, Role::Multimedia)
            .unwrap()
            .name(),
        "Headphones"
    );
}

// ============================================================================
// Registration sharing
// ============================================================================

#[test]
fn three_collections_share_one_os_registration() {
    let backend = Arc::new(FakeBackend::new());
    let bridge = bridge(&backend);

    let collections: Vec<_> = (0..3).map(|_| bridge.collection().unwrap()).collect();
    assert_eq!(backend.register_calls(), 1);
    assert_eq!(bridge.registrations().ref_count(&Scope::GlobalCollection), 3);

    let mut collections = collections.into_iter();
    collections.next().unwrap().close();
    collections.next().unwrap().close();
    assert_eq!(backend.unregister_calls(), 0);
    assert_eq!(backend.active_sinks(), vec![Scope::GlobalCollection]);

    collections.next().unwrap().close();
    assert_eq!(backend.register_calls(), 1);
    assert_eq!(backend.unregister_calls(), 1);
    assert!(backend.active_sinks().is_empty());
}

#[test]
fn failed_registration_surfaces_and_leaves_nothing_behind() {
    let backend = Arc::new(FakeBackend::new());
    let bridge = bridge(&backend);
    backend.fail_next_register("audio service unavailable");

    match bridge.collection() {
        Err(BridgeError::RegistrationFailed { scope, reason }) => {
            assert_eq!(scope, Scope::GlobalCollection);
            assert!(reason.contains("audio service unavailable"));
        }
        other => panic!("unexpected result: {:?}", other.map(|_| ())),
    }
    assert!(bridge.registrations().active_scopes().is_empty());
    assert!(bridge.collection().is_ok());
}

// ============================================================================
// Volume
// ============================================================================

#[test]
fn volume_events_keep_producer_order() {
    let backend = Arc::new(FakeBackend::new());
    speaker(&backend);
    let bridge = bridge(&backend);
    let events = bridge.observe("spk").unwrap();

    backend.emit_volume("spk", 0.2, false, vec![0.2, 0.2]);
    backend.emit_volume("spk", 0.2, true, vec![0.2, 0.2]);
    backend.emit_volume("spk", 0.5, true, vec![0.5, 0.5]);

    let observed: Vec<(f32, bool)> = (0..3)
        .map(|_| {
            let event = events.next_timeout(WAIT).unwrap().unwrap().into_event().unwrap();
            (event.volume, event.mute)
        })
        .collect();
    assert_eq!(observed, vec![(0.2, false), (0.2, true), (0.5, true)]);
}

#[test]
fn mutations_arrive_as_events_not_as_snapshot_changes() {
    let backend = Arc::new(FakeBackend::new());
    speaker(&backend);
    backend.add_device(AudioDevice::new(
        "hp",
        "Headphones",
        DataFlow::Render,
        DeviceState::ACTIVE,
    ));
    let bridge = bridge(&backend);
    let collection = bridge.collection().unwrap();
    let events = collection.events().unwrap();

    let device = collection.get("hp").unwrap();
    device.set_default(Role::Console).unwrap();
    assert_eq!(
        events.next_timeout(WAIT).unwrap(),
        Some(Notification::Event(DeviceCollectionEvent::DefaultChanged {
            device_id: Some("hp".to_string()),
            dataflow: DataFlow::Render,
            role: Role::Console,
        }))
    );
    assert_eq!(collection.default_output().unwrap().device_id(), "hp");

    let speaker = collection.get("spk").unwrap();
    let volume = speaker.observe_volume().unwrap();
    speaker.set_volume(1.7).unwrap();
    let event = volume.next_timeout(WAIT).unwrap().unwrap().into_event().unwrap();
    assert_eq!(event.volume, 1.0);
    assert_eq!(speaker.current_volume().unwrap().volume, 1.0);
}

#[tokio::test]
async fn removal_ends_pending_volume_consumer() {
    let backend = Arc::new(FakeBackend::new());
    speaker(&backend);
    let bridge = bridge(&backend);
    let device = bridge.device("spk").unwrap();
    let events = Arc::new(device.observe_volume().unwrap());

    let consumer = {
        let events = events.clone();
        tokio::spawn(async move { events.next().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    backend.remove_device("spk");
    let result = tokio::time::timeout(WAIT, consumer)
        .await
        .expect("volume consumer was left hanging")
        .unwrap();
    assert_eq!(result.unwrap(), None);

    assert!(!bridge
        .registrations()
        .is_registered(&Scope::DeviceVolume("spk".to_string())));
    assert!(matches!(
        device.set_mute(true),
        Err(BridgeError::StaleDeviceReference { .. })
    ));
    // The handle is inert but its identity is still readable.
    assert_eq!(device.name(), "Speakers");
}

#[test]
fn late_callback_after_teardown_is_a_protocol_violation() {
    let backend = Arc::new(FakeBackend::new());
    speaker(&backend);
    let bridge = bridge(&backend);

    let events = bridge.observe("spk").unwrap();
    drop(events);
    assert_eq!(backend.register_calls(), backend.unregister_calls());

    let results = backend.emit_retired(audio_events::audio::NativeEvent::Volume(
        audio_events::VolumeChangeEvent {
            device: "spk".to_string(),
            volume: 0.1,
            mute: false,
            channel_volumes: vec![0.1, 0.1],
        },
    ));
    assert!(results
        .iter()
        .all(|r| matches!(r, Err(BridgeError::ProtocolViolation { .. }))));
    assert!(bridge.registrations().protocol_violations() >= 1);
}
