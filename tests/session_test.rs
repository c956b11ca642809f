//! Host session, reconciler and simulated device wired through an
//! in-memory pipe. Everything is stepped by hand, so no timing is involved.

use card_detector_agent::config::{Config, ConfigStore, JsonConfigStore, LogVerbosity};
use card_detector_agent::device::{
    DetectionState, DeviceConfig, DeviceController, DeviceTiming, ManualSource, Simulator,
    Smoother,
};
use card_detector_agent::host::{
    create_shared_counters_with_persistence, read_persisted_total, HostReconciler, MemoryLogSink,
    Notification,
};
use card_detector_agent::session::{
    pipe, MemoryConnector, PortTarget, SessionEvent, SessionHandle, SessionManager, SessionState,
    SessionTiming,
};
use crossbeam_channel::Receiver;
use std::path::PathBuf;
use std::time::Duration;

fn temp_dir() -> PathBuf {
    std::env::temp_dir().join(format!("card-detector-session-{}", uuid::Uuid::new_v4()))
}

fn timing() -> SessionTiming {
    SessionTiming {
        // No keepalives; the tests count lines on the wire
        ping_interval: Duration::from_secs(3600),
        ..SessionTiming::immediate()
    }
}

fn simulated_device(connector: &MemoryConnector) -> (Simulator<ManualSource>, ManualSource) {
    let (host_end, device_end) = pipe(Duration::ZERO);
    connector.attach(host_end);

    let controller = DeviceController::new(
        DeviceConfig::default(),
        Smoother::disabled(),
        DeviceTiming {
            telemetry_every: 1,
            watchdog_ticks: None,
            ..DeviceTiming::default()
        },
    );
    let source = ManualSource::default();
    (
        Simulator::new(controller, source.clone(), Box::new(device_end)),
        source,
    )
}

struct Rig {
    manager: SessionManager<MemoryConnector>,
    events: Receiver<SessionEvent>,
    host: HostReconciler<SessionHandle>,
    notifications: Receiver<Notification>,
    connector: MemoryConnector,
    dir: PathBuf,
}

impl Rig {
    fn new(dir: &PathBuf, device: DeviceConfig) -> Self {
        let mut config = Config {
            serial_port: "memory://device".to_string(),
            data_path: dir.clone(),
            log_verbosity: LogVerbosity::Error,
            ..Config::default()
        };
        config.apply_device(&device);

        let connector = MemoryConnector::new();
        let (manager, handle, events) = SessionManager::new(
            connector.clone(),
            config.port_target(),
            config.device(),
            timing(),
        );
        let counters = create_shared_counters_with_persistence(config.counters_path());
        let (host, notifications) = HostReconciler::new(
            handle,
            Box::new(JsonConfigStore::at(dir.join("config.json"))),
            config,
            counters,
            Box::new(MemoryLogSink::new()),
        );

        Self {
            manager,
            events,
            host,
            notifications,
            connector,
            dir: dir.clone(),
        }
    }

    /// One session poll, then hand everything received to the reconciler.
    fn poll(&mut self) {
        self.manager.poll_once();
        for event in self.events.try_iter() {
            self.host.handle(event);
        }
    }
}

fn envelope_cycle(sim: &mut Simulator<ManualSource>, source: &ManualSource, raw: u16) {
    source.set_raw(raw);
    source.set_envelope(true);
    sim.step().unwrap();
    source.set_raw(100);
    source.set_envelope(false);
    sim.step().unwrap();
}

#[test]
fn handshake_configures_device_and_cycles_are_counted() {
    let dir = temp_dir();
    let device_config = DeviceConfig {
        card_threshold: 200,
        ..DeviceConfig::default()
    };
    let mut rig = Rig::new(&dir, device_config);
    let (mut sim, source) = simulated_device(&rig.connector);

    // Boot chatter is discarded by the handshake
    sim.step().unwrap();
    rig.poll();
    assert_eq!(rig.manager.state(), SessionState::Live);
    assert!(rig.host.is_connected());

    sim.step().unwrap();
    assert_eq!(*sim.controller().config(), device_config);

    envelope_cycle(&mut sim, &source, 250);
    rig.poll();
    assert_eq!(rig.host.last_event(), "PASS OK");
    assert_eq!(rig.host.counters().total_count, 1);
    let live = rig.host.live().unwrap();
    assert_eq!(live.raw, 100);
    assert!(!live.envelope);

    envelope_cycle(&mut sim, &source, 150);
    rig.poll();
    assert_eq!(rig.host.last_error(), Some("STOP: EMPTY_ENVELOPE:150"));
    assert_eq!(rig.host.counters().total_count, 2);
    assert_eq!(rig.host.history().len(), 1);
    assert_eq!(sim.controller().state(), DetectionState::Fault);

    // Still faulted: further envelopes are ignored by the device
    envelope_cycle(&mut sim, &source, 400);
    rig.poll();
    assert_eq!(rig.host.counters().total_count, 2);

    rig.host.resume().unwrap();
    rig.poll();
    sim.step().unwrap();
    assert_eq!(sim.controller().state(), DetectionState::Idle);
    assert_eq!(rig.host.last_error(), None);

    let notified: Vec<Notification> = rig.notifications.try_iter().collect();
    assert!(notified
        .iter()
        .any(|n| matches!(n, Notification::CountersChanged(s) if s.total_count == 2)));

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn total_count_survives_restart() {
    let dir = temp_dir();
    {
        let mut rig = Rig::new(&dir, DeviceConfig::default());
        let (mut sim, source) = simulated_device(&rig.connector);
        rig.poll();
        sim.step().unwrap();

        for raw in [250, 300, 350] {
            envelope_cycle(&mut sim, &source, raw);
        }
        rig.poll();
        assert_eq!(rig.host.counters().total_count, 3);
    }

    let counters_path = dir.join("counters.json");
    assert_eq!(read_persisted_total(&counters_path).unwrap(), Some(3));

    let mut rig = Rig::new(&dir, DeviceConfig::default());
    let (mut sim, source) = simulated_device(&rig.connector);
    rig.poll();
    sim.step().unwrap();
    envelope_cycle(&mut sim, &source, 250);
    rig.poll();

    let counters = rig.host.counters();
    assert_eq!(counters.session_count, 1);
    assert_eq!(counters.total_count, 4);

    std::fs::remove_dir_all(&rig.dir).ok();
}

#[test]
fn reconnect_replays_saved_configuration() {
    let dir = temp_dir();
    let mut rig = Rig::new(&dir, DeviceConfig::default());
    let (mut sim, _source) = simulated_device(&rig.connector);
    rig.poll();
    sim.step().unwrap();

    let updated = DeviceConfig {
        card_threshold: 300,
        reverse_sensor: true,
        ..DeviceConfig::default()
    };
    rig.host.save_config(updated, 0.02).unwrap();
    rig.poll();
    sim.step().unwrap();
    assert_eq!(*sim.controller().config(), updated);

    // Pull the cable
    drop(sim);
    for _ in 0..4 {
        rig.poll();
    }
    assert!(!rig.host.is_connected());
    assert_eq!(rig.manager.state(), SessionState::Disconnected);

    // A freshly booted device starts from defaults and gets the saved values
    let (mut sim, _source) = simulated_device(&rig.connector);
    rig.poll();
    assert!(rig.host.is_connected());
    sim.step().unwrap();
    assert_eq!(*sim.controller().config(), updated);

    let stored = JsonConfigStore::at(dir.join("config.json")).load().unwrap();
    assert_eq!(stored.device(), updated);
    assert_eq!(stored.factor, 0.02);

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn retarget_switches_devices() {
    let dir = temp_dir();
    let mut rig = Rig::new(&dir, DeviceConfig::default());
    let (mut first, _source) = simulated_device(&rig.connector);
    rig.poll();
    first.step().unwrap();

    let (mut second, _source) = simulated_device(&rig.connector);
    rig.host
        .set_target(Some(PortTarget::new("memory://other", 9600)))
        .unwrap();
    rig.poll();
    assert_eq!(rig.host.connected_port(), Some("memory://other"));
    assert_eq!(rig.host.config().serial_port, "memory://other");

    second.step().unwrap();
    assert_eq!(*second.controller().config(), DeviceConfig::default());

    std::fs::remove_dir_all(&dir).ok();
}
