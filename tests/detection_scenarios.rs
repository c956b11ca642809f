//! End-to-end detection scenarios on the device controller.

use card_detector_agent::device::{
    condition, DetectionState, DeviceConfig, DeviceController, DeviceTiming, Sample, Smoother,
};
use card_detector_agent::protocol::{encode, Command, DeviceEvent, Frame};

fn device(config: DeviceConfig) -> DeviceController {
    DeviceController::new(
        config,
        Smoother::disabled(),
        DeviceTiming {
            telemetry_every: 1,
            watchdog_ticks: None,
            ..DeviceTiming::default()
        },
    )
}

/// Run samples and return the event lines produced, in order.
fn run(device: &mut DeviceController, samples: &[(u16, bool)]) -> Vec<String> {
    samples
        .iter()
        .flat_map(|&(raw, env)| device.tick(Sample::new(raw, env)))
        .filter(|f| matches!(f, Frame::Event(_)))
        .filter_map(|f| encode(&f).ok())
        .map(|line| line.trim_end().to_string())
        .collect()
}

#[test]
fn idle_floor_produces_nothing() {
    let mut d = device(DeviceConfig::default());
    let events = run(&mut d, &[(100, false); 5]);
    assert!(events.is_empty());
    assert_eq!(d.state(), DetectionState::Idle);
}

#[test]
fn card_in_envelope_passes_with_peak() {
    let mut d = device(DeviceConfig::default());
    let events = run(
        &mut d,
        &[(100, true), (200, true), (100, true), (100, false)],
    );
    assert_eq!(events, vec!["EVT:PASS:200"]);
    assert_eq!(d.state(), DetectionState::Idle);
}

#[test]
fn empty_envelope_latches_until_resume() {
    let mut d = device(DeviceConfig::default());
    let events = run(&mut d, &[(120, true), (120, true), (120, false)]);
    assert_eq!(events, vec!["ERR:EMPTY_ENVELOPE:120"]);
    assert_eq!(d.state(), DetectionState::Fault);

    // Nothing the sensor does moves a latched machine
    let later = run(
        &mut d,
        &[(300, true), (500, true), (100, false), (20, false), (100, false)],
    );
    assert!(later.is_empty());
    assert_eq!(d.state(), DetectionState::Fault);

    d.handle_command(Command::Resume);
    assert_eq!(d.state(), DetectionState::Idle);
    let events = run(&mut d, &[(250, true), (100, false)]);
    assert_eq!(events, vec!["EVT:PASS:250"]);
}

#[test]
fn out_of_range_latches_even_when_back_in_range() {
    let mut d = device(DeviceConfig::default());
    let events = run(&mut d, &[(100, false), (1010, false), (1010, false), (100, false)]);
    assert_eq!(events, vec!["ERR:SENSOR_OUT_OF_RANGE"]);
    assert_eq!(d.state(), DetectionState::Fault);
}

#[test]
fn override_turns_empty_envelope_into_pass() {
    let mut d = device(DeviceConfig {
        system_override: true,
        ..DeviceConfig::default()
    });
    let events = run(&mut d, &[(120, true), (120, true), (120, false)]);
    assert_eq!(events, vec!["EVT:PASS_OVERRIDE:120"]);
    assert_eq!(d.state(), DetectionState::Idle);
}

#[test]
fn override_still_latches_range_faults() {
    let mut d = device(DeviceConfig {
        system_override: true,
        ..DeviceConfig::default()
    });
    let events = run(&mut d, &[(30, false), (100, false), (200, true), (100, false)]);
    assert_eq!(events, vec!["ERR:SENSOR_OUT_OF_RANGE"]);
    assert_eq!(d.state(), DetectionState::Fault);
}

#[test]
fn override_releases_latched_empty_envelope() {
    let mut d = device(DeviceConfig::default());
    run(&mut d, &[(120, true), (120, false)]);
    assert_eq!(d.state(), DetectionState::Fault);

    d.handle_command(Command::SetOverride(true));
    let events = run(&mut d, &[(100, false), (130, true), (100, false)]);
    assert_eq!(events, vec!["EVT:PASS_OVERRIDE:130"]);
    assert_eq!(d.state(), DetectionState::Idle);
}

#[test]
fn double_card_is_a_fault() {
    let mut d = device(DeviceConfig::default());
    let events = run(&mut d, &[(850, true), (100, false)]);
    assert_eq!(events, vec!["ERR:DOUBLE_CARD:850"]);
    assert_eq!(d.state(), DetectionState::Fault);
}

#[test]
fn reversed_sensor_is_evaluated_on_reversed_values() {
    let mut d = device(DeviceConfig {
        reverse_sensor: true,
        ..DeviceConfig::default()
    });
    // 1023 - 823 = 200 while the envelope passes, 923 idles at 100
    let events = run(&mut d, &[(923, false), (823, true), (923, false)]);
    assert_eq!(events, vec![format!("EVT:PASS:{}", condition(823, true))]);
}

#[test]
fn double_reversal_is_identity() {
    for raw in 0..=1023u16 {
        assert_eq!(condition(condition(raw, true), true), raw);
        assert_eq!(condition(raw, false), raw);
    }
}

#[test]
fn peak_never_decreases_while_measuring() {
    let mut d = device(DeviceConfig::default());
    d.tick(Sample::new(100, false));

    let mut last_peak = 0;
    for raw in [150u16, 400, 90, 300, 700, 60, 699] {
        d.tick(Sample::new(raw, true));
        assert_eq!(d.state(), DetectionState::Measuring);
        assert!(d.peak_in_window() >= last_peak);
        last_peak = d.peak_in_window();
    }
    assert_eq!(last_peak, 700);

    d.tick(Sample::new(100, false));
    assert_eq!(d.peak_in_window(), 0);
}
