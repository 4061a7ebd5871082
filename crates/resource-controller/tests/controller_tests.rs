use std::sync::Arc;
use std::thread;

use resource_controller::{parse_watts, ControlError, FlowMode, ResourceController};

const TOLERANCE: f64 = 1e-9;

#[test]
fn import_tick_integrates_energy() {
    let controller = ResourceController::new();
    controller.set_import_watts(1_800);

    let state = controller.tick(1_000);
    assert!((state.import_energy_wh - 0.5).abs() < TOLERANCE);
    assert_eq!(state.export_energy_wh, 0.0);

    controller.tick(3_600_000);
    assert!((controller.import_energy_wh() - 1_800.5).abs() < TOLERANCE);
    assert_eq!(controller.export_energy_wh(), 0.0);
}

#[test]
fn export_and_import_integrate_independently() {
    let controller = ResourceController::with_setpoints(100, 250);
    controller.tick(36_000);
    let state = controller.snapshot();
    assert!((state.import_energy_wh - 1.0).abs() < TOLERANCE);
    assert!((state.export_energy_wh - 2.5).abs() < TOLERANCE);
}

#[test]
fn zero_tick_is_noop() {
    let controller = ResourceController::with_setpoints(5_000, 7_000);
    controller.tick(250);
    let before = controller.snapshot();
    let after = controller.tick(0);
    assert_eq!(before, after);
}

#[test]
fn setpoint_change_applies_to_whole_next_interval() {
    let controller = ResourceController::with_setpoints(3_600, 0);
    controller.tick(1_000);
    controller.set_import_watts(0);
    controller.tick(1_000);
    assert!((controller.import_energy_wh() - 1.0).abs() < TOLERANCE);
}

#[test]
fn invalid_setpoint_keeps_previous_value() {
    let controller = ResourceController::with_setpoints(400, 600);

    let err = controller.set_import_watts_str("abc").expect_err("invalid");
    assert_eq!(
        err,
        ControlError::InvalidWatts {
            input: "abc".to_string()
        }
    );
    assert!(controller.set_export_watts_str("-5").is_err());
    assert!(controller.set_export_watts_str("").is_err());
    assert!(controller.set_import_watts_str("4294967296").is_err());

    assert_eq!(controller.import_watts(), 400);
    assert_eq!(controller.export_watts(), 600);
}

#[test]
fn textual_setpoint_is_trimmed() {
    assert_eq!(parse_watts(" 1500 "), Ok(1_500));
    let controller = ResourceController::new();
    assert_eq!(controller.set_export_watts_str("20"), Ok(20));
    assert_eq!(controller.export_watts(), 20);
}

#[test]
fn flow_mode_follows_setpoints() {
    let controller = ResourceController::new();
    assert_eq!(controller.mode(), FlowMode::NoFlow);
    controller.set_import_watts(1);
    assert_eq!(controller.mode(), FlowMode::Importing);
    controller.set_export_watts(1);
    assert_eq!(controller.mode(), FlowMode::Both);
    controller.set_import_watts(0);
    assert_eq!(controller.mode(), FlowMode::Exporting);
}

#[test]
fn concurrent_ticks_and_setters_do_not_lose_energy() {
    let controller = Arc::new(ResourceController::with_setpoints(3_600, 3_600));
    let ticker = {
        let controller = Arc::clone(&controller);
        thread::spawn(move || {
            for _ in 0..1_000 {
                controller.tick(1);
            }
        })
    };
    let setter = {
        let controller = Arc::clone(&controller);
        thread::spawn(move || {
            for _ in 0..1_000 {
                controller.set_export_watts(3_600);
                let state = controller.snapshot();
                assert!(state.import_energy_wh >= 0.0);
            }
        })
    };
    ticker.join().expect("ticker");
    setter.join().expect("setter");

    let state = controller.snapshot();
    assert!((state.import_energy_wh - 1.0).abs() < 1e-6);
    assert!((state.export_energy_wh - 1.0).abs() < 1e-6);
}
