//! Integration tests for the wavelength tracking loop against the
//! simulated meter and stage.
//!
//! The calibration table uses two deliberately different curves so the
//! tests can tell which one produced a commanded angle:
//! low-to-high `0.5·wl − 400`, high-to-low `0.52·wl − 420.6`. Both give
//! similar angles near 1029 nm (114.50 vs 114.48), like the real filter.

use std::sync::Arc;
use std::time::Duration;
use uvlab::calibration::{CalibrationCurve, CalibrationTable, ScanDirection, SharedTable};
use uvlab::control::stop_channel;
use uvlab::error::BenchError;
use uvlab::hardware::mock::{MockRotationStage, MockWavelengthMeter};
use uvlab::hardware::RotationStage;
use uvlab::tracker::{AngleTracker, TrackerConfig, TrackerEvent};

fn test_table() -> CalibrationTable {
    CalibrationTable::new(
        CalibrationCurve::new(0.5, -400.0),
        CalibrationCurve::new(0.52, -420.6),
    )
}

fn fast_config() -> TrackerConfig {
    TrackerConfig {
        tick: Duration::from_millis(10),
        ..TrackerConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn tracker_follows_wavelength_without_oscillating() {
    let meter = Arc::new(MockWavelengthMeter::fixed(1029.0));
    let stage = Arc::new(MockRotationStage::new(100.0));
    let (mut tracker, mut events) = AngleTracker::new(
        fast_config(),
        SharedTable::new(test_table()),
        meter.clone(),
        stage.clone(),
    );

    let (handle, stop) = stop_channel();
    let task = tokio::spawn(async move { tracker.run(stop).await });

    // Initial approach, then hold: the deadband must keep the stage quiet.
    tokio::time::sleep(Duration::from_millis(105)).await;
    // Rising wavelength keeps the low-to-high curve.
    meter.set_wavelength(1030.0);
    tokio::time::sleep(Duration::from_millis(105)).await;
    // Falling wavelength switches to the high-to-low curve.
    meter.set_wavelength(1029.0);
    tokio::time::sleep(Duration::from_millis(105)).await;
    // Out-of-window readings are ignored entirely.
    meter.set_wavelength(1035.0);
    tokio::time::sleep(Duration::from_millis(105)).await;

    handle.stop();
    task.await.unwrap().unwrap();

    let mut moves = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let TrackerEvent::Moved {
            angle_deg, curve, ..
        } = event
        {
            moves.push((angle_deg, curve));
        }
    }

    assert_eq!(
        moves,
        vec![
            (114.5, ScanDirection::LowToHigh),
            (115.0, ScanDirection::LowToHigh),
            (114.48, ScanDirection::HighToLow),
        ]
    );
    let final_angle = stage.position().await.unwrap();
    assert!((final_angle - 114.48).abs() < 1e-9);
}

#[tokio::test(start_paused = true)]
async fn tracker_stops_on_stage_fault_without_resuming() {
    let meter = Arc::new(MockWavelengthMeter::fixed(1029.0));
    let stage = Arc::new(MockRotationStage::new(100.0));
    let (mut tracker, mut events) = AngleTracker::new(
        fast_config(),
        SharedTable::new(test_table()),
        meter,
        stage.clone(),
    );

    stage.fail_calls(true);
    let (_handle, stop) = stop_channel();
    let result = tracker.run(stop).await;

    assert!(matches!(result, Err(BenchError::Transport(_))));

    let mut saw_fault = false;
    let mut stopped_ok = None;
    while let Ok(event) = events.try_recv() {
        match event {
            TrackerEvent::StageFault { .. } => saw_fault = true,
            TrackerEvent::Stopped { ok } => stopped_ok = Some(ok),
            _ => {}
        }
    }
    assert!(saw_fault);
    assert_eq!(stopped_ok, Some(false));
}

#[tokio::test(start_paused = true)]
async fn cooperative_stop_finishes_cleanly() {
    let meter = Arc::new(MockWavelengthMeter::fixed(1029.0));
    let stage = Arc::new(MockRotationStage::new(114.5));
    let (mut tracker, mut events) = AngleTracker::new(
        fast_config(),
        SharedTable::new(test_table()),
        meter,
        stage,
    );

    let (handle, stop) = stop_channel();
    let task = tokio::spawn(async move { tracker.run(stop).await });
    tokio::time::sleep(Duration::from_millis(55)).await;
    handle.stop();
    task.await.unwrap().unwrap();

    let mut stopped_ok = None;
    while let Ok(event) = events.try_recv() {
        if let TrackerEvent::Stopped { ok } = event {
            stopped_ok = Some(ok);
        }
    }
    assert_eq!(stopped_ok, Some(true));
}
