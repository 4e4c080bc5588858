//! CLI entry point for the UV bench automation.
//!
//! Subcommands map one-to-one onto the control loops:
//! - `calibrate`: run the two-pass calibration scan and write the
//!   parameter file
//! - `track`: run the wavelength→angle filter tracker
//! - `optimize`: run the hill-climbing UV optimizer (`--dual` for the
//!   two-axis variant)
//! - `feedforward`: run the oven temperature loop
//!
//! `--mock` replaces every instrument with its simulated counterpart so a
//! full run works on a bare laptop. Ctrl-C requests a cooperative stop;
//! every loop finishes its current iteration and exits cleanly.

#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use uvlab::calibration::{CalibrationPipeline, CalibrationTable, SharedTable, LASTUSED_CALPAR};
use uvlab::config::Settings;
use uvlab::control::{stop_channel, StopHandle};
use uvlab::feedforward::FeedForward;
use uvlab::hardware::mock::{
    MockFilterPower, MockOven, MockPicomotor, MockRotationStage, MockUvPower,
    MockWavelengthMeter,
};
use uvlab::hardware::{
    LinearActuator, OvenController, PowerSensor, RotationStage, WavelengthSource,
};
use uvlab::optimizer::{DualHillClimber, HillClimber};
use uvlab::telemetry::{self, OutputFormat};
use uvlab::tracker::AngleTracker;

#[derive(Parser)]
#[command(name = "uvlab")]
#[command(about = "Tunable UV generation bench automation", long_about = None)]
struct Cli {
    /// Configuration name under config/ (without extension).
    #[arg(long, global = true)]
    config: Option<String>,

    /// Use simulated instruments instead of real hardware.
    #[arg(long, global = true)]
    mock: bool,

    /// Log output format.
    #[arg(long, global = true, default_value = "pretty")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum LogFormat {
    Pretty,
    Compact,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the two-pass calibration scan and write the parameter file.
    Calibrate,
    /// Run the wavelength-to-angle filter tracker.
    Track,
    /// Run the hill-climbing UV power optimizer.
    Optimize {
        /// Alternate between both picomotor axes.
        #[arg(long)]
        dual: bool,
    },
    /// Run the feed-forward oven temperature loop.
    Feedforward,
}

/// Every instrument the loops can ask for, behind the capability traits.
struct Bench {
    meter: Arc<dyn WavelengthSource>,
    stage: Arc<dyn RotationStage>,
    filter_sensor: Arc<dyn PowerSensor>,
    uv_sensor: Arc<dyn PowerSensor>,
    oven: Arc<dyn OvenController>,
    uv_actuator: Arc<dyn LinearActuator>,
    second_actuator: Option<Arc<dyn LinearActuator>>,
}

fn mock_bench(settings: &Settings) -> Bench {
    let oven = Arc::new(MockOven::new(22.0));
    // Simulated source: wavelength follows the oven so that calibrate and
    // feedforward runs sweep through the valid window.
    let meter = Arc::new(MockWavelengthMeter::oven_linked(
        oven.clone(),
        1029.0,
        40.0,
        0.05,
    ));
    let stage = Arc::new(MockRotationStage::new(settings.pipeline.start_angle_deg));
    let actuator = Arc::new(MockPicomotor::new(0));
    let second = Arc::new(MockPicomotor::new(0));

    let filter_sensor = Arc::new(
        MockFilterPower::new(stage.clone(), meter.clone(), 0.5, -400.0)
            .with_noise(0.0005, 42),
    );
    let uv_sensor =
        Arc::new(MockUvPower::new(actuator.clone(), meter.clone()).with_noise(0.0005, 43));

    Bench {
        meter,
        stage,
        filter_sensor,
        uv_sensor,
        oven,
        uv_actuator: actuator,
        second_actuator: Some(second),
    }
}

#[cfg(feature = "instrument_serial")]
async fn hardware_bench(settings: &Settings) -> Result<Bench> {
    use uvlab::hardware::covesion::CovesionOven;
    use uvlab::hardware::kinesis::KinesisStage;
    use uvlab::hardware::pm16::Pm16;
    use uvlab::hardware::wavemeter::NetworkWavemeter;

    let devices = &settings.devices;
    let meter = Arc::new(NetworkWavemeter::connect(&devices.wavemeter_addr).await?);
    let stage = Arc::new(KinesisStage::new(&devices.stage_port)?);
    let oven = Arc::new(CovesionOven::new(&devices.oven_port)?);
    let sensor = Arc::new(Pm16::new(&devices.power_meter_port)?);

    let picomotor =
        uvlab::hardware::picomotor::Picomotor8742::connect(&devices.picomotor_addr).await?;
    let uv_actuator = Arc::new(picomotor.axis(devices.uv_axis));
    let second_actuator = devices
        .second_axis
        .map(|axis| Arc::new(picomotor.axis(axis)) as Arc<dyn LinearActuator>);

    Ok(Bench {
        meter,
        stage,
        filter_sensor: sensor.clone(),
        uv_sensor: sensor,
        oven,
        uv_actuator,
        second_actuator,
    })
}

#[cfg(not(feature = "instrument_serial"))]
async fn hardware_bench(_settings: &Settings) -> Result<Bench> {
    bail!("built without the instrument_serial feature; only --mock runs are available")
}

/// Request a stop on Ctrl-C. The loops observe the flag at their next
/// iteration boundary.
fn spawn_ctrl_c(handle: StopHandle) {
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("stop requested, finishing current iteration");
            handle.stop();
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let settings = match &cli.config {
        Some(name) => Settings::new(Some(name))?,
        None => Settings::new(None).unwrap_or_else(|_| Settings::defaults()),
    };

    let format = match cli.log_format {
        LogFormat::Pretty => OutputFormat::Pretty,
        LogFormat::Compact => OutputFormat::Compact,
        LogFormat::Json => OutputFormat::Json,
    };
    telemetry::init(&settings.log_level, format).map_err(anyhow::Error::msg)?;

    let bench = if cli.mock {
        info!("running against simulated instruments");
        mock_bench(&settings)
    } else {
        hardware_bench(&settings).await?
    };

    let (handle, stop) = stop_channel();
    spawn_ctrl_c(handle);

    match cli.command {
        Commands::Calibrate => {
            let (mut pipeline, mut progress) = CalibrationPipeline::new(
                settings.pipeline.clone(),
                bench.stage,
                bench.meter,
                bench.filter_sensor,
                bench.oven,
            );
            tokio::spawn(async move {
                while progress.changed().await.is_ok() {
                    info!(percent = *progress.borrow(), "calibration progress");
                }
            });
            let outcome = pipeline.run(&stop).await?;
            info!(path = %outcome.calpar_path.display(), "calibration complete");
        }
        Commands::Track => {
            let calpar = settings.pipeline.output_dir.join(LASTUSED_CALPAR);
            let table = CalibrationTable::load(&calpar).map_err(|err| {
                uvlab::BenchError::NoCalibration(format!(
                    "{} ({err:#}); run calibrate first",
                    calpar.display()
                ))
            })?;
            let (mut tracker, mut events) = AngleTracker::new(
                settings.tracker.clone(),
                SharedTable::new(table),
                bench.meter,
                bench.stage,
            );
            tokio::spawn(async move { while events.recv().await.is_some() {} });
            tracker.run(stop).await?;
        }
        Commands::Optimize { dual } => {
            if dual {
                let Some(second) = bench.second_actuator else {
                    bail!("dual-axis optimization requires devices.second_axis in the configuration");
                };
                let (mut climber, mut events) = DualHillClimber::new(
                    settings.optimizer.clone(),
                    bench.uv_actuator,
                    second,
                    bench.uv_sensor,
                    bench.meter,
                );
                tokio::spawn(async move {
                    while let Some(event) = events.recv().await {
                        warn_on_failsafe(&event);
                    }
                });
                climber.run(stop).await?;
            } else {
                let (mut climber, mut events) = HillClimber::new(
                    settings.optimizer.clone(),
                    bench.uv_actuator,
                    bench.uv_sensor,
                    bench.meter,
                );
                tokio::spawn(async move {
                    while let Some(event) = events.recv().await {
                        warn_on_failsafe(&event);
                    }
                });
                climber.run(stop).await?;
            }
        }
        Commands::Feedforward => {
            let (mut feedforward, mut events) = FeedForward::new(
                settings.feedforward.clone(),
                bench.meter,
                bench.oven,
            );
            tokio::spawn(async move { while events.recv().await.is_some() {} });
            feedforward.run(stop).await?;
        }
    }

    Ok(())
}

fn warn_on_failsafe(event: &uvlab::optimizer::OptimizerEvent) {
    if let uvlab::optimizer::OptimizerEvent::FailsafeTriggered {
        axis,
        delta_wavelength_nm,
        correction_steps,
    } = event
    {
        warn!(axis, delta_wavelength_nm, correction_steps, "drift failsafe repositioned axis");
    }
}
