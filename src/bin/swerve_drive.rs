use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use swerve_core::{
    bridge::start_bridge,
    configuration,
    driver::{simulated_hardware, HeadingSensor, ModuleIo, SerialBus},
    drivetrain::Drivetrain,
    error::ErrorWrapper,
    logging,
};
use tokio::time::{interval, MissedTickBehavior};
use tracing::*;
use zenoh::prelude::r#async::*;

#[derive(Parser, Debug)]
#[command(version, about = "Swerve drivetrain control loop")]
struct Args {
    /// path to config
    #[arg(long)]
    config: Option<PathBuf>,

    /// run against simulated modules even when a bus is configured
    #[arg(long)]
    simulate: bool,

    /// log as JSON lines
    #[arg(long)]
    json: bool,

    /// Sets the level of verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbosity: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    if args.json {
        logging::setup_json_tracing(args.verbosity);
    } else {
        logging::setup_tracing(args.verbosity);
    }

    let app_config = configuration::AppConfig::load_config(&args.config)?;
    let drivetrain_config = app_config.drivetrain.clone();

    // keeps the bus task alive for the lifetime of the loop
    let mut _bus = None;
    let (io, gyro): (Vec<Box<dyn ModuleIo>>, Box<dyn HeadingSensor>) =
        match (&app_config.bus, args.simulate) {
            (Some(bus_config), false) => {
                let bus = SerialBus::open(bus_config)?;
                let io: Vec<Box<dyn ModuleIo>> = drivetrain_config
                    .modules
                    .iter()
                    .enumerate()
                    .map(|(i, module)| {
                        let index = module.bus_index.unwrap_or(i as u8);
                        Box::new(bus.module(index)) as Box<dyn ModuleIo>
                    })
                    .collect();
                let gyro: Box<dyn HeadingSensor> = Box::new(bus.heading_sensor());
                _bus = Some(bus);
                (io, gyro)
            }
            _ => {
                info!("Running with simulated modules");
                let (io, gyro, _handles) = simulated_hardware(&drivetrain_config)?;
                (io, gyro)
            }
        };

    let mut drivetrain = Drivetrain::new(&drivetrain_config, io, gyro)?;

    // zenoh
    let zenoh_config = app_config.zenoh.get_zenoh_config()?;
    let zenoh_session = zenoh::open(zenoh_config)
        .res()
        .await
        .map_err(ErrorWrapper::ZenohError)?
        .into_arc();

    let mut requests = start_bridge(
        zenoh_session,
        &app_config.zenoh,
        drivetrain.command_sender(),
        drivetrain.pose_receiver(),
    )
    .await?;

    let mut ticker = interval(drivetrain_config.tick_period());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!("Control loop running every {:?}", drivetrain_config.tick_period());

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                while let Ok(request) = requests.try_recv() {
                    request.apply(&mut drivetrain);
                }
                let estimate = drivetrain.tick();
                trace!(pose = %estimate.pose, degraded = estimate.degraded, "tick");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    drivetrain.shutdown();
    // give the bus task one send period to flush the zero voltages
    tokio::time::sleep(drivetrain_config.tick_period()).await;
    Ok(())
}
