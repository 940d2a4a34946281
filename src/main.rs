use anyhow::{Context, Error};
use camera_orchestrator::{
    config::Config,
    controller::Controller,
    util::{async_flag, runnable::Runnable},
};
use clap::Parser;
use futures::{future::FutureExt, pin_mut, select};
use std::path::PathBuf;
use tokio::signal::ctrl_c;

#[derive(Parser)]
#[command(name = "camera-orchestrator")]
struct Arguments {
    /// Path to the configuration file (json).
    config_path: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .filter_module("camera_orchestrator", log::LevelFilter::Debug)
        .init();

    let arguments = Arguments::parse();

    let config = Config::load(&arguments.config_path)
        .await
        .context("config")?;

    let controller = Controller::new(config).context("controller")?;

    let (exit_flag_sender, exit_flag_receiver) = async_flag::pair();

    let controller_runner = controller.run(exit_flag_receiver).fuse();
    pin_mut!(controller_runner);

    log::info!("camera-orchestrator started, awaiting exit signal");
    select! {
        result = ctrl_c().fuse() => {
            result.context("ctrl_c")?;
            log::info!("received exit signal, closing");
            exit_flag_sender.signal();
        },
        _ = controller_runner => {
            panic!("controller exited without an exit signal")
        },
    }

    let _ = controller_runner.await;
    log::info!("camera-orchestrator closed");

    Ok(())
}
