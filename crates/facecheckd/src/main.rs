use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;
mod remote;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("facecheckd starting");

    let config = config::Config::load().context("loading configuration")?;
    tracing::info!(
        camera = %config.camera_device,
        model = %config.model_path.display(),
        api = %config.api_base_url,
        detector = %config.detector_url,
        "configuration loaded"
    );

    let engine = Arc::new(
        engine::Engine::start(config)
            .await
            .context("starting capture engine")?,
    );

    let _conn = zbus::connection::Builder::system()?
        .name(dbus_interface::BUS_NAME)?
        .serve_at(
            dbus_interface::OBJECT_PATH,
            dbus_interface::FacecheckService::new(Arc::clone(&engine)),
        )?
        .build()
        .await
        .context("registering on the system bus")?;

    tracing::info!(name = dbus_interface::BUS_NAME, "facecheckd ready");

    tokio::signal::ctrl_c().await?;
    engine.cancel();
    tracing::info!("facecheckd shutting down");

    Ok(())
}
