use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use bms_master::config::MasterConfig;
use bms_master::gateway::{ChannelGateway, SlaveGateway};
use bms_master::pack::Pack;
use bms_master::scheduler::{PackRuntime, TaskScheduler};
use bms_master::telemetry::{init_tracing, shutdown_signal};

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = MasterConfig::load()?;
    init_tracing(cfg.telemetry.log_json);

    info!(
        modules = cfg.number_of_battery_modules,
        serial_cells = cfg.number_of_serial_cells,
        "starting battery management master controller"
    );

    let pack = Pack::new(cfg.number_of_battery_modules, cfg.number_of_serial_cells);
    let gateway: Arc<dyn SlaveGateway> =
        Arc::new(ChannelGateway::with_endpoint(cfg.gateway.endpoint));

    let runtime = PackRuntime::new(pack, gateway);
    let scheduler = Arc::new(TaskScheduler::new(runtime));
    scheduler.start();

    shutdown_signal().await;
    warn!("shutdown complete");
    Ok(())
}
