#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::sync::Arc;

use someip_router::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(Config::load()?);
    simple_logger::init_with_level(config.log.level.as_level())?;

    if config.services.is_empty() && !config.service_discovery.enable {
        log::warn!(
            "No services configured and discovery disabled, this routing host will only serve local guests."
        );
    }

    someip_router::startup(config).await
}
