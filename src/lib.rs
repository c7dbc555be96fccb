pub mod config;
pub mod observer;
pub mod server;
pub mod statistics;

use std::{sync::Arc, time::Duration};

use self::{config::Config, observer::Observer, server::local::GuestBook, statistics::Statistics};

use service::{Service, ServiceOptions};

#[rustfmt::skip]
static SOFTWARE: &str = concat!(
    "someip-router.",
    env!("CARGO_PKG_VERSION")
);

/// In order to let integration tests use the someip-router crate and
/// start the routing host directly, a function is opened to replace the
/// main function.
pub async fn startup(config: Arc<Config>) -> anyhow::Result<()> {
    log::info!("{SOFTWARE} starting: routing host={}", config.routing);

    let statistics = Statistics::default();
    let guests = GuestBook::default();

    let service = Service::new(ServiceOptions {
        host_name: config.routing.clone(),
        static_clients: config.client_hints(),
        policy_mode: config.security.mode,
        policies: config.security.policy_set(),
        request_timeout: Duration::from_millis(config.request_timeout),
        quarantine: Duration::from_millis(config.service_discovery.cyclic_offer_delay),
        forwarding: config.forwarding,
        handler: Observer::new(config.clone(), statistics.clone(), guests.clone()),
    });

    server::start(&config, &statistics, &service, &guests).await?;

    // The routing host is non-blocking after it runs; keep the process
    // alive for its endpoint tasks.
    std::future::pending::<()>().await;

    Ok(())
}
