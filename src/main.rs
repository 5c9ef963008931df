//! Pingora-based API gateway.
//!
//! Loads the routing table from a YAML parameters file, then serves a single
//! proxy listener that authorizes each request and forwards it to one
//! instance of the owning service in round-robin order.

mod auth;
mod config;
mod error;
mod health;
mod logging;
mod proxy;
mod routing;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use pingora_core::server::Server;
use pingora_core::services::background::background_service;

use crate::auth::ValidatorRegistry;
use crate::config::{load_config, AppConfig, DEFAULT_CONFIG_PATH};
use crate::health::{HealthService, HealthState};
use crate::proxy::{Dispatcher, GatewayProxy};

#[derive(Debug, Parser)]
#[command(name = "esb-gateway", version, about = "Routes API calls to backend services")]
struct Cli {
    /// YAML parameters file.
    #[arg(long, env = "ESB_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Proxy listen address. Defaults to 0.0.0.0:<esb.port>.
    #[arg(long, env = "ESB_LISTEN")]
    listen: Option<String>,

    /// Health probe listen address.
    #[arg(long, env = "ESB_HEALTH_LISTEN", default_value = "0.0.0.0:9090")]
    health_listen: SocketAddr,
}

fn main() {
    let cli = Cli::parse();

    let config = match load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            logging::init_fallback();
            tracing::error!(
                path = %cli.config.display(),
                error = %e,
                "failed to load configuration"
            );
            std::process::exit(1);
        }
    };

    let guard = match logging::init(&config.logging, config.debug) {
        Ok(guard) => guard,
        Err(e) => {
            logging::init_fallback();
            tracing::error!(error = %format!("{:#}", e), "failed to initialize logging");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(cli, config) {
        tracing::error!(error = %format!("{:#}", e), "gateway failed to start");
        drop(guard);
        std::process::exit(1);
    }
}

fn run(cli: Cli, config: AppConfig) -> Result<()> {
    tracing::info!(
        debug = config.debug,
        environment = %config.environment,
        esb = %format!("{}://{}:{}", config.esb.scheme, config.esb.host, config.esb.port),
        service_alias = %config.security.service_alias_name,
        "esb-gateway starting"
    );

    let validators = ValidatorRegistry::with_builtin();
    let dispatcher =
        Dispatcher::build(&config, &validators).context("invalid routing configuration")?;

    let health = HealthService::new(
        cli.health_listen,
        HealthState {
            tracker: dispatcher.health(),
            services: dispatcher.registry().services().len(),
            routes: dispatcher.registry().route_count(),
        },
    );

    let listen = cli.listen.unwrap_or_else(|| config.listen_addr());

    let mut server = Server::new(None).context("failed to create server")?;
    server.bootstrap();

    let mut proxy_service = pingora_proxy::http_proxy_service(
        &server.configuration,
        GatewayProxy::new(Arc::new(dispatcher)),
    );
    proxy_service.add_tcp(&listen);

    server.add_service(proxy_service);
    server.add_service(background_service("health", health));

    tracing::info!(listen = %listen, health = %cli.health_listen, "listening");
    server.run_forever()
}
