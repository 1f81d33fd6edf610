use std::net::SocketAddr;

use clap::Parser;
use modelbay_common::storage::StorageManager;
use modelbay_deployer::args::Args;
use modelbay_deployer::deployment::DeploymentManager;
use modelbay_deployer::registry::Registry;
use modelbay_deployer::{handlers, sink};
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let fmt_layer = fmt::layer();
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();

    let storage = StorageManager::new(args.state.clone());
    storage
        .models_path()
        .expect("failed to create the models directory");

    let sink = sink::init(args.kafka_broker.as_deref(), &args.kafka_topic);
    let deployment_manager = DeploymentManager::new(
        storage,
        Registry::new(),
        sink,
        args.python.clone(),
        args.instance_host.clone(),
    );

    let router = handlers::make_router(deployment_manager.clone());
    let addr = SocketAddr::new(args.bind, args.port);

    info!("Binding to and listening at address: {}", addr);

    let server = axum::Server::bind(&addr).serve(router.into_make_service());

    tokio::select! {
        result = server => {
            result.unwrap_or_else(|_| panic!("Failed to serve at address: {}", addr));
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down; terminating deployed instances");
            deployment_manager.shutdown();
        }
    }
}
