use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;
use modelbay_common::Port;

/// Control plane for uploaded model bundles: packages releases, deploys and
/// supervises instances, and proxies model traffic to a running backend
#[derive(Parser, Debug)]
#[clap(author, version, about)]
pub struct Args {
    /// Port to serve the operator surface and the model proxy on
    #[clap(long, env = "PORT", default_value = "5000")]
    pub port: Port,

    /// Address to bind
    #[clap(long, default_value = "0.0.0.0")]
    pub bind: IpAddr,

    /// Root directory for model releases and deployed sandboxes
    #[clap(long, default_value = ".")]
    pub state: PathBuf,

    /// Host written into instance URLs handed to operators and the proxy
    #[clap(long, default_value = "127.0.0.1")]
    pub instance_host: String,

    /// Python interpreter used to build sandbox environments
    #[clap(long, default_value = "python3")]
    pub python: String,

    /// Kafka broker for the structured event sink; the sink stays off when
    /// this is unset
    #[clap(long, env = "KAFKA_BROKER")]
    pub kafka_broker: Option<String>,

    /// Topic structured log records are published to
    #[clap(long, default_value = "logs")]
    pub kafka_topic: String,
}
