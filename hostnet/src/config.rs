use std::net::SocketAddr;

use clap::{Parser, Subcommand};
use hostnet_crds::setting::DEFAULT_NETWORK_SETTING;

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Subcommand, Debug)]
pub enum Commands {
    /// Per-node agent converging the host's bridge and VLANs
    Agent(AgentArgs),
    /// Cluster controller maintaining one HostNetwork per node
    Controller(ControllerArgs),
    /// Print the CustomResourceDefinitions as yaml
    Crdgen,
}

#[derive(Parser, Debug, Clone)]
pub struct AgentArgs {
    /// Name of the node the agent is running on
    #[arg(long, env = "NODE_NAME")]
    pub node_name: String,

    /// Bridge carrying the VLAN network
    #[arg(long, env = "BRIDGE_NAME", default_value = "hostnet-br0")]
    pub bridge_name: String,

    /// Setting resource selecting the uplink nic
    #[arg(long, env = "NETWORK_SETTING", default_value = DEFAULT_NETWORK_SETTING)]
    pub network_setting: String,

    /// Concurrent reconciliations per controller
    #[arg(long, env = "THREADS", default_value_t = 2, value_parser = clap::value_parser!(u16).range(1..))]
    pub threads: u16,

    /// Metrics listener for agent
    #[arg(long, default_value = "0.0.0.0:9090")]
    pub metrics_address: SocketAddr,
}

#[derive(Parser, Debug, Clone)]
pub struct ControllerArgs {
    /// Concurrent reconciliations per controller
    #[arg(long, env = "THREADS", default_value_t = 2, value_parser = clap::value_parser!(u16).range(1..))]
    pub threads: u16,

    /// Metrics listener for controller
    #[arg(long, default_value = "0.0.0.0:9091")]
    pub metrics_address: SocketAddr,
}
