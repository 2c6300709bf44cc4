use hostnet_agent_controller::{AgentConfig, start_agent_controllers};
use hostnet_iface::kernel::IpRoute2;
use kube::Client;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::Result;
use crate::config::AgentArgs;

pub async fn start(args: AgentArgs, ready: CancellationToken, cancel: CancellationToken) -> Result<()> {
    let client = Client::try_default().await?;
    info!(node = %args.node_name, bridge = %args.bridge_name, "starting agent");
    let config = AgentConfig {
        node_name: args.node_name,
        bridge_name: args.bridge_name,
        network_setting: args.network_setting,
        threads: args.threads,
    };
    start_agent_controllers(client, config, IpRoute2::new(), ready, cancel).await?;
    Ok(())
}
