use clap::Parser;
use hostnet::config::{Cli, Commands};
use hostnet::{Result, agent, controller, http};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let (name, addr) = match &cli.command {
        Commands::Agent(args) => ("agent", args.metrics_address),
        Commands::Controller(args) => ("controller", args.metrics_address),
        Commands::Crdgen => {
            hostnet_crds::crd_gen_all()?;
            return Ok(());
        }
    };
    setup_subscriber();

    let cancel = CancellationToken::new();
    // flipped once the stores are synced and the controllers start
    let ready = CancellationToken::new();
    let mut metrics_handle = tokio::spawn(http::serve_metrics(
        addr,
        ready.child_token(),
        cancel.child_token(),
    ));
    let mut main_handle = match cli.command {
        Commands::Agent(args) => tokio::spawn(agent::start(args, ready, cancel.child_token())),
        Commands::Controller(args) => {
            tokio::spawn(controller::start(args, ready, cancel.child_token()))
        }
        Commands::Crdgen => return Ok(()),
    };
    let mut shutdown_handle = tokio::spawn(async move { shutdown_signal().await });
    // watch for shutdown and errors
    tokio::select! {
        h = &mut metrics_handle => exit("metrics", h),
        h = &mut main_handle => exit(name, h),
        _ = &mut shutdown_handle => {
                cancel.cancel();
                let (metrics, main) = tokio::join!(metrics_handle, main_handle);
                if let Err(m) = metrics {
                    error!("metrics exited with error: {}", m.to_string());
                }
                if let Err(s) = main {
                    error!("{name} exited with error: {}", s.to_string());
                }
            },
    };
    info!("Exiting...");
    Ok(())
}

fn setup_subscriber() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "hostnet=info,hostnet_iface=info,hostnet_agent_controller=info,hostnet_node_controller=info"
                .into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for ctrl_c: {e}");
            std::future::pending::<()>().await;
        }
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("failed to install signal handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = ctrl_c => {
          info!("captured ctrl_c signal");
        },
        _ = terminate => {},
    }
}

fn exit(task: &str, out: Result<Result<()>, JoinError>) {
    match out {
        Ok(Ok(_)) => {
            info!("{task} exited")
        }
        Ok(Err(e)) => {
            error!("{task} failed with error: {e}")
        }
        Err(e) => {
            error!("{task} task failed to complete: {e}")
        }
    }
}
