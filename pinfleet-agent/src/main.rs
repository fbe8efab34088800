mod config;
mod executor;
mod transport;

use clap::{Parser, Subcommand};
use config::Config;
use executor::LocalJobExecutor;
use pinfleet_core::{
    CapacityPayload, CompletionBoard, HttpStorageNodeClient, JobQueue, JobSpec, LinkEvent,
    ProviderLink, RegisterPayload, WireMessage,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use transport::WsLinkTransport;

#[derive(Parser)]
#[command(name = "pinfleet-agent")]
#[command(about = "Provider-side agent for the Pinfleet storage network")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to the backend and start processing storage jobs
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "agent.yaml")]
        config: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pinfleet=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let Commands::Run { config } = cli.command;

    let cfg = match Config::from_file(&config) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    tracing::info!(
        "Starting agent for provider {} against {}",
        cfg.agent.provider_id,
        cfg.agent.backend_url
    );

    if let Err(e) = run_agent(cfg).await {
        tracing::error!("Agent error: {}", e);
        std::process::exit(1);
    }
}

async fn run_agent(cfg: Config) -> pinfleet_core::Result<()> {
    let client = Arc::new(HttpStorageNodeClient::new(Duration::from_secs(30)));

    let register = RegisterPayload {
        provider_id: cfg.agent.provider_id.clone(),
        node_id: cfg.agent.node_id.clone(),
        capacity: Some(CapacityPayload {
            used_bytes: 0,
            total_bytes: cfg.agent.capacity_total_bytes,
        }),
    };

    let transport = Arc::new(WsLinkTransport::new(cfg.agent.backend_url.clone()));
    let link = ProviderLink::new(
        transport,
        cfg.agent.auth_token.clone(),
        register,
        cfg.provider.clone(),
    );
    let (link_handle, mut events, _link_task) = link.spawn();

    // Outbound messages funnel through one channel so executors never
    // touch the link directly.
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<WireMessage>();
    {
        let link_handle = link_handle.clone();
        tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                if link_handle.send(message).is_err() {
                    break;
                }
            }
        });
    }

    let board = CompletionBoard::default();
    let executor = Arc::new(LocalJobExecutor::new(
        client,
        cfg.agent.storage_node_addr.clone(),
        outbound_tx.clone(),
        board.clone(),
    ));
    let queue = JobQueue::spawn(executor, cfg.jobs.clone(), board);

    while let Some(event) = events.recv().await {
        match event {
            LinkEvent::Connected => {
                tracing::info!("Connected to backend");
            }
            LinkEvent::Registered(welcome) => {
                tracing::info!(
                    "Registered as {} (heartbeat every {}s)",
                    welcome.provider_id,
                    welcome.heartbeat_interval_secs
                );
            }
            LinkEvent::Message(message) => {
                handle_backend_message(&cfg, &queue, &outbound_tx, message);
            }
            LinkEvent::Disconnected { attempt } => {
                tracing::warn!("Backend link lost (reconnect attempt {})", attempt);
            }
            LinkEvent::GaveUp { attempts } => {
                tracing::error!(
                    "Backend unreachable after {} reconnect attempts, shutting down",
                    attempts
                );
                break;
            }
        }
    }

    Ok(())
}

fn handle_backend_message(
    cfg: &Config,
    queue: &JobQueue,
    outbound: &mpsc::UnboundedSender<WireMessage>,
    message: WireMessage,
) {
    match message {
        WireMessage::StorageJob(job) => {
            tracing::info!(
                "Storage job for contract {} (cid {})",
                job.contract_id,
                job.cid
            );
            queue.add_job(
                &format!("contract:{}", job.contract_id),
                JobSpec::AcceptContract {
                    contract_id: job.contract_id,
                },
            );
            queue.add_job(
                &format!("pin:{}", job.cid),
                JobSpec::Pin { cid: job.cid },
            );
        }
        WireMessage::PinRequest(request) => {
            queue.add_job(
                &format!("pin:{}", request.cid),
                JobSpec::Pin { cid: request.cid },
            );
        }
        WireMessage::UnpinRequest(request) => {
            queue.add_job(
                &format!("unpin:{}", request.cid),
                JobSpec::Unpin { cid: request.cid },
            );
        }
        WireMessage::CapacityRequest(_) => {
            // TODO: report actual repo usage once the storage-node
            // capability exposes repository statistics.
            let _ = outbound.send(WireMessage::CapacityUpdate(CapacityPayload {
                used_bytes: 0,
                total_bytes: cfg.agent.capacity_total_bytes,
            }));
        }
        WireMessage::PaymentReceived(payment) => {
            tracing::info!(
                "Payment of {} received for contract {}",
                payment.amount,
                payment.contract_id
            );
        }
        other => {
            tracing::debug!("Ignoring unexpected backend message: {:?}", other);
        }
    }
}
