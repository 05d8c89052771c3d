use clap::Parser;
use concord::bootstrap::CoordinationRuntime;
use concord::cli::{self, Cli, Commands};
use concord::config::AppConfig;
use concord::observability::logging::{init_logging, init_logging_simple};
use concord::workflow::WorkflowStatus;
use std::process::ExitCode;
use std::time::Duration;
use tracing::error;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)?;

    let code = match &cli.command {
        Commands::Templates => {
            init_logging_simple();
            let runtime = CoordinationRuntime::start(&config)?;
            cli::list_templates(runtime.workflows.templates());
            ExitCode::SUCCESS
        }
        Commands::Run {
            workflow_type,
            params,
            timeout_secs,
            prometheus,
        } => {
            let _guard = init_logging(&config.logging);
            let runtime = CoordinationRuntime::start(&config)?;
            let status = cli::run_workflow(
                &runtime,
                workflow_type,
                params,
                Duration::from_secs(*timeout_secs),
            )
            .await?;

            let hub_stats = runtime.hub.statistics().await;
            println!(
                "Messages routed: {}, capability requests completed: {}, failed: {}",
                hub_stats.router.messages_routed,
                hub_stats.requests_completed,
                hub_stats.requests_failed
            );
            if *prometheus {
                print!("{}", runtime.metrics.prometheus());
            }
            runtime.shutdown();

            if status == WorkflowStatus::Completed {
                ExitCode::SUCCESS
            } else {
                error!("Workflow ended {}", status);
                ExitCode::FAILURE
            }
        }
        Commands::Propose {
            proposal_type,
            method,
            rejecting,
            voters,
            content,
        } => {
            let _guard = init_logging(&config.logging);
            let runtime = CoordinationRuntime::start(&config)?;
            cli::run_proposal(&runtime, proposal_type, method, *voters, *rejecting, content)
                .await?;
            runtime.shutdown();
            ExitCode::SUCCESS
        }
    };

    Ok(code)
}
