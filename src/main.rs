use clap::{Args, Parser, Subcommand};
use drsentinel::adapters;
use drsentinel::config::AppConfig;
use drsentinel::context::AppContext;
use drsentinel::core::crypto::{Encryptor, Passphrase};
use drsentinel::core::{
    BackupCoordinator, BackupMode, FailoverController, ManifestRef, RestoreOrchestrator,
};
use drsentinel::db;
use drsentinel::error::{DrError, DrResult, Operation};
use drsentinel::logging::{self, LogConfig};
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, warn};

#[derive(Parser)]
#[command(name = "drsentinel")]
#[command(about = "Backup, restore, and failover for a multi-component platform", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    global: GlobalArgs,
}

#[derive(Args, Serialize)]
struct GlobalArgs {
    /// Configuration file (default /etc/drsentinel/config.toml)
    #[serde(skip)]
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Replace every external system with the in-memory simulation
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    simulation: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    verbose: Option<bool>,

    /// Emit logs and results as JSON
    #[serde(rename = "json_logs", skip_serializing_if = "Option::is_none")]
    #[arg(long, global = true)]
    json: Option<bool>,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture, verify, and upload a manifest for an environment
    Backup {
        environment: String,
        #[arg(value_enum)]
        mode: BackupMode,
    },
    /// Restore a manifest into an environment
    Restore {
        /// Manifest id, or `latest`
        manifest: ManifestRef,
        target: String,
        /// Environment whose newest manifest `latest` refers to (default: target)
        #[arg(long)]
        from: Option<String>,
    },
    /// Move traffic to another site
    Failover {
        site: String,
        reason: String,
        /// Resync data to the target before cutover
        #[arg(long, conflicts_with = "no_resync")]
        resync: bool,
        #[arg(long)]
        no_resync: bool,
    },
    /// Delete expired manifests locally and remotely
    Prune {
        environment: String,
        #[arg(long)]
        days: Option<u32>,
    },
    /// List local manifests for an environment
    Manifests { environment: String },
    /// Show the failover audit log
    History {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match AppConfig::new(cli.global.config.as_deref(), Some(&cli.global)) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::from(2);
        }
    };

    logging::init(LogConfig {
        json: config.json_logs,
        verbose: config.verbose,
    });
    let json = config.json_logs;

    if let Commands::Config = cli.command {
        return match config.to_toml() {
            Ok(rendered) => {
                print!("{rendered}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("{e:#}");
                ExitCode::FAILURE
            }
        };
    }

    let ctx = match build_context(config).await {
        Ok(ctx) => ctx,
        Err(e) => {
            error!(error = %e, "Startup failed");
            return ExitCode::from(2);
        }
    };

    let code = match cli.command {
        Commands::Backup { environment, mode } => run_backup(ctx, &environment, mode, json).await,
        Commands::Restore {
            manifest,
            target,
            from,
        } => run_restore(ctx, &manifest, &target, from.as_deref(), json).await,
        Commands::Failover {
            site,
            reason,
            resync,
            no_resync,
        } => {
            let resync = match (resync, no_resync) {
                (true, _) => Some(true),
                (_, true) => Some(false),
                _ => None,
            };
            run_failover(ctx, &site, &reason, resync, json).await
        }
        Commands::Prune { environment, days } => run_prune(ctx, &environment, days, json).await,
        Commands::Manifests { environment } => run_manifests(ctx, &environment, json).await,
        Commands::History { limit } => run_history(ctx, limit, json).await,
        Commands::Config => 0,
    };
    ExitCode::from(code)
}

async fn build_context(config: AppConfig) -> DrResult<AppContext> {
    let db = db::init(&config.state_db).await?;

    let platform = if config.simulation {
        warn!("Simulation mode: cluster, services, and DNS are in-memory");
        adapters::simulated(&config).0
    } else {
        adapters::live(&config)?
    };

    // Commands that never touch artifacts still run without a passphrase
    let encryptor = match (&config.encryption.passphrase_file, config.encryption.enabled) {
        (Some(path), true) => match Passphrase::from_file(path).await {
            Ok(passphrase) => Some(Encryptor::new(passphrase)),
            Err(e) => {
                warn!(error = %e, "Encryption passphrase unavailable");
                None
            }
        },
        _ => None,
    };

    AppContext::new(config, db, platform, encryptor)
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(rendered) => println!("{rendered}"),
        Err(e) => error!(error = %e, "Failed to render result"),
    }
}

fn report_error(op: Operation, e: &DrError) -> u8 {
    error!(error = %e, "Operation aborted");
    eprintln!("error: {e}");
    e.exit_code(op)
}

async fn run_backup(ctx: AppContext, environment: &str, mode: BackupMode, json: bool) -> u8 {
    match BackupCoordinator::new(ctx).run(environment, mode).await {
        Ok(run) => {
            let m = &run.manifest;
            if json {
                print_json(m);
            } else {
                println!("manifest {} {}", m.id, m.status.as_str());
                for artifact in m.artifacts.values() {
                    println!(
                        "  {:<14} {:>12} bytes  {}",
                        artifact.component, artifact.size_bytes, artifact.checksum
                    );
                }
                if let Some(failure) = &m.failure {
                    println!(
                        "  failed during {} at {}: {}",
                        failure.phase.as_str(),
                        failure.component.as_deref().unwrap_or("-"),
                        failure.message
                    );
                }
                if let Some(prune) = &run.prune {
                    println!(
                        "  pruned {} local, {} remote",
                        prune.deleted_local.len(),
                        prune.deleted_remote.len()
                    );
                }
            }
            run.exit_code()
        }
        Err(e) => report_error(Operation::Backup, &e),
    }
}

async fn run_restore(
    ctx: AppContext,
    manifest: &ManifestRef,
    target: &str,
    from: Option<&str>,
    json: bool,
) -> u8 {
    match RestoreOrchestrator::new(ctx).restore(manifest, target, from).await {
        Ok(session) => {
            if json {
                print_json(&session);
            } else {
                println!(
                    "session {} manifest {} -> {}: {}",
                    session.id,
                    session.manifest_id,
                    session.target_environment,
                    session.phase.as_str()
                );
                for step in &session.steps {
                    println!("  {:<14} {}", step.component, step.status.as_str());
                }
                if let Some(error) = &session.error {
                    println!("  error: {error}");
                }
            }
            if session.is_completed() { 0 } else { 1 }
        }
        Err(e) => report_error(Operation::Restore, &e),
    }
}

async fn run_failover(
    ctx: AppContext,
    site: &str,
    reason: &str,
    resync: Option<bool>,
    json: bool,
) -> u8 {
    match FailoverController::new(ctx).failover(site, reason, resync).await {
        Ok(event) => {
            if json {
                print_json(&event);
            } else {
                println!(
                    "failover {} {} -> {}: {}",
                    event.id,
                    event.source_site,
                    event.target_site,
                    event.outcome.as_str()
                );
                if let Some(detail) = &event.detail {
                    println!("  {detail}");
                }
            }
            event.outcome.exit_code()
        }
        Err(e) => report_error(Operation::Failover, &e),
    }
}

async fn run_prune(ctx: AppContext, environment: &str, days: Option<u32>, json: bool) -> u8 {
    if let Err(e) = ctx.config.environment(environment) {
        return report_error(Operation::Prune, &e);
    }
    let _guard = match ctx.locks.acquire(environment, "prune") {
        Ok(guard) => guard,
        Err(e) => return report_error(Operation::Prune, &e),
    };
    let days = days.unwrap_or(ctx.config.retention_days);

    match ctx.retention().prune(environment, days).await {
        Ok(report) => {
            if json {
                print_json(&report);
            } else {
                println!(
                    "kept {}; deleted {} local, {} remote",
                    report.protected.as_deref().unwrap_or("-"),
                    report.deleted_local.len(),
                    report.deleted_remote.len()
                );
                for error in &report.errors {
                    println!("  error: {error}");
                }
            }
            if report.is_clean() { 0 } else { 1 }
        }
        Err(e) => report_error(Operation::Prune, &e),
    }
}

async fn run_manifests(ctx: AppContext, environment: &str, json: bool) -> u8 {
    let manifests = match ctx.store.list(environment).await {
        Ok(manifests) => manifests,
        Err(e) => return report_error(Operation::Backup, &e),
    };
    if json {
        print_json(&manifests);
        return 0;
    }

    let now = ctx.clock.now();
    for m in &manifests {
        let age = now - m.created_at;
        println!(
            "{:<40} {:<12} {:<11} {:>4}d {:>3}h",
            m.id,
            m.mode.as_str(),
            m.status.as_str(),
            age.num_days(),
            age.num_hours() % 24
        );
    }
    if manifests.is_empty() {
        println!("no manifests for {environment}");
    }
    0
}

async fn run_history(ctx: AppContext, limit: usize, json: bool) -> u8 {
    let events = match db::failovers::list(&ctx.db, limit).await {
        Ok(events) => events,
        Err(e) => {
            error!(error = %e, "Failed to read failover history");
            return 1;
        }
    };
    if json {
        print_json(&events);
        return 0;
    }
    for event in &events {
        println!(
            "{} {:<9} {} -> {} dns_updated={} resynced={} reason={:?}",
            event.timestamp.to_rfc3339(),
            event.outcome.as_str(),
            event.source_site,
            event.target_site,
            event.dns_updated,
            event.data_resynced,
            event.reason
        );
    }
    0
}
