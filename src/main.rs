use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use gpu_stack_deploy::cloud::SimulatedCloud;
use gpu_stack_deploy::error::{ErrorCode, ErrorJournal, JournalRecord, Severity};
use gpu_stack_deploy::health::{HealthSnapshot, HealthStatus};
use gpu_stack_deploy::orchestrator::MonitorOutcome;
use gpu_stack_deploy::provisioner::DesiredShape;
use gpu_stack_deploy::registry::TeardownSummary;
use gpu_stack_deploy::validation::{CheckResult, RunOutcome, ValidationTarget};
use gpu_stack_deploy::*;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "stackctl")]
#[command(about = "Provision, validate, monitor and tear down GPU AI stacks on spot capacity")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override the state directory (journal, ledger, reports, logs)
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Allocate compute for a stack, falling back across classes and regions
    Provision {
        /// Stack name
        stack: String,

        /// Primary region
        #[arg(short, long)]
        region: Option<String>,

        /// Instance classes to try first, in order
        #[arg(short = 't', long = "instance-type", value_delimiter = ',')]
        instance_types: Vec<String>,

        /// Spot bid ceiling (USD/hour)
        #[arg(long)]
        spot_price: Option<String>,

        /// Request guaranteed capacity instead of spot
        #[arg(long)]
        on_demand: bool,

        /// Try same-priority regions concurrently
        #[arg(long)]
        diversified: bool,

        /// Leave partially created resources on failure
        #[arg(long)]
        no_rollback: bool,
    },

    /// Release every resource registered to a stack
    Teardown {
        /// Stack name
        stack: String,
    },

    /// Run pre-deployment checks (dependencies, environment, modules, network, all)
    Validate {
        #[arg(default_value = "all")]
        target: String,

        /// Bypass the result cache
        #[arg(long)]
        no_cache: bool,

        /// Run `all` one check at a time
        #[arg(long)]
        sequential: bool,

        /// Retry failing checks with backoff
        #[arg(long)]
        retry: bool,

        /// Cache discriminator, usually the stack name
        #[arg(long)]
        context: Option<String>,
    },

    /// Check stack health once, or keep watching
    Health {
        /// Stack name
        stack: String,

        /// Keep checking at the configured interval until Ctrl+C
        #[arg(short, long)]
        watch: bool,
    },

    /// Summarise the error journal
    Errors {
        /// Only events of this stack
        #[arg(long)]
        stack: Option<String>,

        /// Print the raw journal records
        #[arg(long)]
        raw: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            report_failure(&e);
            1
        }
    };

    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = DeployConfig::load(cli.config.as_deref())?;
    if let Some(dir) = &cli.state_dir {
        config.paths.state_dir = Some(dir.clone());
    }

    let _log_guard = init_tracing(cli.debug, &config)?;

    match &cli.command {
        Commands::Provision {
            stack,
            region,
            instance_types,
            spot_price,
            on_demand,
            diversified,
            no_rollback,
        } => {
            apply_provision_overrides(
                &mut config,
                region.as_deref(),
                instance_types,
                spot_price.as_deref(),
                *on_demand,
                *diversified,
                *no_rollback,
            )?;
            let deployment = open_deployment(config)?;
            let outcome = provision(&deployment, stack).await;
            finish(&deployment);
            outcome
        }
        Commands::Teardown { stack } => {
            let deployment = open_deployment(config)?;
            let summary = deployment.teardown(stack).await;
            print_teardown(&summary);
            finish(&deployment);
            if summary.is_complete() {
                Ok(())
            } else {
                Err(anyhow::anyhow!(
                    "{} resources could not be released and remain registered",
                    summary.failed.len()
                ))
            }
        }
        Commands::Validate {
            target,
            no_cache,
            sequential,
            retry,
            context,
        } => {
            let target: ValidationTarget = target.parse().map_err(DeployError::from)?;
            let deployment = open_deployment(config)?;

            let mut options = deployment.config().run_options(context.as_deref());
            options.cache &= !no_cache;
            options.parallel &= !sequential;
            options.retry |= *retry;

            let outcome = deployment.run_validation(target, &options).await;
            print_validation(&outcome);
            finish(&deployment);

            outcome.into_result().map(|_| ()).map_err(|e| DeployError::from(e).into())
        }
        Commands::Health { stack, watch } => {
            let deployment = open_deployment(config)?;
            let outcome = if *watch {
                watch_health(&deployment, stack).await
            } else {
                let snapshot = deployment.health_check(stack).await;
                print_snapshot(&snapshot);
                Ok(())
            };
            finish(&deployment);
            outcome
        }
        Commands::Errors { stack, raw } => show_errors(&config, stack.as_deref(), *raw),
    }
}

/// Console output plus a daily rolling JSON log under the state directory
fn init_tracing(debug: bool, config: &DeployConfig) -> Result<WorkerGuard> {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    let log_dir = config.log_dir();
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;

    let appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("stackctl")
        .filename_suffix("log")
        .build(&log_dir)
        .context("Failed to initialize log file")?;
    let (file_writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(fmt::layer().json().with_ansi(false).with_writer(file_writer))
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}

/// The binary drives the core against the in-process provider
fn open_deployment(config: DeployConfig) -> Result<Deployment> {
    let cloud = Arc::new(SimulatedCloud::new());
    Ok(Deployment::open(config, cloud)?)
}

fn finish(deployment: &Deployment) {
    match deployment.finish() {
        Ok(Some(report)) if report.total_events > 0 => {
            tracing::info!(events = report.total_events, "Error report written");
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "Failed to write error report"),
    }
}

fn apply_provision_overrides(
    config: &mut DeployConfig,
    region: Option<&str>,
    instance_types: &[String],
    spot_price: Option<&str>,
    on_demand: bool,
    diversified: bool,
    no_rollback: bool,
) -> Result<()> {
    use gpu_stack_deploy::validation::{inputs, ValidationError};

    let p = &mut config.provisioning;

    if let Some(region) = region {
        inputs::validate_region(region).map_err(|e| DeployError::from(ValidationError::from(e)))?;
        p.fallback_regions.retain(|r| r != region);
        p.primary_region = region.to_string();
    }
    if !instance_types.is_empty() {
        for class in instance_types {
            inputs::validate_instance_type(class)
                .map_err(|e| DeployError::from(ValidationError::from(e)))?;
        }
        p.instance_classes = instance_types
            .iter()
            .filter(|c| c.as_str() != "auto")
            .cloned()
            .collect();
        // `auto` alone means the default preference list
        if p.instance_classes.is_empty() {
            p.instance_classes = DesiredShape::default().preferred_classes;
        }
    }
    if let Some(price) = spot_price {
        let price = inputs::validate_spot_price(price)
            .map_err(|e| DeployError::from(ValidationError::from(e)))?;
        p.max_spot_price = Some(price);
    }
    if on_demand {
        p.interruptible = false;
        p.max_spot_price = None;
    }
    p.diversified |= diversified;
    p.rollback_on_failure &= !no_rollback;

    Ok(())
}

async fn provision(deployment: &Deployment, stack: &str) -> Result<()> {
    let started = Instant::now();
    println!("Provisioning {}...", stack.bold());

    let interrupted = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
        println!("{}", "Interrupted, releasing partial allocations...".yellow());
    };
    let result = deployment.provision_cancellable(stack, interrupted).await?;

    for attempt in &result.attempts {
        println!(
            "  {} {} ({}: {})",
            "✗".red(),
            attempt.candidate,
            attempt.code.to_string().yellow(),
            attempt.strategy
        );
    }
    println!(
        "  {} {} in {}",
        "✓".green(),
        result,
        humantime::format_duration(whole_millis(started.elapsed()))
    );

    Ok(())
}

async fn watch_health(deployment: &Deployment, stack: &str) -> Result<()> {
    println!(
        "Watching {} every {} (Ctrl+C to stop)...",
        stack.bold(),
        humantime::format_duration(Duration::from_secs(deployment.config().health.interval_secs))
    );

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    match deployment.monitor(stack, shutdown).await {
        MonitorOutcome::Stopped { ticks, last } => {
            if let Some(reporter) = deployment.reporter() {
                if let Ok(Some(snapshot)) = reporter.latest(stack) {
                    print_snapshot(&snapshot);
                }
            }
            println!(
                "Stopped after {} checks (last status: {})",
                ticks,
                last.map(|s| s.to_string()).unwrap_or_else(|| "none".into())
            );
            Ok(())
        }
        MonitorOutcome::RolledBack { ticks, summary } => {
            println!(
                "{} stack stayed unhealthy for {} checks and was torn down",
                "!".red().bold(),
                ticks
            );
            print_teardown(&summary);
            Err(anyhow::anyhow!("stack {} rolled back", stack))
        }
    }
}

fn show_errors(config: &DeployConfig, stack: Option<&str>, raw: bool) -> Result<()> {
    let journal = ErrorJournal::new(config.journal_path());
    let records: Vec<JournalRecord> = journal
        .read_all()?
        .into_iter()
        .filter(|r| stack.is_none() || r.stack_id.as_deref() == stack)
        .collect();

    if records.is_empty() {
        println!("No errors recorded.");
        return Ok(());
    }

    if raw {
        for record in &records {
            println!("{}", serde_json::to_string(record)?);
        }
        return Ok(());
    }

    let mut by_code: BTreeMap<ErrorCode, (usize, &JournalRecord)> = BTreeMap::new();
    for record in &records {
        let entry = by_code.entry(record.code.clone()).or_insert((0, record));
        entry.0 += 1;
        entry.1 = record;
    }

    println!("{:<30} {:<16} {:<9} {:<9} {:>6}  LAST SEEN", "CODE", "CATEGORY", "SEVERITY", "STRATEGY", "COUNT");
    println!("{}", "=".repeat(96));
    for (code, (count, last)) in &by_code {
        println!(
            "{:<30} {:<16} {:<9} {:<9} {:>6}  {}",
            code.to_string(),
            last.category.to_string(),
            colour_severity(last.severity),
            last.strategy.to_string(),
            count,
            last.timestamp.format("%Y-%m-%d %H:%M:%S")
        );
    }
    println!("\n{} events across {} codes", records.len(), by_code.len());

    Ok(())
}

fn print_teardown(summary: &TeardownSummary) {
    for record in &summary.released {
        println!(
            "  {} released {} {}",
            "✓".green(),
            record.resource_type,
            record.resource_id
        );
    }
    for failure in &summary.failed {
        println!(
            "  {} {} {}: {} ({})",
            "✗".red(),
            failure.resource_type,
            failure.resource_id,
            failure.reason,
            failure.code.to_string().yellow()
        );
    }
    if summary.released.is_empty() && summary.failed.is_empty() {
        println!("  nothing registered for {}", summary.stack_id);
    }
}

fn print_validation(outcome: &RunOutcome) {
    for result in outcome.results() {
        print_check(result);
    }
    if outcome.passed() {
        println!("{}", "All checks passed".green().bold());
    }
}

fn print_check(result: &CheckResult) {
    let mark = if result.passed() {
        "✓".green()
    } else {
        "✗".red()
    };
    println!("  {} {:<13} {}", mark, result.validation_type.to_string(), result.output);
}

fn print_snapshot(snapshot: &HealthSnapshot) {
    println!(
        "Stack {}: {}  ({})",
        snapshot.stack_id.bold(),
        colour_status(snapshot.overall),
        snapshot.timestamp.format("%Y-%m-%d %H:%M:%S UTC")
    );
    println!("{}", "-".repeat(60));
    for (domain, report) in &snapshot.domains {
        println!(
            "  {:<10} {:<20} {}",
            domain.to_string(),
            colour_status(report.status),
            report.detail
        );
    }
    if !snapshot.services.is_empty() {
        let services: Vec<String> = snapshot
            .services
            .iter()
            .map(|(name, status)| format!("{}={}", name, colour_status(*status)))
            .collect();
        println!("  services   {}", services.join("  "));
    }

    let m = &snapshot.metrics;
    print!(
        "  host       cpu {:.1}%  mem {:.1}%  disk {:.1}%",
        m.cpu_percent, m.memory_percent, m.disk_percent
    );
    match m.latency_ms {
        Some(latency) => println!("  latency {:.0}ms", latency),
        None => println!(),
    }
}

fn colour_status(status: HealthStatus) -> colored::ColoredString {
    match status {
        HealthStatus::Healthy => status.to_string().green(),
        HealthStatus::Degraded | HealthStatus::Updating | HealthStatus::Unknown => {
            status.to_string().yellow()
        }
        HealthStatus::Unhealthy | HealthStatus::NotFound => status.to_string().red(),
    }
}

fn colour_severity(severity: Severity) -> colored::ColoredString {
    match severity {
        Severity::Info => severity.to_string().normal(),
        Severity::Warning => severity.to_string().yellow(),
        Severity::Error => severity.to_string().red(),
        Severity::Critical => severity.to_string().red().bold(),
    }
}

fn whole_millis(d: Duration) -> Duration {
    Duration::from_millis(d.as_millis() as u64)
}

/// Code, cause and remediation for every surfaced failure
fn report_failure(e: &anyhow::Error) {
    eprintln!("{} {:#}", "Error:".red().bold(), e);

    let Some(deploy) = e.downcast_ref::<DeployError>() else {
        return;
    };

    if let Some(code) = deploy.code() {
        eprintln!("  {} {}", "code:".bold(), code.to_string().yellow());
        eprintln!("  {} {}", "cause:".bold(), code.cause());
    }
    eprintln!("  {}", "remediation:".bold());
    for step in deploy.remediation() {
        eprintln!("    - {}", step);
    }
}
