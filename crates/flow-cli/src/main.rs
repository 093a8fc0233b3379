mod config;
mod dead_letter_cmd;
mod registrations;
mod serve_cmd;
mod status_cmd;
mod trigger_cmd;
mod worker_cmd;

#[cfg(test)]
mod test_util;

use clap::{Parser, Subcommand};

use config::FlowCliConfig;
use flow_db::pool;

#[derive(Parser)]
#[command(name = "flowctl", about = "Durable workflow orchestration engine")]
struct Cli {
    /// Database URL (overrides FLOW_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a flowctl config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/flow")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the flow database (creates it and runs migrations)
    DbInit,
    /// Trigger a new workflow execution
    Trigger {
        /// Registered workflow name
        workflow_name: String,
        /// Workflow version (default: 1)
        #[arg(long, default_value_t = 1)]
        workflow_version: i32,
        /// JSON input for the execution
        #[arg(long, default_value = "{}")]
        input: String,
        /// Idempotency key; retriggering with the same key returns the
        /// existing execution
        #[arg(long)]
        idempotency_key: Option<String>,
    },
    /// Show execution status (omit id to list all executions)
    Status {
        /// Execution ID to show status for
        execution_id: Option<String>,
    },
    /// Worker management
    Worker {
        #[command(subcommand)]
        command: WorkerCommands,
    },
    /// Dead-letter queue management
    DeadLetter {
        #[command(subcommand)]
        command: DeadLetterCommands,
    },
    /// Run the REST server
    Serve {
        /// Bind address
        #[arg(long, default_value = "127.0.0.1")]
        bind: String,
        /// Port
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
}

#[derive(Subcommand)]
enum WorkerCommands {
    /// Run a worker until Ctrl+C, draining in place
    Start {
        /// Worker hostname identity (default: local hostname)
        #[arg(long)]
        hostname: Option<String>,
    },
}

#[derive(Subcommand)]
enum DeadLetterCommands {
    /// List dead-lettered tasks
    List {
        /// Filter by workflow name
        #[arg(long)]
        workflow_name: Option<String>,
    },
    /// Reprocess a dead-lettered task into a fresh pending task
    Reprocess {
        /// Dead letter ID to reprocess
        dead_letter_id: String,
    },
}

fn cmd_init(db_url: &str, force: bool) -> anyhow::Result<()> {
    let path = config::config_path();

    if path.exists() && !force {
        anyhow::bail!(
            "config file already exists at {}\nUse --force to overwrite.",
            path.display()
        );
    }

    let cfg = config::ConfigFile {
        database: config::DatabaseSection { url: db_url.to_string() },
    };
    config::save_config(&cfg)?;

    println!("Config written to {}", path.display());
    println!("  database.url = {db_url}");
    println!();
    println!("Next: run `flowctl db-init` to create and migrate the database.");

    Ok(())
}

async fn cmd_db_init(cli_db_url: Option<&str>) -> anyhow::Result<()> {
    let resolved = FlowCliConfig::resolve(cli_db_url);

    println!("Initializing flow database...");

    pool::ensure_database_exists(&resolved.db_config).await?;
    let db_pool = pool::create_pool(&resolved.db_config).await?;
    let migrations_path = pool::default_migrations_path();
    pool::run_migrations(&db_pool, migrations_path).await?;

    let counts = pool::table_counts(&db_pool).await?;
    println!("Database ready. Tables:");
    for (table, count) in &counts {
        println!("  {table}: {count} rows");
    }

    db_pool.close().await;
    println!("flowctl db-init complete.");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Init { db_url, force } => {
            cmd_init(&db_url, force)?;
        }
        Commands::DbInit => {
            cmd_db_init(cli.database_url.as_deref()).await?;
        }
        Commands::Trigger {
            workflow_name,
            workflow_version,
            input,
            idempotency_key,
        } => {
            let resolved = FlowCliConfig::resolve(cli.database_url.as_deref());
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let definitions = registrations::build_definitions()?;
            registrations::sync_audit_rows(&db_pool, &definitions).await?;
            let result = trigger_cmd::run_trigger(
                db_pool.clone(),
                definitions,
                &workflow_name,
                workflow_version,
                &input,
                idempotency_key.as_deref(),
            )
            .await;
            db_pool.close().await;
            result?;
        }
        Commands::Status { execution_id } => {
            let resolved = FlowCliConfig::resolve(cli.database_url.as_deref());
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let result = status_cmd::run_status(&db_pool, execution_id.as_deref()).await;
            db_pool.close().await;
            result?;
        }
        Commands::Worker { command } => match command {
            WorkerCommands::Start { hostname } => {
                let resolved = FlowCliConfig::resolve(cli.database_url.as_deref());
                let db_pool = pool::create_pool(&resolved.db_config).await?;
                let definitions = registrations::build_definitions()?;
                registrations::sync_audit_rows(&db_pool, &definitions).await?;
                let handlers = registrations::build_handlers();
                let hostname = hostname.unwrap_or_else(hostname_fallback);
                let result = worker_cmd::run_worker(db_pool.clone(), &hostname, definitions, handlers).await;
                db_pool.close().await;
                result?;
            }
        },
        Commands::DeadLetter { command } => match command {
            DeadLetterCommands::List { workflow_name } => {
                let resolved = FlowCliConfig::resolve(cli.database_url.as_deref());
                let db_pool = pool::create_pool(&resolved.db_config).await?;
                let result = dead_letter_cmd::run_list(&db_pool, workflow_name.as_deref()).await;
                db_pool.close().await;
                result?;
            }
            DeadLetterCommands::Reprocess { dead_letter_id } => {
                let resolved = FlowCliConfig::resolve(cli.database_url.as_deref());
                let db_pool = pool::create_pool(&resolved.db_config).await?;
                let result = dead_letter_cmd::run_reprocess(&db_pool, &dead_letter_id).await;
                db_pool.close().await;
                result?;
            }
        },
        Commands::Serve { bind, port } => {
            let resolved = FlowCliConfig::resolve(cli.database_url.as_deref());
            let db_pool = pool::create_pool(&resolved.db_config).await?;
            let definitions = registrations::build_definitions()?;
            registrations::sync_audit_rows(&db_pool, &definitions).await?;
            let result = serve_cmd::run_serve(db_pool.clone(), definitions, &bind, port).await;
            db_pool.close().await;
            result?;
        }
    }

    Ok(())
}

fn hostname_fallback() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "flowctl-worker".to_string())
}
