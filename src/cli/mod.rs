use anyhow::Result;
use console::style;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_cron_scheduler::Job;

use crate::core::background::{TaskContext, TaskPool};
use crate::core::config::FleetConfig;
use crate::core::lifecycle::LifecycleManager;
use crate::core::scheduler::JobSweeper;
use crate::core::store::FleetStore;
use crate::core::terminal::{
    print_command, print_error, print_heading, print_info, print_status, print_success, print_warn,
};
use crate::interfaces::ingest::{self, EmbeddedIngestServer};
use crate::interfaces::web::ApiServer;

fn print_help() {
    println!("\n{} fleet control server\n", style("fleetd").green().bold());

    print_heading("Server");
    print_command("serve", "Run the admin API with the embedded ingest listener");
    print_command("ingest", "Run the standalone ingest listener only");

    print_heading("Keys");
    print_command("key generate", "Issue a new agent API key");
    print_command("key list", "List issued keys");
    print_command("key revoke --id <id>", "Permanently revoke a key");
    print_command("key rotate --id <id>", "Re-key an identity, killing the old key");

    println!(
        "\n {} {} <command> [flags]\n",
        style("Usage:").bold(),
        style("fleetd").green()
    );
}

/// `--flag value` walker shared by the subcommands; unknown flags are
/// ignored so shared env-derived defaults stay in effect.
pub(crate) fn flag_value(args: &[String], start: usize, flag: &str) -> Option<String> {
    let mut i = start;
    while i < args.len() {
        if args[i] == flag && i + 1 < args.len() {
            return Some(args[i + 1].clone());
        }
        i += 1;
    }
    None
}

pub(crate) fn apply_serve_flags(config: &mut FleetConfig, args: &[String], start: usize) {
    if let Some(host) = flag_value(args, start, "--api-host") {
        config.api_host = host;
    }
    if let Some(port) = flag_value(args, start, "--api-port") {
        config.api_port = port.parse().unwrap_or(config.api_port);
    }
    if let Some(host) = flag_value(args, start, "--ingest-host") {
        config.ingest_host = host;
    }
    if let Some(port) = flag_value(args, start, "--ingest-port") {
        config.ingest_port = port.parse().unwrap_or(config.ingest_port);
    }
    if args[start..].iter().any(|a| a == "--no-embed-ingest") {
        config.embed_ingest = false;
    }
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let mut config = FleetConfig::from_env();

    if args.len() < 2 {
        print_help();
        return Ok(());
    }

    match args[1].as_str() {
        "serve" => {
            apply_serve_flags(&mut config, &args, 2);
            run_serve(config).await
        }
        "ingest" => {
            apply_serve_flags(&mut config, &args, 2);
            ingest::run_standalone(&config).await
        }
        "key" => run_key_command(&args, &config).await,
        "help" | "--help" | "-h" => {
            print_help();
            Ok(())
        }
        other => {
            print_error(&format!("Unknown command: {other}"));
            print_help();
            Ok(())
        }
    }
}

/// Main-process topology: admin API, optional embedded ingest listener, and
/// the maintenance tick (sweep + expiry + retention purge) on one lifecycle.
async fn run_serve(config: FleetConfig) -> Result<()> {
    let config = Arc::new(config);
    let store = Arc::new(FleetStore::open(&config.db_path)?);
    let pool = TaskPool::new(config.pool_workers);
    let sweeper = Arc::new(JobSweeper::new(store.clone()));

    let mut lifecycle = LifecycleManager::new().await?;
    lifecycle.attach(Arc::new(Mutex::new(ApiServer::new(
        store.clone(),
        sweeper.clone(),
        pool.clone(),
        config.clone(),
    ))));
    if config.embed_ingest {
        lifecycle.attach(Arc::new(Mutex::new(EmbeddedIngestServer::new(
            store.clone(),
            &config,
        ))));
    } else {
        print_info("Embedded ingest disabled; expecting a standalone `fleetd ingest` process.");
    }

    let tick_sweeper = sweeper.clone();
    let tick_pool = pool.clone();
    let tick_config = config.clone();
    let tick = Job::new_repeated_async(
        Duration::from_secs(u64::from(config.sweep_interval_secs.max(1))),
        move |_uuid, _lock| {
            let sweeper = tick_sweeper.clone();
            let pool = tick_pool.clone();
            let ctx = TaskContext::new(None, tick_config.clone());
            Box::pin(async move {
                sweeper.run_tick(&pool, ctx).await;
            })
        },
    )?;
    lifecycle.scheduler.add(tick).await?;

    lifecycle.start().await?;

    print_success("fleetd is running");
    print_status(
        "Admin API",
        &format!("http://{}:{}", config.api_host, config.api_port),
    );
    if config.embed_ingest {
        print_status(
            "Ingest",
            &format!("http://{}:{}", config.ingest_host, config.ingest_port),
        );
    }
    print_status("Store", &config.db_path.display().to_string());
    println!("\n  Press {} to stop.\n", style("Ctrl+C").bold().yellow());

    tokio::signal::ctrl_c().await?;

    lifecycle.shutdown().await?;
    // Best-effort drain; anything still queued after the grace period is
    // abandoned, which the pool contract allows.
    pool.shutdown(Duration::from_secs(5)).await;
    Ok(())
}

async fn run_key_command(args: &[String], config: &FleetConfig) -> Result<()> {
    let sub = args.get(2).map(String::as_str).unwrap_or("");
    let store = FleetStore::open(&config.db_path)?;

    match sub {
        "generate" => {
            let Some(name) = flag_value(args, 3, "--name") else {
                print_error("--name is required for key generate");
                return Ok(());
            };
            let description = flag_value(args, 3, "--description");
            let principal = flag_value(args, 3, "--principal");
            let (plain, record) = store
                .create_agent_key(&name, description.as_deref(), principal.as_deref())
                .await?;
            print_success(&format!("Key created for '{}' (id {})", record.name, record.id));
            print_status("Key", &plain);
            print_warn("Save this key now - it will not be shown again.");
        }
        "list" => {
            let keys = store.list_agent_keys().await?;
            if keys.is_empty() {
                print_info("No agent keys issued yet.");
            }
            for key in keys {
                let state = if key.is_active() { "active" } else { "revoked" };
                print_status(
                    &key.name,
                    &format!(
                        "id={} prefix={} {} last_used={}",
                        key.id,
                        key.prefix,
                        state,
                        key.last_used_at.as_deref().unwrap_or("never")
                    ),
                );
            }
        }
        "revoke" => {
            let Some(id) = flag_value(args, 3, "--id") else {
                print_error("--id is required for key revoke");
                return Ok(());
            };
            let record = store.get_agent_key(&id).await?;
            store.revoke_agent_key(&id).await?;
            print_success(&format!("Key '{}' ({id}) revoked.", record.name));
        }
        "rotate" => {
            let Some(id) = flag_value(args, 3, "--id") else {
                print_error("--id is required for key rotate");
                return Ok(());
            };
            let (plain, record) = store.rotate_agent_key(&id).await?;
            print_success(&format!("Key rotated for '{}'", record.name));
            print_status("New key", &plain);
            print_warn("The previous key is no longer valid.");
        }
        _ => {
            print_error("Expected: key generate | list | revoke | rotate");
        }
    }
    Ok(())
}
