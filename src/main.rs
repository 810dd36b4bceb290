use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use wa_session_gateway::cli::{Args, ConfigDiscovery, ExecutionMode, SessionTarget};
use wa_session_gateway::{
    GatewayConfig, RestoreOutcome, SessionKey, SessionPersistenceManager, StorageTier,
};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose {
        "wa_session_gateway=debug"
    } else {
        "wa_session_gateway=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter)),
        )
        .init();

    let mode = match args.mode() {
        Ok(mode) => mode,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    };

    match mode {
        ExecutionMode::ShowConfig => show_config(args.config.as_deref()),
        ExecutionMode::InitConfig => {
            let path = ConfigDiscovery::create_default_user_config()?;
            println!("✅ Configuration file: {}", path.display());
            Ok(())
        }
        session_mode => {
            let config = ConfigDiscovery::load(args.config.as_deref())?;
            run_session_command(&config, session_mode).await
        }
    }
}

fn show_config(config_override: Option<&Path>) -> Result<()> {
    ConfigDiscovery::show_discovery_info();

    let mut config = ConfigDiscovery::load(config_override)?;
    if config.storage.encryption_key.is_some() {
        config.storage.encryption_key = Some("<redacted>".to_string());
    }
    println!();
    println!("Effective configuration:");
    println!("{}", config.to_toml_string()?);
    Ok(())
}

async fn run_session_command(config: &GatewayConfig, mode: ExecutionMode) -> Result<()> {
    let persistence = SessionPersistenceManager::from_config(&config.storage)
        .context("Failed to initialize session persistence")?;

    if config.storage.tier == StorageTier::Local
        && matches!(mode, ExecutionMode::Backup(_) | ExecutionMode::Restore { .. })
    {
        warn!("Storage tier is local; backup and restore need a remote tier");
    }

    let result = execute(&persistence, mode).await;
    persistence.shutdown().await;

    if let Err(e) = &result {
        error!("Command failed: {:#}", e);
    }
    result
}

async fn execute(persistence: &Arc<SessionPersistenceManager>, mode: ExecutionMode) -> Result<()> {
    match mode {
        ExecutionMode::ListSessions => {
            let sessions = persistence.list_all().await?;
            if sessions.is_empty() {
                println!("No sessions found in {}", persistence.sessions_root().display());
                return Ok(());
            }
            println!("📋 {} session(s) ({} tier):", sessions.len(), persistence.tier());
            for key in sessions {
                println!("  {}", key);
            }
        }
        ExecutionMode::Backup(target) => {
            let report = persistence
                .backup(&target.user_id, &target.phone)
                .await
                .with_context(|| format!("Backup of {} failed", describe(&target)))?;
            println!(
                "✅ Backed up {}: {} file(s), {} bytes",
                report.key, report.files, report.bytes
            );
        }
        ExecutionMode::Restore { target, into } => {
            let key = SessionKey::new(&target.user_id, &target.phone, None)?;
            let target_dir = into.unwrap_or_else(|| persistence.session_dir(&key));
            info!("Restoring {} into {}", key, target_dir.display());
            match persistence
                .restore_into(&key, &target_dir)
                .await
                .with_context(|| format!("Restore of {} failed", key))?
            {
                RestoreOutcome::Restored { files } => println!(
                    "✅ Restored {}: {} file(s) into {}",
                    key,
                    files,
                    target_dir.display()
                ),
                RestoreOutcome::NotFound => println!("No remote backup found for {}", key),
            }
        }
        ExecutionMode::Delete(target) => {
            persistence
                .delete(&target.user_id, &target.phone)
                .await
                .with_context(|| format!("Delete of {} failed", describe(&target)))?;
            println!("🗑️  Deleted {}", describe(&target));
        }
        ExecutionMode::Cleanup { max_age } => {
            let removed = persistence.cleanup(max_age).await?;
            println!("🧹 Removed {} expired session(s)", removed);
        }
        ExecutionMode::ShowConfig | ExecutionMode::InitConfig => {}
    }
    Ok(())
}

fn describe(target: &SessionTarget) -> String {
    format!("{}:{}", target.user_id, target.phone)
}
