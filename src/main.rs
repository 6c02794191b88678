//! npcbot - Entry Point
//!
//! Commands:
//! - run (default): connect every linked account and keep the engines going
//! - accounts OWNER: list an owner's linked accounts
//! - unlink OWNER ACCOUNT: remove an account and its chat assignments

use anyhow::{bail, Context};
use std::sync::Arc;
use teloxide::Bot;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use npcbot::{
    AccountManager, CannedGenerator, Config, ConnectionPool, EngineContext, GatewayConfig,
    GatewayConnector, GroupMembership, HttpGenerator, JsonDirectory, Membership, ResponseGenerator,
    StaticMembership, SystemClock, UnlinkOutcome,
};

fn print_help() {
    println!("npcbot v{}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("Usage: npcbot [OPTIONS] [COMMAND]");
    println!();
    println!("Commands:");
    println!("  run                    Run the connection pool and engines (default)");
    println!("  accounts OWNER         List linked accounts of OWNER");
    println!("  unlink OWNER ACCOUNT   Unlink ACCOUNT and drop its chat assignments");
    println!();
    println!("Options:");
    println!("  --json       Log JSON to stderr");
    println!("  --help, -h   Show this help");
    println!();
    println!("Environment variables:");
    println!("  NPCBOT_DATA_DIR                Directory with user_data.json and chat_groups.json");
    println!("  NPCBOT_GATEWAY_URL             Session gateway base URL (required for run)");
    println!("  NPCBOT_GATEWAY_TOKEN           Session gateway bearer token");
    println!("  NPCBOT_GENERATOR_URL           Response generator endpoint (canned replies if unset)");
    println!("  NPCBOT_GENERATOR_TIMEOUT_SECS  Generator timeout (default: 60)");
    println!("  TELEGRAM_BOT_TOKEN             Bot token for membership checks");
    println!("  NPCBOT_MEMBERSHIP_GROUP_ID     Group whose members are privileged");
    println!("  NPCBOT_PRIVILEGED_OWNERS       Comma separated always-privileged owners");
    println!("  NPCBOT_POLL_INTERVAL_SECS      Directory poll interval (default: 60)");
    println!("  RUST_LOG                       trace, debug, info, warn, error (default: info)");
}

fn parse_id(value: Option<&String>, what: &str) -> anyhow::Result<i64> {
    let value = value.with_context(|| format!("missing {}", what))?;
    value
        .parse()
        .with_context(|| format!("{} is not a numeric id: {}", what, value))
}

fn membership(config: &Config) -> Arc<dyn Membership> {
    match (&config.bot_token, config.membership_group_id) {
        (Some(token), Some(group)) => Arc::new(
            GroupMembership::new(Bot::new(token), group)
                .with_always(config.privileged_owners.iter().copied()),
        ),
        _ => {
            if config.privileged_owners.is_empty() {
                warn!("No membership group configured, every owner gets the standard tier");
            }
            Arc::new(StaticMembership::new(config.privileged_owners.iter().copied()))
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    // Parse args
    let args: Vec<String> = std::env::args().skip(1).collect();
    let json_logs = args.iter().any(|a| a == "--json");
    if args.iter().any(|a| a == "--help" || a == "-h") {
        print_help();
        return Ok(());
    }
    let positional: Vec<&String> = args.iter().filter(|a| !a.starts_with('-')).collect();

    let log_level = std::env::var("RUST_LOG")
        .map(|s| match s.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        })
        .unwrap_or(Level::INFO);

    if json_logs {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(log_level)
            .with_ansi(true)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    let config = Config::from_env()?;
    let directory = Arc::new(JsonDirectory::new(config.user_data_path(), config.chat_groups_path()));
    let membership = membership(&config);
    let manager = AccountManager::new(directory.clone(), directory.clone(), membership.clone());

    match positional.first().map(|s| s.as_str()) {
        None | Some("run") => {}
        Some("accounts") => {
            let owner = parse_id(positional.get(1).copied(), "OWNER")?;
            for account in manager.list_accounts(owner).await? {
                println!("{}\t{}", account.account_id, account.display_name);
            }
            return Ok(());
        }
        Some("unlink") => {
            let owner = parse_id(positional.get(1).copied(), "OWNER")?;
            let account = parse_id(positional.get(2).copied(), "ACCOUNT")?;
            match manager.unlink_account(owner, account).await? {
                UnlinkOutcome::Unlinked => println!("Account {} unlinked", account),
                UnlinkOutcome::NotLinked => println!("Account {} was not linked", account),
            }
            return Ok(());
        }
        Some(other) => bail!("unknown command: {} (see --help)", other),
    }

    info!("npcbot v{}", env!("CARGO_PKG_VERSION"));
    info!("Data directory: {}", config.data_dir.display());

    let gateway_url = config
        .gateway_url
        .as_deref()
        .context("NPCBOT_GATEWAY_URL must be set to run")?;
    let connector = GatewayConnector::new(
        GatewayConfig::new(gateway_url).with_token(config.gateway_token.clone()),
    )?;

    let generator: Arc<dyn ResponseGenerator> = match &config.generator_url {
        Some(url) => {
            info!("Response generator: {}", url);
            Arc::new(HttpGenerator::new(url))
        }
        None => {
            warn!("NPCBOT_GENERATOR_URL not set, using canned replies");
            Arc::new(CannedGenerator)
        }
    };

    let ctx = Arc::new(EngineContext::new(
        generator,
        membership,
        Arc::new(SystemClock),
        config.settings.clone(),
    ));
    let pool = ConnectionPool::new(directory.clone(), directory, Arc::new(connector), ctx);
    let handle = pool.handle();
    let pool_task = tokio::spawn(pool.run());

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    handle.shutdown();
    pool_task.await?;

    Ok(())
}
