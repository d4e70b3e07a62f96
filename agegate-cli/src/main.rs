//! `agegate`: operator tool for the age gate.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use agegate_core::storage::{SqliteCache, SqliteRecordStore, VerificationMethod};
use agegate_core::{
    AgeGate, Clock, Dependencies, GeoLookup, MaxMindGeoLookup, RequestContext, Settings,
    SystemClock, VisitorContext,
};
use clap::{Args, Parser, Subcommand};
use eyre::{eyre, WrapErr};
use tracing_subscriber::EnvFilter;

mod geo_refresh;
mod http;

use geo_refresh::{MaxMindProbe, RefreshPlan};

#[derive(Parser)]
#[command(name = "agegate", version, about = "Age gate operator tool")]
struct Cli {
    /// Settings file (TOML). Defaults apply when omitted.
    #[arg(long, global = true, env = "AGEGATE_CONFIG")]
    config: Option<PathBuf>,

    /// SQLite database holding accounts and age tokens.
    #[arg(long, global = true, env = "AGEGATE_DATABASE", default_value = "agegate.sqlite")]
    database: PathBuf,

    /// SQLite database used as the TTL cache.
    #[arg(long, global = true, env = "AGEGATE_CACHE_DB", default_value = "agegate-cache.sqlite")]
    cache_db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Decide whether a visitor must verify.
    Check(CheckArgs),
    /// Age token maintenance.
    #[command(subcommand)]
    Token(TokenCommand),
    /// Account verification maintenance.
    #[command(subcommand)]
    Account(AccountCommand),
    /// Geo database tools.
    #[command(subcommand)]
    Geo(GeoCommand),
}

#[derive(Args)]
struct CheckArgs {
    /// Visitor IP address.
    #[arg(long)]
    ip: String,
    /// Logged-in account id.
    #[arg(long, default_value_t = 0)]
    account: u64,
    /// Age token cookie value.
    #[arg(long, default_value = "")]
    token: String,
    /// User-Agent header.
    #[arg(long, default_value = "")]
    user_agent: String,
}

#[derive(Subcommand)]
enum TokenCommand {
    /// Issue a new token.
    Create {
        #[arg(long)]
        verified: bool,
    },
    /// Show a token's state.
    Check { token: String },
    /// Mark a token verified.
    Upgrade { token: String },
}

#[derive(Subcommand)]
enum AccountCommand {
    /// Show an account's verification state.
    Status { id: u64 },
    /// Record a verification on an account.
    Verify {
        id: u64,
        /// REDACT-ID, GOCAM or COOKIE.
        #[arg(long)]
        method: String,
        #[arg(long)]
        reference: Option<String>,
    },
    /// Create an unverified account row.
    Register { id: u64 },
}

#[derive(Subcommand)]
enum GeoCommand {
    /// Resolve an IP against the configured database.
    Lookup { ip: std::net::IpAddr },
    /// Download, check and install a fresh database.
    Refresh {
        #[arg(long, env = "AGEGATE_GEO_URL", default_value = geo_refresh::DEFAULT_DATABASE_URL)]
        url: String,
        /// Pinged on success; `<url>/fail` on failure.
        #[arg(long, env = "AGEGATE_HEALTH_CHECK_URL")]
        health_check_url: Option<String>,
        #[arg(long, default_value_t = 300)]
        timeout_secs: u64,
        /// Retries after a timeout, 429 or 5xx.
        #[arg(long, default_value_t = 3)]
        retries: usize,
        /// Allow a plain HTTP mirror.
        #[arg(long)]
        allow_http: bool,
    },
}

/// Settings plus the SQLite-backed gate built from them.
struct Runtime {
    gate: AgeGate,
    store: Arc<SqliteRecordStore>,
    geo: Arc<MaxMindGeoLookup>,
}

impl Runtime {
    fn open(cli: &Cli) -> eyre::Result<Self> {
        let settings = match &cli.config {
            Some(path) => Settings::load(path)?,
            None => Settings::default(),
        };
        let store = Arc::new(
            SqliteRecordStore::open(&cli.database)
                .wrap_err_with(|| format!("opening {}", cli.database.display()))?,
        );
        let cache = Arc::new(
            SqliteCache::open(&cli.cache_db)
                .wrap_err_with(|| format!("opening {}", cli.cache_db.display()))?,
        );
        let geo = Arc::new(MaxMindGeoLookup::new(&settings.geo_database_path));

        let deps = Dependencies::new(cache, store.clone(), geo.clone());
        Ok(Self {
            gate: AgeGate::new(settings, deps)?,
            store,
            geo,
        })
    }
}

#[tokio::main]
async fn main() -> eyre::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match &cli.command {
        Command::Check(args) => check(&Runtime::open(&cli)?, args).await,
        Command::Token(command) => token(&Runtime::open(&cli)?, command).await,
        Command::Account(command) => account(&Runtime::open(&cli)?, command).await,
        Command::Geo(GeoCommand::Lookup { ip }) => {
            let runtime = Runtime::open(&cli)?;
            let record = runtime.geo.locate(*ip).await?;
            println!(
                "country={} subdivision={} name={}",
                record.country_iso.as_deref().unwrap_or("-"),
                record.subdivision_iso.as_deref().unwrap_or("-"),
                record.subdivision_name.as_deref().unwrap_or("-"),
            );
            Ok(())
        }
        Command::Geo(GeoCommand::Refresh {
            url,
            health_check_url,
            timeout_secs,
            retries,
            allow_http,
        }) => {
            let settings = match &cli.config {
                Some(path) => Settings::load(path)?,
                None => Settings::default(),
            };
            let mut plan = RefreshPlan::new(&settings.geo_database_path, url.clone());
            plan.health_check_url.clone_from(health_check_url);
            let http = http::Request::new(Duration::from_secs(*timeout_secs))
                .max_retries(*retries)
                .allow_http(*allow_http);
            let outcome =
                geo_refresh::run(&plan, &http, &MaxMindProbe::default(), SystemClock.now())
                    .await?;
            println!("{outcome:?}");
            Ok(())
        }
    }
}

async fn check(runtime: &Runtime, args: &CheckArgs) -> eyre::Result<()> {
    let visitor = VisitorContext::guest(args.ip.clone())
        .with_account(args.account)
        .with_cookie_token(args.token.clone())
        .with_user_agent(args.user_agent.clone());
    let mut ctx = RequestContext::new(visitor);
    let verify = runtime.gate.should_verify(&mut ctx).await;
    if verify {
        println!("verify (region: {})", runtime.gate.display_region_name(&ctx));
    } else {
        println!("no-verify");
    }
    Ok(())
}

async fn token(runtime: &Runtime, command: &TokenCommand) -> eyre::Result<()> {
    let tokens = runtime.gate.engine().tokens();
    match command {
        TokenCommand::Create { verified } => println!("{}", tokens.create(*verified).await?),
        TokenCommand::Check { token } => println!("{:?}", tokens.check(token).await),
        TokenCommand::Upgrade { token } => println!("{:?}", tokens.upgrade(token).await),
    }
    Ok(())
}

async fn account(runtime: &Runtime, command: &AccountCommand) -> eyre::Result<()> {
    let records = runtime.gate.engine().records();
    match command {
        AccountCommand::Status { id } => println!("{:?}", records.account_status(*id).await),
        AccountCommand::Verify {
            id,
            method,
            reference,
        } => {
            let method = VerificationMethod::from_str(method)
                .map_err(|_| eyre!("unknown method {method:?}, expected REDACT-ID, GOCAM or COOKIE"))?;
            if !records
                .set_account_verified(*id, method, reference.as_deref())
                .await
            {
                return Err(eyre!("recording the verification failed, see log"));
            }
            println!("account {id} verified via {method}");
        }
        AccountCommand::Register { id } => {
            runtime.store.register_account(*id)?;
            println!("account {id} registered");
        }
    }
    Ok(())
}
