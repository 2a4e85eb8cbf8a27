use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use gatekeeper::config::GatekeeperConfig;
use gatekeeper::ratelimit::{RateLimiter, RequestContext, RulesConfig, Tier};

#[derive(Parser)]
#[command(name = "gatekeeper")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate a rule file
    Validate {
        #[arg(short, long)]
        rules: PathBuf,
    },

    /// Run a burst of requests through the engine and log each decision
    Simulate {
        /// Service configuration file
        #[arg(short, long)]
        config: PathBuf,

        /// Rule file, overriding `rules_path` from the configuration
        #[arg(short, long)]
        rules: Option<PathBuf>,

        #[arg(short, long)]
        endpoint: String,

        #[arg(long)]
        client_id: Option<String>,

        #[arg(short, long, default_value = "127.0.0.1")]
        origin: String,

        #[arg(short, long, default_value = "anonymous")]
        tier: Tier,

        /// Number of requests to send
        #[arg(short = 'n', long, default_value = "1")]
        count: u32,

        /// Cost of each request
        #[arg(long, default_value = "1")]
        cost: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    match cli.command {
        Commands::Validate { rules } => validate(rules),
        Commands::Simulate {
            config,
            rules,
            endpoint,
            client_id,
            origin,
            tier,
            count,
            cost,
        } => {
            let ctx = match client_id {
                Some(id) => RequestContext::authenticated(id, tier, origin, endpoint),
                None => RequestContext::anonymous(origin, endpoint),
            }
            .with_cost(cost);
            simulate(config, rules, ctx, count).await
        }
    }
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gatekeeper=info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_target(false))
            .init();
    }
}

fn validate(path: PathBuf) -> anyhow::Result<()> {
    let rules = RulesConfig::from_file(&path)
        .and_then(|config| config.build_rules())
        .with_context(|| format!("invalid rule file {}", path.display()))?;

    for rule in &rules {
        info!(
            rule = %rule.id,
            rate = rule.rate,
            interval = %rule.interval,
            algorithm = ?rule.algorithm,
            "Rule"
        );
    }
    info!(rules = rules.len(), path = %path.display(), "Rule file is valid");
    Ok(())
}

async fn simulate(
    config_path: PathBuf,
    rules_path: Option<PathBuf>,
    ctx: RequestContext,
    count: u32,
) -> anyhow::Result<()> {
    let mut config = GatekeeperConfig::from_file(&config_path.to_string_lossy())
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    if rules_path.is_some() {
        config.rules_path = rules_path;
    }

    let limiter = RateLimiter::from_config(&config)?;

    for n in 1..=count {
        let decision = limiter.check(&ctx).await;
        info!(
            n,
            allowed = decision.allowed,
            remaining = decision.remaining,
            reset_after_seconds = decision.reset_after_seconds(),
            limiting_rule = decision.limiting_rule_id.as_deref().unwrap_or("-"),
            reason = ?decision.reason,
            "Decision"
        );
    }

    let stats = limiter.stats();
    info!(
        requests = stats.requests_total,
        throttled = stats.throttled_total,
        fallback = stats.fallback_total,
        contended = stats.contended_total,
        "Simulation finished"
    );
    Ok(())
}
