use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use mileage_db::MileageError;
use mileage_db::models::coupon::{NewCouponDefinition, UserCouponStatus};
use mileage_db::models::redemption_code::CodePayload;
use mileage_engine::{Engine, EngineConfig};
use mileage_shared::{Clock, PolicyDraft, RewardContext, RewardTrigger};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::io;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LOG_FILTER: &str = "mileage=info,mileage_engine=info,mileage_db=info,sqlx=warn";

#[derive(Parser)]
#[command(name = "mileage")]
#[command(about = "Mileage ledger, redemption codes and reward policies", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending database migrations
    Migrate,
    /// Show an account's balance and totals
    Balance { account_id: i64 },
    /// List an account's transactions, newest first
    History {
        account_id: i64,
        #[arg(long, default_value_t = 20)]
        limit: i64,
        #[arg(long, default_value_t = 0)]
        offset: i64,
    },
    /// Re-walk an account's transaction chain against its balance
    Verify { account_id: i64 },
    /// Pay for a purchase with mileage
    Spend {
        account_id: i64,
        amount: i64,
        /// Order id; a second spend with the same id is rejected
        reference: String,
    },
    /// Issue a single-use code
    Issue {
        #[arg(value_enum)]
        kind: KindArg,
        #[arg(long)]
        amount: Option<i64>,
        #[arg(long)]
        definition_id: Option<i64>,
        /// Account debited when a mileage code is redeemed
        #[arg(long)]
        funded_by: Option<i64>,
        #[arg(long)]
        business_id: Option<i64>,
        #[arg(long)]
        owner: Option<i64>,
        #[arg(long)]
        ttl_secs: Option<i64>,
    },
    /// Show a code without consuming it
    Peek { code: String },
    /// List an owner's codes that are still redeemable
    Codes { owner: i64 },
    /// Redeem a code on behalf of a user
    Redeem { code: String, user_id: i64 },
    /// Fire a reward trigger for a user
    Reward {
        trigger: RewardTrigger,
        user_id: i64,
        /// Review id, order id, ... identifying the rewarded event
        context_id: String,
        #[arg(long)]
        order_amount: Option<i64>,
        #[arg(long)]
        photo: bool,
        #[arg(long)]
        content_length: Option<u32>,
        /// Only compute the decision, credit nothing
        #[arg(long)]
        dry_run: bool,
    },
    /// Record a referral and reward both sides
    Refer { referrer_id: i64, referee_id: i64 },
    /// Show a user's referral tier
    Tier { user_id: i64 },
    /// Reward policy administration
    Policy {
        #[command(subcommand)]
        subcommand: PolicyCommands,
    },
    /// Coupon administration
    Coupon {
        #[command(subcommand)]
        subcommand: CouponCommands,
    },
}

#[derive(Subcommand)]
enum PolicyCommands {
    /// Publish a policy draft (JSON file) as the trigger's active version
    Publish {
        file: PathBuf,
        #[arg(long)]
        by: Option<i64>,
    },
    /// List every version of a trigger's policy
    List { trigger: RewardTrigger },
    /// Turn a policy off
    Deactivate {
        policy_id: i64,
        #[arg(long)]
        by: Option<i64>,
    },
    /// Show the policy change log
    Log { trigger: Option<RewardTrigger> },
}

#[derive(Subcommand)]
enum CouponCommands {
    /// Create a coupon definition from a JSON file
    Create { file: PathBuf },
    /// List coupon definitions, optionally for one business
    Definitions {
        #[arg(long)]
        business_id: Option<i64>,
    },
    /// Stop issuing a definition
    Close { definition_id: i64 },
    /// Give a user one coupon of a definition
    Grant { definition_id: i64, user_id: i64 },
    /// List a user's coupons
    List {
        user_id: i64,
        #[arg(long, value_enum)]
        status: Option<StatusArg>,
    },
    /// Apply a coupon to an order
    Use {
        coupon_id: i64,
        user_id: i64,
        order_amount: i64,
    },
    /// Mark overdue coupons expired
    Expire,
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Coupon,
    Mileage,
    Payment,
}

#[derive(Clone, Copy, ValueEnum)]
enum StatusArg {
    Active,
    Used,
    Expired,
}

impl From<StatusArg> for UserCouponStatus {
    fn from(arg: StatusArg) -> Self {
        match arg {
            StatusArg::Active => UserCouponStatus::Active,
            StatusArg::Used => UserCouponStatus::Used,
            StatusArg::Expired => UserCouponStatus::Expired,
        }
    }
}

fn init_tracing(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let (file_layer, guard) = match log_file {
        Some(path) => {
            let dir = path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or(Path::new("."));
            let name = path.file_name().context("log_file has no file name")?;
            let file_appender = tracing_appender::rolling::never(dir, name);
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            (
                Some(fmt::layer().with_writer(non_blocking).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    // stdout carries the JSON results; logs go to stderr.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()))
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .init();

    Ok(guard)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn read_json<T: DeserializeOwned>(file: &Path) -> Result<T> {
    let contents = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("Invalid JSON in {}", file.display()))
}

/// Prefix the short user-facing text so operators see what a user would.
fn refused(err: MileageError) -> anyhow::Error {
    anyhow::anyhow!("{}: {}", err.user_message(), err)
}

fn code_payload(
    kind: KindArg,
    amount: Option<i64>,
    definition_id: Option<i64>,
    funded_by: Option<i64>,
    business_id: Option<i64>,
) -> Result<CodePayload> {
    Ok(match kind {
        KindArg::Coupon => CodePayload::Coupon {
            definition_id: definition_id.context("--definition-id is required for coupon codes")?,
        },
        KindArg::Mileage => CodePayload::Mileage {
            amount: amount.context("--amount is required for mileage codes")?,
            funded_by,
        },
        KindArg::Payment => CodePayload::Payment {
            amount: amount.context("--amount is required for payment codes")?,
            business_id,
        },
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("Warning: failed to load .env file: {}", e);
        }
    }

    let cli = Cli::parse();
    let config = EngineConfig::load().context("Failed to load configuration")?;
    let _guard = init_tracing(config.log_file.as_deref())?;
    match &config.loaded_from {
        Some(path) => info!("Loaded config from {}", path.display()),
        None => info!("Loaded config from environment"),
    }

    let engine = Engine::connect(&config).await?;
    run(&engine, cli.command).await
}

async fn run(engine: &Engine, command: Commands) -> Result<()> {
    match command {
        Commands::Migrate => {
            mileage_db::db::migrate(&engine.pool).await?;
            print_json(&serde_json::json!({ "migrated": true }))
        }
        Commands::Balance { account_id } => {
            print_json(&engine.ledger.account(account_id).await.map_err(refused)?)
        }
        Commands::History {
            account_id,
            limit,
            offset,
        } => print_json(
            &engine
                .ledger
                .history(account_id, limit, offset)
                .await
                .map_err(refused)?,
        ),
        Commands::Verify { account_id } => {
            let audit = engine.ledger.verify(account_id).await.map_err(refused)?;
            print_json(&audit)?;
            if !audit.is_clean() {
                anyhow::bail!("ledger for account {} does not verify", account_id);
            }
            Ok(())
        }
        Commands::Spend {
            account_id,
            amount,
            reference,
        } => print_json(
            &engine
                .redemption
                .spend(account_id, amount, &reference)
                .await
                .map_err(refused)?,
        ),
        Commands::Issue {
            kind,
            amount,
            definition_id,
            funded_by,
            business_id,
            owner,
            ttl_secs,
        } => {
            let payload = code_payload(kind, amount, definition_id, funded_by, business_id)?;
            let ttl = ttl_secs
                .map(|secs| {
                    chrono::Duration::try_seconds(secs)
                        .with_context(|| format!("--ttl-secs out of range: {}", secs))
                })
                .transpose()?;
            let code = engine
                .registry
                .issue(payload, owner, ttl)
                .await
                .map_err(refused)?;
            print_json(&code)
        }
        Commands::Peek { code } => {
            let code = engine.registry.peek(&code).await.map_err(refused)?;
            let status = code.status(engine.clock.now_millis());
            print_json(&serde_json::json!({ "status": status, "code": code }))
        }
        Commands::Codes { owner } => {
            print_json(&engine.registry.list_open(owner).await.map_err(refused)?)
        }
        Commands::Redeem { code, user_id } => print_json(
            &engine
                .redemption
                .redeem(&code, user_id)
                .await
                .map_err(refused)?,
        ),
        Commands::Reward {
            trigger,
            user_id,
            context_id,
            order_amount,
            photo,
            content_length,
            dry_run,
        } => {
            let mut ctx = RewardContext::new(context_id);
            ctx.order_amount = order_amount;
            ctx.photo_attached = photo;
            ctx.content_length = content_length;
            if dry_run {
                let decision = engine
                    .rewards
                    .preview(trigger, user_id, &ctx)
                    .await
                    .map_err(refused)?;
                return print_json(&decision);
            }
            print_json(
                &engine
                    .redemption
                    .trigger_reward(trigger, user_id, &ctx)
                    .await
                    .map_err(refused)?,
            )
        }
        Commands::Refer {
            referrer_id,
            referee_id,
        } => print_json(
            &engine
                .redemption
                .record_referral(referrer_id, referee_id)
                .await
                .map_err(refused)?,
        ),
        Commands::Tier { user_id } => {
            print_json(&engine.rewards.tier_for_user(user_id).await.map_err(refused)?)
        }
        Commands::Policy { subcommand } => match subcommand {
            PolicyCommands::Publish { file, by } => {
                let draft: PolicyDraft = read_json(&file)?;
                print_json(&engine.policies.publish(&draft, by).await.map_err(refused)?)
            }
            PolicyCommands::List { trigger } => {
                print_json(&engine.policies.versions(trigger).await.map_err(refused)?)
            }
            PolicyCommands::Deactivate { policy_id, by } => print_json(
                &engine
                    .policies
                    .deactivate(policy_id, by)
                    .await
                    .map_err(refused)?,
            ),
            PolicyCommands::Log { trigger } => {
                print_json(&engine.policies.change_log(trigger).await.map_err(refused)?)
            }
        },
        Commands::Coupon { subcommand } => match subcommand {
            CouponCommands::Create { file } => {
                let new: NewCouponDefinition = read_json(&file)?;
                print_json(&engine.coupons.create_definition(&new).await.map_err(refused)?)
            }
            CouponCommands::Definitions { business_id } => print_json(
                &engine
                    .coupons
                    .list_definitions(business_id)
                    .await
                    .map_err(refused)?,
            ),
            CouponCommands::Close { definition_id } => print_json(
                &engine
                    .coupons
                    .set_active(definition_id, false)
                    .await
                    .map_err(refused)?,
            ),
            CouponCommands::Grant {
                definition_id,
                user_id,
            } => print_json(
                &engine
                    .coupons
                    .issue_to_user(definition_id, user_id)
                    .await
                    .map_err(refused)?,
            ),
            CouponCommands::List { user_id, status } => print_json(
                &engine
                    .coupons
                    .list_user_coupons(user_id, status.map(Into::into))
                    .await
                    .map_err(refused)?,
            ),
            CouponCommands::Use {
                coupon_id,
                user_id,
                order_amount,
            } => print_json(
                &engine
                    .coupons
                    .redeem_user_coupon(coupon_id, user_id, order_amount)
                    .await
                    .map_err(refused)?,
            ),
            CouponCommands::Expire => {
                let expired = engine.coupons.expire_user_coupons().await.map_err(refused)?;
                print_json(&serde_json::json!({ "expired": expired }))
            }
        },
    }
}
