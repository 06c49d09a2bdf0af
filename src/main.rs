use std::{
    fs::File,
    io::{self, BufRead, BufReader},
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use pappy::{
    auth::InitDataValidator,
    config::{Config, ConfigArgs},
    dispatch::{replay, Dispatcher},
    ledger::{unix_now, Ledger, Points, UserId},
    logging::init_logging,
    tiers::tier_for,
};

//==================== Аргументы ====================//

#[derive(Parser)]
#[command(name = "pappy", version, about = "Pappy referral ledger tools")]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the database file and schema.
    InitDb,
    /// Feed messenger updates (one JSON message per line, `-` for stdin)
    /// through the dispatcher and print the replies.
    Replay { input: PathBuf },
    /// Project totals.
    Stats,
    /// Leaderboard by balance.
    Top {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// One user's ledger record and redemptions.
    User { id: UserId },
    /// Produce a signed init-data payload for local testing of the web API.
    SignInitData {
        #[arg(long, allow_negative_numbers = true)]
        user_id: UserId,
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        auth_date: Option<i64>,
    },
}

//==================== Команды ====================//

fn init_db_cmd(config: &Config) -> Result<()> {
    Ledger::open(&config.db_path)
        .with_context(|| format!("open {}", config.db_path.display()))?;
    println!("schema ready → {}", config.db_path.display());
    Ok(())
}

fn replay_cmd(config: &Config, ledger: &Ledger, input: &Path) -> Result<()> {
    let reader: Box<dyn BufRead> = if input.as_os_str() == "-" {
        Box::new(BufReader::new(io::stdin()))
    } else {
        let file = File::open(input).with_context(|| format!("open {}", input.display()))?;
        Box::new(BufReader::new(file))
    };
    let dispatcher = Dispatcher::new(config, ledger);
    // ошибки отдельных апдейтов пропускаются, прерывает только I/O
    let summary = replay(&dispatcher, reader, io::stdout().lock()).context("replay updates")?;
    info!(
        handled = summary.handled,
        skipped = summary.skipped,
        "replay finished"
    );
    Ok(())
}

fn stats_cmd(ledger: &Ledger) -> Result<()> {
    let totals = ledger.totals()?;
    println!("users:         {}", totals.users);
    println!("referrals:     {}", totals.referrals);
    println!("exchanges:     {}", totals.redemptions);
    println!("total balance: {} Pappy", Points(totals.total_balance));
    Ok(())
}

fn top_cmd(ledger: &Ledger, limit: usize) -> Result<()> {
    let users = ledger.top_users(limit)?;
    if users.is_empty() {
        println!("leaderboard is empty");
        return Ok(());
    }
    for (idx, user) in users.iter().enumerate() {
        println!(
            "{:>3}. {:<24} {:>10} Pappy  {}",
            idx + 1,
            user.display_label(),
            user.balance_points().to_string(),
            tier_for(user.referral_count).name
        );
    }
    Ok(())
}

fn user_cmd(ledger: &Ledger, id: UserId) -> Result<()> {
    let Some(user) = ledger.read_user(id)? else {
        anyhow::bail!("user {id} not found");
    };
    let tier = tier_for(user.referral_count);
    println!("{}", user.display_label());
    println!("  balance:           {} Pappy", user.balance_points());
    println!("  invited:           {}", user.referral_count);
    println!("  referral messages: {}", user.referral_message_count);
    match tier.next_threshold {
        Some(next) => println!("  tier:              {} ({}% to {next})", tier.name, tier.progress_percent),
        None => println!("  tier:              {}", tier.name),
    }
    if let Some(inviter) = user.inviter {
        println!("  invited by:        {inviter}");
    }
    for r in ledger.redemptions_for(id)? {
        println!(
            "  redemption #{}: {} Pappy → {} (at {})",
            r.id,
            Points(r.amount),
            r.destination,
            r.created_at
        );
    }
    Ok(())
}

fn sign_init_data_cmd(
    config: &Config,
    user_id: UserId,
    username: Option<&str>,
    auth_date: Option<i64>,
) -> Result<()> {
    let mut user = serde_json::json!({ "id": user_id });
    if let Some(username) = username {
        user["username"] = serde_json::Value::from(username);
    }
    let user = serde_json::to_string(&user)?;
    let auth_date = auth_date.unwrap_or_else(unix_now).to_string();
    let payload = InitDataValidator::new(&config.bot_token)
        .sign(&[("auth_date", auth_date.as_str()), ("user", user.as_str())]);
    println!("{payload}");
    Ok(())
}

//==================== main ====================//

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();
    let config = Config::from_args(cli.config)?;

    match cli.command {
        Command::InitDb => init_db_cmd(&config),
        Command::SignInitData {
            user_id,
            username,
            auth_date,
        } => sign_init_data_cmd(&config, user_id, username.as_deref(), auth_date),
        command => {
            let ledger = Ledger::open(&config.db_path)
                .with_context(|| format!("open {}", config.db_path.display()))?;
            match command {
                Command::Replay { input } => replay_cmd(&config, &ledger, &input),
                Command::Stats => stats_cmd(&ledger),
                Command::Top { limit } => top_cmd(&ledger, limit),
                Command::User { id } => user_cmd(&ledger, id),
                Command::InitDb | Command::SignInitData { .. } => Ok(()),
            }
        }
    }
}
