use std::{collections::BTreeSet, fmt, path::PathBuf};

use clap::Args;

use crate::accrual::MESSAGE_REWARD;
use crate::ledger::{Amount, UserId};

/// Process configuration, read from flags or the matching environment
/// variables.
#[derive(Clone, Debug, Args)]
pub struct ConfigArgs {
    /// Bot credential; also keys the web app signature check.
    #[arg(long, env = "BOT_TOKEN", hide_env_values = true)]
    pub bot_token: String,

    /// Comma separated ids allowed to read admin statistics.
    #[arg(long, env = "ADMIN_IDS", default_value = "")]
    pub admin_ids: String,

    /// Id of the tracked group.
    #[arg(long, env = "GROUP_ID", allow_negative_numbers = true)]
    pub group_id: Option<i64>,

    #[arg(long, env = "DB_PATH", default_value = "./pappy.sqlite3")]
    pub db_path: PathBuf,

    #[arg(long, env = "WEBAPP_URL")]
    pub webapp_url: Option<String>,

    /// Bot username used to build `?start=` deep links.
    #[arg(long, env = "BOT_USERNAME")]
    pub bot_username: Option<String>,

    /// Credit per counted referral message, in hundredths of a point.
    #[arg(long, env = "MESSAGE_REWARD", default_value_t = MESSAGE_REWARD)]
    pub message_reward: Amount,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("BOT_TOKEN is not set")]
    MissingBotToken,
}

/// Immutable configuration shared by every service for the process lifetime.
#[derive(Clone)]
pub struct Config {
    pub bot_token: String,
    pub admin_ids: BTreeSet<UserId>,
    pub group_id: Option<i64>,
    pub db_path: PathBuf,
    pub webapp_url: Option<String>,
    pub bot_username: Option<String>,
    pub message_reward: Amount,
}

impl Config {
    pub fn from_args(args: ConfigArgs) -> Result<Self, ConfigError> {
        let bot_token = args.bot_token.trim().to_string();
        if bot_token.is_empty() {
            return Err(ConfigError::MissingBotToken);
        }
        Ok(Self {
            bot_token,
            admin_ids: parse_admin_ids(&args.admin_ids),
            group_id: args.group_id,
            db_path: args.db_path,
            webapp_url: non_blank(args.webapp_url),
            bot_username: non_blank(args.bot_username).map(|u| u.trim_start_matches('@').to_string()),
            message_reward: args.message_reward,
        })
    }

    pub fn is_admin(&self, user: UserId) -> bool {
        self.admin_ids.contains(&user)
    }

    pub fn is_tracked_group(&self, chat: i64) -> bool {
        self.group_id == Some(chat)
    }

    /// Deep link that opens the bot with the user's id as referral argument.
    pub fn referral_deep_link(&self, user: UserId) -> Option<String> {
        self.bot_username
            .as_ref()
            .map(|bot| format!("https://t.me/{bot}?start={user}"))
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("bot_token", &"<redacted>")
            .field("admin_ids", &self.admin_ids)
            .field("group_id", &self.group_id)
            .field("db_path", &self.db_path)
            .field("webapp_url", &self.webapp_url)
            .field("bot_username", &self.bot_username)
            .field("message_reward", &self.message_reward)
            .finish()
    }
}

/// Parses a comma separated id list, skipping blanks and entries that are not
/// integers.
pub fn parse_admin_ids(raw: &str) -> BTreeSet<UserId> {
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .filter_map(|part| part.parse().ok())
        .collect()
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
pub(crate) fn test_config() -> Config {
    Config {
        bot_token: "123456:TEST-TOKEN".into(),
        admin_ids: [900].into_iter().collect(),
        group_id: Some(-100_500),
        db_path: PathBuf::from(":memory:"),
        webapp_url: Some("https://pappy.example/app".into()),
        bot_username: Some("pappy_bot".into()),
        message_reward: MESSAGE_REWARD,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Cli {
        #[command(flatten)]
        config: ConfigArgs,
    }

    #[test]
    fn admin_ids_skip_garbage() {
        let ids = parse_admin_ids(" 1, 2,,abc, -3 ,");
        assert_eq!(ids.into_iter().collect::<Vec<_>>(), vec![-3, 1, 2]);
        assert!(parse_admin_ids("").is_empty());
    }

    #[test]
    fn flags_build_a_config() {
        let cli = Cli::try_parse_from([
            "pappy",
            "--bot-token",
            "1:abc",
            "--admin-ids",
            "5,6",
            "--group-id",
            "-1001",
            "--bot-username",
            "@pappy_bot",
            "--webapp-url",
            "  ",
        ])
        .unwrap();
        let config = Config::from_args(cli.config).unwrap();
        assert!(config.is_admin(6));
        assert!(config.is_tracked_group(-1001));
        assert_eq!(config.message_reward, MESSAGE_REWARD);
        assert_eq!(config.webapp_url, None);
        assert_eq!(
            config.referral_deep_link(7).as_deref(),
            Some("https://t.me/pappy_bot?start=7")
        );
        assert!(!format!("{config:?}").contains("1:abc"));
    }

    #[test]
    fn blank_token_is_rejected() {
        let cli = Cli::try_parse_from(["pappy", "--bot-token", "  "]).unwrap();
        assert!(matches!(
            Config::from_args(cli.config),
            Err(ConfigError::MissingBotToken)
        ));
    }
}
