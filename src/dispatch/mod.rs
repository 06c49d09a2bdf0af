//! Routing of messenger events to ledger services.
//!
//! The messaging client hands over raw messages; [`InboundEvent::classify`]
//! turns each into one of three event kinds and [`Dispatcher::dispatch`]
//! calls the matching service, returning the reply to send back (if any).

mod replay;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::accrual::AccrualService;
use crate::config::Config;
use crate::ledger::{ensure_user, Ledger, LedgerError, Points, UserId};
use crate::referrals::{record_invite_intent, ReferralService};
use crate::tiers::tier_for;

pub use replay::{replay, ReplaySummary};

/// Texts shorter than this (after trimming) never count as activity.
pub const MIN_SIGNIFICANT_CHARS: usize = 6;

const TOP_LIMIT: usize = 10;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Private,
    Group,
    Supergroup,
    Channel,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chat {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: ChatKind,
}

impl Chat {
    pub fn is_private(&self) -> bool {
        self.kind == ChatKind::Private
    }

    pub fn is_group(&self) -> bool {
        matches!(self.kind, ChatKind::Group | ChatKind::Supergroup)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    pub id: UserId,
    #[serde(default)]
    pub username: Option<String>,
}

/// The subset of a messenger message the ledger cares about.
#[derive(Clone, Debug, Deserialize)]
pub struct IncomingMessage {
    pub chat: Chat,
    #[serde(default)]
    pub from: Option<Sender>,
    #[serde(default)]
    pub date: i64,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub new_chat_members: Vec<Sender>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Start(Option<String>),
    Profile,
    Top,
    AdminStats,
    MyId,
    ChatId,
}

impl Command {
    /// Parses `/name[@bot] [args]`. Unknown names yield `None`.
    pub fn parse(text: &str) -> Option<Command> {
        let body = text.trim().strip_prefix('/')?;
        let (head, args) = match body.split_once(char::is_whitespace) {
            Some((head, rest)) => (head, Some(rest.trim()).filter(|r| !r.is_empty())),
            None => (body, None),
        };
        let name = head.split('@').next().unwrap_or(head);
        match name {
            "start" => Some(Command::Start(args.map(str::to_string))),
            "profile" => Some(Command::Profile),
            "top" => Some(Command::Top),
            "admin_stats" => Some(Command::AdminStats),
            "myid" => Some(Command::MyId),
            "chatid" => Some(Command::ChatId),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InboundEvent {
    MembersJoined {
        chat: Chat,
        members: Vec<Sender>,
    },
    Text {
        chat: Chat,
        from: Sender,
        text: String,
        date: i64,
    },
    Command {
        chat: Chat,
        from: Option<Sender>,
        command: Command,
    },
}

impl InboundEvent {
    /// Joins win over text; texts naming a known command become commands,
    /// everything else with a sender stays plain text.
    pub fn classify(message: IncomingMessage) -> Option<InboundEvent> {
        if !message.new_chat_members.is_empty() {
            return Some(InboundEvent::MembersJoined {
                chat: message.chat,
                members: message.new_chat_members,
            });
        }
        let text = message.text?;
        if let Some(command) = Command::parse(&text) {
            return Some(InboundEvent::Command {
                chat: message.chat,
                from: message.from,
                command,
            });
        }
        Some(InboundEvent::Text {
            chat: message.chat,
            from: message.from?,
            text,
            date: message.date,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Reply {
    pub chat_id: i64,
    pub text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webapp_url: Option<String>,
}

impl Reply {
    fn to(chat: &Chat, text: impl Into<String>) -> Self {
        Self {
            chat_id: chat.id,
            text: text.into(),
            webapp_url: None,
        }
    }
}

pub struct Dispatcher<'a> {
    config: &'a Config,
    ledger: &'a Ledger,
}

impl<'a> Dispatcher<'a> {
    pub fn new(config: &'a Config, ledger: &'a Ledger) -> Self {
        Self { config, ledger }
    }

    pub fn dispatch(&self, event: InboundEvent) -> Result<Option<Reply>, LedgerError> {
        match event {
            InboundEvent::MembersJoined { chat, members } => {
                self.on_members_joined(&chat, &members)?;
                Ok(None)
            }
            InboundEvent::Text {
                chat,
                from,
                text,
                date,
            } => {
                self.on_group_text(&chat, &from, &text, date)?;
                Ok(None)
            }
            InboundEvent::Command {
                chat,
                from,
                command,
            } => self.on_command(&chat, from.as_ref(), command),
        }
    }

    fn in_tracked_group(&self, chat: &Chat) -> bool {
        chat.is_group() && self.config.is_tracked_group(chat.id)
    }

    fn on_members_joined(&self, chat: &Chat, members: &[Sender]) -> Result<(), LedgerError> {
        if !self.in_tracked_group(chat) {
            debug!(chat = chat.id, "join outside tracked group ignored");
            return Ok(());
        }
        let referrals = ReferralService::new(self.ledger);
        for member in members {
            referrals.confirm_on_join(member.id, member.username.as_deref())?;
        }
        Ok(())
    }

    fn on_group_text(
        &self,
        chat: &Chat,
        from: &Sender,
        text: &str,
        date: i64,
    ) -> Result<(), LedgerError> {
        if !self.in_tracked_group(chat) {
            return Ok(());
        }
        if text.trim().chars().count() < MIN_SIGNIFICANT_CHARS {
            return Ok(());
        }
        AccrualService::new(self.ledger, self.config.message_reward).record_message(
            from.id,
            from.username.as_deref(),
            date,
        )?;
        Ok(())
    }

    fn on_command(
        &self,
        chat: &Chat,
        from: Option<&Sender>,
        command: Command,
    ) -> Result<Option<Reply>, LedgerError> {
        match command {
            Command::ChatId => Ok(Some(Reply::to(chat, format!("ID этого чата: {}", chat.id)))),
            Command::MyId => Ok(from.map(|user| Reply::to(chat, format!("Ваш ID: {}", user.id)))),
            _ if !chat.is_private() => Ok(None),
            Command::Start(arg) => match from {
                Some(user) => self.start(chat, user, arg.as_deref()).map(Some),
                None => Ok(None),
            },
            Command::Profile => match from {
                Some(user) => self.profile(chat, user).map(Some),
                None => Ok(None),
            },
            Command::Top => self.top(chat).map(Some),
            Command::AdminStats => match from {
                Some(user) => self.admin_stats(chat, user).map(Some),
                None => Ok(None),
            },
        }
    }

    fn start(&self, chat: &Chat, user: &Sender, arg: Option<&str>) -> Result<Reply, LedgerError> {
        let inviter = arg.and_then(|raw| raw.trim().parse::<UserId>().ok());
        let attributed = self.ledger.unit_of_work(|tx| {
            ensure_user(tx, user.id, user.username.as_deref())?;
            match inviter {
                Some(inviter) => Ok(record_invite_intent(tx, user.id, inviter)?.is_attributed()),
                None => Ok::<_, LedgerError>(false),
            }
        })?;
        let mut text = String::from(
            "Добро пожаловать в Pappy.\n\n\
             Здесь ты получаешь Pappy за активность своих рефералов в группе.\n\
             Открой мини-приложение для баланса, обмена и таблицы лидеров.",
        );
        if attributed {
            text.push_str("\n\nРеферальная привязка подтверждена.");
        }
        let mut reply = Reply::to(chat, text);
        reply.webapp_url = self.config.webapp_url.clone();
        Ok(reply)
    }

    fn profile(&self, chat: &Chat, user: &Sender) -> Result<Reply, LedgerError> {
        let row = self.ledger.ensure_user(user.id, user.username.as_deref())?;
        let tier = tier_for(row.referral_count);
        let mut text = format!(
            "Профиль\n\n\
             Баланс: {} Pappy\n\
             Приглашено: {}\n\
             Уровень: {}\n\
             Сообщений рефералов: {}",
            row.balance_points(),
            row.referral_count,
            tier.name,
            row.referral_message_count,
        );
        if let Some(link) = self.config.referral_deep_link(user.id) {
            text.push_str(&format!("\n\nТвоя ссылка: {link}"));
        }
        Ok(Reply::to(chat, text))
    }

    fn top(&self, chat: &Chat) -> Result<Reply, LedgerError> {
        let users = self.ledger.top_users(TOP_LIMIT)?;
        if users.is_empty() {
            return Ok(Reply::to(chat, "Пока нет участников в таблице лидеров."));
        }
        let mut lines = vec![String::from("Топ по Pappy:\n")];
        for (idx, user) in users.iter().enumerate() {
            lines.push(format!(
                "{}. {} — {} Pappy — {}",
                idx + 1,
                user.display_label(),
                user.balance_points(),
                tier_for(user.referral_count).name,
            ));
        }
        Ok(Reply::to(chat, lines.join("\n")))
    }

    fn admin_stats(&self, chat: &Chat, user: &Sender) -> Result<Reply, LedgerError> {
        if !self.config.is_admin(user.id) {
            return Ok(Reply::to(chat, "Недостаточно прав."));
        }
        let totals = self.ledger.totals()?;
        Ok(Reply::to(
            chat,
            format!(
                "Статистика проекта\n\n\
                 Пользователей: {}\n\
                 Рефералов: {}\n\
                 Обменов: {}\n\
                 Суммарный баланс: {} Pappy",
                totals.users,
                totals.referrals,
                totals.redemptions,
                Points(totals.total_balance),
            ),
        ))
    }
}
