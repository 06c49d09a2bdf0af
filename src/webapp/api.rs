//! Request handlers behind the mini app. They are plain blocking functions
//! over [`AppState`]; the router in the parent module only moves them onto
//! the blocking pool and shapes the HTTP response.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, warn};

use crate::auth::{AuthError, AuthenticatedUser, InitDataValidator};
use crate::config::Config;
use crate::exchange::{denomination, exchange, ExchangeError};
use crate::gateway::{notify_admins, Messenger};
use crate::invites::InviteIssuer;
use crate::ledger::{unix_now, Ledger, LedgerError, Points, UserId};
use crate::tiers::{tier_for, Tier};

const LEADERBOARD_LIMIT: usize = 20;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub ledger: Ledger,
    pub validator: InitDataValidator,
    pub messenger: Arc<dyn Messenger>,
}

impl AppState {
    pub fn new(config: Arc<Config>, ledger: Ledger, messenger: Arc<dyn Messenger>) -> Self {
        let validator = InitDataValidator::new(&config.bot_token);
        Self {
            config,
            ledger,
            validator,
            messenger,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Unauthorized(#[from] AuthError),
    #[error("{0}")]
    BadRequest(String),
    #[error("Пользователь не найден.")]
    NotFound,
    #[error("Внутренняя ошибка, попробуйте позже.")]
    Internal,
}

impl ApiError {
    pub fn status(&self) -> u16 {
        match self {
            ApiError::Unauthorized(_) => 401,
            ApiError::BadRequest(_) => 400,
            ApiError::NotFound => 404,
            ApiError::Internal => 500,
        }
    }
}

impl From<LedgerError> for ApiError {
    fn from(err: LedgerError) -> Self {
        error!(error = %err, "ledger failure while serving request");
        ApiError::Internal
    }
}

impl From<ExchangeError> for ApiError {
    fn from(err: ExchangeError) -> Self {
        match err {
            ExchangeError::InvalidAmount(_) => {
                ApiError::BadRequest("Некорректная сумма обмена.".into())
            }
            ExchangeError::EmptyDestination => ApiError::BadRequest("Введите SteamLink.".into()),
            ExchangeError::InsufficientFunds { .. } => {
                ApiError::BadRequest("Недостаточно Pappy для обмена.".into())
            }
            ExchangeError::UnknownUser { .. } => ApiError::NotFound,
            ExchangeError::Ledger(err) => err.into(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MeResponse {
    pub id: UserId,
    pub username: Option<String>,
    pub balance: Points,
    pub total_referrals: u32,
    pub total_referral_messages: u64,
    pub level: Tier,
    pub referral_link: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LeaderboardEntry {
    pub id: UserId,
    pub name: String,
    pub balance: Points,
    pub level: &'static str,
}

#[derive(Debug, Serialize)]
pub struct LeaderboardResponse {
    pub items: Vec<LeaderboardEntry>,
}

#[derive(Debug, Deserialize)]
pub struct ExchangeRequest {
    pub amount: f64,
    #[serde(alias = "destination")]
    pub steam_link: String,
}

#[derive(Debug, Serialize)]
pub struct ExchangeResponse {
    pub ok: bool,
}

fn authenticate(state: &AppState, init_data: Option<&str>) -> Result<AuthenticatedUser, ApiError> {
    state
        .validator
        .validate(init_data.unwrap_or_default())
        .map_err(|err| {
            warn!(error = %err, "init data rejected");
            ApiError::Unauthorized(err)
        })
}

/// `GET /api/me`. Registers the caller on first sight and, when a group is
/// tracked, hands out their personal invite link.
pub fn me(state: &AppState, init_data: Option<&str>) -> Result<MeResponse, ApiError> {
    let caller = authenticate(state, init_data)?;
    let user = state
        .ledger
        .ensure_user(caller.id, caller.username.as_deref())?;
    let referral_link = match state.config.group_id {
        Some(_) => InviteIssuer::new(&state.ledger, state.messenger.as_ref())
            .get_or_create_invite(caller.id)?
            .into_handle(),
        None => None,
    };
    Ok(MeResponse {
        id: user.id,
        username: caller.username,
        balance: user.balance_points(),
        total_referrals: user.referral_count,
        total_referral_messages: user.referral_message_count,
        level: tier_for(user.referral_count),
        referral_link,
    })
}

/// `GET /api/leaderboard`.
pub fn leaderboard(
    state: &AppState,
    init_data: Option<&str>,
) -> Result<LeaderboardResponse, ApiError> {
    authenticate(state, init_data)?;
    let items = state
        .ledger
        .top_users(LEADERBOARD_LIMIT)?
        .into_iter()
        .map(|user| LeaderboardEntry {
            id: user.id,
            name: user.display_label(),
            balance: user.balance_points(),
            level: tier_for(user.referral_count).name,
        })
        .collect();
    Ok(LeaderboardResponse { items })
}

/// `POST /api/exchange`. Admins hear about the redemption after it commits;
/// delivery failures do not affect the response.
pub fn exchange_points(
    state: &AppState,
    init_data: Option<&str>,
    request: ExchangeRequest,
) -> Result<ExchangeResponse, ApiError> {
    let caller = authenticate(state, init_data)?;
    let amount = denomination(request.amount)?;
    let destination = request.steam_link.trim();
    if destination.is_empty() {
        return Err(ExchangeError::EmptyDestination.into());
    }
    // first contact sticks even when the exchange below is rejected
    state
        .ledger
        .ensure_user(caller.id, caller.username.as_deref())?;
    let now = unix_now();
    let redemption = state
        .ledger
        .unit_of_work(|tx| exchange(tx, caller.id, amount, destination, now))?;

    if !state.config.admin_ids.is_empty() {
        let who = match &caller.username {
            Some(handle) => format!("@{handle}"),
            None => "без ника".to_string(),
        };
        let text = format!(
            "Пользователь {who} (айди: {}) обменял {} Pappy.\nSteamLink: {}",
            caller.id,
            Points(redemption.amount),
            redemption.destination,
        );
        notify_admins(state.messenger.as_ref(), &state.config.admin_ids, &text);
    }
    Ok(ExchangeResponse { ok: true })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_config;
    use crate::gateway::{AdminNotifier, GatewayError, GroupGateway};
    use rusqlite::params;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeMessenger {
        invites: Mutex<u32>,
        sent: Mutex<Vec<(UserId, String)>>,
        offline: bool,
    }

    impl GroupGateway for FakeMessenger {
        fn create_invite(&self, name: &str) -> Result<String, GatewayError> {
            if self.offline {
                return Err(GatewayError::Transport("offline".into()));
            }
            *self.invites.lock().unwrap() += 1;
            Ok(format!("https://t.me/+{name}"))
        }
    }

    impl AdminNotifier for FakeMessenger {
        fn notify(&self, chat: UserId, text: &str) -> Result<(), GatewayError> {
            if self.offline {
                return Err(GatewayError::Transport("offline".into()));
            }
            self.sent.lock().unwrap().push((chat, text.to_string()));
            Ok(())
        }
    }

    fn state_with(messenger: Arc<FakeMessenger>) -> AppState {
        AppState::new(
            Arc::new(test_config()),
            Ledger::open_in_memory().unwrap(),
            messenger,
        )
    }

    fn init_data(state: &AppState, id: UserId, username: &str) -> String {
        let user = format!(r#"{{"id":{id},"username":"{username}"}}"#);
        state
            .validator
            .sign(&[("auth_date", "1700000000"), ("user", &user)])
    }

    fn set_balance(ledger: &Ledger, user: UserId, balance: u64) {
        ledger.ensure_user(user, None).unwrap();
        ledger
            .unit_of_work(|tx| {
                tx.execute(
                    "UPDATE users SET balance = ?2 WHERE id = ?1",
                    params![user, balance as i64],
                )?;
                Ok::<_, LedgerError>(())
            })
            .unwrap();
    }

    #[test]
    fn me_registers_caller_and_issues_link_once() {
        let messenger = Arc::new(FakeMessenger::default());
        let state = state_with(messenger.clone());
        let data = init_data(&state, 7, "ann");

        let first = me(&state, Some(&data)).unwrap();
        assert_eq!(first.referral_link.as_deref(), Some("https://t.me/+ref-7"));
        assert_eq!(first.balance, Points(0));
        assert_eq!(first.level.name, "🟢 Новичок");
        let second = me(&state, Some(&data)).unwrap();
        assert_eq!(second.referral_link, first.referral_link);
        assert_eq!(*messenger.invites.lock().unwrap(), 1);

        let json = serde_json::to_value(&first).unwrap();
        assert_eq!(json["level"]["next_threshold"], 10);
        assert_eq!(json["balance"], 0.0);
    }

    #[test]
    fn me_without_tracked_group_has_no_link() {
        let messenger = Arc::new(FakeMessenger::default());
        let mut config = test_config();
        config.group_id = None;
        let state = AppState::new(
            Arc::new(config),
            Ledger::open_in_memory().unwrap(),
            messenger.clone(),
        );
        let data = init_data(&state, 7, "ann");
        assert_eq!(me(&state, Some(&data)).unwrap().referral_link, None);
        assert_eq!(*messenger.invites.lock().unwrap(), 0);
    }

    #[test]
    fn gateway_outage_still_serves_profile() {
        let state = state_with(Arc::new(FakeMessenger {
            offline: true,
            ..Default::default()
        }));
        let data = init_data(&state, 7, "ann");
        assert_eq!(me(&state, Some(&data)).unwrap().referral_link, None);
    }

    #[test]
    fn bad_signature_never_touches_the_ledger() {
        let state = state_with(Arc::new(FakeMessenger::default()));
        let forged = init_data(&state, 7, "ann").replace("ann", "bob");
        let err = me(&state, Some(&forged)).unwrap_err();
        assert_eq!(err.status(), 401);
        assert_eq!(me(&state, None).unwrap_err().status(), 401);
        assert!(state.ledger.read_user(7).unwrap().is_none());
    }

    #[test]
    fn leaderboard_labels_users() {
        let state = state_with(Arc::new(FakeMessenger::default()));
        state.ledger.ensure_user(1, Some("ann")).unwrap();
        set_balance(&state.ledger, 2, 300);
        let data = init_data(&state, 1, "ann");
        let board = leaderboard(&state, Some(&data)).unwrap();
        let names: Vec<&str> = board.items.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["Пользователь 2", "@ann"]);
        assert_eq!(board.items[0].balance, Points(300));
    }

    #[test]
    fn exchange_rejections_are_bad_requests() {
        let state = state_with(Arc::new(FakeMessenger::default()));
        set_balance(&state.ledger, 5, 1_500);
        let data = init_data(&state, 5, "eve");
        let request = |amount: f64, link: &str| ExchangeRequest {
            amount,
            steam_link: link.to_string(),
        };

        for (amount, link) in [(15.0, "link"), (20.0, "   "), (20.0, "link")] {
            let err = exchange_points(&state, Some(&data), request(amount, link)).unwrap_err();
            assert_eq!(err.status(), 400);
        }
        assert_eq!(state.ledger.read_user(5).unwrap().unwrap().balance, 1_500);
        assert!(state.ledger.redemptions_for(5).unwrap().is_empty());
    }

    #[test]
    fn rejected_exchange_still_registers_new_caller() {
        let state = state_with(Arc::new(FakeMessenger::default()));
        let data = init_data(&state, 77, "newbie");
        let body = ExchangeRequest {
            amount: 10.0,
            steam_link: "link".into(),
        };
        let err = exchange_points(&state, Some(&data), body).unwrap_err();
        assert_eq!(err.status(), 400);
        let user = state.ledger.read_user(77).unwrap().unwrap();
        assert_eq!(user.balance, 0);
        assert_eq!(user.handle.as_deref(), Some("newbie"));
        assert!(state.ledger.redemptions_for(77).unwrap().is_empty());
    }

    #[test]
    fn exchange_debits_and_notifies_admins() {
        let messenger = Arc::new(FakeMessenger::default());
        let state = state_with(messenger.clone());
        set_balance(&state.ledger, 5, 2_000);
        let data = init_data(&state, 5, "eve");
        let body: ExchangeRequest =
            serde_json::from_str(r#"{"amount": 20, "steam_link": " https://steam/t/5 "}"#)
                .unwrap();

        assert!(exchange_points(&state, Some(&data), body).unwrap().ok);
        assert_eq!(state.ledger.read_user(5).unwrap().unwrap().balance, 0);
        let sent = messenger.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, 900);
        assert!(sent[0].1.contains("@eve (айди: 5) обменял 20.00 Pappy"));
        assert!(sent[0].1.ends_with("SteamLink: https://steam/t/5"));
    }

    #[test]
    fn failed_notification_keeps_the_redemption() {
        let state = state_with(Arc::new(FakeMessenger {
            offline: true,
            ..Default::default()
        }));
        set_balance(&state.ledger, 5, 1_000);
        let data = init_data(&state, 5, "eve");
        let body = ExchangeRequest {
            amount: 10.0,
            steam_link: "link".into(),
        };
        assert!(exchange_points(&state, Some(&data), body).unwrap().ok);
        assert_eq!(state.ledger.redemptions_for(5).unwrap().len(), 1);
    }
}
