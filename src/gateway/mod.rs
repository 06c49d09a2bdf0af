//! Outbound calls to the messenger's Bot API.
//!
//! The ledger only needs two things from the messenger: a fresh invite link
//! for the tracked group and a way to ping administrators. Both are traits so
//! the services can run against fakes; [`BotApiGateway`] is the real client.

use std::{collections::BTreeSet, fmt, time::Duration};

use serde_json::{json, Value};
use tracing::warn;

use crate::ledger::UserId;

const BOT_API_BASE: &str = "https://api.telegram.org";
const CALL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("no tracked group configured")]
    NoGroup,
    #[error("bot api transport failure: {0}")]
    Transport(String),
    #[error("bot api rejected {method}: {description}")]
    Rejected { method: String, description: String },
    #[error("bot api returned an unexpected payload for {0}")]
    UnexpectedPayload(String),
}

pub trait GroupGateway {
    /// Creates a new invite link for the tracked group, labelled `name`.
    fn create_invite(&self, name: &str) -> Result<String, GatewayError>;
}

pub trait AdminNotifier {
    fn notify(&self, chat: UserId, text: &str) -> Result<(), GatewayError>;
}

/// Both outbound capabilities, shareable across request handlers.
pub trait Messenger: GroupGateway + AdminNotifier + Send + Sync {}

impl<T: GroupGateway + AdminNotifier + Send + Sync> Messenger for T {}

/// Result of a best-effort side effect. A degraded side effect is reported,
/// never turned into a failure of the operation that triggered it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SideEffect<T> {
    Done(T),
    Degraded { reason: String },
}

impl<T> SideEffect<T> {
    pub fn from_result<E: fmt::Display>(result: Result<T, E>) -> Self {
        match result {
            Ok(value) => SideEffect::Done(value),
            Err(err) => SideEffect::Degraded {
                reason: err.to_string(),
            },
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, SideEffect::Degraded { .. })
    }

    pub fn done(self) -> Option<T> {
        match self {
            SideEffect::Done(value) => Some(value),
            SideEffect::Degraded { .. } => None,
        }
    }
}

/// Sends `text` to every administrator. Each delivery is independent; failed
/// ones are logged and reported as degraded.
pub fn notify_admins<N: AdminNotifier + ?Sized>(
    notifier: &N,
    admins: &BTreeSet<UserId>,
    text: &str,
) -> Vec<(UserId, SideEffect<()>)> {
    admins
        .iter()
        .map(|admin| {
            let outcome = SideEffect::from_result(notifier.notify(*admin, text));
            if let SideEffect::Degraded { reason } = &outcome {
                warn!(admin, %reason, "admin notification failed");
            }
            (*admin, outcome)
        })
        .collect()
}

/// Blocking Bot API client.
pub struct BotApiGateway {
    agent: ureq::Agent,
    base: String,
    group_id: Option<i64>,
}

impl BotApiGateway {
    pub fn new(bot_token: &str, group_id: Option<i64>) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(CALL_TIMEOUT)
            .timeout_read(CALL_TIMEOUT)
            .timeout_write(CALL_TIMEOUT)
            .build();
        Self {
            agent,
            base: format!("{BOT_API_BASE}/bot{bot_token}"),
            group_id,
        }
    }

    fn call(&self, method: &str, payload: Value) -> Result<Value, GatewayError> {
        let response = self
            .agent
            .post(&format!("{}/{method}", self.base))
            .send_json(payload);
        let body: Value = match response {
            Ok(response) => response
                .into_json()
                .map_err(|_| GatewayError::UnexpectedPayload(method.to_string()))?,
            // The Bot API reports failures with a 4xx status and a JSON body.
            Err(ureq::Error::Status(_, response)) => response
                .into_json()
                .map_err(|_| GatewayError::UnexpectedPayload(method.to_string()))?,
            Err(ureq::Error::Transport(transport)) => {
                return Err(GatewayError::Transport(transport.to_string()))
            }
        };
        unwrap_envelope(method, body)
    }
}

/// Extracts `result` from a `{ ok, result | description }` envelope.
fn unwrap_envelope(method: &str, body: Value) -> Result<Value, GatewayError> {
    if body.get("ok").and_then(Value::as_bool) == Some(true) {
        return body
            .get("result")
            .cloned()
            .ok_or_else(|| GatewayError::UnexpectedPayload(method.to_string()));
    }
    let description = body
        .get("description")
        .and_then(Value::as_str)
        .unwrap_or("no description")
        .to_string();
    Err(GatewayError::Rejected {
        method: method.to_string(),
        description,
    })
}

impl GroupGateway for BotApiGateway {
    fn create_invite(&self, name: &str) -> Result<String, GatewayError> {
        let group_id = self.group_id.ok_or(GatewayError::NoGroup)?;
        let result = self.call(
            "createChatInviteLink",
            json!({ "chat_id": group_id, "name": name }),
        )?;
        result
            .get("invite_link")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| GatewayError::UnexpectedPayload("createChatInviteLink".into()))
    }
}

impl AdminNotifier for BotApiGateway {
    fn notify(&self, chat: UserId, text: &str) -> Result<(), GatewayError> {
        self.call("sendMessage", json!({ "chat_id": chat, "text": text }))
            .map(|_| ())
    }
}
