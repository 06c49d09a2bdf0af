//! Signed init-data authentication for web clients.
//!
//! A client presents the query-string shaped payload it received from the
//! messenger. The payload carries a `hash` field: the hex HMAC-SHA256 of the
//! remaining fields in canonical form, keyed by a secret derived from the bot
//! token. No session state is kept; every request is validated on its own.

use std::collections::BTreeMap;

use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use url::form_urlencoded;

use crate::ledger::UserId;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the signed payload on every API request.
pub const INIT_DATA_HEADER: &str = "x-tg-init-data";

const SECRET_KEY_DOMAIN: &[u8] = b"WebAppData";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("no init data supplied")]
    MissingInitData,
    #[error("init data carries no hash")]
    MissingHash,
    #[error("init data signature mismatch")]
    InvalidSignature,
    #[error("init data carries no user")]
    MissingUser,
    #[error("init data user is not valid JSON")]
    MalformedUser,
    #[error("init data user has no id")]
    MissingIdentity,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub id: UserId,
    pub username: Option<String>,
}

fn mac_with_key(key: &[u8]) -> HmacSha256 {
    <HmacSha256 as Mac>::new_from_slice(key).expect("HMAC accepts keys of any length")
}

/// `key=value` lines sorted by key.
fn check_string(fields: &BTreeMap<String, String>) -> String {
    fields
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[derive(Clone)]
pub struct InitDataValidator {
    secret: [u8; 32],
}

impl InitDataValidator {
    pub fn new(bot_token: &str) -> Self {
        let mut mac = mac_with_key(SECRET_KEY_DOMAIN);
        mac.update(bot_token.as_bytes());
        let mut secret = [0u8; 32];
        secret.copy_from_slice(&mac.finalize().into_bytes());
        Self { secret }
    }

    fn digest_hex(&self, fields: &BTreeMap<String, String>) -> String {
        let mut mac = mac_with_key(&self.secret);
        mac.update(check_string(fields).as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Checks the signature and returns the decoded fields without `hash`.
    pub fn verify(&self, init_data: &str) -> Result<BTreeMap<String, String>, AuthError> {
        if init_data.trim().is_empty() {
            return Err(AuthError::MissingInitData);
        }
        let mut fields: BTreeMap<String, String> = form_urlencoded::parse(init_data.as_bytes())
            .into_owned()
            .collect();
        let presented = match fields.remove("hash") {
            Some(hash) if !hash.is_empty() => hash,
            _ => return Err(AuthError::MissingHash),
        };
        let expected = self.digest_hex(&fields);
        if !bool::from(expected.as_bytes().ct_eq(presented.as_bytes())) {
            return Err(AuthError::InvalidSignature);
        }
        Ok(fields)
    }

    pub fn validate(&self, init_data: &str) -> Result<AuthenticatedUser, AuthError> {
        let fields = self.verify(init_data)?;
        let raw = fields.get("user").ok_or(AuthError::MissingUser)?;
        let user: Value = serde_json::from_str(raw).map_err(|_| AuthError::MalformedUser)?;
        let id = user
            .get("id")
            .and_then(Value::as_i64)
            .ok_or(AuthError::MissingIdentity)?;
        let username = user
            .get("username")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(AuthenticatedUser { id, username })
    }

    /// Encodes `fields` as a signed payload the way the messenger does.
    pub fn sign(&self, fields: &[(&str, &str)]) -> String {
        let canonical: BTreeMap<String, String> = fields
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let hash = self.digest_hex(&canonical);
        let mut serializer = form_urlencoded::Serializer::new(String::new());
        for (k, v) in fields {
            serializer.append_pair(k, v);
        }
        serializer.append_pair("hash", &hash);
        serializer.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOKEN: &str = "123456:TEST-TOKEN";
    const USER: &str = r#"{"id":42,"first_name":"Ann","username":"ann"}"#;

    fn validator() -> InitDataValidator {
        InitDataValidator::new(TOKEN)
    }

    #[test]
    fn accepts_a_correctly_signed_payload() {
        let payload = validator().sign(&[("auth_date", "1700000000"), ("query_id", "AAE"), ("user", USER)]);
        let user = validator().validate(&payload).unwrap();
        assert_eq!(user.id, 42);
        assert_eq!(user.username.as_deref(), Some("ann"));
    }

    #[test]
    fn field_order_does_not_matter() {
        let payload = validator().sign(&[("user", USER), ("auth_date", "1700000000")]);
        let mut parts: Vec<&str> = payload.split('&').collect();
        parts.reverse();
        let reordered = parts.join("&");
        assert_ne!(payload, reordered);
        assert_eq!(validator().validate(&reordered).unwrap().id, 42);
    }

    #[test]
    fn tampered_field_is_rejected() {
        let payload = validator().sign(&[("auth_date", "1700000000"), ("user", USER)]);
        let tampered = payload.replace("auth_date=1700000000", "auth_date=1700000001");
        assert_ne!(payload, tampered);
        assert_eq!(
            validator().validate(&tampered),
            Err(AuthError::InvalidSignature)
        );
    }

    #[test]
    fn other_bot_token_is_rejected() {
        let payload = InitDataValidator::new("999:OTHER").sign(&[("user", USER)]);
        assert_eq!(
            validator().validate(&payload),
            Err(AuthError::InvalidSignature)
        );
    }

    #[test]
    fn blank_values_take_part_in_the_signature() {
        let payload = validator().sign(&[("start_param", ""), ("user", USER)]);
        assert!(validator().validate(&payload).is_ok());
        let dropped = payload.replace("start_param=&", "");
        assert_eq!(
            validator().validate(&dropped),
            Err(AuthError::InvalidSignature)
        );
    }

    #[test]
    fn structural_failures() {
        let v = validator();
        assert_eq!(v.validate(""), Err(AuthError::MissingInitData));
        assert_eq!(v.validate("user=%7B%7D"), Err(AuthError::MissingHash));
        assert_eq!(v.validate("user=%7B%7D&hash="), Err(AuthError::MissingHash));
        assert_eq!(
            v.validate(&v.sign(&[("auth_date", "1")])),
            Err(AuthError::MissingUser)
        );
        assert_eq!(
            v.validate(&v.sign(&[("user", "not json")])),
            Err(AuthError::MalformedUser)
        );
        assert_eq!(
            v.validate(&v.sign(&[("user", r#"{"username":"ann"}"#)])),
            Err(AuthError::MissingIdentity)
        );
    }

    #[test]
    fn matches_reference_construction() {
        // secret = HMAC(key = "WebAppData", msg = token); hash = HMAC(secret, check string)
        let mut mac = mac_with_key(b"WebAppData");
        mac.update(TOKEN.as_bytes());
        let secret = mac.finalize().into_bytes();
        let mut mac = mac_with_key(&secret);
        mac.update(format!("auth_date=1\nuser={USER}").as_bytes());
        let expected = hex::encode(mac.finalize().into_bytes());

        let payload = validator().sign(&[("user", USER), ("auth_date", "1")]);
        assert!(payload.ends_with(&format!("hash={expected}")));
    }
}
