//! Pappy referral ledger: attribution of invited members, throttled rewards
//! for their activity, point exchange and the signed web app API on top.

pub mod accrual;
pub mod auth;
pub mod config;
pub mod dispatch;
pub mod exchange;
pub mod gateway;
pub mod invites;
pub mod ledger;
pub mod logging;
pub mod referrals;
pub mod tiers;
pub mod webapp;
