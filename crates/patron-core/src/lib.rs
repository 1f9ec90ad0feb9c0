//! Core domain model for the sponsor sync service.

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "patron-core";

/// Nested user identity attached to a raw upstream sponsor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SponsorUser {
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub avatar: String,
}

/// One sponsor exactly as the upstream listing returns it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawSponsor {
    #[serde(default)]
    pub user: Option<SponsorUser>,
    #[serde(default)]
    pub all_sum_amount: Option<String>,
    #[serde(default)]
    pub create_time: Option<i64>,
    #[serde(default)]
    pub first_pay_time: Option<i64>,
    #[serde(default)]
    pub last_pay_time: Option<i64>,
}

/// One page of the upstream sponsor listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SponsorPage {
    #[serde(default)]
    pub total_count: i64,
    #[serde(default)]
    pub total_page: u32,
    #[serde(default)]
    pub list: Vec<RawSponsor>,
}

/// Reconciled sponsor ready for the store.
///
/// `create_time` keeps its upstream column semantics: the first-seen pay
/// time, required on insert. `first_pay_time` stays `None` when the upstream
/// never supplied one, so the store's merge rule can preserve an earlier
/// value on conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewSponsor {
    pub user_id: String,
    pub name: String,
    pub avatar: Option<String>,
    pub all_sum_amount: String,
    pub create_time: i64,
    pub first_pay_time: Option<i64>,
    pub last_pay_time: Option<i64>,
}

/// Why a raw sponsor cannot be persisted. Rejections are per-record and
/// never abort a sync run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("raw sponsor is missing its user identity")]
    MissingUser,
    #[error("sponsor {user_id} has no usable pay timestamp")]
    MissingTimestamp { user_id: String },
}

/// Map a raw upstream sponsor to the persisted shape.
///
/// The last pay time falls back along `last_pay_time`, `create_time`,
/// `first_pay_time`; a record with no resolvable last pay time is rejected.
/// Zero timestamps count as absent.
pub fn reconcile(raw: &RawSponsor) -> Result<NewSponsor, Rejection> {
    let user = match &raw.user {
        Some(user) if !user.user_id.is_empty() => user,
        _ => return Err(Rejection::MissingUser),
    };

    let last_pay_time =
        first_nonzero([raw.last_pay_time, raw.create_time, raw.first_pay_time]);
    let Some(last_pay) = last_pay_time else {
        return Err(Rejection::MissingTimestamp {
            user_id: user.user_id.clone(),
        });
    };

    // Only an upstream-supplied first pay (or creation) time is written to
    // the first_pay_time column; when both are absent it stays NULL and the
    // store keeps whatever it already has.
    let first_pay_time = first_nonzero([raw.first_pay_time, raw.create_time]);

    Ok(NewSponsor {
        user_id: user.user_id.clone(),
        name: user.name.clone(),
        avatar: if user.avatar.is_empty() {
            None
        } else {
            Some(user.avatar.clone())
        },
        all_sum_amount: raw
            .all_sum_amount
            .clone()
            .unwrap_or_else(|| "0.00".to_string()),
        create_time: first_pay_time.unwrap_or(last_pay),
        first_pay_time,
        last_pay_time: Some(last_pay),
    })
}

fn first_nonzero<const N: usize>(candidates: [Option<i64>; N]) -> Option<i64> {
    candidates.into_iter().flatten().find(|&value| value > 0)
}
