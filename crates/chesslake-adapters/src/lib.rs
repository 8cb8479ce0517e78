//! Platform adapter contracts plus the chess.com and lichess implementations.

use std::collections::BTreeSet;
use std::str::FromStr;

use async_trait::async_trait;
use chesslake_core::{OpponentId, OpponentStatus, Period, Platform};
use chesslake_storage::{FetchError, JsonSource};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

mod chesscom;
mod lichess;
pub mod timeline;

pub use chesscom::{ChessComAdapter, ChessComGame, ChessComPlayer, ChessComProfile};
pub use lichess::{lichess_winner, LichessAdapter, LichessGame, LichessPlayer, LichessProfile};

pub const CRATE_NAME: &str = "chesslake-adapters";

pub const CHESSCOM_API_BASE: &str = "https://api.chess.com";
pub const LICHESS_API_BASE: &str = "https://lichess.org";

/// A game exactly as the platform returned it.
pub type RawGame = JsonValue;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OpponentLookupPolicy {
    /// Drop the game and keep going.
    #[default]
    Skip,
    /// Keep the game with whatever the game payload itself says about the opponent.
    Degrade,
    /// Abort the whole period.
    Fail,
}

impl OpponentLookupPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Skip => "skip",
            Self::Degrade => "degrade",
            Self::Fail => "fail",
        }
    }
}

impl FromStr for OpponentLookupPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip" => Ok(Self::Skip),
            "degrade" => Ok(Self::Degrade),
            "fail" => Ok(Self::Fail),
            other => Err(format!("unknown opponent lookup policy `{other}` (expected skip, degrade or fail)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub lookup_policy: OpponentLookupPolicy,
}

impl AdapterContext {
    pub fn new(lookup_policy: OpponentLookupPolicy) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            lookup_policy,
        }
    }
}

/// Account being extracted and where to reach its platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountConfig {
    pub platform: Platform,
    pub username: String,
    pub api_base: String,
    pub token: Option<String>,
}

impl AccountConfig {
    pub fn new(platform: Platform, username: impl Into<String>) -> Self {
        let api_base = match platform {
            Platform::ChessCom => CHESSCOM_API_BASE,
            Platform::Lichess => LICHESS_API_BASE,
        };
        Self {
            platform,
            username: username.into(),
            api_base: api_base.to_string(),
            token: None,
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into().trim_end_matches('/').to_string();
        self
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token.filter(|t| !t.trim().is_empty());
        self
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unexpected {what} payload from {url}: {source}")]
    Payload {
        what: &'static str,
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("{platform} record {record} skipped: {reason}")]
    SchemaMismatch {
        platform: Platform,
        record: String,
        reason: String,
    },
    #[error("opponent lookup for {platform} game {game_id} failed: {source}")]
    OpponentLookup {
        platform: Platform,
        game_id: String,
        #[source]
        source: FetchError,
        fatal: bool,
    },
}

impl NormalizeError {
    /// Fatal errors abort the period; everything else drops only the game.
    pub fn is_fatal(&self) -> bool {
        matches!(self, NormalizeError::OpponentLookup { fatal: true, .. })
    }
}

/// Opponent columns of a row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedOpponent {
    pub id: Option<OpponentId>,
    pub username: Option<String>,
    pub country: Option<String>,
    pub is_verified: Option<bool>,
    pub status: Option<OpponentStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Opening {
    pub code: Option<String>,
    pub name: Option<String>,
    pub url: Option<String>,
}

#[async_trait]
pub trait PlatformAdapter: Send + Sync {
    fn platform(&self) -> Platform;

    fn username(&self) -> &str;

    /// Months the platform says hold games, when it can say.
    async fn available_periods(
        &self,
        source: &dyn JsonSource,
    ) -> Result<Option<BTreeSet<Period>>, AdapterError>;

    async fn fetch_period(&self, source: &dyn JsonSource, period: Period) -> Result<Vec<RawGame>, AdapterError>;

    /// Games whose timestamp falls in `[since, until]`, epoch milliseconds.
    async fn fetch_range(
        &self,
        source: &dyn JsonSource,
        since: Option<i64>,
        until: Option<i64>,
    ) -> Result<Vec<RawGame>, AdapterError>;

    /// Month a raw game belongs to when grouping range extractions.
    fn period_of(&self, raw: &RawGame) -> Option<Period>;

    async fn normalize(
        &self,
        source: &dyn JsonSource,
        ctx: &AdapterContext,
        raw: &RawGame,
    ) -> Result<chesslake_core::GameRow, NormalizeError>;
}

pub fn adapter_for(account: &AccountConfig) -> Box<dyn PlatformAdapter> {
    match account.platform {
        Platform::ChessCom => Box::new(ChessComAdapter::new(&account.api_base, &account.username)),
        Platform::Lichess => Box::new(LichessAdapter::new(
            &account.api_base,
            &account.username,
            account.token.clone(),
        )),
    }
}

/// Best identifier for log lines about a raw record.
pub fn record_label(raw: &RawGame) -> String {
    ["url", "id", "uuid"]
        .iter()
        .find_map(|key| raw.get(key).and_then(JsonValue::as_str))
        .unwrap_or("<unidentified>")
        .to_string()
}

pub(crate) fn decode_record<T: DeserializeOwned>(platform: Platform, raw: &RawGame) -> Result<T, NormalizeError> {
    T::deserialize(raw).map_err(|e| NormalizeError::SchemaMismatch {
        platform,
        record: record_label(raw),
        reason: e.to_string(),
    })
}

pub(crate) fn decode_payload<T: DeserializeOwned>(
    what: &'static str,
    url: &str,
    value: JsonValue,
) -> Result<T, AdapterError> {
    serde_json::from_value(value).map_err(|source| AdapterError::Payload {
        what,
        url: url.to_string(),
        source,
    })
}

/// Applies the lookup policy to a failed profile request.
pub(crate) fn lookup_failed(
    policy: OpponentLookupPolicy,
    platform: Platform,
    game_id: &str,
    source: FetchError,
    fallback: ResolvedOpponent,
) -> Result<ResolvedOpponent, NormalizeError> {
    match policy {
        OpponentLookupPolicy::Degrade => {
            warn!(%platform, game_id, error = %source, "opponent lookup failed; keeping game without profile");
            Ok(fallback)
        }
        OpponentLookupPolicy::Skip | OpponentLookupPolicy::Fail => Err(NormalizeError::OpponentLookup {
            platform,
            game_id: game_id.to_string(),
            source,
            fatal: policy == OpponentLookupPolicy::Fail,
        }),
    }
}
