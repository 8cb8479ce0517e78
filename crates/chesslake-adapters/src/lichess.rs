//! lichess game export and user APIs.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chesslake_core::{
    captured_now, AggregateResult, Colour, GameResult, GameRow, OpponentId, OpponentStatus, Period, Platform,
};
use chesslake_storage::{ApiRequest, JsonSource};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use crate::timeline::{centiseconds_to_hhmmss, millis_to_datetime, Timeline};
use crate::{
    decode_record, lookup_failed, AdapterContext, AdapterError, NormalizeError, Opening, PlatformAdapter, RawGame,
    ResolvedOpponent,
};

/// Statuses of games that never reached a result.
const UNFINISHED_STATUSES: [&str; 5] = ["created", "started", "aborted", "noStart", "unknownFinish"];

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LichessGame {
    pub id: String,
    pub rated: Option<bool>,
    pub speed: Option<String>,
    pub created_at: Option<i64>,
    pub last_move_at: Option<i64>,
    pub status: Option<String>,
    pub winner: Option<String>,
    pub players: LichessPlayers,
    pub opening: Option<LichessOpening>,
    pub moves: Option<String>,
    /// Centiseconds remaining after each ply.
    pub clocks: Option<Vec<u64>>,
    pub clock: Option<LichessClock>,
}

impl LichessGame {
    pub fn side(&self, colour: Colour) -> &LichessPlayer {
        match colour {
            Colour::White => &self.players.white,
            Colour::Black => &self.players.black,
        }
    }

    /// lichess ids are the lowercased username.
    pub fn colour_of(&self, username: &str) -> Option<Colour> {
        let id = username.to_lowercase();
        let is = |player: &LichessPlayer| player.user.as_ref().is_some_and(|u| u.id == id);
        if is(&self.players.white) {
            Some(Colour::White)
        } else if is(&self.players.black) {
            Some(Colour::Black)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LichessPlayers {
    pub white: LichessPlayer,
    pub black: LichessPlayer,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LichessPlayer {
    /// Absent for anonymous players and the AI.
    pub user: Option<LichessUserRef>,
    pub rating: Option<i64>,
    pub analysis: Option<LichessAnalysis>,
}

impl LichessPlayer {
    fn accuracy(&self) -> Option<f64> {
        self.analysis.as_ref().and_then(|a| a.accuracy)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LichessUserRef {
    pub id: String,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LichessAnalysis {
    pub accuracy: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LichessOpening {
    pub eco: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LichessClock {
    pub initial: Option<u64>,
    pub increment: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LichessProfile {
    pub id: Option<String>,
    pub username: Option<String>,
    pub profile: Option<LichessProfileDetails>,
    pub verified: Option<bool>,
    pub disabled: Option<bool>,
    pub tos_violation: Option<bool>,
    pub patron: Option<bool>,
}

impl LichessProfile {
    pub fn status(&self) -> OpponentStatus {
        OpponentStatus::from_lichess_flags(
            self.disabled.unwrap_or(false),
            self.tos_violation.unwrap_or(false),
            self.patron.unwrap_or(false),
        )
    }

    pub fn country(&self) -> Option<String> {
        let details = self.profile.as_ref()?;
        details
            .flag
            .clone()
            .or_else(|| details.country.clone())
            .filter(|c| !c.is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LichessProfileDetails {
    pub flag: Option<String>,
    pub country: Option<String>,
}

/// Upstream winner, else `draw` for finished games, else nothing.
pub fn lichess_winner(winner: Option<&str>, status: Option<&str>) -> Option<String> {
    if let Some(winner) = winner {
        return Some(winner.to_string());
    }
    match status {
        Some(status) if !UNFINISHED_STATUSES.contains(&status) => Some("draw".to_string()),
        _ => None,
    }
}

pub(crate) fn game_timeline(game: &LichessGame) -> Timeline {
    let moves: Vec<String> = game
        .moves
        .as_deref()
        .unwrap_or_default()
        .split_whitespace()
        .map(str::to_string)
        .collect();
    if game.last_move_at.is_none() || moves.is_empty() {
        return Timeline::not_started();
    }
    let move_times = game.clocks.as_ref().map(|clocks| {
        clocks
            .iter()
            .take(moves.len())
            .map(|cs| centiseconds_to_hhmmss(*cs))
            .collect::<Vec<_>>()
    });
    Timeline::played(
        game.created_at.and_then(millis_to_datetime),
        game.last_move_at.and_then(millis_to_datetime),
        moves,
        move_times,
    )
}

#[derive(Debug, Clone)]
pub struct LichessAdapter {
    base_url: String,
    username: String,
    token: Option<String>,
}

impl LichessAdapter {
    pub fn new(base_url: &str, username: &str, token: Option<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
            token,
        }
    }

    pub fn games_url(&self) -> String {
        format!("{}/api/games/user/{}", self.base_url, self.username)
    }

    pub fn user_url(&self, id: &str) -> String {
        format!("{}/api/user/{}", self.base_url, id)
    }

    pub fn games_request(&self, since: Option<i64>, until: Option<i64>) -> ApiRequest {
        let mut request = ApiRequest::ndjson(Platform::Lichess, self.games_url())
            .with_query("pgnInJson", "true")
            .with_query("accuracy", "true")
            .with_query("clocks", "true")
            .with_query("evals", "true")
            .with_query("opening", "true")
            .with_query("sort", "dateAsc")
            .with_bearer(self.token.as_deref());
        if let Some(since) = since {
            request = request.with_query("since", since);
        }
        if let Some(until) = until {
            request = request.with_query("until", until);
        }
        request
    }

    async fn resolve_opponent(
        &self,
        source: &dyn JsonSource,
        ctx: &AdapterContext,
        game: &LichessGame,
        opponent: &LichessPlayer,
    ) -> Result<ResolvedOpponent, NormalizeError> {
        let Some(user) = opponent.user.as_ref() else {
            return Ok(ResolvedOpponent::default());
        };
        let fallback = ResolvedOpponent {
            id: Some(OpponentId::Handle(user.id.clone())),
            username: user.name.clone(),
            ..ResolvedOpponent::default()
        };

        let request = ApiRequest::json(Platform::Lichess, self.user_url(&user.id)).with_bearer(self.token.as_deref());
        let body = match source.get_json(&request).await {
            Ok(body) => body,
            Err(err) => return lookup_failed(ctx.lookup_policy, Platform::Lichess, &game.id, err, fallback),
        };
        let profile = LichessProfile::deserialize(&body).map_err(|err| NormalizeError::SchemaMismatch {
            platform: Platform::Lichess,
            record: game.id.clone(),
            reason: format!("opponent profile {}: {err}", request.url),
        })?;

        Ok(ResolvedOpponent {
            id: fallback.id,
            username: user.name.clone().or_else(|| profile.username.clone()),
            country: profile.country(),
            is_verified: profile.verified,
            status: Some(profile.status()),
        })
    }
}

#[async_trait]
impl PlatformAdapter for LichessAdapter {
    fn platform(&self) -> Platform {
        Platform::Lichess
    }

    fn username(&self) -> &str {
        &self.username
    }

    async fn available_periods(
        &self,
        _source: &dyn JsonSource,
    ) -> Result<Option<BTreeSet<Period>>, AdapterError> {
        Ok(None)
    }

    async fn fetch_period(&self, source: &dyn JsonSource, period: Period) -> Result<Vec<RawGame>, AdapterError> {
        let games = self
            .fetch_range(source, Some(period.since_millis()), Some(period.until_millis()))
            .await?;
        info!(period = %period, games = games.len(), "fetched lichess month");
        Ok(games)
    }

    async fn fetch_range(
        &self,
        source: &dyn JsonSource,
        since: Option<i64>,
        until: Option<i64>,
    ) -> Result<Vec<RawGame>, AdapterError> {
        Ok(source.get_ndjson(&self.games_request(since, until)).await?)
    }

    fn period_of(&self, raw: &RawGame) -> Option<Period> {
        raw.get("createdAt").and_then(JsonValue::as_i64).and_then(Period::from_millis)
    }

    async fn normalize(
        &self,
        source: &dyn JsonSource,
        ctx: &AdapterContext,
        raw: &RawGame,
    ) -> Result<GameRow, NormalizeError> {
        let game: LichessGame = decode_record(Platform::Lichess, raw)?;
        let url = format!("{}/{}", self.base_url, game.id);
        info!(url = %url, "extracting game");

        let colour = game.colour_of(&self.username).ok_or_else(|| NormalizeError::SchemaMismatch {
            platform: Platform::Lichess,
            record: game.id.clone(),
            reason: format!("{} played neither side", self.username),
        })?;
        let opponent = self
            .resolve_opponent(source, ctx, &game, game.side(colour.opposite()))
            .await?;
        if opponent.id.is_none() {
            warn!(game = %game.id, "opponent is anonymous or the AI; opponent fields left empty");
        }

        let timeline = game_timeline(&game);
        let opening = if timeline.is_started() {
            let opening = game.opening.as_ref();
            Opening {
                code: opening.and_then(|o| o.eco.clone()),
                name: opening.and_then(|o| o.name.clone()),
                url: None,
            }
        } else {
            Opening::default()
        };
        let time_control = game.clock.as_ref().and_then(|c| match (c.initial, c.increment) {
            (Some(initial), Some(increment)) => Some(format!("{initial}+{increment}")),
            _ => None,
        });

        Ok(GameRow {
            game_id: game.id.clone(),
            url: Some(url),
            time_class: game.speed.clone(),
            time_control,
            is_rated: game.rated,
            white_rating: game.players.white.rating,
            black_rating: game.players.black.rating,
            white_accuracy: game.players.white.accuracy(),
            black_accuracy: game.players.black.accuracy(),
            result: GameResult::Aggregate(AggregateResult {
                game_winner: lichess_winner(game.winner.as_deref(), game.status.as_deref()),
                game_status: game.status.clone(),
            }),
            colour,
            opponent_id: opponent.id,
            opponent_username: opponent.username,
            opponent_country: opponent.country,
            opponent_is_verified: opponent.is_verified,
            opponent_status: opponent.status,
            start_datetime: timeline.start_datetime,
            end_datetime: timeline.end_datetime,
            opening_code: opening.code,
            opening_name: opening.name,
            opening_url: opening.url,
            total_moves: timeline.total_moves,
            moves: timeline.moves,
            move_times: timeline.move_times,
            extracted_at: captured_now(),
        })
    }
}
