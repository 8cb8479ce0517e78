//! chess.com published-data API.

use std::collections::BTreeSet;

use async_trait::async_trait;
use chesslake_core::{captured_now, Colour, GameResult, GameRow, OpponentId, OpponentStatus, PerSideResult, Period, Platform};
use chesslake_storage::{ApiRequest, JsonSource};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use crate::timeline::{movetext, pgn_datetime, MoveText, PgnTags, Timeline};
use crate::{
    decode_payload, decode_record, lookup_failed, AdapterContext, AdapterError, NormalizeError, Opening,
    PlatformAdapter, RawGame, ResolvedOpponent,
};

#[derive(Debug, Clone, Deserialize)]
pub struct ChessComGame {
    pub url: String,
    pub uuid: String,
    pub pgn: Option<String>,
    pub time_control: Option<String>,
    pub time_class: Option<String>,
    pub rated: Option<bool>,
    /// Epoch seconds.
    pub end_time: Option<i64>,
    pub accuracies: Option<ChessComAccuracies>,
    pub eco: Option<String>,
    pub white: ChessComPlayer,
    pub black: ChessComPlayer,
}

impl ChessComGame {
    pub fn side(&self, colour: Colour) -> &ChessComPlayer {
        match colour {
            Colour::White => &self.white,
            Colour::Black => &self.black,
        }
    }

    pub fn colour_of(&self, username: &str) -> Option<Colour> {
        if self.white.username.eq_ignore_ascii_case(username) {
            Some(Colour::White)
        } else if self.black.username.eq_ignore_ascii_case(username) {
            Some(Colour::Black)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChessComPlayer {
    pub username: String,
    pub rating: Option<i64>,
    pub result: Option<String>,
    #[serde(rename = "@id")]
    pub profile_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChessComAccuracies {
    pub white: Option<f64>,
    pub black: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChessComProfile {
    pub player_id: Option<i64>,
    pub username: Option<String>,
    /// URL of the country resource, not its name.
    pub country: Option<String>,
    pub verified: Option<bool>,
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChessComCountry {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ArchiveList {
    archives: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct MonthArchive {
    games: Vec<JsonValue>,
}

#[derive(Debug, Clone)]
pub struct ChessComAdapter {
    base_url: String,
    username: String,
}

impl ChessComAdapter {
    pub fn new(base_url: &str, username: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            username: username.to_string(),
        }
    }

    fn player_url(&self, username: &str) -> String {
        format!("{}/pub/player/{}", self.base_url, username.to_ascii_lowercase())
    }

    pub fn archives_url(&self) -> String {
        format!("{}/games/archives", self.player_url(&self.username))
    }

    pub fn month_url(&self, period: Period) -> String {
        format!(
            "{}/games/{}/{:02}",
            self.player_url(&self.username),
            period.year(),
            period.month()
        )
    }

    pub async fn list_archives(&self, source: &dyn JsonSource) -> Result<BTreeSet<Period>, AdapterError> {
        let url = self.archives_url();
        let body = source.get_json(&ApiRequest::json(Platform::ChessCom, &url)).await?;
        let list: ArchiveList = decode_payload("archive list", &url, body)?;
        let periods = list
            .archives
            .iter()
            .filter_map(|archive| {
                let parsed = archive_period(archive);
                if parsed.is_none() {
                    warn!(archive = %archive, "ignoring archive url without a year/month suffix");
                }
                parsed
            })
            .collect();
        Ok(periods)
    }

    async fn resolve_opponent(
        &self,
        source: &dyn JsonSource,
        ctx: &AdapterContext,
        game: &ChessComGame,
        opponent: &ChessComPlayer,
    ) -> Result<ResolvedOpponent, NormalizeError> {
        let profile_url = opponent
            .profile_url
            .clone()
            .unwrap_or_else(|| self.player_url(&opponent.username));
        let fallback = ResolvedOpponent {
            username: Some(opponent.username.clone()),
            ..ResolvedOpponent::default()
        };

        let profile = match source.get_json(&ApiRequest::json(Platform::ChessCom, &profile_url)).await {
            Ok(body) => body,
            Err(err) => return lookup_failed(ctx.lookup_policy, Platform::ChessCom, &game.uuid, err, fallback),
        };
        let profile: ChessComProfile = match ChessComProfile::deserialize(&profile) {
            Ok(profile) => profile,
            Err(err) => {
                return Err(NormalizeError::SchemaMismatch {
                    platform: Platform::ChessCom,
                    record: game.url.clone(),
                    reason: format!("opponent profile {profile_url}: {err}"),
                })
            }
        };

        let status = profile.status.as_deref().and_then(|raw| {
            let mapped = OpponentStatus::from_chesscom(raw);
            if mapped.is_none() {
                warn!(status = raw, game = %game.url, "unrecognised chess.com account status");
            }
            mapped
        });

        let country = match profile.country.as_deref() {
            Some(country_url) => self.country_name(source, country_url).await,
            None => None,
        };

        Ok(ResolvedOpponent {
            id: profile.player_id.map(OpponentId::Numeric),
            username: profile.username.or(fallback.username),
            country,
            is_verified: profile.verified,
            status,
        })
    }

    async fn country_name(&self, source: &dyn JsonSource, country_url: &str) -> Option<String> {
        let result = source
            .get_json(&ApiRequest::json(Platform::ChessCom, country_url))
            .await
            .map_err(|e| e.to_string())
            .and_then(|body| ChessComCountry::deserialize(&body).map_err(|e| e.to_string()));
        match result {
            Ok(country) => country.name,
            Err(error) => {
                warn!(country_url, error = %error, "country lookup failed; leaving country empty");
                None
            }
        }
    }
}

/// Archive URLs end in `/{year}/{month}`.
fn archive_period(url: &str) -> Option<Period> {
    let mut segments = url.trim_end_matches('/').rsplit('/');
    let month = segments.next()?.parse().ok()?;
    let year = segments.next()?.parse().ok()?;
    Period::new(year, month).ok()
}

/// `https://www.chess.com/openings/Sicilian-Defense-Old-Sicilian-2.Nc3`
/// reads as `Sicilian Defense Old Sicilian 2.Nc3`.
pub(crate) fn opening_name_from_url(url: &str) -> Option<String> {
    let slug = url.trim_end_matches('/').rsplit('/').next()?;
    let name = slug.replace('-', " ");
    (!name.trim().is_empty()).then_some(name)
}

/// Timeline and opening from a chess.com PGN. No `EndTime` or no plies means
/// the game never started.
pub(crate) fn pgn_timeline(pgn: Option<&str>) -> (Timeline, Opening) {
    let not_started = (Timeline::not_started(), Opening::default());
    let Some(pgn) = pgn else {
        return not_started;
    };
    let tags = PgnTags::parse(pgn);
    let Some(end_time) = tags.get("EndTime") else {
        return not_started;
    };
    let text = MoveText::parse(&movetext(pgn));
    if text.moves.is_empty() {
        return not_started;
    }

    let start = tags
        .get("Date")
        .zip(tags.get("StartTime"))
        .and_then(|(date, time)| pgn_datetime(date, time));
    let end = tags
        .get("EndDate")
        .or_else(|| tags.get("Date"))
        .and_then(|date| pgn_datetime(date, end_time));
    let move_times = text.move_times();
    let timeline = Timeline::played(start, end, text.moves, move_times);

    let url = tags.get("ECOUrl").map(str::to_string);
    let opening = Opening {
        code: tags.get("ECO").map(str::to_string),
        name: url.as_deref().and_then(opening_name_from_url),
        url,
    };
    (timeline, opening)
}

#[async_trait]
impl PlatformAdapter for ChessComAdapter {
    fn platform(&self) -> Platform {
        Platform::ChessCom
    }

    fn username(&self) -> &str {
        &self.username
    }

    async fn available_periods(
        &self,
        source: &dyn JsonSource,
    ) -> Result<Option<BTreeSet<Period>>, AdapterError> {
        self.list_archives(source).await.map(Some)
    }

    async fn fetch_period(&self, source: &dyn JsonSource, period: Period) -> Result<Vec<RawGame>, AdapterError> {
        let url = self.month_url(period);
        let body = source.get_json(&ApiRequest::json(Platform::ChessCom, &url)).await?;
        let archive: MonthArchive = decode_payload("monthly archive", &url, body)?;
        info!(period = %period, games = archive.games.len(), "fetched chess.com month");
        Ok(archive.games)
    }

    async fn fetch_range(
        &self,
        source: &dyn JsonSource,
        since: Option<i64>,
        until: Option<i64>,
    ) -> Result<Vec<RawGame>, AdapterError> {
        let bounded = since.is_some() || until.is_some();
        let in_window = |ms: i64| since.map_or(true, |s| ms >= s) && until.map_or(true, |u| ms <= u);
        let months: Vec<Period> = self
            .list_archives(source)
            .await?
            .into_iter()
            .filter(|p| since.map_or(true, |s| p.until_millis() >= s) && until.map_or(true, |u| p.since_millis() <= u))
            .collect();

        let mut games = Vec::new();
        for period in months {
            for game in self.fetch_period(source, period).await? {
                let end_ms = game.get("end_time").and_then(JsonValue::as_i64).map(|s| s * 1000);
                match end_ms {
                    Some(ms) if in_window(ms) => games.push(game),
                    Some(_) => {}
                    None if bounded => {
                        warn!(period = %period, uuid = ?game.get("uuid"), "game has no end_time, outside any window");
                    }
                    None => games.push(game),
                }
            }
        }
        Ok(games)
    }

    fn period_of(&self, raw: &RawGame) -> Option<Period> {
        raw.get("end_time")
            .and_then(JsonValue::as_i64)
            .and_then(|secs| Period::from_millis(secs.checked_mul(1000)?))
    }

    async fn normalize(
        &self,
        source: &dyn JsonSource,
        ctx: &AdapterContext,
        raw: &RawGame,
    ) -> Result<GameRow, NormalizeError> {
        let game: ChessComGame = decode_record(Platform::ChessCom, raw)?;
        info!(url = %game.url, "extracting game");

        let colour = game.colour_of(&self.username).ok_or_else(|| NormalizeError::SchemaMismatch {
            platform: Platform::ChessCom,
            record: game.url.clone(),
            reason: format!("{} played neither side", self.username),
        })?;
        let opponent = self
            .resolve_opponent(source, ctx, &game, game.side(colour.opposite()))
            .await?;

        let (timeline, opening) = pgn_timeline(game.pgn.as_deref());
        if !timeline.is_started() {
            debug!(url = %game.url, "game never started; temporal and move fields left empty");
        }
        let opening_url = opening.url.or_else(|| timeline.is_started().then(|| game.eco.clone()).flatten());
        let opening_name = opening
            .name
            .or_else(|| opening_url.as_deref().and_then(opening_name_from_url));

        Ok(GameRow {
            game_id: game.uuid.clone(),
            url: Some(game.url.clone()),
            time_class: game.time_class.clone(),
            time_control: game.time_control.clone(),
            is_rated: game.rated,
            white_rating: game.white.rating,
            black_rating: game.black.rating,
            white_accuracy: game.accuracies.as_ref().and_then(|a| a.white),
            black_accuracy: game.accuracies.as_ref().and_then(|a| a.black),
            result: GameResult::PerSide(PerSideResult {
                white_result: game.white.result.clone(),
                black_result: game.black.result.clone(),
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
            opening_name,
            opening_url,
            total_moves: timeline.total_moves,
            moves: timeline.moves,
            move_times: timeline.move_times,
            extracted_at: captured_now(),
        })
    }
}
