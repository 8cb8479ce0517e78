//! Core domain model for chesslake: the canonical game row and the calendar
//! period it is batched under.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, NaiveTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "chesslake-core";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unknown platform `{0}` (expected chesscom or lichess)")]
    Platform(String),
    #[error("invalid period `{0}` (expected YYYY-MM)")]
    Period(String),
}

/// Upstream game platform. Both pipelines share the row schema but never
/// share runtime state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    #[serde(rename = "chesscom")]
    ChessCom,
    Lichess,
}

impl Platform {
    pub const ALL: [Platform; 2] = [Platform::ChessCom, Platform::Lichess];

    /// Directory and table-suffix name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::ChessCom => "chesscom",
            Platform::Lichess => "lichess",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "chesscom" | "chess.com" | "chess-com" => Ok(Platform::ChessCom),
            "lichess" | "lichess.org" => Ok(Platform::Lichess),
            other => Err(ParseError::Platform(other.to_string())),
        }
    }
}

/// A calendar month. Ordered chronologically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Period {
    year: i32,
    month: u32,
}

impl Period {
    pub fn new(year: i32, month: u32) -> Result<Self, ParseError> {
        if !(1..=12).contains(&month) || !(1..=9999).contains(&year) {
            return Err(ParseError::Period(format!("{year}-{month}")));
        }
        Ok(Self { year, month })
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    pub fn containing(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    /// The month before the one containing `date`; used to extract "last month".
    pub fn preceding(date: NaiveDate) -> Self {
        Self::containing(date).previous()
    }

    pub fn from_millis(ms: i64) -> Option<Self> {
        DateTime::<Utc>::from_timestamp_millis(ms).map(|dt| Self::containing(dt.date_naive()))
    }

    pub fn next(&self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    pub fn previous(&self) -> Self {
        if self.month == 1 {
            Self {
                year: self.year - 1,
                month: 12,
            }
        } else {
            Self {
                year: self.year,
                month: self.month - 1,
            }
        }
    }

    pub fn first_day(&self) -> NaiveDate {
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or_default()
    }

    /// First millisecond of the month, UTC.
    pub fn since_millis(&self) -> i64 {
        self.first_day()
            .and_time(NaiveTime::default())
            .and_utc()
            .timestamp_millis()
    }

    /// Last millisecond of the month, UTC (inclusive bound).
    pub fn until_millis(&self) -> i64 {
        self.next().since_millis() - 1
    }

    pub fn contains_millis(&self, ms: i64) -> bool {
        (self.since_millis()..=self.until_millis()).contains(&ms)
    }

    /// `{year}_{month:02}.ndjson`
    pub fn file_name(&self) -> String {
        format!("{}_{:02}.ndjson", self.year, self.month)
    }

    /// Inclusive range of months. Empty when `to < from`.
    pub fn range_inclusive(from: Period, to: Period) -> PeriodRange {
        PeriodRange {
            next: Some(from),
            last: to,
        }
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:02}", self.year, self.month)
    }
}

impl FromStr for Period {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let (year, month) = trimmed
            .split_once(['-', '_', '/'])
            .ok_or_else(|| ParseError::Period(trimmed.to_string()))?;
        let year = year
            .parse::<i32>()
            .map_err(|_| ParseError::Period(trimmed.to_string()))?;
        let month = month
            .parse::<u32>()
            .map_err(|_| ParseError::Period(trimmed.to_string()))?;
        Period::new(year, month).map_err(|_| ParseError::Period(trimmed.to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct PeriodRange {
    next: Option<Period>,
    last: Period,
}

impl Iterator for PeriodRange {
    type Item = Period;

    fn next(&mut self) -> Option<Period> {
        let current = self.next.filter(|p| *p <= self.last)?;
        self.next = Some(current.next());
        Some(current)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Colour {
    White,
    Black,
}

impl Colour {
    pub fn opposite(&self) -> Self {
        match self {
            Colour::White => Colour::Black,
            Colour::Black => Colour::White,
        }
    }
}

impl fmt::Display for Colour {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Colour::White => "white",
            Colour::Black => "black",
        })
    }
}

/// Account standing of the opponent at extraction time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpponentStatus {
    #[serde(rename = "closed")]
    Closed,
    #[serde(rename = "closed:fair_play_violations")]
    ClosedFairPlayViolations,
    #[serde(rename = "patron")]
    Patron,
    #[serde(rename = "member")]
    Member,
    #[serde(rename = "basic")]
    Basic,
    #[serde(rename = "premium")]
    Premium,
    #[serde(rename = "staff")]
    Staff,
}

impl OpponentStatus {
    /// chess.com reports status as a string on the player profile.
    pub fn from_chesscom(status: &str) -> Option<Self> {
        match status.trim().to_ascii_lowercase().as_str() {
            "closed" | "closed:abuse" => Some(OpponentStatus::Closed),
            "closed:fair_play_violations" => Some(OpponentStatus::ClosedFairPlayViolations),
            "basic" => Some(OpponentStatus::Basic),
            "premium" => Some(OpponentStatus::Premium),
            "staff" | "mod" => Some(OpponentStatus::Staff),
            _ => None,
        }
    }

    /// lichess exposes flags instead; closed outranks fair-play, which outranks patron.
    pub fn from_lichess_flags(disabled: bool, tos_violation: bool, patron: bool) -> Self {
        if disabled {
            OpponentStatus::Closed
        } else if tos_violation {
            OpponentStatus::ClosedFairPlayViolations
        } else if patron {
            OpponentStatus::Patron
        } else {
            OpponentStatus::Member
        }
    }
}

/// chess.com ids are numeric `player_id`s, lichess ids are lowercase handles.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OpponentId {
    Numeric(i64),
    Handle(String),
}

/// chess.com reports a result string per side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct PerSideResult {
    pub white_result: Option<String>,
    pub black_result: Option<String>,
}

/// lichess reports one winner plus a termination status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct AggregateResult {
    pub game_winner: Option<String>,
    pub game_status: Option<String>,
}

/// Result columns keep each platform's native shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum GameResult {
    PerSide(PerSideResult),
    Aggregate(AggregateResult),
}

/// Canonical row produced for every raw game. Field order is the column order
/// of the warehouse table and of every NDJSON line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameRow {
    pub game_id: String,
    pub url: Option<String>,
    pub time_class: Option<String>,
    pub time_control: Option<String>,
    pub is_rated: Option<bool>,
    pub white_rating: Option<i64>,
    pub black_rating: Option<i64>,
    pub white_accuracy: Option<f64>,
    pub black_accuracy: Option<f64>,
    #[serde(flatten)]
    pub result: GameResult,
    pub colour: Colour,
    pub opponent_id: Option<OpponentId>,
    pub opponent_username: Option<String>,
    pub opponent_country: Option<String>,
    pub opponent_is_verified: Option<bool>,
    pub opponent_status: Option<OpponentStatus>,
    pub start_datetime: Option<String>,
    pub end_datetime: Option<String>,
    pub opening_code: Option<String>,
    pub opening_name: Option<String>,
    pub opening_url: Option<String>,
    pub total_moves: Option<u32>,
    pub moves: Option<Vec<String>>,
    pub move_times: Option<Vec<String>>,
    #[serde(rename = "_extracted_at", with = "extracted_at_format")]
    pub extracted_at: NaiveDateTime,
}

impl GameRow {
    pub fn platform(&self) -> Platform {
        match self.result {
            GameResult::PerSide(_) => Platform::ChessCom,
            GameResult::Aggregate(_) => Platform::Lichess,
        }
    }

    pub fn started(&self) -> bool {
        self.moves.is_some()
    }
}

/// Capture timestamp for a freshly produced row, truncated to the
/// microsecond precision of a warehouse DATETIME.
pub fn captured_now() -> NaiveDateTime {
    Utc::now().naive_utc().trunc_subsecs(6)
}

pub mod extracted_at_format {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub const FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

    pub fn serialize<S: Serializer>(value: &NaiveDateTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.format(FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveDateTime, D::Error> {
        let text = String::deserialize(deserializer)?;
        NaiveDateTime::parse_from_str(&text, "%Y-%m-%d %H:%M:%S%.f")
            .or_else(|_| NaiveDateTime::parse_from_str(&text, "%Y-%m-%dT%H:%M:%S%.f"))
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(text: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f").expect("ts")
    }

    fn chesscom_row() -> GameRow {
        GameRow {
            game_id: "3f1c".to_string(),
            url: Some("https://www.chess.com/game/live/1".to_string()),
            time_class: Some("rapid".to_string()),
            time_control: Some("600".to_string()),
            is_rated: Some(true),
            white_rating: Some(1210),
            black_rating: Some(1195),
            white_accuracy: Some(81.37),
            black_accuracy: None,
            result: GameResult::PerSide(PerSideResult {
                white_result: Some("win".to_string()),
                black_result: Some("resigned".to_string()),
            }),
            colour: Colour::White,
            opponent_id: Some(OpponentId::Numeric(42)),
            opponent_username: Some("rival".to_string()),
            opponent_country: Some("Norway".to_string()),
            opponent_is_verified: Some(false),
            opponent_status: Some(OpponentStatus::Premium),
            start_datetime: Some("2024-08-01 10:00:00".to_string()),
            end_datetime: Some("2024-08-01 10:09:12".to_string()),
            opening_code: Some("B20".to_string()),
            opening_name: Some("Sicilian Defense".to_string()),
            opening_url: Some("https://www.chess.com/openings/Sicilian-Defense".to_string()),
            total_moves: Some(1),
            moves: Some(vec!["e4".to_string(), "c5".to_string()]),
            move_times: Some(vec!["00:09:58".to_string(), "00:09:57".to_string()]),
            extracted_at: ts("2024-09-01 06:00:00.123456"),
        }
    }

    #[test]
    fn period_rolls_over_year_boundaries() {
        let jan = Period::new(2024, 1).unwrap();
        assert_eq!(jan.previous(), Period::new(2023, 12).unwrap());
        assert_eq!(Period::new(2023, 12).unwrap().next(), jan);
        let first_of_jan = NaiveDate::from_ymd_opt(2025, 1, 1).unwrap();
        assert_eq!(Period::preceding(first_of_jan), Period::new(2024, 12).unwrap());
    }

    #[test]
    fn period_file_names_are_zero_padded() {
        assert_eq!(Period::new(2024, 8).unwrap().file_name(), "2024_08.ndjson");
        assert_eq!(Period::new(2024, 11).unwrap().to_string(), "2024-11");
    }

    #[test]
    fn period_parses_common_spellings() {
        let expected = Period::new(2024, 8).unwrap();
        assert_eq!("2024-08".parse::<Period>().unwrap(), expected);
        assert_eq!("2024_8".parse::<Period>().unwrap(), expected);
        assert!("2024-13".parse::<Period>().is_err());
        assert!("august".parse::<Period>().is_err());
    }

    #[test]
    fn period_millis_bounds_cover_the_month() {
        let aug = Period::new(2024, 8).unwrap();
        assert_eq!(aug.since_millis(), 1_722_470_400_000);
        assert_eq!(aug.until_millis(), 1_725_148_799_999);
        assert!(aug.contains_millis(aug.until_millis()));
        assert!(!aug.contains_millis(aug.next().since_millis()));
        assert_eq!(Period::from_millis(1_722_470_400_000), Some(aug));
    }

    #[test]
    fn period_range_is_inclusive_and_ordered() {
        let from = Period::new(2023, 11).unwrap();
        let to = Period::new(2024, 2).unwrap();
        let months: Vec<String> = Period::range_inclusive(from, to).map(|p| p.to_string()).collect();
        assert_eq!(months, vec!["2023-11", "2023-12", "2024-01", "2024-02"]);
        assert_eq!(Period::range_inclusive(to, from).count(), 0);
    }

    #[test]
    fn platform_parses_aliases() {
        assert_eq!("chess.com".parse::<Platform>().unwrap(), Platform::ChessCom);
        assert_eq!("Lichess".parse::<Platform>().unwrap(), Platform::Lichess);
        assert!("fics".parse::<Platform>().is_err());
    }

    #[test]
    fn lichess_status_precedence() {
        assert_eq!(OpponentStatus::from_lichess_flags(true, true, true), OpponentStatus::Closed);
        assert_eq!(
            OpponentStatus::from_lichess_flags(false, true, true),
            OpponentStatus::ClosedFairPlayViolations
        );
        assert_eq!(OpponentStatus::from_lichess_flags(false, false, true), OpponentStatus::Patron);
        assert_eq!(OpponentStatus::from_lichess_flags(false, false, false), OpponentStatus::Member);
    }

    #[test]
    fn chesscom_status_strings_map_to_enum() {
        assert_eq!(
            OpponentStatus::from_chesscom("closed:fair_play_violations"),
            Some(OpponentStatus::ClosedFairPlayViolations)
        );
        assert_eq!(OpponentStatus::from_chesscom("premium"), Some(OpponentStatus::Premium));
        assert_eq!(OpponentStatus::from_chesscom("something-new"), None);
    }

    #[test]
    fn row_serializes_in_column_order() {
        let json = serde_json::to_string(&chesscom_row()).unwrap();
        let positions: Vec<usize> = [
            "\"game_id\"",
            "\"black_accuracy\"",
            "\"white_result\"",
            "\"black_result\"",
            "\"colour\"",
            "\"opening_url\"",
            "\"moves\"",
            "\"move_times\"",
            "\"_extracted_at\"",
        ]
        .iter()
        .map(|k| json.find(k).unwrap_or_else(|| panic!("missing {k}")))
        .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{json}");
        assert!(json.contains("\"_extracted_at\":\"2024-09-01 06:00:00.123456\""));
        assert!(json.contains("\"opponent_status\":\"premium\""));
        assert!(json.contains("\"black_accuracy\":null"));
    }

    #[test]
    fn row_round_trips_both_result_shapes() {
        let chesscom = chesscom_row();
        let back: GameRow = serde_json::from_str(&serde_json::to_string(&chesscom).unwrap()).unwrap();
        assert_eq!(back, chesscom);
        assert_eq!(back.platform(), Platform::ChessCom);

        let mut lichess = chesscom_row();
        lichess.result = GameResult::Aggregate(AggregateResult {
            game_winner: Some("draw".to_string()),
            game_status: Some("stalemate".to_string()),
        });
        lichess.opponent_id = Some(OpponentId::Handle("rival".to_string()));
        lichess.opening_url = None;
        lichess.moves = Some(Vec::new());
        lichess.move_times = None;
        let text = serde_json::to_string(&lichess).unwrap();
        assert!(text.contains("\"moves\":[]"));
        assert!(text.contains("\"move_times\":null"));
        let back: GameRow = serde_json::from_str(&text).unwrap();
        assert_eq!(back, lichess);
        assert_eq!(back.platform(), Platform::Lichess);
    }
}
