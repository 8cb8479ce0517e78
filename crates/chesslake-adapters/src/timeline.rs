//! Move, clock and timestamp parsing shared by both platforms.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};

const RESULT_TOKENS: [&str; 4] = ["1-0", "0-1", "1/2-1/2", "*"];

/// PGN tag pairs keyed by tag name. Order and unknown tags do not matter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PgnTags(BTreeMap<String, String>);

impl PgnTags {
    pub fn parse(pgn: &str) -> Self {
        let mut tags = BTreeMap::new();
        for line in pgn.lines() {
            let line = line.trim();
            let Some(inner) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) else {
                continue;
            };
            let Some((key, rest)) = inner.split_once(char::is_whitespace) else {
                continue;
            };
            if let Some(value) = unquote(rest.trim()) {
                tags.insert(key.to_string(), value);
            }
        }
        Self(tags)
    }

    /// Blank values and the PGN "unknown" placeholder `?` read as absent.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty() && *v != "?")
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn unquote(raw: &str) -> Option<String> {
    let body = raw.strip_prefix('"')?.strip_suffix('"')?;
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(escaped) = chars.next() {
                out.push(escaped);
            }
        } else {
            out.push(c);
        }
    }
    Some(out)
}

/// Every non-tag, non-blank line of a PGN, joined by spaces.
pub fn movetext(pgn: &str) -> String {
    pgn.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('['))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Plies in order with the `%clk` annotation that followed each one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MoveText {
    pub moves: Vec<String>,
    pub clocks: Vec<Option<String>>,
    pub result: Option<String>,
}

impl MoveText {
    pub fn parse(text: &str) -> Self {
        let chars: Vec<char> = text.chars().collect();
        let mut out = MoveText::default();
        let mut i = 0;

        while i < chars.len() {
            let c = chars[i];
            if c.is_whitespace() {
                i += 1;
                continue;
            }
            match c {
                '{' => {
                    let end = find_from(&chars, i + 1, '}').unwrap_or(chars.len());
                    let comment: String = chars[i + 1..end].iter().collect();
                    if let (Some(clock), Some(slot)) = (clock_annotation(&comment), out.clocks.last_mut()) {
                        if slot.is_none() {
                            *slot = Some(clock);
                        }
                    }
                    i = end + 1;
                }
                ';' => {
                    i = find_from(&chars, i + 1, '\n').unwrap_or(chars.len()) + 1;
                }
                '(' => {
                    i = skip_variation(&chars, i);
                }
                ')' | '}' => {
                    i += 1;
                }
                _ => {
                    let start = i;
                    while i < chars.len() && !chars[i].is_whitespace() && !"{}();".contains(chars[i]) {
                        i += 1;
                    }
                    let token: String = chars[start..i].iter().collect();
                    if RESULT_TOKENS.contains(&token.as_str()) {
                        out.result = Some(token);
                        break;
                    }
                    if let Some(san) = san_from_token(&token) {
                        out.moves.push(san.to_string());
                        out.clocks.push(None);
                    }
                }
            }
        }
        out
    }

    /// Clock readings aligned with `moves`, only when every ply carries one.
    pub fn move_times(&self) -> Option<Vec<String>> {
        if self.clocks.is_empty() {
            return None;
        }
        self.clocks.iter().cloned().collect()
    }
}

fn find_from(chars: &[char], from: usize, needle: char) -> Option<usize> {
    chars
        .iter()
        .skip(from)
        .position(|c| *c == needle)
        .map(|p| p + from)
}

fn skip_variation(chars: &[char], open: usize) -> usize {
    let mut depth = 0usize;
    let mut i = open;
    while i < chars.len() {
        match chars[i] {
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return i + 1;
                }
            }
            '{' => {
                i = find_from(chars, i + 1, '}').unwrap_or(chars.len());
            }
            _ => {}
        }
        i += 1;
    }
    chars.len()
}

/// Strips move numbers (`12.`, `12...`, `12.e4`) and drops NAGs.
fn san_from_token(token: &str) -> Option<&str> {
    if token.starts_with('$') {
        return None;
    }
    let san = if token.starts_with(|c: char| c.is_ascii_digit()) {
        let rest = token.trim_start_matches(|c: char| c.is_ascii_digit());
        if !rest.starts_with('.') {
            return None;
        }
        rest.trim_start_matches('.')
    } else {
        token
    };
    (!san.is_empty()).then_some(san)
}

fn clock_annotation(comment: &str) -> Option<String> {
    let start = comment.find("[%clk")? + "[%clk".len();
    let rest = &comment[start..];
    let end = rest.find(']')?;
    clock_to_hhmmss(rest[..end].trim())
}

/// `H:MM:SS(.f)` or `MM:SS` clock reading to `HH:MM:SS`, fraction truncated.
pub fn clock_to_hhmmss(raw: &str) -> Option<String> {
    let parts: Vec<&str> = raw.trim().split(':').collect();
    let (h, m, s) = match parts.as_slice() {
        [h, m, s] => (*h, *m, *s),
        [m, s] => ("0", *m, *s),
        _ => return None,
    };
    let seconds = s.split('.').next()?;
    let h: u64 = h.parse().ok()?;
    let m: u64 = m.parse().ok()?;
    let s: u64 = seconds.parse().ok()?;
    if m >= 60 || s >= 60 {
        return None;
    }
    Some(format!("{h:02}:{m:02}:{s:02}"))
}

/// Integer truncation: 125000 cs is 1250 s, `00:20:50`.
pub fn centiseconds_to_hhmmss(centiseconds: u64) -> String {
    let total_seconds = centiseconds / 100;
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

/// One white ply plus one black ply; a dangling white ply is truncated away.
pub fn full_moves(plies: usize) -> u32 {
    (plies / 2) as u32
}

pub fn millis_to_datetime(ms: i64) -> Option<String> {
    DateTime::<Utc>::from_timestamp_millis(ms).map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
}

/// PGN `YYYY.MM.DD` date plus `HH:MM:SS` time.
pub fn pgn_datetime(date: &str, time: &str) -> Option<String> {
    let date = NaiveDate::parse_from_str(&date.replace('.', "-"), "%Y-%m-%d").ok()?;
    let time = NaiveTime::parse_from_str(time, "%H:%M:%S").ok()?;
    Some(date.and_time(time).format("%Y-%m-%d %H:%M:%S").to_string())
}

/// Temporal and move columns of a row. Either fully populated from a played
/// game or entirely null.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Timeline {
    pub start_datetime: Option<String>,
    pub end_datetime: Option<String>,
    pub moves: Option<Vec<String>>,
    pub move_times: Option<Vec<String>>,
    pub total_moves: Option<u32>,
}

impl Timeline {
    pub fn not_started() -> Self {
        Self::default()
    }

    /// Zero plies collapses to `not_started`; mismatched clock lists are dropped.
    pub fn played(
        start_datetime: Option<String>,
        end_datetime: Option<String>,
        moves: Vec<String>,
        move_times: Option<Vec<String>>,
    ) -> Self {
        if moves.is_empty() {
            return Self::not_started();
        }
        let move_times = move_times.filter(|t| t.len() == moves.len());
        Self {
            start_datetime,
            end_datetime,
            total_moves: Some(full_moves(moves.len())),
            moves: Some(moves),
            move_times,
        }
    }

    pub fn is_started(&self) -> bool {
        self.moves.is_some()
    }
}
