//! Folder-layout adapters: name grammars, key derivation, tree walking and
//! per-record content fetching.

use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use chrono::{NaiveDate, NaiveTime};
use drev_core::{CandidateFolder, DecodedName, Direction};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod content;
pub mod walker;

pub use content::{
    AudioLocator, ContentFetcher, ContentLayout, ContentOutcome, FetchedContent, FileMatch,
    ParsedMetrics,
};
pub use walker::RemoteTreeWalker;

pub const CRATE_NAME: &str = "drev-adapters";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("no date could be decoded for `{path}`")]
    UndecodableDate { path: String },
}

/// Naming convention of one deployment's remote tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GrammarKind {
    CallFolder,
    DottedDate,
    HourRange,
}

impl GrammarKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GrammarKind::CallFolder => "call_folder",
            GrammarKind::DottedDate => "dotted_date",
            GrammarKind::HourRange => "hour_range",
        }
    }
}

impl fmt::Display for GrammarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GrammarKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "call_folder" => Ok(GrammarKind::CallFolder),
            "dotted_date" => Ok(GrammarKind::DottedDate),
            "hour_range" => Ok(GrammarKind::HourRange),
            other => Err(anyhow!("unknown grammar `{other}`")),
        }
    }
}

/// How the idempotency key of a record folder is derived.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    /// The leaf folder name, which embeds a globally unique id.
    EmbeddedId,
    /// The normalized `date/group/leaf` path below the source root.
    RelativePath,
}

pub fn derive_key(strategy: KeyStrategy, candidate: &CandidateFolder) -> String {
    match strategy {
        KeyStrategy::EmbeddedId => candidate.leaf.trim().to_string(),
        KeyStrategy::RelativePath => candidate.relative_path(),
    }
}

pub trait NameGrammar: Send + Sync {
    fn kind(&self) -> GrammarKind;

    /// Intermediate folder levels between the date folder and the record folder.
    fn group_depth(&self) -> usize;

    fn default_key_strategy(&self) -> KeyStrategy;

    fn decode(&self, candidate: &CandidateFolder) -> Result<DecodedName, DecodeError>;
}

pub fn grammar_for(kind: GrammarKind) -> Box<dyn NameGrammar> {
    match kind {
        GrammarKind::CallFolder => Box::new(CallFolderGrammar),
        GrammarKind::DottedDate => Box::new(DottedDateGrammar),
        GrammarKind::HourRange => Box::new(HourRangeGrammar),
    }
}

fn undecodable(candidate: &CandidateFolder) -> DecodeError {
    DecodeError::UndecodableDate {
        path: candidate.relative_path(),
    }
}

fn digits(s: &str, max_len: usize) -> Option<u32> {
    if s.is_empty() || s.len() > max_len || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

fn split3(s: &str, sep: char) -> Option<(&str, &str, &str)> {
    let mut parts = s.split(sep);
    let triple = (parts.next()?, parts.next()?, parts.next()?);
    parts.next().is_none().then_some(triple)
}

fn ymd(year: i32, month: &str, day: &str) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, digits(month, 2)?, digits(day, 2)?)
}

/// Parses a date folder name: `YYYY-MM-DD`, `DD-MM-YYYY`, `DD.MM.YY` or
/// `DD.MM.YYYY`. Two-digit years are in the 2000s.
pub fn parse_date_folder(name: &str) -> Option<NaiveDate> {
    let name = name.trim();
    if let Some((a, b, c)) = split3(name, '-') {
        if a.len() == 4 {
            return ymd(digits(a, 4)? as i32, b, c);
        }
        if c.len() == 4 {
            return ymd(digits(c, 4)? as i32, b, a);
        }
        return None;
    }
    let (day, month, year) = split3(name, '.')?;
    let year = match year.len() {
        2 => 2000 + digits(year, 2)? as i32,
        4 => digits(year, 4)? as i32,
        _ => return None,
    };
    ymd(year, month, day)
}

fn six_digits(token: &str) -> Option<(u32, u32, u32)> {
    if token.len() != 6 || !token.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((
        digits(&token[0..2], 2)?,
        digits(&token[2..4], 2)?,
        digits(&token[4..6], 2)?,
    ))
}

fn hms(h: u32, m: u32, s: u32) -> Option<NaiveTime> {
    NaiveTime::from_hms_opt(h, m, s)
}

fn is_phone_like(token: &str) -> bool {
    let number = token.strip_prefix('+').unwrap_or(token);
    number.len() > 5 && number.bytes().all(|b| b.is_ascii_digit())
}

/// Flat `direction-phone-YYMMDD-HHMMSS` record folders directly under date
/// folders. `s` tokens are placeholders and never carry data.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallFolderGrammar;

impl NameGrammar for CallFolderGrammar {
    fn kind(&self) -> GrammarKind {
        GrammarKind::CallFolder
    }

    fn group_depth(&self) -> usize {
        0
    }

    fn default_key_strategy(&self) -> KeyStrategy {
        KeyStrategy::EmbeddedId
    }

    fn decode(&self, candidate: &CandidateFolder) -> Result<DecodedName, DecodeError> {
        let leaf = candidate.leaf.trim();
        let tokens = leaf.split('-').map(str::trim).collect::<Vec<_>>();
        let direction = tokens
            .first()
            .map_or(Direction::Unknown, |marker| Direction::from_marker(marker));

        let pairs = tokens
            .windows(2)
            .enumerate()
            .filter_map(|(idx, pair)| Some((idx, six_digits(pair[0])?, six_digits(pair[1])?)))
            .collect::<Vec<_>>();
        let phone_end = pairs.first().map_or(tokens.len(), |(idx, _, _)| *idx);

        let embedded_date = pairs.iter().find_map(|(_, (yy, mm, dd), (h, m, s))| {
            let date = NaiveDate::from_ymd_opt(2000 + *yy as i32, *mm, *dd)?;
            Some((date, hms(*h, *m, *s)))
        });
        let (date, time) = match embedded_date {
            Some((date, time)) => (date, time),
            None => {
                let date = parse_date_folder(&candidate.date_folder)
                    .ok_or_else(|| undecodable(candidate))?;
                let time = pairs.iter().find_map(|(_, _, (h, m, s))| hms(*h, *m, *s));
                (date, time)
            }
        };

        let phone_start = if direction == Direction::Unknown { 0 } else { 1 };
        let phone_number = tokens
            .get(phone_start..phone_end)
            .unwrap_or_default()
            .iter()
            .filter(|t| !t.eq_ignore_ascii_case("s"))
            .find(|t| is_phone_like(t))
            .map(|t| t.to_string());

        Ok(DecodedName {
            date,
            time: time.unwrap_or(NaiveTime::MIN),
            phone_number,
            direction,
            channel: None,
        })
    }
}

/// `DD.MM.YY/<recorder>-HH-MM-SS/<record>` trees.
#[derive(Debug, Clone, Copy, Default)]
pub struct DottedDateGrammar;

impl NameGrammar for DottedDateGrammar {
    fn kind(&self) -> GrammarKind {
        GrammarKind::DottedDate
    }

    fn group_depth(&self) -> usize {
        1
    }

    fn default_key_strategy(&self) -> KeyStrategy {
        KeyStrategy::EmbeddedId
    }

    fn decode(&self, candidate: &CandidateFolder) -> Result<DecodedName, DecodeError> {
        let date = parse_date_folder(&candidate.date_folder).ok_or_else(|| undecodable(candidate))?;
        let mut decoded = DecodedName::on_date(date);

        let Some(group) = candidate.innermost_group().map(str::trim) else {
            return Ok(decoded);
        };
        let tokens = group.split('-').collect::<Vec<_>>();
        if tokens.len() >= 3 {
            let tail = &tokens[tokens.len() - 3..];
            let time = (|| hms(digits(tail[0], 2)?, digits(tail[1], 2)?, digits(tail[2], 2)?))();
            if let Some(time) = time {
                decoded.time = time;
                if tokens.len() > 3 && !tokens[0].is_empty() {
                    decoded.channel = Some(tokens[0].to_string());
                }
            }
        }
        Ok(decoded)
    }
}

/// `<date>/<DD-MM-YYYY>_<HH-HH>/<..._minute>` trees: the group names an hour
/// window and each record sits at a minute offset inside it.
#[derive(Debug, Clone, Copy, Default)]
pub struct HourRangeGrammar;

fn hour_range(token: &str) -> Option<(u32, u32)> {
    let (start, end) = token.split_once('-')?;
    let start = digits(start, 2)?;
    let end = digits(end, 2)?;
    (start < 24 && end <= 24).then_some((start, end))
}

impl NameGrammar for HourRangeGrammar {
    fn kind(&self) -> GrammarKind {
        GrammarKind::HourRange
    }

    fn group_depth(&self) -> usize {
        1
    }

    fn default_key_strategy(&self) -> KeyStrategy {
        KeyStrategy::RelativePath
    }

    fn decode(&self, candidate: &CandidateFolder) -> Result<DecodedName, DecodeError> {
        let group_tokens = candidate
            .innermost_group()
            .map(|g| g.trim().split('_').collect::<Vec<_>>())
            .unwrap_or_default();

        let date = group_tokens
            .iter()
            .find_map(|t| parse_date_folder(t))
            .or_else(|| parse_date_folder(&candidate.date_folder))
            .ok_or_else(|| undecodable(candidate))?;
        let mut decoded = DecodedName::on_date(date);

        let Some((start_hour, _)) = group_tokens.iter().find_map(|t| hour_range(t)) else {
            return Ok(decoded);
        };
        let offset_minutes = candidate
            .leaf
            .trim()
            .rsplit('_')
            .find_map(|t| digits(t, 6))
            .unwrap_or(0);

        let seconds = ((start_hour * 60 + offset_minutes) * 60).min(86_399);
        decoded.time = NaiveTime::from_num_seconds_from_midnight_opt(seconds, 0)
            .unwrap_or(NaiveTime::MIN);
        Ok(decoded)
    }
}
