//! Break slots and picking the one closest to the wall clock.
//!
//! A slot is named by a zero-padded 24-hour `HHMM` label ("1430").  Labels
//! carry no date or timezone: they always mean local time *today*, so a slot
//! just after midnight is far away from a clock just before midnight.

use chrono::{NaiveDateTime, NaiveTime, TimeDelta};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SlotError {
    #[error("invalid slot label {0:?}: expected HHMM")]
    InvalidLabel(String),
    #[error("no break slots to choose from")]
    EmptyCandidateSet,
}

/// A validated `HHMM` slot label.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SlotLabel {
    label: String,
    time: NaiveTime,
}

impl SlotLabel {
    pub fn parse(label: &str) -> Result<Self, SlotError> {
        let invalid = || SlotError::InvalidLabel(label.to_string());
        if label.len() != 4 || !label.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let hour: u32 = label[..2].parse().map_err(|_| invalid())?;
        let minute: u32 = label[2..].parse().map_err(|_| invalid())?;
        let time = NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(invalid)?;
        Ok(Self {
            label: label.to_string(),
            time,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.label
    }

    pub fn time(&self) -> NaiveTime {
        self.time
    }

    /// Absolute distance between `now` and this slot on `now`'s calendar day.
    pub fn distance_from(&self, now: NaiveDateTime) -> TimeDelta {
        let slot_at = now.date().and_time(self.time());
        (now - slot_at).abs()
    }
}

impl FromStr for SlotLabel {
    type Err = SlotError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SlotLabel {
    type Error = SlotError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SlotLabel> for String {
    fn from(slot: SlotLabel) -> Self {
        slot.label
    }
}

impl fmt::Display for SlotLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

/// Pick the candidate nearest to `now`.  On an exact tie the candidate seen
/// first wins.
pub fn select_closest(candidates: &[SlotLabel], now: NaiveDateTime) -> Result<&SlotLabel, SlotError> {
    let mut closest: Option<(&SlotLabel, TimeDelta)> = None;
    for candidate in candidates {
        let distance = candidate.distance_from(now);
        match closest {
            Some((_, best)) if distance >= best => {}
            _ => closest = Some((candidate, distance)),
        }
    }
    closest
        .map(|(slot, _)| slot)
        .ok_or(SlotError::EmptyCandidateSet)
}
