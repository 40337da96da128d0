// Calendar data model and the range-availability decision shared by search and booking checks

use chrono::{Duration as DateDuration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

pub const ISO_DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AvailabilityError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

// A requested stay. The check-out date is exclusive and is never a stay night.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct StayWindow {
    check_in: NaiveDate,
    check_out: NaiveDate,
}

impl StayWindow {
    pub fn new(check_in: NaiveDate, check_out: NaiveDate) -> Result<Self, AvailabilityError> {
        if check_out <= check_in {
            return Err(AvailabilityError::InvalidInput(format!(
                "check-out {} must be after check-in {}",
                check_out, check_in
            )));
        }
        Ok(Self {
            check_in,
            check_out,
        })
    }

    // Dates cross the boundary as YYYY-MM-DD only
    pub fn parse(check_in: &str, check_out: &str) -> Result<Self, AvailabilityError> {
        Self::new(parse_iso_date(check_in)?, parse_iso_date(check_out)?)
    }

    pub fn check_in(&self) -> NaiveDate {
        self.check_in
    }

    pub fn check_out(&self) -> NaiveDate {
        self.check_out
    }

    pub fn night_count(&self) -> usize {
        (self.check_out - self.check_in).num_days() as usize
    }

    pub fn last_night(&self) -> NaiveDate {
        self.check_out - DateDuration::days(1)
    }

    pub fn nights(&self) -> impl Iterator<Item = NaiveDate> {
        let check_in = self.check_in;
        (0..self.night_count() as i64).map(move |offset| check_in + DateDuration::days(offset))
    }

    pub fn contains_night(&self, date: NaiveDate) -> bool {
        date >= self.check_in && date < self.check_out
    }
}

fn parse_iso_date(value: &str) -> Result<NaiveDate, AvailabilityError> {
    let trimmed = value.trim();
    // NaiveDate accepts "2026-1-5"; the boundary contract is zero-padded ISO
    if trimmed.len() != 10 {
        return Err(AvailabilityError::InvalidInput(format!(
            "expected YYYY-MM-DD, got {:?}",
            value
        )));
    }
    NaiveDate::parse_from_str(trimmed, ISO_DATE_FORMAT).map_err(|e| {
        AvailabilityError::InvalidInput(format!("invalid date {:?}: {}", value, e))
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DayStatus {
    Available,
    Unavailable,
    Unknown,
}

// One normalized upstream calendar entry. Built by the normalizer, never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarDay {
    pub date: NaiveDate,
    pub price: Option<f64>,
    pub allotment: Option<u32>,
    pub status: DayStatus,
    pub check_in_allowed: bool,
    pub check_out_allowed: bool,
    pub min_stay: u32,
}

impl CalendarDay {
    pub fn is_bookable(&self) -> bool {
        match self.allotment {
            Some(units) => units > 0,
            None => self.status == DayStatus::Available,
        }
    }

    pub fn has_restrictions(&self) -> bool {
        !self.check_in_allowed || !self.check_out_allowed || self.min_stay > 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluationMode {
    // Search and browse: arrival/departure flags are ignored
    Loose,
    // Right before a reservation commitment
    Strict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AvailabilityReason {
    NoCalendarData,
    PartialCalendarData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListingAvailabilityResult {
    pub listing_id: String,
    pub available: Option<bool>,
    pub nightly_from: Option<f64>,
    pub days_count: usize,
    pub has_restrictions: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reason: Option<AvailabilityReason>,
}

impl ListingAvailabilityResult {
    pub fn unknown(listing_id: impl Into<String>) -> Self {
        Self {
            listing_id: listing_id.into(),
            available: None,
            nightly_from: None,
            days_count: 0,
            has_restrictions: false,
            reason: Some(AvailabilityReason::NoCalendarData),
        }
    }
}

// Index days by date; the first entry for a date wins
fn index_by_date(days: &[CalendarDay]) -> HashMap<NaiveDate, &CalendarDay> {
    let mut index = HashMap::with_capacity(days.len());
    for day in days {
        index.entry(day.date).or_insert(day);
    }
    index
}

// Checkout restrictions are read from the last stay night: the checkout date
// itself is never requested from upstream.
pub fn evaluate_range(days: &[CalendarDay], window: &StayWindow, mode: EvaluationMode) -> bool {
    let index = index_by_date(days);
    let first_night = window.check_in();
    let last_night = window.last_night();

    window.nights().all(|night| {
        let Some(day) = index.get(&night) else {
            return false;
        };
        if !day.is_bookable() {
            return false;
        }
        if mode == EvaluationMode::Strict {
            if night == first_night && !day.check_in_allowed {
                return false;
            }
            if night == last_night && !day.check_out_allowed {
                return false;
            }
        }
        true
    })
}

// Loose-mode summary for a single listing
pub fn summarize_listing(
    listing_id: &str,
    days: &[CalendarDay],
    window: &StayWindow,
) -> ListingAvailabilityResult {
    let index = index_by_date(days);
    let night_days: Vec<&CalendarDay> = window
        .nights()
        .filter_map(|night| index.get(&night).copied())
        .collect();

    if night_days.is_empty() {
        return ListingAvailabilityResult::unknown(listing_id);
    }

    let nightly_from = night_days
        .iter()
        .filter_map(|day| day.price)
        .filter(|price| *price > 0.0)
        .fold(None, |lowest: Option<f64>, price| match lowest {
            Some(current) if current <= price => Some(current),
            _ => Some(price),
        });
    let has_restrictions = night_days.iter().any(|day| day.has_restrictions());
    let available = evaluate_range(days, window, EvaluationMode::Loose);
    let reason = if !available && night_days.len() < window.night_count() {
        Some(AvailabilityReason::PartialCalendarData)
    } else {
        None
    };

    ListingAvailabilityResult {
        listing_id: listing_id.to_string(),
        available: Some(available),
        nightly_from,
        days_count: night_days.len(),
        has_restrictions,
        reason,
    }
}
