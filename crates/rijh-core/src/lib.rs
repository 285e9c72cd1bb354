//! Core domain model and text classifiers for RIJH.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "rijh-core";

/// Search terms harvested on every run. Each produced record carries the term
/// that found it as its `category`.
pub const IT_JOB_TITLES: &[&str] = &[
    "Backend Developer",
    "Frontend Developer",
    "Machine Learning Engineer",
];

/// Posted-date text recorded when a listing card carries no date element.
pub const POSTED_RECENTLY: &str = "Recently";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExperienceLevel {
    Entry,
    Mid,
    Senior,
}

impl ExperienceLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExperienceLevel::Entry => "Entry Level",
            ExperienceLevel::Mid => "Mid Level",
            ExperienceLevel::Senior => "Senior Level",
        }
    }
}

impl std::fmt::Display for ExperienceLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkType {
    Remote,
    Hybrid,
    OnSite,
}

impl WorkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkType::Remote => "Remote",
            WorkType::Hybrid => "Hybrid",
            WorkType::OnSite => "On-site",
        }
    }
}

impl std::fmt::Display for WorkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One harvested listing, normalized and recency-filtered.
///
/// Coordinates are deliberately not part of the record; geocoding is a
/// best-effort enrichment applied by each sink writer, and records stay
/// immutable once extracted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub title: String,
    pub company: String,
    pub raw_location: String,
    pub location: String,
    pub experience_level: ExperienceLevel,
    pub work_type: WorkType,
    pub category: String,
    pub posted_date_text: String,
    pub url: String,
    pub scraped_at: DateTime<Utc>,
}

const SENIOR_KEYWORDS: &[&str] = &["senior", "lead", "principal", "manager", "head of"];
const ENTRY_KEYWORDS: &[&str] = &["junior", "entry", "graduate", "trainee"];
const REMOTE_KEYWORDS: &[&str] = &["remote", "work from home", "wfh", "hybrid"];
const RECENT_MARKERS: &[&str] = &[
    "hours ago",
    "hour ago",
    "day ago",
    "1 day ago",
    "2 days ago",
    "3 days ago",
];

/// Regional suffixes stripped in order before the comma cut.
const LOCATION_SUFFIXES: &[&str] = &[
    ", England, United Kingdom",
    ", United Kingdom",
    ", UK",
    " Area, United Kingdom",
    " Area",
];

/// Reduce a raw location string to its city-only form.
///
/// Strips the fixed suffix sequence, drops a leading "Greater ", then keeps
/// whatever precedes the first remaining comma. Total and idempotent.
pub fn clean_location(raw: &str) -> String {
    let mut location = raw.trim();
    for suffix in LOCATION_SUFFIXES {
        if let Some(stripped) = location.strip_suffix(suffix) {
            location = stripped;
        }
    }
    if let Some(stripped) = location.strip_prefix("Greater ") {
        location = stripped;
    }
    match location.split_once(',') {
        Some((city, _)) => city.trim().to_string(),
        None => location.to_string(),
    }
}

/// Classify a description into an experience tier. Seniority keywords are
/// checked first, so "senior" wins over "graduate" when both appear.
pub fn classify_experience(description: &str) -> ExperienceLevel {
    let text = description.to_lowercase();
    if SENIOR_KEYWORDS.iter().any(|kw| text.contains(kw)) {
        ExperienceLevel::Senior
    } else if ENTRY_KEYWORDS.iter().any(|kw| text.contains(kw)) {
        ExperienceLevel::Entry
    } else {
        ExperienceLevel::Mid
    }
}

/// Classify a description into a work arrangement. "hybrid" takes priority
/// over the other remote markers.
pub fn classify_work_type(description: &str) -> WorkType {
    let text = description.to_lowercase();
    if REMOTE_KEYWORDS.iter().any(|kw| text.contains(kw)) {
        if text.contains("hybrid") {
            WorkType::Hybrid
        } else {
            WorkType::Remote
        }
    } else {
        WorkType::OnSite
    }
}

/// Freshness window: anything posted within the last three days passes.
/// Unparseable or empty text fails.
pub fn is_recent(posted_date_text: &str) -> bool {
    let text = posted_date_text.to_lowercase();
    RECENT_MARKERS.iter().any(|marker| text.contains(marker))
}
