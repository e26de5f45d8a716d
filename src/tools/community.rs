//! # Community Listings
//!
//! Road construction notices and community events for the configured city,
//! filtered to what is still upcoming and labelled for display.
//!
//! ## Date handling:
//! - Construction is kept when its start date (or end date, if there is no
//!   start) is today or later. Records with neither date are always kept.
//! - Events are kept when their start date is today or later. Undated events
//!   are always kept.
//! - Labels are regenerated from the ISO dates ("Dec 11", "Sat, Oct 24"); the
//!   stored label is the fallback when there is no date.

use crate::error::ToolError;
use crate::session::events::DisplayInfo;
use crate::session::protocol::FunctionDeclaration;
use crate::tools::{ToolCallRequest, ToolHandler, ToolName};

use async_trait::async_trait;
use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConstructionStatus {
    Ongoing,
    Scheduled,
    Completed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConstructionUpdate {
    pub id: String,
    pub location: String,
    pub description: String,
    pub status: ConstructionStatus,
    pub completion_estimate: String,
    #[serde(rename = "startDateISO", default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<NaiveDate>,
    #[serde(rename = "endDateISO", default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventData {
    pub id: String,
    pub title: String,
    pub location: String,
    pub date: String,
    pub description: String,
    #[serde(rename = "startDateISO", default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<NaiveDate>,
}

/// Source of raw listings.
pub trait CommunityData: Send + Sync {
    fn construction(&self) -> Vec<ConstructionUpdate>;
    fn events(&self) -> Vec<EventData>;
}

/// Built-in listings for Brantford.
#[derive(Debug, Default, Clone, Copy)]
pub struct BrantfordListings;

impl CommunityData for BrantfordListings {
    fn construction(&self) -> Vec<ConstructionUpdate> {
        vec![
            ConstructionUpdate {
                id: "c1".to_string(),
                location: "Colborne St East & Stanley St".to_string(),
                description: "Sewer separation and new sidewalks. Expect lane reductions during the day."
                    .to_string(),
                status: ConstructionStatus::Ongoing,
                completion_estimate: "Dec 11".to_string(),
                start_date: NaiveDate::from_ymd_opt(2026, 10, 26),
                end_date: NaiveDate::from_ymd_opt(2026, 12, 11),
            },
            ConstructionUpdate {
                id: "c2".to_string(),
                location: "Brant Ave bridge approach".to_string(),
                description: "Expansion joint replacement with single-lane traffic overnight.".to_string(),
                status: ConstructionStatus::Scheduled,
                completion_estimate: "Nov 20".to_string(),
                start_date: NaiveDate::from_ymd_opt(2026, 11, 2),
                end_date: NaiveDate::from_ymd_opt(2026, 11, 20),
            },
            ConstructionUpdate {
                id: "c3".to_string(),
                location: "Lynden Rd & Wayne Gretzky Pkwy".to_string(),
                description: "Signal upgrades and a longer left-turn lane onto the parkway.".to_string(),
                status: ConstructionStatus::Scheduled,
                completion_estimate: "Apr 30".to_string(),
                start_date: NaiveDate::from_ymd_opt(2027, 3, 15),
                end_date: NaiveDate::from_ymd_opt(2027, 4, 30),
            },
        ]
    }

    fn events(&self) -> Vec<EventData> {
        vec![
            EventData {
                id: "e1".to_string(),
                title: "Harvest Lantern Walk".to_string(),
                location: "Glenhyrst Art Gallery grounds".to_string(),
                date: "Sat, Oct 24".to_string(),
                description: "Evening walk through lantern installations with cider and live fiddle music."
                    .to_string(),
                start_date: NaiveDate::from_ymd_opt(2026, 10, 24),
            },
            EventData {
                id: "e2".to_string(),
                title: "Holiday Market".to_string(),
                location: "Harmony Square".to_string(),
                date: "Sat, Dec 5".to_string(),
                description: "Local makers, warm food stalls, and a tree lighting at dusk.".to_string(),
                start_date: NaiveDate::from_ymd_opt(2026, 12, 5),
            },
            EventData {
                id: "e3".to_string(),
                title: "Grand River Winter Walk".to_string(),
                location: "Grand River Trails".to_string(),
                date: "Sun, Jan 10".to_string(),
                description: "Guided 5 km walk with Parks staff and hot cider stations.".to_string(),
                start_date: NaiveDate::from_ymd_opt(2027, 1, 10),
            },
        ]
    }
}

/// Construction that has not started yet (or has no dates), relabelled.
pub fn upcoming_construction(records: Vec<ConstructionUpdate>, today: NaiveDate) -> Vec<ConstructionUpdate> {
    records
        .into_iter()
        .filter(|item| match item.start_date.or(item.end_date) {
            Some(reference) => reference >= today,
            None => true,
        })
        .map(|mut item| {
            if let Some(end) = item.end_date {
                item.completion_estimate = end.format("%b %-d").to_string();
            }
            item
        })
        .collect()
}

/// Events on or after `today` (plus undated ones), relabelled.
pub fn upcoming_events(records: Vec<EventData>, today: NaiveDate) -> Vec<EventData> {
    records
        .into_iter()
        .filter(|event| event.start_date.map_or(true, |start| start >= today))
        .map(|mut event| {
            if let Some(start) = event.start_date {
                event.date = start.format("%a, %b %-d").to_string();
            }
            event
        })
        .collect()
}

/// Today's date in the local timezone.
pub type Today = Arc<dyn Fn() -> NaiveDate + Send + Sync>;

fn local_today() -> Today {
    Arc::new(|| Local::now().date_naive())
}

/// `getConstructionUpdates` tool.
pub struct GetConstructionUpdates {
    data: Arc<dyn CommunityData>,
    city: String,
    today: Today,
}

impl GetConstructionUpdates {
    pub fn new(data: Arc<dyn CommunityData>, city: impl Into<String>) -> Self {
        Self {
            data,
            city: city.into(),
            today: local_today(),
        }
    }

    /// Pin the date used for filtering.
    pub fn with_today(mut self, today: Today) -> Self {
        self.today = today;
        self
    }
}

#[async_trait]
impl ToolHandler for GetConstructionUpdates {
    fn declaration(&self) -> FunctionDeclaration {
        FunctionDeclaration::with_location(
            ToolName::GetConstructionUpdates.as_str(),
            &format!(
                "Get current road construction updates and traffic alerts for {}.",
                self.city
            ),
            "The city name",
        )
    }

    async fn call(&self, _request: &ToolCallRequest) -> Result<DisplayInfo, ToolError> {
        let updates = upcoming_construction(self.data.construction(), (self.today)());
        Ok(DisplayInfo::Construction(updates))
    }
}

/// `getUpcomingEvents` tool.
pub struct GetUpcomingEvents {
    data: Arc<dyn CommunityData>,
    city: String,
    today: Today,
}

impl GetUpcomingEvents {
    pub fn new(data: Arc<dyn CommunityData>, city: impl Into<String>) -> Self {
        Self {
            data,
            city: city.into(),
            today: local_today(),
        }
    }

    pub fn with_today(mut self, today: Today) -> Self {
        self.today = today;
        self
    }
}

#[async_trait]
impl ToolHandler for GetUpcomingEvents {
    fn declaration(&self) -> FunctionDeclaration {
        FunctionDeclaration::with_location(
            ToolName::GetUpcomingEvents.as_str(),
            &format!("Get a list of upcoming community events in {}.", self.city),
            "The city name",
        )
    }

    async fn call(&self, _request: &ToolCallRequest) -> Result<DisplayInfo, ToolError> {
        let events = upcoming_events(self.data.events(), (self.today)());
        Ok(DisplayInfo::Events(events))
    }
}
