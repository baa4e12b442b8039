//! Event log inspection command.

use chrono::{DateTime, TimeDelta, Utc};
use clap::Args;
use keystone_core::error::AppError;
use keystone_events::{Event, EventFilter, EventStore};
use serde::Serialize;
use tabled::Tabled;

use crate::output::{self, OutputFormat};

/// Arguments for `keystone events`
#[derive(Debug, Args)]
pub struct EventsArgs {
    /// Only events of this type
    #[arg(short = 't', long = "type")]
    pub event_type: Option<String>,

    /// Only events from this source
    #[arg(short, long)]
    pub source: Option<String>,

    /// Only events newer than this many minutes
    #[arg(long)]
    pub since_minutes: Option<i64>,

    /// Maximum number of events shown (most recent)
    #[arg(short, long, default_value = "50")]
    pub limit: usize,
}

/// Event row for table display
#[derive(Debug, Serialize, Tabled)]
pub struct EventRow {
    #[tabled(rename = "Time")]
    pub timestamp: String,
    #[tabled(rename = "Type")]
    pub event_type: String,
    #[tabled(rename = "Source")]
    pub source: String,
    #[tabled(rename = "Payload")]
    pub payload: String,
}

impl From<&Event> for EventRow {
    fn from(event: &Event) -> Self {
        Self {
            timestamp: event.timestamp.format("%Y-%m-%d %H:%M:%S%.3f").to_string(),
            event_type: event.event_type.clone(),
            source: event.source.clone(),
            payload: event.payload.to_string(),
        }
    }
}

fn build_filter(args: &EventsArgs) -> Option<EventFilter> {
    if args.event_type.is_none() && args.source.is_none() {
        return None;
    }
    let mut filter = EventFilter::new();
    if let Some(event_type) = &args.event_type {
        filter = filter.event_type(event_type.clone());
    }
    if let Some(source) = &args.source {
        filter = filter.source(source.clone());
    }
    Some(filter)
}

fn since(args: &EventsArgs) -> DateTime<Utc> {
    args.since_minutes
        .and_then(TimeDelta::try_minutes)
        .and_then(|window| Utc::now().checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Execute events command
pub async fn execute(
    args: &EventsArgs,
    config_path: &str,
    format: OutputFormat,
) -> Result<(), AppError> {
    let runtime = super::Runtime::open(config_path).await?;
    let filter = build_filter(args);
    let events = runtime
        .events
        .query(since(args), None, filter.as_ref())
        .await;
    runtime.close().await;

    let events = events?;
    let skip = events.len().saturating_sub(args.limit);
    let rows: Vec<EventRow> = events[skip..].iter().map(EventRow::from).collect();
    output::print_list(&rows, format);
    Ok(())
}
