use std::io::{IsTerminal, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use chanlink_channel::{ChannelType, SessionId};
use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

/// One response observed by `chanlink send`.
#[derive(Debug, Serialize)]
pub struct ResponseRecord<'a> {
    pub session_id: &'a str,
    pub channel: &'a str,
    pub index: usize,
    pub payload: &'a str,
    pub timestamp: String,
}

impl<'a> ResponseRecord<'a> {
    pub fn new(
        session_id: Option<&'a SessionId>,
        channel: ChannelType,
        index: usize,
        payload: &'a str,
    ) -> Self {
        Self {
            session_id: session_id.map(SessionId::as_str).unwrap_or("-"),
            channel: channel.as_str(),
            index,
            payload,
            timestamp: now_unix_seconds(),
        }
    }
}

/// How a `chanlink send` round ended.
#[derive(Debug, Serialize)]
pub struct RoundSummary {
    pub outcome: &'static str,
    pub responses: usize,
    pub upgraded: bool,
    pub fell_back: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn print_response(record: &ResponseRecord<'_>, format: OutputFormat) {
    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string(record).unwrap_or_else(|_| "{}".to_string())
        ),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["#", "CHANNEL", "SESSION", "PAYLOAD"])
                .add_row(vec![
                    record.index.to_string(),
                    record.channel.to_string(),
                    record.session_id.to_string(),
                    record.payload.to_string(),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => println!(
            "#{} channel={} session={} payload={}",
            record.index, record.channel, record.session_id, record.payload
        ),
        OutputFormat::Raw => {
            let mut out = std::io::stdout();
            let _ = out.write_all(record.payload.as_bytes());
            let _ = out.write_all(b"\n");
            let _ = out.flush();
        }
    }
}

pub fn print_summary(summary: &RoundSummary, format: OutputFormat) {
    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string(summary).unwrap_or_else(|_| "{}".to_string())
        ),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["OUTCOME", "RESPONSES", "UPGRADED", "FELL BACK", "ERROR"])
                .add_row(vec![
                    summary.outcome.to_string(),
                    summary.responses.to_string(),
                    summary.upgraded.to_string(),
                    summary.fell_back.to_string(),
                    summary.error.clone().unwrap_or_default(),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => println!(
            "outcome={} responses={} upgraded={} fell_back={}{}",
            summary.outcome,
            summary.responses,
            summary.upgraded,
            summary.fell_back,
            summary
                .error
                .as_deref()
                .map(|e| format!(" error={e}"))
                .unwrap_or_default()
        ),
        OutputFormat::Raw => {}
    }
}

fn now_unix_seconds() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}
