use std::fmt::{Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{Result as SqlResult, Row};
use serde::{Deserialize, Serialize};

pub(crate) const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Timestamps are persisted as RFC3339 TEXT in UTC at second precision so
/// that SQL string comparison agrees with chronological order.
pub fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

fn required_ts(raw: String) -> SqlResult<DateTime<Utc>> {
    parse_ts(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            raw.len(),
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid timestamp: {raw}"),
            )),
        )
    })
}

fn optional_ts(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.as_deref().and_then(parse_ts)
}

fn parse_enum_column<T: FromStr<Err = String>>(raw: String) -> SqlResult<T> {
    T::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            raw.len(),
            rusqlite::types::Type::Text,
            Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
        )
    })
}

fn parse_json_array(raw: Option<String>) -> Vec<String> {
    raw.and_then(|s| serde_json::from_str::<Vec<String>>(&s).ok())
        .unwrap_or_default()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Gmail,
    Outlook,
}

impl Display for Provider {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Gmail => write!(f, "gmail"),
            Self::Outlook => write!(f, "outlook"),
        }
    }
}

impl FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gmail" | "google" => Ok(Self::Gmail),
            "outlook" | "microsoft" => Ok(Self::Outlook),
            other => Err(format!("invalid provider: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Idle,
    Syncing,
    Error,
    RequiresReauth,
}

impl Display for SyncStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Syncing => write!(f, "syncing"),
            Self::Error => write!(f, "error"),
            Self::RequiresReauth => write!(f, "requires_reauth"),
        }
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "idle" => Ok(Self::Idle),
            "syncing" => Ok(Self::Syncing),
            "error" => Ok(Self::Error),
            "requires_reauth" => Ok(Self::RequiresReauth),
            other => Err(format!("invalid sync status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SyncType {
    Full,
    Incremental,
}

impl Display for SyncType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Incremental => write!(f, "incremental"),
        }
    }
}

impl FromStr for SyncType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(Self::Full),
            "incremental" => Ok(Self::Incremental),
            other => Err(format!("invalid sync type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("invalid job status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Active,
    Processing,
    Inactive,
    Error,
    Stopped,
}

impl Display for WorkerStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Processing => write!(f, "processing"),
            Self::Inactive => write!(f, "inactive"),
            Self::Error => write!(f, "error"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

impl FromStr for WorkerStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "processing" => Ok(Self::Processing),
            "inactive" => Ok(Self::Inactive),
            "error" => Ok(Self::Error),
            "stopped" => Ok(Self::Stopped),
            other => Err(format!("invalid worker status: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FolderType {
    Inbox,
    Sent,
    Drafts,
    Archive,
    Trash,
    Custom,
}

impl Display for FolderType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inbox => write!(f, "inbox"),
            Self::Sent => write!(f, "sent"),
            Self::Drafts => write!(f, "drafts"),
            Self::Archive => write!(f, "archive"),
            Self::Trash => write!(f, "trash"),
            Self::Custom => write!(f, "custom"),
        }
    }
}

impl FromStr for FolderType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inbox" => Ok(Self::Inbox),
            "sent" => Ok(Self::Sent),
            "drafts" | "draft" => Ok(Self::Drafts),
            "archive" => Ok(Self::Archive),
            "trash" => Ok(Self::Trash),
            "custom" => Ok(Self::Custom),
            other => Err(format!("invalid folder type: {other}")),
        }
    }
}

/// A user's link to one provider mailbox.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmailConnection {
    pub id: String,
    pub user_id: String,
    pub provider: Provider,
    pub email: String,
    pub access_token: String,
    pub refresh_token: String,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub latest_history_id: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub sync_frequency_minutes: i64,
    pub sync_batch_size: i64,
    pub sync_enabled: bool,
    pub sync_status: SyncStatus,
    pub sync_in_progress: bool,
    pub sync_error: Option<String>,
    pub last_sync_error_at: Option<DateTime<Utc>>,
    pub watch_resource_id: Option<String>,
    pub watch_history_id: Option<String>,
    pub watch_expiration: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Folder {
    pub id: String,
    pub user_id: String,
    pub connection_id: String,
    pub name: String,
    pub folder_type: FolderType,
    pub provider_folder_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttachmentMeta {
    pub name: String,
    pub mime_type: Option<String>,
    pub size_bytes: Option<i64>,
}

/// Local mirror of a provider message. One write contract regardless of
/// which sync path produced it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedMessage {
    pub id: String,
    pub user_id: String,
    pub connection_id: String,
    pub provider_email_id: String,
    pub folder_id: Option<String>,
    pub subject: Option<String>,
    pub sender: Option<String>,
    pub recipients: Vec<String>,
    pub cc: Vec<String>,
    pub date: Option<String>,
    pub body_html: Option<String>,
    pub body_preview: Option<String>,
    pub read: bool,
    pub starred: bool,
    pub attachments: Vec<AttachmentMeta>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncJob {
    pub id: String,
    pub user_id: String,
    pub connection_id: String,
    pub provider: Provider,
    pub sync_type: SyncType,
    pub status: JobStatus,
    pub priority: i64,
    pub progress: i64,
    pub folders_completed: i64,
    pub total_folders: i64,
    pub messages_synced: i64,
    pub current_folder: Option<String>,
    pub status_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub latest_history_id: Option<String>,
    pub worker_id: Option<String>,
    pub retry_count: i64,
    pub max_retries: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerRecord {
    pub worker_id: String,
    pub hostname: String,
    pub status: WorkerStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub current_job_id: Option<String>,
    pub jobs_processed_count: i64,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncLock {
    pub id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl EmailConnection {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            provider: parse_enum_column(row.get::<_, String>("provider")?)?,
            email: row.get("email")?,
            access_token: row.get("access_token")?,
            refresh_token: row.get("refresh_token")?,
            token_expires_at: optional_ts(row.get("token_expires_at")?),
            latest_history_id: row.get("latest_history_id")?,
            last_synced_at: optional_ts(row.get("last_synced_at")?),
            sync_frequency_minutes: row.get("sync_frequency_minutes")?,
            sync_batch_size: row.get("sync_batch_size")?,
            sync_enabled: row.get("sync_enabled")?,
            sync_status: parse_enum_column(row.get::<_, String>("sync_status")?)?,
            sync_in_progress: row.get("sync_in_progress")?,
            sync_error: row.get("sync_error")?,
            last_sync_error_at: optional_ts(row.get("last_sync_error_at")?),
            watch_resource_id: row.get("watch_resource_id")?,
            watch_history_id: row.get("watch_history_id")?,
            watch_expiration: optional_ts(row.get("watch_expiration")?),
            created_at: required_ts(row.get("created_at")?)?,
        })
    }
}

impl Folder {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            connection_id: row.get("connection_id")?,
            name: row.get("name")?,
            folder_type: parse_enum_column(row.get::<_, String>("folder_type")?)?,
            provider_folder_id: row.get("provider_folder_id")?,
        })
    }
}

impl CachedMessage {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        let attachments = row
            .get::<_, Option<String>>("attachments")?
            .and_then(|raw| serde_json::from_str::<Vec<AttachmentMeta>>(&raw).ok())
            .unwrap_or_default();

        Ok(Self {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            connection_id: row.get("connection_id")?,
            provider_email_id: row.get("provider_email_id")?,
            folder_id: row.get("folder_id")?,
            subject: row.get("subject")?,
            sender: row.get("sender")?,
            recipients: parse_json_array(row.get("recipients")?),
            cc: parse_json_array(row.get("cc")?),
            date: row.get("date")?,
            body_html: row.get("body_html")?,
            body_preview: row.get("body_preview")?,
            read: row.get("read")?,
            starred: row.get("starred")?,
            attachments,
            updated_at: required_ts(row.get("updated_at")?)?,
        })
    }
}

impl SyncJob {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            connection_id: row.get("connection_id")?,
            provider: parse_enum_column(row.get::<_, String>("provider")?)?,
            sync_type: parse_enum_column(row.get::<_, String>("sync_type")?)?,
            status: parse_enum_column(row.get::<_, String>("status")?)?,
            priority: row.get("priority")?,
            progress: row.get("progress")?,
            folders_completed: row.get("folders_completed")?,
            total_folders: row.get("total_folders")?,
            messages_synced: row.get("messages_synced")?,
            current_folder: row.get("current_folder")?,
            status_message: row.get("status_message")?,
            started_at: required_ts(row.get("started_at")?)?,
            completed_at: optional_ts(row.get("completed_at")?),
            latest_history_id: row.get("latest_history_id")?,
            worker_id: row.get("worker_id")?,
            retry_count: row.get("retry_count")?,
            max_retries: row.get("max_retries")?,
            created_at: required_ts(row.get("created_at")?)?,
            updated_at: required_ts(row.get("updated_at")?)?,
        })
    }
}

impl WorkerRecord {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            worker_id: row.get("worker_id")?,
            hostname: row.get("hostname")?,
            status: parse_enum_column(row.get::<_, String>("status")?)?,
            last_heartbeat: required_ts(row.get("last_heartbeat")?)?,
            current_job_id: row.get("current_job_id")?,
            jobs_processed_count: row.get("jobs_processed_count")?,
            started_at: required_ts(row.get("started_at")?)?,
        })
    }
}

impl SyncLock {
    pub fn from_row(row: &Row<'_>) -> SqlResult<Self> {
        Ok(Self {
            id: row.get("id")?,
            acquired_at: required_ts(row.get("acquired_at")?)?,
            expires_at: required_ts(row.get("expires_at")?)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::{
        fmt_ts, parse_ts, FolderType, JobStatus, Provider, SyncStatus, SyncType, WorkerStatus,
    };

    #[test]
    fn enum_display_and_parse_round_trip() {
        assert_eq!(Provider::Gmail.to_string(), "gmail");
        assert_eq!(
            "outlook".parse::<Provider>().expect("provider"),
            Provider::Outlook
        );
        assert_eq!(
            "requires_reauth".parse::<SyncStatus>().expect("status"),
            SyncStatus::RequiresReauth
        );
        assert_eq!("full".parse::<SyncType>().expect("sync type"), SyncType::Full);
        assert_eq!(
            "in_progress".parse::<JobStatus>().expect("job status"),
            JobStatus::InProgress
        );
        assert_eq!(
            "processing".parse::<WorkerStatus>().expect("worker status"),
            WorkerStatus::Processing
        );
        assert_eq!(
            "draft".parse::<FolderType>().expect("folder type"),
            FolderType::Drafts
        );
        assert!("imap".parse::<Provider>().is_err());
    }

    #[test]
    fn job_status_terminality() {
        assert!(!JobStatus::InProgress.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn timestamp_format_round_trips_and_sorts_lexicographically() {
        let earlier = Utc.with_ymd_and_hms(2026, 3, 1, 8, 30, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();

        let earlier_raw = fmt_ts(earlier);
        let later_raw = fmt_ts(later);
        assert!(earlier_raw < later_raw);
        assert_eq!(parse_ts(&earlier_raw), Some(earlier));
    }
}
