use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{Duration, TimeZone, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::db::models::{AttachmentMeta, Provider};
use crate::error::{SyncError, SyncResult};
use crate::providers::backoff::{with_backoff, BackoffPolicy};
use crate::providers::{
    HistoryMessage, HistoryPage, HistoryRecord, MessagePage, MessageSummary, ProviderClient,
    ProviderLabel, ProviderMessage, ProviderProfile, TokenGrant, WatchSubscription,
};

const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1";
const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const TOKEN_URL_ENV: &str = "MAILSYNC_GOOGLE_TOKEN_URL";
const API_BASE_ENV: &str = "MAILSYNC_GMAIL_API_BASE";
const TRANSPORT_TIMEOUT_SECS: u64 = 30;
const HISTORY_PAGE_SIZE: usize = 100;
const REDACTED_BODY_MAX_LEN: usize = 200;

#[derive(Debug, Clone)]
pub struct GmailClient {
    http: Client,
    client_id: String,
    client_secret: String,
    backoff: BackoffPolicy,
}

impl GmailClient {
    pub fn new(client_id: String, client_secret: String) -> Self {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(TRANSPORT_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();

        Self {
            http,
            client_id,
            client_secret,
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_backoff_policy(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    fn api_base() -> String {
        std::env::var(API_BASE_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| GMAIL_API_BASE.to_string())
    }

    fn token_url() -> String {
        std::env::var(TOKEN_URL_ENV)
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| GOOGLE_TOKEN_URL.to_string())
    }

    async fn get_json(&self, token: &str, url: &str) -> SyncResult<String> {
        let response = self
            .http
            .get(url)
            .bearer_auth(token)
            .header("accept", "application/json")
            .send()
            .await
            .map_err(|e| SyncError::Provider(format!("gmail request {url}: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| SyncError::Provider(format!("read gmail response body: {e}")))?;

        if !status.is_success() {
            return Err(SyncError::Provider(format!(
                "gmail api request failed: status={} body={}",
                status,
                redact_response_body(&body)
            )));
        }

        Ok(body)
    }

    async fn post_json(&self, token: &str, url: &str, payload: &serde_json::Value) -> SyncResult<String> {
        let response = self
            .http
            .post(url)
            .bearer_auth(token)
            .json(payload)
            .send()
            .await
            .map_err(|e| SyncError::Provider(format!("gmail request {url}: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| SyncError::Provider(format!("read gmail response body: {e}")))?;

        if !status.is_success() {
            return Err(SyncError::Provider(format!(
                "gmail api request failed: status={} body={}",
                status,
                redact_response_body(&body)
            )));
        }

        Ok(body)
    }

    fn decode<T: serde::de::DeserializeOwned>(body: &str, what: &str) -> SyncResult<T> {
        serde_json::from_str(body)
            .map_err(|e| SyncError::Provider(format!("decode gmail {what}: {e}")))
    }
}

#[async_trait::async_trait]
impl ProviderClient for GmailClient {
    fn provider(&self) -> Provider {
        Provider::Gmail
    }

    async fn profile(&self, access_token: &str) -> SyncResult<ProviderProfile> {
        let url = format!("{}/users/me/profile", Self::api_base());
        let body = with_backoff("gmail.profile", self.backoff, || {
            self.get_json(access_token, &url)
        })
        .await?;
        let profile: GmailProfile = Self::decode(&body, "profile")?;
        Ok(ProviderProfile {
            email: profile.email_address,
            history_id: Some(profile.history_id),
        })
    }

    async fn list_labels(&self, access_token: &str) -> SyncResult<Vec<ProviderLabel>> {
        let url = format!("{}/users/me/labels", Self::api_base());
        let body = with_backoff("gmail.labels.list", self.backoff, || {
            self.get_json(access_token, &url)
        })
        .await?;
        let list: GmailLabelList = Self::decode(&body, "label list")?;
        Ok(list
            .labels
            .unwrap_or_default()
            .into_iter()
            .map(|label| ProviderLabel {
                id: label.id,
                name: label.name,
                history_id: label.history_id,
            })
            .collect())
    }

    async fn list_messages(
        &self,
        access_token: &str,
        provider_folder_id: &str,
        page_size: i64,
        page_token: Option<&str>,
    ) -> SyncResult<MessagePage> {
        let mut url = format!(
            "{}/users/me/messages?labelIds={}&maxResults={}",
            Self::api_base(),
            provider_folder_id,
            page_size
        );
        if let Some(pt) = page_token {
            url.push_str(&format!("&pageToken={pt}"));
        }

        let body = with_backoff("gmail.messages.list", self.backoff, || {
            self.get_json(access_token, &url)
        })
        .await?;
        let list: GmailMessageList = Self::decode(&body, "message list")?;

        Ok(MessagePage {
            summaries: list
                .messages
                .unwrap_or_default()
                .into_iter()
                .map(|stub| MessageSummary {
                    id: stub.id,
                    thread_id: Some(stub.thread_id),
                })
                .collect(),
            next_page_token: list.next_page_token,
        })
    }

    async fn get_message(
        &self,
        access_token: &str,
        message_id: &str,
    ) -> SyncResult<ProviderMessage> {
        let url = format!(
            "{}/users/me/messages/{}?format=full",
            Self::api_base(),
            message_id
        );
        let body = with_backoff("gmail.messages.get", self.backoff, || {
            self.get_json(access_token, &url)
        })
        .await?;
        let message: GmailMessage = Self::decode(&body, "message")?;
        Ok(map_gmail_message(message))
    }

    async fn list_history(
        &self,
        access_token: &str,
        start_history_id: &str,
        page_token: Option<&str>,
    ) -> SyncResult<HistoryPage> {
        let mut url = format!(
            "{}/users/me/history?startHistoryId={}&maxResults={}\
             &historyTypes=messageAdded&historyTypes=messageDeleted\
             &historyTypes=labelAdded&historyTypes=labelRemoved",
            Self::api_base(),
            start_history_id,
            HISTORY_PAGE_SIZE
        );
        if let Some(pt) = page_token {
            url.push_str(&format!("&pageToken={pt}"));
        }

        let body = match with_backoff("gmail.history.list", self.backoff, || {
            self.get_json(access_token, &url)
        })
        .await
        {
            Ok(body) => body,
            // Gmail answers 404 when the start cursor has expired out of the
            // change log; the caller falls back to a full sync.
            Err(SyncError::Provider(message))
                if message.contains("404") || message.contains("historyId") =>
            {
                return Err(SyncError::InvalidHistoryCursor);
            }
            Err(error) => return Err(error),
        };

        let list: GmailHistoryList = Self::decode(&body, "history list")?;
        Ok(HistoryPage {
            records: list
                .history
                .unwrap_or_default()
                .into_iter()
                .map(map_history_record)
                .collect(),
            next_page_token: list.next_page_token,
            history_id: list.history_id,
        })
    }

    async fn watch(&self, access_token: &str, topic: &str) -> SyncResult<WatchSubscription> {
        let url = format!("{}/users/me/watch", Self::api_base());
        let payload = serde_json::json!({
            "topicName": topic,
            "labelIds": ["INBOX"],
            "labelFilterBehavior": "INCLUDE",
        });

        let body = with_backoff("gmail.watch", self.backoff, || {
            self.post_json(access_token, &url, &payload)
        })
        .await?;
        let response: GmailWatchResponse = Self::decode(&body, "watch response")?;

        // expiration comes back as epoch milliseconds in a string
        let expiration = response
            .expiration
            .as_deref()
            .and_then(|ms| ms.parse::<i64>().ok())
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single());

        Ok(WatchSubscription {
            resource_id: response.resource_id,
            history_id: response.history_id,
            expiration,
        })
    }

    async fn refresh_token(&self, refresh_token: &str) -> SyncResult<TokenGrant> {
        let token_url = Self::token_url();
        let response = self
            .http
            .post(&token_url)
            .form(&[
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await
            .map_err(|e| SyncError::TokenRefreshTransient(format!("token request: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| SyncError::TokenRefreshTransient(format!("read token response: {e}")))?;

        if !status.is_success() {
            let redacted = redact_response_body(&body);
            // invalid_grant is Google's signal that the refresh token has
            // been revoked or expired; it never recovers on retry.
            if is_revocation(status, &body) {
                return Err(SyncError::TokenRevoked(redacted));
            }
            return Err(SyncError::TokenRefreshTransient(format!(
                "status={status} body={redacted}"
            )));
        }

        let payload: OAuthTokenResponse = serde_json::from_str(&body)
            .map_err(|e| SyncError::TokenRefreshTransient(format!("decode token response: {e}")))?;

        Ok(TokenGrant {
            access_token: payload.access_token,
            refresh_token: payload.refresh_token,
            expires_at: Utc::now() + Duration::seconds(payload.expires_in as i64),
        })
    }
}

fn is_revocation(status: StatusCode, body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    (status == StatusCode::BAD_REQUEST || status == StatusCode::UNAUTHORIZED)
        && (lower.contains("invalid_grant") || lower.contains("revoked"))
}

fn redact_response_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= REDACTED_BODY_MAX_LEN {
        trimmed.to_string()
    } else {
        let cut = trimmed
            .char_indices()
            .take_while(|(i, _)| *i < REDACTED_BODY_MAX_LEN)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(0);
        format!("{}…[truncated {} bytes]", &trimmed[..cut], trimmed.len())
    }
}

// --- message mapping ---

fn map_gmail_message(message: GmailMessage) -> ProviderMessage {
    let subject = extract_header(&message.payload, "Subject");
    let sender = extract_header(&message.payload, "From")
        .as_deref()
        .and_then(extract_email_from_entry);
    let recipients = parse_address_list(extract_header(&message.payload, "To").as_deref());
    let cc = parse_address_list(extract_header(&message.payload, "Cc").as_deref());

    // internalDate (epoch ms) is authoritative; the Date header is a
    // fallback for drafts that never left the outbox.
    let date = message
        .internal_date
        .as_deref()
        .and_then(|ms| ms.parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .map(|ts| ts.to_rfc3339())
        .or_else(|| {
            extract_header(&message.payload, "Date")
                .as_deref()
                .and_then(|raw| chrono::DateTime::parse_from_rfc2822(raw).ok())
                .map(|ts| ts.with_timezone(&Utc).to_rfc3339())
        });

    let (body_text, body_html) = extract_body_parts(&message.payload);
    let body_preview = message
        .snippet
        .as_deref()
        .map(html_entity_decode)
        .filter(|s| !s.is_empty())
        .or(body_text);

    let label_ids = message.label_ids.unwrap_or_default();
    let read = !label_ids.iter().any(|l| l == "UNREAD");
    let starred = label_ids.iter().any(|l| l == "STARRED");

    let mut attachments = Vec::new();
    collect_attachments(&message.payload, &mut attachments);

    ProviderMessage {
        id: message.id,
        thread_id: Some(message.thread_id),
        label_ids,
        subject,
        sender,
        recipients,
        cc,
        date,
        body_html,
        body_preview,
        read,
        starred,
        attachments,
    }
}

fn map_history_record(record: GmailHistoryRecord) -> HistoryRecord {
    let messages_added = record
        .messages_added
        .unwrap_or_default()
        .into_iter()
        .map(|entry| HistoryMessage {
            id: entry.message.id,
            label_ids: entry.message.label_ids.unwrap_or_default(),
        })
        .collect();

    let messages_deleted = record
        .messages_deleted
        .unwrap_or_default()
        .into_iter()
        .map(|entry| entry.message.id)
        .collect();

    let mut label_changes: Vec<String> = Vec::new();
    for entry in record
        .labels_added
        .unwrap_or_default()
        .into_iter()
        .chain(record.labels_removed.unwrap_or_default())
    {
        label_changes.push(entry.message.id);
    }

    HistoryRecord {
        messages_added,
        messages_deleted,
        label_changes,
    }
}

fn extract_header(payload: &GmailPayload, name: &str) -> Option<String> {
    payload
        .headers
        .as_deref()
        .unwrap_or_default()
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.clone())
}

fn parse_address_list(raw: Option<&str>) -> Vec<String> {
    let Some(raw) = raw else {
        return Vec::new();
    };

    let mut addresses = Vec::new();
    // split on commas outside quoted display names
    let mut in_quotes = false;
    let mut current = String::new();

    for ch in raw.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            ',' if !in_quotes => {
                if let Some(addr) = extract_email_from_entry(current.trim()) {
                    addresses.push(addr);
                }
                current.clear();
            }
            _ => current.push(ch),
        }
    }
    if let Some(addr) = extract_email_from_entry(current.trim()) {
        addresses.push(addr);
    }

    addresses
}

fn extract_email_from_entry(entry: &str) -> Option<String> {
    let entry = entry.trim();
    if entry.is_empty() {
        return None;
    }

    if let Some(start) = entry.rfind('<') {
        if let Some(end) = entry.rfind('>') {
            if end > start {
                let addr = entry[start + 1..end].trim();
                if !addr.is_empty() {
                    return Some(addr.to_string());
                }
            }
        }
    }

    if entry.contains('@') {
        return Some(entry.to_string());
    }

    None
}

fn extract_body_parts(payload: &GmailPayload) -> (Option<String>, Option<String>) {
    let mut text_body = None;
    let mut html_body = None;
    collect_body_parts(payload, &mut text_body, &mut html_body);

    if text_body.is_none() && html_body.is_some() {
        text_body = html_body.as_ref().and_then(|html| {
            std::panic::catch_unwind(|| {
                html2text::from_read(html.as_bytes(), 120)
                    .lines()
                    .map(str::trim_end)
                    .collect::<Vec<_>>()
                    .join("\n")
                    .trim()
                    .to_string()
            })
            .ok()
        });
        if text_body.as_deref().is_some_and(|t| t.is_empty()) {
            text_body = None;
        }
    }

    (text_body, html_body)
}

fn collect_body_parts(
    payload: &GmailPayload,
    text_body: &mut Option<String>,
    html_body: &mut Option<String>,
) {
    let mime_type = payload
        .mime_type
        .as_deref()
        .unwrap_or("")
        .to_ascii_lowercase();

    if let Some(body) = &payload.body {
        if let Some(data) = &body.data {
            if !data.is_empty() {
                if let Ok(decoded) = decode_body_data(data) {
                    if mime_type == "text/plain" && text_body.is_none() {
                        *text_body = Some(decoded);
                    } else if mime_type == "text/html" && html_body.is_none() {
                        *html_body = Some(decoded);
                    }
                }
            }
        }
    }

    if let Some(parts) = &payload.parts {
        for part in parts {
            collect_body_parts(part, text_body, html_body);
        }
    }
}

fn decode_body_data(data: &str) -> SyncResult<String> {
    let bytes = URL_SAFE_NO_PAD
        .decode(data)
        .map_err(|e| SyncError::Provider(format!("base64url decode gmail body: {e}")))?;
    String::from_utf8(bytes).map_err(|e| SyncError::Provider(format!("utf8 decode gmail body: {e}")))
}

fn collect_attachments(payload: &GmailPayload, out: &mut Vec<AttachmentMeta>) {
    if let Some(filename) = &payload.filename {
        if !filename.is_empty() {
            out.push(AttachmentMeta {
                name: filename.clone(),
                mime_type: payload.mime_type.clone(),
                size_bytes: payload
                    .body
                    .as_ref()
                    .and_then(|body| body.size)
                    .map(|size| size as i64),
            });
        }
    }
    if let Some(parts) = &payload.parts {
        for part in parts {
            collect_attachments(part, out);
        }
    }
}

fn html_entity_decode(s: &str) -> String {
    s.replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&#x27;", "'")
        .replace("&nbsp;", " ")
}

// --- Gmail API response types ---
// #[allow(dead_code)] on these structs: fields are deserialized from the API
// but not all are read directly — they exist to match the API contract.

#[derive(Debug, Clone, Deserialize)]
struct GmailProfile {
    #[serde(rename = "emailAddress")]
    email_address: String,
    #[serde(rename = "historyId")]
    history_id: String,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailLabelList {
    labels: Option<Vec<GmailLabel>>,
}

#[derive(Debug, Clone, Deserialize)]
#[allow(dead_code)]
struct GmailLabel {
    id: String,
    name: String,
    #[serde(rename = "type")]
    label_type: Option<String>,
    #[serde(rename = "historyId")]
    history_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[allow(dead_code)]
struct GmailMessageList {
    messages: Option<Vec<GmailMessageStub>>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
    #[serde(rename = "resultSizeEstimate")]
    result_size_estimate: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailMessageStub {
    id: String,
    #[serde(rename = "threadId")]
    thread_id: String,
    #[serde(rename = "labelIds")]
    label_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, Deserialize)]
#[allow(dead_code)]
struct GmailMessage {
    id: String,
    #[serde(rename = "threadId")]
    thread_id: String,
    #[serde(rename = "labelIds")]
    label_ids: Option<Vec<String>>,
    snippet: Option<String>,
    payload: GmailPayload,
    #[serde(rename = "internalDate")]
    internal_date: Option<String>,
    #[serde(rename = "historyId")]
    history_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailPayload {
    #[serde(rename = "mimeType")]
    mime_type: Option<String>,
    headers: Option<Vec<GmailHeader>>,
    body: Option<GmailBody>,
    parts: Option<Vec<GmailPayload>>,
    filename: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailHeader {
    name: String,
    value: String,
}

#[derive(Debug, Clone, Deserialize)]
#[allow(dead_code)]
struct GmailBody {
    size: Option<u64>,
    data: Option<String>,
    #[serde(rename = "attachmentId")]
    attachment_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailHistoryList {
    history: Option<Vec<GmailHistoryRecord>>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
    #[serde(rename = "historyId")]
    history_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[allow(dead_code)]
struct GmailHistoryRecord {
    id: Option<String>,
    #[serde(rename = "messagesAdded")]
    messages_added: Option<Vec<GmailHistoryEntry>>,
    #[serde(rename = "messagesDeleted")]
    messages_deleted: Option<Vec<GmailHistoryEntry>>,
    #[serde(rename = "labelsAdded")]
    labels_added: Option<Vec<GmailHistoryEntry>>,
    #[serde(rename = "labelsRemoved")]
    labels_removed: Option<Vec<GmailHistoryEntry>>,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailHistoryEntry {
    message: GmailMessageStub,
}

#[derive(Debug, Clone, Deserialize)]
struct GmailWatchResponse {
    #[serde(rename = "historyId")]
    history_id: Option<String>,
    #[serde(rename = "resourceId")]
    resource_id: Option<String>,
    expiration: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct OAuthTokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: u64,
    #[allow(dead_code)]
    token_type: Option<String>,
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;
    use serde_json::json;

    use super::{
        is_revocation, map_gmail_message, map_history_record, parse_address_list,
        redact_response_body, GmailHistoryRecord, GmailMessage,
    };

    fn sample_message_json() -> serde_json::Value {
        json!({
            "id": "m-100",
            "threadId": "t-1",
            "labelIds": ["INBOX", "UNREAD", "STARRED"],
            "snippet": "Hello &amp; welcome",
            "internalDate": "1764546000000",
            "payload": {
                "mimeType": "multipart/alternative",
                "headers": [
                    {"name": "Subject", "value": "Welcome"},
                    {"name": "From", "value": "Alice <alice@example.com>"},
                    {"name": "To", "value": "Bob <bob@example.com>, carol@example.com"},
                    {"name": "Cc", "value": "\"Dave, D.\" <dave@example.com>"}
                ],
                "parts": [
                    {
                        "mimeType": "text/html",
                        "body": {"data": "PGI-aGk8L2I-", "size": 12}
                    },
                    {
                        "mimeType": "application/pdf",
                        "filename": "report.pdf",
                        "body": {"attachmentId": "att-1", "size": 2048}
                    }
                ]
            }
        })
    }

    #[test]
    fn maps_gmail_message_to_neutral_shape() {
        let message: GmailMessage =
            serde_json::from_value(sample_message_json()).expect("decode message");
        let mapped = map_gmail_message(message);

        assert_eq!(mapped.id, "m-100");
        assert_eq!(mapped.subject.as_deref(), Some("Welcome"));
        assert_eq!(mapped.sender.as_deref(), Some("alice@example.com"));
        assert_eq!(
            mapped.recipients,
            vec!["bob@example.com".to_string(), "carol@example.com".to_string()]
        );
        assert_eq!(mapped.cc, vec!["dave@example.com".to_string()]);
        assert!(!mapped.read);
        assert!(mapped.starred);
        assert_eq!(mapped.body_preview.as_deref(), Some("Hello & welcome"));
        assert_eq!(mapped.body_html.as_deref(), Some("<b>hi</b>"));
        assert_eq!(mapped.attachments.len(), 1);
        assert_eq!(mapped.attachments[0].name, "report.pdf");
        assert_eq!(mapped.attachments[0].size_bytes, Some(2048));
        assert!(mapped.date.as_deref().is_some_and(|d| d.starts_with("2025-")));
    }

    #[test]
    fn maps_history_record_into_disjoint_sets() {
        let record: GmailHistoryRecord = serde_json::from_value(json!({
            "id": "900",
            "messagesAdded": [
                {"message": {"id": "a-1", "threadId": "t", "labelIds": ["INBOX"]}}
            ],
            "messagesDeleted": [
                {"message": {"id": "d-1", "threadId": "t"}}
            ],
            "labelsAdded": [
                {"message": {"id": "u-1", "threadId": "t"}}
            ],
            "labelsRemoved": [
                {"message": {"id": "u-2", "threadId": "t"}}
            ]
        }))
        .expect("decode record");

        let mapped = map_history_record(record);
        assert_eq!(mapped.messages_added.len(), 1);
        assert_eq!(mapped.messages_added[0].id, "a-1");
        assert_eq!(mapped.messages_added[0].label_ids, vec!["INBOX".to_string()]);
        assert_eq!(mapped.messages_deleted, vec!["d-1".to_string()]);
        assert_eq!(
            mapped.label_changes,
            vec!["u-1".to_string(), "u-2".to_string()]
        );
    }

    #[test]
    fn revocation_detection_requires_auth_status_and_marker() {
        assert!(is_revocation(
            StatusCode::BAD_REQUEST,
            r#"{"error":"invalid_grant"}"#
        ));
        assert!(is_revocation(
            StatusCode::UNAUTHORIZED,
            "Token has been revoked"
        ));
        assert!(!is_revocation(
            StatusCode::INTERNAL_SERVER_ERROR,
            "invalid_grant"
        ));
        assert!(!is_revocation(StatusCode::BAD_REQUEST, "rate limited"));
    }

    #[test]
    fn address_list_respects_quoted_commas() {
        let parsed = parse_address_list(Some(
            "\"Smith, Jane\" <jane@example.com>, plain@example.com",
        ));
        assert_eq!(
            parsed,
            vec!["jane@example.com".to_string(), "plain@example.com".to_string()]
        );
    }

    #[test]
    fn long_error_bodies_are_truncated() {
        let long = "x".repeat(500);
        let redacted = redact_response_body(&long);
        assert!(redacted.len() < 300);
        assert!(redacted.contains("truncated 500 bytes"));
    }
}
