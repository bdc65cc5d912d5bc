use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use super::{fields_to_json, format_timestamp, Page, RemoteFilter, RemoteStore, RemoteUpdate};
use crate::config::Config;
use crate::error::{ReminderSyncError, Result};
use crate::reminders::{ReminderFields, RemoteId, RemoteReminder, MAX_REPEAT_COUNT};

/// PostgREST client for the hosted reminders table (Supabase REST API).
pub struct RestRemoteStore {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    page_size: usize,
}

#[derive(Debug, Deserialize)]
struct RemoteRow {
    id: RemoteId,
    chat_id: String,
    #[serde(default)]
    owner: Option<String>,
    title: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    scheduled_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    #[serde(default)]
    notified: bool,
    #[serde(default)]
    constant_notify: bool,
    #[serde(default)]
    notify_stopped: bool,
    #[serde(default)]
    repeat: bool,
    #[serde(default)]
    repeat_unit: Option<String>,
    #[serde(default)]
    repeat_count: Option<i64>,
    #[serde(default)]
    recurrence_created: bool,
}

#[derive(Debug, Deserialize)]
struct IdRow {
    id: RemoteId,
}

impl RemoteRow {
    fn into_remote(self) -> Result<RemoteReminder> {
        let repeat_unit = self
            .repeat_unit
            .as_deref()
            .filter(|unit| !unit.trim().is_empty())
            .map(str::parse)
            .transpose()?;
        let repeat_count = self
            .repeat_count
            .map(|count| {
                u32::try_from(count)
                    .ok()
                    .filter(|parsed| *parsed <= MAX_REPEAT_COUNT)
                    .ok_or_else(|| {
                        ReminderSyncError::Serialization(format!(
                            "remote row {} has invalid repeat_count {count}",
                            self.id
                        ))
                    })
            })
            .transpose()?;
        Ok(RemoteReminder {
            id: self.id,
            fields: ReminderFields {
                chat_id: self.chat_id,
                owner: self.owner.unwrap_or_default(),
                title: self.title,
                description: self.description,
                scheduled_at: self.scheduled_at.map(|at| at.timestamp()),
                created_at: self.created_at.timestamp(),
                notified: self.notified,
                constant_notify: self.constant_notify,
                notify_stopped: self.notify_stopped,
                repeat: self.repeat,
                repeat_unit,
                repeat_count,
                recurrence_created: self.recurrence_created,
            },
        })
    }
}

impl RestRemoteStore {
    pub fn new(
        base_url: &str,
        table: &str,
        api_key: Option<String>,
        timeout: Duration,
        page_size: usize,
    ) -> Result<Self> {
        let base_url = base_url.trim().trim_end_matches('/');
        if base_url.is_empty() {
            return Err(ReminderSyncError::Config(
                "remote.base_url is required".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ReminderSyncError::Http(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: format!("{base_url}/rest/v1/{table}"),
            api_key,
            page_size: page_size.max(1),
        })
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let base_url = config.remote.base_url.as_deref().ok_or_else(|| {
            ReminderSyncError::Config("remote.base_url is required".to_string())
        })?;
        Self::new(
            base_url,
            &config.remote_table(),
            config.remote.api_key.clone(),
            config.remote_timeout(),
            config.remote_page_size(),
        )
    }

    fn request(&self, method: Method) -> RequestBuilder {
        let mut builder = self.client.request(method, &self.endpoint);
        if let Some(key) = &self.api_key {
            builder = builder
                .header("apikey", key)
                .header("Authorization", format!("Bearer {key}"));
        }
        builder
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response> {
        let response = builder
            .send()
            .await
            .map_err(|e| ReminderSyncError::RemoteUnavailable(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        let message = format!("remote http {status}: {body}");
        if status.is_server_error()
            || status == StatusCode::TOO_MANY_REQUESTS
            || status == StatusCode::REQUEST_TIMEOUT
        {
            Err(ReminderSyncError::RemoteUnavailable(message))
        } else {
            Err(ReminderSyncError::RemoteRejected(message))
        }
    }

    async fn decode<T: for<'de> Deserialize<'de>>(response: Response) -> Result<T> {
        response
            .json()
            .await
            .map_err(|e| ReminderSyncError::Serialization(format!("remote decode failure: {e}")))
    }

    fn filter_params(filter: &RemoteFilter) -> Result<Vec<(String, String)>> {
        let mut clauses = Vec::new();
        if filter.only_unfinalized {
            clauses.push(
                "or(notified.eq.false,and(constant_notify.eq.true,notify_stopped.eq.false))"
                    .to_string(),
            );
        }
        if let Some(since) = filter.scheduled_since {
            clauses.push(format!(
                "or(scheduled_at.is.null,scheduled_at.gte.{})",
                format_timestamp(since)?
            ));
        }
        let mut params = Vec::new();
        if !clauses.is_empty() {
            params.push(("and".to_string(), format!("({})", clauses.join(","))));
        }
        Ok(params)
    }
}

/// One malformed row must not hide the rest of its page.
fn decode_row(value: Value) -> Result<RemoteReminder> {
    let id = value.get("id").and_then(Value::as_i64);
    let row: RemoteRow = serde_json::from_value(value).map_err(|e| {
        ReminderSyncError::Serialization(match id {
            Some(id) => format!("remote row {id} is malformed: {e}"),
            None => format!("remote row is malformed: {e}"),
        })
    })?;
    row.into_remote()
}

fn page_params(page: Page) -> [(String, String); 3] {
    [
        ("order".to_string(), "id.asc".to_string()),
        ("limit".to_string(), page.limit.to_string()),
        ("offset".to_string(), page.offset.to_string()),
    ]
}

#[async_trait]
impl RemoteStore for RestRemoteStore {
    async fn create(&self, fields: &ReminderFields) -> Result<RemoteId> {
        let body = fields_to_json(fields)?;
        let response = self
            .send(
                self.request(Method::POST)
                    .header("Prefer", "return=representation")
                    .json(&body),
            )
            .await?;
        let rows: Vec<IdRow> = Self::decode(response).await?;
        let id = rows.first().map(|row| row.id).ok_or_else(|| {
            ReminderSyncError::RemoteRejected("remote create returned no row".to_string())
        })?;
        debug!(remote_id = id, chat_id = %fields.chat_id, "remote row created");
        Ok(id)
    }

    async fn update(&self, remote_id: RemoteId, update: &RemoteUpdate) -> Result<()> {
        let response = self
            .send(
                self.request(Method::PATCH)
                    .query(&[("id", format!("eq.{remote_id}")), ("select", "id".to_string())])
                    .header("Prefer", "return=representation")
                    .json(&update.to_json()?),
            )
            .await?;
        let rows: Vec<IdRow> = Self::decode(response).await?;
        if rows.is_empty() {
            return Err(ReminderSyncError::RemoteRejected(format!(
                "remote row {remote_id} does not exist"
            )));
        }
        Ok(())
    }

    async fn delete(&self, remote_id: RemoteId) -> Result<()> {
        self.send(
            self.request(Method::DELETE)
                .query(&[("id", format!("eq.{remote_id}"))]),
        )
        .await?;
        Ok(())
    }

    async fn list_pending(
        &self,
        filter: &RemoteFilter,
        page: Page,
    ) -> Result<Vec<Result<RemoteReminder>>> {
        let response = self
            .send(
                self.request(Method::GET)
                    .query(&[("select", "*")])
                    .query(&Self::filter_params(filter)?)
                    .query(&page_params(page)),
            )
            .await?;
        let rows: Vec<Value> = Self::decode(response).await?;
        Ok(rows.into_iter().map(decode_row).collect())
    }

    async fn list_all_ids(&self) -> Result<HashSet<RemoteId>> {
        let mut ids = HashSet::new();
        let mut page = Page::first(self.page_size);
        loop {
            let response = self
                .send(
                    self.request(Method::GET)
                        .query(&[("select", "id")])
                        .query(&page_params(page)),
                )
                .await?;
            let rows: Vec<IdRow> = Self::decode(response).await?;
            let fetched = rows.len();
            ids.extend(rows.into_iter().map(|row| row.id));
            if fetched < page.limit {
                break;
            }
            page = page.next();
        }
        Ok(ids)
    }
}
