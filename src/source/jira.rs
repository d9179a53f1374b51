// src/source/jira.rs

//! Jira REST client
//!
//! Blocking reqwest client with basic authentication. Transient failures
//! (connection errors, 429 and 5xx responses) are retried with a growing delay.

use super::{ChangelogEntry, ServerInfo, SourceConnector, SourceSprint, parse_source_date};
use crate::{Error, Result};
use parking_lot::Mutex;
use reqwest::StatusCode;
use reqwest::blocking::{Client, Response};
use serde::Deserialize;
use serde_json::Value;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default timeout for HTTP requests (60 seconds)
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Maximum attempts for a request
const MAX_RETRIES: u32 = 3;

/// Retry delay in milliseconds, multiplied by the attempt number
const RETRY_DELAY_MS: u64 = 1000;

/// Page size for changelog requests
const CHANGELOG_PAGE_SIZE: usize = 100;

/// Buffer size for streaming downloads (8 KB)
const STREAM_BUFFER_SIZE: usize = 8192;

/// Connection settings for a Jira instance
#[derive(Debug, Clone)]
pub struct JiraSettings {
    pub url: String,
    pub user: String,
    pub password: String,
    pub using_jira_cloud: bool,
}

#[derive(Debug, Deserialize)]
struct FieldInfo {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangelogPage {
    #[serde(default)]
    values: Vec<ChangelogEntry>,
    #[serde(default)]
    is_last: Option<bool>,
    #[serde(default)]
    total: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct SearchIssue {
    key: String,
}

#[derive(Debug, Deserialize)]
struct SearchPage {
    #[serde(default)]
    issues: Vec<SearchIssue>,
    #[serde(default)]
    total: usize,
}

/// Jira connector over the REST API
pub struct JiraClient {
    client: Client,
    settings: JiraSettings,
    fields: Mutex<Option<Vec<FieldInfo>>>,
}

impl JiraClient {
    pub fn new(settings: JiraSettings) -> Result<Self> {
        info!("Connecting to Jira at {}", settings.url);

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            "X-Atlassian-Token",
            reqwest::header::HeaderValue::from_static("no-check"),
        );
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .default_headers(headers)
            .build()
            .map_err(|e| Error::InitError(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            settings,
            fields: Mutex::new(None),
        })
    }

    pub fn settings(&self) -> &JiraSettings {
        &self.settings
    }

    fn url(&self, resource: &str) -> String {
        format!("{}{}", self.settings.url.trim_end_matches('/'), resource)
    }

    /// GET with retry on transient failures
    fn send(&self, url: &str) -> Result<Response> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self
                .client
                .get(url)
                .basic_auth(&self.settings.user, Some(&self.settings.password))
                .send();

            let retryable = match result {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response)
                    if response.status() == StatusCode::TOO_MANY_REQUESTS
                        || response.status().is_server_error() =>
                {
                    format!("HTTP {}", response.status())
                }
                Ok(response) if response.status() == StatusCode::NOT_FOUND => {
                    return Err(Error::NotFoundError(url.to_string()));
                }
                Ok(response) => {
                    return Err(Error::DownloadError(format!(
                        "HTTP {} from {}",
                        response.status(),
                        url
                    )));
                }
                Err(e) => e.to_string(),
            };

            if attempt >= MAX_RETRIES {
                return Err(Error::DownloadError(format!(
                    "Request to {url} failed after {attempt} attempts: {retryable}"
                )));
            }
            warn!("Request attempt {} to {} failed: {}, retrying...", attempt, url, retryable);
            std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS * attempt as u64));
        }
    }

    fn get_json<T: serde::de::DeserializeOwned>(&self, resource: &str) -> Result<T> {
        let url = self.url(resource);
        debug!("GET {}", url);
        self.send(&url)?
            .json()
            .map_err(|e| Error::ParseError(format!("Failed to parse response from {url}: {e}")))
    }

    fn changelog_paged(&self, key: &str) -> Result<Vec<ChangelogEntry>> {
        let mut entries = Vec::new();
        loop {
            let page: ChangelogPage = self.get_json(&format!(
                "/rest/api/2/issue/{}/changelog?startAt={}&maxResults={}",
                urlencoding::encode(key),
                entries.len(),
                CHANGELOG_PAGE_SIZE
            ))?;
            let fetched = page.values.len();
            entries.extend(page.values);

            let done = match (page.is_last, page.total) {
                (Some(is_last), _) => is_last,
                (None, Some(total)) => entries.len() >= total,
                (None, None) => true,
            };
            if done || fetched == 0 {
                return Ok(entries);
            }
        }
    }

    fn changelog_expanded(&self, key: &str) -> Result<Vec<ChangelogEntry>> {
        let issue: Value = self.get_json(&format!(
            "/rest/api/2/issue/{}?expand=changelog&fields=created",
            urlencoding::encode(key)
        ))?;
        let histories = issue
            .pointer("/changelog/histories")
            .cloned()
            .unwrap_or(Value::Array(Vec::new()));
        Ok(serde_json::from_value(histories)?)
    }
}

fn optional_date(value: &Value, key: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    value
        .get(key)
        .and_then(Value::as_str)
        .and_then(|s| parse_source_date(s).ok())
}

fn optional_string(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parse one page of the agile sprint listing
fn parse_sprint_page(page: &Value) -> (Vec<SourceSprint>, bool) {
    let sprints = page
        .get("values")
        .and_then(Value::as_array)
        .map(|values| {
            values
                .iter()
                .filter_map(|s| {
                    Some(SourceSprint {
                        origin_id: optional_string(s, "id")?,
                        origin_board_id: optional_string(s, "originBoardId"),
                        name: optional_string(s, "name")?,
                        state: optional_string(s, "state"),
                        goal: optional_string(s, "goal"),
                        start_date: optional_date(s, "startDate"),
                        end_date: optional_date(s, "endDate"),
                        activated_date: optional_date(s, "activatedDate"),
                        completed_date: optional_date(s, "completeDate"),
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    let is_last = page.get("isLast").and_then(Value::as_bool).unwrap_or(true);
    (sprints, is_last)
}

impl SourceConnector for JiraClient {
    fn get_issue(&self, key: &str) -> Result<Value> {
        self.get_json(&format!(
            "/rest/api/2/issue/{}?expand=renderedFields",
            urlencoding::encode(key)
        ))
    }

    fn get_changelog(&self, key: &str) -> Result<Vec<ChangelogEntry>> {
        if self.settings.using_jira_cloud {
            self.changelog_paged(key)
        } else {
            self.changelog_expanded(key)
        }
    }

    fn get_custom_id(&self, field_name: &str) -> Result<Option<String>> {
        let mut cache = self.fields.lock();
        if cache.is_none() {
            *cache = Some(self.get_json("/rest/api/2/field")?);
        }
        Ok(cache.as_ref().and_then(|fields| {
            fields
                .iter()
                .find(|f| f.name.eq_ignore_ascii_case(field_name) || f.id == field_name)
                .map(|f| f.id.clone())
        }))
    }

    fn get_sprints(&self, board_id: &str) -> Result<Vec<SourceSprint>> {
        let resource = format!("/rest/agile/1.0/board/{}/sprint", urlencoding::encode(board_id));
        let mut sprints = Vec::new();
        loop {
            let page: Value = self.get_json(&format!("{}?startAt={}", resource, sprints.len()))?;
            let (batch, is_last) = parse_sprint_page(&page);
            let fetched = batch.len();
            sprints.extend(batch);
            if is_last || fetched == 0 {
                return Ok(sprints);
            }
        }
    }

    fn search_keys(&self, query: &str, start_at: usize, max_results: usize) -> Result<Vec<String>> {
        let page: SearchPage = self.get_json(&format!(
            "/rest/api/2/search?jql={}&startAt={}&maxResults={}&fields=key",
            urlencoding::encode(query),
            start_at,
            max_results
        ))?;
        Ok(page.issues.into_iter().map(|i| i.key).collect())
    }

    fn get_item_count(&self, query: &str) -> Result<usize> {
        let page: SearchPage = self.get_json(&format!(
            "/rest/api/2/search?jql={}&maxResults=0",
            urlencoding::encode(query)
        ))?;
        Ok(page.total)
    }

    fn download_attachment(&self, url: &str, dest: &Path) -> Result<()> {
        let mut response = self.send(url)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = File::create(dest)?;
        let mut buffer = [0u8; STREAM_BUFFER_SIZE];
        loop {
            let bytes_read = match response.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::IoError(format!("Failed to read response: {e}"))),
            };
            file.write_all(&buffer[..bytes_read])
                .map_err(|e| Error::IoError(format!("Failed to write data: {e}")))?;
        }
        file.sync_all()?;
        debug!("Downloaded {} to {}", url, dest.display());
        Ok(())
    }

    fn server_info(&self) -> Result<ServerInfo> {
        self.get_json("/rest/api/2/serverInfo")
    }
}
