// src/replay/ado.rs

//! Azure DevOps / TFS REST connector
//!
//! Blocking reqwest client authenticated with a personal access token. Work
//! item updates are JSON Patch documents submitted with workflow rules
//! bypassed so historical authors, dates and states can be written.

use super::target::{
    ClassificationKind, ClassificationNode, NewClassificationNode, OperationStatus, Relation,
    TargetConnector, TargetProject, WorkItem, WorkItemPatch,
};
use crate::model::{FieldValue, field_ref};
use crate::{Error, Result};
use reqwest::StatusCode;
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// REST API version requested on every call
const API_VERSION: &str = "7.0";

/// Default timeout for HTTP requests (60 seconds)
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Maximum attempts for a request
const MAX_RETRIES: u32 = 3;

/// Retry delay in milliseconds, multiplied by the attempt number
const RETRY_DELAY_MS: u64 = 1000;

/// Title given to items before their first revision is applied
const PLACEHOLDER_TITLE: &str = "[Placeholder]";

const JSON_PATCH: &str = "application/json-patch+json";

/// Connection settings for the target organization
#[derive(Debug, Clone)]
pub struct AdoSettings {
    /// Organization or collection URL, e.g. `https://dev.azure.com/org`
    pub url: String,
    pub project: String,
    pub token: String,
}

#[derive(Debug, Deserialize)]
struct RawWorkItem {
    id: Option<i64>,
    #[serde(default)]
    url: String,
    #[serde(default)]
    fields: BTreeMap<String, Value>,
    #[serde(default)]
    relations: Option<Vec<RawRelation>>,
}

#[derive(Debug, Deserialize)]
struct RawRelation {
    rel: String,
    url: String,
    #[serde(default)]
    attributes: BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct AttachmentReference {
    url: String,
}

#[derive(Debug, Deserialize)]
struct Process {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct ProcessList {
    #[serde(default)]
    value: Vec<Process>,
}

#[derive(Debug, Deserialize)]
struct OperationReference {
    id: String,
}

#[derive(Debug, Deserialize)]
struct Operation {
    status: String,
}

/// Target connector over the work item tracking REST API
pub struct AdoClient {
    client: Client,
    settings: AdoSettings,
}

impl AdoClient {
    pub fn new(settings: AdoSettings) -> Result<Self> {
        let parsed = url::Url::parse(&settings.url)
            .map_err(|e| Error::InitError(format!("Invalid target URL '{}': {e}", settings.url)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(Error::InitError(format!(
                "Target URL must be http or https: {}",
                settings.url
            )));
        }
        info!("Connecting to Azure DevOps/TFS at {}", settings.url);
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::InitError(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { client, settings })
    }

    pub fn settings(&self) -> &AdoSettings {
        &self.settings
    }

    fn base(&self) -> &str {
        self.settings.url.trim_end_matches('/')
    }

    fn project_url(&self, resource: &str) -> String {
        format!(
            "{}/{}/_apis/{}",
            self.base(),
            urlencoding::encode(&self.settings.project),
            resource
        )
    }

    fn with_version(url: String) -> String {
        let sep = if url.contains('?') { '&' } else { '?' };
        format!("{url}{sep}api-version={API_VERSION}")
    }

    /// Send a request built by `build`, retrying on transient failures
    fn send(&self, url: &str, build: impl Fn() -> RequestBuilder) -> Result<Response> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = build().basic_auth("", Some(&self.settings.token)).send();

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
                    let status = response.status();
                    let body = response.text().unwrap_or_default();
                    return Err(Error::DownloadError(format!("HTTP {status} from {url}: {body}")));
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

    fn get_json<T: serde::de::DeserializeOwned>(&self, url: String) -> Result<T> {
        let url = Self::with_version(url);
        debug!("GET {}", url);
        self.send(&url, || self.client.get(&url))?
            .json()
            .map_err(|e| Error::ParseError(format!("Failed to parse response from {url}: {e}")))
    }

    fn send_json<T: serde::de::DeserializeOwned>(
        &self,
        method: reqwest::Method,
        url: String,
        content_type: &str,
        body: &Value,
    ) -> Result<T> {
        let url = Self::with_version(url);
        debug!("{} {}", method, url);
        let payload = serde_json::to_vec(body)?;
        self.send(&url, || {
            self.client
                .request(method.clone(), &url)
                .header(reqwest::header::CONTENT_TYPE, content_type)
                .body(payload.clone())
        })?
        .json()
        .map_err(|e| Error::ParseError(format!("Failed to parse response from {url}: {e}")))
    }
}

/// Convert a REST field value
fn field_from_json(value: &Value) -> FieldValue {
    match value {
        Value::Null => FieldValue::Empty,
        Value::String(s) => FieldValue::String(s.clone()),
        Value::Number(n) => n.as_f64().map_or(FieldValue::Empty, FieldValue::Number),
        Value::Bool(b) => FieldValue::String(b.to_string()),
        Value::Object(identity) => identity
            .get("uniqueName")
            .or_else(|| identity.get("displayName"))
            .and_then(Value::as_str)
            .map_or(FieldValue::Empty, |s| FieldValue::Identity(s.to_string())),
        Value::Array(_) => FieldValue::String(value.to_string()),
    }
}

fn parse_work_item(value: Value) -> Result<WorkItem> {
    let raw: RawWorkItem = serde_json::from_value(value)?;
    Ok(WorkItem {
        id: raw.id,
        url: raw.url,
        fields: raw
            .fields
            .iter()
            .map(|(k, v)| (k.clone(), field_from_json(v)))
            .collect(),
        relations: raw
            .relations
            .unwrap_or_default()
            .into_iter()
            .map(parse_relation)
            .collect(),
    })
}

fn parse_relation(raw: RawRelation) -> Relation {
    Relation {
        rel: raw.rel,
        url: raw.url,
        attributes: raw
            .attributes
            .into_iter()
            .map(|(k, v)| match v {
                Value::String(s) => (k, s),
                other => (k, other.to_string()),
            })
            .collect(),
    }
}

/// JSON Patch operations for one save
///
/// Field operations come first, then relation removals from the highest index
/// down so earlier indexes stay valid, then relation additions.
pub fn patch_document(patch: &WorkItemPatch) -> Vec<Value> {
    let mut ops = Vec::new();
    for (name, value) in &patch.fields {
        let value = match value {
            FieldValue::Empty => Value::Null,
            other => other.to_json(),
        };
        ops.push(json!({ "op": "add", "path": format!("/fields/{name}"), "value": value }));
    }
    for index in patch.removal_order() {
        ops.push(json!({ "op": "remove", "path": format!("/relations/{index}") }));
    }
    for relation in &patch.added_relations {
        ops.push(json!({
            "op": "add",
            "path": "/relations/-",
            "value": { "rel": relation.rel, "url": relation.url, "attributes": relation.attributes },
        }));
    }
    ops
}

fn node_body(node: &NewClassificationNode) -> Value {
    let mut attributes = serde_json::Map::new();
    if let Some(start) = node.start_date {
        attributes.insert("startDate".into(), Value::String(start.to_rfc3339()));
    }
    if let Some(finish) = node.finish_date {
        attributes.insert("finishDate".into(), Value::String(finish.to_rfc3339()));
    }
    if attributes.is_empty() {
        json!({ "name": node.name })
    } else {
        json!({ "name": node.name, "attributes": attributes })
    }
}

fn operation_status(status: &str) -> OperationStatus {
    match status.to_ascii_lowercase().as_str() {
        "succeeded" => OperationStatus::Succeeded,
        "failed" | "cancelled" => OperationStatus::Failed,
        _ => OperationStatus::InProgress,
    }
}

impl TargetConnector for AdoClient {
    fn get_work_item(&self, id: i64) -> Result<Option<WorkItem>> {
        match self.get_json::<Value>(self.project_url(&format!("wit/workitems/{id}?$expand=relations"))) {
            Ok(value) => parse_work_item(value).map(Some),
            Err(Error::NotFoundError(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn create_work_item(&self, wi_type: &str) -> Result<Option<WorkItem>> {
        let body = json!([
            { "op": "add", "path": format!("/fields/{}", field_ref::TITLE), "value": PLACEHOLDER_TITLE }
        ]);
        let value: Value = self.send_json(
            reqwest::Method::POST,
            self.project_url(&format!(
                "wit/workitems/${}?bypassRules=true&suppressNotifications=true",
                urlencoding::encode(wi_type)
            )),
            JSON_PATCH,
            &body,
        )?;
        if value.is_null() {
            return Ok(None);
        }
        parse_work_item(value).map(Some)
    }

    fn update_work_item(&self, id: i64, patch: &WorkItemPatch) -> Result<WorkItem> {
        let value: Value = self.send_json(
            reqwest::Method::PATCH,
            format!(
                "{}/_apis/wit/workitems/{}?bypassRules=true&suppressNotifications=true&$expand=relations",
                self.base(),
                id
            ),
            JSON_PATCH,
            &Value::Array(patch_document(patch)),
        )?;
        parse_work_item(value)
    }

    fn get_classification_tree(&self, kind: ClassificationKind) -> Result<ClassificationNode> {
        self.get_json(self.project_url(&format!(
            "wit/classificationnodes/{}?$depth=1000",
            kind.structure_group()
        )))
    }

    fn create_classification_node(
        &self,
        kind: ClassificationKind,
        node: &NewClassificationNode,
        parent_path: &str,
    ) -> Result<ClassificationNode> {
        let mut resource = format!("wit/classificationnodes/{}", kind.structure_group());
        for segment in parent_path.split('/').filter(|s| !s.is_empty()) {
            resource.push('/');
            resource.push_str(&urlencoding::encode(segment));
        }
        self.send_json(
            reqwest::Method::POST,
            self.project_url(&resource),
            "application/json",
            &node_body(node),
        )
    }

    fn upload_attachment(&self, path: &Path) -> Result<String> {
        let content = std::fs::read(path)?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let url = Self::with_version(self.project_url(&format!(
            "wit/attachments?fileName={}",
            urlencoding::encode(&file_name)
        )));
        debug!("POST {} ({} bytes)", url, content.len());
        let reference: AttachmentReference = self
            .send(&url, || {
                self.client
                    .post(&url)
                    .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                    .body(content.clone())
            })?
            .json()
            .map_err(|e| Error::ParseError(format!("Failed to parse attachment reference: {e}")))?;
        Ok(reference.url)
    }

    fn get_project(&self, name: &str) -> Result<Option<TargetProject>> {
        match self.get_json(format!("{}/_apis/projects/{}", self.base(), urlencoding::encode(name))) {
            Ok(project) => Ok(Some(project)),
            Err(Error::NotFoundError(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn queue_create_project(&self, name: &str, description: &str, process_template: &str) -> Result<String> {
        let processes: ProcessList = self.get_json(format!("{}/_apis/process/processes", self.base()))?;
        let process = processes
            .value
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(process_template))
            .ok_or_else(|| Error::NotFoundError(format!("process template '{process_template}'")))?;

        let body = json!({
            "name": name,
            "description": description,
            "capabilities": {
                "versioncontrol": { "sourceControlType": "Git" },
                "processTemplate": { "templateTypeId": process.id },
            },
        });
        let operation: OperationReference = self.send_json(
            reqwest::Method::POST,
            format!("{}/_apis/projects", self.base()),
            "application/json",
            &body,
        )?;
        Ok(operation.id)
    }

    fn get_operation(&self, operation_id: &str) -> Result<OperationStatus> {
        let operation: Operation = self.get_json(format!("{}/_apis/operations/{}", self.base(), operation_id))?;
        Ok(operation_status(&operation.status))
    }

    fn work_item_url(&self, id: i64) -> String {
        format!("{}/_apis/wit/workItems/{}", self.base(), id)
    }
}
