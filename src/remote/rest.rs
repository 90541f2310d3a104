use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_RANGE};
use reqwest::{Method, RequestBuilder, Response};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::cache::{
  scalar_text, Entity, FieldMatch, FieldSpec, FilterSchema, Filters, KeyFactory,
  NormalizedFilters, Page, PageInfo,
};
use crate::config::BackendConfig;
use crate::error::RemoteError;

use super::api_types::{content_range_total, decode_rows, ApiError};
use super::{MutationOp, Pagination, RemoteExecutor};

/// PostgREST client for the newsletter backend
#[derive(Clone)]
pub struct RestExecutor {
  client: reqwest::Client,
  base: Url,
  headers: HeaderMap,
  schema: Option<String>,
  keys: Arc<KeyFactory>,
}

impl RestExecutor {
  pub fn new(config: &BackendConfig, token: &str, keys: Arc<KeyFactory>) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    let root = format!("{}/rest/v1/", config.url.trim_end_matches('/'));
    let base = Url::parse(&root).map_err(|e| eyre!("Invalid backend url {}: {}", config.url, e))?;

    let mut headers = HeaderMap::new();
    headers.insert(
      "apikey",
      HeaderValue::from_str(token).map_err(|_| eyre!("API token is not a valid header value"))?,
    );
    headers.insert(
      AUTHORIZATION,
      HeaderValue::from_str(&format!("Bearer {}", token))
        .map_err(|_| eyre!("API token is not a valid header value"))?,
    );

    Ok(Self {
      client,
      base,
      headers,
      schema: config.schema.clone(),
      keys,
    })
  }

  fn table_url(&self, table: &str) -> Result<Url, RemoteError> {
    self
      .base
      .join(table)
      .map_err(|e| RemoteError::transport(format!("invalid table {}: {}", table, e)))
  }

  fn request(&self, method: Method, url: Url) -> RequestBuilder {
    let profile_header = if method == Method::GET {
      "Accept-Profile"
    } else {
      "Content-Profile"
    };
    let mut builder = self.client.request(method, url).headers(self.headers.clone());
    if let Some(schema) = &self.schema {
      builder = builder.header(profile_header, schema);
    }
    builder
  }

  async fn send(&self, builder: RequestBuilder) -> Result<Response, RemoteError> {
    let response = builder
      .send()
      .await
      .map_err(|e| RemoteError::transport(e.to_string()))?;

    let status = response.status();
    if status.is_success() {
      return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(RemoteError::Rejected {
      status: status.as_u16(),
      message: ApiError::describe(&body),
    })
  }

  async fn rows(response: Response) -> Result<Vec<Entity>, RemoteError> {
    let body: Value = response
      .json()
      .await
      .map_err(|e| RemoteError::decode(e.to_string()))?;
    decode_rows(body)
  }
}

#[async_trait]
impl RemoteExecutor for RestExecutor {
  async fn fetch(
    &self,
    table: &str,
    filters: &Filters,
    pagination: Pagination,
  ) -> Result<Page, RemoteError> {
    let mut url = self.table_url(table)?;
    {
      let mut query = url.query_pairs_mut();
      query.append_pair("select", "*");
      for (name, value) in filter_params(self.keys.schema(table), filters) {
        query.append_pair(&name, &value);
      }
      query.append_pair("offset", &pagination.offset.to_string());
      if let Some(limit) = pagination.limit {
        query.append_pair("limit", &limit.to_string());
      }
    }
    debug!(table, url = %url, "fetching rows");

    let response = self
      .send(self.request(Method::GET, url).header("Prefer", "count=exact"))
      .await?;
    let total = response
      .headers()
      .get(CONTENT_RANGE)
      .and_then(|v| v.to_str().ok())
      .and_then(content_range_total);
    let items = Self::rows(response).await?;

    let fetched = items.len() as u64;
    let total_count = total.unwrap_or(pagination.offset + fetched);
    Ok(Page {
      items,
      total_count,
      page_info: PageInfo {
        offset: pagination.offset,
        limit: pagination.limit.unwrap_or(fetched),
        has_more: pagination.offset + fetched < total_count,
      },
    })
  }

  async fn fetch_by_id(&self, table: &str, id: &str) -> Result<Entity, RemoteError> {
    let mut url = self.table_url(table)?;
    url
      .query_pairs_mut()
      .append_pair("select", "*")
      .append_pair("id", &format!("eq.{}", id))
      .append_pair("limit", "1");
    debug!(table, id, "fetching row");

    let response = self.send(self.request(Method::GET, url)).await?;
    Self::rows(response)
      .await?
      .into_iter()
      .next()
      .ok_or_else(|| RemoteError::NotFound {
        table: table.to_string(),
        id: id.to_string(),
      })
  }

  async fn mutate(
    &self,
    table: &str,
    op: MutationOp,
    payload: Value,
  ) -> Result<Vec<Entity>, RemoteError> {
    let mut url = self.table_url(table)?;
    let (method, conditions) = match &op {
      MutationOp::Insert => (Method::POST, None),
      MutationOp::Update { ids } => (Method::PATCH, Some(id_condition(ids))),
      MutationOp::Delete { ids } => (Method::DELETE, Some(id_condition(ids))),
      MutationOp::DeleteMatching { columns } => (Method::DELETE, Some(filter_params(None, columns))),
    };
    if let Some(conditions) = conditions {
      // An unfiltered PATCH or DELETE would hit the whole table
      if conditions.is_empty() {
        return Ok(Vec::new());
      }
      let mut query = url.query_pairs_mut();
      for (name, value) in conditions {
        query.append_pair(&name, &value);
      }
    }
    debug!(table, ?op, "mutating rows");

    let mut builder = self
      .request(method, url)
      .header("Prefer", "return=representation");
    if !matches!(op, MutationOp::Delete { .. } | MutationOp::DeleteMatching { .. }) {
      builder = builder.json(&payload);
    }
    let rows = Self::rows(self.send(builder).await?).await?;

    match op {
      MutationOp::Update { ids } if rows.is_empty() => Err(RemoteError::NotFound {
        table: table.to_string(),
        id: ids.join(","),
      }),
      _ => Ok(rows),
    }
  }
}

/// PostgREST query parameters for `filters`. Declared defaults are sent even
/// when the caller omitted them; unknown fields are matched by equality.
pub(crate) fn filter_params(schema: Option<&FilterSchema>, filters: &Filters) -> Vec<(String, String)> {
  let normalized = NormalizedFilters::normalize(schema, filters);
  let mut params = Vec::new();

  if let Some(schema) = schema {
    for spec in schema.fields {
      if let Some(param) = normalized.effective(spec).and_then(|value| field_param(spec, &value)) {
        params.push(param);
      }
    }
  }
  for (name, value) in normalized.iter() {
    if schema.and_then(|s| s.field(name)).is_none() {
      params.push((name.clone(), format!("eq.{}", scalar_text(value))));
    }
  }
  params
}

fn field_param(spec: &FieldSpec, value: &Value) -> Option<(String, String)> {
  let column = spec.column.to_string();
  match spec.matching {
    FieldMatch::Eq => Some((column, format!("eq.{}", scalar_text(value)))),
    FieldMatch::AnyOf => match value {
      Value::Array(items) if items.is_empty() => None,
      Value::Array(items) => {
        let texts: Vec<String> = items.iter().map(scalar_text).collect();
        Some((column, format!("in.({})", list_values(texts.iter().map(String::as_str)))))
      }
      scalar => Some((column, format!("eq.{}", scalar_text(scalar)))),
    },
    FieldMatch::Overlaps => {
      let texts: Vec<String> = match value {
        Value::Array(items) => items.iter().map(scalar_text).collect(),
        scalar => vec![scalar_text(scalar)],
      };
      if texts.is_empty() {
        return None;
      }
      Some((column, format!("ov.{{{}}}", list_values(texts.iter().map(String::as_str)))))
    }
    FieldMatch::Search => Some((column, format!("ilike.*{}*", scalar_text(value)))),
    FieldMatch::Order => {
      let order = match scalar_text(value).as_str() {
        "newest" => format!("{}.desc", spec.column),
        "oldest" => format!("{}.asc", spec.column),
        other => other.to_string(),
      };
      Some(("order".to_string(), order))
    }
    // Pagination travels separately as offset/limit
    FieldMatch::Page => None,
  }
}

fn id_condition(ids: &[String]) -> Vec<(String, String)> {
  if ids.is_empty() {
    return Vec::new();
  }
  vec![(
    "id".to_string(),
    format!("in.({})", list_values(ids.iter().map(String::as_str))),
  )]
}

/// Comma-separated list, quoting values PostgREST would otherwise split.
fn list_values<'a>(values: impl Iterator<Item = &'a str>) -> String {
  values
    .map(|v| {
      if v.contains([',', '(', ')', '{', '}', '"']) {
        format!("\"{}\"", v.replace('"', "\\\""))
      } else {
        v.to_string()
      }
    })
    .collect::<Vec<_>>()
    .join(",")
}
