use crate::config::ServiceConfig;
use crate::error::SyncError;
use crate::http::{ApiRequest, TokenPlacement};
use crate::state::WindowOptions;
use crate::window::{ChunkPolicy, ChunkWindow};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Utc};
use serde_json::Value;
use std::sync::Arc;
use url::Url;

/// A record ready for the sink: the provider's own stable id plus the
/// opaque payload. Field-level typing stays inside provider adapters.
#[derive(Debug, Clone)]
pub struct NormalizedRecord {
    pub natural_id: String,
    pub payload: Value,
}

pub type MapFn = Arc<dyn Fn(&Value) -> Result<Vec<NormalizedRecord>, SyncError> + Send + Sync>;
pub type TimestampFn = Arc<dyn Fn(&Value) -> Option<DateTime<Utc>> + Send + Sync>;
pub type WindowRequestFn = Arc<dyn Fn(&ChunkWindow) -> ApiRequest + Send + Sync>;

/// One reference-data endpoint: fetched whole, in the master fan-out.
#[derive(Clone)]
pub struct MasterStream {
    pub name: String,
    pub request: ApiRequest,
    pub table: String,
    pub conflict_key: String,
    pub map: MapFn,
}

/// The bulk event/transaction endpoint, fetched in watermark-derived chunks.
#[derive(Clone)]
pub struct EntityStream {
    pub name: String,
    pub table: String,
    pub conflict_key: String,
    pub request: WindowRequestFn,
    pub map: MapFn,
    /// Record timestamp used for watermark progress and backward-chunk
    /// boundaries.
    pub timestamp: TimestampFn,
}

/// The strategy seam: everything provider-specific the engine needs, and
/// nothing else. Lifecycle, retries, pagination and persistence stay in the
/// engine; an adapter carries endpoint URLs and mapping closures.
pub trait Connector: Send + Sync {
    fn service(&self) -> &str;

    fn token_placement(&self) -> TokenPlacement {
        TokenPlacement::Bearer
    }

    fn chunk_policy(&self) -> ChunkPolicy;

    fn window_options(&self) -> WindowOptions {
        WindowOptions::default()
    }

    fn master_streams(&self) -> Vec<MasterStream>;

    fn entity_stream(&self) -> EntityStream;
}

/// Declarative endpoint description used by [`RestConnector`].
#[derive(Debug, Clone)]
pub struct RestEndpoint {
    pub name: String,
    pub url: Url,
    pub table: String,
    pub conflict_key: String,
    /// JSON pointer to the record array inside the response; `None` means
    /// the response body is the array.
    pub items_pointer: Option<String>,
    pub id_field: String,
    pub timestamp_field: Option<String>,
    pub start_param: Option<String>,
    pub end_param: Option<String>,
}

/// Generic adapter for plain REST/JSON providers: records live in an array,
/// carry their own id, and take date-range query parameters. Providers with
/// richer envelopes implement [`Connector`] directly.
pub struct RestConnector {
    pub service: String,
    pub placement: TokenPlacement,
    pub policy: ChunkPolicy,
    pub window: WindowOptions,
    pub masters: Vec<RestEndpoint>,
    pub entity: RestEndpoint,
}

impl RestConnector {
    /// Build from the binary's config section. Returns `None` when no
    /// service is configured.
    pub fn from_config(cfg: &ServiceConfig) -> Result<Option<Self>, SyncError> {
        let (Some(name), Some(base_url)) = (&cfg.name, &cfg.base_url) else {
            return Ok(None);
        };
        let entity_path = cfg.entity_path.clone().unwrap_or_else(|| "/".to_string());
        let url = base_url.join(&entity_path)?;

        let policy = match cfg.chunk_mode.as_deref() {
            Some("backward") => ChunkPolicy::Backward {
                max_items: cfg.max_items.unwrap_or(100),
            },
            _ => ChunkPolicy::Forward {
                max_span: TimeDelta::days(cfg.max_span_days.unwrap_or(30).max(1)),
            },
        };

        let entity = RestEndpoint {
            name: cfg.entity_table.clone().unwrap_or_else(|| "entries".to_string()),
            url,
            table: cfg.entity_table.clone().unwrap_or_else(|| "entries".to_string()),
            conflict_key: cfg
                .conflict_key
                .clone()
                .unwrap_or_else(|| "natural_id".to_string()),
            items_pointer: cfg.items_pointer.clone(),
            id_field: cfg.id_field.clone().unwrap_or_else(|| "id".to_string()),
            timestamp_field: cfg.timestamp_field.clone(),
            start_param: cfg.start_param.clone(),
            end_param: cfg.end_param.clone(),
        };

        Ok(Some(Self {
            service: name.clone(),
            placement: TokenPlacement::Bearer,
            policy,
            window: WindowOptions {
                default_days: cfg.default_days.unwrap_or(7),
                margin_days: cfg.margin_days.unwrap_or(1),
            },
            masters: Vec::new(),
            entity,
        }))
    }
}

impl Connector for RestConnector {
    fn service(&self) -> &str {
        &self.service
    }

    fn token_placement(&self) -> TokenPlacement {
        self.placement.clone()
    }

    fn chunk_policy(&self) -> ChunkPolicy {
        self.policy
    }

    fn window_options(&self) -> WindowOptions {
        self.window
    }

    fn master_streams(&self) -> Vec<MasterStream> {
        self.masters
            .iter()
            .map(|ep| MasterStream {
                name: ep.name.clone(),
                request: ApiRequest::get(ep.url.clone()),
                table: ep.table.clone(),
                conflict_key: ep.conflict_key.clone(),
                map: array_map_fn(ep.items_pointer.clone(), ep.id_field.clone()),
            })
            .collect()
    }

    fn entity_stream(&self) -> EntityStream {
        let ep = &self.entity;
        EntityStream {
            name: ep.name.clone(),
            table: ep.table.clone(),
            conflict_key: ep.conflict_key.clone(),
            request: window_request_fn(
                ep.url.clone(),
                ep.start_param.clone(),
                ep.end_param.clone(),
            ),
            map: array_map_fn(ep.items_pointer.clone(), ep.id_field.clone()),
            timestamp: field_timestamp_fn(ep.timestamp_field.clone()),
        }
    }
}

/// Map a JSON response to records: resolve the optional pointer, expect an
/// array, lift each element's id.
pub fn array_map_fn(pointer: Option<String>, id_field: String) -> MapFn {
    Arc::new(move |value: &Value| {
        let items = match &pointer {
            Some(p) => value
                .pointer(p)
                .ok_or_else(|| SyncError::Payload(format!("response has no value at '{p}'")))?,
            None => value,
        };
        let arr = items
            .as_array()
            .ok_or_else(|| SyncError::Payload("expected a JSON array of records".to_string()))?;
        arr.iter()
            .map(|item| {
                let id = item.get(&id_field).and_then(value_to_id).ok_or_else(|| {
                    SyncError::Payload(format!("record missing id field '{id_field}'"))
                })?;
                Ok(NormalizedRecord {
                    natural_id: id,
                    payload: item.clone(),
                })
            })
            .collect()
    })
}

pub fn field_timestamp_fn(field: Option<String>) -> TimestampFn {
    Arc::new(move |payload: &Value| {
        field
            .as_ref()
            .and_then(|f| payload.get(f))
            .and_then(parse_timestamp)
    })
}

fn window_request_fn(
    url: Url,
    start_param: Option<String>,
    end_param: Option<String>,
) -> WindowRequestFn {
    Arc::new(move |win: &ChunkWindow| {
        let mut req = ApiRequest::get(url.clone());
        if let Some(p) = &start_param {
            req = req.query(p.clone(), win.start.format("%Y-%m-%d").to_string());
        }
        if let Some(p) = &end_param {
            req = req.query(p.clone(), win.end.format("%Y-%m-%d").to_string());
        }
        req
    })
}

fn value_to_id(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Timestamps as providers actually emit them: RFC3339, bare
/// `YYYY-MM-DD HH:MM:SS` (taken as UTC), or a plain date.
pub fn parse_timestamp(v: &Value) -> Option<DateTime<Utc>> {
    let s = v.as_str()?;
    if let Ok(t) = DateTime::parse_from_rfc3339(s) {
        return Some(t.with_timezone(&Utc));
    }
    if let Ok(n) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(n.and_utc());
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(d.and_time(NaiveTime::MIN).and_utc());
    }
    None
}
