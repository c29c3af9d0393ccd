use crate::server::ApiState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Utc};
use courier_primitives::Log;
use courier_store::LogPage;
use ethers::{types::Address, utils::to_checksum};
use serde::Serialize;
use serde_json::json;
use std::{collections::HashMap, sync::Arc};
use tracing::warn;

const DEFAULT_LIMIT: i64 = 20;

/// Pagination envelope. `total` mirrors the legacy behavior of reporting
/// the window end rather than a row count.
#[derive(Serialize)]
struct Pagination {
    limit: i64,
    offset: i64,
    total: i64,
}

#[derive(Serialize)]
struct PagedBody {
    array: Vec<Log>,
    meta: Pagination,
}

fn paged(logs: Vec<Log>, page: LogPage) -> Response {
    let meta =
        Pagination { limit: page.limit, offset: page.offset, total: page.offset + page.limit };
    Json(PagedBody { array: logs, meta }).into_response()
}

fn page_from(params: &HashMap<String, String>) -> LogPage {
    let limit =
        params.get("limit").and_then(|v| v.parse().ok()).unwrap_or(DEFAULT_LIMIT);
    let offset = params.get("offset").and_then(|v| v.parse().ok()).unwrap_or(0);

    LogPage { limit, offset }
}

/// RFC 3339; anything unparseable falls back to now.
fn date_from(params: &HashMap<String, String>, key: &str) -> DateTime<Utc> {
    params
        .get(key)
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(Utc::now)
}

/// `data.<name>=<literal>` query params form the AND filter map;
/// `data2.<name>=<literal>` params the optional OR map.
fn filters_from(params: &HashMap<String, String>, prefix: &str) -> Vec<(String, String)> {
    params
        .iter()
        .filter_map(|(k, v)| {
            k.strip_prefix(prefix).map(|name| (name.to_string(), v.clone()))
        })
        .collect()
}

fn checksummed(contract: &str) -> Result<String, Response> {
    contract
        .parse::<Address>()
        .map(|addr| to_checksum(&addr, None))
        .map_err(|_| StatusCode::BAD_REQUEST.into_response())
}

pub async fn get_single(
    State(state): State<Arc<ApiState>>,
    Path((_contract, hash)): Path<(String, String)>,
) -> Response {
    match state.store.logs.get_log(&hash).await {
        Ok(log) => Json(json!({ "object": log })).into_response(),
        Err(courier_store::StoreError::NotFound) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => {
            warn!(error = %err, "error fetching log");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub async fn get(
    State(state): State<Arc<ApiState>>,
    Path((contract, topic)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let contract = match checksummed(&contract) {
        Ok(contract) => contract,
        Err(resp) => return resp,
    };

    let page = page_from(&params);
    let max_date = date_from(&params, "maxDate");
    let filters = filters_from(&params, "data.");
    let or_filters = filters_from(&params, "data2.");

    match state
        .store
        .logs
        .paginated(&contract, &topic.to_lowercase(), max_date, &filters, &or_filters, page)
        .await
    {
        Ok(logs) => paged(logs, page),
        Err(err) => {
            warn!(error = %err, "error fetching logs");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub async fn get_all(
    State(state): State<Arc<ApiState>>,
    Path((contract, topic)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let contract = match checksummed(&contract) {
        Ok(contract) => contract,
        Err(resp) => return resp,
    };

    let page = page_from(&params);
    let max_date = date_from(&params, "maxDate");

    match state.store.logs.all_paginated(&contract, &topic.to_lowercase(), max_date, page).await {
        Ok(logs) => paged(logs, page),
        Err(err) => {
            warn!(error = %err, "error fetching logs");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub async fn get_new(
    State(state): State<Arc<ApiState>>,
    Path((contract, topic)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let contract = match checksummed(&contract) {
        Ok(contract) => contract,
        Err(resp) => return resp,
    };

    let page = page_from(&params);
    let from_date = date_from(&params, "fromDate");
    let filters = filters_from(&params, "data.");
    let or_filters = filters_from(&params, "data2.");

    match state
        .store
        .logs
        .new_logs(&contract, &topic.to_lowercase(), from_date, &filters, &or_filters, page)
        .await
    {
        Ok(logs) => paged(logs, page),
        Err(err) => {
            warn!(error = %err, "error fetching new logs");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

pub async fn get_all_new(
    State(state): State<Arc<ApiState>>,
    Path((contract, topic)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let contract = match checksummed(&contract) {
        Ok(contract) => contract,
        Err(resp) => return resp,
    };

    let page = page_from(&params);
    let from_date = date_from(&params, "fromDate");

    match state.store.logs.all_new_logs(&contract, &topic.to_lowercase(), from_date, page).await {
        Ok(logs) => paged(logs, page),
        Err(err) => {
            warn!(error = %err, "error fetching new logs");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_defaults_apply() {
        let params = HashMap::new();
        let page = page_from(&params);

        assert_eq!(page.limit, DEFAULT_LIMIT);
        assert_eq!(page.offset, 0);
    }

    #[test]
    fn malformed_dates_fall_back_to_now() {
        let mut params = HashMap::new();
        params.insert("maxDate".to_string(), "yesterday-ish".to_string());

        let before = Utc::now();
        let parsed = date_from(&params, "maxDate");
        assert!(parsed >= before);
    }

    #[test]
    fn filter_prefixes_split_and_or_maps() {
        let mut params = HashMap::new();
        params.insert("data.from".to_string(), "0xA".to_string());
        params.insert("data2.to".to_string(), "0xA".to_string());
        params.insert("limit".to_string(), "5".to_string());

        let filters = filters_from(&params, "data.");
        let or_filters = filters_from(&params, "data2.");

        assert_eq!(filters, vec![("from".to_string(), "0xA".to_string())]);
        assert_eq!(or_filters, vec![("to".to_string(), "0xA".to_string())]);
    }
}
