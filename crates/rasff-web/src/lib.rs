//! Read-only JSON API over the alert table, for dashboards and charts.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use rasff_core::{AlertRecord, Period};
use rasff_storage::{AlertStore, DEFAULT_DATABASE_URL};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "rasff-web";

const DEFAULT_PER_PAGE: usize = 50;
const MAX_PER_PAGE: usize = 1000;
const TOP_COUNTRIES: usize = 10;

#[derive(Clone)]
pub struct AppState {
    pub store: AlertStore,
}

impl AppState {
    pub fn new(store: AlertStore) -> Self {
        Self { store }
    }
}

/// Filters are exact, case-insensitive matches. Absent filters match everything.
#[derive(Debug, Deserialize, Default)]
pub struct AlertsQuery {
    pub year: Option<i32>,
    pub week: Option<u32>,
    pub country_origin: Option<String>,
    pub notification_from: Option<String>,
    pub groupprod: Option<String>,
    pub grouphaz: Option<String>,
    pub prodcat: Option<String>,
    pub hazcat: Option<String>,
    pub page: Option<usize>,
    pub per_page: Option<usize>,
}

impl AlertsQuery {
    fn matches(&self, record: &AlertRecord) -> bool {
        fn text_eq(filter: &Option<String>, value: Option<&str>) -> bool {
            match filter.as_deref().map(str::trim).filter(|f| !f.is_empty()) {
                None => true,
                Some(wanted) => value.is_some_and(|v| v.trim().to_lowercase() == wanted.to_lowercase()),
            }
        }

        self.year.map_or(true, |y| record.year == Some(y))
            && self.week.map_or(true, |w| record.week == Some(w))
            && text_eq(&self.country_origin, record.country_origin.as_deref())
            && text_eq(&self.notification_from, record.notification_from.as_deref())
            && text_eq(&self.groupprod, Some(record.groupprod.as_str()))
            && text_eq(&self.grouphaz, Some(record.grouphaz.as_str()))
            && text_eq(&self.prodcat, Some(record.prodcat.as_str()))
            && text_eq(&self.hazcat, Some(record.hazcat.as_str()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsPage {
    pub page: usize,
    pub per_page: usize,
    pub total: usize,
    pub total_pages: usize,
    pub alerts: Vec<AlertRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FacetCount {
    pub value: String,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Facets {
    pub groupprod: Vec<FacetCount>,
    pub grouphaz: Vec<FacetCount>,
    pub country_origin: Vec<FacetCount>,
    pub year: Vec<FacetCount>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeriodsInfo {
    pub latest_period: Option<Period>,
    pub row_count: u64,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/alerts", get(alerts_handler))
        .route("/api/facets", get(facets_handler))
        .route("/api/periods", get(periods_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(store: AlertStore, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "serving alert api");
    axum::serve(listener, app(AppState::new(store))).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let port: u16 = std::env::var("RASFF_WEB_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000);
    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());
    let store = AlertStore::connect_read_only(&database_url).await?;
    serve(store, port).await
}

async fn health_handler() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

async fn alerts_handler(State(state): State<Arc<AppState>>, Query(query): Query<AlertsQuery>) -> Response {
    match state.store.read_all().await {
        Ok(records) => Json(filtered_paginated_alerts(records, &query)).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn facets_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.store.read_all().await {
        Ok(records) => Json(facet_counts(&records)).into_response(),
        Err(err) => server_error(err.into()),
    }
}

async fn periods_handler(State(state): State<Arc<AppState>>) -> Response {
    let info = async {
        Ok::<_, anyhow::Error>(PeriodsInfo {
            latest_period: state.store.latest_period().await?,
            row_count: state.store.count().await?,
        })
    };
    match info.await {
        Ok(info) => Json(info).into_response(),
        Err(err) => server_error(err),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %format!("{err:#}"), "alert api request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}

fn filtered_paginated_alerts(records: Vec<AlertRecord>, query: &AlertsQuery) -> AlertsPage {
    let filtered = records
        .into_iter()
        .filter(|r| query.matches(r))
        .collect::<Vec<_>>();

    let per_page = query.per_page.unwrap_or(DEFAULT_PER_PAGE).clamp(1, MAX_PER_PAGE);
    let total = filtered.len();
    let total_pages = total.max(1).div_ceil(per_page);
    let page = query.page.unwrap_or(1).clamp(1, total_pages);
    let start = (page - 1) * per_page;
    let alerts = filtered.into_iter().skip(start).take(per_page).collect::<Vec<_>>();

    AlertsPage {
        page,
        per_page,
        total,
        total_pages,
        alerts,
    }
}

/// Most frequent first; ties broken by value.
fn ranked<'a>(values: impl Iterator<Item = &'a str>) -> Vec<FacetCount> {
    let mut counts = BTreeMap::<&str, usize>::new();
    for value in values {
        *counts.entry(value).or_default() += 1;
    }
    let mut out = counts
        .into_iter()
        .map(|(value, count)| FacetCount {
            value: value.to_string(),
            count,
        })
        .collect::<Vec<_>>();
    out.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.value.cmp(&b.value)));
    out
}

fn facet_counts(records: &[AlertRecord]) -> Facets {
    let mut country_origin = ranked(records.iter().filter_map(|r| r.country_origin.as_deref()));
    country_origin.truncate(TOP_COUNTRIES);

    let mut years = BTreeMap::<i32, usize>::new();
    for year in records.iter().filter_map(|r| r.year) {
        *years.entry(year).or_default() += 1;
    }

    Facets {
        groupprod: ranked(records.iter().map(|r| r.groupprod.as_str())),
        grouphaz: ranked(records.iter().map(|r| r.grouphaz.as_str())),
        country_origin,
        year: years
            .into_iter()
            .map(|(year, count)| FacetCount {
                value: year.to_string(),
                count,
            })
            .collect(),
    }
}
