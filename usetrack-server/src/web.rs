//! # Web Reporter
//!
//! JSON routes over a [`Usetrack`] pipeline, mounted under `web.mount_path`:
//!
//! - `GET /{mount}`: every enabled tracker's aggregate. In paged mode one page
//!   per tracker, steered by `kind`, `cursor` and `limit` query parameters.
//! - `GET /{mount}/status`: reporter state, metrics and configuration summary.
//! - `POST /{mount}/clear`: clears every enabled namespace; `404` unless
//!   `web.enable_clear` is set.
//! - `GET /up`: health check, itself recorded through the route tracker.
//!
//! ## Design Principles
//!
//! 1. **Degrade Per Tracker**: A tracker whose read fails renders as
//!    `{"status": "unavailable"}`; the rest of the report still renders.
//! 2. **Errors as JSON**: Handler failures become `{"error": ...}` bodies with a
//!    matching status code; nothing escapes as a bare rejection.

use std::convert::Infallible;
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};
use usetrack_common::{AggregateRecord, MAX_PAGE_SIZE, TrackerKind, UsetrackError, unix_now};
use usetrack_store::StorageAdapter;
use usetrack_tracker::Usetrack;
use warp::filters::BoxedFilter;
use warp::http::StatusCode;
use warp::reply::Response;
use warp::{Filter, Reply};

#[derive(Debug)]
struct AnyhowRejection(anyhow::Error);

impl warp::reject::Reject for AnyhowRejection {}

/// Query parameters of the report route.
#[derive(Debug, Default, Deserialize)]
pub struct ReportQuery {
    /// Restricts the report to one tracker kind.
    pub kind: Option<String>,
    /// Paged mode only; requires `kind`.
    pub cursor: Option<String>,
    /// Paged mode only; defaults to `web.page_size`.
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum TrackerSection {
    #[serde(rename = "ok")]
    Full {
        units: usize,
        hits: u64,
        records: Vec<AggregateRecord>,
    },
    #[serde(rename = "ok")]
    Page {
        /// Units in the whole namespace, not just this page.
        units: usize,
        records: Vec<AggregateRecord>,
        next_cursor: Option<String>,
    },
    Unavailable {
        category: &'static str,
        error: String,
    },
}

/// Builds every route for `usetrack`.
pub fn routes(
    usetrack: Arc<Usetrack>,
) -> impl Filter<Extract = (impl Reply,), Error = Infallible> + Clone + Send + Sync + 'static {
    let mount = mount_filter(&usetrack.config().web.mount_path);

    let ctx = usetrack.clone();
    let report_route = unwrap_all_anyhow(
        mount
            .clone()
            .and(warp::path::end())
            .and(warp::get())
            .and(warp::query::<ReportQuery>())
            .then(move |query| {
                let ctx = ctx.clone();
                async move { handle_report(ctx, query).await }
            }),
    );

    let ctx = usetrack.clone();
    let status_route = unwrap_all_anyhow(
        mount
            .clone()
            .and(warp::path("status"))
            .and(warp::path::end())
            .and(warp::get())
            .then(move || {
                let ctx = ctx.clone();
                async move { handle_status(ctx).await }
            }),
    );

    let ctx = usetrack.clone();
    let clear_route = unwrap_all_anyhow(
        mount
            .and(warp::path("clear"))
            .and(warp::path::end())
            .and(warp::post())
            .then(move || {
                let ctx = ctx.clone();
                async move { handle_clear(ctx).await }
            }),
    );

    let ctx = usetrack;
    let up_route = warp::path("up")
        .and(warp::path::end())
        .and(warp::get())
        .map(move || {
            ctx.trackers().record_route("GET", "/up");
            warp::reply::json(&json!({"status": "ok"})).into_response()
        });

    report_route
        .or(status_route)
        .unify()
        .or(clear_route)
        .unify()
        .or(up_route)
        .unify()
        .recover(|err: warp::reject::Rejection| async move {
            let (status, message) = if err.is_not_found() {
                (StatusCode::NOT_FOUND, "Not Found".to_string())
            } else if let Some(invalid) = err.find::<warp::reject::InvalidQuery>() {
                (StatusCode::BAD_REQUEST, invalid.to_string())
            } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
                (StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed".to_string())
            } else {
                (StatusCode::INTERNAL_SERVER_ERROR, format!("{err:?}"))
            };
            Ok::<_, Infallible>(error_reply(status, message))
        })
}

/// Matches the configured mount path, which may span several segments.
fn mount_filter(mount_path: &str) -> BoxedFilter<()> {
    mount_path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .fold(warp::any().boxed(), |filter, segment| {
            filter.and(warp::path(segment.to_string())).boxed()
        })
}

fn unwrap_all_anyhow(
    route: impl Filter<Extract = (Result<Response>,), Error = warp::Rejection>
        + Clone
        + Send
        + Sync
        + 'static,
) -> impl Filter<Extract = (Response,), Error = warp::Rejection> + Clone + Send + Sync + 'static {
    route
        .boxed()
        .and_then(|res: Result<Response>| async move {
            res.map_err(|e| warp::reject::custom(AnyhowRejection(e)))
        })
        .recover(|err: warp::reject::Rejection| async move {
            let Some(AnyhowRejection(inner)) = err.find::<AnyhowRejection>() else {
                return Err(err);
            };
            error!(error = %format!("{inner:#}"), "internal server error");
            Ok(error_reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("{inner:#}"),
            ))
        })
        .unify()
}

fn error_reply(status: StatusCode, message: impl Into<String>) -> Response {
    warp::reply::with_status(
        warp::reply::json(&json!({"error": message.into()})),
        status,
    )
    .into_response()
}

fn json_reply(status: StatusCode, body: &serde_json::Value) -> Response {
    warp::reply::with_status(warp::reply::json(body), status).into_response()
}

async fn handle_report(usetrack: Arc<Usetrack>, query: ReportQuery) -> Result<Response> {
    let web = &usetrack.config().web;

    let adapters: Vec<&Arc<dyn StorageAdapter>> = match query.kind.as_deref() {
        Some(raw) => {
            let Ok(kind) = raw.parse::<TrackerKind>() else {
                return Ok(error_reply(
                    StatusCode::BAD_REQUEST,
                    format!("unknown tracker `{raw}`"),
                ));
            };
            match usetrack.adapter(kind) {
                Some(adapter) => vec![adapter],
                None => {
                    return Ok(error_reply(
                        StatusCode::NOT_FOUND,
                        format!("tracker `{kind}` is disabled"),
                    ));
                }
            }
        }
        None => usetrack.adapters().iter().collect(),
    };

    if web.paged_reporting && query.cursor.is_some() && query.kind.is_none() {
        return Ok(error_reply(
            StatusCode::BAD_REQUEST,
            "`cursor` requires `kind`",
        ));
    }
    let limit = query.limit.unwrap_or(web.page_size).clamp(1, MAX_PAGE_SIZE);

    let mut trackers = serde_json::Map::new();
    for adapter in adapters {
        let kind = adapter.namespace().kind();
        let section = if web.paged_reporting {
            page_section(adapter.as_ref(), query.cursor.as_deref(), limit).await
        } else {
            full_section(adapter.as_ref()).await
        };
        let section = match section {
            Ok(section) => section,
            Err(err @ UsetrackError::InvalidCursor(_)) => {
                return Ok(error_reply(StatusCode::BAD_REQUEST, err.to_string()));
            }
            Err(err) => {
                warn!(%kind, error = %err, "tracker read failed");
                TrackerSection::Unavailable {
                    category: err.category().as_str(),
                    error: err.to_string(),
                }
            }
        };
        trackers.insert(kind.as_str().to_string(), serde_json::to_value(&section)?);
    }

    let config = usetrack.config();
    Ok(json_reply(
        StatusCode::OK,
        &json!({
            "environment": config.environment,
            "backend": config.store.backend,
            "mode": if web.paged_reporting { "paged" } else { "direct" },
            "generated_at": unix_now(),
            "trackers": trackers,
        }),
    ))
}

async fn full_section(adapter: &dyn StorageAdapter) -> Result<TrackerSection, UsetrackError> {
    let records = adapter.read().await?;
    Ok(TrackerSection::Full {
        units: records.len(),
        hits: records.iter().map(|r| r.hits).sum(),
        records,
    })
}

async fn page_section(
    adapter: &dyn StorageAdapter,
    cursor: Option<&str>,
    limit: usize,
) -> Result<TrackerSection, UsetrackError> {
    let page = adapter.read_page(cursor, limit).await?;
    Ok(TrackerSection::Page {
        units: adapter.unit_count().await?,
        records: page.records,
        next_cursor: page.next_cursor,
    })
}

async fn handle_status(usetrack: Arc<Usetrack>) -> Result<Response> {
    let config = usetrack.config();
    let reporter = usetrack.reporter();
    let trackers: Vec<&str> = usetrack
        .adapters()
        .iter()
        .map(|a| a.namespace().kind().as_str())
        .collect();

    Ok(json_reply(
        StatusCode::OK,
        &json!({
            "state": reporter.state().as_str(),
            "running": usetrack.is_running(),
            "environment": config.environment,
            "store": usetrack.store().describe(),
            "backend": config.store.backend,
            "trackers": trackers,
            "reporting": {
                "interval_secs": reporter.interval().as_secs(),
                "wiggle_secs": reporter.wiggle().as_secs(),
                "on_failure": reporter.policy(),
            },
            "web": {
                "paged_reporting": config.web.paged_reporting,
                "page_size": config.web.page_size,
                "clear_enabled": config.web.enable_clear,
            },
            "metrics": reporter.metrics().snapshot(),
        }),
    ))
}

async fn handle_clear(usetrack: Arc<Usetrack>) -> Result<Response> {
    if !usetrack.config().web.enable_clear {
        return Ok(error_reply(StatusCode::NOT_FOUND, "clear is disabled"));
    }

    let mut cleared = Vec::new();
    let mut errors = serde_json::Map::new();
    for adapter in usetrack.adapters() {
        let kind = adapter.namespace().kind();
        match adapter.clear().await {
            Ok(()) => cleared.push(kind.as_str()),
            Err(err) => {
                warn!(%kind, error = %err, "clear failed");
                errors.insert(kind.as_str().to_string(), json!(err.to_string()));
            }
        }
    }
    info!(cleared = ?cleared, failed = errors.len(), "aggregate cleared");

    if errors.is_empty() {
        Ok(json_reply(StatusCode::OK, &json!({"cleared": cleared})))
    } else {
        Ok(json_reply(
            StatusCode::SERVICE_UNAVAILABLE,
            &json!({"cleared": cleared, "errors": errors}),
        ))
    }
}
