//! Metrics API HTTP surface
//!
//! Serves `external.metrics.k8s.io/v1beta1` and `custom.metrics.k8s.io/v1beta2`
//! as an aggregated API server would, plus `/healthz`.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use cloudmetrics_cache::GroupResource;
use cloudmetrics_common::Selector;
use cloudmetrics_provider::{CustomQuery, MetricValue, MetricsProvider, ProviderError};

use crate::lookup::{LookupError, TargetLookup, TargetObject};

/// External metrics API group/version
pub const EXTERNAL_GROUP_VERSION: &str = "external.metrics.k8s.io/v1beta1";

/// Custom metrics API group/version
pub const CUSTOM_GROUP_VERSION: &str = "custom.metrics.k8s.io/v1beta2";

/// Wildcard object name in custom metric paths
const ANY_OBJECT: &str = "*";

/// In-flight requests get this long to finish on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Shared state for handlers
#[derive(Clone)]
pub struct AppState {
    /// Resolution and fetch
    pub provider: MetricsProvider,
    /// Target object labels
    pub lookup: Arc<dyn TargetLookup>,
    /// Set once the initial declaration sync is done
    pub ready: Arc<AtomicBool>,
}

/// Listener settings
#[derive(Clone, Debug)]
pub struct ServeConfig {
    /// Address to bind
    pub addr: SocketAddr,
    /// PEM certificate and key; plain HTTP when `None`
    pub tls: Option<(PathBuf, PathBuf)>,
}

/// Errors returned to metrics API clients as a Kubernetes `Status`
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resolution or fetch failed
    #[error(transparent)]
    Provider(#[from] ProviderError),

    /// Target lookup failed
    #[error(transparent)]
    Lookup(#[from] LookupError),

    /// The described object does not exist
    #[error("{resource} {namespace}/{name} not found")]
    TargetNotFound {
        /// `resource.group`
        resource: String,
        /// Namespace
        namespace: String,
        /// Object name
        name: String,
    },

    /// The initial declaration sync has not finished
    #[error("initial declaration sync in progress")]
    NotReady,
}

impl ApiError {
    fn status(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Provider(ProviderError::NotConfigured { .. }) => {
                (StatusCode::NOT_FOUND, "NotFound")
            }
            ApiError::Provider(ProviderError::BadSelector(_)) => {
                (StatusCode::BAD_REQUEST, "BadRequest")
            }
            ApiError::Provider(ProviderError::Fetch(_)) => (StatusCode::BAD_GATEWAY, "InternalError"),
            ApiError::Lookup(LookupError::UnknownResource { .. }) | ApiError::TargetNotFound { .. } => {
                (StatusCode::NOT_FOUND, "NotFound")
            }
            ApiError::Lookup(LookupError::Kube(_)) => (StatusCode::BAD_GATEWAY, "InternalError"),
            ApiError::NotReady => (StatusCode::SERVICE_UNAVAILABLE, "ServiceUnavailable"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, reason) = self.status();
        debug!(status = status.as_u16(), error = %self, "Metrics API request failed");

        let body = json!({
            "kind": "Status",
            "apiVersion": "v1",
            "metadata": {},
            "status": "Failure",
            "message": self.to_string(),
            "reason": reason,
            "code": status.as_u16()
        });

        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SelectorParams {
    label_selector: Option<String>,
}

impl SelectorParams {
    fn selector(&self) -> &str {
        self.label_selector.as_deref().unwrap_or_default()
    }
}

/// Build the metrics API router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/apis/external.metrics.k8s.io/v1beta1", get(list_external))
        .route(
            "/apis/external.metrics.k8s.io/v1beta1/namespaces/{namespace}/{metric}",
            get(get_external),
        )
        .route("/apis/custom.metrics.k8s.io/v1beta2", get(list_custom))
        .route(
            "/apis/custom.metrics.k8s.io/v1beta2/namespaces/{namespace}/{resource}/{name}/{metric}",
            get(get_custom),
        )
        .with_state(state)
}

/// Serve `app` until `shutdown` is cancelled
pub async fn serve(config: ServeConfig, app: Router, shutdown: CancellationToken) -> std::io::Result<()> {
    let handle = axum_server::Handle::new();
    let on_shutdown = handle.clone();
    tokio::spawn(async move {
        shutdown.cancelled().await;
        on_shutdown.graceful_shutdown(Some(SHUTDOWN_GRACE));
    });

    match config.tls {
        Some((cert, key)) => {
            let tls = RustlsConfig::from_pem_file(cert, key).await?;
            info!(addr = %config.addr, "Serving metrics API over TLS");
            axum_server::bind_rustls(config.addr, tls)
                .handle(handle)
                .serve(app.into_make_service())
                .await
        }
        None => {
            info!(addr = %config.addr, "Serving metrics API over plain HTTP");
            axum_server::bind(config.addr)
                .handle(handle)
                .serve(app.into_make_service())
                .await
        }
    }
}

async fn healthz(State(state): State<AppState>) -> (StatusCode, &'static str) {
    if state.ready.load(Ordering::Acquire) {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "initial sync in progress")
    }
}

/// `NotReady` until the initial declaration sync is done
fn ensure_ready(state: &AppState) -> Result<(), ApiError> {
    if state.ready.load(Ordering::Acquire) {
        Ok(())
    } else {
        Err(ApiError::NotReady)
    }
}

async fn list_external(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    ensure_ready(&state)?;
    let names = state.provider.resolver().external_metric_names();
    Ok(Json(api_resource_list(
        EXTERNAL_GROUP_VERSION,
        "ExternalMetricValueList",
        names,
    )))
}

async fn list_custom(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    ensure_ready(&state)?;
    let names = state
        .provider
        .resolver()
        .custom_metrics()
        .into_iter()
        .map(|(gr, metric)| format!("{}/{}", gr, metric))
        .collect();
    Ok(Json(api_resource_list(CUSTOM_GROUP_VERSION, "MetricValueList", names)))
}

async fn get_external(
    State(state): State<AppState>,
    Path((namespace, metric)): Path<(String, String)>,
    Query(params): Query<SelectorParams>,
) -> Result<Response, ApiError> {
    ensure_ready(&state)?;
    let value = state
        .provider
        .get_external_metric(&namespace, &metric, params.selector())
        .await?;

    let metric_labels: BTreeMap<String, String> = params
        .selector()
        .parse::<Selector>()
        .map(|s| {
            s.pinned_pairs()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect()
        })
        .unwrap_or_default();

    let body = json!({
        "kind": "ExternalMetricValueList",
        "apiVersion": EXTERNAL_GROUP_VERSION,
        "metadata": {},
        "items": [{
            "metricName": metric,
            "metricLabels": metric_labels,
            "timestamp": now(),
            "value": quantity(value.value)
        }]
    });
    Ok(with_warnings(Json(body), value.warning.into_iter().collect()))
}

async fn get_custom(
    State(state): State<AppState>,
    Path((namespace, resource, name, metric)): Path<(String, String, String, String)>,
    Query(params): Query<SelectorParams>,
) -> Result<Response, ApiError> {
    ensure_ready(&state)?;
    let group_resource = GroupResource::parse(&resource);

    let targets = if name == ANY_OBJECT {
        let selector: Selector = params
            .selector()
            .parse()
            .map_err(ProviderError::BadSelector)?;
        state.lookup.list(&namespace, &group_resource, &selector).await?
    } else {
        let target = state
            .lookup
            .get(&namespace, &group_resource, &name)
            .await?
            .ok_or_else(|| ApiError::TargetNotFound {
                resource: group_resource.to_string(),
                namespace: namespace.clone(),
                name: name.clone(),
            })?;
        vec![target]
    };

    let mut items = Vec::new();
    let mut warnings = Vec::new();
    for target in targets {
        let query = CustomQuery {
            namespace: namespace.clone(),
            group_resource: group_resource.clone(),
            target_name: target.name.clone(),
            metric_name: metric.clone(),
            target_labels: target.labels.clone(),
        };
        match state.provider.get_custom_metric(&query).await {
            Ok(value) => {
                items.push(metric_value(&namespace, &metric, &target, &value));
                warnings.extend(value.warning);
            }
            // wildcard queries skip objects no declaration covers
            Err(ProviderError::NotConfigured { .. }) if name == ANY_OBJECT => {}
            Err(e) => return Err(e.into()),
        }
    }

    if items.is_empty() {
        return Err(ProviderError::NotConfigured {
            metric: format!("{}/{}", group_resource, metric),
        }
        .into());
    }

    warnings.sort();
    warnings.dedup();
    let body = json!({
        "kind": "MetricValueList",
        "apiVersion": CUSTOM_GROUP_VERSION,
        "metadata": {},
        "items": items
    });
    Ok(with_warnings(Json(body), warnings))
}

fn api_resource_list(group_version: &str, kind: &str, names: Vec<String>) -> Value {
    let resources: Vec<Value> = names
        .into_iter()
        .map(|name| {
            json!({
                "name": name,
                "singularName": "",
                "namespaced": true,
                "kind": kind,
                "verbs": ["get"]
            })
        })
        .collect();

    json!({
        "kind": "APIResourceList",
        "apiVersion": "v1",
        "groupVersion": group_version,
        "resources": resources
    })
}

fn metric_value(namespace: &str, metric: &str, target: &TargetObject, value: &MetricValue) -> Value {
    json!({
        "describedObject": {
            "kind": target.kind,
            "namespace": namespace,
            "name": target.name,
            "apiVersion": target.api_version
        },
        "metric": {"name": metric},
        "timestamp": now(),
        "value": quantity(value.value)
    })
}

/// Attach one `Warning: 299` header per message
fn with_warnings(body: impl IntoResponse, warnings: Vec<String>) -> Response {
    let mut headers = HeaderMap::new();
    for warning in warnings {
        let escaped = warning.replace('\\', "\\\\").replace('"', "\\\"");
        if let Ok(value) = HeaderValue::from_str(&format!("299 - \"{}\"", escaped)) {
            headers.append(axum::http::header::WARNING, value);
        }
    }
    (headers, body).into_response()
}

/// Kubernetes quantity in milli-units, e.g. `1500m`
fn quantity(value: f64) -> String {
    format!("{}m", (value * 1000.0).round() as i64)
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
