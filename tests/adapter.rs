//! End-to-end: declaration events through the reconciler, queries through
//! the HTTP router

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use futures::stream;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use cloudmetrics_adapter::lookup::{LookupError, TargetLookup, TargetObject};
use cloudmetrics_adapter::server::{router, AppState};
use cloudmetrics_cache::{GroupResource, MetricCache};
use cloudmetrics_common::crd::{
    AppInsightsTarget, AzureTarget, CloudQuery, CustomMetricSpec, ExternalMetricSpec,
    MetricRequest, MetricTarget, QueryType,
};
use cloudmetrics_common::declaration::DeclarationMeta;
use cloudmetrics_common::{ChangeToken, Declaration, Selector};
use cloudmetrics_controller::{ChangeKind, Notification, Reconciler, StoreEvent};
use cloudmetrics_provider::{FetchError, FetchSpec, MetricFetcher, MetricsProvider, QueryResolver};

/// Answers with a per-backend-metric value and records every spec it sees
#[derive(Default)]
struct RecordingFetcher {
    values: BTreeMap<String, f64>,
    seen: Mutex<Vec<FetchSpec>>,
}

impl RecordingFetcher {
    fn with(values: &[(&str, f64)]) -> Self {
        Self {
            values: values.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            seen: Mutex::new(Vec::new()),
        }
    }

    fn seen(&self) -> Vec<FetchSpec> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl MetricFetcher for RecordingFetcher {
    async fn fetch(&self, spec: &FetchSpec) -> Result<f64, FetchError> {
        self.seen.lock().unwrap().push(spec.clone());
        let metric = &spec.query.metric.metric_name;
        self.values.get(metric).copied().ok_or_else(|| FetchError::NoData {
            metric: metric.clone(),
        })
    }
}

/// Fixed set of pods in `default`
struct StaticPods(Vec<TargetObject>);

#[async_trait]
impl TargetLookup for StaticPods {
    async fn get(
        &self,
        _namespace: &str,
        _resource: &GroupResource,
        name: &str,
    ) -> Result<Option<TargetObject>, LookupError> {
        Ok(self.0.iter().find(|p| p.name == name).cloned())
    }

    async fn list(
        &self,
        _namespace: &str,
        _resource: &GroupResource,
        selector: &Selector,
    ) -> Result<Vec<TargetObject>, LookupError> {
        Ok(self
            .0
            .iter()
            .filter(|p| selector.matches(&p.labels))
            .cloned()
            .collect())
    }
}

fn pod(name: &str, app: &str) -> TargetObject {
    TargetObject {
        kind: "Pod".into(),
        api_version: "v1".into(),
        name: name.into(),
        labels: BTreeMap::from([("app".to_string(), app.to_string())]),
    }
}

fn meta(name: &str, generation: i64) -> DeclarationMeta {
    DeclarationMeta {
        namespace: Some("default".into()),
        name: Some(name.into()),
        token: ChangeToken {
            uid: Some(format!("uid-{name}")),
            generation: Some(generation),
            resource_version: None,
        },
    }
}

fn service_bus_queue(name: &str, generation: i64, topic: &str) -> Declaration {
    Declaration::External {
        meta: meta(name, generation),
        spec: ExternalMetricSpec {
            external_metric_name: Some("queue-depth".into()),
            metric_selector: None,
            query: CloudQuery {
                query_type: QueryType::ServiceBus,
                azure: AzureTarget {
                    resource_group: "rg".into(),
                    service_bus_namespace: "sb".into(),
                    service_bus_topic: topic.into(),
                    service_bus_subscription: "workers".into(),
                    ..Default::default()
                },
                metric: MetricRequest {
                    metric_name: topic.into(),
                    ..Default::default()
                },
                app_insights: None,
            },
        },
    }
}

fn web_requests(name: &str, app: &str) -> Declaration {
    Declaration::Custom {
        meta: meta(name, 1),
        spec: CustomMetricSpec {
            target: MetricTarget {
                resource: "pods".into(),
                selector: Some(LabelSelector {
                    match_labels: Some(BTreeMap::from([("app".to_string(), app.to_string())])),
                    match_expressions: None,
                }),
                ..Default::default()
            },
            metric_name: Some("rps".into()),
            query: CloudQuery {
                query_type: QueryType::AppInsights,
                metric: MetricRequest {
                    metric_name: "requests/count".into(),
                    ..Default::default()
                },
                app_insights: Some(AppInsightsTarget {
                    application_id: "app-1".into(),
                }),
                ..Default::default()
            },
        },
    }
}

struct Harness {
    cache: Arc<MetricCache>,
    fetcher: Arc<RecordingFetcher>,
    router: Router,
}

fn harness(fetcher: RecordingFetcher) -> Harness {
    let cache = Arc::new(MetricCache::new());
    let fetcher = Arc::new(fetcher);
    let router = router(AppState {
        provider: MetricsProvider::new(
            QueryResolver::new(Arc::clone(&cache)),
            Arc::clone(&fetcher) as Arc<dyn MetricFetcher>,
        ),
        lookup: Arc::new(StaticPods(vec![
            pod("web-0", "web"),
            pod("web-1", "web"),
            pod("db-0", "db"),
        ])),
        ready: Arc::new(AtomicBool::new(true)),
    });
    Harness {
        cache,
        fetcher,
        router,
    }
}

async fn get(router: &Router, uri: &str) -> (StatusCode, Value) {
    let response = router
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

const QUEUE_DEPTH: &str = "/apis/external.metrics.k8s.io/v1beta1/namespaces/default/queue-depth";

#[tokio::test]
async fn declared_metrics_are_served_until_deleted() {
    let h = harness(RecordingFetcher::with(&[("orders", 37.0), ("requests/count", 4.5)]));

    let events = stream::iter(vec![
        StoreEvent::Changed(Notification::new(
            ChangeKind::Added,
            service_bus_queue("q1", 1, "orders"),
        )),
        StoreEvent::Changed(Notification::new(
            ChangeKind::Added,
            web_requests("web-rps", "web"),
        )),
    ]);
    Reconciler::new(Arc::clone(&h.cache))
        .run(events, CancellationToken::new())
        .await;
    assert_eq!(h.cache.len(), 2);

    let (status, body) = get(&h.router, QUEUE_DEPTH).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["items"][0]["value"], "37000m");

    let (status, body) = get(
        &h.router,
        "/apis/custom.metrics.k8s.io/v1beta2/namespaces/default/pods/*/rps?labelSelector=app%3Dweb",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let items = body["items"].as_array().unwrap();
    assert_eq!(items.len(), 2);
    assert!(items.iter().all(|i| i["value"] == "4500m"));

    let (status, _) = get(
        &h.router,
        "/apis/custom.metrics.k8s.io/v1beta2/namespaces/default/pods/db-0/rps",
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let mut reconciler = Reconciler::new(Arc::clone(&h.cache));
    reconciler.initial_sync(vec![service_bus_queue("q1", 1, "orders")]);
    reconciler.apply(Notification::new(
        ChangeKind::Deleted,
        service_bus_queue("q1", 1, "orders"),
    ));

    let (status, body) = get(&h.router, QUEUE_DEPTH).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["reason"], "NotFound");
}

#[tokio::test]
async fn updates_switch_the_query_and_stale_replays_do_not() {
    let h = harness(RecordingFetcher::with(&[("orders", 1.0), ("invoices", 2.0)]));
    let mut reconciler = Reconciler::new(Arc::clone(&h.cache));

    reconciler.initial_sync(vec![service_bus_queue("q1", 1, "orders")]);
    reconciler.apply(Notification::new(
        ChangeKind::Updated,
        service_bus_queue("q1", 2, "invoices"),
    ));
    reconciler.apply(Notification::new(
        ChangeKind::Updated,
        service_bus_queue("q1", 1, "orders"),
    ));

    let (status, body) = get(&h.router, QUEUE_DEPTH).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["items"][0]["value"], "2000m");

    let seen = h.fetcher.seen();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].query.azure.service_bus_topic, "invoices");
    assert_eq!(reconciler.stats().stale(), 1);
}

#[tokio::test]
async fn invalid_declaration_keeps_serving_the_previous_entry() {
    let h = harness(RecordingFetcher::with(&[("orders", 5.0)]));
    let mut reconciler = Reconciler::new(Arc::clone(&h.cache));
    reconciler.initial_sync(vec![service_bus_queue("q1", 1, "orders")]);

    let mut broken = service_bus_queue("q1", 2, "orders");
    if let Declaration::External { spec, .. } = &mut broken {
        spec.query.azure.service_bus_topic.clear();
    }
    reconciler.apply(Notification::new(ChangeKind::Updated, broken));

    let (status, body) = get(&h.router, QUEUE_DEPTH).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["items"][0]["value"], "5000m");
    assert_eq!(reconciler.stats().rejected(), 1);
}

#[tokio::test]
async fn resync_drops_declarations_missing_from_the_list() {
    let h = harness(RecordingFetcher::with(&[("orders", 5.0)]));

    let events = stream::iter(vec![
        StoreEvent::Changed(Notification::new(
            ChangeKind::Added,
            service_bus_queue("q1", 1, "orders"),
        )),
        StoreEvent::Listed {
            kind: cloudmetrics_common::DeclarationKind::External,
            declarations: Vec::new(),
        },
    ]);
    Reconciler::new(Arc::clone(&h.cache))
        .run(events, CancellationToken::new())
        .await;

    let (status, _) = get(&h.router, QUEUE_DEPTH).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, listing) = get(&h.router, "/apis/external.metrics.k8s.io/v1beta1").await;
    assert_eq!(listing["resources"].as_array().unwrap().len(), 0);
}
