//! Azure metric fetch client
//!
//! Three backends, picked by the query type:
//! - Azure Monitor platform metrics (ARM metrics API)
//! - Service Bus topic subscription message counts (ARM resource read)
//! - Application Insights metrics (Application Insights REST API)

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use cloudmetrics_common::crd::{Aggregation, AzureTarget, CloudQuery, QueryType};
use cloudmetrics_common::Selector;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info};

use crate::fetch::{FetchError, FetchSpec, MetricFetcher};

/// Azure Resource Manager endpoint
pub const DEFAULT_ARM_ENDPOINT: &str = "https://management.azure.com";

/// Application Insights REST endpoint
pub const DEFAULT_APP_INSIGHTS_ENDPOINT: &str = "https://api.applicationinsights.io";

const MONITOR_API_VERSION: &str = "2018-01-01";
const SERVICE_BUS_API_VERSION: &str = "2017-04-01";

/// Width of the metric query window
const QUERY_WINDOW_MINUTES: i64 = 5;

/// Application Insights takes an ISO-8601 duration
const APP_INSIGHTS_TIMESPAN: &str = "PT5M";

const IMDS_ENDPOINT: &str = "http://169.254.169.254/metadata/instance";
const IMDS_API_VERSION: &str = "2017-08-01";

/// Error bodies are truncated to this many characters
const MAX_ERROR_BODY: usize = 512;

/// Connection settings for [`AzureFetcher`]
#[derive(Clone, Debug)]
pub struct AzureConfig {
    /// Subscription used when a declaration leaves `subscriptionID` empty
    pub default_subscription_id: String,
    /// Bearer token for Azure Resource Manager
    pub access_token: Option<String>,
    /// Application Insights API key
    pub app_insights_key: Option<String>,
    /// ARM base URL
    pub arm_endpoint: String,
    /// Application Insights base URL
    pub app_insights_endpoint: String,
    /// Per-request timeout
    pub timeout: Duration,
}

impl Default for AzureConfig {
    fn default() -> Self {
        Self {
            default_subscription_id: String::new(),
            access_token: None,
            app_insights_key: None,
            arm_endpoint: DEFAULT_ARM_ENDPOINT.to_string(),
            app_insights_endpoint: DEFAULT_APP_INSIGHTS_ENDPOINT.to_string(),
            timeout: Duration::from_secs(10),
        }
    }
}

/// [`MetricFetcher`] backed by Azure REST APIs
pub struct AzureFetcher {
    http: Client,
    config: AzureConfig,
}

impl AzureFetcher {
    /// Build a fetcher; fails only if the HTTP client cannot be created
    pub fn new(config: AzureConfig) -> Result<Self, FetchError> {
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| FetchError::Config(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { http, config })
    }

    async fn azure_monitor(&self, spec: &FetchSpec) -> Result<f64, FetchError> {
        let query = &spec.query;
        let subscription = subscription(query, &self.config.default_subscription_id)?;
        let aggregation = aggregation(query)?;
        let url = monitor_url(&self.config.arm_endpoint, subscription, &query.azure);

        let mut params = vec![
            ("api-version", MONITOR_API_VERSION.to_string()),
            ("metricnames", query.metric.metric_name.clone()),
            ("aggregation", aggregation.azure_monitor_name().to_string()),
            ("timespan", timespan(Utc::now())),
        ];
        if let Some(filter) = monitor_filter(spec) {
            params.push(("$filter", filter));
        }

        let request = self
            .http
            .get(&url)
            .bearer_auth(self.arm_token()?)
            .query(&params);
        let response: MetricsResponse = get_json(request, &url).await?;
        newest_value(&response, aggregation).ok_or_else(|| FetchError::NoData {
            metric: query.metric.metric_name.clone(),
        })
    }

    async fn service_bus(&self, spec: &FetchSpec) -> Result<f64, FetchError> {
        let query = &spec.query;
        let subscription = subscription(query, &self.config.default_subscription_id)?;
        let url = service_bus_url(&self.config.arm_endpoint, subscription, &query.azure);

        let request = self
            .http
            .get(&url)
            .bearer_auth(self.arm_token()?)
            .query(&[("api-version", SERVICE_BUS_API_VERSION)]);
        let response: ServiceBusSubscription = get_json(request, &url).await?;
        Ok(response.properties.count_details.active_message_count as f64)
    }

    async fn app_insights(&self, spec: &FetchSpec) -> Result<f64, FetchError> {
        let query = &spec.query;
        let app_id = query
            .app_insights
            .as_ref()
            .map(|a| a.application_id.as_str())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| FetchError::Config("appInsights.applicationID is not set".into()))?;
        let key = self
            .config
            .app_insights_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| FetchError::Config("no Application Insights API key configured".into()))?;
        let aggregation = aggregation(query)?;
        let metric = &query.metric.metric_name;
        let url = app_insights_url(&self.config.app_insights_endpoint, app_id, metric);

        let request = self.http.get(&url).header("x-api-key", key).query(&[
            ("timespan", APP_INSIGHTS_TIMESPAN),
            ("aggregation", aggregation.app_insights_name()),
        ]);
        let response: serde_json::Value = get_json(request, &url).await?;
        app_insights_value(&response, metric, aggregation).ok_or_else(|| FetchError::NoData {
            metric: metric.clone(),
        })
    }

    fn arm_token(&self) -> Result<&str, FetchError> {
        self.config
            .access_token
            .as_deref()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| FetchError::Config("no Azure access token configured".into()))
    }
}

#[async_trait]
impl MetricFetcher for AzureFetcher {
    async fn fetch(&self, spec: &FetchSpec) -> Result<f64, FetchError> {
        debug!(
            declaration = %spec.declaration,
            query_type = %spec.query.query_type,
            metric = %spec.query.metric.metric_name,
            "Fetching metric"
        );
        match spec.query.query_type {
            QueryType::AzureMonitor => self.azure_monitor(spec).await,
            QueryType::ServiceBus => self.service_bus(spec).await,
            QueryType::AppInsights => self.app_insights(spec).await,
        }
    }
}

/// Look up the VM's subscription from the instance metadata service
///
/// Used when no default subscription is configured.
pub async fn discover_subscription_id(timeout: Duration) -> Result<String, FetchError> {
    let http = Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| FetchError::Config(format!("failed to build HTTP client: {}", e)))?;
    let request = http
        .get(IMDS_ENDPOINT)
        .header("Metadata", "true")
        .query(&[("api-version", IMDS_API_VERSION)]);

    let metadata: InstanceMetadata = get_json(request, IMDS_ENDPOINT).await?;
    let subscription = metadata.compute.subscription_id;
    if subscription.is_empty() {
        return Err(FetchError::NoData {
            metric: "compute.subscriptionId".into(),
        });
    }
    info!(subscription = %subscription, "Discovered subscription from instance metadata");
    Ok(subscription)
}

async fn get_json<T: DeserializeOwned>(
    request: RequestBuilder,
    endpoint: &str,
) -> Result<T, FetchError> {
    let response = request.send().await.map_err(|e| FetchError::Http {
        endpoint: endpoint.to_string(),
        message: e.to_string(),
    })?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(FetchError::Status {
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
            body: body.chars().take(MAX_ERROR_BODY).collect(),
        });
    }

    response.json::<T>().await.map_err(|e| FetchError::Decode {
        endpoint: endpoint.to_string(),
        message: e.to_string(),
    })
}

fn subscription<'a>(query: &'a CloudQuery, default: &'a str) -> Result<&'a str, FetchError> {
    [query.azure.subscription_id.as_str(), default]
        .into_iter()
        .find(|s| !s.is_empty())
        .ok_or_else(|| {
            FetchError::Config(
                "no subscriptionID in the declaration and no default subscription configured"
                    .into(),
            )
        })
}

fn aggregation(query: &CloudQuery) -> Result<Aggregation, FetchError> {
    query.aggregation().ok_or_else(|| {
        FetchError::Config(format!(
            "unknown aggregation '{}'",
            query.metric.aggregation
        ))
    })
}

fn monitor_url(base: &str, subscription: &str, azure: &AzureTarget) -> String {
    format!(
        "{}/subscriptions/{}/resourceGroups/{}/providers/{}/{}/{}/providers/microsoft.insights/metrics",
        base.trim_end_matches('/'),
        subscription,
        azure.resource_group,
        azure.resource_provider_namespace,
        azure.resource_type,
        azure.resource_name,
    )
}

fn service_bus_url(base: &str, subscription: &str, azure: &AzureTarget) -> String {
    format!(
        "{}/subscriptions/{}/resourceGroups/{}/providers/Microsoft.ServiceBus/namespaces/{}/topics/{}/subscriptions/{}",
        base.trim_end_matches('/'),
        subscription,
        azure.resource_group,
        azure.service_bus_namespace,
        azure.service_bus_topic,
        azure.service_bus_subscription,
    )
}

fn app_insights_url(base: &str, app_id: &str, metric: &str) -> String {
    format!(
        "{}/v1/apps/{}/metrics/{}",
        base.trim_end_matches('/'),
        app_id,
        metric
    )
}

/// `start/end` interval ending at `now`
fn timespan(now: DateTime<Utc>) -> String {
    let start = now - chrono::Duration::minutes(QUERY_WINDOW_MINUTES);
    format!(
        "{}/{}",
        start.to_rfc3339_opts(SecondsFormat::Secs, true),
        now.to_rfc3339_opts(SecondsFormat::Secs, true)
    )
}

/// Declared OData filter ANDed with the series selector's `key = value` pairs
///
/// Azure Monitor dimension filters only express equality, so other
/// requirement kinds are dropped. Custom metric specs contribute no
/// selector pairs: their selectors range over Kubernetes object labels,
/// which are not metric dimensions.
fn monitor_filter(spec: &FetchSpec) -> Option<String> {
    let series = match spec.target {
        Some(_) => None,
        None => Some(&spec.selector),
    };
    let clauses: Vec<String> = std::iter::once(spec.query.metric.filter.trim())
        .filter(|f| !f.is_empty())
        .map(|f| f.to_string())
        .chain(
            series
                .into_iter()
                .flat_map(Selector::pinned_pairs)
                .map(|(k, v)| format!("{} eq '{}'", k, v)),
        )
        .collect();

    if clauses.is_empty() {
        None
    } else {
        Some(clauses.join(" and "))
    }
}

#[derive(Debug, Deserialize)]
struct MetricsResponse {
    #[serde(default)]
    value: Vec<MetricResult>,
}

#[derive(Debug, Deserialize)]
struct MetricResult {
    #[serde(default)]
    timeseries: Vec<TimeSeries>,
}

#[derive(Debug, Deserialize)]
struct TimeSeries {
    #[serde(default)]
    data: Vec<DataPoint>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DataPoint {
    #[serde(default)]
    time_stamp: String,
    average: Option<f64>,
    total: Option<f64>,
    minimum: Option<f64>,
    maximum: Option<f64>,
    count: Option<f64>,
}

impl DataPoint {
    fn value(&self, aggregation: Aggregation) -> Option<f64> {
        match aggregation {
            Aggregation::Average => self.average,
            Aggregation::Total => self.total,
            Aggregation::Minimum => self.minimum,
            Aggregation::Maximum => self.maximum,
            Aggregation::Count => self.count,
        }
    }
}

/// Newest data point that carries the requested aggregation
fn newest_value(response: &MetricsResponse, aggregation: Aggregation) -> Option<f64> {
    response
        .value
        .iter()
        .flat_map(|m| &m.timeseries)
        .flat_map(|ts| &ts.data)
        .filter_map(|p| p.value(aggregation).map(|v| (p.time_stamp.as_str(), v)))
        .max_by(|a, b| a.0.cmp(b.0))
        .map(|(_, v)| v)
}

#[derive(Debug, Deserialize)]
struct ServiceBusSubscription {
    properties: ServiceBusProperties,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServiceBusProperties {
    count_details: CountDetails,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CountDetails {
    active_message_count: i64,
}

fn app_insights_value(
    response: &serde_json::Value,
    metric: &str,
    aggregation: Aggregation,
) -> Option<f64> {
    response
        .get("value")?
        .get(metric)?
        .get(aggregation.app_insights_name())?
        .as_f64()
}

#[derive(Debug, Deserialize)]
struct InstanceMetadata {
    compute: ComputeMetadata,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ComputeMetadata {
    #[serde(default)]
    subscription_id: String,
}
