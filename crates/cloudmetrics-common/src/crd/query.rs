//! Cloud query shared by both declaration kinds
//!
//! The adapter core treats a [`CloudQuery`] as opaque: it is validated when a
//! declaration is derived into a cache entry and then handed untouched to the
//! fetch client.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Backend service that answers the query
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    /// Azure Monitor platform metrics for an ARM resource
    #[default]
    AzureMonitor,
    /// Active message count of a Service Bus topic subscription
    ServiceBus,
    /// Application Insights metrics
    AppInsights,
}

impl QueryType {
    /// Label value used in logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AzureMonitor => "azuremonitor",
            Self::ServiceBus => "servicebus",
            Self::AppInsights => "appinsights",
        }
    }
}

impl std::fmt::Display for QueryType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Aggregation applied to the metric time series
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Aggregation {
    /// Mean over the interval
    Average,
    /// Sum over the interval
    Total,
    /// Minimum over the interval
    Minimum,
    /// Maximum over the interval
    Maximum,
    /// Sample count over the interval
    Count,
}

impl Aggregation {
    /// Parse an aggregation name, case-insensitively.
    ///
    /// Accepts both the Azure Monitor spelling (`Average`) and the
    /// Application Insights one (`avg`).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "average" | "avg" => Some(Self::Average),
            "total" | "sum" => Some(Self::Total),
            "minimum" | "min" => Some(Self::Minimum),
            "maximum" | "max" => Some(Self::Maximum),
            "count" => Some(Self::Count),
            _ => None,
        }
    }

    /// Name used by the Azure Monitor metrics API
    pub fn azure_monitor_name(&self) -> &'static str {
        match self {
            Self::Average => "Average",
            Self::Total => "Total",
            Self::Minimum => "Minimum",
            Self::Maximum => "Maximum",
            Self::Count => "Count",
        }
    }

    /// Name used by the Application Insights metrics API
    pub fn app_insights_name(&self) -> &'static str {
        match self {
            Self::Average => "avg",
            Self::Total => "sum",
            Self::Minimum => "min",
            Self::Maximum => "max",
            Self::Count => "count",
        }
    }
}

/// Azure resource coordinates
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct AzureTarget {
    /// Resource group of the resource (or of the Service Bus namespace)
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_group: String,

    /// ARM resource name
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_name: String,

    /// ARM provider namespace, e.g. `Microsoft.Network`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_provider_namespace: String,

    /// ARM resource type, e.g. `loadBalancers`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_type: String,

    /// Subscription; empty means the adapter's default subscription
    #[serde(default, rename = "subscriptionID", skip_serializing_if = "String::is_empty")]
    pub subscription_id: String,

    /// Service Bus namespace
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_bus_namespace: String,

    /// Service Bus topic
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_bus_topic: String,

    /// Service Bus topic subscription
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_bus_subscription: String,
}

/// Which metric to read and how to aggregate it
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct MetricRequest {
    /// Backend metric name, e.g. `SYNPacketCount` or `requests/count`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub metric_name: String,

    /// Aggregation name (see [`Aggregation::parse`])
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub aggregation: String,

    /// Backend-specific OData filter, e.g. `EntityName eq 'orders'`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub filter: String,
}

/// Application Insights application reference
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct AppInsightsTarget {
    /// Application ID from the Application Insights API Access blade
    #[serde(default, rename = "applicationID", skip_serializing_if = "String::is_empty")]
    pub application_id: String,
}

/// Provider-specific query, flattened into both CRD specs
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct CloudQuery {
    /// Backend service
    #[serde(rename = "type", default)]
    pub query_type: QueryType,

    /// Azure resource coordinates
    #[serde(default)]
    pub azure: AzureTarget,

    /// Metric and aggregation
    #[serde(default)]
    pub metric: MetricRequest,

    /// Application Insights application (only for `appinsights`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_insights: Option<AppInsightsTarget>,
}

impl CloudQuery {
    /// Check that every field the query type needs is present.
    ///
    /// Returns the offending field path and a message.
    pub fn validate(&self) -> Result<(), (String, String)> {
        let require = |value: &str, field: &str| -> Result<(), (String, String)> {
            if value.trim().is_empty() {
                Err((
                    format!("spec.{}", field),
                    format!("{} is required for {} queries", field, self.query_type),
                ))
            } else {
                Ok(())
            }
        };

        match self.query_type {
            QueryType::AzureMonitor => {
                require(&self.azure.resource_group, "azure.resourceGroup")?;
                require(&self.azure.resource_name, "azure.resourceName")?;
                require(
                    &self.azure.resource_provider_namespace,
                    "azure.resourceProviderNamespace",
                )?;
                require(&self.azure.resource_type, "azure.resourceType")?;
                require(&self.metric.metric_name, "metric.metricName")?;
                self.require_aggregation()?;
            }
            QueryType::ServiceBus => {
                require(&self.azure.resource_group, "azure.resourceGroup")?;
                require(&self.azure.service_bus_namespace, "azure.serviceBusNamespace")?;
                require(&self.azure.service_bus_topic, "azure.serviceBusTopic")?;
                require(
                    &self.azure.service_bus_subscription,
                    "azure.serviceBusSubscription",
                )?;
            }
            QueryType::AppInsights => {
                require(&self.metric.metric_name, "metric.metricName")?;
                let app_id = self
                    .app_insights
                    .as_ref()
                    .map(|a| a.application_id.as_str())
                    .unwrap_or_default();
                require(app_id, "appInsights.applicationID")?;
                if !self.metric.aggregation.is_empty() {
                    self.require_aggregation()?;
                }
            }
        }
        Ok(())
    }

    /// Parsed aggregation; Application Insights defaults to `avg`
    pub fn aggregation(&self) -> Option<Aggregation> {
        if self.metric.aggregation.is_empty() && self.query_type == QueryType::AppInsights {
            return Some(Aggregation::Average);
        }
        Aggregation::parse(&self.metric.aggregation)
    }

    fn require_aggregation(&self) -> Result<(), (String, String)> {
        match Aggregation::parse(&self.metric.aggregation) {
            Some(_) => Ok(()),
            None => Err((
                "spec.metric.aggregation".to_string(),
                format!(
                    "unknown aggregation '{}' (expected Average, Total, Minimum, Maximum or Count)",
                    self.metric.aggregation
                ),
            )),
        }
    }
}
