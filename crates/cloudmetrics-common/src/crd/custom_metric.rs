//! CustomMetric Custom Resource Definition
//!
//! Maps a per-object metric (as referenced by a HorizontalPodAutoscaler
//! `Object` or `Pods` metric source) to a cloud query. The target is either a
//! single named object or every object whose labels match a selector.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::CloudQuery;

/// Cluster objects a custom metric is declared for
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetricTarget {
    /// API group of the target resource; empty for the core group
    #[serde(default)]
    pub group: String,

    /// Plural resource name, e.g. `pods` or `deployments`
    pub resource: String,

    /// A single object by name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Every object whose labels match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,
}

/// Declares which cloud metric backs a custom metric on cluster objects
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "azure.com",
    version = "v1alpha2",
    kind = "CustomMetric",
    plural = "custommetrics",
    shortname = "acm",
    namespaced,
    printcolumn = r#"{"name":"Metric","type":"string","jsonPath":".spec.metricName"}"#,
    printcolumn = r#"{"name":"Resource","type":"string","jsonPath":".spec.target.resource"}"#,
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CustomMetricSpec {
    /// Objects this metric is served for
    pub target: MetricTarget,

    /// Metric name queried by autoscalers; defaults to the object name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric_name: Option<String>,

    /// Cloud query
    #[serde(flatten)]
    pub query: CloudQuery,
}

impl CustomMetric {
    /// Metric name after defaulting to `metadata.name`
    pub fn metric_name(&self) -> String {
        self.spec
            .metric_name
            .clone()
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| self.name_any())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::QueryType;
    use kube::CustomResourceExt;

    #[test]
    fn crd_names() {
        let crd = CustomMetric::crd();
        assert_eq!(crd.spec.names.kind, "CustomMetric");
        assert_eq!(crd.spec.names.short_names, Some(vec!["acm".to_string()]));
    }

    #[test]
    fn parses_selector_target() {
        let yaml = r#"
apiVersion: azure.com/v1alpha2
kind: CustomMetric
metadata:
  name: rps
  namespace: shop
spec:
  target:
    resource: pods
    selector:
      matchLabels:
        app: web
  type: appinsights
  appInsights:
    applicationID: app-1
  metric:
    metricName: requests/rate
    aggregation: avg
"#;
        let cm: CustomMetric = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cm.metric_name(), "rps");
        assert_eq!(cm.spec.target.group, "");
        assert!(cm.spec.target.name.is_none());
        assert!(cm.spec.target.selector.is_some());
        assert_eq!(cm.spec.query.query_type, QueryType::AppInsights);
    }
}
