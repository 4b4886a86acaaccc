//! ExternalMetric Custom Resource Definition
//!
//! Maps an external metric name (as referenced by a HorizontalPodAutoscaler
//! `External` metric source) to a cloud query.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::CloudQuery;

/// Declares which cloud metric backs an external metric name
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "azure.com",
    version = "v1alpha2",
    kind = "ExternalMetric",
    plural = "externalmetrics",
    shortname = "aem",
    namespaced,
    printcolumn = r#"{"name":"Metric","type":"string","jsonPath":".spec.externalMetricName"}"#,
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ExternalMetricSpec {
    /// External metric name queried by autoscalers; defaults to the object name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_metric_name: Option<String>,

    /// Selector over the metric's own series, ANDed with the query selector
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric_selector: Option<LabelSelector>,

    /// Cloud query
    #[serde(flatten)]
    pub query: CloudQuery,
}

impl ExternalMetric {
    /// External metric name after defaulting to `metadata.name`
    pub fn metric_name(&self) -> String {
        self.spec
            .external_metric_name
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
    fn crd_uses_azure_group() {
        let crd = ExternalMetric::crd();
        assert_eq!(crd.spec.group, "azure.com");
        assert_eq!(crd.spec.names.kind, "ExternalMetric");
        assert_eq!(crd.spec.names.plural, "externalmetrics");
        assert_eq!(crd.spec.scope, "Namespaced");
    }

    #[test]
    fn metric_name_defaults_to_object_name() {
        let em = ExternalMetric::new("queue-depth", ExternalMetricSpec::default());
        assert_eq!(em.metric_name(), "queue-depth");

        let em = ExternalMetric::new(
            "q1",
            ExternalMetricSpec {
                external_metric_name: Some("orders-backlog".into()),
                ..Default::default()
            },
        );
        assert_eq!(em.metric_name(), "orders-backlog");
    }

    #[test]
    fn parses_flattened_manifest() {
        let yaml = r#"
apiVersion: azure.com/v1alpha2
kind: ExternalMetric
metadata:
  name: queue-depth
  namespace: default
spec:
  type: servicebus
  metricSelector:
    matchLabels:
      queue: orders
  azure:
    resourceGroup: rg
    serviceBusNamespace: sb
    serviceBusTopic: orders
    serviceBusSubscription: workers
"#;
        let em: ExternalMetric = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(em.spec.query.query_type, QueryType::ServiceBus);
        assert_eq!(em.spec.query.azure.service_bus_topic, "orders");
        assert!(em.spec.metric_selector.is_some());
        assert!(em.spec.query.validate().is_ok());
    }
}
