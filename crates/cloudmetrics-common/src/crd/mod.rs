//! Custom Resource Definitions for metric declarations
//!
//! Both kinds share the `azure.com/v1alpha2` group-version and carry a
//! flattened [`CloudQuery`].

mod custom_metric;
mod external_metric;
mod query;

pub use custom_metric::{CustomMetric, CustomMetricSpec, MetricTarget};
pub use external_metric::{ExternalMetric, ExternalMetricSpec};
pub use query::{Aggregation, AppInsightsTarget, AzureTarget, CloudQuery, MetricRequest, QueryType};

/// Check a metric name as it will appear in metrics API paths
///
/// Names become URL path segments and discovery entries, so they are limited
/// to lowercase alphanumerics, `-`, `_` and `.`.
pub fn validate_metric_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("metric name must not be empty".to_string());
    }
    if name.len() > 253 {
        return Err("metric name must be at most 253 characters".to_string());
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.'))
    {
        return Err(format!(
            "metric name '{}' may only contain lowercase letters, digits, '-', '_' and '.'",
            name
        ));
    }
    Ok(())
}
