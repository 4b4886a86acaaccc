//! Declaration to cache entry derivation
//!
//! Pure: the same declaration always yields the same entry or the same error.

use cloudmetrics_cache::{CacheEntry, CacheKey, CustomScope, ExternalKey, GroupResource};
use cloudmetrics_common::crd::{validate_metric_name, CloudQuery, QueryType};
use cloudmetrics_common::{Declaration, DeclarationId, Error, Selector};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

/// Derive the cache entry for a declaration
///
/// Fails with a validation error naming the declaration and field when the
/// declaration is incomplete or malformed.
pub fn derive_entry(declaration: &Declaration) -> Result<CacheEntry, Error> {
    let id = declaration.id()?;

    match declaration {
        Declaration::External { meta, spec } => {
            let metric_name = spec
                .external_metric_name
                .as_deref()
                .filter(|n| !n.is_empty())
                .unwrap_or(id.name.as_str());
            check_metric_name(&id, metric_name, "spec.externalMetricName")?;
            check_query(&id, &spec.query, &[QueryType::AzureMonitor, QueryType::ServiceBus])?;
            let selector = convert_selector(&id, spec.metric_selector.as_ref(), "spec.metricSelector")?;

            Ok(CacheEntry {
                key: ExternalKey::new(&id.namespace, metric_name).into(),
                token: meta.token.clone(),
                query: spec.query.clone(),
                selector,
                source: id,
            })
        }
        Declaration::Custom { meta, spec } => {
            let target = &spec.target;
            if target.resource.trim().is_empty() {
                return Err(Error::validation_for_field(
                    id.to_string(),
                    "spec.target.resource",
                    "target resource is required",
                ));
            }

            let metric_name = spec
                .metric_name
                .as_deref()
                .filter(|n| !n.is_empty())
                .unwrap_or(id.name.as_str());
            check_metric_name(&id, metric_name, "spec.metricName")?;
            check_query(&id, &spec.query, &[QueryType::AppInsights, QueryType::AzureMonitor])?;

            let scope = CustomScope::new(
                &id.namespace,
                GroupResource::new(&target.group, &target.resource),
                metric_name,
            );

            let (key, selector) = match (&target.name, &target.selector) {
                (Some(name), None) if !name.is_empty() => {
                    (CacheKey::custom_named(scope, name), Selector::everything())
                }
                (None, Some(selector)) => (
                    CacheKey::custom_selector(scope, &id),
                    convert_selector(&id, Some(selector), "spec.target.selector")?,
                ),
                _ => {
                    return Err(Error::validation_for_field(
                        id.to_string(),
                        "spec.target",
                        "exactly one of target.name and target.selector must be set",
                    ))
                }
            };

            Ok(CacheEntry {
                key,
                token: meta.token.clone(),
                query: spec.query.clone(),
                selector,
                source: id,
            })
        }
    }
}

fn check_metric_name(id: &DeclarationId, name: &str, field: &str) -> Result<(), Error> {
    validate_metric_name(name).map_err(|msg| Error::validation_for_field(id.to_string(), field, msg))
}

fn check_query(id: &DeclarationId, query: &CloudQuery, allowed: &[QueryType]) -> Result<(), Error> {
    if !allowed.contains(&query.query_type) {
        return Err(Error::validation_for_field(
            id.to_string(),
            "spec.type",
            format!("{} queries are not supported for {}", query.query_type, id.kind),
        ));
    }
    query
        .validate()
        .map_err(|(field, msg)| Error::validation_for_field(id.to_string(), field, msg))
}

fn convert_selector(
    id: &DeclarationId,
    selector: Option<&LabelSelector>,
    field: &str,
) -> Result<Selector, Error> {
    match selector {
        Some(s) => Selector::try_from(s).map_err(|e| e.for_declaration(id.to_string(), field)),
        None => Ok(Selector::everything()),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use cloudmetrics_cache::TargetKey;
    use cloudmetrics_common::crd::{
        AppInsightsTarget, AzureTarget, CustomMetricSpec, ExternalMetricSpec, MetricRequest,
        MetricTarget,
    };
    use cloudmetrics_common::declaration::DeclarationMeta;
    use cloudmetrics_common::ChangeToken;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;

    fn meta(name: &str) -> DeclarationMeta {
        DeclarationMeta {
            namespace: Some("default".into()),
            name: Some(name.into()),
            token: ChangeToken {
                uid: Some(format!("uid-{name}")),
                generation: Some(1),
                resource_version: Some("100".into()),
            },
        }
    }

    fn service_bus_query() -> CloudQuery {
        CloudQuery {
            query_type: QueryType::ServiceBus,
            azure: AzureTarget {
                resource_group: "rg".into(),
                service_bus_namespace: "sb".into(),
                service_bus_topic: "orders".into(),
                service_bus_subscription: "workers".into(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn app_insights_query() -> CloudQuery {
        CloudQuery {
            query_type: QueryType::AppInsights,
            metric: MetricRequest {
                metric_name: "requests/count".into(),
                ..Default::default()
            },
            app_insights: Some(AppInsightsTarget {
                application_id: "app-1".into(),
            }),
            ..Default::default()
        }
    }

    fn external(name: &str, metric: Option<&str>) -> Declaration {
        Declaration::External {
            meta: meta(name),
            spec: ExternalMetricSpec {
                external_metric_name: metric.map(String::from),
                metric_selector: None,
                query: service_bus_query(),
            },
        }
    }

    fn custom(name: &str, target: MetricTarget) -> Declaration {
        Declaration::Custom {
            meta: meta(name),
            spec: CustomMetricSpec {
                target,
                metric_name: Some("rps".into()),
                query: app_insights_query(),
            },
        }
    }

    #[test]
    fn external_entry_is_keyed_by_namespace_and_metric_name() {
        let entry = derive_entry(&external("q1", Some("queue-depth"))).unwrap();
        assert_eq!(entry.key, ExternalKey::new("default", "queue-depth").into());
        assert_eq!(entry.source.name, "q1");
        assert_eq!(entry.token.generation, Some(1));
        assert_eq!(entry.query, service_bus_query());
        assert!(entry.selector.is_empty());
    }

    #[test]
    fn external_metric_name_defaults_to_object_name() {
        let entry = derive_entry(&external("queue-depth", None)).unwrap();
        assert_eq!(entry.key, ExternalKey::new("default", "queue-depth").into());
    }

    #[test]
    fn derivation_is_deterministic() {
        let decl = external("q1", Some("queue-depth"));
        assert_eq!(derive_entry(&decl).unwrap(), derive_entry(&decl).unwrap());
    }

    #[test]
    fn declared_metric_selector_is_kept() {
        let mut decl = external("q1", Some("queue-depth"));
        if let Declaration::External { spec, .. } = &mut decl {
            spec.metric_selector = Some(LabelSelector {
                match_labels: Some(BTreeMap::from([("queue".into(), "orders".into())])),
                ..Default::default()
            });
        }
        let entry = derive_entry(&decl).unwrap();
        assert_eq!(entry.selector.to_string(), "queue=orders");
    }

    #[test]
    fn malformed_selector_is_a_validation_error_for_the_field() {
        let mut decl = external("q1", Some("queue-depth"));
        if let Declaration::External { spec, .. } = &mut decl {
            spec.metric_selector = Some(LabelSelector {
                match_expressions: Some(vec![LabelSelectorRequirement {
                    key: "queue".into(),
                    operator: "Near".into(),
                    values: None,
                }]),
                ..Default::default()
            });
        }
        let err = derive_entry(&decl).unwrap_err();
        assert_eq!(err.declaration(), Some("ExternalMetric/default/q1"));
        assert_eq!(err.field(), Some("spec.metricSelector"));
    }

    #[test]
    fn incomplete_query_is_rejected() {
        let mut decl = external("q1", Some("queue-depth"));
        if let Declaration::External { spec, .. } = &mut decl {
            spec.query.azure.service_bus_topic.clear();
        }
        let err = derive_entry(&decl).unwrap_err();
        assert_eq!(err.field(), Some("spec.azure.serviceBusTopic"));
    }

    #[test]
    fn query_type_must_suit_the_declaration_kind() {
        let mut decl = external("q1", Some("queue-depth"));
        if let Declaration::External { spec, .. } = &mut decl {
            spec.query = app_insights_query();
        }
        assert_eq!(derive_entry(&decl).unwrap_err().field(), Some("spec.type"));
    }

    #[test]
    fn invalid_metric_name_is_rejected() {
        let err = derive_entry(&external("q1", Some("Queue Depth"))).unwrap_err();
        assert_eq!(err.field(), Some("spec.externalMetricName"));
    }

    #[test]
    fn named_custom_target_is_keyed_by_object_name() {
        let entry = derive_entry(&custom(
            "rps-a",
            MetricTarget {
                group: "apps".into(),
                resource: "deployments".into(),
                name: Some("web".into()),
                selector: None,
            },
        ))
        .unwrap();

        match &entry.key {
            CacheKey::Custom { scope, target } => {
                assert_eq!(scope.group_resource, GroupResource::new("apps", "deployments"));
                assert_eq!(scope.metric_name, "rps");
                assert_eq!(*target, TargetKey::Name("web".into()));
            }
            other => panic!("expected custom key, got {other:?}"),
        }
    }

    #[test]
    fn selector_custom_target_is_keyed_by_declaration() {
        let entry = derive_entry(&custom(
            "web-rps",
            MetricTarget {
                resource: "pods".into(),
                selector: Some(LabelSelector {
                    match_labels: Some(BTreeMap::from([("app".into(), "web".into())])),
                    ..Default::default()
                }),
                ..Default::default()
            },
        ))
        .unwrap();

        match &entry.key {
            CacheKey::Custom { target, .. } => assert_eq!(
                *target,
                TargetKey::Selector {
                    declaration: "web-rps".into()
                }
            ),
            other => panic!("expected custom key, got {other:?}"),
        }
        assert_eq!(entry.selector.to_string(), "app=web");
    }

    #[test]
    fn custom_target_needs_exactly_one_of_name_and_selector() {
        let neither = custom(
            "rps",
            MetricTarget {
                resource: "pods".into(),
                ..Default::default()
            },
        );
        assert_eq!(derive_entry(&neither).unwrap_err().field(), Some("spec.target"));

        let both = custom(
            "rps",
            MetricTarget {
                resource: "pods".into(),
                name: Some("web-0".into()),
                selector: Some(LabelSelector::default()),
                ..Default::default()
            },
        );
        assert_eq!(derive_entry(&both).unwrap_err().field(), Some("spec.target"));
    }

    #[test]
    fn custom_target_needs_a_resource() {
        let decl = custom(
            "rps",
            MetricTarget {
                name: Some("web-0".into()),
                ..Default::default()
            },
        );
        assert_eq!(
            derive_entry(&decl).unwrap_err().field(),
            Some("spec.target.resource")
        );
    }

    #[test]
    fn declaration_without_namespace_is_rejected() {
        let mut decl = external("q1", Some("queue-depth"));
        if let Declaration::External { meta, .. } = &mut decl {
            meta.namespace = None;
        }
        assert_eq!(
            derive_entry(&decl).unwrap_err().field(),
            Some("metadata.namespace")
        );
    }
}
