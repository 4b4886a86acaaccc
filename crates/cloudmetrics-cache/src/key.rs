//! Cache keys

use std::fmt;

use cloudmetrics_common::DeclarationId;

/// Kubernetes group/resource pair; the empty group is the core group
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupResource {
    /// API group, empty for core
    pub group: String,
    /// Plural resource name
    pub resource: String,
}

impl GroupResource {
    /// Build from parts
    pub fn new(group: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            resource: resource.into(),
        }
    }

    /// Parse the `resource.group` form used in metrics API paths
    ///
    /// `pods` is the core group, `deployments.apps` is `apps`.
    pub fn parse(s: &str) -> Self {
        match s.split_once('.') {
            Some((resource, group)) => Self::new(group, resource),
            None => Self::new("", s),
        }
    }
}

impl fmt::Display for GroupResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            f.write_str(&self.resource)
        } else {
            write!(f, "{}.{}", self.resource, self.group)
        }
    }
}

/// Key of an external metric entry
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExternalKey {
    /// Namespace the metric is served in
    pub namespace: String,
    /// External metric name
    pub metric_name: String,
}

impl ExternalKey {
    /// Build a key
    pub fn new(namespace: impl Into<String>, metric_name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            metric_name: metric_name.into(),
        }
    }
}

impl fmt::Display for ExternalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "external/{}/{}", self.namespace, self.metric_name)
    }
}

/// Namespace, target group/resource and metric name of a custom entry
///
/// Selector matching scans every entry in one scope.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CustomScope {
    /// Namespace of the target objects
    pub namespace: String,
    /// Target group/resource
    pub group_resource: GroupResource,
    /// Custom metric name
    pub metric_name: String,
}

impl CustomScope {
    /// Build a scope
    pub fn new(
        namespace: impl Into<String>,
        group_resource: GroupResource,
        metric_name: impl Into<String>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            group_resource,
            metric_name: metric_name.into(),
        }
    }
}

impl fmt::Display for CustomScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "custom/{}/{}/{}",
            self.namespace, self.group_resource, self.metric_name
        )
    }
}

/// How a custom entry picks its target objects
///
/// Named targets are keyed by object name so `podA` and `podB` never collide.
/// Selector targets are keyed by the declaring object's name; the selector
/// itself lives in the entry.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TargetKey {
    /// One object, by name
    Name(String),
    /// Objects chosen by the selector of the named declaration
    Selector {
        /// Name of the declaring `CustomMetric`
        declaration: String,
    },
}

impl fmt::Display for TargetKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => write!(f, "name={name}"),
            Self::Selector { declaration } => write!(f, "selector@{declaration}"),
        }
    }
}

/// Key of any cache entry
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CacheKey {
    /// External metric entry
    External(ExternalKey),
    /// Custom metric entry
    Custom {
        /// Scope the entry lives in
        scope: CustomScope,
        /// Target within the scope
        target: TargetKey,
    },
}

impl CacheKey {
    /// Key for a custom entry that targets one named object
    pub fn custom_named(scope: CustomScope, name: impl Into<String>) -> Self {
        Self::Custom {
            scope,
            target: TargetKey::Name(name.into()),
        }
    }

    /// Key for a custom entry declared with a selector
    pub fn custom_selector(scope: CustomScope, declaration: &DeclarationId) -> Self {
        Self::Custom {
            scope,
            target: TargetKey::Selector {
                declaration: declaration.name.clone(),
            },
        }
    }

    /// Namespace the key lives in
    pub fn namespace(&self) -> &str {
        match self {
            Self::External(k) => &k.namespace,
            Self::Custom { scope, .. } => &scope.namespace,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::External(k) => k.fmt(f),
            Self::Custom { scope, target } => write!(f, "{scope}/{target}"),
        }
    }
}

impl From<ExternalKey> for CacheKey {
    fn from(key: ExternalKey) -> Self {
        Self::External(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_resource_parsing() {
        assert_eq!(GroupResource::parse("pods"), GroupResource::new("", "pods"));
        assert_eq!(
            GroupResource::parse("deployments.apps"),
            GroupResource::new("apps", "deployments")
        );
        assert_eq!(
            GroupResource::parse("widgets.example.com"),
            GroupResource::new("example.com", "widgets")
        );
        assert_eq!(GroupResource::new("apps", "deployments").to_string(), "deployments.apps");
    }

    #[test]
    fn named_targets_in_one_scope_are_distinct_keys() {
        let scope = CustomScope::new("default", GroupResource::parse("pods"), "rps");
        let a = CacheKey::custom_named(scope.clone(), "podA");
        let b = CacheKey::custom_named(scope, "podB");
        assert_ne!(a, b);
        assert_eq!(a.to_string(), "custom/default/pods/rps/name=podA");
    }

    #[test]
    fn named_targets_sort_before_selector_targets() {
        assert!(
            TargetKey::Name("zzz".into())
                < TargetKey::Selector {
                    declaration: "aaa".into()
                }
        );
    }
}
