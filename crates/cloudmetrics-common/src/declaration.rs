//! Declarations: immutable snapshots of metric declaration CRDs
//!
//! The reconciler never sees CRD objects directly. Each watch event is
//! converted into a [`Declaration`], a tagged union over the two kinds that
//! keeps only what derivation needs plus the [`ChangeToken`] used to order
//! re-deliveries.

use std::fmt;

use kube::{Resource, ResourceExt};

use crate::crd::{CustomMetric, CustomMetricSpec, ExternalMetric, ExternalMetricSpec};
use crate::Error;

/// Declaration kind discriminant
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DeclarationKind {
    /// `ExternalMetric`
    External,
    /// `CustomMetric`
    Custom,
}

impl DeclarationKind {
    /// CRD kind name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::External => "ExternalMetric",
            Self::Custom => "CustomMetric",
        }
    }
}

impl fmt::Display for DeclarationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of a declaration: kind plus namespace/name
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeclarationId {
    /// Declaration kind
    pub kind: DeclarationKind,
    /// Namespace of the CRD object
    pub namespace: String,
    /// Name of the CRD object
    pub name: String,
}

impl DeclarationId {
    /// Build an identity
    pub fn new(kind: DeclarationKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for DeclarationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// Version information used to tell a genuine update from a replay
///
/// `generation` only moves forward for a given `uid`, so it orders updates
/// to one object. A different `uid` means the object was deleted and
/// recreated. `resource_version` is opaque and never compared for ordering.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ChangeToken {
    /// Object UID
    pub uid: Option<String>,
    /// `metadata.generation`
    pub generation: Option<i64>,
    /// `metadata.resourceVersion`
    pub resource_version: Option<String>,
}

impl ChangeToken {
    /// Whether this token is strictly older than `applied` for the same object
    ///
    /// Tokens without a uid or generation are never considered stale.
    pub fn is_older_than(&self, applied: &ChangeToken) -> bool {
        match (&self.uid, &applied.uid, self.generation, applied.generation) {
            (Some(a), Some(b), Some(ga), Some(gb)) => a == b && ga < gb,
            _ => false,
        }
    }

    fn from_meta<K: Resource>(obj: &K) -> Self {
        Self {
            uid: obj.uid(),
            generation: obj.meta().generation,
            resource_version: obj.resource_version(),
        }
    }
}

/// Object metadata kept from the CRD
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DeclarationMeta {
    /// Namespace; `None` when the object arrived without one
    pub namespace: Option<String>,
    /// Name; `None` when the object arrived without one
    pub name: Option<String>,
    /// Version information
    pub token: ChangeToken,
}

impl DeclarationMeta {
    fn from_object<K: Resource>(obj: &K) -> Self {
        Self {
            namespace: obj.namespace(),
            name: obj.meta().name.clone(),
            token: ChangeToken::from_meta(obj),
        }
    }
}

/// A metric declaration of either kind
#[derive(Clone, Debug, PartialEq)]
pub enum Declaration {
    /// From an `ExternalMetric`
    External {
        /// Object metadata
        meta: DeclarationMeta,
        /// Spec snapshot
        spec: ExternalMetricSpec,
    },
    /// From a `CustomMetric`
    Custom {
        /// Object metadata
        meta: DeclarationMeta,
        /// Spec snapshot
        spec: CustomMetricSpec,
    },
}

impl Declaration {
    /// Discriminant
    pub fn kind(&self) -> DeclarationKind {
        match self {
            Self::External { .. } => DeclarationKind::External,
            Self::Custom { .. } => DeclarationKind::Custom,
        }
    }

    /// Object metadata
    pub fn meta(&self) -> &DeclarationMeta {
        match self {
            Self::External { meta, .. } | Self::Custom { meta, .. } => meta,
        }
    }

    /// Change token
    pub fn token(&self) -> &ChangeToken {
        &self.meta().token
    }

    /// Identity; fails if namespace or name is missing
    pub fn id(&self) -> Result<DeclarationId, Error> {
        let meta = self.meta();
        let name = meta
            .name
            .as_deref()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| Error::validation(format!("{} has no name", self.kind())))?;
        let namespace = meta
            .namespace
            .as_deref()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| {
                Error::validation_for_field(
                    format!("{}/?/{}", self.kind(), name),
                    "metadata.namespace",
                    "metric declarations must be namespaced",
                )
            })?;
        Ok(DeclarationId::new(self.kind(), namespace, name))
    }
}

impl From<&ExternalMetric> for Declaration {
    fn from(obj: &ExternalMetric) -> Self {
        let mut spec = obj.spec.clone();
        spec.external_metric_name = Some(obj.metric_name());
        Self::External {
            meta: DeclarationMeta::from_object(obj),
            spec,
        }
    }
}

impl From<&CustomMetric> for Declaration {
    fn from(obj: &CustomMetric) -> Self {
        let mut spec = obj.spec.clone();
        spec.metric_name = Some(obj.metric_name());
        Self::Custom {
            meta: DeclarationMeta::from_object(obj),
            spec,
        }
    }
}
