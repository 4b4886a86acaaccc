//! Common types for the cloudmetrics adapter
//!
//! - [`crd`] - `ExternalMetric` and `CustomMetric` custom resources and the
//!   opaque cloud query they carry
//! - [`declaration`] - the tagged union the reconciler consumes
//! - [`selector`] - label selector parsing and matching
//! - [`telemetry`] / [`metrics`] - tracing bootstrap and OpenTelemetry instruments

#![deny(missing_docs)]

pub mod crd;
pub mod declaration;
pub mod error;
pub mod metrics;
pub mod selector;
pub mod telemetry;

pub use declaration::{ChangeToken, Declaration, DeclarationId, DeclarationKind};
pub use error::Error;
pub use selector::Selector;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group of the metric declaration CRDs
pub const DECLARATION_GROUP: &str = "azure.com";

/// API version of the metric declaration CRDs
pub const DECLARATION_VERSION: &str = "v1alpha2";

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "cloudmetrics-adapter";
