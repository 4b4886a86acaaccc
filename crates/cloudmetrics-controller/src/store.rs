//! Declaration store: list and watch metric declaration CRDs

use std::collections::HashSet;
use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use cloudmetrics_common::crd::{CustomMetric, ExternalMetric};
use cloudmetrics_common::{Declaration, DeclarationKind, Error};
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use kube::api::ListParams;
use kube::runtime::watcher::{self, Config as WatcherConfig, Event};
use kube::runtime::WatchStreamExt;
use kube::{Api, Client, Resource};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::reconciler::{ChangeKind, Notification};

/// Watcher timeout (seconds); must stay below the client read timeout (30s)
/// so idle watches are closed by the API server first
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Event delivered to the reconciler
#[derive(Clone, Debug, PartialEq)]
pub enum StoreEvent {
    /// A single declaration changed
    Changed(Notification),
    /// Complete current state of one kind, after a (re)list
    Listed {
        /// Kind that was listed
        kind: DeclarationKind,
        /// Every declaration of that kind
        declarations: Vec<Declaration>,
    },
}

/// Source of metric declarations
#[cfg_attr(test, automock)]
#[async_trait]
pub trait DeclarationStore: Send + Sync {
    /// List every declaration of both kinds
    async fn list(&self) -> Result<Vec<Declaration>, Error>;

    /// Merged change stream over both kinds
    ///
    /// The stream starts with a `Listed` event per kind and repeats it after
    /// every re-list.
    fn watch(&self) -> BoxStream<'static, StoreEvent>;
}

/// Retry policy for the initial declaration list
#[derive(Clone, Debug)]
pub struct ListBackoff {
    /// Delay after the first failed attempt
    pub initial_delay: Duration,
    /// Cap on the doubling delay
    pub max_delay: Duration,
    /// Give up after this many attempts (0 = never)
    pub max_attempts: u32,
}

impl Default for ListBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: 0,
        }
    }
}

/// List every declaration, retrying errors that [`Error::is_retryable`]
/// reports as transient
///
/// Non-retryable errors are returned on the first occurrence.
pub async fn list_with_backoff(
    store: &dyn DeclarationStore,
    backoff: &ListBackoff,
) -> Result<Vec<Declaration>, Error> {
    let mut attempt = 0u32;
    let mut delay = backoff.initial_delay;

    loop {
        attempt += 1;
        match store.list().await {
            Ok(declarations) => return Ok(declarations),
            Err(e) if e.is_retryable() && (backoff.max_attempts == 0 || attempt < backoff.max_attempts) => {
                warn!(
                    attempt,
                    error = %e,
                    delay_ms = delay.as_millis() as u64,
                    "Declaration list failed; retrying"
                );
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(backoff.max_delay);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Declaration store backed by the Kubernetes API
pub struct KubeDeclarationStore {
    client: Client,
}

impl KubeDeclarationStore {
    /// Create a store over all namespaces
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DeclarationStore for KubeDeclarationStore {
    async fn list(&self) -> Result<Vec<Declaration>, Error> {
        let external: Api<ExternalMetric> = Api::all(self.client.clone());
        let custom: Api<CustomMetric> = Api::all(self.client.clone());
        let params = ListParams::default();

        let mut declarations: Vec<Declaration> = external
            .list(&params)
            .await?
            .items
            .iter()
            .map(Declaration::from)
            .collect();
        declarations.extend(custom.list(&params).await?.items.iter().map(Declaration::from));

        info!(count = declarations.len(), "Listed metric declarations");
        Ok(declarations)
    }

    fn watch(&self) -> BoxStream<'static, StoreEvent> {
        stream::select(
            declaration_events::<ExternalMetric>(
                Api::all(self.client.clone()),
                DeclarationKind::External,
            ),
            declaration_events::<CustomMetric>(Api::all(self.client.clone()), DeclarationKind::Custom),
        )
        .boxed()
    }
}

fn declaration_events<K>(api: Api<K>, kind: DeclarationKind) -> BoxStream<'static, StoreEvent>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    for<'a> Declaration: From<&'a K>,
{
    let mut translator = EventTranslator::new(kind);
    info!(kind = %kind, "Starting declaration watcher");

    watcher::watcher(api, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
        .default_backoff()
        .filter_map(move |event| {
            let translated = match event {
                Ok(event) => translator.translate(map_event(event)),
                Err(e) => {
                    warn!(kind = %kind, error = %e, "Declaration watch error; retrying");
                    None
                }
            };
            futures::future::ready(translated)
        })
        .boxed()
}

fn map_event<K>(event: Event<K>) -> Event<Declaration>
where
    for<'a> Declaration: From<&'a K>,
{
    match event {
        Event::Apply(obj) => Event::Apply(Declaration::from(&obj)),
        Event::Delete(obj) => Event::Delete(Declaration::from(&obj)),
        Event::Init => Event::Init,
        Event::InitApply(obj) => Event::InitApply(Declaration::from(&obj)),
        Event::InitDone => Event::InitDone,
    }
}

/// Turns raw watcher events for one kind into store events
///
/// `Init..InitDone` pages are buffered into one `Listed` event. `Apply`
/// becomes `Added` the first time an object is seen and `Updated` after.
struct EventTranslator {
    kind: DeclarationKind,
    seen: HashSet<(Option<String>, Option<String>)>,
    listing: Option<Vec<Declaration>>,
}

impl EventTranslator {
    fn new(kind: DeclarationKind) -> Self {
        Self {
            kind,
            seen: HashSet::new(),
            listing: None,
        }
    }

    fn translate(&mut self, event: Event<Declaration>) -> Option<StoreEvent> {
        match event {
            Event::Init => {
                self.listing = Some(Vec::new());
                None
            }
            Event::InitApply(declaration) => {
                self.listing.get_or_insert_with(Vec::new).push(declaration);
                None
            }
            Event::InitDone => {
                let declarations = self.listing.take().unwrap_or_default();
                self.seen = declarations.iter().map(identity).collect();
                debug!(kind = %self.kind, count = declarations.len(), "Declaration list complete");
                Some(StoreEvent::Listed {
                    kind: self.kind,
                    declarations,
                })
            }
            Event::Apply(declaration) => {
                let change = if self.seen.insert(identity(&declaration)) {
                    ChangeKind::Added
                } else {
                    ChangeKind::Updated
                };
                Some(StoreEvent::Changed(Notification::new(change, declaration)))
            }
            Event::Delete(declaration) => {
                self.seen.remove(&identity(&declaration));
                Some(StoreEvent::Changed(Notification::new(
                    ChangeKind::Deleted,
                    declaration,
                )))
            }
        }
    }
}

fn identity(declaration: &Declaration) -> (Option<String>, Option<String>) {
    let meta = declaration.meta();
    (meta.namespace.clone(), meta.name.clone())
}
