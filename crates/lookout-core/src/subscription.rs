// ── Subscription descriptions ──
//
// A `SubscriptionSpec` is what callers hand to `Registry::register`: which
// resource to keep fresh, which topic signals that it changed, and what to
// call with the results.

use std::fmt;
use std::sync::Arc;

use lookout_api::{FetchOptions, QueryParams};
use serde_json::Value;

use crate::error::SubscriptionError;
use crate::topic::TopicPattern;

/// Opaque handle for a registered subscription.
///
/// Unique for the lifetime of the registry that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

pub type UpdateCallback = Arc<dyn Fn(Value, SubscriptionId) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(&SubscriptionError) + Send + Sync>;
pub type FetchStartCallback = Arc<dyn Fn(SubscriptionId) + Send + Sync>;
/// Receives the parsed payload and the concrete (prefix-stripped) topic.
pub type NotificationPredicate = Arc<dyn Fn(&Value, &str) -> bool + Send + Sync>;

/// Which topic signals that the resource changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TopicSource {
    /// The resource path itself.
    #[default]
    Resource,
    /// An explicit topic, possibly with `+` / trailing `#` wildcards.
    Override(String),
}

/// Whether a change notification should trigger a re-fetch.
#[derive(Clone, Default)]
pub enum NotificationFilter {
    #[default]
    Always,
    Predicate(NotificationPredicate),
}

impl NotificationFilter {
    pub fn wants(&self, payload: &Value, topic: &str) -> bool {
        match self {
            Self::Always => true,
            Self::Predicate(predicate) => predicate(payload, topic),
        }
    }
}

impl fmt::Debug for NotificationFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Always => f.write_str("Always"),
            Self::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// Everything `register` needs. Built with the chained setters.
#[derive(Clone)]
pub struct SubscriptionSpec {
    pub resource: String,
    pub query: QueryParams,
    pub topic: TopicSource,
    pub filter: NotificationFilter,
    pub fetch_options: FetchOptions,
    pub on_update: UpdateCallback,
    pub on_error: ErrorCallback,
    pub on_fetch_start: Option<FetchStartCallback>,
}

impl SubscriptionSpec {
    pub fn new(
        resource: impl Into<String>,
        on_update: impl Fn(Value, SubscriptionId) + Send + Sync + 'static,
        on_error: impl Fn(&SubscriptionError) + Send + Sync + 'static,
    ) -> Self {
        Self {
            resource: resource.into(),
            query: QueryParams::new(),
            topic: TopicSource::Resource,
            filter: NotificationFilter::Always,
            fetch_options: FetchOptions::default(),
            on_update: Arc::new(on_update),
            on_error: Arc::new(on_error),
            on_fetch_start: None,
        }
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    pub fn topic_override(mut self, topic: impl Into<String>) -> Self {
        self.topic = TopicSource::Override(topic.into());
        self
    }

    pub fn predicate(mut self, predicate: impl Fn(&Value, &str) -> bool + Send + Sync + 'static) -> Self {
        self.filter = NotificationFilter::Predicate(Arc::new(predicate));
        self
    }

    pub fn on_fetch_start(mut self, callback: impl Fn(SubscriptionId) + Send + Sync + 'static) -> Self {
        self.on_fetch_start = Some(Arc::new(callback));
        self
    }

    pub fn fetch_options(mut self, options: FetchOptions) -> Self {
        self.fetch_options = options;
        self
    }

    /// The override if there is one, else the resource path.
    pub fn effective_topic(&self) -> &str {
        match &self.topic {
            TopicSource::Resource => &self.resource,
            TopicSource::Override(topic) => topic,
        }
    }

    /// The effective topic as a matcher. Resource paths match literally;
    /// only overrides may carry wildcards.
    pub fn topic_pattern(&self) -> TopicPattern {
        match &self.topic {
            TopicSource::Resource => TopicPattern::literal(&self.resource),
            TopicSource::Override(topic) => TopicPattern::parse(topic),
        }
    }
}

impl fmt::Debug for SubscriptionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionSpec")
            .field("resource", &self.resource)
            .field("query", &self.query)
            .field("topic", &self.topic)
            .field("filter", &self.filter)
            .finish_non_exhaustive()
    }
}
