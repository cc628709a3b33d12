// lookout-core: keeps logical subscriptions to backend resources fresh over
// one shared change-notification channel.

pub mod config;
pub mod debounce;
pub mod error;
pub mod registry;
pub mod session;
pub mod subscription;
pub mod topic;

// ── Primary re-exports ──────────────────────────────────────────────
pub use config::{BrokerConfig, SyncConfig, TlsVerification};
pub use error::{CoreError, SubscriptionError};
pub use registry::Registry;
pub use session::{Session, SessionState};
pub use subscription::{NotificationFilter, SubscriptionId, SubscriptionSpec, TopicSource};
pub use topic::TopicPattern;
