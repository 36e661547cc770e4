//! # strata-subscription
//!
//! Multi-SIM subscription orchestrator for Strata field modems.
//!
//! Activates and deactivates SIM applications across the card slots of a
//! multi-subscription modem, and decides which single subscription carries
//! cellular data (the DDS). Conflicting modem commands are serialized onto
//! one channel; data sessions are drained before their subscription is
//! reassigned; card hot-plug and radio power cycles reset affected slots.
//!
//! ## Crate structure
//!
//! - [`model`]: subscriptions, application types, causes
//! - [`table`]: per-slot current state
//! - [`pending`]: activate/deactivate queues and request validation
//! - [`preference`]: persisted user preference and subscription selectors
//! - [`event`]: dispatch-loop events and completion handles
//! - [`ports`]: collaborator traits (card inventory, modem, data stack)
//! - [`registrants`]: typed listener registry
//! - [`orchestrator`]: the state machine
//! - [`service`]: tokio task wrapper and cloneable handle
//! - [`sim`]: simulated collaborators
//! - [`config`]: TOML configuration

pub mod config;
pub mod error;
pub mod event;
pub mod model;
pub mod orchestrator;
pub mod pending;
pub mod ports;
pub mod preference;
pub mod registrants;
pub mod service;
pub mod sim;
pub mod snapshot;
pub mod table;

pub use config::ManagerConfig;
pub use error::SubscriptionError;
pub use event::{CommandError, CommandToken, Completion, DataNotifier, Event, EventSender};
pub use model::{
    AppDescriptor, AppType, CardInfo, CardUnavailableReason, Cause, Direction, SlotId,
    Subscription, SubscriptionData, SubscriptionStatus,
};
pub use orchestrator::{SetSubscriptionOutcome, SubscriptionManager};
pub use ports::{
    CardInventory, Collaborators, DataConnectivityCoordinator, RadioCommandChannel,
    UiccSubscriptionRequest,
};
pub use preference::{
    FilePreferenceStore, MemoryPreferenceStore, PreferenceStore, UserPreference,
};
pub use registrants::{ListenerId, Notice, NoticeKind, NoticeReceiver};
pub use service::{ServiceTask, SubscriptionHandle, SubscriptionService};
pub use snapshot::SubscriptionSnapshot;
