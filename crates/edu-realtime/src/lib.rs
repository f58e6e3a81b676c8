//! # edu-realtime
//!
//! Real-time connection layer for live learning applications.
//!
//! The crate keeps one logical connection to a push service and exposes
//! topic-based subscriptions over it. Everything that makes such a
//! connection survivable lives here:
//!
//! - **Connection state machine** with validated transitions and
//!   synchronous, ordered observers
//! - **Subscription registry** with persistent subscriptions that are
//!   replayed after every reconnect
//! - **Message dispatcher** routing inbound messages to global and
//!   per-topic handlers, with correlated acknowledgments
//! - **Credential refresh** coalescing concurrent refreshes and swapping
//!   credentials into the live connection
//! - **Polling fallback** once the push transport keeps failing
//! - **State synchronization** mirroring state and notifications into an
//!   application store
//!
//! The wire itself is abstracted behind [`TransportProvider`]; the
//! `loopback` feature ships an in-process implementation.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use edu_realtime::{LoopbackTransport, RealtimeClient, RealtimeConfig, SubscribeOptions, TopicHandler};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RealtimeConfig::new().reconnect_base_delay(std::time::Duration::from_millis(250));
//!     let client = RealtimeClient::new(config, Arc::new(LoopbackTransport::new()))?;
//!
//!     client.connect().await?;
//!     client
//!         .subscribe(
//!             "course.101",
//!             vec![TopicHandler::any(|msg| {
//!                 println!("{}: {}", msg.event_type(), msg.payload());
//!                 Ok(())
//!             })],
//!             SubscribeOptions::persistent(),
//!         )
//!         .await?;
//!
//!     client.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod bridge;
pub mod client;
pub mod config;
pub mod credentials;
pub mod error;
pub mod hooks;
pub mod state;
pub mod subscription;
pub mod telemetry;
pub mod transport;
pub mod types;

mod dispatcher;
mod fallback;
mod flight;
mod pending;
mod reconnect;
mod refresh;

#[cfg(feature = "loopback")]
pub mod loopback;

pub use bridge::{MemoryStore, Notification, Severity, StateStore, StoreAction, StoreError};
pub use client::{CLIENT_DISCONNECT, RealtimeClient, RealtimeClientBuilder};
pub use config::{AckDelivery, RealtimeConfig};
pub use credentials::{CredentialLease, CredentialSource, StaticCredentials};
pub use error::{ErrorKind, HandlerError, RealtimeError, RealtimeResult};
pub use hooks::ListenerHandle;
#[cfg(feature = "loopback")]
pub use loopback::LoopbackTransport;
pub use refresh::TOKEN_REFRESH_FAILED;
pub use state::{
    ConnectionEpoch, ConnectionState, ConnectionStats, StateTransition, StatsSnapshot,
    TransitionCause,
};
pub use subscription::{SubscribeOptions, Subscription, TopicHandler};
pub use telemetry::init_tracing;
pub use transport::{EventSink, PollingSource, TransportEvent, TransportProvider, WireHandle};
pub use types::{
    AckMessage, CorrelationId, EventMessage, EventType, InboundMessage, NotificationMessage,
    OutboundMessage, RawMessage, SendOptions, SubscriptionId, Topic,
};
