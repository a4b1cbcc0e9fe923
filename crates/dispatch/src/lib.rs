//! Event dispatch for Parley.
//!
//! Platform extensions publish [`Event`](parley_core::Event)s; subscribed
//! triggers inspect them and matched actions run on the tokio pool.

pub mod dispatcher;
pub mod subscription;

pub use dispatcher::{DispatchConfig, Dispatcher, DispatcherState, HandlerFailure, ShutdownReport};
pub use subscription::{DEFAULT_PRIORITY, SubscriptionHandle, SubscriptionInfo};
