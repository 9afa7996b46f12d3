//! Selector subscriptions on store namespaces.
//!
//! A subscriber registers a selector over a namespace view and a callback.
//! After every commit to that namespace the selector is re-evaluated and the
//! callback runs only if the derived value changed:
//!
//! ```ignore
//! let handle = engine.subscribe(
//!     "board:ticket-42",
//!     |view| view.value["status"].clone(),
//!     |status| println!("status is now {}", status),
//! );
//! engine.unsubscribe(&handle);
//! ```

mod registry;
mod types;

pub use registry::SubscriptionRegistry;
pub use types::{Conflict, NamespaceView, SubscriptionHandle, SubscriptionId};
