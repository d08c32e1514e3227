//! Generic, domain-agnostic fan-out subscriptions.
//!
//! Producers push opaque values through `receive`; listeners registered with
//! `subscribe` (or `queue`, for keyed channels) get every value delivered
//! while they are live. Zero knowledge of what the values mean.
//!
//! Locks in this crate only guard bookkeeping collections. Listener callbacks
//! and teardown actions always run with no lock held, so a listener may
//! cancel itself, cancel a sibling, or re-enter `receive` on the same registry.

pub mod capability;
pub mod handle;
pub mod keyed;
pub mod registry;
// Shared with the other eventlink crates; not part of the public surface.
#[doc(hidden)]
pub mod sync;

pub use capability::{CapabilityCounter, CapabilityState};
pub use handle::{Cancellable, Subscription};
pub use keyed::KeyedRegistry;
pub use registry::SubscriptionRegistry;
