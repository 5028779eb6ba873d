//! Effect traits for the collective engine's external collaborators
//!
//! The engine is single-threaded and never blocks, so every effect is a plain
//! synchronous `&self` method. Handlers that need mutable state use interior
//! mutability.

pub mod delivery;
pub mod directory;
pub mod supertraits;
pub mod topology;
pub mod transport;

pub use delivery::{DeliveryEffects, LifecycleEffects};
pub use directory::{DirectoryEffects, EndpointInfo, InfoEntry, LookupError};
pub use supertraits::CollectiveEffects;
pub use topology::{TopologyChange, TopologyEffects};
pub use transport::{Tag, TransportEffects};
