//! Supertrait for the full collective effect set

use super::{DeliveryEffects, DirectoryEffects, LifecycleEffects, TopologyEffects, TransportEffects};

/// Everything the collective engine needs from its environment
pub trait CollectiveEffects:
    TransportEffects + TopologyEffects + DirectoryEffects + DeliveryEffects + LifecycleEffects
{
}

/// Automatic implementation for types that satisfy the required bounds
impl<T> CollectiveEffects for T where
    T: TransportEffects + TopologyEffects + DirectoryEffects + DeliveryEffects + LifecycleEffects
{
}
