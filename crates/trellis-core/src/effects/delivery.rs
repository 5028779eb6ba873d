//! Local consumer and lifecycle effects

use crate::Tag;

/// Consumer of broadcast payloads delivered on this daemon
pub trait DeliveryEffects {
    /// Hand an xcast payload to whatever consumes `tag` locally
    fn deliver(&self, tag: Tag, payload: Vec<u8>);
}

/// Daemon lifecycle control
pub trait LifecycleEffects {
    /// Terminate the daemon after an unrecoverable protocol failure
    fn force_exit(&self, reason: &str);
}
