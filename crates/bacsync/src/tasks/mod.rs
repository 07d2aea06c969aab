//! Background sync tasks and the reconciler that creates them
//!
//! Tasks live in the engine's [`TaskRegistry`](bacsync_runtime::TaskRegistry)
//! under deterministic names, which is what makes reconciliation idempotent:
//!
//! - subscription: `device:10,analogInput:0,confirmed`
//! - poll: `device:10,analogInput:0`

mod poll;
mod reconciler;
mod subscription;

pub use poll::PollTask;
pub use reconciler::Reconciler;
pub use subscription::SubscriptionTask;

use crate::types::ObjectIdentifier;

pub const SUBSCRIPTION_KIND: &str = "subscription";
pub const POLL_KIND: &str = "poll";

pub fn confirmation(confirmed: bool) -> &'static str {
    if confirmed { "confirmed" } else { "unconfirmed" }
}

pub fn subscription_name(device: &ObjectIdentifier, object: &ObjectIdentifier, confirmed: bool) -> String {
    format!("{device},{object},{}", confirmation(confirmed))
}

pub fn poll_name(device: &ObjectIdentifier, object: &ObjectIdentifier) -> String {
    format!("{device},{object}")
}

/// Prefix shared by every subscription name of one object
pub fn subscription_prefix(device: &ObjectIdentifier, object: &ObjectIdentifier) -> String {
    format!("{device},{object},")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_names() {
        let device = ObjectIdentifier::device(10);
        let object: ObjectIdentifier = "analogInput:0".parse().unwrap();

        assert_eq!(
            subscription_name(&device, &object, true),
            "device:10,analogInput:0,confirmed"
        );
        assert_eq!(poll_name(&device, &object), "device:10,analogInput:0");
        assert!(subscription_name(&device, &object, false).starts_with(&subscription_prefix(&device, &object)));
        assert!(!poll_name(&device, &object).starts_with(&subscription_prefix(&device, &object)));
    }
}
