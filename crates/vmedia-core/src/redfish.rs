//! Redfish resource event emission.
//!
//! Events are emitted as structured records the journal forwarder picks up.
//! Only successful attach/detach transitions produce events.

pub const RESOURCE_CREATED: &str = "OpenBMC.0.1.ResourceCreated";
pub const RESOURCE_DELETED: &str = "OpenBMC.0.1.ResourceDeleted";

pub trait ResourceEvents: Send + Sync {
    fn resource_created(&self, object_path: &str);
    fn resource_deleted(&self, object_path: &str);
}

/// Notifier writing Redfish message registry entries to the journal stream.
pub struct RedfishNotifier;

impl ResourceEvents for RedfishNotifier {
    fn resource_created(&self, object_path: &str) {
        tracing::info!(
            target: "redfish",
            REDFISH_MESSAGE_ID = RESOURCE_CREATED,
            path = object_path,
            "resource created"
        );
    }

    fn resource_deleted(&self, object_path: &str) {
        tracing::info!(
            target: "redfish",
            REDFISH_MESSAGE_ID = RESOURCE_DELETED,
            path = object_path,
            "resource deleted"
        );
    }
}
