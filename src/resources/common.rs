//! Common utilities for Kubernetes resources owned by the operator

use std::collections::BTreeMap;

use kube::api::PatchParams;

/// Operator field manager name
pub const FIELD_MANAGER: &str = "mongodb-operator";

/// Label carrying the application name on every managed object
pub const APP_LABEL: &str = "app.kubernetes.io/name";

/// Label marking a client connection Secret; the value is the database username
pub const CLIENT_USER_LABEL: &str = "mongodb-operator/client-user";

/// Pod annotations carrying the projected unit status
pub const STATUS_ANNOTATION: &str = "mongodb-operator/status";
pub const STATUS_MESSAGE_ANNOTATION: &str = "mongodb-operator/status-message";

/// Standard labels for all objects belonging to an application
pub fn standard_labels(app_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (APP_LABEL.to_string(), app_name.to_string()),
        (
            "app.kubernetes.io/component".to_string(),
            "mongodb".to_string(),
        ),
        (
            "app.kubernetes.io/managed-by".to_string(),
            FIELD_MANAGER.to_string(),
        ),
    ])
}

/// Patch parameters recording the operator as field manager
pub fn patch_params() -> PatchParams {
    PatchParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

/// Label selector matching every pod of the application
pub fn app_selector(app_name: &str) -> String {
    format!("{}={}", APP_LABEL, app_name)
}
