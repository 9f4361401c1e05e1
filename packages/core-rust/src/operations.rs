//! Typed payloads for the operations the agent understands.
//!
//! Each type serializes to the camelCase payload the server expects and knows
//! its wire name and required-field set. None of them add correlation
//! behavior: they only describe what goes into an `invoke` call.

use bytes::Bytes;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::payload::{to_object, PayloadError};

/// A fully described operation payload, ready to be invoked.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationPayload {
    /// Wire name without the `Request` suffix.
    pub name: &'static str,
    /// JSON payload in camelCase.
    pub payload: Map<String, Value>,
    /// Fields that must be present and non-null.
    pub required: &'static [&'static str],
    /// Raw archive sent after the JSON, if any.
    pub attachment: Option<Bytes>,
}

/// Implemented by every typed operation.
pub trait TypedOperation: Serialize {
    /// Wire name without the `Request` suffix.
    const NAME: &'static str;
    /// Required payload fields, correlation field included.
    const REQUIRED: &'static [&'static str];

    /// Archive content sent as the frame's binary tail.
    fn attachment(&self) -> Option<Bytes> {
        None
    }

    /// Serializes `self` into an [`OperationPayload`].
    ///
    /// # Errors
    ///
    /// Returns [`PayloadError`] if the type does not serialize to an object.
    fn into_payload(self) -> Result<OperationPayload, PayloadError>
    where
        Self: Sized,
    {
        Ok(OperationPayload {
            name: Self::NAME,
            payload: to_object(&self)?,
            required: Self::REQUIRED,
            attachment: self.attachment(),
        })
    }
}

/// Runs a named operation on a resource through the generic entry point.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteOperation {
    pub resource_path: String,
    pub operation_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Map<String, Value>>,
}

impl TypedOperation for ExecuteOperation {
    const NAME: &'static str = crate::frame::DEFAULT_OPERATION;
    const REQUIRED: &'static [&'static str] = &["resourcePath", "operationName"];
}

/// Deploys an archive to the target server.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Deploy {
    pub resource_path: String,
    pub destination_file_name: String,
    pub enabled: bool,
    pub force_deploy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_groups: Option<String>,
    #[serde(skip)]
    pub content: Bytes,
}

impl Deploy {
    /// A deployment that is enabled on arrival and does not replace an existing one.
    #[must_use]
    pub fn new(
        resource_path: impl Into<String>,
        destination_file_name: impl Into<String>,
        content: impl Into<Bytes>,
    ) -> Self {
        Self {
            resource_path: resource_path.into(),
            destination_file_name: destination_file_name.into(),
            enabled: true,
            force_deploy: false,
            server_groups: None,
            content: content.into(),
        }
    }
}

impl TypedOperation for Deploy {
    const NAME: &'static str = "DeployApplication";
    const REQUIRED: &'static [&'static str] = &["resourcePath", "destinationFileName"];

    fn attachment(&self) -> Option<Bytes> {
        non_empty(&self.content)
    }
}

/// Removes a deployment.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Undeploy {
    pub resource_path: String,
    pub destination_file_name: String,
    pub remove_content: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_groups: Option<String>,
}

impl Undeploy {
    #[must_use]
    pub fn new(resource_path: impl Into<String>, deployment_name: impl Into<String>) -> Self {
        Self {
            resource_path: resource_path.into(),
            destination_file_name: deployment_name.into(),
            remove_content: true,
            server_groups: None,
        }
    }
}

impl TypedOperation for Undeploy {
    const NAME: &'static str = "UndeployApplication";
    const REQUIRED: &'static [&'static str] = &["resourcePath", "destinationFileName"];
}

/// Payload shared by enable/disable/restart of an existing deployment.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentTarget {
    pub resource_path: String,
    pub destination_file_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_groups: Option<String>,
}

impl DeploymentTarget {
    #[must_use]
    pub fn new(resource_path: impl Into<String>, deployment_name: impl Into<String>) -> Self {
        Self {
            resource_path: resource_path.into(),
            destination_file_name: deployment_name.into(),
            server_groups: None,
        }
    }
}

/// An empty archive is no attachment: it could not be told apart on decode.
fn non_empty(content: &Bytes) -> Option<Bytes> {
    (!content.is_empty()).then(|| content.clone())
}

macro_rules! deployment_action {
    ($(#[$meta:meta])* $ty:ident => $wire:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Serialize)]
        pub struct $ty(pub DeploymentTarget);

        impl TypedOperation for $ty {
            const NAME: &'static str = $wire;
            const REQUIRED: &'static [&'static str] = &["resourcePath", "destinationFileName"];
        }
    };
}

deployment_action!(
    /// Enables a disabled deployment.
    EnableDeployment => "EnableApplication"
);
deployment_action!(
    /// Disables a deployment without removing it.
    DisableDeployment => "DisableApplication"
);
deployment_action!(
    /// Restarts a deployment.
    RestartDeployment => "RestartApplication"
);

/// Installs a JDBC driver from a jar archive.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddJdbcDriver {
    pub resource_path: String,
    pub driver_jar_name: String,
    pub driver_name: String,
    pub module_name: String,
    pub driver_class: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver_major_version: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub driver_minor_version: Option<u32>,
    #[serde(skip)]
    pub content: Bytes,
}

impl TypedOperation for AddJdbcDriver {
    const NAME: &'static str = "AddJdbcDriver";
    const REQUIRED: &'static [&'static str] = &[
        "resourcePath",
        "driverJarName",
        "driverName",
        "moduleName",
        "driverClass",
    ];

    fn attachment(&self) -> Option<Bytes> {
        non_empty(&self.content)
    }
}

/// Removes the resource at `resource_path` (driver or datasource).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    pub resource_path: String,
}

impl ResourceRef {
    #[must_use]
    pub fn new(resource_path: impl Into<String>) -> Self {
        Self {
            resource_path: resource_path.into(),
        }
    }
}

/// Removes a JDBC driver.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoveJdbcDriver(pub ResourceRef);

impl TypedOperation for RemoveJdbcDriver {
    const NAME: &'static str = "RemoveJdbcDriver";
    const REQUIRED: &'static [&'static str] = &["resourcePath"];
}

/// Creates a datasource.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AddDatasource {
    pub resource_path: String,
    pub xa_datasource: bool,
    pub datasource_name: String,
    pub jndi_name: String,
    pub driver_name: String,
    pub driver_class: String,
    pub connection_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub datasource_properties: Option<Map<String, Value>>,
}

impl TypedOperation for AddDatasource {
    const NAME: &'static str = "AddDatasource";
    const REQUIRED: &'static [&'static str] = &[
        "resourcePath",
        "xaDatasource",
        "datasourceName",
        "jndiName",
        "driverName",
        "driverClass",
        "connectionUrl",
    ];
}

/// Removes a datasource.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoveDatasource(pub ResourceRef);

impl TypedOperation for RemoveDatasource {
    const NAME: &'static str = "RemoveDatasource";
    const REQUIRED: &'static [&'static str] = &["resourcePath"];
}

/// Requests a diagnostic bundle; the reply carries it as an attachment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportDiagnostics(pub ResourceRef);

impl TypedOperation for ExportDiagnostics {
    const NAME: &'static str = "ExportJdr";
    const REQUIRED: &'static [&'static str] = &["resourcePath"];
}

/// Changes how often metrics and availability are collected, in seconds per type.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateCollectionIntervals {
    pub resource_path: String,
    pub metric_types: Map<String, Value>,
    pub avail_types: Map<String, Value>,
}

impl TypedOperation for UpdateCollectionIntervals {
    const NAME: &'static str = "UpdateCollectionIntervals";
    const REQUIRED: &'static [&'static str] = &["resourcePath", "metricTypes", "availTypes"];
}
