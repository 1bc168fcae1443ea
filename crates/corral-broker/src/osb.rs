// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! OSB request/response contract consumed by the external transport.
//!
//! The broker does not own HTTP routing; a thin adaptor deserializes OSB
//! requests into these types, calls the controller, and serializes the
//! responses back out.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProvisionRequest {
    pub instance_id: String,
    pub plan_id: String,
    pub accepts_incomplete: bool,
    #[serde(default)]
    pub organization_guid: String,
    /// Optional callback URL, delivered once the instance is available.
    #[serde(default)]
    pub webhook: Option<String>,
    /// Shared secret used to sign the callback body.
    #[serde(default)]
    pub secret: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ProvisionResponse {
    #[serde(skip)]
    pub exists: bool,
    #[serde(rename = "async")]
    pub is_async: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    pub extension_apis: Vec<ExtensionApi>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeprovisionRequest {
    pub instance_id: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DeprovisionResponse {
    #[serde(rename = "async")]
    pub is_async: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateRequest {
    pub instance_id: String,
    pub plan_id: Option<String>,
    pub accepts_incomplete: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UpdateResponse {
    #[serde(rename = "async")]
    pub is_async: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BindRequest {
    pub instance_id: String,
    pub binding_id: String,
    /// GUID of the application the binding is for, when the platform knows it.
    pub app_guid: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BindResponse {
    #[serde(rename = "async")]
    pub is_async: bool,
    pub credentials: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UnbindRequest {
    pub instance_id: String,
    pub binding_id: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct UnbindResponse {
    #[serde(rename = "async")]
    pub is_async: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GetBindingRequest {
    pub instance_id: String,
    pub binding_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GetBindingResponse {
    pub credentials: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LastOperationRequest {
    pub instance_id: String,
    #[serde(default)]
    pub operation: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LastOperationResponse {
    pub state: OperationState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// OSB last-operation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OperationState {
    #[serde(rename = "succeeded")]
    Succeeded,
    #[serde(rename = "in progress")]
    InProgress,
    #[serde(rename = "failed")]
    Failed,
}

/// Discovery pointers for the per-instance action extension.
#[derive(Debug, Clone, Serialize)]
pub struct ExtensionApi {
    pub discovery_url: String,
    pub server_url: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CatalogResponse {
    pub services: Vec<corral_store::CatalogService>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provision_response_wire_shape() {
        let response = ProvisionResponse {
            exists: true,
            is_async: true,
            operation: Some("abc".to_string()),
            extension_apis: vec![],
        };
        let json = serde_json::to_value(&response).unwrap();
        // `exists` is broker-internal; the wire field is `async`.
        assert_eq!(json["async"], true);
        assert_eq!(json["operation"], "abc");
        assert!(json.get("exists").is_none());
    }

    #[test]
    fn operation_states_use_osb_wire_words() {
        assert_eq!(
            serde_json::to_string(&OperationState::Succeeded).unwrap(),
            "\"succeeded\""
        );
        assert_eq!(
            serde_json::to_string(&OperationState::InProgress).unwrap(),
            "\"in progress\""
        );
        assert_eq!(
            serde_json::to_string(&OperationState::Failed).unwrap(),
            "\"failed\""
        );
    }

    #[test]
    fn bind_response_keeps_credential_keys() {
        let mut credentials = BTreeMap::new();
        credentials.insert("DATABASE_URL".to_string(), "postgres://u:p@h/x".to_string());
        credentials.insert(
            "DATABASE_READONLY_URL".to_string(),
            "postgres://u:p@h-ro/x".to_string(),
        );
        let json = serde_json::to_value(BindResponse {
            is_async: false,
            credentials,
        })
        .unwrap();
        assert_eq!(json["credentials"]["DATABASE_URL"], "postgres://u:p@h/x");
        assert_eq!(
            json["credentials"]["DATABASE_READONLY_URL"],
            "postgres://u:p@h-ro/x"
        );
    }
}
