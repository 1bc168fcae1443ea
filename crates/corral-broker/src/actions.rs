// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-instance action registry.
//!
//! Actions are the broker's extension verbs beyond the OSB core: backups,
//! roles, logs, restart, replicas. The controller owns the handlers; this
//! module owns the registration table the external transport converts into
//! routes, the extension-API discovery pointers, and the per-action OpenAPI
//! schema documents.

use serde_json::json;

use crate::osb::ExtensionApi;

/// One registered action: a name, a route path under the instance's actions
/// prefix, and an HTTP method.
#[derive(Debug, Clone, Copy)]
pub struct Action {
    pub name: &'static str,
    pub path: &'static str,
    pub method: &'static str,
}

/// The full registration table, built once at controller construction.
pub fn action_table() -> Vec<Action> {
    vec![
        Action { name: "list_backups", path: "backups", method: "GET" },
        Action { name: "get_backup", path: "backups/{backup}", method: "GET" },
        Action { name: "create_backup", path: "backups", method: "POST" },
        Action { name: "restore_backup", path: "backups/{backup}", method: "PUT" },
        Action { name: "list_roles", path: "roles", method: "GET" },
        Action { name: "get_role", path: "roles/{role}", method: "GET" },
        Action { name: "create_role", path: "roles", method: "POST" },
        Action { name: "rotate_role", path: "roles/{role}", method: "PUT" },
        Action { name: "delete_role", path: "roles/{role}", method: "DELETE" },
        Action { name: "view_logs", path: "logs", method: "GET" },
        Action { name: "restart", path: "restart", method: "PUT" },
        Action { name: "get_replica", path: "replica", method: "GET" },
        Action { name: "create_replica", path: "replica", method: "PUT" },
        Action { name: "delete_replica", path: "replica", method: "DELETE" },
    ]
}

fn base_url(instance_id: &str) -> String {
    format!("/v2/service_instances/{instance_id}/actions")
}

/// Extension-API discovery pointers for one instance.
pub fn extension_apis(actions: &[Action], instance_id: &str) -> Vec<ExtensionApi> {
    actions
        .iter()
        .map(|action| ExtensionApi {
            discovery_url: format!("{}/{}/schema", base_url(instance_id), action.name),
            server_url: format!("{}/", base_url(instance_id)),
        })
        .collect()
}

/// Minimal OpenAPI 3.0 document describing one action's single operation.
pub fn action_schema(
    actions: &[Action],
    action_name: &str,
    instance_id: &str,
) -> Option<serde_json::Value> {
    let action = actions.iter().find(|a| a.name == action_name)?;
    let base = base_url(instance_id);
    Some(json!({
        "openapi": "3.0.0",
        "servers": [
            {
                "description": "Extensions",
                "url": format!("{base}/{}/schema", action.name),
            },
            {
                "description": action.name,
                "url": format!("{base}/{}", action.path),
            },
        ],
        "info": {
            "description": format!("{} action", action.name),
            "version": "1.0.0",
            "title": action.name,
            "license": {
                "name": "Apache 2.0",
                "url": "http://www.apache.org/licenses/LICENSE-2.0.html",
            },
        },
        "paths": {
            format!("{base}/{}", action.path): {
                action.method.to_lowercase(): {
                    "tags": [action.name],
                    "summary": action.name,
                    "operationId": action.name,
                    "description": action.name,
                    "responses": {
                        "200": { "description": "OK" },
                        "400": { "description": "invalid input, object invalid" },
                    },
                },
            },
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_covers_every_action_group() {
        let table = action_table();
        assert_eq!(table.len(), 14);
        for prefix in ["backups", "roles", "logs", "restart", "replica"] {
            assert!(
                table.iter().any(|a| a.path.starts_with(prefix)),
                "no action registered under {prefix}"
            );
        }
        // Names are unique; the schema endpoint dispatches on them.
        let mut names: Vec<_> = table.iter().map(|a| a.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), table.len());
    }

    #[test]
    fn extension_apis_point_at_schema_documents() {
        let table = action_table();
        let apis = extension_apis(&table, "abc-123");
        assert_eq!(apis.len(), table.len());
        assert_eq!(
            apis[0].discovery_url,
            "/v2/service_instances/abc-123/actions/list_backups/schema"
        );
        assert_eq!(apis[0].server_url, "/v2/service_instances/abc-123/actions/");
    }

    #[test]
    fn schema_document_shape() {
        let table = action_table();
        let doc = action_schema(&table, "restore_backup", "abc-123").expect("known action");
        assert_eq!(doc["openapi"], "3.0.0");
        assert_eq!(doc["info"]["title"], "restore_backup");
        let path = "/v2/service_instances/abc-123/actions/backups/{backup}";
        assert!(doc["paths"][path]["put"].is_object());
        assert!(action_schema(&table, "no_such_action", "abc-123").is_none());
    }
}
