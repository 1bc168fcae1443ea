// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Status vocabulary.
//!
//! Instance status strings are a union of the provider dialects: the managed
//! RDS backends report lowercase hyphenated states ("available", "backing-up",
//! "moving-to-vpc", ...) while Cloud SQL reports uppercase states ("RUNNABLE",
//! "PENDING_CREATE", ...). Rather than normalize at the edges, the broker
//! keeps the raw strings and classifies them with the total predicates below.

/// The instance is fully available for use.
pub fn is_available(status: &str) -> bool {
    status == "available" || status == "RUNNABLE"
}

/// The instance can serve connections, possibly during background maintenance.
pub fn is_ready(status: &str) -> bool {
    matches!(
        status,
        "available"
            | "configuring-enhanced-monitoring"
            | "storage-optimization"
            | "backing-up"
            | "RUNNABLE"
            | "UNKNOWN_STATE"
    )
}

/// A provider-side operation is underway and will settle on its own.
pub fn in_progress(status: &str) -> bool {
    matches!(
        status,
        "creating"
            | "starting"
            | "modifying"
            | "rebooting"
            | "moving-to-vpc"
            | "renaming"
            | "upgrading"
            | "backtracking"
            | "maintenance"
            | "resetting-master-credentials"
            | "PENDING_CREATE"
            | "MAINTENANCE"
    )
}

/// Bindings may be read back in this state.
pub fn can_get_bindings(status: &str) -> bool {
    !matches!(
        status,
        "creating"
            | "starting"
            | "stopping"
            | "stopped"
            | "deleting"
            | "SUSPENDED"
            | "PENDING_CREATE"
            | "MAINTENANCE"
            | "FAILED"
            | "UNKNOWN_STATE"
    )
}

/// The instance will accept a modification request in this state.
pub fn can_be_modified(status: &str) -> bool {
    !in_progress(status)
        && !matches!(
            status,
            "backing-up" | "SUSPENDED" | "FAILED" | "UNKNOWN_STATE"
        )
}

/// The instance can be safely deleted in this state.
pub fn can_be_deleted(status: &str) -> bool {
    !matches!(
        status,
        "creating"
            | "starting"
            | "rebooting"
            | "moving-to-vpc"
            | "backing-up"
            | "renaming"
            | "upgrading"
            | "backtracking"
            | "maintenance"
            | "resetting-master-credentials"
            | "SUSPENDED"
            | "PENDING_CREATE"
            | "MAINTENANCE"
            | "FAILED"
            | "UNKNOWN_STATE"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_STATUSES: &[&str] = &[
        "available",
        "configuring-enhanced-monitoring",
        "storage-optimization",
        "backing-up",
        "creating",
        "starting",
        "stopping",
        "stopped",
        "deleting",
        "modifying",
        "rebooting",
        "moving-to-vpc",
        "renaming",
        "upgrading",
        "backtracking",
        "maintenance",
        "resetting-master-credentials",
        "RUNNABLE",
        "SUSPENDED",
        "PENDING_CREATE",
        "MAINTENANCE",
        "FAILED",
        "UNKNOWN_STATE",
    ];

    #[test]
    fn available_implies_ready() {
        for status in ALL_STATUSES {
            if is_available(status) {
                assert!(is_ready(status), "{status} is available but not ready");
            }
        }
    }

    #[test]
    fn available_and_in_progress_are_disjoint() {
        for status in ALL_STATUSES {
            assert!(
                !(is_available(status) && in_progress(status)),
                "{status} is both available and in progress"
            );
        }
    }

    #[test]
    fn classifies_provider_dialects() {
        assert!(is_available("available"));
        assert!(is_available("RUNNABLE"));
        assert!(!is_available("creating"));

        assert!(is_ready("backing-up"));
        assert!(is_ready("UNKNOWN_STATE"));
        assert!(!is_ready("creating"));

        assert!(in_progress("PENDING_CREATE"));
        assert!(in_progress("resetting-master-credentials"));
        assert!(!in_progress("available"));
    }

    #[test]
    fn binding_and_modify_gates() {
        assert!(can_get_bindings("available"));
        assert!(can_get_bindings("backing-up"));
        assert!(!can_get_bindings("creating"));
        assert!(!can_get_bindings("FAILED"));

        assert!(can_be_modified("available"));
        assert!(!can_be_modified("backing-up"));
        assert!(!can_be_modified("modifying"));
        assert!(!can_be_modified("SUSPENDED"));
    }

    #[test]
    fn unknown_strings_fall_through() {
        // Predicates are total: an unrecognized status is neither available
        // nor in progress, but does not block binding reads.
        assert!(!is_available("doing-something-new"));
        assert!(!in_progress("doing-something-new"));
        assert!(can_get_bindings("doing-something-new"));
    }
}
