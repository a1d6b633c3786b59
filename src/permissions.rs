use std::fmt::Debug;

use strum_macros::{Display, EnumIter};

/// Runtime permissions the central role depends on.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Display, EnumIter)]
pub enum Permission {
    #[strum(to_string = "bluetooth_scan")]
    Scan,
    #[strum(to_string = "bluetooth_connect")]
    Connect,
}

/// Result of a permission check.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Display)]
pub enum PermissionStatus {
    #[strum(to_string = "granted")]
    Granted,
    #[strum(to_string = "denied")]
    Denied,
    /// Not granted yet, but the user could still be asked.
    #[strum(to_string = "can_request")]
    CanRequest,
}

impl PermissionStatus {
    #[must_use]
    pub fn is_granted(self) -> bool {
        matches!(self, Self::Granted)
    }
}

/// Answers whether a permission is currently granted.
pub trait PermissionChecker: Send + Sync + Debug {
    fn check(&self, permission: Permission) -> PermissionStatus;
}

/// Checker for platforms without a runtime permission model.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllPermissionsGranted;

impl PermissionChecker for AllPermissionsGranted {
    fn check(&self, _permission: Permission) -> PermissionStatus {
        PermissionStatus::Granted
    }
}

/// Checker returning a fixed status for every permission.
#[derive(Debug, Clone, Copy)]
pub struct FixedPermissionStatus(pub PermissionStatus);

impl PermissionChecker for FixedPermissionStatus {
    fn check(&self, _permission: Permission) -> PermissionStatus {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use strum::IntoEnumIterator;

    use super::*;

    #[test]
    fn default_checker_grants_every_permission() {
        for permission in Permission::iter() {
            assert!(AllPermissionsGranted.check(permission).is_granted());
        }
    }

    #[test]
    fn can_request_is_not_granted() {
        let checker = FixedPermissionStatus(PermissionStatus::CanRequest);
        assert!(!checker.check(Permission::Connect).is_granted());
        assert_eq!("bluetooth_connect", Permission::Connect.to_string());
    }
}
