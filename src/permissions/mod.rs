//! The Permission Broker: a request/approval state machine every privileged tool
//! invocation traverses (spec §4.B).
//!
//! ```text
//! pending ──approve──▶ approved ──consume(once)──▶ used
//!    │                     │
//!    └──deny──▶ denied     └──lazy expiry──▶ expired
//! ```

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{MethingsError, Result};
use crate::storage::{now_ms, PermissionRow, Storage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Once,
    Session,
    Persistent,
}

impl Scope {
    fn as_str(self) -> &'static str {
        match self {
            Self::Once => "once",
            Self::Session => "session",
            Self::Persistent => "persistent",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "session" => Self::Session,
            "persistent" => Self::Persistent,
            _ => Self::Once,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Grant {
    pub id: String,
    pub tool: String,
    pub detail: String,
    pub scope: String,
    pub status: String,
    pub created_at: i64,
    pub expires_at: Option<i64>,
}

impl From<PermissionRow> for Grant {
    fn from(row: PermissionRow) -> Self {
        Self {
            id: row.id,
            tool: row.tool,
            detail: row.detail,
            scope: row.scope,
            status: row.status,
            created_at: row.created_at,
            expires_at: row.expires_at,
        }
    }
}

/// The Permission Broker. Owns the `permissions` table exclusively (spec §3 ownership
/// rule): no other component writes a `status` transition directly.
#[derive(Clone)]
pub struct PermissionBroker {
    storage: Storage,
}

impl PermissionBroker {
    pub fn new(storage: Storage) -> Self {
        Self { storage }
    }

    /// `Request(tool, detail, scope, identity?, capability?) -> Grant`.
    ///
    /// `identity` and `capability` are accepted for API compatibility with the device
    /// API proxy's capability-cache keying but do not change how the grant itself is
    /// stored; the permissions table is keyed by opaque id alone (spec §3/§4.B).
    pub fn request(
        &self,
        tool: &str,
        detail: &str,
        scope: Scope,
        duration_min: Option<i64>,
    ) -> Result<Grant> {
        let id = format!("p_{}", Uuid::new_v4().simple());
        let expires_at = match scope {
            Scope::Session => duration_min.map(|min| now_ms() + min * 60_000),
            _ => None,
        };
        self.storage
            .create_permission(&id, tool, detail, scope.as_str(), expires_at)?;
        Ok(self
            .storage
            .get_permission(&id)?
            .expect("just-inserted permission row must exist")
            .into())
    }

    /// `Approve(id)`: idempotent `pending -> approved`. No-op on an already-approved
    /// grant; errors if the grant is already terminal (`denied`, `expired`, `used`).
    pub fn approve(&self, id: &str) -> Result<Grant> {
        let row = self.get_row(id)?;
        match row.status.as_str() {
            "pending" => {
                self.storage.update_permission_status(id, "approved")?;
            }
            "approved" => {}
            _ => return Err(MethingsError::InvalidPermission),
        }
        Ok(self.get_row(id)?.into())
    }

    /// `Deny(id)`: idempotent `pending -> denied`.
    pub fn deny(&self, id: &str) -> Result<Grant> {
        let row = self.get_row(id)?;
        match row.status.as_str() {
            "pending" => {
                self.storage.update_permission_status(id, "denied")?;
            }
            "denied" => {}
            _ => return Err(MethingsError::InvalidPermission),
        }
        Ok(self.get_row(id)?.into())
    }

    /// `Get(id) -> Grant?`. Lazily expires an `approved` grant past `expires_at`.
    pub fn get(&self, id: &str) -> Result<Option<Grant>> {
        let Some(row) = self.storage.get_permission(id)? else {
            return Ok(None);
        };
        Ok(Some(self.expire_if_due(row)?.into()))
    }

    pub fn list_pending(&self) -> Result<Vec<Grant>> {
        Ok(self
            .storage
            .list_pending_permissions()?
            .into_iter()
            .map(Grant::from)
            .collect())
    }

    /// `ConsumeOnce(id)`: after a successful privileged use, `approved -> used` if
    /// `scope = once`. A no-op for other scopes.
    pub fn consume_once(&self, id: &str) -> Result<()> {
        let row = self.get_row(id)?;
        if row.status == "approved" && row.scope == "once" {
            self.storage.update_permission_status(id, "used")?;
        }
        Ok(())
    }

    /// `Validate(id, expected_tool) -> Grant | ErrorKind` (spec §4.B).
    pub fn validate(&self, id: &str, expected_tool: &str) -> Result<Grant> {
        let Some(row) = self.storage.get_permission(id)? else {
            return Err(MethingsError::PermissionRequired);
        };
        if row.tool != expected_tool {
            return Err(MethingsError::InvalidPermission);
        }
        let row = self.expire_if_due(row)?;
        match row.status.as_str() {
            "approved" => Ok(row.into()),
            "expired" => Err(MethingsError::PermissionExpired),
            _ => Err(MethingsError::PermissionNotApproved),
        }
    }

    fn get_row(&self, id: &str) -> Result<PermissionRow> {
        self.storage
            .get_permission(id)?
            .ok_or(MethingsError::PermissionRequired)
    }

    fn expire_if_due(&self, row: PermissionRow) -> Result<PermissionRow> {
        if row.status == "approved" {
            if let Some(expires_at) = row.expires_at {
                if now_ms() > expires_at {
                    self.storage.update_permission_status(&row.id, "expired")?;
                    return Ok(PermissionRow {
                        status: "expired".to_string(),
                        ..row
                    });
                }
            }
        }
        Ok(row)
    }
}

/// Derive a `(tool, capability, scope)` triple from a `device_api` action name prefix
/// (spec §4.E). Used by the device API proxy when requesting a grant; reproduced here
/// so the broker and the proxy agree on the same mapping without duplicating it.
pub fn capability_for_action(action: &str) -> (&'static str, &'static str) {
    if action.starts_with("camera.") {
        ("device.camera", "camera")
    } else if action.starts_with("ssh.pin.") {
        ("ssh_pin", "sshd.pin")
    } else if action.starts_with("ssh.") {
        ("device.ssh", "ssh")
    } else if action.starts_with("usb.") || action.starts_with("uvc.") {
        ("device.usb", "usb")
    } else {
        ("device_api", "device_api")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker() -> PermissionBroker {
        PermissionBroker::new(Storage::open_in_memory().unwrap())
    }

    #[test]
    fn approve_then_consume_once() {
        let broker = broker();
        let grant = broker.request("shell", "run python -V", Scope::Once, None).unwrap();
        assert_eq!(grant.status, "pending");
        let grant = broker.approve(&grant.id).unwrap();
        assert_eq!(grant.status, "approved");
        let validated = broker.validate(&grant.id, "shell").unwrap();
        assert_eq!(validated.status, "approved");
        broker.consume_once(&grant.id).unwrap();
        let grant = broker.get(&grant.id).unwrap().unwrap();
        assert_eq!(grant.status, "used");
    }

    #[test]
    fn deny_is_terminal() {
        let broker = broker();
        let grant = broker.request("shell", "x", Scope::Once, None).unwrap();
        broker.deny(&grant.id).unwrap();
        let err = broker.approve(&grant.id).unwrap_err();
        assert!(matches!(err, MethingsError::InvalidPermission));
    }

    #[test]
    fn validate_mismatched_tool_is_invalid_permission() {
        let broker = broker();
        let grant = broker.request("shell", "x", Scope::Once, None).unwrap();
        broker.approve(&grant.id).unwrap();
        let err = broker.validate(&grant.id, "filesystem").unwrap_err();
        assert!(matches!(err, MethingsError::InvalidPermission));
    }

    #[test]
    fn validate_pending_is_not_approved() {
        let broker = broker();
        let grant = broker.request("shell", "x", Scope::Once, None).unwrap();
        let err = broker.validate(&grant.id, "shell").unwrap_err();
        assert!(matches!(err, MethingsError::PermissionNotApproved));
    }

    #[test]
    fn session_scope_expires_lazily() {
        let broker = broker();
        let grant = broker.request("shell", "x", Scope::Session, Some(0)).unwrap();
        broker.approve(&grant.id).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let err = broker.validate(&grant.id, "shell").unwrap_err();
        assert!(matches!(err, MethingsError::PermissionExpired));
        let grant = broker.get(&grant.id).unwrap().unwrap();
        assert_eq!(grant.status, "expired");
    }

    #[test]
    fn unknown_id_is_permission_required() {
        let broker = broker();
        let err = broker.validate("p_nonexistent", "shell").unwrap_err();
        assert!(matches!(err, MethingsError::PermissionRequired));
    }

    #[test]
    fn capability_mapping_matches_spec_examples() {
        assert_eq!(capability_for_action("camera.capture"), ("device.camera", "camera"));
        assert_eq!(capability_for_action("ssh.pin.start"), ("ssh_pin", "sshd.pin"));
        assert_eq!(capability_for_action("usb.bulk_transfer"), ("device.usb", "usb"));
        assert_eq!(capability_for_action("python.status"), ("device_api", "device_api"));
    }
}
