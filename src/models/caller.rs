//! Identity of the principal invoking a catalog operation.

use serde::{Deserialize, Serialize};

/// The authenticated caller, as resolved by the gateway in front of the service.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct Caller {
    pub owner_id: i64,
    pub is_admin: bool,
}

impl Caller {
    pub fn owner(owner_id: i64) -> Self {
        Self {
            owner_id,
            is_admin: false,
        }
    }

    pub fn admin(owner_id: i64) -> Self {
        Self {
            owner_id,
            is_admin: true,
        }
    }

    /// Owners may touch their own nodes; admins may touch anyone's.
    pub fn can_access(&self, owner_id: i64) -> bool {
        self.is_admin || self.owner_id == owner_id
    }
}
