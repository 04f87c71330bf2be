//! Parties taking part in a chat session as resolved by the auth layer.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::types::{ClientId, ProviderId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
/// Role a party plays in the marketplace.
pub enum Role {
    /// Paying client who requests sessions.
    Client,
    /// Service provider (astrologer) who accepts sessions.
    Provider,
}

text_enum!(Role {
    Client => "client",
    Provider => "provider",
});

/// A resolved (party id, role) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Party {
    Client(ClientId),
    Provider(ProviderId),
}

impl Party {
    pub fn role(&self) -> Role {
        match self {
            Party::Client(_) => Role::Client,
            Party::Provider(_) => Role::Provider,
        }
    }

    pub fn uuid(&self) -> Uuid {
        match self {
            Party::Client(id) => *id.as_uuid(),
            Party::Provider(id) => *id.as_uuid(),
        }
    }

    /// Builds a party from a raw id and role, as carried by auth claims.
    pub fn from_parts(id: Uuid, role: Role) -> Self {
        match role {
            Role::Client => Party::Client(ClientId::from_uuid(id)),
            Role::Provider => Party::Provider(ProviderId::from_uuid(id)),
        }
    }
}

impl std::fmt::Display for Party {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.role(), self.uuid())
    }
}
