//! Notifications emitted by the registry

use uuid::Uuid;

use crate::permissible::PermissibleKind;
use crate::references::References;

/// Registry-wide changes
#[derive(Debug, Clone, PartialEq)]
pub enum PermissibleSystemEvent {
    /// A backend finished loading and is now active
    BackendChanged { backend: String },
    /// The active backend was re-read
    Reloaded { backend: String },
    DefaultGroupChanged { group: Uuid, references: References },
    DebugModeToggle(bool),
    WhitelistToggle(bool),
    AllowOpToggle(bool),
}

/// Lifecycle of one cached entity or group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissibleEntityEvent {
    Loaded { id: Uuid, kind: PermissibleKind },
    Saved { id: Uuid, kind: PermissibleKind },
    Reloaded { id: Uuid, kind: PermissibleKind },
    /// Evicted from the cache, re-fetched on next access
    Reset { id: Uuid, kind: PermissibleKind },
    /// Deleted from the backend
    Removed { id: Uuid, kind: PermissibleKind },
}

impl PermissibleEntityEvent {
    pub fn id(&self) -> Uuid {
        match self {
            PermissibleEntityEvent::Loaded { id, .. }
            | PermissibleEntityEvent::Saved { id, .. }
            | PermissibleEntityEvent::Reloaded { id, .. }
            | PermissibleEntityEvent::Reset { id, .. }
            | PermissibleEntityEvent::Removed { id, .. } => *id,
        }
    }

    pub fn kind(&self) -> PermissibleKind {
        match self {
            PermissibleEntityEvent::Loaded { kind, .. }
            | PermissibleEntityEvent::Saved { kind, .. }
            | PermissibleEntityEvent::Reloaded { kind, .. }
            | PermissibleEntityEvent::Reset { kind, .. }
            | PermissibleEntityEvent::Removed { kind, .. } => *kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PermissionEvent {
    System(PermissibleSystemEvent),
    Entity(PermissibleEntityEvent),
}

impl From<PermissibleSystemEvent> for PermissionEvent {
    fn from(event: PermissibleSystemEvent) -> Self {
        PermissionEvent::System(event)
    }
}

impl From<PermissibleEntityEvent> for PermissionEvent {
    fn from(event: PermissibleEntityEvent) -> Self {
        PermissionEvent::Entity(event)
    }
}
