//! Permission node tree - typed nodes addressed by namespace

mod defaults;
mod tree;
mod value;

pub use defaults::PermissionDefault;
pub use tree::{NodeId, Permission, PermissionTree};
pub use value::{PermissionType, PermissionValue};
