// Schema layer - entity definitions, associations and the dependency graph

pub mod association;
pub mod entity;
pub mod registry;

pub use association::{AssociationDef, AssociationKind, ReferentialAction};
pub use entity::{validators, AttributeDef, EntityDef, SemanticType};
pub use registry::SchemaRegistry;
