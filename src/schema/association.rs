// Associations - typed edges between entity definitions

use crate::query::condition::Cond;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssociationKind {
    HasOne,
    HasMany,
    BelongsTo,
    BelongsToMany { through: String },
}

/// Referential action applied by the engine on delete/update of the
/// referenced row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferentialAction {
    SetNull,
    Cascade,
    Restrict,
    NoAction,
}

impl ReferentialAction {
    pub fn as_sql(&self) -> &'static str {
        match self {
            ReferentialAction::SetNull => "SET NULL",
            ReferentialAction::Cascade => "CASCADE",
            ReferentialAction::Restrict => "RESTRICT",
            ReferentialAction::NoAction => "NO ACTION",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AssociationDef {
    pub source: String,
    pub target: String,
    pub kind: AssociationKind,
    /// Column holding the reference. Lives on the target for has-one /
    /// has-many, on the source for belongs-to, on the through entity for
    /// belongs-to-many.
    pub foreign_key: String,
    /// Second foreign key of a belongs-to-many edge (through -> target).
    pub other_key: Option<String>,
    pub alias: Option<String>,
    pub on_delete: ReferentialAction,
    pub on_update: ReferentialAction,
    /// When false the edge is non-constraining: no FK clause is emitted and
    /// the edge is ignored for creation ordering. Required to break cyclic
    /// declarations.
    pub constraints: bool,
    /// Association-level implicit filter, ANDed into the join condition of
    /// every eager load through this edge.
    pub scope: Option<Cond>,
}

impl AssociationDef {
    fn new(source: &str, target: &str, kind: AssociationKind) -> Self {
        let (foreign_key, other_key, on_delete, on_update) = match &kind {
            AssociationKind::BelongsTo => {
                (format!("{}_id", target), None, ReferentialAction::SetNull, ReferentialAction::Cascade)
            }
            AssociationKind::HasOne | AssociationKind::HasMany => {
                (format!("{}_id", source), None, ReferentialAction::SetNull, ReferentialAction::Cascade)
            }
            AssociationKind::BelongsToMany { .. } => (
                format!("{}_id", source),
                Some(format!("{}_id", target)),
                ReferentialAction::Cascade,
                ReferentialAction::Cascade,
            ),
        };
        Self {
            source: source.to_string(),
            target: target.to_string(),
            kind,
            foreign_key,
            other_key,
            alias: None,
            on_delete,
            on_update,
            constraints: true,
            scope: None,
        }
    }

    pub fn has_one(source: &str, target: &str) -> Self {
        Self::new(source, target, AssociationKind::HasOne)
    }

    pub fn has_many(source: &str, target: &str) -> Self {
        Self::new(source, target, AssociationKind::HasMany)
    }

    pub fn belongs_to(source: &str, target: &str) -> Self {
        Self::new(source, target, AssociationKind::BelongsTo)
    }

    pub fn belongs_to_many(source: &str, target: &str, through: &str) -> Self {
        Self::new(
            source,
            target,
            AssociationKind::BelongsToMany {
                through: through.to_string(),
            },
        )
    }

    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    pub fn foreign_key(mut self, fk: impl Into<String>) -> Self {
        self.foreign_key = fk.into();
        self
    }

    pub fn other_key(mut self, key: impl Into<String>) -> Self {
        self.other_key = Some(key.into());
        self
    }

    pub fn on_delete(mut self, action: ReferentialAction) -> Self {
        self.on_delete = action;
        self
    }

    pub fn on_update(mut self, action: ReferentialAction) -> Self {
        self.on_update = action;
        self
    }

    pub fn without_constraints(mut self) -> Self {
        self.constraints = false;
        self
    }

    pub fn scope(mut self, cond: Cond) -> Self {
        self.scope = Some(cond);
        self
    }

    /// Name the association is addressed by in includes and ordering: the
    /// alias when set, otherwise the target entity name.
    pub fn name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.target)
    }

    /// Entity that physically holds the foreign-key column.
    pub fn fk_holder(&self) -> &str {
        match &self.kind {
            AssociationKind::BelongsTo => &self.source,
            AssociationKind::HasOne | AssociationKind::HasMany => &self.target,
            AssociationKind::BelongsToMany { through } => through,
        }
    }

    /// Entity the foreign key references (must expose a primary/unique key).
    pub fn fk_references(&self) -> &str {
        match &self.kind {
            AssociationKind::BelongsTo => &self.target,
            AssociationKind::HasOne | AssociationKind::HasMany => &self.source,
            // Through edges reference both sides; handled by the registry.
            AssociationKind::BelongsToMany { .. } => &self.source,
        }
    }
}
