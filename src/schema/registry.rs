// Schema registry - entity map plus the directed association graph

use std::collections::{BTreeMap, HashMap};

use crate::error::{OrmError, OrmResult};
use crate::schema::association::{AssociationDef, AssociationKind};
use crate::schema::entity::{AttributeDef, EntityDef, SemanticType};

#[derive(Debug, Default)]
pub struct SchemaRegistry {
    entities: BTreeMap<String, EntityDef>,
    associations: Vec<AssociationDef>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity definition. Implicit attributes (primary key,
    /// timestamps, version counter) are injected here.
    pub fn define(&mut self, mut def: EntityDef) -> OrmResult<()> {
        if self.entities.contains_key(&def.name) {
            return Err(OrmError::SchemaError(format!(
                "entity '{}' already defined",
                def.name
            )));
        }
        def.finalize();
        tracing::debug!("defined entity '{}' ({} attributes)", def.name, def.attributes.len());
        self.entities.insert(def.name.clone(), def);
        Ok(())
    }

    /// Declare an association. The foreign-key column is injected into the
    /// holding entity when absent; the referenced side must already expose a
    /// primary or unique key of a compatible type.
    pub fn associate(&mut self, assoc: AssociationDef) -> OrmResult<()> {
        for name in [&assoc.source, &assoc.target] {
            if !self.entities.contains_key(name.as_str()) {
                return Err(OrmError::SchemaError(format!(
                    "association references undefined entity '{}'",
                    name
                )));
            }
        }
        // Rejecting a duplicate must not leave an injected fk column behind.
        if self
            .associations
            .iter()
            .any(|a| a.source == assoc.source && a.name() == assoc.name())
        {
            return Err(OrmError::SchemaError(format!(
                "association '{}' already declared on '{}'; use an alias",
                assoc.name(),
                assoc.source
            )));
        }
        match &assoc.kind {
            AssociationKind::BelongsToMany { through } => {
                if !self.entities.contains_key(through.as_str()) {
                    return Err(OrmError::SchemaError(format!(
                        "through entity '{}' is not defined",
                        through
                    )));
                }
                let other_key = assoc.other_key.clone().ok_or_else(|| {
                    OrmError::SchemaError("belongs-to-many requires an other_key".to_string())
                })?;
                self.check_referenced_key(&assoc.source)?;
                self.check_referenced_key(&assoc.target)?;
                let through = through.clone();
                self.inject_fk(&through, &assoc.foreign_key)?;
                self.inject_fk(&through, &other_key)?;
            }
            _ => {
                self.check_referenced_key(assoc.fk_references())?;
                let holder = assoc.fk_holder().to_string();
                self.inject_fk(&holder, &assoc.foreign_key)?;
            }
        }
        self.associations.push(assoc);
        Ok(())
    }

    fn check_referenced_key(&self, entity: &str) -> OrmResult<()> {
        let def = self.entity(entity)?;
        if !def.attributes.iter().any(|a| a.primary_key || a.unique) {
            return Err(OrmError::SchemaError(format!(
                "entity '{}' has no primary or unique key to reference",
                entity
            )));
        }
        Ok(())
    }

    fn inject_fk(&mut self, holder: &str, fk: &str) -> OrmResult<()> {
        let def = self
            .entities
            .get_mut(holder)
            .ok_or_else(|| OrmError::SchemaError(format!("unknown entity '{}'", holder)))?;
        if !def.has_attribute(fk) {
            def.attributes
                .push(AttributeDef::new(fk, SemanticType::Integer));
        }
        Ok(())
    }

    pub fn entity(&self, name: &str) -> OrmResult<&EntityDef> {
        self.entities.get(name).ok_or_else(|| {
            OrmError::SchemaError(format!("unknown entity '{}'", name))
        })
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntityDef> {
        self.entities.values()
    }

    /// Look up an association declared on `source` by alias or target name.
    pub fn association(&self, source: &str, name: &str) -> Option<&AssociationDef> {
        self.associations
            .iter()
            .find(|a| a.source == source && a.name() == name)
    }

    pub fn associations_from<'a>(
        &'a self,
        source: &'a str,
    ) -> impl Iterator<Item = &'a AssociationDef> {
        self.associations.iter().filter(move |a| a.source == source)
    }

    /// Topological creation order over constraining edges only. Edges marked
    /// `constraints: false` do not participate, which is what allows cyclic
    /// declarations (including self references) to be created independently.
    pub fn creation_order(&self) -> OrmResult<Vec<String>> {
        let mut indegree: BTreeMap<&str, usize> =
            self.entities.keys().map(|k| (k.as_str(), 0)).collect();
        // holder -> referenced: holder depends on every entity it references
        let mut edges: HashMap<&str, Vec<&str>> = HashMap::new();
        fn push_edge<'a>(
            edges: &mut HashMap<&'a str, Vec<&'a str>>,
            indegree: &mut BTreeMap<&'a str, usize>,
            referenced: &'a str,
            holder: &'a str,
        ) {
            edges.entry(referenced).or_default().push(holder);
            *indegree.entry(holder).or_insert(0) += 1;
        }
        for assoc in self.associations.iter().filter(|a| a.constraints) {
            match &assoc.kind {
                AssociationKind::BelongsToMany { through } => {
                    push_edge(&mut edges, &mut indegree, &assoc.source, through);
                    push_edge(&mut edges, &mut indegree, &assoc.target, through);
                }
                _ => {
                    push_edge(
                        &mut edges,
                        &mut indegree,
                        assoc.fk_references(),
                        assoc.fk_holder(),
                    );
                }
            }
        }

        let mut ready: Vec<&str> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(k, _)| *k)
            .collect();
        ready.sort_unstable();
        let mut order = Vec::with_capacity(self.entities.len());
        while let Some(name) = ready.pop() {
            order.push(name.to_string());
            for next in edges.get(name).into_iter().flatten() {
                let d = indegree.get_mut(next).expect("edge to unknown entity");
                *d -= 1;
                if *d == 0 {
                    ready.push(next);
                }
            }
        }
        if order.len() != self.entities.len() {
            let mut stuck: Vec<String> = indegree
                .iter()
                .filter(|(_, d)| **d > 0)
                .map(|(k, _)| k.to_string())
                .collect();
            stuck.sort();
            return Err(OrmError::CyclicDependency(stuck));
        }
        Ok(order)
    }

    /// CREATE TABLE statement for one entity, with FK clauses for every
    /// constraining association whose foreign key lives here.
    pub fn ddl(&self, entity: &EntityDef) -> String {
        let mut cols: Vec<String> = Vec::new();
        for attr in &entity.attributes {
            let mut col = format!("\"{}\" {}", attr.name, attr.semantic.sql_type());
            if attr.primary_key {
                col.push_str(" PRIMARY KEY");
                if attr.auto_increment {
                    col.push_str(" AUTOINCREMENT");
                }
            } else {
                if !attr.nullable {
                    col.push_str(" NOT NULL");
                }
                if attr.unique {
                    col.push_str(" UNIQUE");
                }
            }
            if let Some(default) = &attr.default_value {
                let literal = match default {
                    serde_json::Value::String(s) => format!("'{}'", s.replace('\'', "''")),
                    serde_json::Value::Bool(b) => if *b { "1" } else { "0" }.to_string(),
                    other => other.to_string(),
                };
                col.push_str(&format!(" DEFAULT {}", literal));
            }
            cols.push(col);
        }
        for assoc in self.associations.iter().filter(|a| a.constraints) {
            let mut fk_clause = |fk: &str, referenced: &str| {
                if let Ok(target) = self.entity(referenced) {
                    cols.push(format!(
                        "FOREIGN KEY (\"{}\") REFERENCES \"{}\" (\"{}\") ON DELETE {} ON UPDATE {}",
                        fk,
                        target.table,
                        target.primary_key().name,
                        assoc.on_delete.as_sql(),
                        assoc.on_update.as_sql(),
                    ));
                }
            };
            match &assoc.kind {
                AssociationKind::BelongsToMany { through } if through == &entity.name => {
                    fk_clause(&assoc.foreign_key, &assoc.source);
                    if let Some(other) = &assoc.other_key {
                        fk_clause(other, &assoc.target);
                    }
                }
                AssociationKind::BelongsToMany { .. } => {}
                _ if assoc.fk_holder() == entity.name => {
                    fk_clause(&assoc.foreign_key, assoc.fk_references());
                }
                _ => {}
            }
        }
        format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" ({})",
            entity.table,
            cols.join(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::entity::SemanticType;

    fn registry() -> SchemaRegistry {
        let mut reg = SchemaRegistry::new();
        reg.define(
            EntityDef::new("user")
                .attr(AttributeDef::new("username", SemanticType::Text).not_null()),
        )
        .unwrap();
        reg.define(EntityDef::new("task").attr(AttributeDef::new("title", SemanticType::Text)))
            .unwrap();
        reg
    }

    #[test]
    fn has_many_injects_foreign_key_into_target() {
        let mut reg = registry();
        reg.associate(AssociationDef::has_many("user", "task")).unwrap();
        assert!(reg.entity("task").unwrap().has_attribute("user_id"));
    }

    #[test]
    fn creation_order_puts_referenced_entity_first() {
        let mut reg = registry();
        reg.associate(AssociationDef::has_many("user", "task")).unwrap();
        let order = reg.creation_order().unwrap();
        let user = order.iter().position(|n| n == "user").unwrap();
        let task = order.iter().position(|n| n == "task").unwrap();
        assert!(user < task);
    }

    #[test]
    fn self_reference_without_constraints_orders_fine() {
        let mut reg = SchemaRegistry::new();
        reg.define(EntityDef::new("document").attr(AttributeDef::new("body", SemanticType::Text)))
            .unwrap();
        reg.associate(
            AssociationDef::belongs_to("document", "document")
                .alias("current")
                .foreign_key("current_id")
                .without_constraints(),
        )
        .unwrap();
        assert_eq!(reg.creation_order().unwrap(), vec!["document".to_string()]);
    }

    #[test]
    fn self_reference_with_constraints_is_cyclic() {
        let mut reg = SchemaRegistry::new();
        reg.define(EntityDef::new("document").attr(AttributeDef::new("body", SemanticType::Text)))
            .unwrap();
        reg.associate(
            AssociationDef::belongs_to("document", "document")
                .alias("current")
                .foreign_key("current_id"),
        )
        .unwrap();
        match reg.creation_order() {
            Err(OrmError::CyclicDependency(names)) => {
                assert_eq!(names, vec!["document".to_string()]);
            }
            other => panic!("expected cyclic dependency error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn duplicate_association_name_needs_alias() {
        let mut reg = registry();
        reg.associate(AssociationDef::has_many("user", "task")).unwrap();
        assert!(reg.associate(AssociationDef::has_many("user", "task")).is_err());
        assert!(reg
            .associate(AssociationDef::has_many("user", "task").alias("chores").foreign_key("owner_id"))
            .is_ok());
    }

    #[test]
    fn rejected_duplicate_injects_no_foreign_key() {
        let mut reg = registry();
        reg.associate(AssociationDef::has_many("user", "task")).unwrap();
        assert!(reg
            .associate(AssociationDef::has_many("user", "task").foreign_key("owner_id"))
            .is_err());
        assert!(!reg.entity("task").unwrap().has_attribute("owner_id"));
    }

    #[test]
    fn ddl_includes_fk_clause() {
        let mut reg = registry();
        reg.associate(AssociationDef::has_many("user", "task")).unwrap();
        let task = reg.entity("task").unwrap();
        let ddl = reg.ddl(task);
        assert!(ddl.contains("FOREIGN KEY (\"user_id\") REFERENCES \"users\" (\"id\")"));
        assert!(ddl.contains("ON DELETE SET NULL ON UPDATE CASCADE"));
    }
}
