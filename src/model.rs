// Model layer - Db handle plus the scoped Model CRUD surface

use std::collections::HashMap;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;

use crate::config::Config;
use crate::error::{OrmError, OrmResult, ValidationItem};
use crate::executor::{self, RowMap};
use crate::hooks::{self, HookContext, HookPoint, HookRegistry, TimestampHook};
use crate::query::condition::Cond;
use crate::query::planner::{self, Include, LockHint, OrderBy};
use crate::query::predicate::Predicate;
use crate::query::scope::{QueryFragment, ScopeDef, ScopeRegistry};
use crate::schema::entity::EntityDef;
use crate::schema::registry::SchemaRegistry;
use crate::txn::{Txn, TxnOptions};

/// Database handle: connection pool, schema, hooks and scopes. Built once at
/// startup; `model()` hands out per-entity operation surfaces.
pub struct Db {
    pool: SqlitePool,
    registry: SchemaRegistry,
    hooks: HookRegistry,
    scopes: HashMap<String, ScopeRegistry>,
    config: Config,
}

impl Db {
    pub async fn connect(config: Config, registry: SchemaRegistry) -> OrmResult<Self> {
        let options = SqliteConnectOptions::from_str(&config.database.url)
            .map_err(|e| OrmError::Configuration(format!("invalid database url: {}", e)))?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(config.database.max_connections)
            .acquire_timeout(Duration::from_secs(config.database.acquire_timeout_secs))
            .connect_with(options)
            .await?;
        tracing::info!(
            "connected to {} (max {} connections)",
            config.database.url,
            config.database.max_connections
        );

        let mut hooks = HookRegistry::new();
        for entity in registry.entities() {
            if entity.timestamps {
                hooks.register(entity.name.clone(), Arc::new(TimestampHook));
            }
        }

        Ok(Self {
            pool,
            registry,
            hooks,
            scopes: HashMap::new(),
            config,
        })
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn hooks_mut(&mut self) -> &mut HookRegistry {
        &mut self.hooks
    }

    /// Scope registry for one entity, created on first use.
    pub fn scopes_mut(&mut self, entity: impl Into<String>) -> &mut ScopeRegistry {
        self.scopes.entry(entity.into()).or_default()
    }

    pub fn add_scope(&mut self, entity: &str, name: &str, def: ScopeDef) {
        self.scopes_mut(entity).add(name, def);
    }

    pub fn set_default_scope(&mut self, entity: &str, fragment: QueryFragment) {
        self.scopes_mut(entity).set_default(fragment);
    }

    /// Create every table in dependency order (non-constraining edges are
    /// ignored for ordering).
    pub async fn sync(&self) -> OrmResult<()> {
        for name in self.registry.creation_order()? {
            let entity = self.registry.entity(&name)?;
            let ddl = self.registry.ddl(entity);
            sqlx::query(&ddl).execute(&self.pool).await?;
            tracing::info!("synced table '{}'", entity.table);
        }
        Ok(())
    }

    pub fn model<'d>(&'d self, name: &str) -> OrmResult<Model<'d>> {
        let entity = self.registry.entity(name)?;
        Ok(Model {
            db: self,
            entity,
            scope: QueryFragment::default(),
            use_default_scope: true,
        })
    }

    /// Open an unmanaged transaction the caller must commit or roll back.
    pub async fn begin(&self) -> OrmResult<Txn> {
        self.begin_with(TxnOptions::default()).await
    }

    pub async fn begin_with(&self, opts: TxnOptions) -> OrmResult<Txn> {
        let isolation = opts.isolation.unwrap_or(self.config.txn.isolation);
        let timeout = opts
            .timeout
            .unwrap_or(Duration::from_millis(self.config.txn.unmanaged_timeout_ms));
        Txn::open(&self.pool, isolation, Some(timeout)).await
    }

    /// Managed transaction. The unit of work receives the transaction by
    /// value and hands it back with its result; committed on `Ok`, rolled
    /// back on `Err`.
    pub async fn transaction<T, F, Fut>(&self, work: F) -> OrmResult<T>
    where
        F: FnOnce(Txn) -> Fut,
        Fut: Future<Output = (Txn, OrmResult<T>)>,
    {
        let txn = Txn::open(&self.pool, self.config.txn.isolation, None).await?;
        let (txn, result) = work(txn).await;
        match result {
            Ok(value) => {
                txn.commit().await?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rb) = txn.rollback().await {
                    tracing::error!("rollback failed after {}: {}", err, rb);
                }
                Err(err)
            }
        }
    }
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db").field("config", &self.config).finish()
    }
}

// ---------------------------------------------------------------------------
// Per-operation option structs. Every operation takes its transaction handle
// explicitly; there is no ambient transaction context.
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FindOptions<'t> {
    pub where_: Option<Cond>,
    pub include: Vec<Include>,
    pub order: Vec<OrderBy>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    pub lock: Option<LockHint>,
    pub attributes: Option<Vec<String>>,
    pub txn: Option<&'t mut Txn>,
}

pub struct CreateOptions<'t> {
    /// Restrict which attributes are written; others fall back to column
    /// defaults.
    pub fields: Option<Vec<String>>,
    pub validate: bool,
    pub txn: Option<&'t mut Txn>,
}

impl Default for CreateOptions<'_> {
    fn default() -> Self {
        Self {
            fields: None,
            validate: true,
            txn: None,
        }
    }
}

pub struct BulkCreateOptions<'t> {
    pub fields: Option<Vec<String>>,
    pub validate: bool,
    /// All-or-nothing semantics. Non-atomic mode applies valid rows and
    /// reports rejected ones individually.
    pub atomic: bool,
    pub txn: Option<&'t mut Txn>,
}

impl Default for BulkCreateOptions<'_> {
    fn default() -> Self {
        Self {
            fields: None,
            validate: true,
            atomic: false,
            txn: None,
        }
    }
}

pub struct UpdateOptions<'t> {
    pub where_: Option<Cond>,
    pub fields: Option<Vec<String>>,
    pub validate: bool,
    pub txn: Option<&'t mut Txn>,
}

impl Default for UpdateOptions<'_> {
    fn default() -> Self {
        Self {
            where_: None,
            fields: None,
            validate: true,
            txn: None,
        }
    }
}

#[derive(Default)]
pub struct DestroyOptions<'t> {
    pub where_: Option<Cond>,
    pub txn: Option<&'t mut Txn>,
}

pub struct SaveOptions<'t> {
    pub fields: Option<Vec<String>>,
    pub validate: bool,
    pub txn: Option<&'t mut Txn>,
}

impl Default for SaveOptions<'_> {
    fn default() -> Self {
        Self {
            fields: None,
            validate: true,
            txn: None,
        }
    }
}

/// Outcome of a non-atomic bulk create: applied records plus each rejected
/// input paired with its own error.
#[derive(Debug, Default)]
pub struct BulkOutcome {
    pub created: Vec<Value>,
    pub failures: Vec<BulkFailure>,
}

#[derive(Debug)]
pub struct BulkFailure {
    pub index: usize,
    pub error: OrmError,
}

// ---------------------------------------------------------------------------
// Model
// ---------------------------------------------------------------------------

/// Entity-bound operation surface. `scope()` returns a new handle with the
/// named fragments folded in, usable like the unscoped one.
pub struct Model<'d> {
    db: &'d Db,
    entity: &'d EntityDef,
    scope: QueryFragment,
    use_default_scope: bool,
}

impl<'d> Model<'d> {
    pub fn entity(&self) -> &EntityDef {
        self.entity
    }

    /// Apply named scopes left to right. Calling this removes the default
    /// scope unless `"default_scope"` is among the names.
    pub fn scope(mut self, names: &[&str]) -> OrmResult<Self> {
        self.use_default_scope = false;
        for name in names {
            let fragment = self.resolve_scope(name, &[])?;
            self.scope = std::mem::take(&mut self.scope).merge(fragment);
        }
        Ok(self)
    }

    /// Apply one parameterized scope.
    pub fn scope_with(mut self, name: &str, args: &[Value]) -> OrmResult<Self> {
        self.use_default_scope = false;
        let fragment = self.resolve_scope(name, args)?;
        self.scope = std::mem::take(&mut self.scope).merge(fragment);
        Ok(self)
    }

    /// Drop the default scope and any applied scopes.
    pub fn unscoped(mut self) -> Self {
        self.use_default_scope = false;
        self.scope = QueryFragment::default();
        self
    }

    fn resolve_scope(&self, name: &str, args: &[Value]) -> OrmResult<QueryFragment> {
        let registry = self.db.scopes.get(&self.entity.name);
        match registry {
            Some(reg) => reg.resolve(&self.entity.name, name, args),
            None if name == "default_scope" => Ok(QueryFragment::default()),
            None => Err(OrmError::ScopeNotFound {
                entity: self.entity.name.clone(),
                scope: name.to_string(),
            }),
        }
    }

    /// Default scope (unless removed), then applied scopes, then the finder;
    /// later fragments override per the merge rules.
    fn effective(&self, finder: QueryFragment) -> QueryFragment {
        let mut fragment = QueryFragment::default();
        if self.use_default_scope {
            if let Some(default) = self
                .db
                .scopes
                .get(&self.entity.name)
                .and_then(|r| r.default_scope())
            {
                fragment = fragment.merge(default.clone());
            }
        }
        fragment = fragment.merge(self.scope.clone());
        fragment.merge(finder)
    }

    /// Fold named scopes requested on includes into their fragments, so the
    /// planner only sees plain filters. Association-level implicit filters
    /// stay on the association and apply independently.
    fn resolve_include_scopes(
        &self,
        parent: &str,
        includes: Vec<Include>,
    ) -> OrmResult<Vec<Include>> {
        let mut out = Vec::with_capacity(includes.len());
        for mut inc in includes {
            let target = self
                .db
                .registry
                .association(parent, &inc.association)
                .map(|a| a.target.clone());
            if let Some(target) = target {
                let scope_names = std::mem::take(&mut inc.scopes);
                let mut folded = QueryFragment::default();
                for name in &scope_names {
                    let registry = self.db.scopes.get(&target);
                    let fragment = match registry {
                        Some(reg) => reg.resolve(&target, name, &[])?,
                        None => {
                            return Err(OrmError::ScopeNotFound {
                                entity: target.clone(),
                                scope: name.clone(),
                            })
                        }
                    };
                    folded = folded.merge(fragment);
                }
                inc.where_ = match (inc.where_.take(), folded.where_) {
                    (Some(a), Some(b)) => Some(Cond::And(vec![a, b])),
                    (a, b) => a.or(b),
                };
                inc.include.extend(folded.include);
                inc.include = self.resolve_include_scopes(&target, inc.include)?;
            }
            out.push(inc);
        }
        Ok(out)
    }

    // -- finders ----------------------------------------------------------

    pub async fn find_all(&self, opts: FindOptions<'_>) -> OrmResult<Vec<Value>> {
        let FindOptions {
            where_,
            include,
            order,
            limit,
            offset,
            lock,
            attributes,
            mut txn,
        } = opts;
        let finder = QueryFragment {
            where_,
            include,
            order,
            limit,
            offset,
            lock,
            attributes,
        };
        let fragment = self.effective(finder);
        let includes = self.resolve_include_scopes(&self.entity.name, fragment.include)?;
        let plan = planner::plan(&self.db.registry, self.entity, &includes)?;
        let where_pred = match &fragment.where_ {
            Some(cond) => cond.compile(self.entity, &plan.root_alias)?,
            None => Predicate::True,
        };
        let mut order_cols = Vec::with_capacity(fragment.order.len());
        for order_by in &fragment.order {
            let col = plan.resolve_order(&self.db.registry, order_by)?;
            order_cols.push((col, order_by.dir.as_sql()));
        }
        let (sql, binds) = executor::build_select(
            &self.db.registry,
            &plan,
            &where_pred,
            &order_cols,
            fragment.limit,
            fragment.offset,
            fragment.lock,
            fragment.attributes.as_deref(),
        )?;
        let rows = executor::fetch_all(&self.db.pool, txn.as_deref_mut(), &sql, &binds).await?;
        let maps: Vec<RowMap> = rows.iter().map(executor::row_to_map).collect();
        plan.hydrate(&self.db.registry, &maps)
    }

    pub async fn find_one(&self, mut opts: FindOptions<'_>) -> OrmResult<Option<Value>> {
        opts.limit = Some(1);
        Ok(self.find_all(opts).await?.into_iter().next())
    }

    pub async fn find_by_pk(
        &self,
        pk: Value,
        txn: Option<&mut Txn>,
    ) -> OrmResult<Option<Value>> {
        let pk_name = self.entity.primary_key().name.clone();
        self.find_one(FindOptions {
            where_: Some(Cond::eq(pk_name, pk)),
            txn,
            ..Default::default()
        })
        .await
    }

    pub async fn count(&self, opts: FindOptions<'_>) -> OrmResult<u64> {
        let FindOptions {
            where_,
            include,
            mut txn,
            ..
        } = opts;
        let finder = QueryFragment {
            where_,
            include,
            ..Default::default()
        };
        let fragment = self.effective(finder);
        let includes = self.resolve_include_scopes(&self.entity.name, fragment.include)?;
        let plan = planner::plan(&self.db.registry, self.entity, &includes)?;
        let where_pred = match &fragment.where_ {
            Some(cond) => cond.compile(self.entity, &plan.root_alias)?,
            None => Predicate::True,
        };
        let (sql, binds) = executor::build_count(&self.db.registry, &plan, &where_pred)?;
        let rows = executor::fetch_all(&self.db.pool, txn.as_deref_mut(), &sql, &binds).await?;
        let count = rows
            .first()
            .map(executor::row_to_map)
            .and_then(|m| m.get("cnt").and_then(|v| v.as_u64()))
            .unwrap_or(0);
        Ok(count)
    }

    // -- writes -----------------------------------------------------------

    /// Non-persistent record with setters and declared defaults applied.
    pub fn build(&self, values: Value) -> OrmResult<Value> {
        let src = values.as_object().ok_or_else(|| {
            OrmError::Validation(vec![ValidationItem::new("record", "must be an object")])
        })?;
        let mut out = Map::new();
        for attr in &self.entity.attributes {
            match src.get(&attr.name) {
                Some(value) => {
                    let value = match &attr.setter {
                        Some(setter) => setter(value.clone()),
                        None => value.clone(),
                    };
                    out.insert(attr.name.clone(), value);
                }
                None => {
                    if let Some(default) = &attr.default_value {
                        out.insert(attr.name.clone(), default.clone());
                    }
                }
            }
        }
        Ok(Value::Object(out))
    }

    pub async fn create(&self, values: Value, opts: CreateOptions<'_>) -> OrmResult<Value> {
        let CreateOptions {
            fields,
            validate,
            mut txn,
        } = opts;
        let mut record = self.build(values)?;
        self.run_validation_pipeline(&mut record, validate, &mut txn).await?;
        self.run_record_hooks(HookPoint::BeforeCreate, &mut record, &mut txn).await?;
        self.run_record_hooks(HookPoint::BeforeSave, &mut record, &mut txn).await?;
        self.insert(&mut record, fields.as_deref(), &mut txn).await?;
        self.run_record_hooks(HookPoint::AfterCreate, &mut record, &mut txn).await?;
        self.run_record_hooks(HookPoint::AfterSave, &mut record, &mut txn).await?;
        Ok(record)
    }

    pub async fn bulk_create(
        &self,
        rows: Vec<Value>,
        opts: BulkCreateOptions<'_>,
    ) -> OrmResult<BulkOutcome> {
        let BulkCreateOptions {
            fields,
            validate,
            atomic,
            mut txn,
        } = opts;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(self.build(row)?);
        }
        self.run_bulk_hooks(HookPoint::BeforeBulkCreate, &mut records, &mut txn).await?;

        if atomic {
            // All rows must validate before anything is written.
            let mut items = Vec::new();
            for (index, record) in records.iter().enumerate() {
                if validate {
                    let map = record.as_object().expect("built record is an object");
                    for item in self.entity.validate_record(map) {
                        items.push(ValidationItem::new(
                            format!("[{}].{}", index, item.attribute),
                            item.message,
                        ));
                    }
                }
            }
            if !items.is_empty() {
                return Err(OrmError::Validation(items));
            }
            let mut own = match txn {
                Some(_) => None,
                None => Some(self.db.begin().await?),
            };
            let result = {
                let mut active = txn.as_deref_mut().or(own.as_mut());
                let mut created = Vec::with_capacity(records.len());
                let mut failure = None;
                for mut record in std::mem::take(&mut records) {
                    match self.insert(&mut record, fields.as_deref(), &mut active).await {
                        Ok(()) => created.push(record),
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    }
                }
                match failure {
                    Some(e) => Err(e),
                    None => Ok(created),
                }
            };
            return match result {
                Ok(mut created) => {
                    if let Some(own) = own {
                        own.commit().await?;
                    }
                    self.run_bulk_hooks(HookPoint::AfterBulkCreate, &mut created, &mut txn)
                        .await?;
                    Ok(BulkOutcome {
                        created,
                        failures: Vec::new(),
                    })
                }
                Err(e) => {
                    if let Some(own) = own {
                        let _ = own.rollback().await;
                    }
                    Err(e)
                }
            };
        }

        // Non-atomic: apply valid rows, pair each rejected input with its
        // own error, never abort already-applied records.
        let mut outcome = BulkOutcome::default();
        for (index, mut record) in records.into_iter().enumerate() {
            if validate {
                let map = record.as_object().expect("built record is an object");
                let items = self.entity.validate_record(map);
                if !items.is_empty() {
                    outcome.failures.push(BulkFailure {
                        index,
                        error: OrmError::Validation(items),
                    });
                    continue;
                }
            }
            match self.insert(&mut record, fields.as_deref(), &mut txn).await {
                Ok(()) => outcome.created.push(record),
                Err(error) => outcome.failures.push(BulkFailure { index, error }),
            }
        }
        self.run_bulk_hooks(HookPoint::AfterBulkCreate, &mut outcome.created, &mut txn)
            .await?;
        Ok(outcome)
    }

    /// Bulk update matching rows; returns the affected-row count.
    pub async fn update(&self, values: Value, opts: UpdateOptions<'_>) -> OrmResult<u64> {
        let UpdateOptions {
            where_,
            fields,
            validate,
            mut txn,
        } = opts;
        let mut values = values;
        if self.entity.timestamps {
            if let Some(map) = values.as_object_mut() {
                map.insert(
                    "updated_at".to_string(),
                    Value::String(chrono::Utc::now().to_rfc3339()),
                );
            }
        }
        if validate {
            self.validate_partial(&values)?;
        }
        // Bulk points carry the batch payload even though the update applies
        // a single change set; hooks see and may rewrite it in place.
        let mut batch = vec![values];
        self.run_bulk_hooks(HookPoint::BeforeBulkUpdate, &mut batch, &mut txn).await?;
        let values = batch.pop().unwrap_or(Value::Null);

        let map = values
            .as_object()
            .ok_or_else(|| {
                OrmError::Validation(vec![ValidationItem::new("record", "must be an object")])
            })?
            .clone();
        let fragment = self.effective(QueryFragment {
            where_,
            ..Default::default()
        });
        let pred = match &fragment.where_ {
            Some(cond) => cond.compile(self.entity, &self.entity.table)?,
            None => Predicate::True,
        };

        let mut sets = Vec::new();
        let mut binds = Vec::new();
        for attr in &self.entity.attributes {
            if attr.auto_increment {
                continue;
            }
            if let Some(fields) = &fields {
                if !fields.iter().any(|f| f == &attr.name) {
                    continue;
                }
            }
            if let Some(value) = map.get(&attr.name) {
                let value = match &attr.setter {
                    Some(setter) => setter(value.clone()),
                    None => value.clone(),
                };
                sets.push(format!("\"{}\" = ?", attr.name));
                binds.push(executor::to_storage(attr.semantic, &value));
            }
        }
        if sets.is_empty() {
            return Ok(0);
        }
        let mut sql = format!("UPDATE \"{}\" SET {}", self.entity.table, sets.join(", "));
        if !pred.is_true() {
            sql.push_str(" WHERE ");
            pred.render(&mut sql, &mut binds);
        }
        let result = executor::execute(
            &self.db.pool,
            txn.as_deref_mut(),
            &self.entity.name,
            &sql,
            &binds,
        )
        .await?;
        let mut batch = vec![values];
        self.run_bulk_hooks(HookPoint::AfterBulkUpdate, &mut batch, &mut txn).await?;
        Ok(result.rows_affected())
    }

    /// Delete matching rows; returns the affected-row count.
    pub async fn destroy(&self, opts: DestroyOptions<'_>) -> OrmResult<u64> {
        let DestroyOptions { where_, mut txn } = opts;
        self.run_plain_hooks(HookPoint::BeforeBulkDestroy, &mut txn).await?;
        let fragment = self.effective(QueryFragment {
            where_,
            ..Default::default()
        });
        let pred = match &fragment.where_ {
            Some(cond) => cond.compile(self.entity, &self.entity.table)?,
            None => Predicate::True,
        };
        let mut sql = format!("DELETE FROM \"{}\"", self.entity.table);
        let mut binds = Vec::new();
        if !pred.is_true() {
            sql.push_str(" WHERE ");
            pred.render(&mut sql, &mut binds);
        }
        let result = executor::execute(
            &self.db.pool,
            txn.as_deref_mut(),
            &self.entity.name,
            &sql,
            &binds,
        )
        .await?;
        self.run_plain_hooks(HookPoint::AfterBulkDestroy, &mut txn).await?;
        Ok(result.rows_affected())
    }

    /// Delete one persisted record by primary key, firing the per-record
    /// destroy hooks. Returns the affected-row count (0 when the record was
    /// never persisted or is already gone).
    pub async fn destroy_one(
        &self,
        record: &mut Value,
        txn: Option<&mut Txn>,
    ) -> OrmResult<u64> {
        let mut txn = txn;
        let pk_name = self.entity.primary_key().name.clone();
        let pk_value = record.get(&pk_name).cloned().unwrap_or(Value::Null);
        if pk_value.is_null() {
            return Ok(0);
        }
        self.run_record_hooks(HookPoint::BeforeDestroy, record, &mut txn).await?;
        let sql = format!(
            "DELETE FROM \"{}\" WHERE \"{}\" = ?",
            self.entity.table, pk_name
        );
        let result = executor::execute(
            &self.db.pool,
            txn.as_deref_mut(),
            &self.entity.name,
            &sql,
            std::slice::from_ref(&pk_value),
        )
        .await?;
        self.run_record_hooks(HookPoint::AfterDestroy, record, &mut txn).await?;
        Ok(result.rows_affected())
    }

    /// Persist one record: insert when the primary key is unset, otherwise
    /// update by primary key. Versioned entities take the optimistic-lock
    /// path: a stale stored version fails with `OptimisticLock`.
    pub async fn save(&self, record: &mut Value, opts: SaveOptions<'_>) -> OrmResult<()> {
        let SaveOptions {
            fields,
            validate,
            mut txn,
        } = opts;
        let pk_name = self.entity.primary_key().name.clone();
        let has_pk = record
            .get(&pk_name)
            .map(|v| !v.is_null())
            .unwrap_or(false);

        self.run_validation_pipeline(record, validate, &mut txn).await?;

        if !has_pk {
            self.run_record_hooks(HookPoint::BeforeCreate, record, &mut txn).await?;
            self.run_record_hooks(HookPoint::BeforeSave, record, &mut txn).await?;
            self.insert(record, fields.as_deref(), &mut txn).await?;
            self.run_record_hooks(HookPoint::AfterCreate, record, &mut txn).await?;
            self.run_record_hooks(HookPoint::AfterSave, record, &mut txn).await?;
            return Ok(());
        }

        self.run_record_hooks(HookPoint::BeforeUpdate, record, &mut txn).await?;
        self.run_record_hooks(HookPoint::BeforeSave, record, &mut txn).await?;

        let map = record
            .as_object()
            .ok_or_else(|| {
                OrmError::Validation(vec![ValidationItem::new("record", "must be an object")])
            })?
            .clone();
        let pk_value = map.get(&pk_name).cloned().unwrap_or(Value::Null);
        let stored_version = map.get("version").and_then(|v| v.as_i64());

        let mut sets = Vec::new();
        let mut binds = Vec::new();
        for attr in &self.entity.attributes {
            if attr.primary_key {
                continue;
            }
            if self.entity.versioned && attr.name == "version" {
                continue;
            }
            if let Some(fields) = &fields {
                if !fields.iter().any(|f| f == &attr.name) {
                    continue;
                }
            }
            if let Some(value) = map.get(&attr.name) {
                sets.push(format!("\"{}\" = ?", attr.name));
                binds.push(executor::to_storage(attr.semantic, value));
            }
        }
        if self.entity.versioned {
            let next = stored_version.unwrap_or(0) + 1;
            sets.push("\"version\" = ?".to_string());
            binds.push(Value::from(next));
        }
        if sets.is_empty() {
            return Ok(());
        }
        let mut sql = format!(
            "UPDATE \"{}\" SET {} WHERE \"{}\" = ?",
            self.entity.table,
            sets.join(", "),
            pk_name
        );
        binds.push(pk_value.clone());
        if self.entity.versioned {
            sql.push_str(" AND \"version\" = ?");
            binds.push(Value::from(stored_version.unwrap_or(0)));
        }
        let result = executor::execute(
            &self.db.pool,
            txn.as_deref_mut(),
            &self.entity.name,
            &sql,
            &binds,
        )
        .await?;

        if result.rows_affected() == 0 && self.entity.versioned {
            let exists = self
                .unscoped_exists(&pk_name, &pk_value, &mut txn)
                .await?;
            if exists {
                return Err(OrmError::OptimisticLock {
                    entity: self.entity.name.clone(),
                    pk: pk_value.as_i64().unwrap_or_default(),
                });
            }
        }
        if self.entity.versioned && result.rows_affected() > 0 {
            if let Some(map) = record.as_object_mut() {
                map.insert(
                    "version".to_string(),
                    Value::from(stored_version.unwrap_or(0) + 1),
                );
            }
        }

        self.run_record_hooks(HookPoint::AfterUpdate, record, &mut txn).await?;
        self.run_record_hooks(HookPoint::AfterSave, record, &mut txn).await?;
        Ok(())
    }

    // -- internals --------------------------------------------------------

    async fn unscoped_exists(
        &self,
        pk_name: &str,
        pk_value: &Value,
        txn: &mut Option<&mut Txn>,
    ) -> OrmResult<bool> {
        let sql = format!(
            "SELECT 1 AS one FROM \"{}\" WHERE \"{}\" = ?",
            self.entity.table, pk_name
        );
        let rows = executor::fetch_all(
            &self.db.pool,
            txn.as_deref_mut(),
            &sql,
            std::slice::from_ref(pk_value),
        )
        .await?;
        Ok(!rows.is_empty())
    }

    async fn insert(
        &self,
        record: &mut Value,
        fields: Option<&[String]>,
        txn: &mut Option<&mut Txn>,
    ) -> OrmResult<()> {
        let map = record
            .as_object()
            .ok_or_else(|| {
                OrmError::Validation(vec![ValidationItem::new("record", "must be an object")])
            })?
            .clone();
        let mut cols = Vec::new();
        let mut binds = Vec::new();
        for attr in &self.entity.attributes {
            let value = map.get(&attr.name);
            if attr.auto_increment && matches!(value, None | Some(Value::Null)) {
                continue;
            }
            if let Some(fields) = fields {
                if !attr.primary_key && !fields.iter().any(|f| f == &attr.name) {
                    continue;
                }
            }
            let Some(value) = value else { continue };
            cols.push(format!("\"{}\"", attr.name));
            binds.push(executor::to_storage(attr.semantic, value));
        }
        let placeholders = vec!["?"; cols.len()].join(", ");
        let sql = format!(
            "INSERT INTO \"{}\" ({}) VALUES ({})",
            self.entity.table,
            cols.join(", "),
            placeholders
        );
        let result = executor::execute(
            &self.db.pool,
            txn.as_deref_mut(),
            &self.entity.name,
            &sql,
            &binds,
        )
        .await?;

        let pk = self.entity.primary_key();
        if pk.auto_increment {
            if let Some(map) = record.as_object_mut() {
                let unset = map.get(&pk.name).map(Value::is_null).unwrap_or(true);
                if unset {
                    map.insert(pk.name.clone(), Value::from(result.last_insert_rowid()));
                }
            }
        }
        Ok(())
    }

    async fn run_validation_pipeline(
        &self,
        record: &mut Value,
        validate: bool,
        txn: &mut Option<&mut Txn>,
    ) -> OrmResult<()> {
        self.run_record_hooks(HookPoint::BeforeValidate, record, txn).await?;
        if validate {
            let map = record.as_object().ok_or_else(|| {
                OrmError::Validation(vec![ValidationItem::new("record", "must be an object")])
            })?;
            let items = self.entity.validate_record(map);
            if !items.is_empty() {
                self.run_record_hooks(HookPoint::ValidationFailed, record, txn).await?;
                return Err(OrmError::Validation(items));
            }
        }
        self.run_record_hooks(HookPoint::AfterValidate, record, txn).await
    }

    /// Validate only the attributes present in a partial update payload.
    fn validate_partial(&self, values: &Value) -> OrmResult<()> {
        let map = values.as_object().ok_or_else(|| {
            OrmError::Validation(vec![ValidationItem::new("record", "must be an object")])
        })?;
        let mut items = Vec::new();
        for (key, value) in map {
            let Some(attr) = self.entity.attribute(key) else {
                continue;
            };
            if value.is_null() {
                if !attr.nullable {
                    items.push(ValidationItem::new(key, "cannot be null"));
                }
                continue;
            }
            for (vname, validator) in &attr.validators {
                if let Err(msg) = validator(value) {
                    tracing::debug!("validator '{}' rejected {}.{}", vname, self.entity.name, key);
                    items.push(ValidationItem::new(key, msg));
                }
            }
        }
        if items.is_empty() {
            Ok(())
        } else {
            Err(OrmError::Validation(items))
        }
    }

    async fn run_record_hooks(
        &self,
        point: HookPoint,
        record: &mut Value,
        txn: &mut Option<&mut Txn>,
    ) -> OrmResult<()> {
        let mut ctx = HookContext {
            entity: &self.entity.name,
            point,
            record: Some(record),
            records: None,
            db: self.db,
            txn: txn.as_deref_mut(),
        };
        hooks::dispatch(&self.db.hooks, &mut ctx).await
    }

    async fn run_bulk_hooks(
        &self,
        point: HookPoint,
        records: &mut Vec<Value>,
        txn: &mut Option<&mut Txn>,
    ) -> OrmResult<()> {
        let mut ctx = HookContext {
            entity: &self.entity.name,
            point,
            record: None,
            records: Some(records),
            db: self.db,
            txn: txn.as_deref_mut(),
        };
        hooks::dispatch(&self.db.hooks, &mut ctx).await
    }

    async fn run_plain_hooks(
        &self,
        point: HookPoint,
        txn: &mut Option<&mut Txn>,
    ) -> OrmResult<()> {
        let mut ctx = HookContext {
            entity: &self.entity.name,
            point,
            record: None,
            records: None,
            db: self.db,
            txn: txn.as_deref_mut(),
        };
        hooks::dispatch(&self.db.hooks, &mut ctx).await
    }
}

impl std::fmt::Debug for Model<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Model")
            .field("entity", &self.entity.name)
            .field("use_default_scope", &self.use_default_scope)
            .finish()
    }
}
