// Hook pipeline - ordered lifecycle callbacks around CRUD operations

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::OnceCell;
use serde_json::Value;

use crate::error::OrmResult;
use crate::model::Db;
use crate::txn::Txn;

/// Lifecycle points, in dispatch order around each operation. Bulk paths
/// fire the bulk points around the whole batch in addition to the
/// per-record points.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    BeforeValidate,
    AfterValidate,
    ValidationFailed,
    BeforeCreate,
    AfterCreate,
    BeforeUpdate,
    AfterUpdate,
    BeforeSave,
    AfterSave,
    BeforeDestroy,
    AfterDestroy,
    BeforeBulkCreate,
    AfterBulkCreate,
    BeforeBulkUpdate,
    AfterBulkUpdate,
    BeforeBulkDestroy,
    AfterBulkDestroy,
}

/// Mutation context handed to every hook. The record is passed by reference;
/// hook mutations flow into the statement. The transaction handle is the one
/// the triggering operation runs under, so hook-initiated operations can
/// join it and stay atomic.
pub struct HookContext<'a> {
    pub entity: &'a str,
    pub point: HookPoint,
    pub record: Option<&'a mut Value>,
    pub records: Option<&'a mut Vec<Value>>,
    pub db: &'a Db,
    pub txn: Option<&'a mut Txn>,
}

#[async_trait]
pub trait Hook: Send + Sync {
    async fn run(&self, ctx: &mut HookContext<'_>) -> OrmResult<()>;

    fn name(&self) -> &str;

    fn points(&self) -> Vec<HookPoint>;
}

/// Ordered per-entity hook lists. A process-wide registry can be installed
/// once via `init_global_hooks`; global hooks run before local ones.
#[derive(Default)]
pub struct HookRegistry {
    hooks: HashMap<String, Vec<Arc<dyn Hook>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, entity: impl Into<String>, hook: Arc<dyn Hook>) {
        self.hooks.entry(entity.into()).or_default().push(hook);
    }

    pub async fn run(&self, ctx: &mut HookContext<'_>) -> OrmResult<()> {
        if let Some(hooks) = self.hooks.get(ctx.entity) {
            for hook in hooks {
                if hook.points().contains(&ctx.point) {
                    hook.run(ctx).await.map_err(|e| {
                        tracing::warn!("hook '{}' failed at {:?}: {}", hook.name(), ctx.point, e);
                        e
                    })?;
                }
            }
        }
        Ok(())
    }
}

static GLOBAL_HOOKS: OnceCell<HookRegistry> = OnceCell::new();

/// Install the process-wide hook registry. Fails when already installed.
pub fn init_global_hooks(registry: HookRegistry) -> Result<(), HookRegistry> {
    GLOBAL_HOOKS.set(registry)
}

/// Run global hooks, then the local registry. A failure anywhere aborts the
/// remaining pipeline and fails the triggering operation.
pub(crate) async fn dispatch(local: &HookRegistry, ctx: &mut HookContext<'_>) -> OrmResult<()> {
    if let Some(global) = GLOBAL_HOOKS.get() {
        global.run(ctx).await?;
    }
    local.run(ctx).await
}

/// Maintains `created_at` / `updated_at` on entities declared with
/// timestamps.
pub struct TimestampHook;

#[async_trait]
impl Hook for TimestampHook {
    async fn run(&self, ctx: &mut HookContext<'_>) -> OrmResult<()> {
        let now = Value::String(chrono::Utc::now().to_rfc3339());
        if let Some(record) = ctx.record.as_deref_mut() {
            if let Some(map) = record.as_object_mut() {
                match ctx.point {
                    HookPoint::BeforeCreate => {
                        map.insert("created_at".to_string(), now.clone());
                        map.insert("updated_at".to_string(), now);
                    }
                    HookPoint::BeforeUpdate => {
                        map.insert("updated_at".to_string(), now);
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "timestamp_hook"
    }

    fn points(&self) -> Vec<HookPoint> {
        vec![HookPoint::BeforeCreate, HookPoint::BeforeUpdate]
    }
}
