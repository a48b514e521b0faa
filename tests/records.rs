use std::sync::Arc;

use async_trait::async_trait;
use entwine::{
    AttributeDef, BulkCreateOptions, Cond, Config, CreateOptions, Db, DestroyOptions, EntityDef,
    FindOptions, Hook, HookContext, HookPoint, OrmError, OrmResult, SaveOptions, SchemaRegistry,
    SemanticType, UpdateOptions,
};
use entwine::schema::validators;
use serde_json::{json, Value};

fn config() -> Config {
    let mut config = Config::default();
    config.database.max_connections = 1;
    config
}

fn registry() -> SchemaRegistry {
    let mut reg = SchemaRegistry::new();
    reg.define(
        EntityDef::new("user")
            .attr(
                AttributeDef::new("username", SemanticType::Text)
                    .not_null()
                    .unique()
                    .validate("length", validators::length(3, 30)),
            )
            .attr(
                AttributeDef::new("email", SemanticType::Text)
                    .validate("email", validators::is_email()),
            )
            .attr(AttributeDef::new("age", SemanticType::Integer))
            .attr(
                AttributeDef::new("handle", SemanticType::Text)
                    .set(|v| Value::String(v.as_str().unwrap_or_default().to_lowercase())),
            )
            .attr(AttributeDef::new("origin", SemanticType::Text))
            .timestamps(),
    )
    .unwrap();
    reg.define(
        EntityDef::new("document")
            .attr(AttributeDef::new("body", SemanticType::Text))
            .versioned(),
    )
    .unwrap();
    reg
}

async fn setup() -> Db {
    let db = Db::connect(config(), registry()).await.unwrap();
    db.sync().await.unwrap();
    db
}

#[tokio::test]
async fn create_assigns_pk_and_timestamps() {
    let db = setup().await;
    let created = db
        .model("user")
        .unwrap()
        .create(
            json!({"username": "alice", "email": "alice@example.com"}),
            CreateOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(created["id"], json!(1));
    assert!(created["created_at"].is_string());
    assert!(created["updated_at"].is_string());

    let stored = db
        .model("user")
        .unwrap()
        .find_by_pk(json!(1), None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored["username"], json!("alice"));
    assert!(stored["created_at"].is_string());
}

#[tokio::test]
async fn validation_reports_every_failing_attribute() {
    let db = setup().await;
    let err = db
        .model("user")
        .unwrap()
        .create(
            json!({"username": "ab", "email": "not-an-email"}),
            CreateOptions::default(),
        )
        .await
        .unwrap_err();
    match err {
        OrmError::Validation(items) => {
            let attrs: Vec<_> = items.iter().map(|i| i.attribute.as_str()).collect();
            assert_eq!(attrs, vec!["username", "email"]);
        }
        other => panic!("expected validation error, got {:?}", other),
    }
}

#[tokio::test]
async fn validation_can_be_skipped() {
    let db = setup().await;
    let created = db
        .model("user")
        .unwrap()
        .create(
            json!({"username": "ab"}),
            CreateOptions {
                validate: false,
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(created["username"], json!("ab"));
}

#[tokio::test]
async fn unique_violation_names_the_attribute() {
    let db = setup().await;
    let users = db.model("user").unwrap();
    users
        .create(json!({"username": "alice"}), CreateOptions::default())
        .await
        .unwrap();
    let err = users
        .create(json!({"username": "alice"}), CreateOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrmError::UniqueConstraint { entity, attribute }
            if entity == "user" && attribute == "username"
    ));
}

#[tokio::test]
async fn setter_transforms_before_persisting() {
    let db = setup().await;
    let created = db
        .model("user")
        .unwrap()
        .create(
            json!({"username": "alice", "handle": "AliCE"}),
            CreateOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(created["handle"], json!("alice"));
    let stored = db
        .model("user")
        .unwrap()
        .find_by_pk(created["id"].clone(), None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored["handle"], json!("alice"));
}

struct OriginHook;

#[async_trait]
impl Hook for OriginHook {
    async fn run(&self, ctx: &mut HookContext<'_>) -> OrmResult<()> {
        if let Some(record) = ctx.record.as_deref_mut() {
            if let Some(map) = record.as_object_mut() {
                map.insert("origin".to_string(), json!("hooked"));
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "origin_hook"
    }

    fn points(&self) -> Vec<HookPoint> {
        vec![HookPoint::BeforeCreate]
    }
}

#[tokio::test]
async fn hook_mutations_reach_the_stored_row() {
    let mut db = Db::connect(config(), registry()).await.unwrap();
    db.hooks_mut().register("user", Arc::new(OriginHook));
    db.sync().await.unwrap();

    let created = db
        .model("user")
        .unwrap()
        .create(json!({"username": "alice"}), CreateOptions::default())
        .await
        .unwrap();
    assert_eq!(created["origin"], json!("hooked"));
    let stored = db
        .model("user")
        .unwrap()
        .find_by_pk(created["id"].clone(), None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored["origin"], json!("hooked"));
}

struct RejectHook;

#[async_trait]
impl Hook for RejectHook {
    async fn run(&self, _ctx: &mut HookContext<'_>) -> OrmResult<()> {
        Err(OrmError::Database("blocked by policy".to_string()))
    }

    fn name(&self) -> &str {
        "reject_hook"
    }

    fn points(&self) -> Vec<HookPoint> {
        vec![HookPoint::BeforeCreate]
    }
}

#[tokio::test]
async fn failing_hook_aborts_the_operation() {
    let mut db = Db::connect(config(), registry()).await.unwrap();
    db.hooks_mut().register("user", Arc::new(RejectHook));
    db.sync().await.unwrap();

    let users = db.model("user").unwrap();
    assert!(users
        .create(json!({"username": "alice"}), CreateOptions::default())
        .await
        .is_err());
    assert_eq!(users.count(FindOptions::default()).await.unwrap(), 0);
}

#[tokio::test]
async fn bulk_create_non_atomic_applies_valid_rows() {
    let db = setup().await;
    let outcome = db
        .model("user")
        .unwrap()
        .bulk_create(
            vec![
                json!({"username": "alice"}),
                json!({"username": "xy"}),
                json!({"username": "carol"}),
            ],
            BulkCreateOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(outcome.created.len(), 2);
    assert_eq!(outcome.failures.len(), 1);
    assert_eq!(outcome.failures[0].index, 1);
    assert!(matches!(outcome.failures[0].error, OrmError::Validation(_)));
    let n = db
        .model("user")
        .unwrap()
        .count(FindOptions::default())
        .await
        .unwrap();
    assert_eq!(n, 2);
}

#[tokio::test]
async fn bulk_create_atomic_validates_everything_up_front() {
    let db = setup().await;
    let err = db
        .model("user")
        .unwrap()
        .bulk_create(
            vec![json!({"username": "alice"}), json!({"username": "xy"})],
            BulkCreateOptions {
                atomic: true,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    match err {
        OrmError::Validation(items) => assert_eq!(items[0].attribute, "[1].username"),
        other => panic!("expected validation error, got {:?}", other),
    }
    let n = db
        .model("user")
        .unwrap()
        .count(FindOptions::default())
        .await
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn bulk_create_atomic_rolls_back_on_constraint_failure() {
    let db = setup().await;
    let err = db
        .model("user")
        .unwrap()
        .bulk_create(
            vec![json!({"username": "alice"}), json!({"username": "alice"})],
            BulkCreateOptions {
                atomic: true,
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, OrmError::UniqueConstraint { .. }));
    // The first row does not survive the failed batch.
    let n = db
        .model("user")
        .unwrap()
        .count(FindOptions::default())
        .await
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test]
async fn bulk_update_and_destroy_report_affected_rows() {
    let db = setup().await;
    let users = db.model("user").unwrap();
    for name in ["alice", "bob", "carol"] {
        users
            .create(json!({"username": name, "age": 20}), CreateOptions::default())
            .await
            .unwrap();
    }

    let updated = users
        .update(
            json!({"age": 30}),
            UpdateOptions {
                where_: Some(Cond::parse(&json!({"username": {"in": ["alice", "bob"]}})).unwrap()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated, 2);

    let destroyed = users
        .destroy(DestroyOptions {
            where_: Some(Cond::eq("age", json!(30))),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(destroyed, 2);
    assert_eq!(users.count(FindOptions::default()).await.unwrap(), 1);
}

struct ClampAgeHook;

#[async_trait]
impl Hook for ClampAgeHook {
    async fn run(&self, ctx: &mut HookContext<'_>) -> OrmResult<()> {
        if let Some(batch) = ctx.records.as_deref_mut() {
            for values in batch.iter_mut() {
                if let Some(map) = values.as_object_mut() {
                    map.insert("age".to_string(), json!(21));
                }
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "clamp_age_hook"
    }

    fn points(&self) -> Vec<HookPoint> {
        vec![HookPoint::BeforeBulkUpdate]
    }
}

#[tokio::test]
async fn bulk_update_hooks_receive_the_batch_payload() {
    let mut db = Db::connect(config(), registry()).await.unwrap();
    db.hooks_mut().register("user", Arc::new(ClampAgeHook));
    db.sync().await.unwrap();

    let users = db.model("user").unwrap();
    users
        .create(json!({"username": "alice", "age": 30}), CreateOptions::default())
        .await
        .unwrap();

    let affected = users
        .update(
            json!({"age": 99}),
            UpdateOptions {
                where_: Some(Cond::eq("username", json!("alice"))),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(affected, 1);
    let stored = users.find_by_pk(json!(1), None).await.unwrap().unwrap();
    assert_eq!(stored["age"], json!(21));
}

#[tokio::test]
async fn save_inserts_then_updates_in_place() {
    let db = setup().await;
    let users = db.model("user").unwrap();
    let mut record = users.build(json!({"username": "alice"})).unwrap();
    users.save(&mut record, SaveOptions::default()).await.unwrap();
    let pk = record["id"].clone();
    assert!(pk.is_number());

    record["email"] = json!("alice@example.com");
    users.save(&mut record, SaveOptions::default()).await.unwrap();
    let stored = users.find_by_pk(pk, None).await.unwrap().unwrap();
    assert_eq!(stored["email"], json!("alice@example.com"));
    assert_eq!(users.count(FindOptions::default()).await.unwrap(), 1);
}

#[tokio::test]
async fn destroy_one_removes_exactly_that_record() {
    let db = setup().await;
    let users = db.model("user").unwrap();
    let mut alice = users
        .create(json!({"username": "alice"}), CreateOptions::default())
        .await
        .unwrap();
    users
        .create(json!({"username": "bob"}), CreateOptions::default())
        .await
        .unwrap();

    let removed = users.destroy_one(&mut alice, None).await.unwrap();
    assert_eq!(removed, 1);
    let remaining = users.find_all(FindOptions::default()).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0]["username"], json!("bob"));

    // A record that was never persisted is a no-op.
    let mut draft = users.build(json!({"username": "carol"})).unwrap();
    assert_eq!(users.destroy_one(&mut draft, None).await.unwrap(), 0);
}

#[tokio::test]
async fn file_backed_database_persists_across_connections() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.database.url = format!("sqlite://{}/records.db", dir.path().display());

    let db = Db::connect(config.clone(), registry()).await.unwrap();
    db.sync().await.unwrap();
    db.model("user")
        .unwrap()
        .create(json!({"username": "alice"}), CreateOptions::default())
        .await
        .unwrap();
    drop(db);

    let db = Db::connect(config, registry()).await.unwrap();
    let n = db
        .model("user")
        .unwrap()
        .count(FindOptions::default())
        .await
        .unwrap();
    assert_eq!(n, 1);
}

#[tokio::test]
async fn stale_version_fails_with_optimistic_lock() {
    let db = setup().await;
    let docs = db.model("document").unwrap();
    let fresh = docs
        .create(json!({"body": "draft"}), CreateOptions::default())
        .await
        .unwrap();
    assert_eq!(fresh["version"], json!(0));

    let mut first = fresh.clone();
    first["body"] = json!("revised");
    docs.save(&mut first, SaveOptions::default()).await.unwrap();
    assert_eq!(first["version"], json!(1));

    let mut stale = fresh;
    stale["body"] = json!("conflicting");
    let err = docs.save(&mut stale, SaveOptions::default()).await.unwrap_err();
    assert!(matches!(
        err,
        OrmError::OptimisticLock { entity, .. } if entity == "document"
    ));
}
