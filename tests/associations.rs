use entwine::{
    AssociationDef, AttributeDef, Cond, Config, CreateOptions, Db, EntityDef, FindOptions,
    Include, OrderBy, OrderDir, OrmError, SchemaRegistry, SemanticType,
};
use serde_json::json;

fn config() -> Config {
    let mut config = Config::default();
    config.database.max_connections = 1;
    config
}

async fn setup() -> Db {
    let mut reg = SchemaRegistry::new();
    reg.define(
        EntityDef::new("user").attr(AttributeDef::new("username", SemanticType::Text).not_null()),
    )
    .unwrap();
    reg.define(
        EntityDef::new("task")
            .attr(AttributeDef::new("title", SemanticType::Text).not_null())
            .attr(AttributeDef::new("done", SemanticType::Boolean)),
    )
    .unwrap();
    reg.define(
        EntityDef::new("project").attr(AttributeDef::new("title", SemanticType::Text).not_null()),
    )
    .unwrap();
    reg.define(EntityDef::new("membership")).unwrap();
    reg.associate(AssociationDef::has_many("user", "task")).unwrap();
    reg.associate(AssociationDef::belongs_to("task", "user")).unwrap();
    reg.associate(AssociationDef::belongs_to_many("user", "project", "membership"))
        .unwrap();

    let db = Db::connect(config(), reg).await.unwrap();
    db.sync().await.unwrap();

    let users = db.model("user").unwrap();
    let alice = users
        .create(json!({"username": "alice"}), CreateOptions::default())
        .await
        .unwrap();
    let bob = users
        .create(json!({"username": "bob"}), CreateOptions::default())
        .await
        .unwrap();

    let tasks = db.model("task").unwrap();
    for (title, done, owner) in [
        ("write", false, &alice),
        ("ship", true, &alice),
    ] {
        tasks
            .create(
                json!({"title": title, "done": done, "user_id": owner["id"]}),
                CreateOptions::default(),
            )
            .await
            .unwrap();
    }

    let projects = db.model("project").unwrap();
    let p1 = projects
        .create(json!({"title": "engine"}), CreateOptions::default())
        .await
        .unwrap();
    let p2 = projects
        .create(json!({"title": "docs"}), CreateOptions::default())
        .await
        .unwrap();
    let memberships = db.model("membership").unwrap();
    for (user, project) in [(&alice, &p1), (&alice, &p2), (&bob, &p1)] {
        memberships
            .create(
                json!({"user_id": user["id"], "project_id": project["id"]}),
                CreateOptions::default(),
            )
            .await
            .unwrap();
    }
    db
}

#[tokio::test]
async fn has_many_hydrates_as_array() {
    let db = setup().await;
    let found = db
        .model("user")
        .unwrap()
        .find_all(FindOptions {
            include: vec![Include::new("task")],
            order: vec![OrderBy::attr("id", OrderDir::Asc)],
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(found.len(), 2);
    assert_eq!(found[0]["username"], json!("alice"));
    assert_eq!(found[0]["task"].as_array().unwrap().len(), 2);
    // Left join keeps bob even without tasks.
    assert_eq!(found[1]["username"], json!("bob"));
    assert_eq!(found[1]["task"], json!([]));
}

#[tokio::test]
async fn limit_counts_root_records_not_joined_rows() {
    let db = setup().await;
    let found = db
        .model("user")
        .unwrap()
        .find_all(FindOptions {
            include: vec![Include::new("task")],
            order: vec![OrderBy::attr("id", OrderDir::Asc)],
            limit: Some(2),
            ..Default::default()
        })
        .await
        .unwrap();
    // Alice fans out to two joined rows; the limit still admits both users,
    // and her task array stays complete.
    assert_eq!(found.len(), 2);
    assert_eq!(found[0]["task"].as_array().unwrap().len(), 2);

    let first = db
        .model("user")
        .unwrap()
        .find_one(FindOptions {
            include: vec![Include::new("task")],
            order: vec![OrderBy::attr("id", OrderDir::Asc)],
            ..Default::default()
        })
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first["task"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn filtered_include_upgrades_to_inner_join() {
    let db = setup().await;
    let found = db
        .model("user")
        .unwrap()
        .find_all(FindOptions {
            include: vec![Include::new("task").filter(Cond::eq("done", json!(true)))],
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0]["username"], json!("alice"));
    let tasks = found[0]["task"].as_array().unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0]["title"], json!("ship"));
}

#[tokio::test]
async fn explicit_required_false_keeps_unmatched_roots() {
    let db = setup().await;
    let found = db
        .model("user")
        .unwrap()
        .find_all(FindOptions {
            include: vec![Include::new("task")
                .filter(Cond::eq("done", json!(true)))
                .required(false)],
            order: vec![OrderBy::attr("id", OrderDir::Asc)],
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(found.len(), 2);
    assert_eq!(found[1]["task"], json!([]));
}

#[tokio::test]
async fn belongs_to_hydrates_as_object() {
    let db = setup().await;
    let found = db
        .model("task")
        .unwrap()
        .find_all(FindOptions {
            where_: Some(Cond::eq("title", json!("write"))),
            include: vec![Include::new("user")],
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(found[0]["user"]["username"], json!("alice"));
}

#[tokio::test]
async fn nested_include_composes() {
    let db = setup().await;
    let found = db
        .model("task")
        .unwrap()
        .find_all(FindOptions {
            include: vec![Include::new("user").nested(Include::new("task"))],
            order: vec![OrderBy::attr("id", OrderDir::Asc)],
            ..Default::default()
        })
        .await
        .unwrap();
    // Every task carries its owner, who in turn carries all their tasks.
    assert_eq!(found.len(), 2);
    assert_eq!(found[0]["user"]["task"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn order_by_included_association() {
    let db = setup().await;
    let found = db
        .model("task")
        .unwrap()
        .find_all(FindOptions {
            include: vec![Include::new("user")],
            order: vec![OrderBy::attr("title", OrderDir::Asc)],
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(found[0]["title"], json!("ship"));

    let by_owner = db
        .model("task")
        .unwrap()
        .find_all(FindOptions {
            include: vec![Include::new("user")],
            order: vec![OrderBy::association(
                vec!["user".to_string()],
                "username",
                OrderDir::Asc,
            )],
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(by_owner.len(), 2);
}

#[tokio::test]
async fn ordering_by_association_requires_the_include() {
    let db = setup().await;
    let err = db
        .model("task")
        .unwrap()
        .find_all(FindOptions {
            order: vec![OrderBy::association(
                vec!["user".to_string()],
                "username",
                OrderDir::Asc,
            )],
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, OrmError::AssociationNotFound(_)));
}

#[tokio::test]
async fn unknown_include_fails() {
    let db = setup().await;
    let err = db
        .model("user")
        .unwrap()
        .find_all(FindOptions {
            include: vec![Include::new("comments")],
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, OrmError::AssociationNotFound(_)));
}

#[tokio::test]
async fn belongs_to_many_loads_through_the_join_table() {
    let db = setup().await;
    let found = db
        .model("user")
        .unwrap()
        .find_all(FindOptions {
            include: vec![Include::new("project")],
            order: vec![OrderBy::attr("id", OrderDir::Asc)],
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(found.len(), 2);
    assert_eq!(found[0]["project"].as_array().unwrap().len(), 2);
    let bob_projects = found[1]["project"].as_array().unwrap();
    assert_eq!(bob_projects.len(), 1);
    assert_eq!(bob_projects[0]["title"], json!("engine"));
}

#[tokio::test]
async fn self_reference_needs_constraints_disabled() {
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
    let db = Db::connect(config(), reg).await.unwrap();
    db.sync().await.unwrap();

    let docs = db.model("document").unwrap();
    let v1 = docs
        .create(json!({"body": "draft"}), CreateOptions::default())
        .await
        .unwrap();
    let v2 = docs
        .create(
            json!({"body": "final", "current_id": v1["id"]}),
            CreateOptions::default(),
        )
        .await
        .unwrap();

    let found = docs
        .find_all(FindOptions {
            where_: Some(Cond::eq("id", v2["id"].clone())),
            include: vec![Include::new("current")],
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(found[0]["current"]["body"], json!("draft"));
}
