// Executor - renders plans into parameterized SQL and runs them through the
// sqlx pool or an explicit transaction handle

use std::collections::HashMap;

use serde_json::Value;
use sqlx::sqlite::{SqliteArguments, SqliteQueryResult, SqliteRow};
use sqlx::{Column, Row, Sqlite, SqlitePool};

use crate::error::OrmResult;
use crate::query::planner::{JoinPlan, LockHint};
use crate::query::predicate::{ColumnRef, Predicate};
use crate::schema::entity::SemanticType;
use crate::schema::registry::SchemaRegistry;
use crate::txn::Txn;

/// A fetched row keyed by `alias.attribute`.
pub(crate) type RowMap = HashMap<String, Value>;

type SqliteQuery<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

fn bind_value<'q>(q: SqliteQuery<'q>, value: &Value) -> SqliteQuery<'q> {
    match value {
        Value::Null => q.bind(None::<i64>),
        Value::Bool(b) => q.bind(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                q.bind(i)
            } else {
                q.bind(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => q.bind(s.clone()),
        // Arrays and objects persist as JSON text.
        other => q.bind(other.to_string()),
    }
}

pub(crate) async fn fetch_all(
    pool: &SqlitePool,
    txn: Option<&mut Txn>,
    sql: &str,
    binds: &[Value],
) -> OrmResult<Vec<SqliteRow>> {
    tracing::debug!(sql, binds = binds.len(), "fetch");
    let mut query = sqlx::query(sql);
    for value in binds {
        query = bind_value(query, value);
    }
    let rows = match txn {
        Some(txn) => query.fetch_all(&mut *txn.conn()?).await?,
        None => query.fetch_all(pool).await?,
    };
    Ok(rows)
}

/// Run a statement, mapping constraint failures to the entity-specific
/// error variants.
pub(crate) async fn execute(
    pool: &SqlitePool,
    txn: Option<&mut Txn>,
    entity: &str,
    sql: &str,
    binds: &[Value],
) -> OrmResult<SqliteQueryResult> {
    tracing::debug!(sql, binds = binds.len(), "execute");
    let mut query = sqlx::query(sql);
    for value in binds {
        query = bind_value(query, value);
    }
    let result = match txn {
        Some(txn) => query.execute(&mut *txn.conn()?).await,
        None => query.execute(pool).await,
    };
    result.map_err(|e| crate::error::map_db_err(entity, e))
}

/// Build the SELECT for a join plan: aliased projection for every entity in
/// the plan, join clauses in plan order, then filter/order/pagination.
pub(crate) fn build_select(
    reg: &SchemaRegistry,
    plan: &JoinPlan,
    where_: &Predicate,
    order: &[(ColumnRef, &'static str)],
    limit: Option<u64>,
    offset: Option<u64>,
    lock: Option<LockHint>,
    attributes: Option<&[String]>,
) -> OrmResult<(String, Vec<Value>)> {
    let root = reg.entity(&plan.root_entity)?;
    let mut projection: Vec<String> = Vec::new();
    let mut push_cols = |alias: &str, entity: &crate::schema::entity::EntityDef,
                         attrs: Option<&[String]>| {
        let pk = &entity.primary_key().name;
        for attr in &entity.attributes {
            // Projection may be narrowed, but the primary key always rides
            // along for hydration.
            if let Some(wanted) = attrs {
                if attr.name != *pk && !wanted.iter().any(|w| w == &attr.name) {
                    continue;
                }
            }
            projection.push(format!(
                "\"{}\".\"{}\" AS \"{}.{}\"",
                alias, attr.name, alias, attr.name
            ));
        }
    };
    push_cols(&plan.root_alias, root, attributes);
    for join in plan.flat_joins() {
        let entity = reg.entity(&join.entity)?;
        if !join.through {
            push_cols(&join.alias, entity, None);
        } else {
            // Through hops only need their key columns, and those are
            // never hydrated; skip the projection entirely.
        }
    }

    let append_joins = |sql: &mut String, binds: &mut Vec<Value>| {
        for join in plan.flat_joins() {
            sql.push_str(&format!(
                " {} \"{}\" AS \"{}\" ON ",
                join.kind.as_sql(),
                join.table,
                join.alias
            ));
            join.on.render(sql, binds);
        }
    };
    fn push_page(sql: &mut String, limit: Option<u64>, offset: Option<u64>) {
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {}", limit));
        }
        if let Some(offset) = offset {
            if limit.is_none() {
                sql.push_str(" LIMIT -1");
            }
            sql.push_str(&format!(" OFFSET {}", offset));
        }
    }

    let mut sql = format!(
        "SELECT {} FROM \"{}\" AS \"{}\"",
        projection.join(", "),
        root.table,
        plan.root_alias
    );
    let mut binds: Vec<Value> = Vec::new();
    append_joins(&mut sql, &mut binds);

    let order_clause = if order.is_empty() {
        String::new()
    } else {
        let rendered: Vec<String> = order
            .iter()
            .map(|(col, dir)| format!("{} {}", col.render(), dir))
            .collect();
        format!(" ORDER BY {}", rendered.join(", "))
    };

    let fan_out = plan.flat_joins().iter().any(|j| j.many);
    if (limit.is_some() || offset.is_some()) && fan_out {
        // A to-many join fans the root out, so LIMIT/OFFSET on the joined
        // rows would page joined rows instead of root records. Page the
        // root primary keys in a subquery and leave the outer join
        // unlimited. GROUP BY rather than DISTINCT, since SQLite restricts
        // which ORDER BY terms a DISTINCT select may use.
        let pk = ColumnRef::new(&plan.root_alias, &root.primary_key().name);
        sql.push_str(" WHERE ");
        if !where_.is_true() {
            where_.render(&mut sql, &mut binds);
            sql.push_str(" AND ");
        }
        sql.push_str(&format!(
            "{} IN (SELECT {} FROM \"{}\" AS \"{}\"",
            pk.render(),
            pk.render(),
            root.table,
            plan.root_alias
        ));
        append_joins(&mut sql, &mut binds);
        if !where_.is_true() {
            sql.push_str(" WHERE ");
            where_.render(&mut sql, &mut binds);
        }
        sql.push_str(&format!(" GROUP BY {}", pk.render()));
        sql.push_str(&order_clause);
        push_page(&mut sql, limit, offset);
        sql.push(')');
        sql.push_str(&order_clause);
    } else {
        if !where_.is_true() {
            sql.push_str(" WHERE ");
            where_.render(&mut sql, &mut binds);
        }
        sql.push_str(&order_clause);
        push_page(&mut sql, limit, offset);
    }
    if let Some(hint) = lock {
        // SQLite has no row-lock syntax; the hint is forwarded in spirit
        // only. Other dialects would append FOR UPDATE / SKIP LOCKED here.
        tracing::debug!(?hint, "lock hint ignored by sqlite backend");
    }
    Ok((sql, binds))
}

/// Count distinct root rows for a plan; joins can fan the root out, so the
/// count always goes through DISTINCT on the root primary key.
pub(crate) fn build_count(
    reg: &SchemaRegistry,
    plan: &JoinPlan,
    where_: &Predicate,
) -> OrmResult<(String, Vec<Value>)> {
    let root = reg.entity(&plan.root_entity)?;
    let pk = ColumnRef::new(&plan.root_alias, &root.primary_key().name);
    let mut sql = format!(
        "SELECT COUNT(DISTINCT {}) AS \"cnt\" FROM \"{}\" AS \"{}\"",
        pk.render(),
        root.table,
        plan.root_alias
    );
    let mut binds: Vec<Value> = Vec::new();
    for join in plan.flat_joins() {
        sql.push_str(&format!(
            " {} \"{}\" AS \"{}\" ON ",
            join.kind.as_sql(),
            join.table,
            join.alias
        ));
        join.on.render(&mut sql, &mut binds);
    }
    if !where_.is_true() {
        sql.push_str(" WHERE ");
        where_.render(&mut sql, &mut binds);
    }
    Ok((sql, binds))
}

/// Decode a row into `alias.attribute -> Value` using the storage class of
/// each column.
pub(crate) fn row_to_map(row: &SqliteRow) -> RowMap {
    let mut map = RowMap::with_capacity(row.len());
    for (i, column) in row.columns().iter().enumerate() {
        let value = if let Ok(v) = row.try_get::<Option<i64>, _>(i) {
            v.map(Value::from).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<f64>, _>(i) {
            v.map(Value::from).unwrap_or(Value::Null)
        } else if let Ok(v) = row.try_get::<Option<String>, _>(i) {
            v.map(Value::from).unwrap_or(Value::Null)
        } else {
            Value::Null
        };
        map.insert(column.name().to_string(), value);
    }
    map
}

/// Coerce a raw stored value back to its semantic type: booleans from
/// integers, JSON attributes from their text form.
pub(crate) fn coerce(semantic: SemanticType, value: Value) -> Value {
    match (semantic, value) {
        (SemanticType::Boolean, Value::Number(n)) => Value::Bool(n.as_i64().unwrap_or(0) != 0),
        (SemanticType::Json, Value::String(s)) => {
            serde_json::from_str(&s).unwrap_or(Value::String(s))
        }
        (_, v) => v,
    }
}

/// Serialize a record value for binding, applying the semantic mapping in
/// the write direction.
pub(crate) fn to_storage(semantic: SemanticType, value: &Value) -> Value {
    match (semantic, value) {
        (SemanticType::Boolean, Value::Bool(b)) => Value::from(*b as i64),
        (SemanticType::Json, v) if !v.is_string() => Value::String(v.to_string()),
        (_, v) => v.clone(),
    }
}
