// Query layer - condition compiler, predicate AST, scopes and the
// eager-load planner

pub mod condition;
pub mod planner;
pub mod predicate;
pub mod scope;

pub use condition::{Cond, Operator};
pub use planner::{
    Include, JoinKind, JoinPlan, LockHint, OrderBy, OrderDir, OrderTarget, PlannedJoin,
};
pub use predicate::{CmpOp, ColumnRef, Predicate};
pub use scope::{QueryFragment, ScopeDef, ScopeRegistry};
