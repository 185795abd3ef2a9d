//! Per-entity authorization.
//!
//! A [`Policy`] is an ordered chain of rules. Each rule returns a [`Decision`];
//! the first non-`Skip` decision wins and a chain that only skips falls
//! through to the policy's fallback. Query rules may narrow the plan by
//! injecting predicates; mutation rules may narrow updates or stamp creates.
//!
//! Every entity registered with the engine must have a policy. A missing
//! policy is a configuration error, never an implicit allow.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use entgraph_types::{Predicate, Value};

use crate::context::RequestContext;
use crate::error::{EntError, Result};
use crate::hook::{Mutation, Op};
use crate::query::QueryPlan;

/// Outcome of one rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    /// No opinion; continue with the next rule.
    Skip,
    Deny(String),
    /// Deny, but report the target as not found.
    DenyAsNotFound(String),
}

impl Decision {
    pub fn deny(reason: impl Into<String>) -> Self {
        Decision::Deny(reason.into())
    }
}

#[async_trait]
pub trait QueryRule: Send + Sync {
    async fn eval_query(&self, ctx: &RequestContext, plan: &mut QueryPlan) -> Result<Decision>;
}

#[async_trait]
pub trait MutationRule: Send + Sync {
    async fn eval_mutation(&self, ctx: &RequestContext, mutation: &mut Mutation) -> Result<Decision>;
}

// ============================================================================
// POLICY
// ============================================================================

#[derive(Clone)]
pub struct Policy {
    entity: String,
    query: Vec<Arc<dyn QueryRule>>,
    mutation: Vec<Arc<dyn MutationRule>>,
    fallback: Decision,
}

impl fmt::Debug for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Policy")
            .field("entity", &self.entity)
            .field("query_rules", &self.query.len())
            .field("mutation_rules", &self.mutation.len())
            .field("fallback", &self.fallback)
            .finish()
    }
}

impl Policy {
    /// Empty chain with an `Allow` fallback.
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            query: Vec::new(),
            mutation: Vec::new(),
            fallback: Decision::Allow,
        }
    }

    pub fn allow_all(entity: impl Into<String>) -> Self {
        Self::new(entity)
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn query_rule(mut self, rule: impl QueryRule + 'static) -> Self {
        self.query.push(Arc::new(rule));
        self
    }

    pub fn mutation_rule(mut self, rule: impl MutationRule + 'static) -> Self {
        self.mutation.push(Arc::new(rule));
        self
    }

    /// Add a rule to both chains.
    pub fn rule<R>(mut self, rule: R) -> Self
    where
        R: QueryRule + MutationRule + 'static,
    {
        let rule = Arc::new(rule);
        self.query.push(rule.clone());
        self.mutation.push(rule);
        self
    }

    /// Decision used when every rule skips.
    pub fn fallback(mut self, decision: Decision) -> Self {
        self.fallback = decision;
        self
    }

    fn conclude(&self, decision: Decision, op: &str) -> Result<()> {
        match decision {
            Decision::Allow | Decision::Skip => Ok(()),
            Decision::Deny(reason) => {
                tracing::debug!(entity = %self.entity, op, %reason, "policy denied");
                Err(EntError::denied(&self.entity, op, reason))
            }
            Decision::DenyAsNotFound(reason) => {
                tracing::debug!(entity = %self.entity, op, %reason, "policy denied (masked as not found)");
                Err(EntError::NotFound {
                    entity: self.entity.clone(),
                })
            }
        }
    }

    pub async fn eval_query(&self, ctx: &RequestContext, plan: &mut QueryPlan) -> Result<()> {
        if let Some(d) = ctx.decision() {
            if *d != Decision::Skip {
                return self.conclude(d.clone(), "query");
            }
        }
        for rule in &self.query {
            match rule.eval_query(ctx, plan).await? {
                Decision::Skip => continue,
                d => return self.conclude(d, "query"),
            }
        }
        self.conclude(self.fallback.clone(), "query")
    }

    pub async fn eval_mutation(&self, ctx: &RequestContext, mutation: &mut Mutation) -> Result<()> {
        let op = mutation.op.to_string();
        if let Some(d) = ctx.decision() {
            if *d != Decision::Skip {
                return self.conclude(d.clone(), &op);
            }
        }
        for rule in &self.mutation {
            match rule.eval_mutation(ctx, mutation).await? {
                Decision::Skip => continue,
                d => return self.conclude(d, &op),
            }
        }
        self.conclude(self.fallback.clone(), &op)
    }
}

/// Policies keyed by entity name, populated at startup.
#[derive(Debug, Clone, Default)]
pub struct PolicyRegistry {
    policies: HashMap<String, Arc<Policy>>,
}

impl PolicyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, policy: Policy) -> Result<()> {
        if self.policies.contains_key(policy.entity()) {
            return Err(EntError::config(format!(
                "policy for '{}' registered twice",
                policy.entity()
            )));
        }
        self.policies
            .insert(policy.entity().to_string(), Arc::new(policy));
        Ok(())
    }

    pub fn get(&self, entity: &str) -> Result<&Arc<Policy>> {
        self.policies
            .get(entity)
            .ok_or_else(|| EntError::config(format!("no policy registered for entity '{}'", entity)))
    }

    pub fn contains(&self, entity: &str) -> bool {
        self.policies.contains_key(entity)
    }

    pub fn entities(&self) -> impl Iterator<Item = &str> {
        self.policies.keys().map(String::as_str)
    }
}

// ============================================================================
// BUILT-IN RULES
// ============================================================================

/// Allows everything.
pub struct AllowAll;

#[async_trait]
impl QueryRule for AllowAll {
    async fn eval_query(&self, _ctx: &RequestContext, _plan: &mut QueryPlan) -> Result<Decision> {
        Ok(Decision::Allow)
    }
}

#[async_trait]
impl MutationRule for AllowAll {
    async fn eval_mutation(&self, _ctx: &RequestContext, _m: &mut Mutation) -> Result<Decision> {
        Ok(Decision::Allow)
    }
}

/// Denies everything.
pub struct DenyAll;

#[async_trait]
impl QueryRule for DenyAll {
    async fn eval_query(&self, _ctx: &RequestContext, _plan: &mut QueryPlan) -> Result<Decision> {
        Ok(Decision::deny("denied by policy"))
    }
}

#[async_trait]
impl MutationRule for DenyAll {
    async fn eval_mutation(&self, _ctx: &RequestContext, _m: &mut Mutation) -> Result<Decision> {
        Ok(Decision::deny("denied by policy"))
    }
}

/// Denies callers without an authenticated principal, otherwise skips.
pub struct RequirePrincipal;

#[async_trait]
impl QueryRule for RequirePrincipal {
    async fn eval_query(&self, ctx: &RequestContext, _plan: &mut QueryPlan) -> Result<Decision> {
        Ok(require_principal(ctx))
    }
}

#[async_trait]
impl MutationRule for RequirePrincipal {
    async fn eval_mutation(&self, ctx: &RequestContext, _m: &mut Mutation) -> Result<Decision> {
        Ok(require_principal(ctx))
    }
}

fn require_principal(ctx: &RequestContext) -> Decision {
    match ctx.principal() {
        Some(_) => Decision::Skip,
        None => Decision::deny("no principal in context"),
    }
}

/// Denies callers lacking `role`, otherwise skips.
pub struct RequireRole(pub String);

impl RequireRole {
    pub fn new(role: impl Into<String>) -> Self {
        Self(role.into())
    }

    fn decide(&self, ctx: &RequestContext) -> Decision {
        if ctx.has_role(&self.0) {
            Decision::Skip
        } else {
            Decision::deny(format!("role '{}' required", self.0))
        }
    }
}

#[async_trait]
impl QueryRule for RequireRole {
    async fn eval_query(&self, ctx: &RequestContext, _plan: &mut QueryPlan) -> Result<Decision> {
        Ok(self.decide(ctx))
    }
}

#[async_trait]
impl MutationRule for RequireRole {
    async fn eval_mutation(&self, ctx: &RequestContext, _m: &mut Mutation) -> Result<Decision> {
        Ok(self.decide(ctx))
    }
}

/// Confines reads and writes to rows whose `column` equals the request tenant.
///
/// Queries get an injected equality filter. Creates are stamped with the
/// tenant (or denied if they name another one); updates and deletes get the
/// same filter as queries.
pub struct TenantScope {
    column: String,
}

impl TenantScope {
    pub fn new(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
        }
    }
}

#[async_trait]
impl QueryRule for TenantScope {
    async fn eval_query(&self, ctx: &RequestContext, plan: &mut QueryPlan) -> Result<Decision> {
        let Some(tenant) = ctx.tenant() else {
            return Ok(Decision::deny("tenant-scoped entity requires a tenant"));
        };
        plan.filter(Predicate::eq(self.column.clone(), tenant));
        Ok(Decision::Skip)
    }
}

#[async_trait]
impl MutationRule for TenantScope {
    async fn eval_mutation(&self, ctx: &RequestContext, m: &mut Mutation) -> Result<Decision> {
        let Some(tenant) = ctx.tenant() else {
            return Ok(Decision::deny("tenant-scoped entity requires a tenant"));
        };
        if m.op == Op::Create {
            for row in &mut m.creates {
                match row.get(&self.column) {
                    None | Some(Value::Null) => {
                        row.insert(self.column.clone(), Value::from(tenant));
                    }
                    Some(v) if v.as_str() == Some(tenant) => {}
                    Some(v) => {
                        return Ok(Decision::deny(format!(
                            "{} {} belongs to another tenant",
                            self.column, v
                        )))
                    }
                }
            }
        } else {
            m.predicates
                .push(Predicate::eq(self.column.clone(), tenant));
        }
        Ok(Decision::Skip)
    }
}

// ── Closure-backed rules ──

pub struct QueryRuleFn<F>(F);

pub struct MutationRuleFn<F>(F);

/// Query rule from a closure.
pub fn query_rule<F>(f: F) -> QueryRuleFn<F>
where
    F: Fn(&RequestContext, &mut QueryPlan) -> Result<Decision> + Send + Sync + 'static,
{
    QueryRuleFn(f)
}

/// Mutation rule from a closure.
pub fn mutation_rule<F>(f: F) -> MutationRuleFn<F>
where
    F: Fn(&RequestContext, &mut Mutation) -> Result<Decision> + Send + Sync + 'static,
{
    MutationRuleFn(f)
}

#[async_trait]
impl<F> QueryRule for QueryRuleFn<F>
where
    F: Fn(&RequestContext, &mut QueryPlan) -> Result<Decision> + Send + Sync + 'static,
{
    async fn eval_query(&self, ctx: &RequestContext, plan: &mut QueryPlan) -> Result<Decision> {
        (self.0)(ctx, plan)
    }
}

#[async_trait]
impl<F> MutationRule for MutationRuleFn<F>
where
    F: Fn(&RequestContext, &mut Mutation) -> Result<Decision> + Send + Sync + 'static,
{
    async fn eval_mutation(&self, ctx: &RequestContext, m: &mut Mutation) -> Result<Decision> {
        (self.0)(ctx, m)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Principal;
    use crate::query::QueryOp;
    use entgraph_types::Row;

    fn plan() -> QueryPlan {
        QueryPlan::new("note", QueryOp::All)
    }

    #[tokio::test]
    async fn first_non_skip_decision_wins() {
        let policy = Policy::new("note")
            .query_rule(RequirePrincipal)
            .query_rule(DenyAll)
            .query_rule(AllowAll);
        let ctx = RequestContext::for_principal(Principal::new("u1"));
        let err = policy.eval_query(&ctx, &mut plan()).await.unwrap_err();
        assert!(err.is_permission_denied());

        let err = policy
            .eval_query(&RequestContext::new(), &mut plan())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no principal"));
    }

    #[tokio::test]
    async fn all_skip_uses_fallback() {
        let policy = Policy::new("note")
            .rule(RequireRole::new("admin"))
            .fallback(Decision::DenyAsNotFound("hidden".into()));
        let ctx = RequestContext::for_principal(Principal::new("u1").with_role("admin"));
        let err = policy.eval_query(&ctx, &mut plan()).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn context_decision_bypasses_rules() {
        let policy = Policy::new("note").rule(DenyAll);
        let ctx = RequestContext::new().with_decision(Decision::Allow);
        assert!(policy.eval_query(&ctx, &mut plan()).await.is_ok());
    }

    #[tokio::test]
    async fn tenant_scope_filters_queries_and_stamps_creates() {
        let policy = Policy::new("note").rule(TenantScope::new("owner_id"));
        let ctx = RequestContext::new().with_tenant("t1");

        let mut p = plan();
        policy.eval_query(&ctx, &mut p).await.unwrap();
        assert_eq!(p.predicates, vec![Predicate::eq("owner_id", "t1")]);

        let mut m = Mutation::new("note", Op::Create);
        m.creates.push(Row::new());
        policy.eval_mutation(&ctx, &mut m).await.unwrap();
        assert_eq!(m.creates[0]["owner_id"], Value::from("t1"));

        let mut foreign = Mutation::new("note", Op::Create);
        let mut row = Row::new();
        row.insert("owner_id".into(), Value::from("t2"));
        foreign.creates.push(row);
        let err = policy.eval_mutation(&ctx, &mut foreign).await.unwrap_err();
        assert!(err.is_permission_denied());

        let err = policy
            .eval_query(&RequestContext::new(), &mut plan())
            .await
            .unwrap_err();
        assert!(err.is_permission_denied());
    }

    #[tokio::test]
    async fn closure_rules_see_the_mutation() {
        let policy = Policy::new("note").mutation_rule(mutation_rule(|_ctx, m| {
            Ok(if m.op == Op::Delete {
                Decision::deny("hard deletes disabled")
            } else {
                Decision::Skip
            })
        }));
        let ctx = RequestContext::new();
        assert!(policy
            .eval_mutation(&ctx, &mut Mutation::new("note", Op::Update))
            .await
            .is_ok());
        assert!(policy
            .eval_mutation(&ctx, &mut Mutation::new("note", Op::Delete))
            .await
            .is_err());
    }

    #[test]
    fn registry_rejects_duplicates_and_reports_missing() {
        let mut registry = PolicyRegistry::new();
        registry.register(Policy::allow_all("note")).unwrap();
        assert!(registry.register(Policy::allow_all("note")).is_err());
        assert!(registry.get("user").unwrap_err().is_configuration());
    }
}
