//! Query interceptors.
//!
//! Interceptors run before every read of an entity type, in registration
//! order, and may rewrite the [`QueryPlan`] or abort the query. The built-in
//! soft-delete filter always runs first; the entity's policy always runs last.

use async_trait::async_trait;
use entgraph_types::Predicate;

use crate::context::RequestContext;
use crate::descriptor::DELETED_AT;
use crate::error::Result;
use crate::query::QueryPlan;

#[async_trait]
pub trait Interceptor: Send + Sync {
    async fn intercept(&self, ctx: &RequestContext, plan: &mut QueryPlan) -> Result<()>;
}

/// Hides soft-deleted rows unless the context opts out.
pub struct SoftDeleteFilter;

#[async_trait]
impl Interceptor for SoftDeleteFilter {
    async fn intercept(&self, ctx: &RequestContext, plan: &mut QueryPlan) -> Result<()> {
        if !ctx.soft_delete_skipped() {
            plan.filter(Predicate::is_null(DELETED_AT));
        }
        Ok(())
    }
}

pub struct InterceptorFn<F>(F);

/// Interceptor from a closure.
pub fn func<F>(f: F) -> InterceptorFn<F>
where
    F: Fn(&RequestContext, &mut QueryPlan) -> Result<()> + Send + Sync + 'static,
{
    InterceptorFn(f)
}

#[async_trait]
impl<F> Interceptor for InterceptorFn<F>
where
    F: Fn(&RequestContext, &mut QueryPlan) -> Result<()> + Send + Sync + 'static,
{
    async fn intercept(&self, ctx: &RequestContext, plan: &mut QueryPlan) -> Result<()> {
        (self.0)(ctx, plan)
    }
}
