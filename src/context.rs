//! Request-scoped context: who is calling, for which tenant, and whether the
//! caller has given up waiting.
//!
//! A `RequestContext` is cheap to clone. Clones belong to the same logical
//! request and therefore share one schema snapshot.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use crate::error::{EntError, Result};
use crate::policy::Decision;
use crate::schema::SchemaSnapshot;

/// The authenticated caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub actor_id: String,
    #[serde(default)]
    pub roles: Vec<String>,
    /// Tenant the principal belongs to, if any.
    #[serde(default)]
    pub tenancy: Option<String>,
}

impl Principal {
    pub fn new(actor_id: impl Into<String>) -> Self {
        Self {
            actor_id: actor_id.into(),
            roles: Vec::new(),
            tenancy: None,
        }
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.push(role.into());
        self
    }

    pub fn with_tenancy(mut self, tenant: impl Into<String>) -> Self {
        self.tenancy = Some(tenant.into());
        self
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

// ── Cancellation ──

/// Cooperative cancellation: a shared flag plus an optional deadline.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    deadline: Option<Instant>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Trip the token. Every clone observes it.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        if self.flag.load(Ordering::SeqCst) {
            return true;
        }
        matches!(self.deadline, Some(d) if Instant::now() >= d)
    }
}

// ── RequestContext ──

#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    principal: Option<Principal>,
    tenant: Option<String>,
    cancel: CancelToken,
    decision: Option<Decision>,
    skip_soft_delete: bool,
    change_ref: Option<String>,
    schema: Arc<OnceCell<Arc<SchemaSnapshot>>>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context for a principal; the tenant defaults to the principal's tenancy.
    pub fn for_principal(principal: Principal) -> Self {
        Self::new().with_principal(principal)
    }

    pub fn with_principal(mut self, principal: Principal) -> Self {
        self.principal = Some(principal);
        self.schema = Arc::default();
        self
    }

    /// Pin the tenant explicitly. Starts a fresh schema snapshot.
    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self.schema = Arc::default();
        self
    }

    pub fn with_cancel(mut self, token: CancelToken) -> Self {
        self.cancel = token;
        self
    }

    /// Pre-decided privacy outcome, e.g. `Decision::Allow` for internal
    /// requests that must bypass rule evaluation.
    pub fn with_decision(mut self, decision: Decision) -> Self {
        self.decision = Some(decision);
        self
    }

    /// Include soft-deleted rows in queries issued with this context.
    pub fn skip_soft_delete(mut self) -> Self {
        self.skip_soft_delete = true;
        self
    }

    /// Name the change group written into history `ref`.
    pub fn with_change_ref(mut self, change_ref: impl Into<String>) -> Self {
        self.change_ref = Some(change_ref.into());
        self
    }

    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    pub fn actor(&self) -> Option<&str> {
        self.principal.as_ref().map(|p| p.actor_id.as_str())
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.principal.as_ref().is_some_and(|p| p.has_role(role))
    }

    pub fn tenant(&self) -> Option<&str> {
        self.tenant
            .as_deref()
            .or_else(|| self.principal.as_ref().and_then(|p| p.tenancy.as_deref()))
    }

    pub fn decision(&self) -> Option<&Decision> {
        self.decision.as_ref()
    }

    pub fn soft_delete_skipped(&self) -> bool {
        self.skip_soft_delete
    }

    pub fn change_ref(&self) -> Option<&str> {
        self.change_ref.as_deref()
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Fail with `Cancelled` if the token has tripped.
    pub fn check(&self, stage: &str) -> Result<()> {
        if self.cancel.is_cancelled() {
            tracing::debug!(stage, "request cancelled");
            return Err(EntError::Cancelled {
                stage: stage.to_string(),
            });
        }
        Ok(())
    }

    pub(crate) fn schema_cell(&self) -> &OnceCell<Arc<SchemaSnapshot>> {
        &self.schema
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tenant_falls_back_to_principal() {
        let ctx = RequestContext::for_principal(Principal::new("u1").with_tenancy("t1"));
        assert_eq!(ctx.tenant(), Some("t1"));
        let ctx = ctx.with_tenant("t2");
        assert_eq!(ctx.tenant(), Some("t2"));
    }

    #[test]
    fn cancel_is_shared_across_clones() {
        let token = CancelToken::new();
        let ctx = RequestContext::new().with_cancel(token.clone());
        let copy = ctx.clone();
        assert!(copy.check("query").is_ok());
        token.cancel();
        let err = copy.check("query").unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn elapsed_deadline_cancels() {
        let token = CancelToken::new().with_deadline(Instant::now() - Duration::from_millis(1));
        assert!(token.is_cancelled());
        assert!(!CancelToken::new().with_timeout(Duration::from_secs(60)).is_cancelled());
    }
}
