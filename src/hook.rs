//! Mutation hooks.
//!
//! Hooks form an explicit middleware chain composed per call: each hook gets
//! the mutation and a [`Next`] handle, and either calls `next.run(..)` to
//! continue towards the store write or returns early to short-circuit.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use entgraph_types::{EntityId, Predicate, Row, Value};

use crate::context::RequestContext;
use crate::entity::Entity;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// Single or bulk create.
    Create,
    UpdateOne,
    Update,
    SoftDeleteOne,
    SoftDelete,
    DeleteOne,
    Delete,
}

impl Op {
    pub fn is_update(self) -> bool {
        matches!(
            self,
            Op::UpdateOne | Op::Update | Op::SoftDeleteOne | Op::SoftDelete
        )
    }

    pub fn is_soft_delete(self) -> bool {
        matches!(self, Op::SoftDeleteOne | Op::SoftDelete)
    }

    pub fn is_delete(self) -> bool {
        matches!(self, Op::DeleteOne | Op::Delete)
    }

    /// Addresses exactly one row by id.
    pub fn is_one(self) -> bool {
        matches!(self, Op::UpdateOne | Op::SoftDeleteOne | Op::DeleteOne)
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Op::Create => "create",
            Op::UpdateOne => "update_one",
            Op::Update => "update",
            Op::SoftDeleteOne => "soft_delete_one",
            Op::SoftDelete => "soft_delete",
            Op::DeleteOne => "delete_one",
            Op::Delete => "delete",
        };
        f.write_str(s)
    }
}

/// Add or remove edge targets.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeChange {
    /// Bulk create item the change belongs to; ignored for updates.
    pub item: usize,
    pub edge: String,
    pub add: bool,
    pub ids: Vec<EntityId>,
}

/// A pending write as seen by hooks and mutation policies.
#[derive(Debug, Clone)]
pub struct Mutation {
    pub entity: String,
    pub op: Op,
    /// One row per created item.
    pub creates: Vec<Row>,
    /// Target of the `*One` operations.
    pub id: Option<EntityId>,
    /// Update assignments; `Value::Null` clears a field.
    pub set: Row,
    pub append_tags: Vec<String>,
    /// Conjunctive filter for update/delete, including policy-injected terms.
    pub predicates: Vec<Predicate>,
    pub edges: Vec<EdgeChange>,
    pub(crate) committed: Vec<Entity>,
}

impl Mutation {
    pub fn new(entity: impl Into<String>, op: Op) -> Self {
        Self {
            entity: entity.into(),
            op,
            creates: Vec::new(),
            id: None,
            set: Row::new(),
            append_tags: Vec::new(),
            predicates: Vec::new(),
            edges: Vec::new(),
            committed: Vec::new(),
        }
    }

    /// Value about to be written: the first create row, or the update set.
    pub fn field(&self, name: &str) -> Option<&Value> {
        match self.op {
            Op::Create => self.creates.first().and_then(|r| r.get(name)),
            _ => self.set.get(name),
        }
    }

    /// Assign a field on every create row, or in the update set.
    pub fn set_field(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        let name = name.into();
        let value = value.into();
        match self.op {
            Op::Create => {
                for row in &mut self.creates {
                    row.insert(name.clone(), value.clone());
                }
            }
            _ => {
                self.set.insert(name, value);
            }
        }
    }

    pub fn filter(&mut self, predicate: Predicate) {
        self.predicates.push(predicate);
    }
}

/// What a mutation chain produced.
#[derive(Debug, Clone)]
pub enum MutationOutput {
    Entities(Vec<Entity>),
    Count(usize),
}

impl MutationOutput {
    pub fn count(&self) -> usize {
        match self {
            MutationOutput::Entities(v) => v.len(),
            MutationOutput::Count(n) => *n,
        }
    }

    pub fn into_entities(self) -> Vec<Entity> {
        match self {
            MutationOutput::Entities(v) => v,
            MutationOutput::Count(_) => Vec::new(),
        }
    }
}

#[async_trait]
pub trait Hook: Send + Sync {
    async fn handle(
        &self,
        ctx: &RequestContext,
        mutation: &mut Mutation,
        next: Next<'_>,
    ) -> Result<MutationOutput>;
}

/// The store write at the end of the chain.
#[async_trait]
pub(crate) trait Terminal: Send + Sync {
    async fn apply(&self, ctx: &RequestContext, mutation: &mut Mutation) -> Result<MutationOutput>;
}

/// Remainder of the chain after the current hook.
pub struct Next<'a> {
    hooks: &'a [Arc<dyn Hook>],
    terminal: &'a dyn Terminal,
}

impl<'a> Next<'a> {
    pub(crate) fn new(hooks: &'a [Arc<dyn Hook>], terminal: &'a dyn Terminal) -> Self {
        Self { hooks, terminal }
    }

    pub async fn run(self, ctx: &RequestContext, mutation: &mut Mutation) -> Result<MutationOutput> {
        ctx.check("hook")?;
        match self.hooks.split_first() {
            Some((hook, rest)) => {
                hook.handle(ctx, mutation, Next::new(rest, self.terminal))
                    .await
            }
            None => self.terminal.apply(ctx, mutation).await,
        }
    }
}

// ── Helpers ──

/// Run `hook` only for the listed operations.
pub fn on(ops: &[Op], hook: impl Hook + 'static) -> OnOps {
    OnOps {
        ops: ops.to_vec(),
        hook: Arc::new(hook),
    }
}

pub struct OnOps {
    ops: Vec<Op>,
    hook: Arc<dyn Hook>,
}

#[async_trait]
impl Hook for OnOps {
    async fn handle(
        &self,
        ctx: &RequestContext,
        mutation: &mut Mutation,
        next: Next<'_>,
    ) -> Result<MutationOutput> {
        if self.ops.contains(&mutation.op) {
            self.hook.handle(ctx, mutation, next).await
        } else {
            next.run(ctx, mutation).await
        }
    }
}

/// Hook running `f` before continuing the chain.
pub fn before<F>(f: F) -> Before<F>
where
    F: Fn(&RequestContext, &mut Mutation) -> Result<()> + Send + Sync + 'static,
{
    Before(f)
}

pub struct Before<F>(F);

#[async_trait]
impl<F> Hook for Before<F>
where
    F: Fn(&RequestContext, &mut Mutation) -> Result<()> + Send + Sync + 'static,
{
    async fn handle(
        &self,
        ctx: &RequestContext,
        mutation: &mut Mutation,
        next: Next<'_>,
    ) -> Result<MutationOutput> {
        (self.0)(ctx, mutation)?;
        next.run(ctx, mutation).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recording {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Hook for Recording {
        async fn handle(
            &self,
            ctx: &RequestContext,
            mutation: &mut Mutation,
            next: Next<'_>,
        ) -> Result<MutationOutput> {
            self.log.lock().unwrap().push(format!("{}:before", self.name));
            let out = next.run(ctx, mutation).await;
            self.log.lock().unwrap().push(format!("{}:after", self.name));
            out
        }
    }

    struct ShortCircuit;

    #[async_trait]
    impl Hook for ShortCircuit {
        async fn handle(
            &self,
            _ctx: &RequestContext,
            _mutation: &mut Mutation,
            _next: Next<'_>,
        ) -> Result<MutationOutput> {
            Ok(MutationOutput::Count(0))
        }
    }

    struct CountingTerminal(Arc<Mutex<Vec<String>>>);

    #[async_trait]
    impl Terminal for CountingTerminal {
        async fn apply(&self, _ctx: &RequestContext, m: &mut Mutation) -> Result<MutationOutput> {
            self.0.lock().unwrap().push("store".to_string());
            Ok(MutationOutput::Count(m.creates.len()))
        }
    }

    #[tokio::test]
    async fn hooks_wrap_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let hooks: Vec<Arc<dyn Hook>> = vec![
            Arc::new(Recording {
                name: "a",
                log: log.clone(),
            }),
            Arc::new(Recording {
                name: "b",
                log: log.clone(),
            }),
        ];
        let terminal = CountingTerminal(log.clone());
        let mut m = Mutation::new("note", Op::Create);
        m.creates.push(Row::new());
        let out = Next::new(&hooks, &terminal)
            .run(&RequestContext::new(), &mut m)
            .await
            .unwrap();
        assert_eq!(out.count(), 1);
        assert_eq!(
            *log.lock().unwrap(),
            vec!["a:before", "b:before", "store", "b:after", "a:after"]
        );
    }

    #[tokio::test]
    async fn short_circuit_skips_the_store() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let hooks: Vec<Arc<dyn Hook>> = vec![Arc::new(ShortCircuit)];
        let terminal = CountingTerminal(log.clone());
        let mut m = Mutation::new("note", Op::Create);
        Next::new(&hooks, &terminal)
            .run(&RequestContext::new(), &mut m)
            .await
            .unwrap();
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn op_filter_and_before_helper() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let hooks: Vec<Arc<dyn Hook>> = vec![
            Arc::new(on(&[Op::Delete], ShortCircuit)),
            Arc::new(before(|_ctx, m: &mut Mutation| {
                m.set_field("title", "stamped");
                Ok(())
            })),
        ];
        let terminal = CountingTerminal(log.clone());
        let mut m = Mutation::new("note", Op::Create);
        m.creates.push(Row::new());
        Next::new(&hooks, &terminal)
            .run(&RequestContext::new(), &mut m)
            .await
            .unwrap();
        assert_eq!(m.field("title"), Some(&Value::from("stamped")));
        assert_eq!(log.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancelled_context_stops_the_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let terminal = CountingTerminal(log.clone());
        let token = crate::context::CancelToken::new();
        token.cancel();
        let ctx = RequestContext::new().with_cancel(token);
        let err = Next::new(&[], &terminal)
            .run(&ctx, &mut Mutation::new("note", Op::Create))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert!(log.lock().unwrap().is_empty());
    }
}
