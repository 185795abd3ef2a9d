//! Static metadata per entity type.
//!
//! One [`EntityDescriptor`] replaces what would otherwise be per-entity
//! generated code: the generic query and mutation pipelines read column names,
//! id kind, defaults and validators from here.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use entgraph_types::{FieldType, IdType, Value, ID_COLUMN};

use crate::context::RequestContext;
use crate::edge::EdgeDescriptor;
use crate::error::{EntError, Result};
use crate::validate::Validator;

// ── Well-known columns ──

pub const CREATED_AT: &str = "created_at";
pub const UPDATED_AT: &str = "updated_at";
pub const CREATED_BY: &str = "created_by";
pub const UPDATED_BY: &str = "updated_by";
pub const TAGS: &str = "tags";
pub const DELETED_AT: &str = "deleted_at";
pub const DELETED_BY: &str = "deleted_by";

// ============================================================================
// DEFAULTS
// ============================================================================

pub type DefaultFn = Arc<dyn Fn(&RequestContext) -> Value + Send + Sync>;

/// Where a default value comes from.
#[derive(Clone)]
pub enum DefaultValue {
    /// A constant.
    Value(Value),
    /// Computed per request.
    Func(DefaultFn),
    /// Named provider registered on the `EngineBuilder`.
    Provider(String),
}

impl fmt::Debug for DefaultValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefaultValue::Value(v) => write!(f, "Value({})", v),
            DefaultValue::Func(_) => f.write_str("Func(..)"),
            DefaultValue::Provider(name) => write!(f, "Provider({})", name),
        }
    }
}

fn now_default() -> DefaultValue {
    DefaultValue::Func(Arc::new(|_| Value::Time(Utc::now())))
}

fn actor_default() -> DefaultValue {
    DefaultValue::Func(Arc::new(|ctx| Value::from(ctx.actor().map(str::to_string))))
}

// ============================================================================
// FIELDS
// ============================================================================

#[derive(Clone)]
pub struct FieldDescriptor {
    pub name: String,
    pub ty: FieldType,
    /// Must be non-null after defaults on create, and may not be cleared.
    pub required: bool,
    /// Rejected by every update operation once created.
    pub immutable: bool,
    pub unique: bool,
    pub default: Option<DefaultValue>,
    /// Applied on every update that does not set the field itself.
    pub update_default: Option<DefaultValue>,
    pub validators: Vec<Validator>,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, ty: FieldType) -> Self {
        Self {
            name: name.into(),
            ty,
            required: false,
            immutable: false,
            unique: false,
            default: None,
            update_default: None,
            validators: Vec::new(),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn immutable(mut self) -> Self {
        self.immutable = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(DefaultValue::Value(value.into()));
        self
    }

    pub fn default_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&RequestContext) -> Value + Send + Sync + 'static,
    {
        self.default = Some(DefaultValue::Func(Arc::new(f)));
        self
    }

    /// Default from a provider registered under `name` at engine build time.
    pub fn default_provider(mut self, name: impl Into<String>) -> Self {
        self.default = Some(DefaultValue::Provider(name.into()));
        self
    }

    pub fn update_default_fn<F>(mut self, f: F) -> Self
    where
        F: Fn(&RequestContext) -> Value + Send + Sync + 'static,
    {
        self.update_default = Some(DefaultValue::Func(Arc::new(f)));
        self
    }

    pub fn validate(mut self, validator: Validator) -> Self {
        self.validators.push(validator);
        self
    }

    /// Type check, then every validator. Null skips validators.
    pub fn check_value(&self, value: &Value) -> std::result::Result<(), String> {
        if !value.fits(self.ty) {
            return Err(format!(
                "expected {} value, got {}",
                self.ty,
                value.field_type().map(|t| t.to_string()).unwrap_or_default()
            ));
        }
        if value.is_null() {
            return Ok(());
        }
        for validator in &self.validators {
            validator(value)?;
        }
        Ok(())
    }

    /// Normalise values that fit but are stored differently (ints in float columns).
    pub(crate) fn coerce(&self, value: Value) -> Value {
        match (self.ty, value) {
            (FieldType::Float, Value::Int(i)) => Value::Float(i as f64),
            (_, v) => v,
        }
    }
}

impl fmt::Debug for FieldDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldDescriptor")
            .field("name", &self.name)
            .field("ty", &self.ty)
            .field("required", &self.required)
            .field("immutable", &self.immutable)
            .field("unique", &self.unique)
            .field("default", &self.default)
            .field("validators", &self.validators.len())
            .finish()
    }
}

/// Shorthand constructors for [`FieldDescriptor`].
pub struct Field;

impl Field {
    pub fn string(name: impl Into<String>) -> FieldDescriptor {
        FieldDescriptor::new(name, FieldType::String)
    }

    pub fn int(name: impl Into<String>) -> FieldDescriptor {
        FieldDescriptor::new(name, FieldType::Int)
    }

    pub fn float(name: impl Into<String>) -> FieldDescriptor {
        FieldDescriptor::new(name, FieldType::Float)
    }

    pub fn bool(name: impl Into<String>) -> FieldDescriptor {
        FieldDescriptor::new(name, FieldType::Bool)
    }

    pub fn time(name: impl Into<String>) -> FieldDescriptor {
        FieldDescriptor::new(name, FieldType::Time)
    }

    pub fn strings(name: impl Into<String>) -> FieldDescriptor {
        FieldDescriptor::new(name, FieldType::Strings)
    }

    pub fn json(name: impl Into<String>) -> FieldDescriptor {
        FieldDescriptor::new(name, FieldType::Json)
    }
}

// ============================================================================
// ENTITIES
// ============================================================================

#[derive(Debug, Clone)]
pub struct EntityDescriptor {
    pub name: String,
    pub table: String,
    pub id_type: IdType,
    /// Generate an id when the caller does not assign one.
    pub generated_id: bool,
    pub fields: Vec<FieldDescriptor>,
    pub edges: Vec<EdgeDescriptor>,
    pub soft_delete: bool,
    pub audited: bool,
    /// Mutations are shadowed into the history table.
    pub tracked: bool,
}

impl EntityDescriptor {
    pub fn builder(name: impl Into<String>) -> EntityDescriptorBuilder {
        let name = name.into();
        EntityDescriptorBuilder {
            table: name.clone(),
            name,
            id_type: IdType::String,
            generated_id: true,
            fields: Vec::new(),
            edges: Vec::new(),
            soft_delete: false,
            audited: false,
            tracked: false,
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn edge(&self, name: &str) -> Option<&EdgeDescriptor> {
        self.edges.iter().find(|e| e.name == name)
    }

    /// Every physical column, id first.
    pub fn columns(&self) -> Vec<&str> {
        std::iter::once(ID_COLUMN)
            .chain(self.fields.iter().map(|f| f.name.as_str()))
            .collect()
    }

    pub fn has_column(&self, name: &str) -> bool {
        name == ID_COLUMN || self.field(name).is_some()
    }

    /// Type of a column, including the id.
    pub fn column_type(&self, name: &str) -> Option<FieldType> {
        if name == ID_COLUMN {
            return Some(self.id_field_type());
        }
        self.field(name).map(|f| f.ty)
    }

    pub fn id_field_type(&self) -> FieldType {
        match self.id_type {
            IdType::String => FieldType::String,
            IdType::Int => FieldType::Int,
        }
    }

    /// Fields the caller owns, i.e. not maintained by audit/soft-delete bookkeeping.
    pub fn business_fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.iter().filter(move |f| !self.is_system_field(&f.name))
    }

    pub fn is_system_field(&self, name: &str) -> bool {
        let audit = self.audited
            && matches!(name, CREATED_AT | UPDATED_AT | CREATED_BY | UPDATED_BY);
        let soft = self.soft_delete && matches!(name, DELETED_AT | DELETED_BY);
        audit || soft
    }
}

pub struct EntityDescriptorBuilder {
    name: String,
    table: String,
    id_type: IdType,
    generated_id: bool,
    fields: Vec<FieldDescriptor>,
    edges: Vec<EdgeDescriptor>,
    soft_delete: bool,
    audited: bool,
    tracked: bool,
}

impl EntityDescriptorBuilder {
    pub fn table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn id(mut self, id_type: IdType) -> Self {
        self.id_type = id_type;
        self
    }

    /// Require callers to assign ids; nothing is generated.
    pub fn caller_assigned_id(mut self) -> Self {
        self.generated_id = false;
        self
    }

    /// Adds `created_at`, `updated_at`, `created_by`, `updated_by` and `tags`.
    pub fn audited(mut self) -> Self {
        self.audited = true;
        self
    }

    /// Adds `deleted_at` / `deleted_by` and filters deleted rows by default.
    pub fn soft_delete(mut self) -> Self {
        self.soft_delete = true;
        self
    }

    /// Shadow every mutation into `{table}{history suffix}`.
    pub fn tracked(mut self) -> Self {
        self.tracked = true;
        self
    }

    pub fn field(mut self, field: FieldDescriptor) -> Self {
        self.fields.push(field);
        self
    }

    pub fn edge(mut self, edge: EdgeDescriptor) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn build(self) -> Result<EntityDescriptor> {
        if self.name.trim().is_empty() || self.table.trim().is_empty() {
            return Err(EntError::config("entity name and table must be non-empty"));
        }

        let mut fields = Vec::new();
        if self.audited {
            fields.push(Field::time(CREATED_AT).immutable().required().default_fn(|_| Value::Time(Utc::now())));
            let mut updated_at = Field::time(UPDATED_AT).required();
            updated_at.default = Some(now_default());
            updated_at.update_default = Some(now_default());
            fields.push(updated_at);
            let mut created_by = Field::string(CREATED_BY).immutable();
            created_by.default = Some(actor_default());
            fields.push(created_by);
            let mut updated_by = Field::string(UPDATED_BY);
            updated_by.default = Some(actor_default());
            updated_by.update_default = Some(actor_default());
            fields.push(updated_by);
            fields.push(Field::strings(TAGS));
        }
        if self.soft_delete {
            fields.push(Field::time(DELETED_AT));
            fields.push(Field::string(DELETED_BY));
        }
        fields.extend(self.fields);

        let mut seen = HashSet::new();
        for f in &fields {
            if f.name == ID_COLUMN {
                return Err(EntError::config(format!(
                    "{}: field '{}' is reserved for the primary key",
                    self.name, ID_COLUMN
                )));
            }
            if !seen.insert(f.name.as_str()) {
                return Err(EntError::config(format!(
                    "{}: duplicate field '{}'",
                    self.name, f.name
                )));
            }
            if let Some(DefaultValue::Value(v)) = &f.default {
                if !v.fits(f.ty) {
                    return Err(EntError::config(format!(
                        "{}.{}: default {} does not fit {}",
                        self.name, f.name, v, f.ty
                    )));
                }
            }
        }

        let mut edge_names = HashSet::new();
        for e in &self.edges {
            if !edge_names.insert(e.name.as_str()) {
                return Err(EntError::config(format!(
                    "{}: duplicate edge '{}'",
                    self.name, e.name
                )));
            }
        }

        Ok(EntityDescriptor {
            name: self.name,
            table: self.table,
            id_type: self.id_type,
            generated_id: self.generated_id,
            fields,
            edges: self.edges,
            soft_delete: self.soft_delete,
            audited: self.audited,
            tracked: self.tracked,
        })
    }
}
