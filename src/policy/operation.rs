//! Operation Context
//!
//! Everything the cache needs to know about one data operation, built by
//! the host pipeline before the operation runs.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Kind of data operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    PointLookup,
    ListQuery,
    Aggregate,
    GroupBy,
    SortLimit,
    Paginate,
    /// Random sampling read; its result is not a function of its inputs
    RandomSample,
    Create,
    Update,
    Delete,
    BatchCreate,
    BatchUpdate,
    BatchDelete,
}

impl OperationKind {
    /// All kinds, in declaration order
    pub const ALL: [OperationKind; 13] = [
        OperationKind::PointLookup,
        OperationKind::ListQuery,
        OperationKind::Aggregate,
        OperationKind::GroupBy,
        OperationKind::SortLimit,
        OperationKind::Paginate,
        OperationKind::RandomSample,
        OperationKind::Create,
        OperationKind::Update,
        OperationKind::Delete,
        OperationKind::BatchCreate,
        OperationKind::BatchUpdate,
        OperationKind::BatchDelete,
    ];

    /// Query kinds whose keys are scoped by entity type and invalidated
    /// wholesale on any mutation of that type
    pub const SCOPED_QUERIES: [OperationKind; 5] = [
        OperationKind::ListQuery,
        OperationKind::Aggregate,
        OperationKind::GroupBy,
        OperationKind::SortLimit,
        OperationKind::Paginate,
    ];

    pub fn is_read(self) -> bool {
        !self.is_mutation()
    }

    pub fn is_mutation(self) -> bool {
        matches!(
            self,
            OperationKind::Create
                | OperationKind::Update
                | OperationKind::Delete
                | OperationKind::BatchCreate
                | OperationKind::BatchUpdate
                | OperationKind::BatchDelete
        )
    }

    pub fn is_batch(self) -> bool {
        matches!(
            self,
            OperationKind::BatchCreate | OperationKind::BatchUpdate | OperationKind::BatchDelete
        )
    }

    pub fn is_cacheable(self) -> bool {
        self.key_segment().is_some()
    }

    /// Second key segment for cacheable kinds
    pub fn key_segment(self) -> Option<&'static str> {
        match self {
            OperationKind::PointLookup => Some("id"),
            OperationKind::ListQuery => Some("list"),
            OperationKind::Aggregate => Some("agg"),
            OperationKind::GroupBy => Some("group"),
            OperationKind::SortLimit => Some("sort"),
            OperationKind::Paginate => Some("page"),
            OperationKind::RandomSample
            | OperationKind::Create
            | OperationKind::Update
            | OperationKind::Delete
            | OperationKind::BatchCreate
            | OperationKind::BatchUpdate
            | OperationKind::BatchDelete => None,
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            OperationKind::PointLookup => "point_lookup",
            OperationKind::ListQuery => "list_query",
            OperationKind::Aggregate => "aggregate",
            OperationKind::GroupBy => "group_by",
            OperationKind::SortLimit => "sort_limit",
            OperationKind::Paginate => "paginate",
            OperationKind::RandomSample => "random_sample",
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
            OperationKind::BatchCreate => "batch_create",
            OperationKind::BatchUpdate => "batch_update",
            OperationKind::BatchDelete => "batch_delete",
        };
        f.write_str(name)
    }
}

/// Parameters that select what a read returns
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryParams {
    /// Identifier for point lookups (and single-record mutations)
    pub id: Option<Value>,
    /// Leading key segments, e.g. `["sum", "total"]` for a sum over `total`
    pub discriminators: Vec<String>,
    pub filter: Option<Value>,
    pub sort: Option<Value>,
    pub page: Option<Value>,
}

impl QueryParams {
    /// True when no filter, sort or page is set
    pub fn is_unconstrained(&self) -> bool {
        self.filter.is_none() && self.sort.is_none() && self.page.is_none()
    }
}

/// One data operation as seen by the cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationContext {
    pub kind: OperationKind,
    pub entity_type: String,
    #[serde(default)]
    pub params: QueryParams,
    /// Mutation payload: one record object, or an array for batches
    #[serde(default)]
    pub payload: Option<Value>,
    #[serde(default)]
    pub mutation_id: Option<String>,
    /// Actor / tenant / request metadata
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl OperationContext {
    pub fn new(kind: OperationKind, entity_type: impl Into<String>) -> Self {
        let mutation_id = kind.is_mutation().then(|| Uuid::new_v4().to_string());
        Self {
            kind,
            entity_type: entity_type.into(),
            params: QueryParams::default(),
            payload: None,
            mutation_id,
            metadata: BTreeMap::new(),
        }
    }

    pub fn point_lookup(entity_type: impl Into<String>, id: impl Into<Value>) -> Self {
        let mut ctx = Self::new(OperationKind::PointLookup, entity_type);
        ctx.params.id = Some(id.into());
        ctx
    }

    pub fn aggregate<I, S>(entity_type: impl Into<String>, discriminators: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(OperationKind::Aggregate, entity_type).with_discriminators(discriminators)
    }

    pub fn list(entity_type: impl Into<String>) -> Self {
        Self::new(OperationKind::ListQuery, entity_type)
    }

    /// A mutation carrying `payload` (object or array of objects)
    pub fn mutation(kind: OperationKind, entity_type: impl Into<String>, payload: Value) -> Self {
        let mut ctx = Self::new(kind, entity_type);
        ctx.payload = Some(payload);
        ctx
    }

    pub fn with_id(mut self, id: impl Into<Value>) -> Self {
        self.params.id = Some(id.into());
        self
    }

    pub fn with_discriminators<I, S>(mut self, discriminators: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.params
            .discriminators
            .extend(discriminators.into_iter().map(Into::into));
        self
    }

    pub fn with_filter(mut self, filter: Value) -> Self {
        self.params.filter = Some(filter);
        self
    }

    pub fn with_sort(mut self, sort: Value) -> Self {
        self.params.sort = Some(sort);
        self
    }

    pub fn with_page(mut self, page: Value) -> Self {
        self.params.page = Some(page);
        self
    }

    pub fn with_mutation_id(mut self, mutation_id: impl Into<String>) -> Self {
        self.mutation_id = Some(mutation_id.into());
        self
    }

    pub fn with_metadata(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(name.into(), value.into());
        self
    }

    /// Payload records: the array elements for a batch, else the single payload
    pub fn records(&self) -> Vec<&Value> {
        match &self.payload {
            Some(Value::Array(items)) => items.iter().collect(),
            Some(value) => vec![value],
            None => Vec::new(),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
