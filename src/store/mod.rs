//! Document-store abstraction the core persists through.
//!
//! The orchestrator never owns a database; it speaks to a minimal
//! JSON-document contract ([`DocumentStore`]) and leaves the backend to the
//! embedding layer. Two implementations ship here:
//!
//! * [`MemoryDocumentStore`]: process-local, always available, the test
//!   backend.
//! * [`SqliteDocumentStore`]: durable, sqlx-backed, behind the `sqlite`
//!   feature (default-on).
//!
//! Collection/id strings are built exclusively by the pure functions in
//! [`paths`]; nothing else in the crate hand-rolls a document path.
//!
//! # Compare-and-set semantics
//!
//! [`DocumentStore::compare_and_set`] takes a *partial* expected document:
//! every top-level field present in `expected` must equal the stored value
//! for the swap to happen. This is how the buffer subsystem guards
//! deployment (`{"used": false}`) and how budget/quota writers enforce
//! their version tokens.

pub mod memory;
pub mod paths;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::MemoryDocumentStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteDocumentStore;

use async_trait::async_trait;
use miette::Diagnostic;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

// ── Errors ─────────────────────────────────────────────────────────────

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("document not found: {collection}/{id}")]
    #[diagnostic(code(nexus::store::not_found))]
    NotFound { collection: String, id: String },

    #[error("serialization error: {0}")]
    #[diagnostic(code(nexus::store::serde))]
    Serde(#[from] serde_json::Error),

    #[error("store backend error: {message}")]
    #[diagnostic(
        code(nexus::store::backend),
        help("Check database connectivity and permissions.")
    )]
    Backend { message: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;

// ── Query filters ──────────────────────────────────────────────────────

/// Comparison operator for a [`Filter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
}

/// A single top-level-field predicate applied by [`DocumentStore::query`].
#[derive(Debug, Clone)]
pub struct Filter {
    pub field: String,
    pub op: FilterOp,
    pub value: Value,
}

impl Filter {
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Eq,
            value: value.into(),
        }
    }

    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            field: field.into(),
            op: FilterOp::Ne,
            value: value.into(),
        }
    }

    /// Whether `doc` satisfies this predicate.
    ///
    /// Non-equality operators compare numbers numerically and strings
    /// lexicographically; mixed types never match.
    #[must_use]
    pub fn matches(&self, doc: &Value) -> bool {
        let Some(actual) = doc.get(&self.field) else {
            return false;
        };
        match self.op {
            FilterOp::Eq => actual == &self.value,
            FilterOp::Ne => actual != &self.value,
            FilterOp::Lt | FilterOp::Lte | FilterOp::Gt | FilterOp::Gte => {
                let ord = match (actual, &self.value) {
                    (Value::Number(a), Value::Number(b)) => {
                        match (a.as_f64(), b.as_f64()) {
                            (Some(a), Some(b)) => a.partial_cmp(&b),
                            _ => None,
                        }
                    }
                    (Value::String(a), Value::String(b)) => Some(a.as_str().cmp(b.as_str())),
                    _ => None,
                };
                let Some(ord) = ord else { return false };
                match self.op {
                    FilterOp::Lt => ord.is_lt(),
                    FilterOp::Lte => ord.is_le(),
                    FilterOp::Gt => ord.is_gt(),
                    FilterOp::Gte => ord.is_ge(),
                    _ => unreachable!(),
                }
            }
        }
    }
}

/// Whether every top-level field of `expected` matches `doc`.
#[must_use]
pub(crate) fn partial_matches(expected: &Value, doc: &Value) -> bool {
    match expected.as_object() {
        Some(fields) => fields.iter().all(|(k, v)| doc.get(k) == Some(v)),
        // A non-object expectation compares whole-document.
        None => expected == doc,
    }
}

// ── Contract ───────────────────────────────────────────────────────────

/// Minimal JSON document store the core depends on.
///
/// Implementations must be safe for concurrent use; the orchestrator's
/// discipline is single-writer-per-pipeline-id, but buffers, budgets and
/// incident ids are contended and rely on `compare_and_set`.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch a document, `None` if absent.
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>>;

    /// Create or replace a document.
    async fn set(&self, collection: &str, id: &str, doc: Value) -> Result<()>;

    /// Shallow-merge `patch`'s top-level fields into an existing document.
    ///
    /// # Errors
    ///
    /// `NotFound` if the document does not exist.
    async fn update(&self, collection: &str, id: &str, patch: Value) -> Result<()>;

    /// All documents in `collection` matching every filter, ordered by id.
    async fn query(&self, collection: &str, filters: &[Filter]) -> Result<Vec<(String, Value)>>;

    /// Atomically replace the document iff `expected`'s fields match.
    ///
    /// `expected = None` asserts the document is absent (create-if-missing).
    /// Returns `Ok(true)` when the swap happened, `Ok(false)` on mismatch.
    async fn compare_and_set(
        &self,
        collection: &str,
        id: &str,
        expected: Option<&Value>,
        new: Value,
    ) -> Result<bool>;
}

// ── Typed convenience layer ────────────────────────────────────────────

/// Serde-typed helpers over the raw JSON contract.
#[async_trait]
pub trait DocumentStoreExt: DocumentStore {
    /// Fetch and deserialize a document.
    async fn get_doc<T: DeserializeOwned + Send>(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<Option<T>> {
        match self.get(collection, id).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Serialize and store a document.
    async fn set_doc<T: Serialize + Sync>(
        &self,
        collection: &str,
        id: &str,
        doc: &T,
    ) -> Result<()> {
        self.set(collection, id, serde_json::to_value(doc)?).await
    }
}

#[async_trait]
impl<S: DocumentStore + ?Sized> DocumentStoreExt for S {}

// ── Tests ──────────────────────────────────────────────────────────────
