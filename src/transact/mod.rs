use crate::config::CoordinationConfig;
use crate::error::{Result, StoreError};
use crate::optimistic::{Draft, Reducer};
use crate::record::{Condition, Record, RecordKey};
use crate::store::{RecordStore, TransactItem};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// One operation of a transaction group, addressed by table name.
pub enum TransactOp<'a> {
    Put {
        table: String,
        record: Record,
        condition: Option<Condition>,
    },
    /// Read-resolved update: `reducer` runs over a draft of `update_keys`,
    /// and the resulting diff is guarded on the values it was computed from.
    Update {
        table: String,
        key: RecordKey,
        update_keys: Vec<String>,
        reducer: Box<Reducer<'a>>,
    },
    Delete {
        table: String,
        key: RecordKey,
        condition: Option<Condition>,
    },
    /// Precondition on a record the group does not write.
    Check {
        table: String,
        key: RecordKey,
        condition: Condition,
    },
}

impl TransactOp<'_> {
    pub fn table(&self) -> &str {
        match self {
            TransactOp::Put { table, .. }
            | TransactOp::Update { table, .. }
            | TransactOp::Delete { table, .. }
            | TransactOp::Check { table, .. } => table,
        }
    }

    pub fn key(&self) -> &RecordKey {
        match self {
            TransactOp::Put { record, .. } => &record.key,
            TransactOp::Update { key, .. }
            | TransactOp::Delete { key, .. }
            | TransactOp::Check { key, .. } => key,
        }
    }
}

impl fmt::Debug for TransactOp<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            TransactOp::Put { .. } => "Put",
            TransactOp::Update { .. } => "Update",
            TransactOp::Delete { .. } => "Delete",
            TransactOp::Check { .. } => "Check",
        };
        f.debug_struct(kind)
            .field("table", &self.table())
            .field("key", self.key())
            .finish_non_exhaustive()
    }
}

/// Submits transaction groups as one all-or-nothing store write.
///
/// A group whose precondition fails surfaces `TransactionCanceled` and is
/// never retried here: a retry must re-run the update reducers against
/// fresh reads, which only the caller can arrange.
#[derive(Clone)]
pub struct TransactionCoordinator {
    store: Arc<dyn RecordStore>,
    max_items: usize,
}

impl fmt::Debug for TransactionCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionCoordinator")
            .field("max_items", &self.max_items)
            .finish_non_exhaustive()
    }
}

impl TransactionCoordinator {
    pub fn new(store: Arc<dyn RecordStore>, config: &CoordinationConfig) -> Self {
        Self {
            store,
            max_items: config.max_transaction_items,
        }
    }

    pub fn max_items(&self) -> usize {
        self.max_items
    }

    pub fn builder<'a>(&self) -> TransactionBuilder<'a> {
        TransactionBuilder::new()
    }

    pub async fn transact(&self, ops: Vec<TransactOp<'_>>) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        self.validate(&ops)?;

        let count = ops.len();
        let mut items = Vec::with_capacity(count);
        for op in ops {
            items.push(self.resolve(op).await?);
        }

        match self.store.transact_write(items).await {
            Ok(()) => {
                info!(items = count, "transaction committed");
                Ok(())
            }
            Err(err @ StoreError::TransactionCanceled { .. }) => {
                debug!(items = count, error = %err, "transaction canceled");
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    fn validate(&self, ops: &[TransactOp<'_>]) -> Result<()> {
        if ops.len() > self.max_items {
            return Err(StoreError::Validation(format!(
                "transaction of {} operations exceeds the limit of {}",
                ops.len(),
                self.max_items
            )));
        }
        let mut seen = HashSet::new();
        for op in ops {
            if !seen.insert((op.table(), op.key())) {
                return Err(StoreError::Validation(format!(
                    "transaction addresses {}/{} more than once",
                    op.table(),
                    op.key()
                )));
            }
        }
        Ok(())
    }

    async fn resolve(&self, op: TransactOp<'_>) -> Result<TransactItem> {
        Ok(match op {
            TransactOp::Put {
                table,
                record,
                condition,
            } => TransactItem::Put {
                table,
                record,
                condition,
            },
            TransactOp::Update {
                table,
                key,
                update_keys,
                reducer,
            } => {
                let read = self.store.get(&table, &key, Some(&update_keys)).await?;
                let existed = read.is_some();
                let original = read.unwrap_or_default();
                let mut draft = Draft::new(&update_keys, &original, existed);
                reducer(&mut draft)?;
                let guard = Condition::expect_fields(&update_keys, &original);
                let update = draft.diff(&original);
                if update.is_empty() {
                    TransactItem::ConditionCheck {
                        table,
                        key,
                        condition: guard,
                    }
                } else {
                    TransactItem::Update {
                        table,
                        key,
                        update,
                        condition: Some(guard),
                    }
                }
            }
            TransactOp::Delete {
                table,
                key,
                condition,
            } => TransactItem::Delete {
                table,
                key,
                condition,
            },
            TransactOp::Check {
                table,
                key,
                condition,
            } => TransactItem::ConditionCheck {
                table,
                key,
                condition,
            },
        })
    }
}

/// Fluent assembly of a transaction group.
#[derive(Debug, Default)]
pub struct TransactionBuilder<'a> {
    ops: Vec<TransactOp<'a>>,
}

impl<'a> TransactionBuilder<'a> {
    pub fn new() -> Self {
        Self { ops: Vec::new() }
    }

    pub fn put(mut self, table: impl Into<String>, record: Record, condition: Option<Condition>) -> Self {
        self.ops.push(TransactOp::Put {
            table: table.into(),
            record,
            condition,
        });
        self
    }

    pub fn put_if_absent(self, table: impl Into<String>, record: Record) -> Self {
        self.put(table, record, Some(Condition::NotExists))
    }

    pub fn update<I, S, F>(mut self, table: impl Into<String>, key: RecordKey, update_keys: I, reducer: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&mut Draft) -> Result<()> + Send + Sync + 'a,
    {
        self.ops.push(TransactOp::Update {
            table: table.into(),
            key,
            update_keys: update_keys.into_iter().map(Into::into).collect(),
            reducer: Box::new(reducer),
        });
        self
    }

    pub fn delete(mut self, table: impl Into<String>, key: RecordKey, condition: Option<Condition>) -> Self {
        self.ops.push(TransactOp::Delete {
            table: table.into(),
            key,
            condition,
        });
        self
    }

    pub fn check(mut self, table: impl Into<String>, key: RecordKey, condition: Condition) -> Self {
        self.ops.push(TransactOp::Check {
            table: table.into(),
            key,
            condition,
        });
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn into_ops(self) -> Vec<TransactOp<'a>> {
        self.ops
    }

    pub async fn commit(self, coordinator: &TransactionCoordinator) -> Result<()> {
        coordinator.transact(self.ops).await
    }
}
