//! The replicated application adapter.
//!
//! Sits between the business surface and the Raft node: wraps domain
//! operations into [`Command`]s, submits them, and parks the caller on a
//! per-index one-shot slot until the apply pipeline reports the outcome.
//!
//! # Apply pipeline
//!
//! A single task consumes the node's apply channel in strict index order.
//! For each committed entry it checks the node's role *at apply time*: only
//! the leader executes the backend call, because the backing store is one
//! shared database of record and running the side effect on every replica
//! would duplicate it. Followers advance past the entry without touching
//! the store. The consequences of this model are laid out in DESIGN.md.
//!
//! # Result slots
//!
//! `perform` learns its log index only when `submit` returns, so the apply
//! pipeline may finish before the waiter registers. The slot map therefore
//! holds either a parked waiter or an already-computed outcome, whichever
//! side arrives first; a janitor evicts slots that nobody ever claims
//! (timeouts, crashed callers).

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::constants::{JANITOR_INTERVAL, RESULT_SLOT_LIMIT, RESULT_SLOT_TTL};
use crate::domain::{Ingredient, Order, OrderItem, OrderStatus};
use crate::error::{Error, Result};
use crate::raft::{Command, LogEntry, RaftNode};

use super::backend::CommerceBackend;

/// What applying a command produced.
#[derive(Debug)]
pub enum ApplyOutcome {
    /// The order created at this index.
    Order(Order),
    /// The ingredient created or updated at this index.
    Ingredient(Ingredient),
    /// The command succeeded without producing an entity.
    Acked,
}

enum Slot {
    /// A caller is parked on this index.
    Waiting(oneshot::Sender<Result<ApplyOutcome>>, Instant),
    /// The outcome arrived before the caller registered.
    Ready(Result<ApplyOutcome>, Instant),
}

/// Index-keyed rendezvous between `perform` and the apply pipeline.
#[derive(Default)]
struct ResultSlots {
    slots: DashMap<u64, Slot>,
}

impl ResultSlots {
    /// Park a waiter on `index`, or consume an outcome that already landed.
    fn claim(&self, index: u64) -> oneshot::Receiver<Result<ApplyOutcome>> {
        let (tx, rx) = oneshot::channel();
        match self.slots.remove(&index) {
            Some((_, Slot::Ready(result, _))) => {
                let _ = tx.send(result);
            }
            Some((_, slot @ Slot::Waiting(..))) => {
                // Two waiters on one index cannot happen (submit returns each
                // index once); keep the first, serve the second nothing.
                self.slots.insert(index, slot);
                drop(tx);
            }
            None => {
                self.slots.insert(index, Slot::Waiting(tx, Instant::now()));
            }
        }
        rx
    }

    /// Deliver an outcome for `index` to its waiter, or stash it.
    fn complete(&self, index: u64, result: Result<ApplyOutcome>) {
        match self.slots.remove(&index) {
            Some((_, Slot::Waiting(tx, _))) => {
                // A dropped receiver means the caller gave up; that is fine.
                let _ = tx.send(result);
            }
            _ => {
                self.slots.insert(index, Slot::Ready(result, Instant::now()));
            }
        }
    }

    /// Drop the waiter parked on `index`, if any (timeout path).
    fn abandon(&self, index: u64) {
        if let Some((_, slot)) = self.slots.remove(&index) {
            if let Slot::Ready(..) = slot {
                // The outcome landed while we timed out; keep it for the
                // janitor rather than resurrecting the waiter.
                self.slots.insert(index, slot);
            }
        }
    }

    /// Evict stale slots: anything older than the TTL, and whole-map
    /// pressure beyond the cardinality bound.
    fn sweep(&self) {
        let now = Instant::now();
        self.slots.retain(|_, slot| {
            let at = match slot {
                Slot::Waiting(_, at) => *at,
                Slot::Ready(_, at) => *at,
            };
            now.duration_since(at) < RESULT_SLOT_TTL
        });

        if self.slots.len() > RESULT_SLOT_LIMIT {
            warn!(occupancy = self.slots.len(), "result slots over limit, clearing");
            self.slots.clear();
        }
    }

    fn len(&self) -> usize {
        self.slots.len()
    }
}

/// Orders and inventory, replicated through consensus.
pub struct ReplicatedCommerce {
    node: Arc<RaftNode>,
    backend: Arc<dyn CommerceBackend>,
    slots: Arc<ResultSlots>,
    perform_timeout: Duration,
}

impl ReplicatedCommerce {
    pub fn new(
        node: Arc<RaftNode>,
        backend: Arc<dyn CommerceBackend>,
        perform_timeout: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            node,
            backend,
            slots: Arc::new(ResultSlots::default()),
            perform_timeout,
        })
    }

    /// Spawn the apply pipeline and the slot janitor.
    pub fn start(self: &Arc<Self>, apply_rx: mpsc::Receiver<LogEntry>) {
        let adapter = Arc::clone(self);
        tokio::spawn(async move { adapter.apply_pipeline(apply_rx).await });

        let adapter = Arc::clone(self);
        tokio::spawn(async move { adapter.janitor().await });
    }

    /// Handle to the underlying node (status introspection).
    pub fn node(&self) -> &Arc<RaftNode> {
        &self.node
    }

    /// Submit a command and wait for it to be committed and applied here.
    ///
    /// On `Timeout` the entry may still commit later; the caller must treat
    /// the outcome as unknown rather than retrying blindly.
    pub async fn perform(&self, command: Command) -> Result<ApplyOutcome> {
        let index = self.node.submit(command)?;
        let rx = self.slots.claim(index);

        match tokio::time::timeout(self.perform_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Cancelled),
            Err(_) => {
                self.slots.abandon(index);
                Err(Error::Timeout)
            }
        }
    }

    // ------------------------------------------------------------------
    // Domain operations
    // ------------------------------------------------------------------

    /// Create an order through consensus and return the stored record.
    pub async fn create_order(
        &self,
        customer_id: u64,
        merchant_id: u64,
        items: Vec<OrderItem>,
        notes: String,
    ) -> Result<Order> {
        let outcome = self
            .perform(Command::CreateOrder {
                customer_id,
                merchant_id,
                items,
                notes,
            })
            .await?;
        match outcome {
            ApplyOutcome::Order(order) => Ok(order),
            other => Err(Error::Apply(format!(
                "create_order produced unexpected outcome {other:?}"
            ))),
        }
    }

    /// Update an order's status. Transitions that move inventory are
    /// sequenced through the log; the rest go straight to the store.
    pub async fn update_order_status(&self, order_id: u64, status: OrderStatus) -> Result<()> {
        if status.affects_inventory() {
            self.perform(Command::UpdateOrderStatus { order_id, status })
                .await?;
            Ok(())
        } else {
            self.backend.update_order_status(order_id, status).await
        }
    }

    /// Update an order's status and/or notes.
    pub async fn update_order(
        &self,
        order_id: u64,
        status: Option<OrderStatus>,
        notes: Option<String>,
    ) -> Result<()> {
        if status.map(|s| s.affects_inventory()).unwrap_or(false) {
            self.perform(Command::UpdateOrder {
                order_id,
                status,
                notes,
            })
            .await?;
            Ok(())
        } else {
            self.backend
                .update_order(order_id, status, notes.as_deref())
                .await
        }
    }

    /// Create an ingredient through consensus and return the stored record.
    pub async fn create_ingredient(&self, ingredient: Ingredient) -> Result<Ingredient> {
        let outcome = self
            .perform(Command::CreateIngredient { ingredient })
            .await?;
        match outcome {
            ApplyOutcome::Ingredient(ingredient) => Ok(ingredient),
            other => Err(Error::Apply(format!(
                "create_ingredient produced unexpected outcome {other:?}"
            ))),
        }
    }

    pub async fn update_ingredient(&self, ingredient: Ingredient) -> Result<()> {
        self.perform(Command::UpdateIngredient { ingredient })
            .await?;
        Ok(())
    }

    pub async fn delete_ingredient(&self, ingredient_id: i64) -> Result<()> {
        self.perform(Command::DeleteIngredient { ingredient_id })
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Apply pipeline
    // ------------------------------------------------------------------

    async fn apply_pipeline(self: Arc<Self>, mut apply_rx: mpsc::Receiver<LogEntry>) {
        let mut shutdown_rx = self.node.subscribe_shutdown();

        loop {
            let entry = tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!(node_id = %self.node.id(), "apply pipeline shutting down");
                    return;
                }
                entry = apply_rx.recv() => match entry {
                    Some(entry) => entry,
                    None => return,
                },
            };

            let Some(command) = entry.command.clone() else {
                continue;
            };

            // Side effects run on the leader only: the backing store is
            // shared, and the leader already executed (or will execute)
            // this entry against it.
            if !self.node.is_leader() {
                debug!(
                    node_id = %self.node.id(),
                    index = entry.index,
                    kind = command.kind(),
                    "follower replica, side effects skipped"
                );
                continue;
            }

            debug!(
                node_id = %self.node.id(),
                index = entry.index,
                term = entry.term,
                kind = command.kind(),
                "applying committed command"
            );

            let outcome = self.execute(command).await;
            if let Err(e) = &outcome {
                warn!(node_id = %self.node.id(), index = entry.index, error = %e, "apply failed");
            }
            self.slots.complete(entry.index, outcome);
        }
    }

    async fn execute(&self, command: Command) -> Result<ApplyOutcome> {
        match command {
            Command::CreateOrder {
                customer_id,
                merchant_id,
                items,
                notes,
            } => {
                let order = self
                    .backend
                    .create_order(customer_id, merchant_id, &items, &notes)
                    .await?;
                Ok(ApplyOutcome::Order(order))
            }
            Command::UpdateOrderStatus { order_id, status } => {
                self.backend.update_order_status(order_id, status).await?;
                Ok(ApplyOutcome::Acked)
            }
            Command::UpdateOrder {
                order_id,
                status,
                notes,
            } => {
                self.backend
                    .update_order(order_id, status, notes.as_deref())
                    .await?;
                Ok(ApplyOutcome::Acked)
            }
            Command::CreateIngredient { ingredient } => {
                let created = self.backend.create_ingredient(&ingredient).await?;
                Ok(ApplyOutcome::Ingredient(created))
            }
            Command::UpdateIngredient { ingredient } => {
                self.backend.update_ingredient(&ingredient).await?;
                Ok(ApplyOutcome::Acked)
            }
            Command::DeleteIngredient { ingredient_id } => {
                self.backend.delete_ingredient(ingredient_id).await?;
                Ok(ApplyOutcome::Acked)
            }
        }
    }

    async fn janitor(self: Arc<Self>) {
        let mut shutdown_rx = self.node.subscribe_shutdown();
        let mut ticker = tokio::time::interval(JANITOR_INTERVAL);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => return,
                _ = ticker.tick() => {
                    let before = self.slots.len();
                    self.slots.sweep();
                    let after = self.slots.len();
                    if after < before {
                        debug!(evicted = before - after, "result slots swept");
                    }
                }
            }
        }
    }
}
