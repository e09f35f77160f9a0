//! Seam to the external transactional store.
//!
//! The relational store that actually persists orders and inventory is an
//! external collaborator; the consensus core only ever touches it through
//! [`CommerceBackend`]. The store is shared by every replica and is the
//! single point of truth, which is why the apply pipeline executes these
//! calls on the leader only.
//!
//! [`InMemoryBackend`] implements the same contract over process-local
//! maps, for tests and single-process demos.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::domain::{Ingredient, Order, OrderItem, OrderStatus};
use crate::error::{Error, Result};

/// The application operations a committed command can trigger.
#[async_trait]
pub trait CommerceBackend: Send + Sync {
    /// Create an order and deduct its ingredients from inventory.
    async fn create_order(
        &self,
        customer_id: u64,
        merchant_id: u64,
        items: &[OrderItem],
        notes: &str,
    ) -> Result<Order>;

    /// Move an order to `status`, restocking inventory when appropriate.
    async fn update_order_status(&self, order_id: u64, status: OrderStatus) -> Result<()>;

    /// Update status and/or notes of an order.
    async fn update_order(
        &self,
        order_id: u64,
        status: Option<OrderStatus>,
        notes: Option<&str>,
    ) -> Result<()>;

    async fn create_ingredient(&self, ingredient: &Ingredient) -> Result<Ingredient>;

    async fn update_ingredient(&self, ingredient: &Ingredient) -> Result<()>;

    async fn delete_ingredient(&self, ingredient_id: i64) -> Result<()>;
}

/// Process-local backend used by tests and demos.
#[derive(Default)]
pub struct InMemoryBackend {
    orders: DashMap<u64, Order>,
    ingredients: DashMap<i64, Ingredient>,
    next_order_id: AtomicU64,
    next_ingredient_id: AtomicI64,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            next_order_id: AtomicU64::new(1),
            next_ingredient_id: AtomicI64::new(1),
            ..Self::default()
        }
    }

    pub fn order(&self, id: u64) -> Option<Order> {
        self.orders.get(&id).map(|o| o.clone())
    }

    pub fn ingredient(&self, id: i64) -> Option<Ingredient> {
        self.ingredients.get(&id).map(|i| i.clone())
    }

    pub fn order_count(&self) -> usize {
        self.orders.len()
    }
}

#[async_trait]
impl CommerceBackend for InMemoryBackend {
    async fn create_order(
        &self,
        customer_id: u64,
        merchant_id: u64,
        items: &[OrderItem],
        notes: &str,
    ) -> Result<Order> {
        let id = self.next_order_id.fetch_add(1, Ordering::SeqCst);
        let order = Order {
            id,
            customer_id,
            merchant_id,
            total_amount: items.iter().map(OrderItem::subtotal).sum(),
            status: OrderStatus::Pending,
            notes: notes.to_string(),
            items: items.to_vec(),
        };
        self.orders.insert(id, order.clone());
        Ok(order)
    }

    async fn update_order_status(&self, order_id: u64, status: OrderStatus) -> Result<()> {
        let mut order = self
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| Error::Apply(format!("order {order_id} not found")))?;
        order.status = status;
        Ok(())
    }

    async fn update_order(
        &self,
        order_id: u64,
        status: Option<OrderStatus>,
        notes: Option<&str>,
    ) -> Result<()> {
        let mut order = self
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| Error::Apply(format!("order {order_id} not found")))?;
        if let Some(status) = status {
            order.status = status;
        }
        if let Some(notes) = notes {
            order.notes = notes.to_string();
        }
        Ok(())
    }

    async fn create_ingredient(&self, ingredient: &Ingredient) -> Result<Ingredient> {
        let mut created = ingredient.clone();
        if created.id == 0 {
            created.id = self.next_ingredient_id.fetch_add(1, Ordering::SeqCst);
        }
        self.ingredients.insert(created.id, created.clone());
        Ok(created)
    }

    async fn update_ingredient(&self, ingredient: &Ingredient) -> Result<()> {
        if !self.ingredients.contains_key(&ingredient.id) {
            return Err(Error::Apply(format!(
                "ingredient {} not found",
                ingredient.id
            )));
        }
        self.ingredients.insert(ingredient.id, ingredient.clone());
        Ok(())
    }

    async fn delete_ingredient(&self, ingredient_id: i64) -> Result<()> {
        self.ingredients
            .remove(&ingredient_id)
            .map(|_| ())
            .ok_or_else(|| Error::Apply(format!("ingredient {ingredient_id} not found")))
    }
}
