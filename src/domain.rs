//! Business entities replicated through the consensus core.
//!
//! These are the records the external transactional store persists. The
//! store itself lives behind [`crate::service::CommerceBackend`]; the types
//! here exist so commands and results are strongly typed end to end.

use serde::{Deserialize, Serialize};

/// Lifecycle of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Preparing,
    Ready,
    Delivered,
    Cancelled,
    Refunded,
}

impl OrderStatus {
    /// Statuses whose transition moves inventory (restocking), and which
    /// therefore must be sequenced through the replicated log.
    pub fn affects_inventory(&self) -> bool {
        matches!(self, OrderStatus::Cancelled | OrderStatus::Refunded)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Confirmed => "confirmed",
            OrderStatus::Preparing => "preparing",
            OrderStatus::Ready => "ready",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Refunded => "refunded",
        };
        f.write_str(s)
    }
}

/// A customer order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: u64,
    pub customer_id: u64,
    pub merchant_id: u64,
    pub total_amount: f64,
    pub status: OrderStatus,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub items: Vec<OrderItem>,
}

/// One line of an order, priced at order time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub product_id: u64,
    pub quantity: u32,
    pub price: f64,
}

impl OrderItem {
    /// Line total for this item.
    pub fn subtotal(&self) -> f64 {
        self.price * f64::from(self.quantity)
    }
}

/// A stocked ingredient belonging to a merchant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ingredient {
    #[serde(default)]
    pub id: i64,
    pub merchant_id: i64,
    pub name: String,
    pub quantity: f64,
    pub unit: String,
    #[serde(default)]
    pub low_stock_threshold: f64,
    #[serde(default)]
    pub description: String,
}

impl Ingredient {
    /// True when the remaining quantity has fallen to the reorder threshold.
    pub fn is_low_stock(&self) -> bool {
        self.quantity <= self.low_stock_threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn order_status_serializes_lowercase() {
        let json = serde_json::to_string(&OrderStatus::Cancelled).unwrap();
        assert_eq!(json, "\"cancelled\"");
        let back: OrderStatus = serde_json::from_str("\"pending\"").unwrap();
        assert_eq!(back, OrderStatus::Pending);
    }

    #[test]
    fn inventory_affecting_statuses() {
        assert!(OrderStatus::Cancelled.affects_inventory());
        assert!(OrderStatus::Refunded.affects_inventory());
        assert!(!OrderStatus::Confirmed.affects_inventory());
        assert!(!OrderStatus::Delivered.affects_inventory());
    }

    #[test]
    fn item_subtotal() {
        let item = OrderItem {
            product_id: 1,
            quantity: 2,
            price: 8.99,
        };
        assert!((item.subtotal() - 17.98).abs() < f64::EPSILON);
    }

    #[test]
    fn low_stock_detection() {
        let ing = Ingredient {
            id: 1,
            merchant_id: 1,
            name: "lime".into(),
            quantity: 3.0,
            unit: "pcs".into(),
            low_stock_threshold: 5.0,
            description: String::new(),
        };
        assert!(ing.is_low_stock());
    }
}
