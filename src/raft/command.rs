//! Replicated commands.
//!
//! Commands are the inputs to the replicated application: every mutation
//! that must stay consistent across replicas is encoded as one of these
//! variants, appended to the log, and applied in commit order. The tagged
//! representation (`"type"` discriminator, payload fields flat beside it)
//! is also the persisted and admin-visible shape of a log entry's payload.

use serde::{Deserialize, Serialize};

use crate::domain::{Ingredient, OrderItem, OrderStatus};

/// A mutation routed through consensus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Create an order and deduct its ingredients from inventory.
    CreateOrder {
        customer_id: u64,
        merchant_id: u64,
        items: Vec<OrderItem>,
        #[serde(default)]
        notes: String,
    },

    /// Move an order to a new status (restocks inventory on cancellation).
    UpdateOrderStatus { order_id: u64, status: OrderStatus },

    /// Update an order's status and/or notes in one step.
    UpdateOrder {
        order_id: u64,
        #[serde(default)]
        status: Option<OrderStatus>,
        #[serde(default)]
        notes: Option<String>,
    },

    /// Add an ingredient to a merchant's inventory.
    CreateIngredient { ingredient: Ingredient },

    /// Replace an ingredient record.
    UpdateIngredient { ingredient: Ingredient },

    /// Remove an ingredient from inventory.
    DeleteIngredient { ingredient_id: i64 },
}

impl Command {
    /// The wire tag of this command, as it appears in serialized form and
    /// in the admin log projection.
    pub fn kind(&self) -> &'static str {
        match self {
            Command::CreateOrder { .. } => "create_order",
            Command::UpdateOrderStatus { .. } => "update_order_status",
            Command::UpdateOrder { .. } => "update_order",
            Command::CreateIngredient { .. } => "create_ingredient",
            Command::UpdateIngredient { .. } => "update_ingredient",
            Command::DeleteIngredient { .. } => "delete_ingredient",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_order_command() -> Command {
        Command::CreateOrder {
            customer_id: 1,
            merchant_id: 1,
            items: vec![OrderItem {
                product_id: 1,
                quantity: 2,
                price: 8.99,
            }],
            notes: "x".to_string(),
        }
    }

    #[test]
    fn create_order_serializes_with_type_tag() {
        let json = serde_json::to_value(sample_order_command()).unwrap();
        assert_eq!(json["type"], "create_order");
        assert_eq!(json["customer_id"], 1);
        assert_eq!(json["items"][0]["price"], 8.99);
    }

    #[test]
    fn kind_matches_serialized_tag() {
        let commands = [
            sample_order_command(),
            Command::UpdateOrderStatus {
                order_id: 7,
                status: OrderStatus::Cancelled,
            },
            Command::UpdateOrder {
                order_id: 7,
                status: None,
                notes: Some("late".into()),
            },
            Command::DeleteIngredient { ingredient_id: 3 },
        ];
        for cmd in commands {
            let json = serde_json::to_value(&cmd).unwrap();
            assert_eq!(json["type"], cmd.kind());
        }
    }

    #[test]
    fn round_trips_through_json() {
        let cmd = Command::UpdateOrderStatus {
            order_id: 42,
            status: OrderStatus::Refunded,
        };
        let json = serde_json::to_string(&cmd).unwrap();
        let back: Command = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cmd);
    }

    #[test]
    fn unknown_tag_fails_to_decode() {
        let err = serde_json::from_str::<Command>(r#"{"type":"drop_everything"}"#);
        assert!(err.is_err());
    }
}
