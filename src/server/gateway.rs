//! Business HTTP gateway.
//!
//! Every node runs one of these. Requests outside the reserved prefixes
//! (`/health`, `/raft`) are subject to the redirection policy: the leader
//! handles them locally, a follower that knows the leader answers
//! `307 Temporary Redirect` with a `Location` on the leader's business
//! address (method, path, and query preserved by the redirect semantics),
//! and a follower with no leader answers `503 {"error":"leader unknown"}`.
//!
//! Only the replicated operations are served here; plain catalog CRUD,
//! authentication, and the rest of the storefront belong to the
//! collaborating services and are not this gateway's concern.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::domain::{Ingredient, OrderItem, OrderStatus};
use crate::error::{Error, Result};
use crate::raft::{ClusterCoordinator, RouteDecision};
use crate::service::ReplicatedCommerce;

use super::http::{self, Request};

#[derive(Debug, Deserialize)]
struct CreateOrderBody {
    customer_id: u64,
    merchant_id: u64,
    #[serde(default)]
    items: Vec<OrderItem>,
    #[serde(default)]
    notes: String,
}

#[derive(Debug, Deserialize)]
struct UpdateStatusBody {
    status: OrderStatus,
}

#[derive(Debug, Deserialize)]
struct UpdateOrderBody {
    #[serde(default)]
    status: Option<OrderStatus>,
    #[serde(default)]
    notes: Option<String>,
}

/// The node-local business server.
pub struct BusinessGateway {
    commerce: Arc<ReplicatedCommerce>,
    coordinator: Arc<ClusterCoordinator>,
    listen_addr: String,
}

impl BusinessGateway {
    pub fn new(
        commerce: Arc<ReplicatedCommerce>,
        coordinator: Arc<ClusterCoordinator>,
        listen_addr: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            commerce,
            coordinator,
            listen_addr,
        })
    }

    /// Bind and spawn the accept loop. Returns the bound address, which
    /// matters when the configured port is 0.
    pub async fn start(self: &Arc<Self>) -> Result<std::net::SocketAddr> {
        let listener = TcpListener::bind(&self.listen_addr).await?;
        let addr = listener.local_addr()?;
        info!(addr = %addr, "business gateway listening");

        let gateway = Arc::clone(self);
        tokio::spawn(async move { gateway.accept_loop(listener).await });
        Ok(addr)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown_rx = self.commerce.node().subscribe_shutdown();
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("business gateway shutting down");
                    return;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let gateway = Arc::clone(&self);
                            tokio::spawn(async move {
                                gateway.handle_connection(stream).await;
                            });
                        }
                        Err(e) => warn!(error = %e, "gateway accept failed"),
                    }
                }
            }
        }
    }

    async fn handle_connection(&self, mut stream: TcpStream) {
        let request = match http::read_request(&mut stream).await {
            Ok(request) => request,
            Err(e) => {
                debug!(error = %e, "unreadable gateway request");
                return;
            }
        };

        let outcome = match self.coordinator.route(request.path()) {
            RouteDecision::Local => self.dispatch(&mut stream, &request).await,
            RouteDecision::Redirect(leader_addr) => {
                let location = format!("http://{leader_addr}{}", request.target);
                debug!(target = %request.target, location = %location, "redirecting to leader");
                http::respond_redirect(&mut stream, &location).await
            }
            RouteDecision::Unavailable => {
                http::respond_json(&mut stream, 503, &json!({"error": "leader unknown"})).await
            }
        };

        if let Err(e) = outcome {
            debug!(error = %e, "failed to write gateway response");
        }
    }

    async fn dispatch(&self, stream: &mut TcpStream, request: &Request) -> std::io::Result<()> {
        if request.path().starts_with("/health") {
            return http::respond_text(stream, 200, "status: healthy\n").await;
        }

        let segments: Vec<&str> = request.path().trim_matches('/').split('/').collect();
        let result = match (request.method.as_str(), segments.as_slice()) {
            ("POST", ["api", "orders"]) => self.create_order(request).await,
            ("PUT", ["api", "orders", id, "status"]) => self.update_status(request, id).await,
            ("PUT", ["api", "orders", id]) => self.update_order(request, id).await,
            ("POST", ["api", "ingredients"]) => self.create_ingredient(request).await,
            ("PUT", ["api", "ingredients", id]) => self.update_ingredient(request, id).await,
            ("DELETE", ["api", "ingredients", id]) => self.delete_ingredient(id).await,
            _ => {
                return http::respond_json(stream, 404, &json!({"error": "not found"})).await;
            }
        };

        match result {
            Ok((status, body)) => http::respond_json(stream, status, &body).await,
            Err(e) => {
                let status = error_status(&e);
                http::respond_json(stream, status, &json!({"error": e.to_string()})).await
            }
        }
    }

    async fn create_order(&self, request: &Request) -> Result<(u16, serde_json::Value)> {
        let body: CreateOrderBody = serde_json::from_slice(&request.body)?;
        let order = self
            .commerce
            .create_order(body.customer_id, body.merchant_id, body.items, body.notes)
            .await?;
        Ok((201, serde_json::to_value(order)?))
    }

    async fn update_status(&self, request: &Request, id: &str) -> Result<(u16, serde_json::Value)> {
        let order_id = parse_id(id)?;
        let body: UpdateStatusBody = serde_json::from_slice(&request.body)?;
        self.commerce.update_order_status(order_id, body.status).await?;
        Ok((200, json!({"order_id": order_id, "status": body.status})))
    }

    async fn update_order(&self, request: &Request, id: &str) -> Result<(u16, serde_json::Value)> {
        let order_id = parse_id(id)?;
        let body: UpdateOrderBody = serde_json::from_slice(&request.body)?;
        self.commerce
            .update_order(order_id, body.status, body.notes)
            .await?;
        Ok((200, json!({"order_id": order_id})))
    }

    async fn create_ingredient(&self, request: &Request) -> Result<(u16, serde_json::Value)> {
        let ingredient: Ingredient = serde_json::from_slice(&request.body)?;
        let created = self.commerce.create_ingredient(ingredient).await?;
        Ok((201, serde_json::to_value(created)?))
    }

    async fn update_ingredient(
        &self,
        request: &Request,
        id: &str,
    ) -> Result<(u16, serde_json::Value)> {
        let mut ingredient: Ingredient = serde_json::from_slice(&request.body)?;
        ingredient.id = parse_id(id)? as i64;
        self.commerce.update_ingredient(ingredient).await?;
        Ok((200, json!({"updated": true})))
    }

    async fn delete_ingredient(&self, id: &str) -> Result<(u16, serde_json::Value)> {
        let ingredient_id = parse_id(id)? as i64;
        self.commerce.delete_ingredient(ingredient_id).await?;
        Ok((200, json!({"deleted": true})))
    }
}

fn parse_id(raw: &str) -> Result<u64> {
    // A malformed id is a malformed request, same status as a bad body.
    let id = serde_json::from_str(raw)?;
    Ok(id)
}

/// Map adapter errors onto HTTP statuses.
fn error_status(error: &Error) -> u16 {
    match error {
        Error::NotLeader { .. } => 503,
        Error::Timeout => 504,
        Error::Serde(_) => 400,
        Error::UnknownCommand(_) => 400,
        Error::Cancelled => 503,
        _ => 500,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_parsing() {
        assert_eq!(parse_id("42").unwrap(), 42);
        assert!(parse_id("forty-two").is_err());
    }

    #[test]
    fn error_statuses() {
        assert_eq!(error_status(&Error::NotLeader { leader_hint: None }), 503);
        assert_eq!(error_status(&Error::Timeout), 504);
        assert_eq!(
            error_status(&Error::Apply("store exploded".into())),
            500
        );
    }

    #[test]
    fn create_order_body_decodes() {
        let body: CreateOrderBody = serde_json::from_str(
            r#"{"customer_id":1,"merchant_id":1,"items":[{"product_id":1,"quantity":2,"price":8.99}],"notes":"x"}"#,
        )
        .unwrap();
        assert_eq!(body.customer_id, 1);
        assert_eq!(body.items.len(), 1);
    }

    #[test]
    fn update_order_body_fields_optional() {
        let body: UpdateOrderBody = serde_json::from_str(r#"{"notes":"late"}"#).unwrap();
        assert!(body.status.is_none());
        assert_eq!(body.notes.as_deref(), Some("late"));
    }
}
