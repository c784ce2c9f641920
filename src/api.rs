//! HTTP surface: order intake, order status lookup and quarantine replay.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use uuid::Uuid;
use crate::broker::QueueName;
use crate::domain::aggregates::{Order, OrderStatus};
use crate::domain::value_objects::OrderId;
use crate::intake::OrderIntake;
use crate::publisher::OrderPublisher;
use crate::store::{OrderStore, QuarantineEntry, QuarantineStatus, QuarantineStore, ReservationRequest};
use crate::PipelineError;

#[derive(Clone)]
pub struct AppState {
    pub intake: OrderIntake,
    pub orders: Arc<dyn OrderStore>,
    pub quarantine: Arc<dyn QuarantineStore>,
    pub publisher: OrderPublisher,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { Json(serde_json::json!({"status": "healthy", "service": "order-relay"})) }))
        .route("/api/v1/orders", post(place_order))
        .route("/api/v1/orders/:id", get(get_order))
        .route("/api/v1/quarantine", get(list_quarantine))
        .route("/api/v1/quarantine/:id/replay", post(replay_quarantined))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::InsufficientStock { .. } => StatusCode::CONFLICT,
            Self::Validation(_) | Self::InvalidPayload(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::BrokerConnectivity(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let mut body = serde_json::json!({ "error": self.to_string(), "retryable": self.is_retryable() });
        if let Self::InsufficientStock { product, .. } = &self {
            body["product"] = serde_json::Value::String(product.clone());
        }
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacedOrder {
    pub order_id: OrderId,
    pub status: OrderStatus,
}

async fn place_order(
    State(s): State<AppState>,
    Json(request): Json<ReservationRequest>,
) -> Result<(StatusCode, Json<PlacedOrder>), PipelineError> {
    let order = s.intake.place(request).await?;
    Ok((StatusCode::CREATED, Json(PlacedOrder { order_id: order.id().clone(), status: order.status() })))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderView {
    pub order_id: OrderId,
    pub status: OrderStatus,
    pub total: Decimal,
    pub currency: String,
    pub external_record_id: Option<String>,
    pub items: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Order> for OrderView {
    fn from(order: &Order) -> Self {
        Self {
            order_id: order.id().clone(),
            status: order.status(),
            total: order.total().amount(),
            currency: order.total().currency().to_string(),
            external_record_id: order.external_record_id().map(str::to_string),
            items: order.items().len(),
            created_at: order.created_at(),
            updated_at: order.updated_at(),
        }
    }
}

async fn get_order(State(s): State<AppState>, Path(id): Path<String>) -> Result<Json<OrderView>, PipelineError> {
    let id = OrderId::new(id);
    let order = s.orders.get(&id).await?.ok_or_else(|| PipelineError::NotFound(format!("order {id}")))?;
    Ok(Json(OrderView::from(&order)))
}

async fn list_quarantine(State(s): State<AppState>) -> Result<Json<Vec<QuarantineEntry>>, PipelineError> {
    Ok(Json(s.quarantine.list_pending().await?))
}

async fn replay_quarantined(State(s): State<AppState>, Path(id): Path<Uuid>) -> Result<StatusCode, PipelineError> {
    let entry = s.quarantine.get(id).await?.ok_or_else(|| PipelineError::NotFound(format!("quarantine entry {id}")))?;
    if entry.status == QuarantineStatus::Replayed {
        return Err(PipelineError::Validation(format!("quarantine entry {id} was already replayed")));
    }
    s.publisher.republish_raw(QueueName::CrmDeadLetter, entry.raw_envelope).await?;
    s.quarantine.mark_replayed(id).await?;
    tracing::info!(quarantine_id = %id, order_id = ?entry.order_id, "Quarantined CRM message replayed");
    Ok(StatusCode::ACCEPTED)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use rust_decimal::Decimal;
    use std::time::Duration;
    use tower::ServiceExt;
    use crate::broker::{Broker, InMemoryBroker, Topology};
    use crate::codec::EnvelopeCodec;
    use crate::domain::aggregates::Product;
    use crate::domain::value_objects::ProductCode;
    use crate::store::InMemoryStore;

    async fn app() -> (Router, InMemoryStore, InMemoryBroker) {
        let store = InMemoryStore::with_products([Product::create(ProductCode::new("A").unwrap(), "Alpha", Decimal::new(1000, 2), 2)]);
        let broker = InMemoryBroker::new();
        broker.declare(&Topology::standard(Duration::from_secs(60))).await.unwrap();
        let publisher = OrderPublisher::new(Arc::new(broker.clone()), EnvelopeCodec::from_passphrase("k"));
        let state = AppState {
            intake: OrderIntake::new(Arc::new(store.clone()), publisher.clone(), "EUR"),
            orders: Arc::new(store.clone()),
            quarantine: Arc::new(store.clone()),
            publisher,
        };
        (router(state), store, broker)
    }

    fn order_body(quantity: u32) -> Body {
        Body::from(serde_json::json!({
            "items": [{ "productId": "A", "quantity": quantity }],
            "customer": { "firstName": "Jan", "lastName": "Peeters", "email": "jan@example.com",
                          "street": "Kerkstraat", "houseNumber": "1", "postalCode": "2000" }
        }).to_string())
    }

    async fn json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_order(quantity: u32) -> Request<Body> {
        Request::post("/api/v1/orders").header("content-type", "application/json").body(order_body(quantity)).unwrap()
    }

    #[tokio::test]
    async fn test_accepted_order_can_be_looked_up() {
        let (app, _, broker) = app().await;
        let response = app.clone().oneshot(post_order(2)).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let body = json(response).await;
        assert_eq!(body["status"], "Pending");
        let id = body["orderId"].as_str().unwrap().to_string();

        let response = app.oneshot(Request::get(format!("/api/v1/orders/{id}")).body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json(response).await["total"], "20.00");
        assert_eq!(broker.drain(QueueName::Crm).await.len(), 1);
    }

    #[tokio::test]
    async fn test_rejections_map_to_status_codes() {
        let (app, _, broker) = app().await;
        let response = app.clone().oneshot(post_order(3)).await.unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(json(response).await["product"], "A");

        let response = app.clone().oneshot(Request::get("/api/v1/orders/nope").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        broker.set_available(false);
        let response = app.oneshot(post_order(1)).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(json(response).await["retryable"], true);
    }

    #[tokio::test]
    async fn test_replay_republishes_to_dead_letter_queue_once() {
        let (app, store, broker) = app().await;
        let entry = QuarantineEntry::new(Some("o-1".into()), b"sealed".to_vec(), "crm down");
        store.quarantine(&entry).await.unwrap();

        let listed = json(app.clone().oneshot(Request::get("/api/v1/quarantine").body(Body::empty()).unwrap()).await.unwrap()).await;
        assert_eq!(listed.as_array().unwrap().len(), 1);

        let replay = || Request::post(format!("/api/v1/quarantine/{}/replay", entry.id)).body(Body::empty()).unwrap();
        assert_eq!(app.clone().oneshot(replay()).await.unwrap().status(), StatusCode::ACCEPTED);
        assert_eq!(broker.drain(QueueName::CrmDeadLetter).await, vec![b"sealed".to_vec()]);
        assert_eq!(app.oneshot(replay()).await.unwrap().status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
