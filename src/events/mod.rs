use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::entities::{
    inventory_transaction::TransactionType,
    prod_order::OrderStatus,
    supply_order::SupplyOrderState,
};

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event, waiting for channel capacity
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }

    /// Sends an event without waiting; a full or closed channel is logged and the event dropped.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.sender.try_send(event) {
            warn!("Dropping domain event: {}", e);
        }
    }
}

/// Domain events emitted after a state change commits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    StockMoved {
        product_id: Uuid,
        warehouse_id: Uuid,
        transaction_type: TransactionType,
        quantity: Decimal,
    },
    ProdOrderCreated {
        order_id: Uuid,
        template_id: Uuid,
        quantity: Decimal,
    },
    ProdOrderStatusChanged {
        order_id: Uuid,
        old_status: OrderStatus,
        new_status: OrderStatus,
    },
    ProdOrderStepCompleted {
        order_id: Uuid,
        step_id: Uuid,
        next_step_id: Option<Uuid>,
    },
    MaterialReserved {
        step_id: Uuid,
        product_id: Uuid,
        available_quantity: Decimal,
        shortfall: Decimal,
    },
    ExecutionCreated {
        execution_id: Uuid,
        step_id: Uuid,
    },
    ExecutionApproved {
        execution_id: Uuid,
        step_id: Uuid,
        output_quantity: Decimal,
    },
    ExecutionDeclined {
        execution_id: Uuid,
        step_id: Uuid,
    },
    SupplyOrderCreated {
        supply_order_id: Uuid,
        prod_order_id: Option<Uuid>,
    },
    SupplyOrderStatusChanged {
        supply_order_id: Uuid,
        from: SupplyOrderState,
        to: SupplyOrderState,
        status: Option<String>,
    },
    SupplyOrderClosed {
        supply_order_id: Uuid,
        prod_order_id: Option<Uuid>,
    },
}

/// Drains the event channel, logging each event until every sender is dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::ProdOrderStatusChanged {
                order_id,
                old_status,
                new_status,
            } => {
                info!(%order_id, ?old_status, ?new_status, "Prod order status changed");
            }
            Event::SupplyOrderClosed {
                supply_order_id,
                prod_order_id,
            } => {
                info!(%supply_order_id, ?prod_order_id, "Supply order closed");
            }
            other => info!("Received event: {:?}", other),
        }
    }

    info!("Event processing loop finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_or_log_drops_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let sender = EventSender::new(tx);
        let first = Event::ExecutionCreated {
            execution_id: Uuid::new_v4(),
            step_id: Uuid::new_v4(),
        };

        sender.send_or_log(first.clone()).await;
        sender
            .send_or_log(Event::SupplyOrderClosed {
                supply_order_id: Uuid::new_v4(),
                prod_order_id: None,
            })
            .await;

        assert_eq!(rx.recv().await, Some(first));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_fails_once_receiver_is_gone() {
        let (tx, rx) = mpsc::channel(4);
        drop(rx);
        let sender = EventSender::new(tx);
        let result = sender
            .send(Event::SupplyOrderCreated {
                supply_order_id: Uuid::new_v4(),
                prod_order_id: None,
            })
            .await;
        assert!(result.is_err());
    }
}
