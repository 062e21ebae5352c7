use async_trait::async_trait;
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::entities::task::{RelatedType, RoleType, TaskAction};

/// What happened, from the point of view of whoever is notified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationEvent {
    ProdOrderCreated,
    /// Status of a production order moved
    ProdOrderChanged,
    /// A blocked production order got its materials and can continue
    ProdOrderReady,
    /// A worker reported progress on a step
    ExecutionCreated,
    ExecutionDeclined,
    WorkStationAssigned,
    SupplyOrderCreated,
    SupplyOrderChanged,
    /// Delivered goods were taken into stock
    SupplyOrderClosed,
    /// Delivered quantities differ from the supply order
    SupplyOrderMismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recipient {
    Role(RoleType),
    User(Uuid),
    /// Every worker attached to the station
    WorkStation(Uuid),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelatedEntity {
    pub related_type: RelatedType,
    pub id: Uuid,
}

impl RelatedEntity {
    pub fn prod_order(id: Uuid) -> Self {
        Self {
            related_type: RelatedType::ProdOrder,
            id,
        }
    }

    pub fn execution(id: Uuid) -> Self {
        Self {
            related_type: RelatedType::Execution,
            id,
        }
    }

    pub fn supply_order(id: Uuid) -> Self {
        Self {
            related_type: RelatedType::SupplyOrder,
            id,
        }
    }
}

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("Delivery failed: {0}")]
    Delivery(String),
    #[error("Task queue error: {0}")]
    TaskQueue(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Outbound notification channel (chat bot, mail, push).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        event: NotificationEvent,
        recipients: Vec<Recipient>,
        payload: serde_json::Value,
    ) -> Result<(), NotificationError>;
}

/// Creates work items for everyone holding one of `roles`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn create_task_for_roles(
        &self,
        roles: Vec<RoleType>,
        related: RelatedEntity,
        action: TaskAction,
        comment: String,
    ) -> Result<(), NotificationError>;

    /// Closes open `action` tasks about `related`, returning how many were closed.
    async fn resolve_tasks(
        &self,
        related: RelatedEntity,
        action: TaskAction,
        actor_id: Uuid,
    ) -> Result<u64, NotificationError>;
}

/// Notifier that only writes to the log.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(
        &self,
        event: NotificationEvent,
        recipients: Vec<Recipient>,
        payload: serde_json::Value,
    ) -> Result<(), NotificationError> {
        info!(?event, ?recipients, %payload, "Notification");
        Ok(())
    }
}

/// Post-commit side effects. Failures are logged and counted, never returned.
#[derive(Clone)]
pub struct Hooks {
    notifier: Arc<dyn Notifier>,
    tasks: Arc<dyn TaskQueue>,
}

impl Hooks {
    pub fn new(notifier: Arc<dyn Notifier>, tasks: Arc<dyn TaskQueue>) -> Self {
        Self { notifier, tasks }
    }

    pub async fn notify(
        &self,
        event: NotificationEvent,
        recipients: Vec<Recipient>,
        payload: serde_json::Value,
    ) {
        if let Err(e) = self.notifier.notify(event, recipients, payload).await {
            counter!("prodflow.hooks.notify_failed", 1);
            warn!(?event, error = %e, "Notification failed");
        }
    }

    pub async fn create_task(
        &self,
        roles: Vec<RoleType>,
        related: RelatedEntity,
        action: TaskAction,
        comment: impl Into<String>,
    ) {
        if let Err(e) = self
            .tasks
            .create_task_for_roles(roles, related, action, comment.into())
            .await
        {
            counter!("prodflow.hooks.task_failed", 1);
            warn!(related_id = %related.id, error = %e, "Task creation failed");
        }
    }

    pub async fn resolve_tasks(&self, related: RelatedEntity, action: TaskAction, actor_id: Uuid) {
        match self.tasks.resolve_tasks(related, action, actor_id).await {
            Ok(0) => {}
            Ok(closed) => info!(related_id = %related.id, ?action, closed, "Tasks resolved"),
            Err(e) => {
                counter!("prodflow.hooks.task_failed", 1);
                warn!(related_id = %related.id, error = %e, "Task resolution failed");
            }
        }
    }
}
