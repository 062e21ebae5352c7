use crate::{
    db::{self, DbPool},
    entities::task::{self, Entity as Task, RelatedType, RoleType, TaskAction, TaskStatus},
    errors::ServiceError,
    notifications::{NotificationError, RelatedEntity, TaskQueue},
};
use async_trait::async_trait;
use chrono::Utc;
use metrics::counter;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;

/// Task queue persisting one `tasks` row per role.
#[derive(Clone)]
pub struct DbTaskQueue {
    db: Arc<DbPool>,
}

impl DbTaskQueue {
    pub fn new(db: Arc<DbPool>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl TaskQueue for DbTaskQueue {
    async fn create_task_for_roles(
        &self,
        roles: Vec<RoleType>,
        related: RelatedEntity,
        action: TaskAction,
        comment: String,
    ) -> Result<(), NotificationError> {
        let db = &*self.db;
        let txn = db
            .begin()
            .await
            .map_err(|e| NotificationError::TaskQueue(e.to_string()))?;

        let now = Utc::now();
        for role in &roles {
            task::ActiveModel {
                id: Set(Uuid::new_v4()),
                role: Set(*role),
                related_type: Set(related.related_type),
                related_id: Set(related.id),
                action: Set(action),
                comment: Set(comment.clone()),
                status: Set(TaskStatus::Open),
                completed_at: Set(None),
                completed_by: Set(None),
                created_at: Set(now),
            }
            .insert(&txn)
            .await
            .map_err(|e| NotificationError::TaskQueue(e.to_string()))?;
        }

        txn.commit()
            .await
            .map_err(|e| NotificationError::TaskQueue(e.to_string()))?;

        counter!("prodflow.tasks.created", roles.len() as u64);
        info!(
            roles = ?roles.iter().map(|r| r.as_ref()).collect::<Vec<_>>(),
            related_id = %related.id,
            ?action,
            "Tasks created"
        );
        Ok(())
    }

    async fn resolve_tasks(
        &self,
        related: RelatedEntity,
        action: TaskAction,
        actor_id: Uuid,
    ) -> Result<u64, NotificationError> {
        let result = Task::update_many()
            .col_expr(task::Column::Status, Expr::value(TaskStatus::Done))
            .col_expr(task::Column::CompletedAt, Expr::value(Some(Utc::now())))
            .col_expr(task::Column::CompletedBy, Expr::value(Some(actor_id)))
            .filter(task::Column::RelatedType.eq(related.related_type))
            .filter(task::Column::RelatedId.eq(related.id))
            .filter(task::Column::Action.eq(action))
            .filter(task::Column::Status.eq(TaskStatus::Open))
            .exec(&*self.db)
            .await
            .map_err(|e| NotificationError::TaskQueue(e.to_string()))?;

        counter!("prodflow.tasks.completed", result.rows_affected);
        Ok(result.rows_affected)
    }
}

/// Read and close tasks created through [`DbTaskQueue`].
#[derive(Clone)]
pub struct TaskService {
    db: Arc<DbPool>,
}

impl TaskService {
    pub fn new(db: Arc<DbPool>) -> Self {
        Self { db }
    }

    #[instrument(skip(self))]
    pub async fn open_for_role(&self, role: RoleType) -> Result<Vec<task::Model>, ServiceError> {
        Task::find()
            .filter(task::Column::Role.eq(role))
            .filter(task::Column::Status.eq(TaskStatus::Open))
            .order_by_asc(task::Column::CreatedAt)
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)
    }

    #[instrument(skip(self))]
    pub async fn for_related(
        &self,
        related_type: RelatedType,
        related_id: Uuid,
    ) -> Result<Vec<task::Model>, ServiceError> {
        Task::find()
            .filter(task::Column::RelatedType.eq(related_type))
            .filter(task::Column::RelatedId.eq(related_id))
            .order_by_asc(task::Column::CreatedAt)
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)
    }

    /// Marks the task done. Completing a done task returns it unchanged.
    #[instrument(skip(self))]
    pub async fn complete_task(
        &self,
        task_id: Uuid,
        actor_id: Uuid,
    ) -> Result<task::Model, ServiceError> {
        let db = &*self.db;
        let existing: task::Model = db::find_required::<_, Task>(db, task_id, "Task").await?;
        if existing.status == TaskStatus::Done {
            return Ok(existing);
        }

        let updated = task::ActiveModel {
            id: Set(task_id),
            status: Set(TaskStatus::Done),
            completed_at: Set(Some(Utc::now())),
            completed_by: Set(Some(actor_id)),
            ..Default::default()
        }
        .update(db)
        .await
        .map_err(ServiceError::db_error)?;

        counter!("prodflow.tasks.completed", 1);
        info!(%task_id, %actor_id, "Task completed");
        Ok(updated)
    }
}
