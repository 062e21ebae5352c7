use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::db::VersionedEntity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum ExecutionStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "approved")]
    Approved,
    #[sea_orm(string_value = "declined")]
    Declined,
}

/// Who signs an execution off, in chain order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApprovalStage {
    ProductionManager,
    SeniorProductionManager,
    /// Final approval; commits the execution to the step totals
    StockManager,
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "prod_order_step_executions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub prod_order_step_id: Uuid,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub output_quantity: Decimal,
    pub notes: Option<String>,
    pub status: ExecutionStatus,
    pub executed_by: Uuid,
    pub prod_manager_approved_at: Option<DateTime<Utc>>,
    pub prod_manager_approved_by: Option<Uuid>,
    pub senior_prod_manager_approved_at: Option<DateTime<Utc>>,
    pub senior_prod_manager_approved_by: Option<Uuid>,
    pub approved_at: Option<DateTime<Utc>>,
    pub approved_by: Option<Uuid>,
    pub declined_at: Option<DateTime<Utc>>,
    pub declined_by: Option<Uuid>,
    pub decline_comment: Option<String>,
    pub version: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Model {
    pub fn stage_approved_at(&self, stage: ApprovalStage) -> Option<DateTime<Utc>> {
        match stage {
            ApprovalStage::ProductionManager => self.prod_manager_approved_at,
            ApprovalStage::SeniorProductionManager => self.senior_prod_manager_approved_at,
            ApprovalStage::StockManager => self.approved_at,
        }
    }
}

impl ActiveModel {
    /// Stamps `stage` as approved by `actor_id`.
    pub fn stamp_approval(&mut self, stage: ApprovalStage, actor_id: Uuid, at: DateTime<Utc>) {
        use sea_orm::ActiveValue::Set;
        match stage {
            ApprovalStage::ProductionManager => {
                self.prod_manager_approved_at = Set(Some(at));
                self.prod_manager_approved_by = Set(Some(actor_id));
            }
            ApprovalStage::SeniorProductionManager => {
                self.senior_prod_manager_approved_at = Set(Some(at));
                self.senior_prod_manager_approved_by = Set(Some(actor_id));
            }
            ApprovalStage::StockManager => {
                self.approved_at = Set(Some(at));
                self.approved_by = Set(Some(actor_id));
            }
        }
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::prod_order_step::Entity",
        from = "Column::ProdOrderStepId",
        to = "super::prod_order_step::Column::Id",
        on_delete = "Cascade"
    )]
    Step,
    #[sea_orm(has_many = "super::prod_order_step_execution_product::Entity")]
    Materials,
}

impl Related<super::prod_order_step::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Step.def()
    }
}

impl Related<super::prod_order_step_execution_product::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Materials.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl VersionedEntity for Entity {
    fn id_column() -> Column {
        Column::Id
    }

    fn version_column() -> Column {
        Column::Version
    }
}
