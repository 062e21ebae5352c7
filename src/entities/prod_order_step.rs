use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::db::VersionedEntity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum StepStatus {
    #[sea_orm(string_value = "in_progress")]
    InProgress,
    #[sea_orm(string_value = "completed")]
    Completed,
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "prod_order_steps")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub prod_order_id: Uuid,
    pub sequence: i32,
    pub work_station_id: Uuid,
    pub output_product_id: Uuid,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub expected_quantity: Decimal,
    /// Sum of approved execution output
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub output_quantity: Decimal,
    pub status: StepStatus,
    pub version: i32,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Model {
    pub fn is_output_reached(&self, output_quantity: Decimal) -> bool {
        output_quantity >= self.expected_quantity
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::prod_order::Entity",
        from = "Column::ProdOrderId",
        to = "super::prod_order::Column::Id",
        on_delete = "Cascade"
    )]
    ProdOrder,
    #[sea_orm(has_many = "super::prod_order_step_product::Entity")]
    Materials,
    #[sea_orm(has_many = "super::prod_order_step_execution::Entity")]
    Executions,
}

impl Related<super::prod_order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ProdOrder.def()
    }
}

impl Related<super::prod_order_step_product::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Materials.def()
    }
}

impl Related<super::prod_order_step_execution::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Executions.def()
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
