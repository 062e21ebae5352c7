use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use strum::AsRefStr;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumIter, DeriveActiveEnum,
    AsRefStr,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum RoleType {
    #[sea_orm(string_value = "production_manager")]
    ProductionManager,
    #[sea_orm(string_value = "senior_production_manager")]
    SeniorProductionManager,
    #[sea_orm(string_value = "stock_manager")]
    StockManager,
    #[sea_orm(string_value = "supply_manager")]
    SupplyManager,
    #[sea_orm(string_value = "senior_supply_manager")]
    SeniorSupplyManager,
    #[sea_orm(string_value = "work_station_worker")]
    WorkStationWorker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum TaskAction {
    #[sea_orm(string_value = "check")]
    Check,
    #[sea_orm(string_value = "confirm")]
    Confirm,
    #[sea_orm(string_value = "approve")]
    Approve,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(32))")]
pub enum RelatedType {
    #[sea_orm(string_value = "prod_order")]
    ProdOrder,
    #[sea_orm(string_value = "prod_order_step_execution")]
    Execution,
    #[sea_orm(string_value = "supply_order")]
    SupplyOrder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum TaskStatus {
    #[sea_orm(string_value = "open")]
    Open,
    #[sea_orm(string_value = "done")]
    Done,
}

/// Work item addressed to everyone holding `role`.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "tasks")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub role: RoleType,
    pub related_type: RelatedType,
    pub related_id: Uuid,
    pub action: TaskAction,
    pub comment: String,
    pub status: TaskStatus,
    pub completed_at: Option<DateTime<Utc>>,
    pub completed_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
