use chrono::{DateTime, NaiveDate, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum ProdOrderGroupType {
    /// Produced against a customer order
    #[sea_orm(string_value = "by_order")]
    ByOrder,
    /// Produced for the catalog
    #[sea_orm(string_value = "by_catalog")]
    ByCatalog,
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "prod_order_groups")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub group_type: ProdOrderGroupType,
    pub warehouse_id: Uuid,
    pub agent_id: Option<Uuid>,
    pub deadline: Option<NaiveDate>,
    pub created_by: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::prod_order::Entity")]
    ProdOrders,
}

impl Related<super::prod_order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ProdOrders.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
