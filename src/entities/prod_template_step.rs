use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "prod_template_steps")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub prod_template_id: Uuid,
    pub sequence: i32,
    pub work_station_id: Uuid,
    pub output_product_id: Uuid,
    /// Output per unit of ordered quantity
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub expected_quantity: Decimal,
    pub is_last: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::prod_template::Entity",
        from = "Column::ProdTemplateId",
        to = "super::prod_template::Column::Id",
        on_delete = "Cascade"
    )]
    Template,
    #[sea_orm(has_many = "super::prod_template_step_product::Entity")]
    Materials,
}

impl Related<super::prod_template::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Template.def()
    }
}

impl Related<super::prod_template_step_product::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Materials.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
