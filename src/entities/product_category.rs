use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Unit a category's products are counted in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum MeasureUnit {
    #[sea_orm(string_value = "pcs")]
    Pcs,
    #[sea_orm(string_value = "kg")]
    Kg,
    #[sea_orm(string_value = "gram")]
    Gram,
    #[sea_orm(string_value = "meter")]
    Meter,
    #[sea_orm(string_value = "centimeter")]
    Centimeter,
    #[sea_orm(string_value = "millimeter")]
    Millimeter,
    #[sea_orm(string_value = "liter")]
    Liter,
    #[sea_orm(string_value = "milliliter")]
    Milliliter,
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "product_categories")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub name: String,
    pub code: String,
    pub measure_unit: MeasureUnit,
    pub created_at: DateTime<Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::product::Entity")]
    Products,
}

impl Related<super::product::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Products.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
