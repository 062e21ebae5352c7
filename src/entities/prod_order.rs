use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::db::VersionedEntity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum OrderStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "processing")]
    Processing,
    /// Waiting for a supply order to deliver missing materials
    #[sea_orm(string_value = "blocked")]
    Blocked,
    #[sea_orm(string_value = "completed")]
    Completed,
    #[sea_orm(string_value = "approved")]
    Approved,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
}

impl OrderStatus {
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Blocked)
                | (Pending, Cancelled)
                | (Processing, Blocked)
                | (Processing, Completed)
                | (Processing, Cancelled)
                | (Blocked, Processing)
                | (Blocked, Cancelled)
                | (Completed, Approved)
                | (Completed, Cancelled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Approved | OrderStatus::Cancelled)
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "prod_orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub number: String,
    pub prod_order_group_id: Option<Uuid>,
    pub prod_template_id: Uuid,
    pub product_id: Uuid,
    pub warehouse_id: Uuid,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub quantity: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub offer_price: Decimal,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))", nullable)]
    pub total_cost: Option<Decimal>,
    pub estimated_days: Option<i64>,
    pub status: OrderStatus,
    pub current_step_id: Option<Uuid>,
    pub version: i32,
    pub created_by: Uuid,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub confirmed_by: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
    pub started_by: Option<Uuid>,
    pub completed_at: Option<DateTime<Utc>>,
    pub approved_at: Option<DateTime<Utc>>,
    pub approved_by: Option<Uuid>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancelled_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Model {
    pub fn is_started(&self) -> bool {
        self.started_at.is_some()
    }
}

/// `PO-ddmmyy-XXXX`, the suffix taken from the order id.
pub fn order_number(id: Uuid, at: DateTime<Utc>) -> String {
    let simple = id.simple().to_string();
    format!(
        "PO-{}-{}",
        at.format("%d%m%y"),
        simple[..4].to_uppercase()
    )
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::prod_order_group::Entity",
        from = "Column::ProdOrderGroupId",
        to = "super::prod_order_group::Column::Id"
    )]
    Group,
    #[sea_orm(has_many = "super::prod_order_step::Entity")]
    Steps,
}

impl Related<super::prod_order_group::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Group.def()
    }
}

impl Related<super::prod_order_step::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Steps.def()
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

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn blocked_orders_resume_or_cancel_only() {
        assert!(OrderStatus::Blocked.can_transition_to(OrderStatus::Processing));
        assert!(OrderStatus::Blocked.can_transition_to(OrderStatus::Cancelled));
        assert!(!OrderStatus::Blocked.can_transition_to(OrderStatus::Completed));
        assert!(!OrderStatus::Approved.can_transition_to(OrderStatus::Cancelled));
        assert!(!OrderStatus::Completed.can_transition_to(OrderStatus::Processing));
    }

    #[test]
    fn any_live_status_can_be_cancelled() {
        for status in [
            OrderStatus::Pending,
            OrderStatus::Processing,
            OrderStatus::Blocked,
            OrderStatus::Completed,
        ] {
            assert!(!status.is_terminal());
            assert!(status.can_transition_to(OrderStatus::Cancelled), "{:?}", status);
        }
    }

    #[test]
    fn number_uses_date_and_id_prefix() {
        let id = Uuid::parse_str("abcdef01-0000-4000-8000-000000000000").unwrap();
        let at = Utc.with_ymd_and_hms(2024, 3, 7, 10, 0, 0).unwrap();
        assert_eq!(order_number(id, at), "PO-070324-ABCD");
    }
}
