use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

use crate::db::VersionedEntity;
use crate::errors::ServiceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(16))")]
pub enum SupplyOrderState {
    #[sea_orm(string_value = "created")]
    Created,
    #[sea_orm(string_value = "in_progress")]
    InProgress,
    #[sea_orm(string_value = "delivered")]
    Delivered,
    #[sea_orm(string_value = "closed")]
    Closed,
    #[sea_orm(string_value = "canceled")]
    Canceled,
    #[sea_orm(string_value = "rejected")]
    Rejected,
}

impl SupplyOrderState {
    pub fn label(self) -> &'static str {
        match self {
            SupplyOrderState::Created => "Created",
            SupplyOrderState::InProgress => "In progress",
            SupplyOrderState::Delivered => "Delivered",
            SupplyOrderState::Closed => "Closed",
            SupplyOrderState::Canceled => "Canceled",
            SupplyOrderState::Rejected => "Rejected",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SupplyOrderState::Closed | SupplyOrderState::Canceled | SupplyOrderState::Rejected
        )
    }

    /// Forward-only graph. Staying in a live state is allowed so its sub-status can change.
    pub fn can_transition_to(self, next: SupplyOrderState) -> bool {
        use SupplyOrderState::*;
        if self == next {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (Created, InProgress)
                | (Created, Canceled)
                | (Created, Rejected)
                | (InProgress, Delivered)
                | (InProgress, Canceled)
                | (InProgress, Rejected)
                | (Delivered, Closed)
        )
    }

    /// Lines and audit steps are frozen from delivery on.
    pub fn is_locked(self) -> bool {
        !matches!(self, SupplyOrderState::Created | SupplyOrderState::InProgress)
    }
}

/// Well-known sub-statuses. The column holds free text, so unknown values pass through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SupplyOrderStatus {
    SupplyDep,
    AwaitingWarehouseApproval,
    AwaitingSupplierApproval,
}

impl SupplyOrderStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SupplyOrderStatus::SupplyDep => "supply_dep",
            SupplyOrderStatus::AwaitingWarehouseApproval => "awaiting_warehouse_approval",
            SupplyOrderStatus::AwaitingSupplierApproval => "awaiting_supplier_approval",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            SupplyOrderStatus::SupplyDep => "Supply department",
            SupplyOrderStatus::AwaitingWarehouseApproval => "Awaiting warehouse approval",
            SupplyOrderStatus::AwaitingSupplierApproval => "Awaiting supplier approval",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        [
            SupplyOrderStatus::SupplyDep,
            SupplyOrderStatus::AwaitingWarehouseApproval,
            SupplyOrderStatus::AwaitingSupplierApproval,
        ]
        .into_iter()
        .find(|s| s.as_str() == value)
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "supply_orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub number: String,
    pub supplier_id: Option<Uuid>,
    pub product_category_id: Uuid,
    pub warehouse_id: Uuid,
    /// Production order waiting on this delivery
    pub prod_order_id: Option<Uuid>,
    pub state: SupplyOrderState,
    pub status: Option<String>,
    #[sea_orm(column_type = "Decimal(Some((19, 4)))")]
    pub total_price: Decimal,
    pub version: i32,
    pub created_by: Uuid,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub confirmed_by: Option<Uuid>,
    pub progressed_at: Option<DateTime<Utc>>,
    pub progressed_by: Option<Uuid>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub delivered_by: Option<Uuid>,
    pub closed_at: Option<DateTime<Utc>>,
    pub closed_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Attribute diff produced by a state/status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusChange {
    pub from_state: SupplyOrderState,
    pub from_status: Option<String>,
    pub to_state: SupplyOrderState,
    pub to_status: Option<String>,
}

impl Model {
    /// `"Label"` or `"Label: Status"`.
    pub fn display_status(&self) -> String {
        let state = self.state.label();
        match self.status.as_deref().filter(|s| !s.is_empty()) {
            None => state.to_string(),
            Some(raw) => {
                let status = SupplyOrderStatus::parse(raw).map_or(raw, |s| s.label());
                format!("{}: {}", state, status)
            }
        }
    }

    pub fn has_status(&self, state: SupplyOrderState, status: SupplyOrderStatus) -> bool {
        self.state == state && self.status.as_deref() == Some(status.as_str())
    }

    /// Validates a move to `(state, status)` and returns the diff, or `None` when nothing
    /// would change.
    pub fn plan_status_change(
        &self,
        state: SupplyOrderState,
        status: Option<&str>,
    ) -> Result<Option<StatusChange>, ServiceError> {
        let status = status.map(str::to_string);
        if self.state == state && self.status == status {
            return Ok(None);
        }
        if !self.state.can_transition_to(state) {
            return Err(ServiceError::invalid_transition(self.state, state));
        }
        Ok(Some(StatusChange {
            from_state: self.state,
            from_status: self.status.clone(),
            to_state: state,
            to_status: status,
        }))
    }
}

/// `SO-{category code}{ddmmyy}-XXXX`, the suffix taken from the order id.
pub fn supply_order_number(category_code: &str, id: Uuid, at: DateTime<Utc>) -> String {
    let simple = id.simple().to_string();
    format!(
        "SO-{}{}-{}",
        category_code.to_uppercase(),
        at.format("%d%m%y"),
        simple[..4].to_uppercase()
    )
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::supply_order_step::Entity")]
    Steps,
    #[sea_orm(has_many = "super::supply_order_product::Entity")]
    Products,
    #[sea_orm(has_many = "super::supply_order_location::Entity")]
    Locations,
}

impl Related<super::supply_order_step::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Steps.def()
    }
}

impl Related<super::supply_order_product::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Products.def()
    }
}

impl Related<super::supply_order_location::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Locations.def()
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
