use crate::{
    db::{self, DbPool},
    entities::{
        prod_order::{self, Entity as ProdOrder, OrderStatus},
        product::{self, Entity as Product},
        product_category::{self, Entity as ProductCategory},
        supply_order::{
            self, Entity as SupplyOrder, StatusChange, SupplyOrderState, SupplyOrderStatus,
        },
        supply_order_location::{self, Entity as SupplyOrderLocation},
        supply_order_product::{self, Entity as SupplyOrderProduct},
        supply_order_step::{self, Entity as SupplyOrderStep},
        task::{RoleType, TaskAction},
    },
    errors::{InsufficientAsset, ServiceError},
    events::{Event, EventSender},
    notifications::{Hooks, NotificationEvent, Recipient, RelatedEntity},
};
use super::{
    inventory::{InventoryService, StockMovement, TransactionLinks},
    prod_orders::ProdOrderService,
    validate_non_negative_decimal, validate_positive_decimal,
};
use chrono::Utc;
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, ModelTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NewSupplyLine {
    pub product_id: Uuid,
    #[validate(custom = "validate_positive_decimal")]
    pub expected_quantity: Decimal,
    /// Line total
    #[validate(custom = "validate_non_negative_decimal")]
    pub price: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NewSupplyOrder {
    pub product_category_id: Uuid,
    pub warehouse_id: Uuid,
    pub supplier_id: Option<Uuid>,
    pub prod_order_id: Option<Uuid>,
    #[validate]
    pub products: Vec<NewSupplyLine>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ActualQuantity {
    pub product_id: Uuid,
    #[validate(custom = "validate_non_negative_decimal")]
    pub actual_quantity: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct SupplyOrderDetails {
    pub order: supply_order::Model,
    pub products: Vec<supply_order_product::Model>,
    /// Newest first
    pub steps: Vec<supply_order_step::Model>,
    /// Newest first
    pub locations: Vec<supply_order_location::Model>,
}

impl SupplyOrderDetails {
    pub fn product(&self, product_id: Uuid) -> Option<&supply_order_product::Model> {
        self.products.iter().find(|p| p.product_id == product_id)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ComparisonOutcome {
    pub order: supply_order::Model,
    /// Every delivered quantity matched the expected one
    pub matched: bool,
    pub closed: bool,
}

/// What closing did to the linked production order.
#[derive(Debug, Clone, Copy, Default)]
struct CloseEffects {
    resumed_prod_order: Option<Uuid>,
}

/// Supply orders raised for missing materials, from creation to delivery into stock.
#[derive(Clone)]
pub struct SupplyOrderService {
    db: Arc<DbPool>,
    prod_orders: ProdOrderService,
    hooks: Hooks,
    event_sender: Option<EventSender>,
}

impl SupplyOrderService {
    pub fn new(
        db: Arc<DbPool>,
        prod_orders: ProdOrderService,
        hooks: Hooks,
        event_sender: Option<EventSender>,
    ) -> Self {
        Self {
            db,
            prod_orders,
            hooks,
            event_sender,
        }
    }

    #[instrument(skip(self))]
    pub async fn create(
        &self,
        request: NewSupplyOrder,
        actor_id: Uuid,
    ) -> Result<SupplyOrderDetails, ServiceError> {
        request.validate()?;
        let db = &*self.db;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        if let Some(prod_order_id) = request.prod_order_id {
            db::find_required::<_, ProdOrder>(&txn, prod_order_id, "Prod order").await?;
        }
        let order = Self::create_in(&txn, &request, None, actor_id).await?;

        txn.commit().await.map_err(ServiceError::db_error)?;

        counter!("prodflow.supply_orders.created", 1);
        self.emit(vec![Event::SupplyOrderCreated {
            supply_order_id: order.id,
            prod_order_id: order.prod_order_id,
        }])
        .await;
        Self::announce_created(&self.hooks, &order).await;
        info!(supply_order_id = %order.id, number = %order.number, "Supply order created");

        self.get_order(order.id).await
    }

    /// One supply order per product category covering `shortfalls`, linked to `prod_order`.
    pub(crate) async fn spawn_for_shortfalls_in<C: ConnectionTrait>(
        conn: &C,
        prod_order: &prod_order::Model,
        shortfalls: &[InsufficientAsset],
        actor_id: Uuid,
    ) -> Result<Vec<supply_order::Model>, ServiceError> {
        let mut by_category: BTreeMap<Uuid, Vec<NewSupplyLine>> = BTreeMap::new();
        for shortfall in shortfalls {
            by_category
                .entry(shortfall.product_category_id)
                .or_default()
                .push(NewSupplyLine {
                    product_id: shortfall.product_id,
                    expected_quantity: shortfall.missing_quantity,
                    price: Decimal::ZERO,
                });
        }

        let mut orders = Vec::with_capacity(by_category.len());
        for (category_id, products) in by_category {
            let request = NewSupplyOrder {
                product_category_id: category_id,
                warehouse_id: prod_order.warehouse_id,
                supplier_id: None,
                prod_order_id: Some(prod_order.id),
                products,
            };
            let order = Self::create_in(
                conn,
                &request,
                Some(SupplyOrderStatus::SupplyDep.as_str()),
                actor_id,
            )
            .await?;
            info!(
                supply_order_id = %order.id,
                prod_order_id = %prod_order.id,
                %category_id,
                "Supply order spawned for shortfall"
            );
            orders.push(order);
        }

        if !orders.is_empty() {
            counter!("prodflow.supply_orders.spawned", orders.len() as u64);
        }
        Ok(orders)
    }

    async fn create_in<C: ConnectionTrait>(
        conn: &C,
        request: &NewSupplyOrder,
        status: Option<&str>,
        actor_id: Uuid,
    ) -> Result<supply_order::Model, ServiceError> {
        let category: product_category::Model = db::find_required::<_, ProductCategory>(
            conn,
            request.product_category_id,
            "Product category",
        )
        .await?;

        let mut seen = HashSet::new();
        for line in &request.products {
            if !seen.insert(line.product_id) {
                return Err(ServiceError::ValidationError(format!(
                    "Product {} listed twice",
                    line.product_id
                )));
            }
            Self::ensure_in_category(conn, line.product_id, category.id).await?;
        }

        let now = Utc::now();
        let id = Uuid::new_v4();
        let total_price = request.products.iter().map(|l| l.price).sum();
        let order = supply_order::ActiveModel {
            id: Set(id),
            number: Set(supply_order::supply_order_number(&category.code, id, now)),
            supplier_id: Set(request.supplier_id),
            product_category_id: Set(category.id),
            warehouse_id: Set(request.warehouse_id),
            prod_order_id: Set(request.prod_order_id),
            state: Set(SupplyOrderState::Created),
            status: Set(status.map(str::to_string)),
            total_price: Set(total_price),
            version: Set(0),
            created_by: Set(actor_id),
            confirmed_at: Set(None),
            confirmed_by: Set(None),
            progressed_at: Set(None),
            progressed_by: Set(None),
            delivered_at: Set(None),
            delivered_by: Set(None),
            closed_at: Set(None),
            closed_by: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(conn)
        .await
        .map_err(ServiceError::db_error)?;

        Self::record_step_in(conn, order.id, order.state, order.status.clone(), actor_id).await?;

        for line in &request.products {
            supply_order_product::ActiveModel {
                id: Set(Uuid::new_v4()),
                supply_order_id: Set(order.id),
                product_id: Set(line.product_id),
                expected_quantity: Set(line.expected_quantity),
                actual_quantity: Set(None),
                price: Set(line.price),
            }
            .insert(conn)
            .await
            .map_err(ServiceError::db_error)?;
        }

        Ok(order)
    }

    /// Moves the order to `(state, status)`. Returns the applied diff, `None` if nothing changed.
    #[instrument(skip(self))]
    pub async fn change_status(
        &self,
        order_id: Uuid,
        state: SupplyOrderState,
        status: Option<String>,
        actor_id: Uuid,
    ) -> Result<Option<StatusChange>, ServiceError> {
        if state == SupplyOrderState::Closed {
            return Err(ServiceError::InvalidOperation(
                "Supply orders are closed through close_order".to_string(),
            ));
        }

        let db = &*self.db;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;
        let order: supply_order::Model =
            db::find_locked::<_, SupplyOrder>(&txn, order_id, "Supply order").await?;

        let Some(change) = order.plan_status_change(state, status.as_deref())? else {
            return Ok(None);
        };
        Self::apply_change_in(&txn, &order, &change, actor_id).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        self.emit(vec![status_changed(order_id, &change)]).await;
        self.notify_changed(order_id).await;
        info!(
            %order_id,
            from = ?change.from_state,
            to = ?change.to_state,
            status = ?change.to_status,
            "Supply order status changed"
        );
        Ok(Some(change))
    }

    /// Writes a planned change with its timestamps and audit row.
    async fn apply_change_in<C: ConnectionTrait>(
        conn: &C,
        order: &supply_order::Model,
        change: &StatusChange,
        actor_id: Uuid,
    ) -> Result<supply_order::Model, ServiceError> {
        let now = Utc::now();
        let mut active = supply_order::ActiveModel {
            state: Set(change.to_state),
            status: Set(change.to_status.clone()),
            updated_at: Set(now),
            ..Default::default()
        };
        if change.from_state != change.to_state {
            match change.to_state {
                SupplyOrderState::InProgress => {
                    active.progressed_at = Set(Some(now));
                    active.progressed_by = Set(Some(actor_id));
                }
                SupplyOrderState::Delivered => {
                    active.delivered_at = Set(Some(now));
                    active.delivered_by = Set(Some(actor_id));
                }
                SupplyOrderState::Closed => {
                    active.closed_at = Set(Some(now));
                    active.closed_by = Set(Some(actor_id));
                }
                _ => {}
            }
        }

        db::update_versioned(conn, active, order.id, order.version).await?;
        Self::record_step_in(
            conn,
            order.id,
            change.to_state,
            change.to_status.clone(),
            actor_id,
        )
        .await?;

        counter!("prodflow.supply_orders.status_changed", 1);
        db::find_required::<_, SupplyOrder>(conn, order.id, "Supply order").await
    }

    async fn record_step_in<C: ConnectionTrait>(
        conn: &C,
        order_id: Uuid,
        state: SupplyOrderState,
        status: Option<String>,
        actor_id: Uuid,
    ) -> Result<(), ServiceError> {
        supply_order_step::ActiveModel {
            id: Set(Uuid::new_v4()),
            supply_order_id: Set(order_id),
            state: Set(state),
            status: Set(status),
            created_by: Set(actor_id),
            created_at: Set(Utc::now()),
        }
        .insert(conn)
        .await
        .map_err(ServiceError::db_error)?;
        Ok(())
    }

    /// Stamps the order as confirmed. Confirming twice keeps the first stamp.
    #[instrument(skip(self))]
    pub async fn confirm(
        &self,
        order_id: Uuid,
        actor_id: Uuid,
    ) -> Result<supply_order::Model, ServiceError> {
        let db = &*self.db;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;
        let order: supply_order::Model =
            db::find_locked::<_, SupplyOrder>(&txn, order_id, "Supply order").await?;
        if order.confirmed_at.is_some() {
            return Ok(order);
        }
        if order.state.is_terminal() {
            return Err(ServiceError::ImmutableOrder(order_id));
        }

        let now = Utc::now();
        db::update_versioned(
            &txn,
            supply_order::ActiveModel {
                confirmed_at: Set(Some(now)),
                confirmed_by: Set(Some(actor_id)),
                updated_at: Set(now),
                ..Default::default()
            },
            order.id,
            order.version,
        )
        .await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        let confirmed: supply_order::Model =
            db::find_required::<_, SupplyOrder>(db, order_id, "Supply order").await?;
        self.notify(NotificationEvent::SupplyOrderChanged, &confirmed).await;
        info!(%order_id, %actor_id, "Supply order confirmed");
        Ok(confirmed)
    }

    #[instrument(skip(self))]
    pub async fn set_supplier(
        &self,
        order_id: Uuid,
        supplier_id: Uuid,
        actor_id: Uuid,
    ) -> Result<supply_order::Model, ServiceError> {
        let db = &*self.db;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;
        let order = Self::mutable_order_in(&txn, order_id).await?;

        db::update_versioned(
            &txn,
            supply_order::ActiveModel {
                supplier_id: Set(Some(supplier_id)),
                updated_at: Set(Utc::now()),
                ..Default::default()
            },
            order.id,
            order.version,
        )
        .await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        let updated: supply_order::Model =
            db::find_required::<_, SupplyOrder>(db, order_id, "Supply order").await?;
        self.notify(NotificationEvent::SupplyOrderChanged, &updated).await;
        info!(%order_id, %supplier_id, %actor_id, "Supply order supplier set");
        Ok(updated)
    }

    #[instrument(skip(self))]
    pub async fn add_product(
        &self,
        order_id: Uuid,
        line: NewSupplyLine,
        actor_id: Uuid,
    ) -> Result<supply_order_product::Model, ServiceError> {
        line.validate()?;
        let db = &*self.db;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;
        let order = Self::mutable_order_in(&txn, order_id).await?;

        if Self::line_in(&txn, order_id, line.product_id).await?.is_some() {
            return Err(ServiceError::ValidationError(format!(
                "Product {} is already on supply order {}",
                line.product_id, order_id
            )));
        }
        Self::ensure_in_category(&txn, line.product_id, order.product_category_id).await?;

        let row = supply_order_product::ActiveModel {
            id: Set(Uuid::new_v4()),
            supply_order_id: Set(order_id),
            product_id: Set(line.product_id),
            expected_quantity: Set(line.expected_quantity),
            actual_quantity: Set(None),
            price: Set(line.price),
        }
        .insert(&txn)
        .await
        .map_err(ServiceError::db_error)?;
        Self::refresh_total_in(&txn, &order).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(%order_id, product_id = %row.product_id, %actor_id, "Supply order line added");
        Ok(row)
    }

    #[instrument(skip(self))]
    pub async fn update_product(
        &self,
        order_id: Uuid,
        line: NewSupplyLine,
        actor_id: Uuid,
    ) -> Result<supply_order_product::Model, ServiceError> {
        line.validate()?;
        let db = &*self.db;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;
        let order = Self::mutable_order_in(&txn, order_id).await?;

        let existing = Self::line_in(&txn, order_id, line.product_id)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!(
                    "Product {} is not on supply order {}",
                    line.product_id, order_id
                ))
            })?;
        let row = supply_order_product::ActiveModel {
            id: Set(existing.id),
            expected_quantity: Set(line.expected_quantity),
            price: Set(line.price),
            ..Default::default()
        }
        .update(&txn)
        .await
        .map_err(ServiceError::db_error)?;
        Self::refresh_total_in(&txn, &order).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(%order_id, product_id = %row.product_id, %actor_id, "Supply order line updated");
        Ok(row)
    }

    #[instrument(skip(self))]
    pub async fn remove_product(
        &self,
        order_id: Uuid,
        product_id: Uuid,
        actor_id: Uuid,
    ) -> Result<(), ServiceError> {
        let db = &*self.db;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;
        let order = Self::mutable_order_in(&txn, order_id).await?;

        let existing = Self::line_in(&txn, order_id, product_id)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!(
                    "Product {} is not on supply order {}",
                    product_id, order_id
                ))
            })?;
        existing
            .delete(&txn)
            .await
            .map_err(ServiceError::db_error)?;
        Self::refresh_total_in(&txn, &order).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(%order_id, %product_id, %actor_id, "Supply order line removed");
        Ok(())
    }

    /// Records where the delivery currently is. Allowed until the order is closed.
    #[instrument(skip(self))]
    pub async fn add_location(
        &self,
        order_id: Uuid,
        location: String,
        actor_id: Uuid,
    ) -> Result<supply_order_location::Model, ServiceError> {
        let location = location.trim().to_string();
        if location.is_empty() || location.len() > 255 {
            return Err(ServiceError::ValidationError(
                "Location must be 1 to 255 characters".to_string(),
            ));
        }

        let db = &*self.db;
        let order: supply_order::Model =
            db::find_required::<_, SupplyOrder>(db, order_id, "Supply order").await?;
        if order.state == SupplyOrderState::Closed {
            return Err(ServiceError::ImmutableOrder(order_id));
        }

        let row = supply_order_location::ActiveModel {
            id: Set(Uuid::new_v4()),
            supply_order_id: Set(order_id),
            location: Set(location),
            created_by: Set(actor_id),
            created_at: Set(Utc::now()),
        }
        .insert(db)
        .await
        .map_err(ServiceError::db_error)?;
        Ok(row)
    }

    /// Records delivered quantities. A full match moves the order to warehouse approval and,
    /// with a supplier set, closes it; any difference goes back to the supplier.
    #[instrument(skip(self))]
    pub async fn compare_products(
        &self,
        order_id: Uuid,
        actuals: Vec<ActualQuantity>,
        actor_id: Uuid,
    ) -> Result<ComparisonOutcome, ServiceError> {
        for actual in &actuals {
            actual.validate()?;
        }

        let db = &*self.db;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;
        let order: supply_order::Model =
            db::find_locked::<_, SupplyOrder>(&txn, order_id, "Supply order").await?;
        if !matches!(
            order.state,
            SupplyOrderState::InProgress | SupplyOrderState::Delivered
        ) {
            return Err(ServiceError::InvalidOperation(format!(
                "Supply order {} cannot be compared while {}",
                order_id,
                order.display_status()
            )));
        }

        let lines = Self::lines_in(&txn, order_id).await?;
        if let Some(unknown) = actuals
            .iter()
            .find(|a| !lines.iter().any(|l| l.product_id == a.product_id))
        {
            return Err(ServiceError::ValidationError(format!(
                "Product {} is not on supply order {}",
                unknown.product_id, order_id
            )));
        }

        let mut matched = true;
        for line in &lines {
            // Lines missing from the count were not delivered.
            let actual = actuals
                .iter()
                .find(|a| a.product_id == line.product_id)
                .map_or(Decimal::ZERO, |a| a.actual_quantity);
            if actual != line.expected_quantity {
                matched = false;
            }
            supply_order_product::ActiveModel {
                id: Set(line.id),
                actual_quantity: Set(Some(actual)),
                ..Default::default()
            }
            .update(&txn)
            .await
            .map_err(ServiceError::db_error)?;
        }

        let status = if matched {
            SupplyOrderStatus::AwaitingWarehouseApproval
        } else {
            SupplyOrderStatus::AwaitingSupplierApproval
        };
        let mut events = Vec::new();
        let mut current = order.clone();
        let mut changed = false;
        if let Some(change) =
            order.plan_status_change(SupplyOrderState::Delivered, Some(status.as_str()))?
        {
            current = Self::apply_change_in(&txn, &order, &change, actor_id).await?;
            events.push(status_changed(order_id, &change));
            changed = true;
        }

        let mut effects = CloseEffects::default();
        let closed = matched && current.supplier_id.is_some();
        if closed {
            effects = Self::close_in(&txn, &current, actor_id, &mut events).await?;
        }
        txn.commit().await.map_err(ServiceError::db_error)?;

        counter!("prodflow.supply_orders.compared", 1);
        self.emit(events).await;
        if !matched {
            counter!("prodflow.supply_orders.mismatched", 1);
            self.hooks
                .notify(
                    NotificationEvent::SupplyOrderMismatch,
                    vec![Recipient::Role(RoleType::SupplyManager)],
                    json!({ "supply_order_id": order_id, "number": order.number }),
                )
                .await;
            self.hooks
                .create_task(
                    vec![RoleType::SupplyManager],
                    RelatedEntity::supply_order(order_id),
                    TaskAction::Check,
                    "Supply order compared. There are some differences in quantities.",
                )
                .await;
        }
        let compared: supply_order::Model =
            db::find_required::<_, SupplyOrder>(db, order_id, "Supply order").await?;
        if closed {
            self.notify(NotificationEvent::SupplyOrderClosed, &compared).await;
        } else if changed {
            self.notify(NotificationEvent::SupplyOrderChanged, &compared).await;
        }
        self.after_close(effects).await;
        info!(%order_id, matched, closed, "Supply order compared");

        Ok(ComparisonOutcome {
            order: compared,
            matched,
            closed,
        })
    }

    /// The supplier agreed to the delivered quantities; hands the order to the warehouse.
    #[instrument(skip(self))]
    pub async fn accept_actual_quantities(
        &self,
        order_id: Uuid,
        actor_id: Uuid,
    ) -> Result<StatusChange, ServiceError> {
        let db = &*self.db;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;
        let order: supply_order::Model =
            db::find_locked::<_, SupplyOrder>(&txn, order_id, "Supply order").await?;
        if !order.has_status(
            SupplyOrderState::Delivered,
            SupplyOrderStatus::AwaitingSupplierApproval,
        ) {
            return Err(ServiceError::InvalidOperation(format!(
                "Supply order {} is {}, not awaiting supplier approval",
                order_id,
                order.display_status()
            )));
        }

        let change = order
            .plan_status_change(
                SupplyOrderState::Delivered,
                Some(SupplyOrderStatus::AwaitingWarehouseApproval.as_str()),
            )?
            .ok_or_else(|| {
                ServiceError::InvalidOperation(format!("Supply order {} is unchanged", order_id))
            })?;
        Self::apply_change_in(&txn, &order, &change, actor_id).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        self.emit(vec![status_changed(order_id, &change)]).await;
        self.hooks
            .create_task(
                vec![RoleType::StockManager],
                RelatedEntity::supply_order(order_id),
                TaskAction::Confirm,
                "Supplier accepted delivered quantities",
            )
            .await;
        self.notify_changed(order_id).await;
        info!(%order_id, "Supplier accepted delivered quantities");
        Ok(change)
    }

    #[instrument(skip(self))]
    pub async fn is_ready_for_close(&self, order_id: Uuid) -> Result<bool, ServiceError> {
        let db = &*self.db;
        let order: supply_order::Model =
            db::find_required::<_, SupplyOrder>(db, order_id, "Supply order").await?;
        let lines = Self::lines_in(db, order_id).await?;
        Ok(ready_for_close(&order, &lines))
    }

    /// Puts delivered quantities into stock, unblocks the waiting production order and closes.
    #[instrument(skip(self))]
    pub async fn close_order(
        &self,
        order_id: Uuid,
        actor_id: Uuid,
    ) -> Result<supply_order::Model, ServiceError> {
        let db = &*self.db;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;
        let order: supply_order::Model =
            db::find_locked::<_, SupplyOrder>(&txn, order_id, "Supply order").await?;
        if order.state == SupplyOrderState::Closed {
            return Ok(order);
        }

        let mut events = Vec::new();
        let effects = Self::close_in(&txn, &order, actor_id, &mut events).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        self.emit(events).await;
        let closed: supply_order::Model =
            db::find_required::<_, SupplyOrder>(db, order_id, "Supply order").await?;
        self.notify(NotificationEvent::SupplyOrderClosed, &closed).await;
        self.after_close(effects).await;
        info!(%order_id, "Supply order closed");
        Ok(closed)
    }

    async fn close_in<C: ConnectionTrait>(
        conn: &C,
        order: &supply_order::Model,
        actor_id: Uuid,
        events: &mut Vec<Event>,
    ) -> Result<CloseEffects, ServiceError> {
        let lines = Self::lines_in(conn, order.id).await?;
        if !ready_for_close(order, &lines) {
            return Err(ServiceError::InvalidOperation(format!(
                "Supply order {} is not ready for close ({})",
                order.id,
                order.display_status()
            )));
        }
        let Some(supplier_id) = order.supplier_id else {
            return Err(ServiceError::ValidationError(
                "Supplier is not set".to_string(),
            ));
        };

        let links = TransactionLinks {
            supplier_id: Some(supplier_id),
            supply_order_id: Some(order.id),
            prod_order_id: order.prod_order_id,
            ..Default::default()
        };
        for line in &lines {
            let actual = line.actual_quantity.unwrap_or(Decimal::ZERO);
            if actual <= Decimal::ZERO {
                continue;
            }
            let movement = StockMovement::new(line.product_id, order.warehouse_id, actual)
                .with_cost(line.price)
                .linked(links)
                .by(actor_id);
            InventoryService::add_stock_in(conn, &movement).await?;
        }

        let mut effects = CloseEffects::default();
        if let Some(prod_order_id) = order.prod_order_id {
            let prod_order: prod_order::Model =
                db::find_locked::<_, ProdOrder>(conn, prod_order_id, "Prod order").await?;
            if prod_order.status == OrderStatus::Blocked {
                let status =
                    ProdOrderService::resume_blocked_in(conn, &prod_order, actor_id, events)
                        .await?;
                if status == OrderStatus::Processing {
                    effects.resumed_prod_order = Some(prod_order_id);
                }
            }
        }

        let change = order
            .plan_status_change(SupplyOrderState::Closed, order.status.as_deref())?
            .ok_or_else(|| ServiceError::invalid_transition(order.state, SupplyOrderState::Closed))?;
        Self::apply_change_in(conn, order, &change, actor_id).await?;

        counter!("prodflow.supply_orders.closed", 1);
        events.push(status_changed(order.id, &change));
        events.push(Event::SupplyOrderClosed {
            supply_order_id: order.id,
            prod_order_id: order.prod_order_id,
        });
        Ok(effects)
    }

    async fn after_close(&self, effects: CloseEffects) {
        let Some(prod_order_id) = effects.resumed_prod_order else {
            return;
        };
        info!(%prod_order_id, "Prod order resumed after delivery");
        if let Err(e) = self.prod_orders.notify_prod_order_ready(prod_order_id).await {
            warn!(%prod_order_id, error = %e, "Could not announce resumed prod order");
        }
    }

    #[instrument(skip(self))]
    pub async fn get_order(&self, order_id: Uuid) -> Result<SupplyOrderDetails, ServiceError> {
        let db = &*self.db;
        let order: supply_order::Model =
            db::find_required::<_, SupplyOrder>(db, order_id, "Supply order").await?;
        let products = Self::lines_in(db, order_id).await?;
        let steps = SupplyOrderStep::find()
            .filter(supply_order_step::Column::SupplyOrderId.eq(order_id))
            .order_by_desc(supply_order_step::Column::CreatedAt)
            .order_by_desc(supply_order_step::Column::Id)
            .all(db)
            .await
            .map_err(ServiceError::db_error)?;
        let locations = SupplyOrderLocation::find()
            .filter(supply_order_location::Column::SupplyOrderId.eq(order_id))
            .order_by_desc(supply_order_location::Column::CreatedAt)
            .order_by_desc(supply_order_location::Column::Id)
            .all(db)
            .await
            .map_err(ServiceError::db_error)?;

        Ok(SupplyOrderDetails {
            order,
            products,
            steps,
            locations,
        })
    }

    /// Supply orders raised for a production order.
    #[instrument(skip(self))]
    pub async fn for_prod_order(
        &self,
        prod_order_id: Uuid,
    ) -> Result<Vec<supply_order::Model>, ServiceError> {
        SupplyOrder::find()
            .filter(supply_order::Column::ProdOrderId.eq(prod_order_id))
            .order_by_asc(supply_order::Column::CreatedAt)
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)
    }

    async fn mutable_order_in<C: ConnectionTrait>(
        conn: &C,
        order_id: Uuid,
    ) -> Result<supply_order::Model, ServiceError> {
        let order: supply_order::Model =
            db::find_locked::<_, SupplyOrder>(conn, order_id, "Supply order").await?;
        if order.state.is_locked() {
            return Err(ServiceError::ImmutableOrder(order_id));
        }
        Ok(order)
    }

    async fn ensure_in_category<C: ConnectionTrait>(
        conn: &C,
        product_id: Uuid,
        category_id: Uuid,
    ) -> Result<(), ServiceError> {
        let product: product::Model =
            db::find_required::<_, Product>(conn, product_id, "Product").await?;
        if product.product_category_id != category_id {
            return Err(ServiceError::ValidationError(format!(
                "Product {} is not in category {}",
                product_id, category_id
            )));
        }
        Ok(())
    }

    async fn lines_in<C: ConnectionTrait>(
        conn: &C,
        order_id: Uuid,
    ) -> Result<Vec<supply_order_product::Model>, ServiceError> {
        SupplyOrderProduct::find()
            .filter(supply_order_product::Column::SupplyOrderId.eq(order_id))
            .all(conn)
            .await
            .map_err(ServiceError::db_error)
    }

    async fn line_in<C: ConnectionTrait>(
        conn: &C,
        order_id: Uuid,
        product_id: Uuid,
    ) -> Result<Option<supply_order_product::Model>, ServiceError> {
        SupplyOrderProduct::find()
            .filter(supply_order_product::Column::SupplyOrderId.eq(order_id))
            .filter(supply_order_product::Column::ProductId.eq(product_id))
            .one(conn)
            .await
            .map_err(ServiceError::db_error)
    }

    async fn refresh_total_in<C: ConnectionTrait>(
        conn: &C,
        order: &supply_order::Model,
    ) -> Result<(), ServiceError> {
        let total: Decimal = Self::lines_in(conn, order.id)
            .await?
            .iter()
            .map(|l| l.price)
            .sum();
        db::update_versioned(
            conn,
            supply_order::ActiveModel {
                total_price: Set(total),
                updated_at: Set(Utc::now()),
                ..Default::default()
            },
            order.id,
            order.version,
        )
        .await
    }

    /// Tells supply managers about a new order and leaves them a task to check it.
    pub(crate) async fn announce_created(hooks: &Hooks, order: &supply_order::Model) {
        hooks
            .notify(
                NotificationEvent::SupplyOrderCreated,
                recipients_for(NotificationEvent::SupplyOrderCreated),
                supply_payload(order),
            )
            .await;
        hooks
            .create_task(
                vec![RoleType::SupplyManager, RoleType::SeniorSupplyManager],
                RelatedEntity::supply_order(order.id),
                TaskAction::Check,
                format!("Supply order {} created.", order.number),
            )
            .await;
    }

    async fn notify(&self, event: NotificationEvent, order: &supply_order::Model) {
        self.hooks
            .notify(event, recipients_for(event), supply_payload(order))
            .await;
    }

    async fn notify_changed(&self, order_id: Uuid) {
        match db::find_required::<_, SupplyOrder>(&*self.db, order_id, "Supply order").await {
            Ok(order) => self.notify(NotificationEvent::SupplyOrderChanged, &order).await,
            Err(e) => warn!(%order_id, error = %e, "Could not load supply order for notification"),
        }
    }

    async fn emit(&self, events: Vec<Event>) {
        if let Some(sender) = &self.event_sender {
            for event in events {
                sender.send_or_log(event).await;
            }
        }
    }
}

/// Delivered, fully counted and not waiting on the supplier.
pub fn ready_for_close(
    order: &supply_order::Model,
    lines: &[supply_order_product::Model],
) -> bool {
    order.state == SupplyOrderState::Delivered
        && lines.iter().all(|l| l.actual_quantity.is_some())
        && !order.has_status(
            SupplyOrderState::Delivered,
            SupplyOrderStatus::AwaitingSupplierApproval,
        )
}

fn recipients_for(event: NotificationEvent) -> Vec<Recipient> {
    let mut roles = vec![RoleType::SupplyManager, RoleType::SeniorSupplyManager];
    if event == NotificationEvent::SupplyOrderClosed {
        roles.push(RoleType::StockManager);
    }
    roles.into_iter().map(Recipient::Role).collect()
}

fn supply_payload(order: &supply_order::Model) -> serde_json::Value {
    json!({
        "supply_order_id": order.id,
        "number": order.number,
        "state": order.state,
        "status": order.display_status(),
        "prod_order_id": order.prod_order_id,
        "supplier_id": order.supplier_id,
        "total_price": order.total_price,
    })
}

fn status_changed(order_id: Uuid, change: &StatusChange) -> Event {
    Event::SupplyOrderStatusChanged {
        supply_order_id: order_id,
        from: change.from_state,
        to: change.to_state,
        status: change.to_status.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn order(state: SupplyOrderState, status: Option<SupplyOrderStatus>) -> supply_order::Model {
        let now = Utc::now();
        supply_order::Model {
            id: Uuid::new_v4(),
            number: "SO-MET010124-ABCD".into(),
            supplier_id: Some(Uuid::new_v4()),
            product_category_id: Uuid::new_v4(),
            warehouse_id: Uuid::new_v4(),
            prod_order_id: None,
            state,
            status: status.map(|s| s.as_str().to_string()),
            total_price: Decimal::ZERO,
            version: 0,
            created_by: Uuid::new_v4(),
            confirmed_at: None,
            confirmed_by: None,
            progressed_at: None,
            progressed_by: None,
            delivered_at: None,
            delivered_by: None,
            closed_at: None,
            closed_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn line(expected: Decimal, actual: Option<Decimal>) -> supply_order_product::Model {
        supply_order_product::Model {
            id: Uuid::new_v4(),
            supply_order_id: Uuid::new_v4(),
            product_id: Uuid::new_v4(),
            expected_quantity: expected,
            actual_quantity: actual,
            price: dec!(10),
        }
    }

    #[test]
    fn ready_once_counted_and_not_with_supplier() {
        let counted = vec![line(dec!(5), Some(dec!(5))), line(dec!(2), Some(dec!(1)))];
        assert!(ready_for_close(
            &order(
                SupplyOrderState::Delivered,
                Some(SupplyOrderStatus::AwaitingWarehouseApproval)
            ),
            &counted
        ));
        assert!(!ready_for_close(
            &order(
                SupplyOrderState::Delivered,
                Some(SupplyOrderStatus::AwaitingSupplierApproval)
            ),
            &counted
        ));
        assert!(!ready_for_close(
            &order(SupplyOrderState::InProgress, None),
            &counted
        ));
    }

    #[test]
    fn uncounted_line_blocks_close() {
        let lines = vec![line(dec!(5), Some(dec!(5))), line(dec!(2), None)];
        assert!(!ready_for_close(
            &order(SupplyOrderState::Delivered, None),
            &lines
        ));
    }
}
