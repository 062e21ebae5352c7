use crate::{
    db::{self, DbPool},
    entities::{
        inventory::{self, Entity as Inventory},
        inventory_item::{self, Entity as InventoryItem},
        inventory_transaction::{self, Entity as InventoryTransaction, TransactionType},
    },
    errors::ServiceError,
    events::{Event, EventSender},
};
use chrono::Utc;
use metrics::counter;
use rust_decimal::{Decimal, RoundingStrategy};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set, TransactionTrait,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

/// Optional references recorded on a ledger transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactionLinks {
    pub supplier_id: Option<Uuid>,
    pub agent_id: Option<Uuid>,
    pub work_station_id: Option<Uuid>,
    pub prod_order_id: Option<Uuid>,
    pub supply_order_id: Option<Uuid>,
}

/// One stock movement into or out of a warehouse.
#[derive(Debug, Clone)]
pub struct StockMovement {
    pub product_id: Uuid,
    pub warehouse_id: Uuid,
    pub quantity: Decimal,
    /// Total cost of the incoming batch
    pub cost: Option<Decimal>,
    pub storage_location_id: Option<Uuid>,
    pub with_transaction: bool,
    pub links: TransactionLinks,
    pub actor_id: Option<Uuid>,
}

impl StockMovement {
    pub fn new(product_id: Uuid, warehouse_id: Uuid, quantity: Decimal) -> Self {
        Self {
            product_id,
            warehouse_id,
            quantity,
            cost: None,
            storage_location_id: None,
            with_transaction: true,
            links: TransactionLinks::default(),
            actor_id: None,
        }
    }

    pub fn with_cost(mut self, cost: Decimal) -> Self {
        self.cost = Some(cost);
        self
    }

    pub fn at_location(mut self, storage_location_id: Option<Uuid>) -> Self {
        self.storage_location_id = storage_location_id;
        self
    }

    pub fn linked(mut self, links: TransactionLinks) -> Self {
        self.links = links;
        self
    }

    /// Moves the quantity without writing a ledger row.
    pub fn without_transaction(mut self) -> Self {
        self.with_transaction = false;
        self
    }

    pub fn by(mut self, actor_id: Uuid) -> Self {
        self.actor_id = Some(actor_id);
        self
    }

    fn with_quantity(&self, quantity: Decimal) -> Self {
        Self {
            quantity,
            ..self.clone()
        }
    }
}

/// Stock of a product in a warehouse. Absent inventories read as zero.
#[derive(Debug, Clone, Serialize)]
pub struct InventoryLevel {
    pub inventory: Option<inventory::Model>,
    pub product_id: Uuid,
    pub warehouse_id: Uuid,
    pub quantity: Decimal,
    pub unit_cost: Decimal,
    pub items: Vec<inventory_item::Model>,
}

impl InventoryLevel {
    fn empty(product_id: Uuid, warehouse_id: Uuid) -> Self {
        Self {
            inventory: None,
            product_id,
            warehouse_id,
            quantity: Decimal::ZERO,
            unit_cost: Decimal::ZERO,
            items: Vec::new(),
        }
    }

    /// The item stored at `storage_location_id`, or an unsaved zero-quantity item.
    pub fn item_for(&self, storage_location_id: Option<Uuid>) -> inventory_item::Model {
        self.items
            .iter()
            .find(|item| item.storage_location_id == storage_location_id)
            .cloned()
            .unwrap_or_else(|| {
                let inventory_id = self.inventory.as_ref().map_or(Uuid::nil(), |inv| inv.id);
                inventory_item::Model::empty(inventory_id, storage_location_id)
            })
    }

    /// Quantity removable at the given granularity: one location, or the whole warehouse.
    pub fn available_at(&self, storage_location_id: Option<Uuid>) -> Decimal {
        match storage_location_id {
            Some(_) => self.item_for(storage_location_id).quantity,
            None => self.quantity,
        }
    }
}

/// Warehouse stock ledger.
#[derive(Clone)]
pub struct InventoryService {
    db: Arc<DbPool>,
    event_sender: Option<EventSender>,
}

impl InventoryService {
    pub fn new(db: Arc<DbPool>, event_sender: Option<EventSender>) -> Self {
        Self { db, event_sender }
    }

    /// Adds stock and records an `In` transaction.
    #[instrument(skip(self))]
    pub async fn add_stock(&self, movement: StockMovement) -> Result<InventoryLevel, ServiceError> {
        let db = &*self.db;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;
        Self::add_stock_in(&txn, &movement).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        counter!("prodflow.inventory.stock_in", 1);
        self.emit_moved(&movement, TransactionType::In).await;
        info!(
            product_id = %movement.product_id,
            warehouse_id = %movement.warehouse_id,
            quantity = %movement.quantity,
            "Stock added"
        );

        self.get_inventory(movement.product_id, movement.warehouse_id)
            .await
    }

    /// Removes stock, failing with `InsufficientStock` rather than removing part of it.
    #[instrument(skip(self))]
    pub async fn remove_stock(
        &self,
        movement: StockMovement,
    ) -> Result<InventoryLevel, ServiceError> {
        let db = &*self.db;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;
        Self::remove_stock_in(&txn, &movement).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        counter!("prodflow.inventory.stock_out", 1);
        self.emit_moved(&movement, TransactionType::Out).await;
        info!(
            product_id = %movement.product_id,
            warehouse_id = %movement.warehouse_id,
            quantity = %movement.quantity,
            "Stock removed"
        );

        self.get_inventory(movement.product_id, movement.warehouse_id)
            .await
    }

    #[instrument(skip(self))]
    pub async fn get_inventory(
        &self,
        product_id: Uuid,
        warehouse_id: Uuid,
    ) -> Result<InventoryLevel, ServiceError> {
        Self::load_level(&*self.db, product_id, warehouse_id).await
    }

    /// How much of `quantity` the warehouse cannot cover; zero when stock suffices.
    #[instrument(skip(self))]
    pub async fn stock_lack(
        &self,
        product_id: Uuid,
        quantity: Decimal,
        warehouse_id: Uuid,
        storage_location_id: Option<Uuid>,
    ) -> Result<Decimal, ServiceError> {
        let level = self.get_inventory(product_id, warehouse_id).await?;
        Ok((quantity - level.available_at(storage_location_id)).max(Decimal::ZERO))
    }

    /// Ledger history, oldest first.
    #[instrument(skip(self))]
    pub async fn transactions(
        &self,
        product_id: Uuid,
        warehouse_id: Uuid,
    ) -> Result<Vec<inventory_transaction::Model>, ServiceError> {
        InventoryTransaction::find()
            .filter(inventory_transaction::Column::ProductId.eq(product_id))
            .filter(inventory_transaction::Column::WarehouseId.eq(warehouse_id))
            .order_by_asc(inventory_transaction::Column::CreatedAt)
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)
    }

    pub(crate) async fn load_level<C: ConnectionTrait>(
        conn: &C,
        product_id: Uuid,
        warehouse_id: Uuid,
    ) -> Result<InventoryLevel, ServiceError> {
        let inventory = Inventory::find()
            .filter(inventory::Column::ProductId.eq(product_id))
            .filter(inventory::Column::WarehouseId.eq(warehouse_id))
            .one(conn)
            .await
            .map_err(ServiceError::db_error)?;

        match inventory {
            None => Ok(InventoryLevel::empty(product_id, warehouse_id)),
            Some(inv) => Self::level_of(conn, inv).await,
        }
    }

    async fn level_of<C: ConnectionTrait>(
        conn: &C,
        inv: inventory::Model,
    ) -> Result<InventoryLevel, ServiceError> {
        let items = InventoryItem::find()
            .filter(inventory_item::Column::InventoryId.eq(inv.id))
            .order_by_asc(inventory_item::Column::CreatedAt)
            .order_by_asc(inventory_item::Column::Id)
            .all(conn)
            .await
            .map_err(ServiceError::db_error)?;
        let quantity = items.iter().map(|item| item.quantity).sum();

        Ok(InventoryLevel {
            product_id: inv.product_id,
            warehouse_id: inv.warehouse_id,
            unit_cost: inv.unit_cost,
            quantity,
            items,
            inventory: Some(inv),
        })
    }

    async fn locked_inventory_in<C: ConnectionTrait>(
        conn: &C,
        product_id: Uuid,
        warehouse_id: Uuid,
    ) -> Result<Option<inventory::Model>, ServiceError> {
        Inventory::find()
            .filter(inventory::Column::ProductId.eq(product_id))
            .filter(inventory::Column::WarehouseId.eq(warehouse_id))
            .lock_exclusive()
            .one(conn)
            .await
            .map_err(ServiceError::db_error)
    }

    async fn inventory_for_update_in<C: ConnectionTrait>(
        conn: &C,
        product_id: Uuid,
        warehouse_id: Uuid,
    ) -> Result<inventory::Model, ServiceError> {
        if let Some(inv) = Self::locked_inventory_in(conn, product_id, warehouse_id).await? {
            return Ok(inv);
        }

        let now = Utc::now();
        debug!(%product_id, %warehouse_id, "Creating inventory");
        inventory::ActiveModel {
            id: Set(Uuid::new_v4()),
            product_id: Set(product_id),
            warehouse_id: Set(warehouse_id),
            unit_cost: Set(Decimal::ZERO),
            version: Set(0),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(conn)
        .await
        .map_err(ServiceError::db_error)
    }

    /// Increments stock inside the caller's transaction.
    pub(crate) async fn add_stock_in<C: ConnectionTrait>(
        conn: &C,
        movement: &StockMovement,
    ) -> Result<(), ServiceError> {
        if movement.quantity <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "Quantity must be positive".to_string(),
            ));
        }

        let inv =
            Self::inventory_for_update_in(conn, movement.product_id, movement.warehouse_id).await?;
        let level = Self::level_of(conn, inv.clone()).await?;
        let now = Utc::now();

        let unit_cost = match movement.cost {
            Some(cost) if cost > Decimal::ZERO => moving_average(
                level.quantity,
                inv.unit_cost,
                movement.quantity,
                cost,
            ),
            _ => inv.unit_cost,
        };

        let item = level.item_for(movement.storage_location_id);
        if item.is_persisted() {
            inventory_item::ActiveModel {
                id: Set(item.id),
                quantity: Set(item.quantity + movement.quantity),
                updated_at: Set(now),
                ..Default::default()
            }
            .update(conn)
            .await
            .map_err(ServiceError::db_error)?;
        } else {
            inventory_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                inventory_id: Set(inv.id),
                storage_location_id: Set(movement.storage_location_id),
                quantity: Set(movement.quantity),
                created_at: Set(now),
                updated_at: Set(now),
            }
            .insert(conn)
            .await
            .map_err(ServiceError::db_error)?;
        }

        db::update_versioned(
            conn,
            inventory::ActiveModel {
                unit_cost: Set(unit_cost),
                updated_at: Set(now),
                ..Default::default()
            },
            inv.id,
            inv.version,
        )
        .await?;

        if movement.with_transaction {
            let cost = movement
                .cost
                .unwrap_or_else(|| inv.unit_cost * movement.quantity);
            Self::record_in(
                conn,
                movement,
                movement.storage_location_id,
                movement.quantity,
                cost,
                TransactionType::In,
            )
            .await?;
        }

        Ok(())
    }

    /// Decrements stock inside the caller's transaction, oldest items first.
    pub(crate) async fn remove_stock_in<C: ConnectionTrait>(
        conn: &C,
        movement: &StockMovement,
    ) -> Result<(), ServiceError> {
        if movement.quantity <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "Quantity must be positive".to_string(),
            ));
        }

        let insufficient = |available: Decimal| {
            ServiceError::InsufficientStock(format!(
                "product {} in warehouse {}: requested {}, available {}",
                movement.product_id, movement.warehouse_id, movement.quantity, available
            ))
        };

        let inv = Self::locked_inventory_in(conn, movement.product_id, movement.warehouse_id)
            .await?
            .ok_or_else(|| insufficient(Decimal::ZERO))?;
        let level = Self::level_of(conn, inv.clone()).await?;

        let available = level.available_at(movement.storage_location_id);
        if available < movement.quantity {
            return Err(insufficient(available));
        }

        let now = Utc::now();
        let mut remaining = movement.quantity;
        let drainable = level.items.iter().filter(|item| {
            item.quantity > Decimal::ZERO
                && (movement.storage_location_id.is_none()
                    || item.storage_location_id == movement.storage_location_id)
        });

        for item in drainable {
            if remaining <= Decimal::ZERO {
                break;
            }
            let take = remaining.min(item.quantity);
            remaining -= take;

            inventory_item::ActiveModel {
                id: Set(item.id),
                quantity: Set(item.quantity - take),
                updated_at: Set(now),
                ..Default::default()
            }
            .update(conn)
            .await
            .map_err(ServiceError::db_error)?;

            if movement.with_transaction {
                Self::record_in(
                    conn,
                    movement,
                    item.storage_location_id,
                    take,
                    inv.unit_cost * take,
                    TransactionType::Out,
                )
                .await?;
            }
        }

        db::update_versioned(
            conn,
            inventory::ActiveModel {
                updated_at: Set(now),
                ..Default::default()
            },
            inv.id,
            inv.version,
        )
        .await
    }

    /// Removes as much of the requested quantity as the warehouse holds and returns what was
    /// taken.
    pub(crate) async fn take_available_in<C: ConnectionTrait>(
        conn: &C,
        movement: &StockMovement,
    ) -> Result<Decimal, ServiceError> {
        let level = Self::load_level(conn, movement.product_id, movement.warehouse_id).await?;
        let take = movement
            .quantity
            .min(level.available_at(movement.storage_location_id));
        if take <= Decimal::ZERO {
            return Ok(Decimal::ZERO);
        }

        Self::remove_stock_in(conn, &movement.with_quantity(take)).await?;
        Ok(take)
    }

    async fn record_in<C: ConnectionTrait>(
        conn: &C,
        movement: &StockMovement,
        storage_location_id: Option<Uuid>,
        quantity: Decimal,
        cost: Decimal,
        transaction_type: TransactionType,
    ) -> Result<(), ServiceError> {
        let links = movement.links;
        inventory_transaction::ActiveModel {
            id: Set(Uuid::new_v4()),
            product_id: Set(movement.product_id),
            warehouse_id: Set(movement.warehouse_id),
            storage_location_id: Set(storage_location_id),
            work_station_id: Set(links.work_station_id),
            prod_order_id: Set(links.prod_order_id),
            supply_order_id: Set(links.supply_order_id),
            supplier_id: Set(links.supplier_id),
            agent_id: Set(links.agent_id),
            quantity: Set(quantity),
            cost: Set(cost),
            transaction_type: Set(transaction_type),
            created_by: Set(movement.actor_id),
            created_at: Set(Utc::now()),
        }
        .insert(conn)
        .await
        .map_err(ServiceError::db_error)?;
        Ok(())
    }

    async fn emit_moved(&self, movement: &StockMovement, transaction_type: TransactionType) {
        if let Some(sender) = &self.event_sender {
            sender
                .send_or_log(Event::StockMoved {
                    product_id: movement.product_id,
                    warehouse_id: movement.warehouse_id,
                    transaction_type,
                    quantity: movement.quantity,
                })
                .await;
        }
    }
}

/// Unit cost after receiving `incoming_qty` units costing `incoming_cost` in total.
pub fn moving_average(
    current_qty: Decimal,
    current_unit_cost: Decimal,
    incoming_qty: Decimal,
    incoming_cost: Decimal,
) -> Decimal {
    let total_qty = current_qty + incoming_qty;
    if total_qty <= Decimal::ZERO {
        return current_unit_cost;
    }
    ((current_qty * current_unit_cost + incoming_cost) / total_qty)
        .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn moving_average_weights_by_quantity() {
        assert_eq!(moving_average(dec!(0), dec!(0), dec!(10), dec!(50)), dec!(5));
        assert_eq!(moving_average(dec!(10), dec!(5), dec!(10), dec!(70)), dec!(6));
        // 3 * 1 + 1 = 4 over 3 units
        assert_eq!(moving_average(dec!(2), dec!(1.5), dec!(1), dec!(1)), dec!(1.33));
    }

    #[test]
    fn moving_average_rounds_half_away_from_zero() {
        // 0.125 -> 0.13
        assert_eq!(moving_average(dec!(0), dec!(0), dec!(8), dec!(1)), dec!(0.13));
    }

    #[test]
    fn item_for_falls_back_to_unsaved_item() {
        let level = InventoryLevel::empty(Uuid::new_v4(), Uuid::new_v4());
        let loc = Some(Uuid::new_v4());
        let item = level.item_for(loc);
        assert!(!item.is_persisted());
        assert_eq!(item.quantity, Decimal::ZERO);
        assert_eq!(item.storage_location_id, loc);
        assert_eq!(level.available_at(None), Decimal::ZERO);
    }

    #[test]
    fn movement_builder_keeps_links() {
        let actor = Uuid::new_v4();
        let supply_order_id = Some(Uuid::new_v4());
        let m = StockMovement::new(Uuid::new_v4(), Uuid::new_v4(), dec!(3))
            .with_cost(dec!(9))
            .linked(TransactionLinks {
                supply_order_id,
                ..Default::default()
            })
            .by(actor);
        let half = m.with_quantity(dec!(1.5));
        assert_eq!(half.quantity, dec!(1.5));
        assert_eq!(half.links.supply_order_id, supply_order_id);
        assert_eq!(half.actor_id, Some(actor));
        assert!(half.with_transaction);
    }
}
