use crate::{
    db::{self, DbPool},
    entities::{
        prod_order::{self, Entity as ProdOrder, OrderStatus},
        prod_order_group::{self, Entity as ProdOrderGroup, ProdOrderGroupType},
        prod_order_step::{self, Entity as ProdOrderStep, StepStatus},
        prod_order_step_execution::{
            self, ApprovalStage, Entity as Execution, ExecutionStatus,
        },
        prod_order_step_execution_product::{self, Entity as ExecutionProduct},
        prod_order_step_product::{self, Entity as StepMaterial, MaterialStatus},
        product::{self, Entity as Product},
        supply_order,
        task::{RoleType, TaskAction},
        work_station::{self, Entity as WorkStation, DurationUnit},
    },
    errors::{InsufficientAsset, ServiceError},
    events::{Event, EventSender},
    notifications::{Hooks, NotificationEvent, Recipient, RelatedEntity},
};
use super::{
    inventory::{InventoryService, StockMovement, TransactionLinks},
    supply_orders::SupplyOrderService,
    templates::{validate_blueprint, TemplateBlueprint, TemplateService},
    validate_non_negative_decimal, validate_positive_decimal,
};
use chrono::{NaiveDate, Utc};
use metrics::counter;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

/// Working hours in a production day.
const WORKING_HOURS_PER_DAY: i64 = 12;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NewProdOrder {
    pub template_id: Uuid,
    pub warehouse_id: Uuid,
    #[validate(custom = "validate_positive_decimal")]
    pub quantity: Decimal,
    #[validate(custom = "validate_non_negative_decimal")]
    pub offer_price: Decimal,
    pub prod_order_group_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NewOrderLine {
    /// Produced with the product's latest template
    pub product_id: Uuid,
    #[validate(custom = "validate_positive_decimal")]
    pub quantity: Decimal,
    #[validate(custom = "validate_non_negative_decimal")]
    pub offer_price: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NewOrderGroup {
    pub group_type: ProdOrderGroupType,
    pub warehouse_id: Uuid,
    pub agent_id: Option<Uuid>,
    pub deadline: Option<NaiveDate>,
    #[validate]
    pub lines: Vec<NewOrderLine>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ExecutionMaterial {
    pub product_id: Uuid,
    #[validate(custom = "validate_positive_decimal")]
    pub used_quantity: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NewExecution {
    #[validate]
    pub materials: Vec<ExecutionMaterial>,
    #[validate(custom = "validate_positive_decimal")]
    pub output_quantity: Decimal,
    #[validate(length(max = 255))]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepDetails {
    pub step: prod_order_step::Model,
    pub materials: Vec<prod_order_step_product::Model>,
}

impl StepDetails {
    pub fn material(&self, product_id: Uuid) -> Option<&prod_order_step_product::Model> {
        self.materials.iter().find(|m| m.product_id == product_id)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProdOrderDetails {
    pub order: prod_order::Model,
    pub steps: Vec<StepDetails>,
}

impl ProdOrderDetails {
    pub fn current_step(&self) -> Option<&StepDetails> {
        let current = self.order.current_step_id?;
        self.steps.iter().find(|s| s.step.id == current)
    }

    pub fn step(&self, sequence: i32) -> Option<&StepDetails> {
        self.steps.iter().find(|s| s.step.sequence == sequence)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionDetails {
    pub execution: prod_order_step_execution::Model,
    pub materials: Vec<prod_order_step_execution_product::Model>,
}

/// Result of starting an order or reserving materials for a step.
#[derive(Debug, Clone, Serialize)]
pub struct ReservationOutcome {
    pub order: prod_order::Model,
    pub shortfalls: Vec<InsufficientAsset>,
    pub supply_orders: Vec<supply_order::Model>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MaterialUpdate {
    pub material: prod_order_step_product::Model,
    /// Quantity the warehouse could not supply
    pub lack: Decimal,
    pub order_status: OrderStatus,
    pub supply_orders: Vec<supply_order::Model>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApprovalOutcome {
    pub execution: prod_order_step_execution::Model,
    pub step_completed: bool,
    pub next_step_id: Option<Uuid>,
    pub order_status: OrderStatus,
    pub shortfalls: Vec<InsufficientAsset>,
    pub supply_orders: Vec<supply_order::Model>,
}

/// Units a station produces per working day, if its performance is configured.
pub fn quantity_per_day(station: &work_station::Model) -> Option<Decimal> {
    let qty = station.performance_qty?;
    let duration = station.performance_duration?;
    let unit = station.performance_duration_unit?;
    if qty <= Decimal::ZERO || duration <= Decimal::ZERO {
        return None;
    }

    let per_unit = qty / duration;
    Some(match unit {
        DurationUnit::Hour => per_unit * Decimal::from(WORKING_HOURS_PER_DAY),
        DurationUnit::Day => per_unit,
        DurationUnit::Week => per_unit / Decimal::from(7),
        DurationUnit::Month => per_unit / Decimal::from(30),
        DurationUnit::Year => per_unit / Decimal::from(365),
    })
}

/// Production orders, their steps and the executions recorded against them.
#[derive(Clone)]
pub struct ProdOrderService {
    db: Arc<DbPool>,
    hooks: Hooks,
    event_sender: Option<EventSender>,
}

impl ProdOrderService {
    pub fn new(db: Arc<DbPool>, hooks: Hooks, event_sender: Option<EventSender>) -> Self {
        Self {
            db,
            hooks,
            event_sender,
        }
    }

    /// Creates a pending order from a template, scaling every quantity by the ordered quantity.
    #[instrument(skip(self))]
    pub async fn instantiate(
        &self,
        request: NewProdOrder,
        actor_id: Uuid,
    ) -> Result<ProdOrderDetails, ServiceError> {
        request.validate()?;
        let db = &*self.db;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        if let Some(group_id) = request.prod_order_group_id {
            db::find_required::<_, ProdOrderGroup>(&txn, group_id, "Prod order group").await?;
        }
        let blueprint = TemplateService::load_blueprint_in(&txn, request.template_id).await?;
        let order = Self::instantiate_in(&txn, &blueprint, &request, actor_id).await?;

        txn.commit().await.map_err(ServiceError::db_error)?;

        counter!("prodflow.prod_orders.created", 1);
        self.emit(vec![Event::ProdOrderCreated {
            order_id: order.id,
            template_id: order.prod_template_id,
            quantity: order.quantity,
        }])
        .await;
        self.announce_created(&order).await;
        info!(order_id = %order.id, number = %order.number, "Prod order created");

        self.get_order(order.id).await
    }

    /// Creates a group and one order per line, each from the product's latest template.
    #[instrument(skip(self))]
    pub async fn create_order_group(
        &self,
        request: NewOrderGroup,
        actor_id: Uuid,
    ) -> Result<(prod_order_group::Model, Vec<prod_order::Model>), ServiceError> {
        request.validate()?;
        if request.lines.is_empty() {
            return Err(ServiceError::ValidationError(
                "Order group needs at least one line".to_string(),
            ));
        }
        if let Some(deadline) = request.deadline {
            if deadline < Utc::now().date_naive() {
                return Err(ServiceError::ValidationError(
                    "Deadline cannot be in the past".to_string(),
                ));
            }
        }

        let db = &*self.db;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let group = prod_order_group::ActiveModel {
            id: Set(Uuid::new_v4()),
            group_type: Set(request.group_type),
            warehouse_id: Set(request.warehouse_id),
            agent_id: Set(request.agent_id),
            deadline: Set(request.deadline),
            created_by: Set(actor_id),
            created_at: Set(Utc::now()),
        }
        .insert(&txn)
        .await
        .map_err(ServiceError::db_error)?;

        let mut orders = Vec::with_capacity(request.lines.len());
        for line in &request.lines {
            let template = prod_template_for(&txn, line.product_id).await?;
            let blueprint = TemplateService::load_blueprint_in(&txn, template).await?;
            let order_request = NewProdOrder {
                template_id: template,
                warehouse_id: request.warehouse_id,
                quantity: line.quantity,
                offer_price: line.offer_price,
                prod_order_group_id: Some(group.id),
            };
            orders.push(Self::instantiate_in(&txn, &blueprint, &order_request, actor_id).await?);
        }

        txn.commit().await.map_err(ServiceError::db_error)?;

        counter!("prodflow.prod_orders.created", orders.len() as u64);
        self.emit(
            orders
                .iter()
                .map(|o| Event::ProdOrderCreated {
                    order_id: o.id,
                    template_id: o.prod_template_id,
                    quantity: o.quantity,
                })
                .collect(),
        )
        .await;
        for order in &orders {
            self.announce_created(order).await;
        }
        info!(group_id = %group.id, orders = orders.len(), "Prod order group created");
        Ok((group, orders))
    }

    async fn instantiate_in<C: ConnectionTrait>(
        conn: &C,
        blueprint: &TemplateBlueprint,
        request: &NewProdOrder,
        actor_id: Uuid,
    ) -> Result<prod_order::Model, ServiceError> {
        validate_blueprint(blueprint)?;

        let now = Utc::now();
        let id = Uuid::new_v4();
        let estimated_days = Self::deadline_in(conn, blueprint, request.quantity).await?;
        let total_cost =
            Self::total_cost_in(conn, blueprint, request.warehouse_id, request.quantity).await?;

        let order = prod_order::ActiveModel {
            id: Set(id),
            number: Set(prod_order::order_number(id, now)),
            prod_order_group_id: Set(request.prod_order_group_id),
            prod_template_id: Set(blueprint.template.id),
            product_id: Set(blueprint.template.product_id),
            warehouse_id: Set(request.warehouse_id),
            quantity: Set(request.quantity),
            offer_price: Set(request.offer_price),
            total_cost: Set(Some(total_cost)),
            estimated_days: Set(Some(estimated_days)),
            status: Set(OrderStatus::Pending),
            current_step_id: Set(None),
            version: Set(0),
            created_by: Set(actor_id),
            confirmed_at: Set(None),
            confirmed_by: Set(None),
            started_at: Set(None),
            started_by: Set(None),
            completed_at: Set(None),
            approved_at: Set(None),
            approved_by: Set(None),
            cancelled_at: Set(None),
            cancelled_by: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(conn)
        .await
        .map_err(ServiceError::db_error)?;

        for entry in &blueprint.steps {
            let step = prod_order_step::ActiveModel {
                id: Set(Uuid::new_v4()),
                prod_order_id: Set(order.id),
                sequence: Set(entry.step.sequence),
                work_station_id: Set(entry.step.work_station_id),
                output_product_id: Set(entry.step.output_product_id),
                expected_quantity: Set(entry.step.expected_quantity * request.quantity),
                output_quantity: Set(Decimal::ZERO),
                status: Set(StepStatus::InProgress),
                version: Set(0),
                completed_at: Set(None),
                created_at: Set(now),
                updated_at: Set(now),
            }
            .insert(conn)
            .await
            .map_err(ServiceError::db_error)?;

            for material in &entry.materials {
                prod_order_step_product::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    prod_order_step_id: Set(step.id),
                    product_id: Set(material.product_id),
                    required_quantity: Set(material.required_quantity * request.quantity),
                    available_quantity: Set(Decimal::ZERO),
                    used_quantity: Set(Decimal::ZERO),
                    status: Set(MaterialStatus::InProgress),
                    version: Set(0),
                    created_at: Set(now),
                    updated_at: Set(now),
                }
                .insert(conn)
                .await
                .map_err(ServiceError::db_error)?;
            }
        }

        Ok(order)
    }

    /// Stamps the order as confirmed. Confirming twice keeps the first stamp.
    #[instrument(skip(self))]
    pub async fn confirm(
        &self,
        order_id: Uuid,
        actor_id: Uuid,
    ) -> Result<prod_order::Model, ServiceError> {
        let db = &*self.db;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;
        let order: prod_order::Model =
            db::find_locked::<_, ProdOrder>(&txn, order_id, "Prod order").await?;

        if order.confirmed_at.is_some() {
            return Ok(order);
        }
        if order.status.is_terminal() {
            return Err(ServiceError::InvalidOperation(format!(
                "Prod order {} is {:?}",
                order_id, order.status
            )));
        }

        let now = Utc::now();
        Self::update_order_in(
            &txn,
            &order,
            prod_order::ActiveModel {
                confirmed_at: Set(Some(now)),
                confirmed_by: Set(Some(actor_id)),
                updated_at: Set(now),
                ..Default::default()
            },
        )
        .await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        let confirmed: prod_order::Model =
            db::find_required::<_, ProdOrder>(db, order_id, "Prod order").await?;
        self.hooks
            .resolve_tasks(RelatedEntity::prod_order(order_id), TaskAction::Confirm, actor_id)
            .await;
        self.notify_changed(&confirmed).await;
        info!(%order_id, %actor_id, "Prod order confirmed");
        Ok(confirmed)
    }

    /// Reserves the first step's materials and moves the order to Processing, or to Blocked
    /// with a supply order per category when stock runs short.
    #[instrument(skip(self))]
    pub async fn start(
        &self,
        order_id: Uuid,
        actor_id: Uuid,
    ) -> Result<ReservationOutcome, ServiceError> {
        let db = &*self.db;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;
        let order: prod_order::Model =
            db::find_locked::<_, ProdOrder>(&txn, order_id, "Prod order").await?;

        if order.confirmed_at.is_none() {
            return Err(ServiceError::InvalidOperation(format!(
                "Prod order {} is not confirmed yet",
                order_id
            )));
        }
        if order.is_started() {
            return Err(ServiceError::InvalidOperation(format!(
                "Prod order {} is already started",
                order_id
            )));
        }

        let first = ProdOrderStep::find()
            .filter(prod_order_step::Column::ProdOrderId.eq(order_id))
            .order_by_asc(prod_order_step::Column::Sequence)
            .one(&txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::InvalidOperation(format!("Prod order {} has no steps", order_id))
            })?;

        let mut events = Vec::new();
        let shortfalls =
            Self::reserve_step_materials_in(&txn, &order, &first, actor_id, &mut events).await?;
        let next_status = if shortfalls.is_empty() {
            OrderStatus::Processing
        } else {
            OrderStatus::Blocked
        };
        ensure_transition(order.status, next_status)?;

        let supply_orders = if shortfalls.is_empty() {
            Vec::new()
        } else {
            SupplyOrderService::spawn_for_shortfalls_in(&txn, &order, &shortfalls, actor_id)
                .await?
        };

        let now = Utc::now();
        Self::update_order_in(
            &txn,
            &order,
            prod_order::ActiveModel {
                status: Set(next_status),
                current_step_id: Set(Some(first.id)),
                started_at: Set(Some(now)),
                started_by: Set(Some(actor_id)),
                updated_at: Set(now),
                ..Default::default()
            },
        )
        .await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        counter!("prodflow.prod_orders.started", 1);
        if next_status == OrderStatus::Blocked {
            counter!("prodflow.prod_orders.blocked", 1);
        }
        events.push(Event::ProdOrderStatusChanged {
            order_id,
            old_status: order.status,
            new_status: next_status,
        });
        events.extend(supply_orders.iter().map(supply_order_created));
        self.emit(events).await;
        for supply_order in &supply_orders {
            SupplyOrderService::announce_created(&self.hooks, supply_order).await;
        }
        let started: prod_order::Model =
            db::find_required::<_, ProdOrder>(db, order_id, "Prod order").await?;
        self.notify_changed(&started).await;
        info!(%order_id, status = ?next_status, shortfalls = shortfalls.len(), "Prod order started");

        Ok(ReservationOutcome {
            order: started,
            shortfalls,
            supply_orders,
        })
    }

    /// Shortfall of reserving `quantity` of `product_id` for the step in total.
    #[instrument(skip(self))]
    pub async fn check_materials_exact(
        &self,
        step_id: Uuid,
        product_id: Uuid,
        quantity: Decimal,
    ) -> Result<Vec<InsufficientAsset>, ServiceError> {
        self.check_materials(step_id, product_id, quantity, false)
            .await
    }

    /// Warehouse shortfall for a reservation of `product_id`. Pure read.
    ///
    /// With `adding` the `quantity` is taken on top of the current reservation and compared
    /// with stock as-is. Otherwise it is the step's total, so the material's current
    /// `available_quantity` is subtracted first.
    #[instrument(skip(self))]
    pub async fn check_materials(
        &self,
        step_id: Uuid,
        product_id: Uuid,
        quantity: Decimal,
        adding: bool,
    ) -> Result<Vec<InsufficientAsset>, ServiceError> {
        let db = &*self.db;
        let step: prod_order_step::Model =
            db::find_required::<_, ProdOrderStep>(db, step_id, "Prod order step").await?;
        let order: prod_order::Model =
            db::find_required::<_, ProdOrder>(db, step.prod_order_id, "Prod order").await?;
        let material = Self::material_in(db, step_id, product_id).await?;

        let additional = if adding {
            quantity
        } else {
            quantity - material.available_quantity
        };
        let level = InventoryService::load_level(db, product_id, order.warehouse_id).await?;
        let lack = additional - level.quantity;

        if lack > Decimal::ZERO {
            Ok(vec![shortfall_in(db, product_id, lack).await?])
        } else {
            Ok(Vec::new())
        }
    }

    /// Sets a material's reservation to `target`, taking stock from or returning it to the
    /// warehouse. A shortfall spawns a supply order and blocks the order.
    #[instrument(skip(self))]
    pub async fn update_material_available_exact(
        &self,
        step_id: Uuid,
        product_id: Uuid,
        target: Decimal,
        actor_id: Uuid,
    ) -> Result<MaterialUpdate, ServiceError> {
        self.adjust_material(step_id, product_id, actor_id, |_| Ok(target))
            .await
    }

    /// Adjusts a material's reservation by `delta`, guarded by the version the caller read.
    #[instrument(skip(self))]
    pub async fn change_material_available(
        &self,
        step_id: Uuid,
        product_id: Uuid,
        delta: Decimal,
        expected_version: i32,
        actor_id: Uuid,
    ) -> Result<MaterialUpdate, ServiceError> {
        self.adjust_material(step_id, product_id, actor_id, |material| {
            if material.version != expected_version {
                return Err(ServiceError::ConcurrentModification(material.id));
            }
            Ok(material.available_quantity + delta)
        })
        .await
    }

    async fn adjust_material<F>(
        &self,
        step_id: Uuid,
        product_id: Uuid,
        actor_id: Uuid,
        target_of: F,
    ) -> Result<MaterialUpdate, ServiceError>
    where
        F: FnOnce(&prod_order_step_product::Model) -> Result<Decimal, ServiceError>,
    {
        let db = &*self.db;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let step: prod_order_step::Model =
            db::find_locked::<_, ProdOrderStep>(&txn, step_id, "Prod order step").await?;
        let order: prod_order::Model =
            db::find_locked::<_, ProdOrder>(&txn, step.prod_order_id, "Prod order").await?;
        if !matches!(order.status, OrderStatus::Processing | OrderStatus::Blocked) {
            return Err(ServiceError::InvalidOperation(format!(
                "Materials of prod order {} cannot change while {:?}",
                order.id, order.status
            )));
        }
        if step.status == StepStatus::Completed {
            return Err(ServiceError::InvalidOperation(format!(
                "Prod order step {} is completed",
                step_id
            )));
        }

        let material = Self::material_in(&txn, step_id, product_id).await?;
        let target = target_of(&material)?;
        if target < Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "Available quantity cannot be negative".to_string(),
            ));
        }
        if target < material.used_quantity {
            return Err(ServiceError::ValidationError(format!(
                "Available quantity {} is below the used quantity {}",
                target, material.used_quantity
            )));
        }
        if target == material.available_quantity {
            return Ok(MaterialUpdate {
                material,
                lack: Decimal::ZERO,
                order_status: order.status,
                supply_orders: Vec::new(),
            });
        }

        let mut lack = Decimal::ZERO;
        let new_available = if target < material.available_quantity {
            let surplus = material.available_quantity - target;
            InventoryService::add_stock_in(
                &txn,
                &step_movement(&order, &step, product_id, surplus, actor_id),
            )
            .await?;
            target
        } else {
            let additional = target - material.available_quantity;
            let taken = InventoryService::take_available_in(
                &txn,
                &step_movement(&order, &step, product_id, additional, actor_id),
            )
            .await?;
            lack = additional - taken;
            material.available_quantity + taken
        };

        let updated = Self::set_material_in(
            &txn,
            &material,
            new_available,
            material.used_quantity,
            material.status,
        )
        .await?;

        let mut order_status = order.status;
        let mut supply_orders = Vec::new();
        if lack > Decimal::ZERO {
            let shortfalls = vec![shortfall_in(&txn, product_id, lack).await?];
            supply_orders =
                SupplyOrderService::spawn_for_shortfalls_in(&txn, &order, &shortfalls, actor_id)
                    .await?;
            order_status = OrderStatus::Blocked;
        }

        let now = Utc::now();
        Self::update_order_in(
            &txn,
            &order,
            prod_order::ActiveModel {
                status: Set(order_status),
                updated_at: Set(now),
                ..Default::default()
            },
        )
        .await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        counter!("prodflow.prod_orders.material_adjusted", 1);
        let mut events = vec![Event::MaterialReserved {
            step_id,
            product_id,
            available_quantity: updated.available_quantity,
            shortfall: lack,
        }];
        if order_status != order.status {
            events.push(Event::ProdOrderStatusChanged {
                order_id: order.id,
                old_status: order.status,
                new_status: order_status,
            });
        }
        events.extend(supply_orders.iter().map(supply_order_created));
        self.emit(events).await;
        for supply_order in &supply_orders {
            SupplyOrderService::announce_created(&self.hooks, supply_order).await;
        }
        if order_status != order.status {
            let changed: prod_order::Model =
                db::find_required::<_, ProdOrder>(&*self.db, order.id, "Prod order").await?;
            self.notify_changed(&changed).await;
        }
        info!(
            %step_id,
            %product_id,
            available = %updated.available_quantity,
            %lack,
            "Material reservation updated"
        );

        Ok(MaterialUpdate {
            material: updated,
            lack,
            order_status,
            supply_orders,
        })
    }

    /// Records work done at the order's current step, pending approval.
    #[instrument(skip(self))]
    pub async fn create_execution(
        &self,
        step_id: Uuid,
        request: NewExecution,
        actor_id: Uuid,
    ) -> Result<ExecutionDetails, ServiceError> {
        request.validate()?;
        let mut seen = HashSet::new();
        if let Some(dup) = request
            .materials
            .iter()
            .find(|m| !seen.insert(m.product_id))
        {
            return Err(ServiceError::ValidationError(format!(
                "Material {} listed twice",
                dup.product_id
            )));
        }

        let db = &*self.db;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let step: prod_order_step::Model =
            db::find_locked::<_, ProdOrderStep>(&txn, step_id, "Prod order step").await?;
        let order: prod_order::Model =
            db::find_locked::<_, ProdOrder>(&txn, step.prod_order_id, "Prod order").await?;

        if order.status != OrderStatus::Processing {
            return Err(ServiceError::InvalidOperation(format!(
                "Prod order {} is {:?}, not processing",
                order.id, order.status
            )));
        }
        if order.current_step_id != Some(step_id) || step.status != StepStatus::InProgress {
            return Err(ServiceError::InvalidOperation(format!(
                "Step {} is not the current step of prod order {}",
                step_id, order.id
            )));
        }

        let materials: HashMap<Uuid, prod_order_step_product::Model> =
            Self::materials_in(&txn, step_id)
                .await?
                .into_iter()
                .map(|m| (m.product_id, m))
                .collect();
        let pending = Self::pending_usage_in(&txn, step_id).await?;

        let mut shortfalls = Vec::new();
        for requested in &request.materials {
            let material = materials.get(&requested.product_id).ok_or_else(|| {
                ServiceError::ValidationError(format!(
                    "Product {} is not a material of step {}",
                    requested.product_id, step_id
                ))
            })?;
            let claimed = pending
                .get(&requested.product_id)
                .copied()
                .unwrap_or(Decimal::ZERO);
            let free = material.free_quantity() - claimed;
            if requested.used_quantity > free {
                shortfalls.push(
                    shortfall_in(&txn, requested.product_id, requested.used_quantity - free)
                        .await?,
                );
            }
        }
        if !shortfalls.is_empty() {
            counter!("prodflow.executions.rejected", 1);
            return Err(ServiceError::InsufficientAssets(shortfalls));
        }

        let now = Utc::now();
        let execution = prod_order_step_execution::ActiveModel {
            id: Set(Uuid::new_v4()),
            prod_order_step_id: Set(step_id),
            output_quantity: Set(request.output_quantity),
            notes: Set(request.notes),
            status: Set(ExecutionStatus::Pending),
            executed_by: Set(actor_id),
            prod_manager_approved_at: Set(None),
            prod_manager_approved_by: Set(None),
            senior_prod_manager_approved_at: Set(None),
            senior_prod_manager_approved_by: Set(None),
            approved_at: Set(None),
            approved_by: Set(None),
            declined_at: Set(None),
            declined_by: Set(None),
            decline_comment: Set(None),
            version: Set(0),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&txn)
        .await
        .map_err(ServiceError::db_error)?;

        let mut rows = Vec::with_capacity(request.materials.len());
        for requested in request.materials {
            let row = prod_order_step_execution_product::ActiveModel {
                id: Set(Uuid::new_v4()),
                prod_order_step_execution_id: Set(execution.id),
                product_id: Set(requested.product_id),
                used_quantity: Set(requested.used_quantity),
            }
            .insert(&txn)
            .await
            .map_err(ServiceError::db_error)?;
            rows.push(row);
        }

        // Concurrent submissions for the same step conflict here.
        db::update_versioned(
            &txn,
            prod_order_step::ActiveModel {
                updated_at: Set(now),
                ..Default::default()
            },
            step.id,
            step.version,
        )
        .await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        counter!("prodflow.executions.created", 1);
        self.emit(vec![Event::ExecutionCreated {
            execution_id: execution.id,
            step_id,
        }])
        .await;
        self.hooks
            .create_task(
                vec![RoleType::ProductionManager],
                RelatedEntity::execution(execution.id),
                TaskAction::Approve,
                format!("Approve execution for order {}", order.number),
            )
            .await;
        self.hooks
            .notify(
                NotificationEvent::ExecutionCreated,
                vec![Recipient::Role(RoleType::ProductionManager)],
                json!({
                    "execution_id": execution.id,
                    "prod_order_id": order.id,
                    "number": order.number,
                    "step_id": step_id,
                    "output_quantity": execution.output_quantity,
                    "executed_by": execution.executed_by,
                }),
            )
            .await;
        info!(execution_id = %execution.id, %step_id, "Execution created");

        Ok(ExecutionDetails {
            execution,
            materials: rows,
        })
    }

    /// Stamps an intermediate approval. The stock manager stage is the final approval.
    #[instrument(skip(self))]
    pub async fn approve_execution_stage(
        &self,
        execution_id: Uuid,
        stage: ApprovalStage,
        actor_id: Uuid,
    ) -> Result<prod_order_step_execution::Model, ServiceError> {
        if stage == ApprovalStage::StockManager {
            return self
                .approve_execution(execution_id, actor_id)
                .await
                .map(|outcome| outcome.execution);
        }

        let db = &*self.db;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;
        let execution: prod_order_step_execution::Model =
            db::find_locked::<_, Execution>(&txn, execution_id, "Execution").await?;
        ensure_pending(&execution, ExecutionStatus::Approved)?;

        if execution.stage_approved_at(stage).is_some() {
            return Ok(execution);
        }

        let now = Utc::now();
        let mut active = prod_order_step_execution::ActiveModel {
            updated_at: Set(now),
            ..Default::default()
        };
        active.stamp_approval(stage, actor_id, now);
        db::update_versioned(&txn, active, execution.id, execution.version).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        counter!("prodflow.executions.stage_approved", 1);
        let next_role = match stage {
            ApprovalStage::ProductionManager => RoleType::SeniorProductionManager,
            _ => RoleType::StockManager,
        };
        self.hooks
            .create_task(
                vec![next_role],
                RelatedEntity::execution(execution_id),
                TaskAction::Approve,
                "Execution awaiting approval",
            )
            .await;
        info!(%execution_id, ?stage, "Execution stage approved");

        db::find_required::<_, Execution>(db, execution_id, "Execution").await
    }

    /// Final approval: commits consumption and output, completes the step when its output is
    /// reached and moves the order on.
    #[instrument(skip(self))]
    pub async fn approve_execution(
        &self,
        execution_id: Uuid,
        actor_id: Uuid,
    ) -> Result<ApprovalOutcome, ServiceError> {
        let db = &*self.db;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;

        let execution: prod_order_step_execution::Model =
            db::find_locked::<_, Execution>(&txn, execution_id, "Execution").await?;
        ensure_pending(&execution, ExecutionStatus::Approved)?;

        let step: prod_order_step::Model =
            db::find_locked::<_, ProdOrderStep>(&txn, execution.prod_order_step_id, "Prod order step")
                .await?;
        let order: prod_order::Model =
            db::find_locked::<_, ProdOrder>(&txn, step.prod_order_id, "Prod order").await?;

        if !matches!(order.status, OrderStatus::Processing | OrderStatus::Blocked) {
            return Err(ServiceError::InvalidOperation(format!(
                "Prod order {} is {:?}",
                order.id, order.status
            )));
        }
        if step.status != StepStatus::InProgress {
            return Err(ServiceError::InvalidOperation(format!(
                "Prod order step {} is already completed",
                step.id
            )));
        }

        let consumed = ExecutionProduct::find()
            .filter(prod_order_step_execution_product::Column::ProdOrderStepExecutionId.eq(execution_id))
            .all(&txn)
            .await
            .map_err(ServiceError::db_error)?;
        let mut materials: HashMap<Uuid, prod_order_step_product::Model> =
            Self::materials_in(&txn, step.id)
                .await?
                .into_iter()
                .map(|m| (m.product_id, m))
                .collect();

        // Re-check against current totals; other executions may have been approved meanwhile.
        let mut shortfalls = Vec::new();
        for row in &consumed {
            let material = materials.get(&row.product_id).ok_or_else(|| {
                ServiceError::NotFound(format!(
                    "Material {} of step {} not found",
                    row.product_id, step.id
                ))
            })?;
            let over = material.used_quantity + row.used_quantity - material.available_quantity;
            if over > Decimal::ZERO {
                shortfalls.push(shortfall_in(&txn, row.product_id, over).await?);
            }
        }
        if !shortfalls.is_empty() {
            counter!("prodflow.executions.rejected", 1);
            return Err(ServiceError::InsufficientAssets(shortfalls));
        }

        let new_output = step.output_quantity + execution.output_quantity;
        let step_completed = step.is_output_reached(new_output);
        let now = Utc::now();

        for row in &consumed {
            if let Some(material) = materials.get_mut(&row.product_id) {
                let used = material.used_quantity + row.used_quantity;
                *material = Self::set_material_in(
                    &txn,
                    material,
                    material.available_quantity,
                    used,
                    material.status,
                )
                .await?;
            }
        }

        let next_step = if step_completed {
            ProdOrderStep::find()
                .filter(prod_order_step::Column::ProdOrderId.eq(order.id))
                .filter(prod_order_step::Column::Sequence.eq(step.sequence + 1))
                .one(&txn)
                .await
                .map_err(ServiceError::db_error)?
        } else {
            None
        };

        Self::route_output_in(&txn, &order, &step, execution.output_quantity, actor_id).await?;

        if step_completed {
            // Unused reservation goes back to the warehouse.
            for material in materials.values() {
                let surplus = material.free_quantity();
                if surplus > Decimal::ZERO {
                    InventoryService::add_stock_in(
                        &txn,
                        &step_movement(&order, &step, material.product_id, surplus, actor_id),
                    )
                    .await?;
                }
                Self::set_material_in(
                    &txn,
                    material,
                    material.used_quantity,
                    material.used_quantity,
                    MaterialStatus::Completed,
                )
                .await?;
            }
        }

        db::update_versioned(
            &txn,
            prod_order_step::ActiveModel {
                output_quantity: Set(new_output),
                status: Set(if step_completed {
                    StepStatus::Completed
                } else {
                    StepStatus::InProgress
                }),
                completed_at: Set(step_completed.then_some(now)),
                updated_at: Set(now),
                ..Default::default()
            },
            step.id,
            step.version,
        )
        .await?;

        let mut active = prod_order_step_execution::ActiveModel {
            status: Set(ExecutionStatus::Approved),
            updated_at: Set(now),
            ..Default::default()
        };
        active.stamp_approval(ApprovalStage::StockManager, actor_id, now);
        db::update_versioned(&txn, active, execution.id, execution.version).await?;

        let mut events = Vec::new();
        let mut shortfalls = Vec::new();
        let mut supply_orders = Vec::new();
        let mut order_update = prod_order::ActiveModel {
            updated_at: Set(now),
            ..Default::default()
        };
        let mut order_status = order.status;

        if step_completed {
            match &next_step {
                Some(next) => {
                    order_update.current_step_id = Set(Some(next.id));
                    shortfalls = Self::reserve_step_materials_in(
                        &txn,
                        &order,
                        next,
                        actor_id,
                        &mut events,
                    )
                    .await?;
                    if !shortfalls.is_empty() {
                        supply_orders = SupplyOrderService::spawn_for_shortfalls_in(
                            &txn,
                            &order,
                            &shortfalls,
                            actor_id,
                        )
                        .await?;
                        order_status = OrderStatus::Blocked;
                    } else if order.status == OrderStatus::Blocked {
                        // The shortfall that blocked the order belonged to the finished step.
                        ensure_transition(order.status, OrderStatus::Processing)?;
                        order_status = OrderStatus::Processing;
                    }
                }
                None => {
                    ensure_transition(order.status, OrderStatus::Completed)?;
                    order_status = OrderStatus::Completed;
                    order_update.current_step_id = Set(None);
                    order_update.completed_at = Set(Some(now));
                }
            }
            order_update.status = Set(order_status);
        }
        Self::update_order_in(&txn, &order, order_update).await?;

        txn.commit().await.map_err(ServiceError::db_error)?;

        counter!("prodflow.executions.approved", 1);
        events.push(Event::ExecutionApproved {
            execution_id,
            step_id: step.id,
            output_quantity: execution.output_quantity,
        });
        if step_completed {
            counter!("prodflow.prod_order_steps.completed", 1);
            events.push(Event::ProdOrderStepCompleted {
                order_id: order.id,
                step_id: step.id,
                next_step_id: next_step.as_ref().map(|s| s.id),
            });
        }
        if order_status != order.status {
            events.push(Event::ProdOrderStatusChanged {
                order_id: order.id,
                old_status: order.status,
                new_status: order_status,
            });
        }
        events.extend(supply_orders.iter().map(supply_order_created));
        self.emit(events).await;
        for supply_order in &supply_orders {
            SupplyOrderService::announce_created(&self.hooks, supply_order).await;
        }
        if order_status != order.status {
            let changed: prod_order::Model =
                db::find_required::<_, ProdOrder>(db, order.id, "Prod order").await?;
            self.notify_changed(&changed).await;
        }
        info!(
            %execution_id,
            step_id = %step.id,
            step_completed,
            status = ?order_status,
            "Execution approved"
        );

        Ok(ApprovalOutcome {
            execution: db::find_required::<_, Execution>(db, execution_id, "Execution").await?,
            step_completed,
            next_step_id: next_step.map(|s| s.id),
            order_status,
            shortfalls,
            supply_orders,
        })
    }

    /// Output of a step feeds the next step's matching material, otherwise warehouse stock.
    async fn route_output_in<C: ConnectionTrait>(
        conn: &C,
        order: &prod_order::Model,
        step: &prod_order_step::Model,
        quantity: Decimal,
        actor_id: Uuid,
    ) -> Result<(), ServiceError> {
        let next = ProdOrderStep::find()
            .filter(prod_order_step::Column::ProdOrderId.eq(order.id))
            .filter(prod_order_step::Column::Sequence.eq(step.sequence + 1))
            .one(conn)
            .await
            .map_err(ServiceError::db_error)?;

        if let Some(next) = next {
            let consumer = StepMaterial::find()
                .filter(prod_order_step_product::Column::ProdOrderStepId.eq(next.id))
                .filter(prod_order_step_product::Column::ProductId.eq(step.output_product_id))
                .one(conn)
                .await
                .map_err(ServiceError::db_error)?;
            if let Some(material) = consumer {
                debug!(next_step_id = %next.id, %quantity, "Routing output to next step");
                Self::set_material_in(
                    conn,
                    &material,
                    material.available_quantity + quantity,
                    material.used_quantity,
                    material.status,
                )
                .await?;
                return Ok(());
            }
        }

        InventoryService::add_stock_in(
            conn,
            &step_movement(order, step, step.output_product_id, quantity, actor_id),
        )
        .await
    }

    /// Marks a pending execution declined and tells the worker who submitted it.
    #[instrument(skip(self))]
    pub async fn decline_execution(
        &self,
        execution_id: Uuid,
        stage: ApprovalStage,
        reason: String,
        actor_id: Uuid,
    ) -> Result<prod_order_step_execution::Model, ServiceError> {
        if reason.trim().is_empty() {
            return Err(ServiceError::ValidationError(
                "Decline reason is required".to_string(),
            ));
        }

        let db = &*self.db;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;
        let execution: prod_order_step_execution::Model =
            db::find_locked::<_, Execution>(&txn, execution_id, "Execution").await?;
        ensure_pending(&execution, ExecutionStatus::Declined)?;

        let now = Utc::now();
        db::update_versioned(
            &txn,
            prod_order_step_execution::ActiveModel {
                status: Set(ExecutionStatus::Declined),
                declined_at: Set(Some(now)),
                declined_by: Set(Some(actor_id)),
                decline_comment: Set(Some(reason.clone())),
                updated_at: Set(now),
                ..Default::default()
            },
            execution.id,
            execution.version,
        )
        .await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        counter!("prodflow.executions.declined", 1);
        self.emit(vec![Event::ExecutionDeclined {
            execution_id,
            step_id: execution.prod_order_step_id,
        }])
        .await;
        self.hooks
            .notify(
                NotificationEvent::ExecutionDeclined,
                vec![Recipient::User(execution.executed_by)],
                json!({
                    "execution_id": execution_id,
                    "step_id": execution.prod_order_step_id,
                    "stage": stage,
                    "reason": reason,
                }),
            )
            .await;
        info!(%execution_id, ?stage, "Execution declined");

        db::find_required::<_, Execution>(db, execution_id, "Execution").await
    }

    /// Tells production managers a blocked order can continue.
    #[instrument(skip(self))]
    pub async fn notify_prod_order_ready(&self, order_id: Uuid) -> Result<(), ServiceError> {
        let order: prod_order::Model =
            db::find_required::<_, ProdOrder>(&*self.db, order_id, "Prod order").await?;

        self.hooks
            .notify(
                NotificationEvent::ProdOrderReady,
                vec![Recipient::Role(RoleType::ProductionManager)],
                json!({
                    "prod_order_id": order.id,
                    "number": order.number,
                    "current_step_id": order.current_step_id,
                }),
            )
            .await;
        self.hooks
            .create_task(
                vec![RoleType::ProductionManager],
                RelatedEntity::prod_order(order.id),
                TaskAction::Check,
                format!("Materials for order {} are ready", order.number),
            )
            .await;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn approve_order(
        &self,
        order_id: Uuid,
        actor_id: Uuid,
    ) -> Result<prod_order::Model, ServiceError> {
        let db = &*self.db;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;
        let order: prod_order::Model =
            db::find_locked::<_, ProdOrder>(&txn, order_id, "Prod order").await?;
        ensure_transition(order.status, OrderStatus::Approved)?;

        let now = Utc::now();
        Self::update_order_in(
            &txn,
            &order,
            prod_order::ActiveModel {
                status: Set(OrderStatus::Approved),
                approved_at: Set(Some(now)),
                approved_by: Set(Some(actor_id)),
                updated_at: Set(now),
                ..Default::default()
            },
        )
        .await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        counter!("prodflow.prod_orders.approved", 1);
        self.emit(vec![Event::ProdOrderStatusChanged {
            order_id,
            old_status: order.status,
            new_status: OrderStatus::Approved,
        }])
        .await;
        let approved: prod_order::Model =
            db::find_required::<_, ProdOrder>(db, order_id, "Prod order").await?;
        self.notify_changed(&approved).await;
        info!(%order_id, "Prod order approved");
        Ok(approved)
    }

    /// Cancels a live order, returning unused reservations of its current step to the
    /// warehouse. Completed orders can still be cancelled before approval.
    #[instrument(skip(self))]
    pub async fn cancel_order(
        &self,
        order_id: Uuid,
        actor_id: Uuid,
    ) -> Result<prod_order::Model, ServiceError> {
        let db = &*self.db;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;
        let order: prod_order::Model =
            db::find_locked::<_, ProdOrder>(&txn, order_id, "Prod order").await?;
        ensure_transition(order.status, OrderStatus::Cancelled)?;

        if let Some(step_id) = order.current_step_id {
            let step: prod_order_step::Model =
                db::find_required::<_, ProdOrderStep>(&txn, step_id, "Prod order step").await?;
            for material in Self::materials_in(&txn, step_id).await? {
                let surplus = material.free_quantity();
                if surplus <= Decimal::ZERO {
                    continue;
                }
                InventoryService::add_stock_in(
                    &txn,
                    &step_movement(&order, &step, material.product_id, surplus, actor_id),
                )
                .await?;
                Self::set_material_in(
                    &txn,
                    &material,
                    material.used_quantity,
                    material.used_quantity,
                    material.status,
                )
                .await?;
            }
        }

        let now = Utc::now();
        WorkStation::update_many()
            .col_expr(
                work_station::Column::ProdOrderId,
                sea_orm::sea_query::Expr::value(Option::<Uuid>::None),
            )
            .col_expr(
                work_station::Column::UpdatedAt,
                sea_orm::sea_query::Expr::value(now),
            )
            .filter(work_station::Column::ProdOrderId.eq(order_id))
            .exec(&txn)
            .await
            .map_err(ServiceError::db_error)?;

        Self::update_order_in(
            &txn,
            &order,
            prod_order::ActiveModel {
                status: Set(OrderStatus::Cancelled),
                cancelled_at: Set(Some(now)),
                cancelled_by: Set(Some(actor_id)),
                updated_at: Set(now),
                ..Default::default()
            },
        )
        .await?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        counter!("prodflow.prod_orders.cancelled", 1);
        self.emit(vec![Event::ProdOrderStatusChanged {
            order_id,
            old_status: order.status,
            new_status: OrderStatus::Cancelled,
        }])
        .await;
        let cancelled: prod_order::Model =
            db::find_required::<_, ProdOrder>(db, order_id, "Prod order").await?;
        self.hooks
            .resolve_tasks(RelatedEntity::prod_order(order_id), TaskAction::Confirm, actor_id)
            .await;
        self.notify_changed(&cancelled).await;
        info!(%order_id, "Prod order cancelled");
        Ok(cancelled)
    }

    /// Puts the order on a work station and notifies the station's workers.
    #[instrument(skip(self))]
    pub async fn assign_to_work_station(
        &self,
        order_id: Uuid,
        work_station_id: Uuid,
        actor_id: Uuid,
    ) -> Result<work_station::Model, ServiceError> {
        let db = &*self.db;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;
        let order: prod_order::Model =
            db::find_required::<_, ProdOrder>(&txn, order_id, "Prod order").await?;
        if order.status.is_terminal() {
            return Err(ServiceError::InvalidOperation(format!(
                "Prod order {} is {:?}",
                order_id, order.status
            )));
        }
        let station: work_station::Model =
            db::find_locked::<_, WorkStation>(&txn, work_station_id, "Work station").await?;

        let station = work_station::ActiveModel {
            id: Set(station.id),
            prod_order_id: Set(Some(order_id)),
            updated_at: Set(Utc::now()),
            ..Default::default()
        }
        .update(&txn)
        .await
        .map_err(ServiceError::db_error)?;
        txn.commit().await.map_err(ServiceError::db_error)?;

        self.hooks
            .notify(
                NotificationEvent::WorkStationAssigned,
                vec![Recipient::WorkStation(work_station_id)],
                json!({
                    "prod_order_id": order_id,
                    "number": order.number,
                    "assigned_by": actor_id,
                }),
            )
            .await;
        info!(%order_id, %work_station_id, "Prod order assigned to work station");
        Ok(station)
    }

    /// Estimated production days for `quantity` units of a template.
    #[instrument(skip(self))]
    pub async fn calculate_deadline(
        &self,
        template_id: Uuid,
        quantity: Decimal,
    ) -> Result<i64, ServiceError> {
        let db = &*self.db;
        let blueprint = TemplateService::load_blueprint_in(db, template_id).await?;
        Self::deadline_in(db, &blueprint, quantity).await
    }

    /// Material cost of `quantity` units at the warehouse's current unit costs.
    #[instrument(skip(self))]
    pub async fn calculate_total_cost(
        &self,
        template_id: Uuid,
        warehouse_id: Uuid,
        quantity: Decimal,
    ) -> Result<Decimal, ServiceError> {
        let db = &*self.db;
        let blueprint = TemplateService::load_blueprint_in(db, template_id).await?;
        Self::total_cost_in(db, &blueprint, warehouse_id, quantity).await
    }

    async fn deadline_in<C: ConnectionTrait>(
        conn: &C,
        blueprint: &TemplateBlueprint,
        quantity: Decimal,
    ) -> Result<i64, ServiceError> {
        let mut days = 0i64;
        for entry in &blueprint.steps {
            let station: work_station::Model =
                db::find_required::<_, WorkStation>(conn, entry.step.work_station_id, "Work station")
                    .await?;
            let Some(per_day) = quantity_per_day(&station) else {
                continue;
            };
            let step_days = (entry.step.expected_quantity * quantity / per_day).ceil();
            days += step_days.to_i64().unwrap_or(i64::MAX);
        }
        Ok(days)
    }

    async fn total_cost_in<C: ConnectionTrait>(
        conn: &C,
        blueprint: &TemplateBlueprint,
        warehouse_id: Uuid,
        quantity: Decimal,
    ) -> Result<Decimal, ServiceError> {
        let mut total = Decimal::ZERO;
        for material in blueprint.steps.iter().flat_map(|s| &s.materials) {
            let level = InventoryService::load_level(conn, material.product_id, warehouse_id).await?;
            if level.unit_cost > Decimal::ZERO {
                total += level.unit_cost * material.required_quantity * quantity;
            }
        }
        Ok(total)
    }

    #[instrument(skip(self))]
    pub async fn get_order(&self, order_id: Uuid) -> Result<ProdOrderDetails, ServiceError> {
        Self::load_details_in(&*self.db, order_id).await
    }

    #[instrument(skip(self))]
    pub async fn get_execution(&self, execution_id: Uuid) -> Result<ExecutionDetails, ServiceError> {
        let db = &*self.db;
        let execution: prod_order_step_execution::Model =
            db::find_required::<_, Execution>(db, execution_id, "Execution").await?;
        let materials = ExecutionProduct::find()
            .filter(prod_order_step_execution_product::Column::ProdOrderStepExecutionId.eq(execution_id))
            .all(db)
            .await
            .map_err(ServiceError::db_error)?;
        Ok(ExecutionDetails {
            execution,
            materials,
        })
    }

    pub(crate) async fn load_details_in<C: ConnectionTrait>(
        conn: &C,
        order_id: Uuid,
    ) -> Result<ProdOrderDetails, ServiceError> {
        let order: prod_order::Model =
            db::find_required::<_, ProdOrder>(conn, order_id, "Prod order").await?;
        let steps = ProdOrderStep::find()
            .filter(prod_order_step::Column::ProdOrderId.eq(order_id))
            .order_by_asc(prod_order_step::Column::Sequence)
            .all(conn)
            .await
            .map_err(ServiceError::db_error)?;

        let mut details = Vec::with_capacity(steps.len());
        for step in steps {
            let materials = Self::materials_in(conn, step.id).await?;
            details.push(StepDetails { step, materials });
        }
        Ok(ProdOrderDetails {
            order,
            steps: details,
        })
    }

    /// Takes what the warehouse has towards each material's missing quantity. Returns what is
    /// still short; spawning supply orders is up to the caller.
    pub(crate) async fn reserve_step_materials_in<C: ConnectionTrait>(
        conn: &C,
        order: &prod_order::Model,
        step: &prod_order_step::Model,
        actor_id: Uuid,
        events: &mut Vec<Event>,
    ) -> Result<Vec<InsufficientAsset>, ServiceError> {
        let mut shortfalls = Vec::new();
        for material in Self::materials_in(conn, step.id).await? {
            let missing = material.missing_quantity();
            if missing <= Decimal::ZERO {
                continue;
            }

            let taken = InventoryService::take_available_in(
                conn,
                &step_movement(order, step, material.product_id, missing, actor_id),
            )
            .await?;
            let available = material.available_quantity + taken;
            if taken > Decimal::ZERO {
                Self::set_material_in(
                    conn,
                    &material,
                    available,
                    material.used_quantity,
                    material.status,
                )
                .await?;
            }

            let lack = missing - taken;
            events.push(Event::MaterialReserved {
                step_id: step.id,
                product_id: material.product_id,
                available_quantity: available,
                shortfall: lack,
            });
            if lack > Decimal::ZERO {
                shortfalls.push(shortfall_in(conn, material.product_id, lack).await?);
            }
        }
        Ok(shortfalls)
    }

    /// Re-reserves the current step of a blocked order. The order goes back to Processing when
    /// nothing is missing any more; returns the new status.
    pub(crate) async fn resume_blocked_in<C: ConnectionTrait>(
        conn: &C,
        order: &prod_order::Model,
        actor_id: Uuid,
        events: &mut Vec<Event>,
    ) -> Result<OrderStatus, ServiceError> {
        if order.status != OrderStatus::Blocked {
            return Ok(order.status);
        }
        let Some(step_id) = order.current_step_id else {
            return Ok(order.status);
        };

        let step: prod_order_step::Model =
            db::find_locked::<_, ProdOrderStep>(conn, step_id, "Prod order step").await?;
        let shortfalls =
            Self::reserve_step_materials_in(conn, order, &step, actor_id, events).await?;
        if !shortfalls.is_empty() {
            warn!(order_id = %order.id, shortfalls = shortfalls.len(), "Prod order still blocked");
            return Ok(OrderStatus::Blocked);
        }

        Self::update_order_in(
            conn,
            order,
            prod_order::ActiveModel {
                status: Set(OrderStatus::Processing),
                updated_at: Set(Utc::now()),
                ..Default::default()
            },
        )
        .await?;
        events.push(Event::ProdOrderStatusChanged {
            order_id: order.id,
            old_status: OrderStatus::Blocked,
            new_status: OrderStatus::Processing,
        });
        Ok(OrderStatus::Processing)
    }

    async fn materials_in<C: ConnectionTrait>(
        conn: &C,
        step_id: Uuid,
    ) -> Result<Vec<prod_order_step_product::Model>, ServiceError> {
        StepMaterial::find()
            .filter(prod_order_step_product::Column::ProdOrderStepId.eq(step_id))
            .order_by_asc(prod_order_step_product::Column::CreatedAt)
            .all(conn)
            .await
            .map_err(ServiceError::db_error)
    }

    async fn material_in<C: ConnectionTrait>(
        conn: &C,
        step_id: Uuid,
        product_id: Uuid,
    ) -> Result<prod_order_step_product::Model, ServiceError> {
        StepMaterial::find()
            .filter(prod_order_step_product::Column::ProdOrderStepId.eq(step_id))
            .filter(prod_order_step_product::Column::ProductId.eq(product_id))
            .one(conn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::NotFound(format!(
                    "Material {} of step {} not found",
                    product_id, step_id
                ))
            })
    }

    /// Quantities claimed by executions still awaiting approval, per product.
    async fn pending_usage_in<C: ConnectionTrait>(
        conn: &C,
        step_id: Uuid,
    ) -> Result<HashMap<Uuid, Decimal>, ServiceError> {
        let pending_ids: Vec<Uuid> = Execution::find()
            .filter(prod_order_step_execution::Column::ProdOrderStepId.eq(step_id))
            .filter(prod_order_step_execution::Column::Status.eq(ExecutionStatus::Pending))
            .all(conn)
            .await
            .map_err(ServiceError::db_error)?
            .into_iter()
            .map(|e| e.id)
            .collect();

        let mut usage = HashMap::new();
        if pending_ids.is_empty() {
            return Ok(usage);
        }

        let rows = ExecutionProduct::find()
            .filter(prod_order_step_execution_product::Column::ProdOrderStepExecutionId.is_in(pending_ids))
            .all(conn)
            .await
            .map_err(ServiceError::db_error)?;
        for row in rows {
            *usage.entry(row.product_id).or_insert(Decimal::ZERO) += row.used_quantity;
        }
        Ok(usage)
    }

    async fn set_material_in<C: ConnectionTrait>(
        conn: &C,
        material: &prod_order_step_product::Model,
        available: Decimal,
        used: Decimal,
        status: MaterialStatus,
    ) -> Result<prod_order_step_product::Model, ServiceError> {
        let now = Utc::now();
        db::update_versioned(
            conn,
            prod_order_step_product::ActiveModel {
                available_quantity: Set(available),
                used_quantity: Set(used),
                status: Set(status),
                updated_at: Set(now),
                ..Default::default()
            },
            material.id,
            material.version,
        )
        .await?;

        Ok(prod_order_step_product::Model {
            available_quantity: available,
            used_quantity: used,
            status,
            version: material.version + 1,
            updated_at: now,
            ..material.clone()
        })
    }

    async fn update_order_in<C: ConnectionTrait>(
        conn: &C,
        order: &prod_order::Model,
        active: prod_order::ActiveModel,
    ) -> Result<(), ServiceError> {
        db::update_versioned(conn, active, order.id, order.version).await
    }

    /// Tells production managers about a new order and asks them to confirm it.
    async fn announce_created(&self, order: &prod_order::Model) {
        self.hooks
            .notify(
                NotificationEvent::ProdOrderCreated,
                vec![Recipient::Role(RoleType::ProductionManager)],
                order_payload(order),
            )
            .await;
        self.hooks
            .create_task(
                vec![RoleType::ProductionManager],
                RelatedEntity::prod_order(order.id),
                TaskAction::Confirm,
                format!(
                    "New production order {} created. Please confirm the order.",
                    order.number
                ),
            )
            .await;
    }

    async fn notify_changed(&self, order: &prod_order::Model) {
        self.hooks
            .notify(
                NotificationEvent::ProdOrderChanged,
                vec![Recipient::Role(RoleType::ProductionManager)],
                order_payload(order),
            )
            .await;
    }

    async fn emit(&self, events: Vec<Event>) {
        if let Some(sender) = &self.event_sender {
            for event in events {
                sender.send_or_log(event).await;
            }
        }
    }
}

fn order_payload(order: &prod_order::Model) -> serde_json::Value {
    json!({
        "prod_order_id": order.id,
        "number": order.number,
        "group_id": order.prod_order_group_id,
        "status": order.status,
        "quantity": order.quantity,
    })
}

fn ensure_transition(from: OrderStatus, to: OrderStatus) -> Result<(), ServiceError> {
    if (from == to && !from.is_terminal()) || from.can_transition_to(to) {
        Ok(())
    } else {
        Err(ServiceError::invalid_transition(from, to))
    }
}

fn ensure_pending(
    execution: &prod_order_step_execution::Model,
    target: ExecutionStatus,
) -> Result<(), ServiceError> {
    match execution.status {
        ExecutionStatus::Pending => Ok(()),
        ExecutionStatus::Approved => Err(ServiceError::AlreadyApproved(execution.id)),
        ExecutionStatus::Declined => Err(ServiceError::invalid_transition(
            ExecutionStatus::Declined,
            target,
        )),
    }
}

fn step_movement(
    order: &prod_order::Model,
    step: &prod_order_step::Model,
    product_id: Uuid,
    quantity: Decimal,
    actor_id: Uuid,
) -> StockMovement {
    StockMovement::new(product_id, order.warehouse_id, quantity)
        .linked(TransactionLinks {
            prod_order_id: Some(order.id),
            work_station_id: Some(step.work_station_id),
            ..Default::default()
        })
        .by(actor_id)
}

fn supply_order_created(order: &supply_order::Model) -> Event {
    Event::SupplyOrderCreated {
        supply_order_id: order.id,
        prod_order_id: order.prod_order_id,
    }
}

pub(crate) async fn shortfall_in<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
    missing_quantity: Decimal,
) -> Result<InsufficientAsset, ServiceError> {
    let product: product::Model =
        db::find_required::<_, Product>(conn, product_id, "Product").await?;
    Ok(InsufficientAsset {
        product_id,
        product_name: product.name,
        product_category_id: product.product_category_id,
        missing_quantity,
    })
}

async fn prod_template_for<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
) -> Result<Uuid, ServiceError> {
    use crate::entities::prod_template::{self, Entity as ProdTemplate};

    ProdTemplate::find()
        .filter(prod_template::Column::ProductId.eq(product_id))
        .order_by_desc(prod_template::Column::CreatedAt)
        .one(conn)
        .await
        .map_err(ServiceError::db_error)?
        .map(|t| t.id)
        .ok_or_else(|| ServiceError::NotFound(format!("No template found for product {}", product_id)))
}
