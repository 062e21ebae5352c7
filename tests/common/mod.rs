#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use prodflow::{
    db::{self, DbConfig, DbPool},
    entities::{
        product::{self, ProductType},
        product_category::{self, MeasureUnit},
        task::RoleType,
        work_station::{self, DurationUnit},
    },
    events::{Event, EventSender},
    notifications::{Hooks, NotificationError, NotificationEvent, Notifier, Recipient},
    services::{
        inventory::{InventoryService, StockMovement},
        prod_orders::{NewProdOrder, ProdOrderDetails, ProdOrderService},
        supply_orders::SupplyOrderService,
        tasks::{DbTaskQueue, TaskService},
        templates::{NewTemplate, NewTemplateMaterial, NewTemplateStep, TemplateService},
    },
    ServiceFactory,
};
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, Set};
use tokio::sync::mpsc;
use uuid::Uuid;

/// Notifier that remembers every call.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(NotificationEvent, Vec<Recipient>, serde_json::Value)>>,
}

impl RecordingNotifier {
    pub fn sent(&self) -> Vec<(NotificationEvent, Vec<Recipient>, serde_json::Value)> {
        self.sent.lock().expect("notifier lock").clone()
    }

    pub fn count(&self, event: NotificationEvent) -> usize {
        self.sent().iter().filter(|(e, _, _)| *e == event).count()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(
        &self,
        event: NotificationEvent,
        recipients: Vec<Recipient>,
        payload: serde_json::Value,
    ) -> Result<(), NotificationError> {
        self.sent
            .lock()
            .expect("notifier lock")
            .push((event, recipients, payload));
        Ok(())
    }
}

/// Services over a fresh in-memory SQLite database.
pub struct TestContext {
    pub db: Arc<DbPool>,
    pub notifier: Arc<RecordingNotifier>,
    pub inventory: InventoryService,
    pub templates: TemplateService,
    pub prod_orders: ProdOrderService,
    pub supply_orders: SupplyOrderService,
    pub tasks: TaskService,
    pub events: mpsc::Receiver<Event>,
    pub actor: Uuid,
    pub warehouse: Uuid,
}

impl TestContext {
    pub async fn new() -> Self {
        // One connection: every pooled connection would otherwise get its own empty database.
        let config = DbConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(5),
            sqlx_logging: false,
            ..Default::default()
        };
        let pool = db::establish_connection_with_config(&config)
            .await
            .expect("failed to create test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let db = Arc::new(pool);
        let (tx, events) = mpsc::channel(1024);
        let notifier = Arc::new(RecordingNotifier::default());
        let hooks = Hooks::new(notifier.clone(), Arc::new(DbTaskQueue::new(db.clone())));
        let factory = ServiceFactory::new(db.clone(), hooks, Some(EventSender::new(tx)));

        Self {
            inventory: factory.inventory_service(),
            templates: factory.template_service(),
            prod_orders: factory.prod_order_service(),
            supply_orders: factory.supply_order_service(),
            tasks: factory.task_service(),
            db,
            notifier,
            events,
            actor: Uuid::new_v4(),
            warehouse: Uuid::new_v4(),
        }
    }

    pub fn drain_events(&mut self) -> Vec<Event> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    pub async fn category(&self, code: &str) -> product_category::Model {
        product_category::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(format!("{} materials", code)),
            code: Set(code.to_string()),
            measure_unit: Set(MeasureUnit::Kg),
            created_at: Set(Utc::now()),
        }
        .insert(&*self.db)
        .await
        .expect("insert category")
    }

    pub async fn product(
        &self,
        name: &str,
        category: &product_category::Model,
        product_type: ProductType,
    ) -> product::Model {
        product::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            product_category_id: Set(category.id),
            product_type: Set(product_type),
            work_station_id: Set(None),
            ready_product_id: Set(None),
            created_at: Set(Utc::now()),
        }
        .insert(&*self.db)
        .await
        .expect("insert product")
    }

    pub async fn work_station(&self, name: &str) -> work_station::Model {
        let now = Utc::now();
        work_station::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            prod_order_id: Set(None),
            performance_qty: Set(Some(Decimal::from(10))),
            performance_duration: Set(Some(Decimal::ONE)),
            performance_duration_unit: Set(Some(DurationUnit::Day)),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await
        .expect("insert work station")
    }

    pub async fn stock(&self, product_id: Uuid, quantity: Decimal) {
        self.inventory
            .add_stock(StockMovement::new(product_id, self.warehouse, quantity).by(self.actor))
            .await
            .expect("add stock");
    }

    pub async fn stock_level(&self, product_id: Uuid) -> Decimal {
        self.inventory
            .get_inventory(product_id, self.warehouse)
            .await
            .expect("inventory")
            .quantity
    }

    /// Template whose steps each consume `materials[i]` per unit and output one unit.
    /// The last step outputs `ready`.
    pub async fn template(
        &self,
        ready: &product::Model,
        stations: &[&work_station::Model],
        materials: &[Vec<(Uuid, Decimal)>],
    ) -> Uuid {
        let template = self
            .templates
            .create_template(
                NewTemplate {
                    product_id: ready.id,
                    comment: None,
                },
                self.actor,
            )
            .await
            .expect("create template");

        for (i, station) in stations.iter().enumerate() {
            let is_last = i + 1 == stations.len();
            self.templates
                .add_step(
                    template.id,
                    NewTemplateStep {
                        sequence: i as i32 + 1,
                        work_station_id: station.id,
                        output_product_id: None,
                        expected_quantity: Decimal::ONE,
                        is_last,
                        materials: materials[i]
                            .iter()
                            .map(|(product_id, qty)| NewTemplateMaterial {
                                product_id: *product_id,
                                required_quantity: *qty,
                            })
                            .collect(),
                    },
                    self.actor,
                )
                .await
                .expect("add template step");
        }
        template.id
    }

    pub async fn order(&self, template_id: Uuid, quantity: Decimal) -> ProdOrderDetails {
        self.prod_orders
            .instantiate(
                NewProdOrder {
                    template_id,
                    warehouse_id: self.warehouse,
                    quantity,
                    offer_price: Decimal::ZERO,
                    prod_order_group_id: None,
                },
                self.actor,
            )
            .await
            .expect("instantiate order")
    }

    /// Instantiates, confirms and starts an order.
    pub async fn started_order(&self, template_id: Uuid, quantity: Decimal) -> ProdOrderDetails {
        let order = self.order(template_id, quantity).await;
        self.prod_orders
            .confirm(order.order.id, self.actor)
            .await
            .expect("confirm order");
        self.prod_orders
            .start(order.order.id, self.actor)
            .await
            .expect("start order");
        self.prod_orders
            .get_order(order.order.id)
            .await
            .expect("load order")
    }

    pub async fn open_tasks(&self, role: RoleType) -> usize {
        self.tasks
            .open_for_role(role)
            .await
            .expect("open tasks")
            .len()
    }
}
