use std::sync::Arc;

use crate::{
    db::DbPool,
    events::EventSender,
    notifications::{Hooks, LogNotifier},
    services::{
        inventory::InventoryService, prod_orders::ProdOrderService,
        supply_orders::SupplyOrderService, tasks::DbTaskQueue, tasks::TaskService,
        templates::TemplateService,
    },
};

/// Builds services sharing one pool, one set of hooks and one event channel.
pub struct ServiceFactory {
    db_pool: Arc<DbPool>,
    hooks: Hooks,
    event_sender: Option<EventSender>,
}

impl ServiceFactory {
    pub fn new(db_pool: Arc<DbPool>, hooks: Hooks, event_sender: Option<EventSender>) -> Self {
        Self {
            db_pool,
            hooks,
            event_sender,
        }
    }

    /// Log-only notifications and tasks persisted in the same database.
    pub fn with_default_hooks(db_pool: Arc<DbPool>, event_sender: Option<EventSender>) -> Self {
        let hooks = Hooks::new(
            Arc::new(LogNotifier),
            Arc::new(DbTaskQueue::new(db_pool.clone())),
        );
        Self::new(db_pool, hooks, event_sender)
    }

    pub fn inventory_service(&self) -> InventoryService {
        InventoryService::new(self.db_pool.clone(), self.event_sender.clone())
    }

    pub fn template_service(&self) -> TemplateService {
        TemplateService::new(self.db_pool.clone())
    }

    pub fn prod_order_service(&self) -> ProdOrderService {
        ProdOrderService::new(
            self.db_pool.clone(),
            self.hooks.clone(),
            self.event_sender.clone(),
        )
    }

    pub fn supply_order_service(&self) -> SupplyOrderService {
        SupplyOrderService::new(
            self.db_pool.clone(),
            self.prod_order_service(),
            self.hooks.clone(),
            self.event_sender.clone(),
        )
    }

    pub fn task_service(&self) -> TaskService {
        TaskService::new(self.db_pool.clone())
    }

    pub fn db_pool(&self) -> &Arc<DbPool> {
        &self.db_pool
    }
}

/// Service container holding all service instances
#[derive(Clone)]
pub struct ServiceContainer {
    pub inventory: Arc<InventoryService>,
    pub templates: Arc<TemplateService>,
    pub prod_orders: Arc<ProdOrderService>,
    pub supply_orders: Arc<SupplyOrderService>,
    pub tasks: Arc<TaskService>,
}

impl ServiceContainer {
    pub fn new(factory: &ServiceFactory) -> Self {
        Self {
            inventory: Arc::new(factory.inventory_service()),
            templates: Arc::new(factory.template_service()),
            prod_orders: Arc::new(factory.prod_order_service()),
            supply_orders: Arc::new(factory.supply_order_service()),
            tasks: Arc::new(factory.task_service()),
        }
    }
}
