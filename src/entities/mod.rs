//! sea-orm entities, one module per table.

pub mod inventory;
pub mod inventory_item;
pub mod inventory_transaction;
pub mod prod_order;
pub mod prod_order_group;
pub mod prod_order_step;
pub mod prod_order_step_execution;
pub mod prod_order_step_execution_product;
pub mod prod_order_step_product;
pub mod prod_template;
pub mod prod_template_step;
pub mod prod_template_step_product;
pub mod product;
pub mod product_category;
pub mod supply_order;
pub mod supply_order_location;
pub mod supply_order_product;
pub mod supply_order_step;
pub mod task;
pub mod work_station;
