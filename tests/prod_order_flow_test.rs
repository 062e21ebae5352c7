mod common;

use assert_matches::assert_matches;
use common::TestContext;
use prodflow::{
    entities::{
        prod_order::OrderStatus,
        prod_order_step::StepStatus,
        prod_order_step_execution::{ApprovalStage, ExecutionStatus},
        prod_order_step_product::MaterialStatus,
        prod_order_group::ProdOrderGroupType,
        product::ProductType,
        supply_order::SupplyOrderState,
        task::{RelatedType, RoleType, TaskAction, TaskStatus},
    },
    errors::ServiceError,
    events::Event,
    notifications::{NotificationEvent, Recipient},
    services::{
        inventory::StockMovement,
        prod_orders::{ExecutionMaterial, NewExecution, NewOrderGroup, NewOrderLine},
        templates::{NewTemplate, NewTemplateMaterial, NewTemplateStep},
    },
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use uuid::Uuid;

fn execution(materials: &[(Uuid, Decimal)], output: Decimal) -> NewExecution {
    NewExecution {
        materials: materials
            .iter()
            .map(|(product_id, used_quantity)| ExecutionMaterial {
                product_id: *product_id,
                used_quantity: *used_quantity,
            })
            .collect(),
        output_quantity: output,
        notes: None,
    }
}

struct Fixture {
    ctx: TestContext,
    steel: Uuid,
    chair: Uuid,
    template: Uuid,
}

/// One-step template consuming 1 kg of steel per chair.
async fn single_step() -> Fixture {
    let ctx = TestContext::new().await;
    let metals = ctx.category("MET").await;
    let furniture = ctx.category("FUR").await;
    let steel = ctx.product("Steel", &metals, ProductType::RawMaterial).await;
    let chair = ctx.product("Chair", &furniture, ProductType::ReadyProduct).await;
    let welder = ctx.work_station("Welder").await;
    let template = ctx
        .template(&chair, &[&welder], &[vec![(steel.id, dec!(1))]])
        .await;
    Fixture {
        ctx,
        steel: steel.id,
        chair: chair.id,
        template,
    }
}

#[tokio::test]
async fn instantiate_scales_template_quantities() {
    let f = single_step().await;
    let order = f.ctx.order(f.template, dec!(10)).await;

    assert_eq!(order.order.status, OrderStatus::Pending);
    assert!(order.order.number.starts_with("PO-"));
    assert_eq!(order.steps.len(), 1);
    let step = &order.steps[0];
    assert_eq!(step.step.expected_quantity, dec!(10));
    let material = step.material(f.steel).expect("steel material");
    assert_eq!(material.required_quantity, dec!(10));
    assert_eq!(material.available_quantity, Decimal::ZERO);
    assert!(order.current_step().is_none());
}

#[tokio::test]
async fn check_materials_reports_missing_quantity() {
    let f = single_step().await;
    f.ctx.stock(f.steel, dec!(4)).await;
    let order = f.ctx.order(f.template, dec!(10)).await;
    let step_id = order.steps[0].step.id;

    let shortfalls = f
        .ctx
        .prod_orders
        .check_materials_exact(step_id, f.steel, dec!(10))
        .await
        .unwrap();
    assert_eq!(shortfalls.len(), 1);
    assert_eq!(shortfalls[0].product_id, f.steel);
    assert_eq!(shortfalls[0].product_name, "Steel");
    assert_eq!(shortfalls[0].missing_quantity, dec!(6));

    // Adding on top of the current reservation.
    let adding = f
        .ctx
        .prod_orders
        .check_materials(step_id, f.steel, dec!(3), true)
        .await
        .unwrap();
    assert!(adding.is_empty());
}

#[tokio::test]
async fn exact_check_counts_the_current_reservation() {
    let f = single_step().await;
    f.ctx.stock(f.steel, dec!(10)).await;
    let order = f.ctx.started_order(f.template, dec!(10)).await;
    let step_id = order.steps[0].step.id;
    assert_eq!(f.ctx.stock_level(f.steel).await, Decimal::ZERO);

    // 10 already held, so a total of 12 needs 2 more from an empty warehouse.
    let exact = f
        .ctx
        .prod_orders
        .check_materials_exact(step_id, f.steel, dec!(12))
        .await
        .unwrap();
    assert_eq!(exact[0].missing_quantity, dec!(2));
    assert!(f
        .ctx
        .prod_orders
        .check_materials_exact(step_id, f.steel, dec!(10))
        .await
        .unwrap()
        .is_empty());

    // The adding form compares the extra amount with stock as-is.
    let adding = f
        .ctx
        .prod_orders
        .check_materials(step_id, f.steel, dec!(12), true)
        .await
        .unwrap();
    assert_eq!(adding[0].missing_quantity, dec!(12));
}

#[tokio::test]
async fn start_requires_confirmation_once() {
    let f = single_step().await;
    f.ctx.stock(f.steel, dec!(10)).await;
    let order = f.ctx.order(f.template, dec!(10)).await;
    let id = order.order.id;

    assert_matches!(
        f.ctx.prod_orders.start(id, f.ctx.actor).await,
        Err(ServiceError::InvalidOperation(_))
    );

    let confirmed = f.ctx.prod_orders.confirm(id, f.ctx.actor).await.unwrap();
    let again = f.ctx.prod_orders.confirm(id, Uuid::new_v4()).await.unwrap();
    assert_eq!(confirmed.confirmed_at, again.confirmed_at);
    assert_eq!(again.confirmed_by, Some(f.ctx.actor));

    let outcome = f.ctx.prod_orders.start(id, f.ctx.actor).await.unwrap();
    assert_eq!(outcome.order.status, OrderStatus::Processing);
    assert!(outcome.shortfalls.is_empty());
    assert_eq!(outcome.order.current_step_id, Some(order.steps[0].step.id));
    assert_eq!(f.ctx.stock_level(f.steel).await, Decimal::ZERO);

    assert_matches!(
        f.ctx.prod_orders.start(id, f.ctx.actor).await,
        Err(ServiceError::InvalidOperation(_))
    );
}

#[tokio::test]
async fn shortfall_on_start_blocks_and_spawns_supply_order() {
    let mut f = single_step().await;
    f.ctx.stock(f.steel, dec!(4)).await;
    let order = f.ctx.order(f.template, dec!(10)).await;
    let id = order.order.id;
    f.ctx.prod_orders.confirm(id, f.ctx.actor).await.unwrap();

    let outcome = f.ctx.prod_orders.start(id, f.ctx.actor).await.unwrap();
    assert_eq!(outcome.order.status, OrderStatus::Blocked);
    assert_eq!(outcome.shortfalls.len(), 1);
    assert_eq!(outcome.shortfalls[0].missing_quantity, dec!(6));
    assert_eq!(outcome.supply_orders.len(), 1);

    let supply = f
        .ctx
        .supply_orders
        .get_order(outcome.supply_orders[0].id)
        .await
        .unwrap();
    assert_eq!(supply.order.state, SupplyOrderState::Created);
    assert_eq!(supply.order.status.as_deref(), Some("supply_dep"));
    assert_eq!(supply.order.prod_order_id, Some(id));
    assert_eq!(supply.products.len(), 1);
    assert_eq!(supply.products[0].expected_quantity, dec!(6));
    assert_eq!(supply.steps.len(), 1);

    let details = f.ctx.prod_orders.get_order(id).await.unwrap();
    let material = details.steps[0].material(f.steel).unwrap();
    assert_eq!(material.available_quantity, dec!(4));

    let events = f.ctx.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        Event::ProdOrderStatusChanged { new_status: OrderStatus::Blocked, .. }
    )));
    assert!(events
        .iter()
        .any(|e| matches!(e, Event::SupplyOrderCreated { prod_order_id: Some(p), .. } if *p == id)));
}

#[tokio::test]
async fn approving_full_output_completes_last_step_and_order() {
    let f = single_step().await;
    f.ctx.stock(f.steel, dec!(5)).await;
    let order = f.ctx.started_order(f.template, dec!(5)).await;
    let step_id = order.steps[0].step.id;

    let exec = f
        .ctx
        .prod_orders
        .create_execution(step_id, execution(&[(f.steel, dec!(5))], dec!(5)), f.ctx.actor)
        .await
        .unwrap();
    assert_eq!(exec.execution.status, ExecutionStatus::Pending);
    assert_eq!(f.ctx.open_tasks(RoleType::ProductionManager).await, 1);

    let outcome = f
        .ctx
        .prod_orders
        .approve_execution(exec.execution.id, f.ctx.actor)
        .await
        .unwrap();
    assert!(outcome.step_completed);
    assert_eq!(outcome.next_step_id, None);
    assert_eq!(outcome.order_status, OrderStatus::Completed);
    assert_eq!(outcome.execution.status, ExecutionStatus::Approved);
    assert_eq!(outcome.execution.approved_by, Some(f.ctx.actor));

    let details = f.ctx.prod_orders.get_order(order.order.id).await.unwrap();
    assert_eq!(details.order.status, OrderStatus::Completed);
    assert!(details.order.completed_at.is_some());
    assert_eq!(details.order.current_step_id, None);
    assert_eq!(details.steps[0].step.status, StepStatus::Completed);
    assert_eq!(details.steps[0].step.output_quantity, dec!(5));
    let material = details.steps[0].material(f.steel).unwrap();
    assert_eq!(material.used_quantity, dec!(5));
    assert_eq!(material.status, MaterialStatus::Completed);
    assert_eq!(f.ctx.stock_level(f.chair).await, dec!(5));

    // Totals change once.
    assert_matches!(
        f.ctx
            .prod_orders
            .approve_execution(exec.execution.id, f.ctx.actor)
            .await,
        Err(ServiceError::AlreadyApproved(_))
    );
    assert_eq!(f.ctx.stock_level(f.chair).await, dec!(5));

    let approved = f
        .ctx
        .prod_orders
        .approve_order(order.order.id, f.ctx.actor)
        .await
        .unwrap();
    assert_eq!(approved.status, OrderStatus::Approved);
}

#[tokio::test]
async fn partial_output_keeps_step_open_and_returns_leftovers_on_completion() {
    let f = single_step().await;
    f.ctx.stock(f.steel, dec!(6)).await;
    let order = f.ctx.started_order(f.template, dec!(4)).await;
    let step_id = order.steps[0].step.id;
    // Stock 6, reservation 4.
    assert_eq!(f.ctx.stock_level(f.steel).await, dec!(2));

    let first = f
        .ctx
        .prod_orders
        .create_execution(step_id, execution(&[(f.steel, dec!(2))], dec!(2)), f.ctx.actor)
        .await
        .unwrap();
    let outcome = f
        .ctx
        .prod_orders
        .approve_execution(first.execution.id, f.ctx.actor)
        .await
        .unwrap();
    assert!(!outcome.step_completed);
    assert_eq!(outcome.order_status, OrderStatus::Processing);

    // Finishing with less material than reserved.
    let second = f
        .ctx
        .prod_orders
        .create_execution(step_id, execution(&[(f.steel, dec!(1))], dec!(2)), f.ctx.actor)
        .await
        .unwrap();
    let outcome = f
        .ctx
        .prod_orders
        .approve_execution(second.execution.id, f.ctx.actor)
        .await
        .unwrap();
    assert!(outcome.step_completed);

    let details = f.ctx.prod_orders.get_order(order.order.id).await.unwrap();
    let material = details.steps[0].material(f.steel).unwrap();
    assert_eq!(material.used_quantity, dec!(3));
    assert_eq!(material.available_quantity, dec!(3));
    assert_eq!(f.ctx.stock_level(f.steel).await, dec!(3));
}

#[tokio::test]
async fn executions_cannot_claim_more_than_free_material() {
    let f = single_step().await;
    f.ctx.stock(f.steel, dec!(5)).await;
    let order = f.ctx.started_order(f.template, dec!(5)).await;
    let step_id = order.steps[0].step.id;

    let first = f
        .ctx
        .prod_orders
        .create_execution(step_id, execution(&[(f.steel, dec!(3))], dec!(1)), f.ctx.actor)
        .await
        .expect("first claim fits");

    let second = f
        .ctx
        .prod_orders
        .create_execution(step_id, execution(&[(f.steel, dec!(3))], dec!(1)), f.ctx.actor)
        .await;
    let err = second.expect_err("pending claims count against the reservation");
    assert_matches!(err, ServiceError::InsufficientAssets(_));
    assert_eq!(err.shortfalls()[0].missing_quantity, dec!(1));

    // Shrinking the reservation under a pending claim makes approval fail.
    f.ctx
        .prod_orders
        .update_material_available_exact(step_id, f.steel, dec!(2), f.ctx.actor)
        .await
        .unwrap();
    assert_matches!(
        f.ctx
            .prod_orders
            .approve_execution(first.execution.id, f.ctx.actor)
            .await,
        Err(ServiceError::InsufficientAssets(_))
    );

    let details = f.ctx.prod_orders.get_order(order.order.id).await.unwrap();
    assert_eq!(details.steps[0].material(f.steel).unwrap().used_quantity, Decimal::ZERO);
}

#[tokio::test]
async fn execution_requests_are_validated() {
    let f = single_step().await;
    f.ctx.stock(f.steel, dec!(5)).await;
    let order = f.ctx.started_order(f.template, dec!(5)).await;
    let step_id = order.steps[0].step.id;

    let foreign = Uuid::new_v4();
    assert_matches!(
        f.ctx
            .prod_orders
            .create_execution(step_id, execution(&[(foreign, dec!(1))], dec!(1)), f.ctx.actor)
            .await,
        Err(ServiceError::ValidationError(_))
    );
    assert_matches!(
        f.ctx
            .prod_orders
            .create_execution(
                step_id,
                execution(&[(f.steel, dec!(1)), (f.steel, dec!(1))], dec!(1)),
                f.ctx.actor
            )
            .await,
        Err(ServiceError::ValidationError(_))
    );
    assert_matches!(
        f.ctx
            .prod_orders
            .create_execution(step_id, execution(&[(f.steel, dec!(1))], dec!(0)), f.ctx.actor)
            .await,
        Err(ServiceError::ValidationError(_))
    );
    let mut long_notes = execution(&[(f.steel, dec!(1))], dec!(1));
    long_notes.notes = Some("x".repeat(256));
    assert_matches!(
        f.ctx
            .prod_orders
            .create_execution(step_id, long_notes, f.ctx.actor)
            .await,
        Err(ServiceError::ValidationError(_))
    );
}

#[tokio::test]
async fn declined_execution_notifies_worker_and_changes_nothing() {
    let f = single_step().await;
    f.ctx.stock(f.steel, dec!(5)).await;
    let order = f.ctx.started_order(f.template, dec!(5)).await;
    let step_id = order.steps[0].step.id;
    let worker = Uuid::new_v4();

    let exec = f
        .ctx
        .prod_orders
        .create_execution(step_id, execution(&[(f.steel, dec!(2))], dec!(2)), worker)
        .await
        .unwrap();
    let id = exec.execution.id;

    assert_matches!(
        f.ctx
            .prod_orders
            .decline_execution(id, ApprovalStage::ProductionManager, "  ".into(), f.ctx.actor)
            .await,
        Err(ServiceError::ValidationError(_))
    );

    let declined = f
        .ctx
        .prod_orders
        .decline_execution(
            id,
            ApprovalStage::ProductionManager,
            "Wrong count".into(),
            f.ctx.actor,
        )
        .await
        .unwrap();
    assert_eq!(declined.status, ExecutionStatus::Declined);
    assert_eq!(declined.decline_comment.as_deref(), Some("Wrong count"));

    let sent = f.ctx.notifier.sent();
    let (_, recipients, payload) = sent
        .iter()
        .find(|(e, _, _)| *e == NotificationEvent::ExecutionDeclined)
        .expect("decline notification");
    assert_eq!(recipients, &vec![Recipient::User(worker)]);
    assert_eq!(payload["reason"], "Wrong count");

    assert_matches!(
        f.ctx.prod_orders.approve_execution(id, f.ctx.actor).await,
        Err(ServiceError::InvalidTransition { .. })
    );
    let details = f.ctx.prod_orders.get_order(order.order.id).await.unwrap();
    assert_eq!(details.steps[0].step.output_quantity, Decimal::ZERO);
    assert_eq!(details.steps[0].material(f.steel).unwrap().used_quantity, Decimal::ZERO);
}

#[tokio::test]
async fn stage_approvals_stamp_and_hand_over() {
    let f = single_step().await;
    f.ctx.stock(f.steel, dec!(5)).await;
    let order = f.ctx.started_order(f.template, dec!(5)).await;
    let step_id = order.steps[0].step.id;
    let exec = f
        .ctx
        .prod_orders
        .create_execution(step_id, execution(&[(f.steel, dec!(1))], dec!(1)), f.ctx.actor)
        .await
        .unwrap();
    let id = exec.execution.id;

    let stamped = f
        .ctx
        .prod_orders
        .approve_execution_stage(id, ApprovalStage::ProductionManager, f.ctx.actor)
        .await
        .unwrap();
    assert!(stamped.prod_manager_approved_at.is_some());
    assert_eq!(stamped.status, ExecutionStatus::Pending);
    assert_eq!(f.ctx.open_tasks(RoleType::SeniorProductionManager).await, 1);

    let again = f
        .ctx
        .prod_orders
        .approve_execution_stage(id, ApprovalStage::ProductionManager, Uuid::new_v4())
        .await
        .unwrap();
    assert_eq!(again.prod_manager_approved_at, stamped.prod_manager_approved_at);
    assert_eq!(again.prod_manager_approved_by, Some(f.ctx.actor));

    f.ctx
        .prod_orders
        .approve_execution_stage(id, ApprovalStage::SeniorProductionManager, f.ctx.actor)
        .await
        .unwrap();
    let final_approval = f
        .ctx
        .prod_orders
        .approve_execution_stage(id, ApprovalStage::StockManager, f.ctx.actor)
        .await
        .unwrap();
    assert_eq!(final_approval.status, ExecutionStatus::Approved);

    let details = f.ctx.prod_orders.get_order(order.order.id).await.unwrap();
    assert_eq!(details.steps[0].step.output_quantity, dec!(1));
}

#[tokio::test]
async fn material_reservation_can_be_moved_both_ways() {
    let f = single_step().await;
    f.ctx.stock(f.steel, dec!(12)).await;
    let order = f.ctx.started_order(f.template, dec!(10)).await;
    let step_id = order.steps[0].step.id;
    assert_eq!(f.ctx.stock_level(f.steel).await, dec!(2));

    let lowered = f
        .ctx
        .prod_orders
        .update_material_available_exact(step_id, f.steel, dec!(7), f.ctx.actor)
        .await
        .unwrap();
    assert_eq!(lowered.material.available_quantity, dec!(7));
    assert_eq!(lowered.lack, Decimal::ZERO);
    assert_eq!(f.ctx.stock_level(f.steel).await, dec!(5));

    let same = f
        .ctx
        .prod_orders
        .update_material_available_exact(step_id, f.steel, dec!(7), f.ctx.actor)
        .await
        .unwrap();
    assert_eq!(same.material.version, lowered.material.version);
    assert_eq!(f.ctx.stock_level(f.steel).await, dec!(5));

    let raised = f
        .ctx
        .prod_orders
        .update_material_available_exact(step_id, f.steel, dec!(15), f.ctx.actor)
        .await
        .unwrap();
    assert_eq!(raised.material.available_quantity, dec!(12));
    assert_eq!(raised.lack, dec!(3));
    assert_eq!(raised.order_status, OrderStatus::Blocked);
    assert_eq!(raised.supply_orders.len(), 1);
    assert_eq!(f.ctx.stock_level(f.steel).await, Decimal::ZERO);
}

#[tokio::test]
async fn reservation_cannot_drop_below_used() {
    let f = single_step().await;
    f.ctx.stock(f.steel, dec!(10)).await;
    let order = f.ctx.started_order(f.template, dec!(10)).await;
    let step_id = order.steps[0].step.id;

    let exec = f
        .ctx
        .prod_orders
        .create_execution(step_id, execution(&[(f.steel, dec!(4))], dec!(4)), f.ctx.actor)
        .await
        .unwrap();
    f.ctx
        .prod_orders
        .approve_execution(exec.execution.id, f.ctx.actor)
        .await
        .unwrap();

    assert_matches!(
        f.ctx
            .prod_orders
            .update_material_available_exact(step_id, f.steel, dec!(3), f.ctx.actor)
            .await,
        Err(ServiceError::ValidationError(_))
    );
}

#[tokio::test]
async fn replayed_delta_is_rejected() {
    let f = single_step().await;
    f.ctx.stock(f.steel, dec!(10)).await;
    let order = f.ctx.started_order(f.template, dec!(10)).await;
    let step_id = order.steps[0].step.id;
    let version = order.steps[0].material(f.steel).unwrap().version;

    let applied = f
        .ctx
        .prod_orders
        .change_material_available(step_id, f.steel, dec!(-2), version, f.ctx.actor)
        .await
        .unwrap();
    assert_eq!(applied.material.available_quantity, dec!(8));

    assert_matches!(
        f.ctx
            .prod_orders
            .change_material_available(step_id, f.steel, dec!(-2), version, f.ctx.actor)
            .await,
        Err(ServiceError::ConcurrentModification(_))
    );
    assert_eq!(f.ctx.stock_level(f.steel).await, dec!(2));
}

#[tokio::test]
async fn cancel_returns_unused_reservation() {
    let f = single_step().await;
    f.ctx.stock(f.steel, dec!(10)).await;
    let order = f.ctx.started_order(f.template, dec!(10)).await;
    let station = order.steps[0].step.work_station_id;
    f.ctx
        .prod_orders
        .assign_to_work_station(order.order.id, station, f.ctx.actor)
        .await
        .unwrap();
    assert_eq!(f.ctx.notifier.count(NotificationEvent::WorkStationAssigned), 1);

    let cancelled = f
        .ctx
        .prod_orders
        .cancel_order(order.order.id, f.ctx.actor)
        .await
        .unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert_eq!(cancelled.cancelled_by, Some(f.ctx.actor));
    assert_eq!(f.ctx.stock_level(f.steel).await, dec!(10));

    assert_matches!(
        f.ctx.prod_orders.cancel_order(order.order.id, f.ctx.actor).await,
        Err(ServiceError::InvalidTransition { .. })
    );
}

#[tokio::test]
async fn completed_orders_can_still_be_cancelled() {
    let f = single_step().await;
    f.ctx.stock(f.steel, dec!(5)).await;
    let order = f.ctx.started_order(f.template, dec!(5)).await;
    let exec = f
        .ctx
        .prod_orders
        .create_execution(
            order.steps[0].step.id,
            execution(&[(f.steel, dec!(5))], dec!(5)),
            f.ctx.actor,
        )
        .await
        .unwrap();
    let outcome = f
        .ctx
        .prod_orders
        .approve_execution(exec.execution.id, f.ctx.actor)
        .await
        .unwrap();
    assert_eq!(outcome.order_status, OrderStatus::Completed);

    let cancelled = f
        .ctx
        .prod_orders
        .cancel_order(order.order.id, f.ctx.actor)
        .await
        .unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert!(cancelled.completed_at.is_some());
    // Produced goods and consumed material stay where approval put them.
    assert_eq!(f.ctx.stock_level(f.chair).await, dec!(5));
    assert_eq!(f.ctx.stock_level(f.steel).await, Decimal::ZERO);

    assert_matches!(
        f.ctx.prod_orders.approve_order(order.order.id, f.ctx.actor).await,
        Err(ServiceError::InvalidTransition { .. })
    );
}

#[tokio::test]
async fn finishing_the_blocked_step_resumes_the_order() {
    let mut ctx = TestContext::new().await;
    let metals = ctx.category("MET").await;
    let furniture = ctx.category("FUR").await;
    let steel = ctx.product("Steel", &metals, ProductType::RawMaterial).await;
    let paint = ctx.product("Paint", &metals, ProductType::RawMaterial).await;
    let chair = ctx.product("Chair", &furniture, ProductType::ReadyProduct).await;
    let welder = ctx.work_station("Welder").await;
    let painter = ctx.work_station("Painter").await;
    let template = ctx
        .template(
            &chair,
            &[&welder, &painter],
            &[vec![(steel.id, dec!(1))], vec![(paint.id, dec!(1))]],
        )
        .await;

    ctx.stock(steel.id, dec!(2)).await;
    ctx.stock(paint.id, dec!(2)).await;
    let order = ctx.started_order(template, dec!(2)).await;
    assert_eq!(order.order.status, OrderStatus::Processing);
    let first = order.step(1).unwrap().step.id;
    let second = order.step(2).unwrap().step.id;

    let exec = ctx
        .prod_orders
        .create_execution(first, execution(&[(steel.id, dec!(2))], dec!(2)), ctx.actor)
        .await
        .unwrap();

    // Asking for more steel than the warehouse has blocks the order.
    let update = ctx
        .prod_orders
        .update_material_available_exact(first, steel.id, dec!(5), ctx.actor)
        .await
        .unwrap();
    assert_eq!(update.order_status, OrderStatus::Blocked);
    assert_eq!(update.lack, dec!(3));
    assert_eq!(update.supply_orders.len(), 1);
    ctx.drain_events();

    let outcome = ctx
        .prod_orders
        .approve_execution(exec.execution.id, ctx.actor)
        .await
        .unwrap();
    assert!(outcome.step_completed);
    assert_eq!(outcome.next_step_id, Some(second));
    assert!(outcome.shortfalls.is_empty());
    assert_eq!(outcome.order_status, OrderStatus::Processing);

    let details = ctx.prod_orders.get_order(order.order.id).await.unwrap();
    assert_eq!(details.order.status, OrderStatus::Processing);
    assert_eq!(details.order.current_step_id, Some(second));
    assert_eq!(details.step(2).unwrap().material(paint.id).unwrap().available_quantity, dec!(2));

    let events = ctx.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        Event::ProdOrderStatusChanged {
            old_status: OrderStatus::Blocked,
            new_status: OrderStatus::Processing,
            ..
        }
    )));

    // Work continues on the next step without waiting for the supply order.
    ctx.prod_orders
        .create_execution(second, execution(&[(paint.id, dec!(1))], dec!(1)), ctx.actor)
        .await
        .unwrap();
}

#[tokio::test]
async fn order_lifecycle_is_announced_to_production_managers() {
    let f = single_step().await;
    f.ctx.stock(f.steel, dec!(5)).await;
    let managers = vec![Recipient::Role(RoleType::ProductionManager)];

    let order = f.ctx.order(f.template, dec!(5)).await;
    let id = order.order.id;
    let sent = f.ctx.notifier.sent();
    let (_, recipients, payload) = sent
        .iter()
        .find(|(e, _, _)| *e == NotificationEvent::ProdOrderCreated)
        .expect("created notification");
    assert_eq!(recipients, &managers);
    assert_eq!(payload["number"], order.order.number.as_str());

    let tasks = f.ctx.tasks.for_related(RelatedType::ProdOrder, id).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].role, RoleType::ProductionManager);
    assert_eq!(tasks[0].action, TaskAction::Confirm);
    assert_eq!(tasks[0].status, TaskStatus::Open);

    f.ctx.prod_orders.confirm(id, f.ctx.actor).await.unwrap();
    let tasks = f.ctx.tasks.for_related(RelatedType::ProdOrder, id).await.unwrap();
    assert_eq!(tasks[0].status, TaskStatus::Done);
    assert_eq!(tasks[0].completed_by, Some(f.ctx.actor));
    assert_eq!(f.ctx.notifier.count(NotificationEvent::ProdOrderChanged), 1);

    f.ctx.prod_orders.start(id, f.ctx.actor).await.unwrap();
    assert_eq!(f.ctx.notifier.count(NotificationEvent::ProdOrderChanged), 2);
    let sent = f.ctx.notifier.sent();
    let (_, _, payload) = sent
        .iter()
        .filter(|(e, _, _)| *e == NotificationEvent::ProdOrderChanged)
        .last()
        .expect("start notification");
    assert_eq!(payload["status"], "Processing");

    let exec = f
        .ctx
        .prod_orders
        .create_execution(
            order.steps[0].step.id,
            execution(&[(f.steel, dec!(1))], dec!(1)),
            f.ctx.actor,
        )
        .await
        .unwrap();
    let sent = f.ctx.notifier.sent();
    let (_, recipients, payload) = sent
        .iter()
        .find(|(e, _, _)| *e == NotificationEvent::ExecutionCreated)
        .expect("execution notification");
    assert_eq!(recipients, &managers);
    assert_eq!(payload["execution_id"], exec.execution.id.to_string());
    assert_eq!(payload["prod_order_id"], id.to_string());

    f.ctx.prod_orders.cancel_order(id, f.ctx.actor).await.unwrap();
    assert_eq!(f.ctx.notifier.count(NotificationEvent::ProdOrderChanged), 3);
}

#[tokio::test]
async fn output_feeds_next_step_material() {
    let ctx = TestContext::new().await;
    let metals = ctx.category("MET").await;
    let furniture = ctx.category("FUR").await;
    let steel = ctx.product("Steel", &metals, ProductType::RawMaterial).await;
    let paint = ctx.product("Paint", &metals, ProductType::RawMaterial).await;
    let chair = ctx.product("Chair", &furniture, ProductType::ReadyProduct).await;
    let welder = ctx.work_station("Welder").await;
    let painter = ctx.work_station("Painter").await;

    let template = ctx
        .templates
        .create_template(
            NewTemplate {
                product_id: chair.id,
                comment: Some("frame then paint".into()),
            },
            ctx.actor,
        )
        .await
        .unwrap();
    let frame = ctx
        .templates
        .create_or_get_semi_finished(template.id, welder.id, false)
        .await
        .unwrap();
    assert_eq!(frame.name, "Welder Chair SFP");

    ctx.templates
        .add_step(
            template.id,
            NewTemplateStep {
                sequence: 1,
                work_station_id: welder.id,
                output_product_id: None,
                expected_quantity: dec!(1),
                is_last: false,
                materials: vec![NewTemplateMaterial {
                    product_id: steel.id,
                    required_quantity: dec!(2),
                }],
            },
            ctx.actor,
        )
        .await
        .unwrap();
    ctx.templates
        .add_step(
            template.id,
            NewTemplateStep {
                sequence: 2,
                work_station_id: painter.id,
                output_product_id: None,
                expected_quantity: dec!(1),
                is_last: true,
                materials: vec![
                    NewTemplateMaterial {
                        product_id: frame.id,
                        required_quantity: dec!(1),
                    },
                    NewTemplateMaterial {
                        product_id: paint.id,
                        required_quantity: dec!(1),
                    },
                ],
            },
            ctx.actor,
        )
        .await
        .unwrap();

    ctx.stock(steel.id, dec!(6)).await;
    ctx.stock(paint.id, dec!(3)).await;
    let order = ctx.started_order(template.id, dec!(3)).await;
    let first = order.step(1).unwrap().step.id;
    let second = order.step(2).unwrap().step.id;
    assert_eq!(order.order.status, OrderStatus::Processing);

    let exec = ctx
        .prod_orders
        .create_execution(first, execution(&[(steel.id, dec!(6))], dec!(3)), ctx.actor)
        .await
        .unwrap();
    let outcome = ctx
        .prod_orders
        .approve_execution(exec.execution.id, ctx.actor)
        .await
        .unwrap();
    assert!(outcome.step_completed);
    assert_eq!(outcome.next_step_id, Some(second));
    assert_eq!(outcome.order_status, OrderStatus::Processing);
    assert!(outcome.shortfalls.is_empty());

    let details = ctx.prod_orders.get_order(order.order.id).await.unwrap();
    assert_eq!(details.order.current_step_id, Some(second));
    let painting = details.step(2).unwrap();
    assert_eq!(painting.material(frame.id).unwrap().available_quantity, dec!(3));
    assert_eq!(painting.material(paint.id).unwrap().available_quantity, dec!(3));
    assert_eq!(ctx.stock_level(frame.id).await, Decimal::ZERO);
    assert_eq!(ctx.stock_level(paint.id).await, Decimal::ZERO);
}

#[tokio::test]
async fn order_group_estimates_each_order() {
    let f = single_step().await;
    f.ctx
        .inventory
        .add_stock(
            StockMovement::new(f.steel, f.ctx.warehouse, dec!(10))
                .with_cost(dec!(50)),
        )
        .await
        .unwrap();

    // Welder makes 10 a day.
    assert_eq!(
        f.ctx
            .prod_orders
            .calculate_deadline(f.template, dec!(25))
            .await
            .unwrap(),
        3
    );
    assert_eq!(
        f.ctx
            .prod_orders
            .calculate_total_cost(f.template, f.ctx.warehouse, dec!(4))
            .await
            .unwrap(),
        dec!(20)
    );

    let (group, orders) = f
        .ctx
        .prod_orders
        .create_order_group(
            NewOrderGroup {
                group_type: ProdOrderGroupType::ByCatalog,
                warehouse_id: f.ctx.warehouse,
                agent_id: None,
                deadline: None,
                lines: vec![NewOrderLine {
                    product_id: f.chair,
                    quantity: dec!(25),
                    offer_price: dec!(0),
                }],
            },
            f.ctx.actor,
        )
        .await
        .unwrap();
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0].prod_order_group_id, Some(group.id));
    assert_eq!(orders[0].estimated_days, Some(3));
    assert_eq!(orders[0].total_cost, Some(dec!(125)));

    assert_matches!(
        f.ctx
            .prod_orders
            .create_order_group(
                NewOrderGroup {
                    group_type: ProdOrderGroupType::ByOrder,
                    warehouse_id: f.ctx.warehouse,
                    agent_id: None,
                    deadline: None,
                    lines: vec![],
                },
                f.ctx.actor,
            )
            .await,
        Err(ServiceError::ValidationError(_))
    );
}

#[tokio::test]
async fn execution_tasks_can_be_completed_once() {
    let f = single_step().await;
    f.ctx.stock(f.steel, dec!(5)).await;
    let order = f.ctx.started_order(f.template, dec!(5)).await;
    let exec = f
        .ctx
        .prod_orders
        .create_execution(
            order.steps[0].step.id,
            execution(&[(f.steel, dec!(1))], dec!(1)),
            f.ctx.actor,
        )
        .await
        .unwrap();

    let tasks = f
        .ctx
        .tasks
        .for_related(RelatedType::Execution, exec.execution.id)
        .await
        .unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].role, RoleType::ProductionManager);
    assert_eq!(tasks[0].action, TaskAction::Approve);

    let done = f
        .ctx
        .tasks
        .complete_task(tasks[0].id, f.ctx.actor)
        .await
        .unwrap();
    assert_eq!(done.status, TaskStatus::Done);
    let again = f
        .ctx
        .tasks
        .complete_task(tasks[0].id, Uuid::new_v4())
        .await
        .unwrap();
    assert_eq!(again.completed_by, Some(f.ctx.actor));
    assert_eq!(f.ctx.open_tasks(RoleType::ProductionManager).await, 0);
}
