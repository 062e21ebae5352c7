use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20240301_000001_create_catalog_tables::Migration),
            Box::new(m20240301_000002_create_inventory_tables::Migration),
            Box::new(m20240301_000003_create_prod_template_tables::Migration),
            Box::new(m20240301_000004_create_prod_order_tables::Migration),
            Box::new(m20240301_000005_create_supply_order_tables::Migration),
            Box::new(m20240301_000006_create_tasks_table::Migration),
        ]
    }
}

/// Quantity/money column. SQLite gets REAL so values read back as floats without affinity
/// rewriting whole numbers to INTEGER.
fn decimal_col<T: IntoIden>(manager: &SchemaManager, col: T) -> ColumnDef {
    let mut def = ColumnDef::new(col);
    match manager.get_database_backend() {
        sea_orm::DatabaseBackend::Sqlite => def.double(),
        _ => def.decimal_len(19, 4),
    };
    def
}

fn quantity_col<T: IntoIden>(manager: &SchemaManager, col: T) -> ColumnDef {
    let mut def = decimal_col(manager, col);
    def.not_null().default(0);
    def
}

fn timestamp_col<T: IntoIden>(col: T) -> ColumnDef {
    ColumnDef::new(col)
        .timestamp_with_time_zone()
        .not_null()
        .to_owned()
}

fn nullable_timestamp_col<T: IntoIden>(col: T) -> ColumnDef {
    ColumnDef::new(col)
        .timestamp_with_time_zone()
        .null()
        .to_owned()
}

fn uuid_col<T: IntoIden>(col: T) -> ColumnDef {
    ColumnDef::new(col).uuid().not_null().to_owned()
}

fn nullable_uuid_col<T: IntoIden>(col: T) -> ColumnDef {
    ColumnDef::new(col).uuid().null().to_owned()
}

fn pk_col<T: IntoIden>(col: T) -> ColumnDef {
    ColumnDef::new(col).uuid().primary_key().not_null().to_owned()
}

fn version_col<T: IntoIden>(col: T) -> ColumnDef {
    ColumnDef::new(col).integer().not_null().default(0).to_owned()
}

mod m20240301_000001_create_catalog_tables {
    use super::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000001_create_catalog_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(ProductCategories::Table)
                        .if_not_exists()
                        .col(pk_col(ProductCategories::Id))
                        .col(ColumnDef::new(ProductCategories::Name).string().not_null())
                        .col(ColumnDef::new(ProductCategories::Code).string().not_null())
                        .col(
                            ColumnDef::new(ProductCategories::MeasureUnit)
                                .string_len(16)
                                .not_null(),
                        )
                        .col(timestamp_col(ProductCategories::CreatedAt))
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(Products::Table)
                        .if_not_exists()
                        .col(pk_col(Products::Id))
                        .col(ColumnDef::new(Products::Name).string().not_null())
                        .col(uuid_col(Products::ProductCategoryId))
                        .col(ColumnDef::new(Products::ProductType).string_len(32).not_null())
                        .col(nullable_uuid_col(Products::WorkStationId))
                        .col(nullable_uuid_col(Products::ReadyProductId))
                        .col(timestamp_col(Products::CreatedAt))
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_products_category_id")
                                .from(Products::Table, Products::ProductCategoryId)
                                .to(ProductCategories::Table, ProductCategories::Id),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_products_semi_finished")
                        .table(Products::Table)
                        .col(Products::ReadyProductId)
                        .col(Products::WorkStationId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(WorkStations::Table)
                        .if_not_exists()
                        .col(pk_col(WorkStations::Id))
                        .col(ColumnDef::new(WorkStations::Name).string().not_null())
                        .col(nullable_uuid_col(WorkStations::ProdOrderId))
                        .col(decimal_col(manager, WorkStations::PerformanceQty).null())
                        .col(decimal_col(manager, WorkStations::PerformanceDuration).null())
                        .col(
                            ColumnDef::new(WorkStations::PerformanceDurationUnit)
                                .string_len(16)
                                .null(),
                        )
                        .col(timestamp_col(WorkStations::CreatedAt))
                        .col(timestamp_col(WorkStations::UpdatedAt))
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(WorkStations::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Products::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(ProductCategories::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    pub enum ProductCategories {
        Table,
        Id,
        Name,
        Code,
        MeasureUnit,
        CreatedAt,
    }

    #[derive(DeriveIden)]
    pub enum Products {
        Table,
        Id,
        Name,
        ProductCategoryId,
        ProductType,
        WorkStationId,
        ReadyProductId,
        CreatedAt,
    }

    #[derive(DeriveIden)]
    pub enum WorkStations {
        Table,
        Id,
        Name,
        ProdOrderId,
        PerformanceQty,
        PerformanceDuration,
        PerformanceDurationUnit,
        CreatedAt,
        UpdatedAt,
    }
}

mod m20240301_000002_create_inventory_tables {
    use super::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000002_create_inventory_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Inventories::Table)
                        .if_not_exists()
                        .col(pk_col(Inventories::Id))
                        .col(uuid_col(Inventories::ProductId))
                        .col(uuid_col(Inventories::WarehouseId))
                        .col(quantity_col(manager, Inventories::UnitCost))
                        .col(version_col(Inventories::Version))
                        .col(timestamp_col(Inventories::CreatedAt))
                        .col(timestamp_col(Inventories::UpdatedAt))
                        .to_owned(),
                )
                .await?;

            // One inventory per (product, warehouse); concurrent find-or-create loses here.
            manager
                .create_index(
                    Index::create()
                        .name("idx_inventories_product_warehouse")
                        .table(Inventories::Table)
                        .col(Inventories::ProductId)
                        .col(Inventories::WarehouseId)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(InventoryItems::Table)
                        .if_not_exists()
                        .col(pk_col(InventoryItems::Id))
                        .col(uuid_col(InventoryItems::InventoryId))
                        .col(nullable_uuid_col(InventoryItems::StorageLocationId))
                        .col(quantity_col(manager, InventoryItems::Quantity))
                        .col(timestamp_col(InventoryItems::CreatedAt))
                        .col(timestamp_col(InventoryItems::UpdatedAt))
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_inventory_items_inventory_id")
                                .from(InventoryItems::Table, InventoryItems::InventoryId)
                                .to(Inventories::Table, Inventories::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(InventoryTransactions::Table)
                        .if_not_exists()
                        .col(pk_col(InventoryTransactions::Id))
                        .col(uuid_col(InventoryTransactions::ProductId))
                        .col(uuid_col(InventoryTransactions::WarehouseId))
                        .col(nullable_uuid_col(InventoryTransactions::StorageLocationId))
                        .col(nullable_uuid_col(InventoryTransactions::WorkStationId))
                        .col(nullable_uuid_col(InventoryTransactions::ProdOrderId))
                        .col(nullable_uuid_col(InventoryTransactions::SupplyOrderId))
                        .col(nullable_uuid_col(InventoryTransactions::SupplierId))
                        .col(nullable_uuid_col(InventoryTransactions::AgentId))
                        .col(quantity_col(manager, InventoryTransactions::Quantity))
                        .col(quantity_col(manager, InventoryTransactions::Cost))
                        .col(
                            ColumnDef::new(InventoryTransactions::TransactionType)
                                .string_len(8)
                                .not_null(),
                        )
                        .col(nullable_uuid_col(InventoryTransactions::CreatedBy))
                        .col(timestamp_col(InventoryTransactions::CreatedAt))
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_inventory_transactions_product_warehouse")
                        .table(InventoryTransactions::Table)
                        .col(InventoryTransactions::ProductId)
                        .col(InventoryTransactions::WarehouseId)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(InventoryTransactions::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(InventoryItems::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(Inventories::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Inventories {
        Table,
        Id,
        ProductId,
        WarehouseId,
        UnitCost,
        Version,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum InventoryItems {
        Table,
        Id,
        InventoryId,
        StorageLocationId,
        Quantity,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum InventoryTransactions {
        Table,
        Id,
        ProductId,
        WarehouseId,
        StorageLocationId,
        WorkStationId,
        ProdOrderId,
        SupplyOrderId,
        SupplierId,
        AgentId,
        Quantity,
        Cost,
        TransactionType,
        CreatedBy,
        CreatedAt,
    }
}

mod m20240301_000003_create_prod_template_tables {
    use super::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000003_create_prod_template_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(ProdTemplates::Table)
                        .if_not_exists()
                        .col(pk_col(ProdTemplates::Id))
                        .col(uuid_col(ProdTemplates::ProductId))
                        .col(ColumnDef::new(ProdTemplates::Comment).text().null())
                        .col(uuid_col(ProdTemplates::CreatedBy))
                        .col(timestamp_col(ProdTemplates::CreatedAt))
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(ProdTemplateSteps::Table)
                        .if_not_exists()
                        .col(pk_col(ProdTemplateSteps::Id))
                        .col(uuid_col(ProdTemplateSteps::ProdTemplateId))
                        .col(
                            ColumnDef::new(ProdTemplateSteps::Sequence)
                                .integer()
                                .not_null(),
                        )
                        .col(uuid_col(ProdTemplateSteps::WorkStationId))
                        .col(uuid_col(ProdTemplateSteps::OutputProductId))
                        .col(quantity_col(manager, ProdTemplateSteps::ExpectedQuantity))
                        .col(
                            ColumnDef::new(ProdTemplateSteps::IsLast)
                                .boolean()
                                .not_null()
                                .default(false),
                        )
                        .col(timestamp_col(ProdTemplateSteps::CreatedAt))
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_prod_template_steps_template_id")
                                .from(ProdTemplateSteps::Table, ProdTemplateSteps::ProdTemplateId)
                                .to(ProdTemplates::Table, ProdTemplates::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_prod_template_steps_sequence")
                        .table(ProdTemplateSteps::Table)
                        .col(ProdTemplateSteps::ProdTemplateId)
                        .col(ProdTemplateSteps::Sequence)
                        .unique()
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(ProdTemplateStepProducts::Table)
                        .if_not_exists()
                        .col(pk_col(ProdTemplateStepProducts::Id))
                        .col(uuid_col(ProdTemplateStepProducts::ProdTemplateStepId))
                        .col(uuid_col(ProdTemplateStepProducts::ProductId))
                        .col(quantity_col(
                            manager,
                            ProdTemplateStepProducts::RequiredQuantity,
                        ))
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_prod_template_step_products_step_id")
                                .from(
                                    ProdTemplateStepProducts::Table,
                                    ProdTemplateStepProducts::ProdTemplateStepId,
                                )
                                .to(ProdTemplateSteps::Table, ProdTemplateSteps::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(ProdTemplateStepProducts::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(ProdTemplateSteps::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(ProdTemplates::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum ProdTemplates {
        Table,
        Id,
        ProductId,
        Comment,
        CreatedBy,
        CreatedAt,
    }

    #[derive(DeriveIden)]
    enum ProdTemplateSteps {
        Table,
        Id,
        ProdTemplateId,
        Sequence,
        WorkStationId,
        OutputProductId,
        ExpectedQuantity,
        IsLast,
        CreatedAt,
    }

    #[derive(DeriveIden)]
    enum ProdTemplateStepProducts {
        Table,
        Id,
        ProdTemplateStepId,
        ProductId,
        RequiredQuantity,
    }
}

mod m20240301_000004_create_prod_order_tables {
    use super::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000004_create_prod_order_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(ProdOrderGroups::Table)
                        .if_not_exists()
                        .col(pk_col(ProdOrderGroups::Id))
                        .col(
                            ColumnDef::new(ProdOrderGroups::GroupType)
                                .string_len(16)
                                .not_null(),
                        )
                        .col(uuid_col(ProdOrderGroups::WarehouseId))
                        .col(nullable_uuid_col(ProdOrderGroups::AgentId))
                        .col(ColumnDef::new(ProdOrderGroups::Deadline).date().null())
                        .col(uuid_col(ProdOrderGroups::CreatedBy))
                        .col(timestamp_col(ProdOrderGroups::CreatedAt))
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(ProdOrders::Table)
                        .if_not_exists()
                        .col(pk_col(ProdOrders::Id))
                        .col(ColumnDef::new(ProdOrders::Number).string().not_null())
                        .col(nullable_uuid_col(ProdOrders::ProdOrderGroupId))
                        .col(uuid_col(ProdOrders::ProdTemplateId))
                        .col(uuid_col(ProdOrders::ProductId))
                        .col(uuid_col(ProdOrders::WarehouseId))
                        .col(quantity_col(manager, ProdOrders::Quantity))
                        .col(quantity_col(manager, ProdOrders::OfferPrice))
                        .col(decimal_col(manager, ProdOrders::TotalCost).null())
                        .col(ColumnDef::new(ProdOrders::EstimatedDays).big_integer().null())
                        .col(ColumnDef::new(ProdOrders::Status).string_len(16).not_null())
                        .col(nullable_uuid_col(ProdOrders::CurrentStepId))
                        .col(version_col(ProdOrders::Version))
                        .col(uuid_col(ProdOrders::CreatedBy))
                        .col(nullable_timestamp_col(ProdOrders::ConfirmedAt))
                        .col(nullable_uuid_col(ProdOrders::ConfirmedBy))
                        .col(nullable_timestamp_col(ProdOrders::StartedAt))
                        .col(nullable_uuid_col(ProdOrders::StartedBy))
                        .col(nullable_timestamp_col(ProdOrders::CompletedAt))
                        .col(nullable_timestamp_col(ProdOrders::ApprovedAt))
                        .col(nullable_uuid_col(ProdOrders::ApprovedBy))
                        .col(nullable_timestamp_col(ProdOrders::CancelledAt))
                        .col(nullable_uuid_col(ProdOrders::CancelledBy))
                        .col(timestamp_col(ProdOrders::CreatedAt))
                        .col(timestamp_col(ProdOrders::UpdatedAt))
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_prod_orders_group_id")
                                .from(ProdOrders::Table, ProdOrders::ProdOrderGroupId)
                                .to(ProdOrderGroups::Table, ProdOrderGroups::Id),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(ProdOrderSteps::Table)
                        .if_not_exists()
                        .col(pk_col(ProdOrderSteps::Id))
                        .col(uuid_col(ProdOrderSteps::ProdOrderId))
                        .col(ColumnDef::new(ProdOrderSteps::Sequence).integer().not_null())
                        .col(uuid_col(ProdOrderSteps::WorkStationId))
                        .col(uuid_col(ProdOrderSteps::OutputProductId))
                        .col(quantity_col(manager, ProdOrderSteps::ExpectedQuantity))
                        .col(quantity_col(manager, ProdOrderSteps::OutputQuantity))
                        .col(ColumnDef::new(ProdOrderSteps::Status).string_len(16).not_null())
                        .col(version_col(ProdOrderSteps::Version))
                        .col(nullable_timestamp_col(ProdOrderSteps::CompletedAt))
                        .col(timestamp_col(ProdOrderSteps::CreatedAt))
                        .col(timestamp_col(ProdOrderSteps::UpdatedAt))
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_prod_order_steps_order_id")
                                .from(ProdOrderSteps::Table, ProdOrderSteps::ProdOrderId)
                                .to(ProdOrders::Table, ProdOrders::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(ProdOrderStepProducts::Table)
                        .if_not_exists()
                        .col(pk_col(ProdOrderStepProducts::Id))
                        .col(uuid_col(ProdOrderStepProducts::ProdOrderStepId))
                        .col(uuid_col(ProdOrderStepProducts::ProductId))
                        .col(quantity_col(manager, ProdOrderStepProducts::RequiredQuantity))
                        .col(quantity_col(manager, ProdOrderStepProducts::AvailableQuantity))
                        .col(quantity_col(manager, ProdOrderStepProducts::UsedQuantity))
                        .col(
                            ColumnDef::new(ProdOrderStepProducts::Status)
                                .string_len(16)
                                .not_null(),
                        )
                        .col(version_col(ProdOrderStepProducts::Version))
                        .col(timestamp_col(ProdOrderStepProducts::CreatedAt))
                        .col(timestamp_col(ProdOrderStepProducts::UpdatedAt))
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_prod_order_step_products_step_id")
                                .from(
                                    ProdOrderStepProducts::Table,
                                    ProdOrderStepProducts::ProdOrderStepId,
                                )
                                .to(ProdOrderSteps::Table, ProdOrderSteps::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(ProdOrderStepExecutions::Table)
                        .if_not_exists()
                        .col(pk_col(ProdOrderStepExecutions::Id))
                        .col(uuid_col(ProdOrderStepExecutions::ProdOrderStepId))
                        .col(quantity_col(manager, ProdOrderStepExecutions::OutputQuantity))
                        .col(ColumnDef::new(ProdOrderStepExecutions::Notes).text().null())
                        .col(
                            ColumnDef::new(ProdOrderStepExecutions::Status)
                                .string_len(16)
                                .not_null(),
                        )
                        .col(uuid_col(ProdOrderStepExecutions::ExecutedBy))
                        .col(nullable_timestamp_col(
                            ProdOrderStepExecutions::ProdManagerApprovedAt,
                        ))
                        .col(nullable_uuid_col(ProdOrderStepExecutions::ProdManagerApprovedBy))
                        .col(nullable_timestamp_col(
                            ProdOrderStepExecutions::SeniorProdManagerApprovedAt,
                        ))
                        .col(nullable_uuid_col(
                            ProdOrderStepExecutions::SeniorProdManagerApprovedBy,
                        ))
                        .col(nullable_timestamp_col(ProdOrderStepExecutions::ApprovedAt))
                        .col(nullable_uuid_col(ProdOrderStepExecutions::ApprovedBy))
                        .col(nullable_timestamp_col(ProdOrderStepExecutions::DeclinedAt))
                        .col(nullable_uuid_col(ProdOrderStepExecutions::DeclinedBy))
                        .col(
                            ColumnDef::new(ProdOrderStepExecutions::DeclineComment)
                                .text()
                                .null(),
                        )
                        .col(version_col(ProdOrderStepExecutions::Version))
                        .col(timestamp_col(ProdOrderStepExecutions::CreatedAt))
                        .col(timestamp_col(ProdOrderStepExecutions::UpdatedAt))
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_prod_order_step_executions_step_id")
                                .from(
                                    ProdOrderStepExecutions::Table,
                                    ProdOrderStepExecutions::ProdOrderStepId,
                                )
                                .to(ProdOrderSteps::Table, ProdOrderSteps::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(ProdOrderStepExecutionProducts::Table)
                        .if_not_exists()
                        .col(pk_col(ProdOrderStepExecutionProducts::Id))
                        .col(uuid_col(
                            ProdOrderStepExecutionProducts::ProdOrderStepExecutionId,
                        ))
                        .col(uuid_col(ProdOrderStepExecutionProducts::ProductId))
                        .col(quantity_col(
                            manager,
                            ProdOrderStepExecutionProducts::UsedQuantity,
                        ))
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_prod_order_step_execution_products_execution_id")
                                .from(
                                    ProdOrderStepExecutionProducts::Table,
                                    ProdOrderStepExecutionProducts::ProdOrderStepExecutionId,
                                )
                                .to(
                                    ProdOrderStepExecutions::Table,
                                    ProdOrderStepExecutions::Id,
                                )
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(
                    Table::drop()
                        .table(ProdOrderStepExecutionProducts::Table)
                        .to_owned(),
                )
                .await?;
            manager
                .drop_table(Table::drop().table(ProdOrderStepExecutions::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(ProdOrderStepProducts::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(ProdOrderSteps::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(ProdOrders::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(ProdOrderGroups::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum ProdOrderGroups {
        Table,
        Id,
        GroupType,
        WarehouseId,
        AgentId,
        Deadline,
        CreatedBy,
        CreatedAt,
    }

    #[derive(DeriveIden)]
    enum ProdOrders {
        Table,
        Id,
        Number,
        ProdOrderGroupId,
        ProdTemplateId,
        ProductId,
        WarehouseId,
        Quantity,
        OfferPrice,
        TotalCost,
        EstimatedDays,
        Status,
        CurrentStepId,
        Version,
        CreatedBy,
        ConfirmedAt,
        ConfirmedBy,
        StartedAt,
        StartedBy,
        CompletedAt,
        ApprovedAt,
        ApprovedBy,
        CancelledAt,
        CancelledBy,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum ProdOrderSteps {
        Table,
        Id,
        ProdOrderId,
        Sequence,
        WorkStationId,
        OutputProductId,
        ExpectedQuantity,
        OutputQuantity,
        Status,
        Version,
        CompletedAt,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum ProdOrderStepProducts {
        Table,
        Id,
        ProdOrderStepId,
        ProductId,
        RequiredQuantity,
        AvailableQuantity,
        UsedQuantity,
        Status,
        Version,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum ProdOrderStepExecutions {
        Table,
        Id,
        ProdOrderStepId,
        OutputQuantity,
        Notes,
        Status,
        ExecutedBy,
        ProdManagerApprovedAt,
        ProdManagerApprovedBy,
        SeniorProdManagerApprovedAt,
        SeniorProdManagerApprovedBy,
        ApprovedAt,
        ApprovedBy,
        DeclinedAt,
        DeclinedBy,
        DeclineComment,
        Version,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum ProdOrderStepExecutionProducts {
        Table,
        Id,
        ProdOrderStepExecutionId,
        ProductId,
        UsedQuantity,
    }
}

mod m20240301_000005_create_supply_order_tables {
    use super::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000005_create_supply_order_tables"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(SupplyOrders::Table)
                        .if_not_exists()
                        .col(pk_col(SupplyOrders::Id))
                        .col(ColumnDef::new(SupplyOrders::Number).string().not_null())
                        .col(nullable_uuid_col(SupplyOrders::SupplierId))
                        .col(uuid_col(SupplyOrders::ProductCategoryId))
                        .col(uuid_col(SupplyOrders::WarehouseId))
                        .col(nullable_uuid_col(SupplyOrders::ProdOrderId))
                        .col(ColumnDef::new(SupplyOrders::State).string_len(16).not_null())
                        .col(ColumnDef::new(SupplyOrders::Status).string().null())
                        .col(quantity_col(manager, SupplyOrders::TotalPrice))
                        .col(version_col(SupplyOrders::Version))
                        .col(uuid_col(SupplyOrders::CreatedBy))
                        .col(nullable_timestamp_col(SupplyOrders::ConfirmedAt))
                        .col(nullable_uuid_col(SupplyOrders::ConfirmedBy))
                        .col(nullable_timestamp_col(SupplyOrders::ProgressedAt))
                        .col(nullable_uuid_col(SupplyOrders::ProgressedBy))
                        .col(nullable_timestamp_col(SupplyOrders::DeliveredAt))
                        .col(nullable_uuid_col(SupplyOrders::DeliveredBy))
                        .col(nullable_timestamp_col(SupplyOrders::ClosedAt))
                        .col(nullable_uuid_col(SupplyOrders::ClosedBy))
                        .col(timestamp_col(SupplyOrders::CreatedAt))
                        .col(timestamp_col(SupplyOrders::UpdatedAt))
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_supply_orders_prod_order_id")
                        .table(SupplyOrders::Table)
                        .col(SupplyOrders::ProdOrderId)
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(SupplyOrderSteps::Table)
                        .if_not_exists()
                        .col(pk_col(SupplyOrderSteps::Id))
                        .col(uuid_col(SupplyOrderSteps::SupplyOrderId))
                        .col(ColumnDef::new(SupplyOrderSteps::State).string_len(16).not_null())
                        .col(ColumnDef::new(SupplyOrderSteps::Status).string().null())
                        .col(uuid_col(SupplyOrderSteps::CreatedBy))
                        .col(timestamp_col(SupplyOrderSteps::CreatedAt))
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_supply_order_steps_order_id")
                                .from(SupplyOrderSteps::Table, SupplyOrderSteps::SupplyOrderId)
                                .to(SupplyOrders::Table, SupplyOrders::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(SupplyOrderProducts::Table)
                        .if_not_exists()
                        .col(pk_col(SupplyOrderProducts::Id))
                        .col(uuid_col(SupplyOrderProducts::SupplyOrderId))
                        .col(uuid_col(SupplyOrderProducts::ProductId))
                        .col(quantity_col(manager, SupplyOrderProducts::ExpectedQuantity))
                        .col(decimal_col(manager, SupplyOrderProducts::ActualQuantity).null())
                        .col(quantity_col(manager, SupplyOrderProducts::Price))
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_supply_order_products_order_id")
                                .from(
                                    SupplyOrderProducts::Table,
                                    SupplyOrderProducts::SupplyOrderId,
                                )
                                .to(SupplyOrders::Table, SupplyOrders::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await?;

            manager
                .create_table(
                    Table::create()
                        .table(SupplyOrderLocations::Table)
                        .if_not_exists()
                        .col(pk_col(SupplyOrderLocations::Id))
                        .col(uuid_col(SupplyOrderLocations::SupplyOrderId))
                        .col(
                            ColumnDef::new(SupplyOrderLocations::Location)
                                .string()
                                .not_null(),
                        )
                        .col(uuid_col(SupplyOrderLocations::CreatedBy))
                        .col(timestamp_col(SupplyOrderLocations::CreatedAt))
                        .foreign_key(
                            ForeignKey::create()
                                .name("fk_supply_order_locations_order_id")
                                .from(
                                    SupplyOrderLocations::Table,
                                    SupplyOrderLocations::SupplyOrderId,
                                )
                                .to(SupplyOrders::Table, SupplyOrders::Id)
                                .on_delete(ForeignKeyAction::Cascade),
                        )
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(SupplyOrderLocations::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(SupplyOrderProducts::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(SupplyOrderSteps::Table).to_owned())
                .await?;
            manager
                .drop_table(Table::drop().table(SupplyOrders::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum SupplyOrders {
        Table,
        Id,
        Number,
        SupplierId,
        ProductCategoryId,
        WarehouseId,
        ProdOrderId,
        State,
        Status,
        TotalPrice,
        Version,
        CreatedBy,
        ConfirmedAt,
        ConfirmedBy,
        ProgressedAt,
        ProgressedBy,
        DeliveredAt,
        DeliveredBy,
        ClosedAt,
        ClosedBy,
        CreatedAt,
        UpdatedAt,
    }

    #[derive(DeriveIden)]
    enum SupplyOrderSteps {
        Table,
        Id,
        SupplyOrderId,
        State,
        Status,
        CreatedBy,
        CreatedAt,
    }

    #[derive(DeriveIden)]
    enum SupplyOrderProducts {
        Table,
        Id,
        SupplyOrderId,
        ProductId,
        ExpectedQuantity,
        ActualQuantity,
        Price,
    }

    #[derive(DeriveIden)]
    enum SupplyOrderLocations {
        Table,
        Id,
        SupplyOrderId,
        Location,
        CreatedBy,
        CreatedAt,
    }
}

mod m20240301_000006_create_tasks_table {
    use super::*;

    pub struct Migration;

    impl MigrationName for Migration {
        fn name(&self) -> &str {
            "m20240301_000006_create_tasks_table"
        }
    }

    #[async_trait::async_trait]
    impl MigrationTrait for Migration {
        async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .create_table(
                    Table::create()
                        .table(Tasks::Table)
                        .if_not_exists()
                        .col(pk_col(Tasks::Id))
                        .col(ColumnDef::new(Tasks::Role).string_len(32).not_null())
                        .col(ColumnDef::new(Tasks::RelatedType).string_len(32).not_null())
                        .col(uuid_col(Tasks::RelatedId))
                        .col(ColumnDef::new(Tasks::Action).string_len(16).not_null())
                        .col(ColumnDef::new(Tasks::Comment).text().not_null())
                        .col(ColumnDef::new(Tasks::Status).string_len(16).not_null())
                        .col(nullable_timestamp_col(Tasks::CompletedAt))
                        .col(nullable_uuid_col(Tasks::CompletedBy))
                        .col(timestamp_col(Tasks::CreatedAt))
                        .to_owned(),
                )
                .await?;

            manager
                .create_index(
                    Index::create()
                        .name("idx_tasks_role_status")
                        .table(Tasks::Table)
                        .col(Tasks::Role)
                        .col(Tasks::Status)
                        .to_owned(),
                )
                .await
        }

        async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
            manager
                .drop_table(Table::drop().table(Tasks::Table).to_owned())
                .await
        }
    }

    #[derive(DeriveIden)]
    enum Tasks {
        Table,
        Id,
        Role,
        RelatedType,
        RelatedId,
        Action,
        Comment,
        Status,
        CompletedAt,
        CompletedBy,
        CreatedAt,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sea_orm::{ConnectOptions, Database};
    use std::collections::HashSet;

    #[test]
    fn migration_names_are_unique() {
        let names: Vec<String> = Migrator::migrations()
            .iter()
            .map(|m| m.name().to_string())
            .collect();
        let unique: HashSet<&String> = names.iter().collect();
        assert_eq!(unique.len(), names.len(), "duplicate names in {:?}", names);
        assert!(names.iter().all(|n| n.starts_with("m2024")));
    }

    #[tokio::test]
    async fn up_is_repeatable_on_a_fresh_database() {
        let mut opts = ConnectOptions::new("sqlite::memory:".to_owned());
        opts.max_connections(1).min_connections(1).sqlx_logging(false);
        let db = Database::connect(opts).await.unwrap();

        Migrator::up(&db, None).await.unwrap();
        Migrator::up(&db, None).await.unwrap();

        let applied = Migrator::get_applied_migrations(&db).await.unwrap();
        assert_eq!(applied.len(), Migrator::migrations().len());
        assert!(Migrator::get_pending_migrations(&db).await.unwrap().is_empty());
    }
}
