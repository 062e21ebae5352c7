use crate::{
    db::{self, DbPool},
    entities::{
        prod_template::{self, Entity as ProdTemplate},
        prod_template_step::{self, Entity as ProdTemplateStep},
        prod_template_step_product::{self, Entity as ProdTemplateStepProduct},
        product::{self, Entity as Product, ProductType},
        work_station::{self, Entity as WorkStation},
    },
    errors::ServiceError,
};
use super::validate_positive_decimal;
use chrono::Utc;
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, instrument};
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NewTemplate {
    pub product_id: Uuid,
    #[validate(length(max = 1000))]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NewTemplateMaterial {
    pub product_id: Uuid,
    /// Per unit of ordered quantity
    #[validate(custom = "validate_positive_decimal")]
    pub required_quantity: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct NewTemplateStep {
    #[validate(range(min = 1))]
    pub sequence: i32,
    pub work_station_id: Uuid,
    /// `None` synthesizes the station's semi-finished product, or uses the ready product on the
    /// last step.
    pub output_product_id: Option<Uuid>,
    #[validate(custom = "validate_positive_decimal")]
    pub expected_quantity: Decimal,
    pub is_last: bool,
    #[validate]
    pub materials: Vec<NewTemplateMaterial>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BlueprintStep {
    pub step: prod_template_step::Model,
    pub materials: Vec<prod_template_step_product::Model>,
}

/// A template with its steps in sequence order.
#[derive(Debug, Clone, Serialize)]
pub struct TemplateBlueprint {
    pub template: prod_template::Model,
    pub steps: Vec<BlueprintStep>,
}

impl TemplateBlueprint {
    pub fn last_step(&self) -> Option<&BlueprintStep> {
        self.steps.last()
    }
}

/// `"{work station} {ready product} SFP"`.
pub fn semi_finished_name(work_station_name: &str, ready_product_name: &str) -> String {
    format!("{} {} SFP", work_station_name, ready_product_name)
}

/// Checks that a blueprint can be instantiated.
pub fn validate_blueprint(blueprint: &TemplateBlueprint) -> Result<(), ServiceError> {
    let invalid = |msg: String| {
        Err(ServiceError::ValidationError(format!(
            "Template {}: {}",
            blueprint.template.id, msg
        )))
    };

    let Some(last) = blueprint.last_step() else {
        return invalid("has no steps".to_string());
    };

    for (idx, entry) in blueprint.steps.iter().enumerate() {
        let expected_sequence = idx as i32 + 1;
        if entry.step.sequence != expected_sequence {
            return invalid(format!(
                "step sequence {} found where {} was expected",
                entry.step.sequence, expected_sequence
            ));
        }
        if entry.step.expected_quantity <= Decimal::ZERO {
            return invalid(format!(
                "step {} has non-positive expected quantity",
                entry.step.sequence
            ));
        }
        if entry.step.is_last != (entry.step.id == last.step.id) {
            return invalid(format!(
                "step {} is_last flag does not match its position",
                entry.step.sequence
            ));
        }
        if entry
            .materials
            .iter()
            .any(|m| m.required_quantity <= Decimal::ZERO)
        {
            return invalid(format!(
                "step {} has a non-positive material quantity",
                entry.step.sequence
            ));
        }
    }

    if last.step.output_product_id != blueprint.template.product_id {
        return invalid("last step does not output the ready product".to_string());
    }

    Ok(())
}

/// Production templates: ordered steps turning materials into a ready product.
#[derive(Clone)]
pub struct TemplateService {
    db: Arc<DbPool>,
}

impl TemplateService {
    pub fn new(db: Arc<DbPool>) -> Self {
        Self { db }
    }

    #[instrument(skip(self))]
    pub async fn create_template(
        &self,
        request: NewTemplate,
        actor_id: Uuid,
    ) -> Result<prod_template::Model, ServiceError> {
        request.validate()?;
        let db = &*self.db;

        let product: product::Model =
            db::find_required::<_, Product>(db, request.product_id, "Product").await?;
        if product.product_type != ProductType::ReadyProduct {
            return Err(ServiceError::ValidationError(format!(
                "Product {} is not a ready product",
                product.id
            )));
        }

        let template = prod_template::ActiveModel {
            id: Set(Uuid::new_v4()),
            product_id: Set(product.id),
            comment: Set(request.comment),
            created_by: Set(actor_id),
            created_at: Set(Utc::now()),
        }
        .insert(db)
        .await
        .map_err(ServiceError::db_error)?;

        counter!("prodflow.templates.created", 1);
        info!(template_id = %template.id, product_id = %product.id, "Template created");
        Ok(template)
    }

    /// Appends the next step. Sequences must stay contiguous and nothing follows the last step.
    #[instrument(skip(self))]
    pub async fn add_step(
        &self,
        template_id: Uuid,
        request: NewTemplateStep,
        actor_id: Uuid,
    ) -> Result<BlueprintStep, ServiceError> {
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

        let template: prod_template::Model =
            db::find_locked::<_, ProdTemplate>(&txn, template_id, "Template").await?;
        let existing = Self::steps_in(&txn, template_id).await?;

        if existing.iter().any(|s| s.is_last) {
            return Err(ServiceError::InvalidOperation(format!(
                "Template {} already has a last step",
                template_id
            )));
        }
        let next_sequence = existing.len() as i32 + 1;
        if request.sequence != next_sequence {
            return Err(ServiceError::ValidationError(format!(
                "Step sequence must be {}",
                next_sequence
            )));
        }

        db::find_required::<_, WorkStation>(&txn, request.work_station_id, "Work station").await?;
        for material in &request.materials {
            db::find_required::<_, Product>(&txn, material.product_id, "Product").await?;
        }

        let output_product_id = match (request.is_last, request.output_product_id) {
            (true, Some(id)) if id != template.product_id => {
                return Err(ServiceError::ValidationError(
                    "Last step must output the template's ready product".to_string(),
                ));
            }
            (_, Some(id)) => {
                db::find_required::<_, Product>(&txn, id, "Product").await?;
                id
            }
            (is_last, None) => {
                Self::create_or_get_semi_finished_in(
                    &txn,
                    &template,
                    request.work_station_id,
                    is_last,
                )
                .await?
                .id
            }
        };

        let now = Utc::now();
        let step = prod_template_step::ActiveModel {
            id: Set(Uuid::new_v4()),
            prod_template_id: Set(template_id),
            sequence: Set(request.sequence),
            work_station_id: Set(request.work_station_id),
            output_product_id: Set(output_product_id),
            expected_quantity: Set(request.expected_quantity),
            is_last: Set(request.is_last),
            created_at: Set(now),
        }
        .insert(&txn)
        .await
        .map_err(ServiceError::db_error)?;

        let mut materials = Vec::with_capacity(request.materials.len());
        for material in request.materials {
            let row = prod_template_step_product::ActiveModel {
                id: Set(Uuid::new_v4()),
                prod_template_step_id: Set(step.id),
                product_id: Set(material.product_id),
                required_quantity: Set(material.required_quantity),
            }
            .insert(&txn)
            .await
            .map_err(ServiceError::db_error)?;
            materials.push(row);
        }

        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(
            %template_id,
            step_id = %step.id,
            sequence = step.sequence,
            %actor_id,
            "Template step added"
        );
        Ok(BlueprintStep { step, materials })
    }

    /// The product a step at `work_station_id` outputs. Idempotent.
    #[instrument(skip(self))]
    pub async fn create_or_get_semi_finished(
        &self,
        template_id: Uuid,
        work_station_id: Uuid,
        is_last: bool,
    ) -> Result<product::Model, ServiceError> {
        let db = &*self.db;
        let txn = db.begin().await.map_err(ServiceError::db_error)?;
        let template: prod_template::Model =
            db::find_required::<_, ProdTemplate>(&txn, template_id, "Template").await?;
        let product =
            Self::create_or_get_semi_finished_in(&txn, &template, work_station_id, is_last).await?;
        txn.commit().await.map_err(ServiceError::db_error)?;
        Ok(product)
    }

    async fn create_or_get_semi_finished_in<C: ConnectionTrait>(
        conn: &C,
        template: &prod_template::Model,
        work_station_id: Uuid,
        is_last: bool,
    ) -> Result<product::Model, ServiceError> {
        let ready: product::Model =
            db::find_required::<_, Product>(conn, template.product_id, "Product").await?;
        if is_last {
            return Ok(ready);
        }

        let station: work_station::Model =
            db::find_required::<_, WorkStation>(conn, work_station_id, "Work station").await?;

        let existing = Product::find()
            .filter(product::Column::ReadyProductId.eq(ready.id))
            .filter(product::Column::WorkStationId.eq(station.id))
            .filter(product::Column::ProductType.eq(ProductType::SemiFinishedProduct))
            .one(conn)
            .await
            .map_err(ServiceError::db_error)?;
        if let Some(product) = existing {
            return Ok(product);
        }

        let product = product::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(semi_finished_name(&station.name, &ready.name)),
            product_category_id: Set(ready.product_category_id),
            product_type: Set(ProductType::SemiFinishedProduct),
            work_station_id: Set(Some(station.id)),
            ready_product_id: Set(Some(ready.id)),
            created_at: Set(Utc::now()),
        }
        .insert(conn)
        .await
        .map_err(ServiceError::db_error)?;

        counter!("prodflow.templates.semi_finished_created", 1);
        info!(product_id = %product.id, name = %product.name, "Semi-finished product created");
        Ok(product)
    }

    #[instrument(skip(self))]
    pub async fn get_template(&self, template_id: Uuid) -> Result<TemplateBlueprint, ServiceError> {
        Self::load_blueprint_in(&*self.db, template_id).await
    }

    /// Most recently created template producing `product_id`.
    #[instrument(skip(self))]
    pub async fn latest_for_product(
        &self,
        product_id: Uuid,
    ) -> Result<Option<TemplateBlueprint>, ServiceError> {
        let db = &*self.db;
        let latest = ProdTemplate::find()
            .filter(prod_template::Column::ProductId.eq(product_id))
            .order_by_desc(prod_template::Column::CreatedAt)
            .one(db)
            .await
            .map_err(ServiceError::db_error)?;

        match latest {
            Some(template) => Ok(Some(Self::blueprint_of(db, template).await?)),
            None => Ok(None),
        }
    }

    pub(crate) async fn load_blueprint_in<C: ConnectionTrait>(
        conn: &C,
        template_id: Uuid,
    ) -> Result<TemplateBlueprint, ServiceError> {
        let template: prod_template::Model =
            db::find_required::<_, ProdTemplate>(conn, template_id, "Template").await?;
        Self::blueprint_of(conn, template).await
    }

    async fn blueprint_of<C: ConnectionTrait>(
        conn: &C,
        template: prod_template::Model,
    ) -> Result<TemplateBlueprint, ServiceError> {
        let steps = Self::steps_in(conn, template.id).await?;
        let step_ids: Vec<Uuid> = steps.iter().map(|s| s.id).collect();

        let mut materials = ProdTemplateStepProduct::find()
            .filter(prod_template_step_product::Column::ProdTemplateStepId.is_in(step_ids))
            .all(conn)
            .await
            .map_err(ServiceError::db_error)?;

        let steps = steps
            .into_iter()
            .map(|step| {
                let (own, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut materials)
                    .into_iter()
                    .partition(|m| m.prod_template_step_id == step.id);
                materials = rest;
                BlueprintStep {
                    step,
                    materials: own,
                }
            })
            .collect();

        Ok(TemplateBlueprint { template, steps })
    }

    async fn steps_in<C: ConnectionTrait>(
        conn: &C,
        template_id: Uuid,
    ) -> Result<Vec<prod_template_step::Model>, ServiceError> {
        ProdTemplateStep::find()
            .filter(prod_template_step::Column::ProdTemplateId.eq(template_id))
            .order_by_asc(prod_template_step::Column::Sequence)
            .all(conn)
            .await
            .map_err(ServiceError::db_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rust_decimal_macros::dec;

    fn blueprint(product_id: Uuid, steps: &[(i32, bool, Uuid)]) -> TemplateBlueprint {
        let now = Utc::now();
        let template = prod_template::Model {
            id: Uuid::new_v4(),
            product_id,
            comment: None,
            created_by: Uuid::new_v4(),
            created_at: now,
        };
        let steps = steps
            .iter()
            .map(|&(sequence, is_last, output)| BlueprintStep {
                step: prod_template_step::Model {
                    id: Uuid::new_v4(),
                    prod_template_id: template.id,
                    sequence,
                    work_station_id: Uuid::new_v4(),
                    output_product_id: output,
                    expected_quantity: dec!(1),
                    is_last,
                    created_at: now,
                },
                materials: vec![],
            })
            .collect();
        TemplateBlueprint { template, steps }
    }

    #[test]
    fn accepts_contiguous_steps_ending_in_ready_product() {
        let ready = Uuid::new_v4();
        let bp = blueprint(ready, &[(1, false, Uuid::new_v4()), (2, true, ready)]);
        assert!(validate_blueprint(&bp).is_ok());
    }

    #[test]
    fn rejects_gaps_and_wrong_last_output() {
        let ready = Uuid::new_v4();
        let gap = blueprint(ready, &[(1, false, Uuid::new_v4()), (3, true, ready)]);
        assert_matches!(validate_blueprint(&gap), Err(ServiceError::ValidationError(_)));

        let wrong_output = blueprint(ready, &[(1, true, Uuid::new_v4())]);
        assert_matches!(
            validate_blueprint(&wrong_output),
            Err(ServiceError::ValidationError(_))
        );

        let empty = blueprint(ready, &[]);
        assert_matches!(validate_blueprint(&empty), Err(ServiceError::ValidationError(_)));
    }

    #[test]
    fn rejects_misplaced_last_flag() {
        let ready = Uuid::new_v4();
        let bp = blueprint(ready, &[(1, true, ready), (2, true, ready)]);
        assert_matches!(validate_blueprint(&bp), Err(ServiceError::ValidationError(_)));
    }

    #[test]
    fn semi_finished_name_joins_station_and_product() {
        assert_eq!(semi_finished_name("Lathe", "Chair"), "Lathe Chair SFP");
    }

    #[test]
    fn step_request_requires_positive_quantities() {
        let step = NewTemplateStep {
            sequence: 1,
            work_station_id: Uuid::new_v4(),
            output_product_id: None,
            expected_quantity: dec!(0),
            is_last: true,
            materials: vec![NewTemplateMaterial {
                product_id: Uuid::new_v4(),
                required_quantity: dec!(-1),
            }],
        };
        assert!(step.validate().is_err());
    }
}
