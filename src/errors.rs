use rust_decimal::Decimal;
use sea_orm::error::DbErr;
use serde::Serialize;
use uuid::Uuid;

/// A single material shortfall: which product is missing and by how much.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InsufficientAsset {
    pub product_id: Uuid,
    pub product_name: String,
    pub product_category_id: Uuid,
    pub missing_quantity: Decimal,
}

impl std::fmt::Display for InsufficientAsset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} missing {}", self.product_name, self.missing_quantity)
    }
}

fn format_assets(assets: &[InsufficientAsset]) -> String {
    assets
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, thiserror::Error, Serialize)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(
        #[from]
        #[serde(skip)]
        sea_orm::error::DbErr,
    ),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Insufficient stock: {0}")]
    InsufficientStock(String),

    #[error("Insufficient assets: {}", format_assets(.0))]
    InsufficientAssets(Vec<InsufficientAsset>),

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Execution {0} is already approved")]
    AlreadyApproved(Uuid),

    #[error("Supply order {0} can no longer be modified")]
    ImmutableOrder(Uuid),

    #[error("Concurrent modification: {0}")]
    ConcurrentModification(Uuid),

    #[error("Other error: {0}")]
    Other(
        #[from]
        #[serde(skip)]
        anyhow::Error,
    ),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

pub trait IntoDbErr {
    fn into_db_err(self) -> DbErr;
}

impl IntoDbErr for DbErr {
    fn into_db_err(self) -> DbErr {
        self
    }
}

impl IntoDbErr for String {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self)
    }
}

impl IntoDbErr for &str {
    fn into_db_err(self) -> DbErr {
        DbErr::Custom(self.to_string())
    }
}

impl ServiceError {
    /// Generic constructor that normalizes any supported database error input.
    pub fn db_error<E: IntoDbErr>(error: E) -> Self {
        ServiceError::DatabaseError(error.into_db_err())
    }

    pub fn invalid_transition(from: impl std::fmt::Debug, to: impl std::fmt::Debug) -> Self {
        ServiceError::InvalidTransition {
            from: format!("{:?}", from),
            to: format!("{:?}", to),
        }
    }

    pub fn not_found(entity: &str, id: Uuid) -> Self {
        ServiceError::NotFound(format!("{} {} not found", entity, id))
    }

    /// Shortfalls carried by this error, if any.
    pub fn shortfalls(&self) -> &[InsufficientAsset] {
        match self {
            ServiceError::InsufficientAssets(assets) => assets,
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn insufficient_assets_lists_every_shortfall() {
        let err = ServiceError::InsufficientAssets(vec![
            InsufficientAsset {
                product_id: Uuid::new_v4(),
                product_name: "Steel sheet".into(),
                product_category_id: Uuid::new_v4(),
                missing_quantity: dec!(6),
            },
            InsufficientAsset {
                product_id: Uuid::new_v4(),
                product_name: "Paint".into(),
                product_category_id: Uuid::new_v4(),
                missing_quantity: dec!(0.5),
            },
        ]);

        assert_eq!(
            err.to_string(),
            "Insufficient assets: Steel sheet missing 6, Paint missing 0.5"
        );
        assert_eq!(err.shortfalls().len(), 2);
    }

    #[test]
    fn db_error_wraps_plain_messages() {
        let err = ServiceError::db_error("connection reset");
        assert!(matches!(err, ServiceError::DatabaseError(DbErr::Custom(_))));
        assert!(ServiceError::NotFound("x".into()).shortfalls().is_empty());
    }
}
