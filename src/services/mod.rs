// Stock ledger
pub mod inventory;

// Production
pub mod prod_orders;
pub mod templates;

// Procurement
pub mod supply_orders;

// Work items
pub mod tasks;

// Service factory for dependency injection
pub mod factory;

use rust_decimal::Decimal;
use validator::ValidationError;

pub(crate) fn validate_positive_decimal(value: &Decimal) -> Result<(), ValidationError> {
    if *value > Decimal::ZERO {
        Ok(())
    } else {
        let mut err = ValidationError::new("range");
        err.message = Some("Quantity must be greater than 0".into());
        Err(err)
    }
}

pub(crate) fn validate_non_negative_decimal(value: &Decimal) -> Result<(), ValidationError> {
    if *value >= Decimal::ZERO {
        Ok(())
    } else {
        let mut err = ValidationError::new("range");
        err.message = Some("Amount cannot be negative".into());
        Err(err)
    }
}
