//! Ingress validation for deal parameters
//!
//! Durations are counted in 30-second chain epochs. The admissible window is
//! 180 to 534 days, i.e. `[518400, 1540000]` epochs, both ends inclusive.

use crate::error::BridgeError;

pub const MIN_DURATION_EPOCHS: i64 = 518_400;
pub const MAX_DURATION_EPOCHS: i64 = 1_540_000;

pub fn validate_duration_epochs(epochs: i64) -> Result<(), BridgeError> {
    if (MIN_DURATION_EPOCHS..=MAX_DURATION_EPOCHS).contains(&epochs) {
        Ok(())
    } else {
        Err(BridgeError::InvalidInput(format!(
            "duration {} epochs outside [{}, {}] (180 to 534 days)",
            epochs, MIN_DURATION_EPOCHS, MAX_DURATION_EPOCHS
        )))
    }
}

/// Split a comma-separated id list, returning parsed ids and rejected tokens
pub fn parse_deal_id_list(list: &str) -> (Vec<i64>, Vec<String>) {
    let mut ids = Vec::new();
    let mut rejected = Vec::new();
    for token in list.split(',').map(str::trim).filter(|t| !t.is_empty()) {
        match token.parse::<i64>() {
            Ok(id) => ids.push(id),
            Err(_) => rejected.push(token.to_string()),
        }
    }
    (ids, rejected)
}
