pub mod rounding;
pub mod suppression;
pub mod validation;

pub use rounding::{redact_and_round, redact_measure_rows, round_to_base};
pub use suppression::group_low_values;
pub use validation::{drop_redacted_groups, validate_redaction_rate, RedactionCheck};
