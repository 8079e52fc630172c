pub mod models;
pub mod pii;

pub use models::events::{OrderChange, OrderEvent};
pub use pii::Masked;
