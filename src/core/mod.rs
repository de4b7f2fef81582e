pub mod alert;
pub mod drop;
pub mod error;
pub mod hit;
pub mod token;
