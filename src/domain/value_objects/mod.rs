pub mod money;
pub mod quantity;
