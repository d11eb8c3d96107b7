pub mod alarm;
pub mod health;
