pub mod common;
pub mod rules;

pub use rules::{Manager, ManagerOptions};
