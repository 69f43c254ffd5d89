pub mod logs;
pub mod tasks;
pub mod workers;
