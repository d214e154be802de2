pub mod core;
pub mod utils;
pub mod workers;
