pub mod core;
pub mod resources;
