mod api;
mod backend;
pub mod utils;
