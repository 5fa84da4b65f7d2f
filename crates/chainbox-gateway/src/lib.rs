pub mod config;
pub mod error;
pub mod gate;
pub mod proxy;
pub mod routes;
pub mod state;
