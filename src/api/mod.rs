// API module for the storefront admin HTTP server
// Exposes rates, bulk catalog import and product maintenance to the admin UI

pub mod auth;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod server;
pub mod sessions;

pub use server::{ApiServer, AppState};
