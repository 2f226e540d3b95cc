// Additional middleware for logging, CORS, and request limits

use actix_web::middleware::{Compress, Logger};
use actix_web::web;

/// Largest CSV body accepted by the import preview endpoint.
pub const MAX_CSV_BYTES: usize = 10 * 1024 * 1024;

pub fn setup_middleware() -> (Logger, Compress) {
    let logger = Logger::new("%r %s %Dms");
    let compress = Compress::default();
    (logger, compress)
}

/// Raw-body limit for uploaded spreadsheets; actix defaults to 256 KiB.
pub fn csv_payload_limit() -> web::PayloadConfig {
    web::PayloadConfig::new(MAX_CSV_BYTES)
}

// CORS configuration
use actix_cors::Cors;
use actix_web::http::header;

pub fn setup_cors(allowed_origins: &str) -> Cors {
    let origins = allowed_origins
        .split(',')
        .map(str::trim)
        .filter(|o| !o.is_empty());

    let mut cors = Cors::default()
        .allowed_methods(vec!["GET", "POST", "PATCH", "DELETE"])
        .allowed_headers(vec![
            header::AUTHORIZATION,
            header::ACCEPT,
            header::CONTENT_TYPE,
        ])
        .max_age(3600);

    for origin in origins {
        cors = cors.allowed_origin(origin);
    }

    cors
}
