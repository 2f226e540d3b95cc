// API route configuration

use crate::api::handlers;
use actix_web::web;

pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg
        // Health check (no auth required)
        .route("/health", web::get().to(handlers::health_check))
        .route("/", web::get().to(handlers::health_check))
        // API v1 routes (all require authentication)
        .service(
            web::scope("/api/v1")
                // Exchange rates
                .route("/rates", web::get().to(handlers::get_rates))
                .route("/rates/convert", web::get().to(handlers::convert_amount))
                // Bulk import: preview, then explicit commit
                .route("/catalog/import", web::post().to(handlers::preview_import))
                .route("/catalog/import/{session}", web::get().to(handlers::get_import))
                .route(
                    "/catalog/import/{session}",
                    web::delete().to(handlers::discard_import),
                )
                .route(
                    "/catalog/import/{session}/commit",
                    web::post().to(handlers::commit_import),
                )
                // Product maintenance
                .route(
                    "/catalog/products/{id}",
                    web::patch().to(handlers::update_product),
                )
                .route(
                    "/catalog/products/{id}",
                    web::delete().to(handlers::delete_product),
                ),
        );
}
