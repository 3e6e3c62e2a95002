use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderValue, Method};
use tether_core::AppError;
use tower_http::cors::CorsLayer;

pub(super) fn build_cors_layer(viewer_origin: &str) -> Result<CorsLayer, AppError> {
    Ok(CorsLayer::new()
        .allow_origin(
            HeaderValue::from_str(viewer_origin)
                .map_err(|error| AppError::Validation(format!("invalid VIEWER_ORIGIN: {error}")))?,
        )
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE]))
}
