/// HTTP and websocket entry points
pub mod chats;
pub mod groups;
pub mod notifications;
pub mod requests;
pub mod websocket;

use actix_web::web;

/// Mounts every route except `/health` and `/metrics`.
pub fn configure(cfg: &mut web::ServiceConfig) {
    websocket::register_routes(cfg);
    requests::register_routes(cfg);
    groups::register_routes(cfg);
    chats::register_routes(cfg);
    notifications::register_routes(cfg);
}
