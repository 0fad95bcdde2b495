pub mod keepalive_task;
pub mod middleware;
pub mod protocol;
pub mod question_task;
pub mod registry;
pub mod relay_task;
pub mod rest;
pub mod state;
pub mod teardown_task;
pub mod ws_handler;

#[cfg(test)]
pub mod testing;

// Re-export the handlers and middleware the binary wires into its router.
pub use middleware::require_identity;
pub use rest::{disconnect_handler, list_answers_handler, rollback_handler, teardown_status_handler};
pub use ws_handler::ws_handler;
