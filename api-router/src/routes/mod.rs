pub mod chat;
pub mod health;
pub mod liveness;
pub mod readiness;
pub mod search;
