pub mod clock;
pub mod config;
pub mod heartbeat;
pub mod inbox;
pub mod lifecycle;
pub mod outbox;
pub mod policy;
pub mod store;
pub mod sweeper;
pub mod sync;
pub mod terminal;
pub mod vault;
