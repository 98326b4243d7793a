pub mod config;
pub mod events;
pub mod models;
pub mod routes;
pub mod store;

pub use config::Config;
pub use events::{EventConsumer, EventPublisher, UserEvent};
pub use routes::{birthdays_router, AppState};
pub use store::{BirthdayStore, InMemoryStore, PgStore, StoreError};
