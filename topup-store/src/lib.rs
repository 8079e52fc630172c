pub mod app_config;
pub mod code_repo;
pub mod database;
pub mod events;

pub use app_config::Config;
pub use code_repo::PgCodeStore;
pub use database::DbClient;
pub use events::EventHub;
