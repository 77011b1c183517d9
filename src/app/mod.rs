pub mod config;
pub mod state;

pub use config::{AppConfig, CustomTemplate, ModelConfig, ProviderConfig};
pub use state::AppState;
