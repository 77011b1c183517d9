pub mod adapter;
pub mod cooldown;
pub mod custom;
pub mod direct;
pub mod gateway;
pub mod health;
pub mod image;
pub mod metrics;
pub mod provider;
pub mod registry;
pub mod transport;

pub use adapter::{build_adapter, ModelFailure, ProviderAdapter};
pub use cooldown::{classify, CooldownPolicy, ErrorClass, ResiliencePolicy};
pub use gateway::{Gateway, GatewayConfig, GatewayStats, ProviderHealthStatus};
pub use health::{HealthChecker, HealthCheckerConfig};
pub use metrics::{AttemptRecord, MetricsCollector, Recommendation};
pub use provider::{
    BackendKind, ContentType, Credentials, GenerationRequest, GenerationResponse, ModelDescriptor,
    ModelStatus, ProviderDescriptor,
};
pub use registry::Registry;
