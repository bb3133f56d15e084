pub mod schema;

pub use schema::{
    Config, HybridConfig, InterceptorConfig, KeywordRoute, PatternRoute, RoutingConfig,
    StorageBackend, StorageConfig,
};
