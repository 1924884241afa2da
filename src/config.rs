pub use self::parser::{
    BucketConfig, Config, DatabaseConfig, LoggingConfig, ProviderConfig, RateLimitsConfig,
    SyncConfig, WebConfig,
};
pub use self::validator::ConfigError;

mod parser;
mod validator;
