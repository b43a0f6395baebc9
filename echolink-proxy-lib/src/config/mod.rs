mod loader;
mod registration;
mod root;
mod security;
mod telemetry;
mod timeout;
mod validator;

pub use loader::{load_from_path, load_from_str};
pub use registration::RegistrationConfig;
pub use root::{ProxyConfig, DEFAULT_PORT, PUBLIC_PASSWORD};
pub use security::CallsignFilterConfig;
pub use telemetry::LoggingConfig;
pub use timeout::TimeoutConfig;
pub use validator::validate;
