pub mod schema;

pub use schema::{
    AgentConfig, Config, ConfirmationConfig, OAuthConfig, ProviderConfig, ToolServerConfig,
    ToolServerPreset,
};
