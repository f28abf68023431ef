use serde::Deserialize;

/// Process configuration, read from the environment (and `.env`).
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub database_url: String,
    #[serde(default = "default_api_host")]
    pub api_host: String,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default = "default_pool_size")]
    pub database_pool_size: u32,
    #[serde(default = "default_true")]
    pub run_migrations: bool,
    /// Notifications are only logged when no broker host is configured.
    pub amqp_host: Option<String>,
    #[serde(default = "default_amqp_port")]
    pub amqp_port: u16,
    #[serde(default = "default_amqp_credential")]
    pub amqp_username: String,
    #[serde(default = "default_amqp_credential")]
    pub amqp_password: String,
    #[serde(default = "default_notification_exchange")]
    pub notification_exchange: String,
}

fn default_api_host() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_pool_size() -> u32 {
    10
}

fn default_true() -> bool {
    true
}

fn default_amqp_port() -> u16 {
    5672
}

fn default_amqp_credential() -> String {
    "guest".to_string()
}

fn default_notification_exchange() -> String {
    "gametables.notifications".to_string()
}

impl Config {
    pub fn from_env() -> Result<Config, envy::Error> {
        envy::from_env::<Config>()
    }
}

/// Base values for the `game-tables.notifications.*` keys, read from
/// `GAME_TABLES_NOTIFICATIONS_*`. Unset keys stay `None`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotificationDefaults {
    pub notify_on_registration: Option<bool>,
    pub notify_on_cancellation: Option<bool>,
    pub notify_waiting_list_promotion: Option<bool>,
}

impl NotificationDefaults {
    pub const ENV_PREFIX: &'static str = "GAME_TABLES_NOTIFICATIONS_";

    pub fn from_env() -> Result<NotificationDefaults, envy::Error> {
        envy::prefixed(Self::ENV_PREFIX).from_env::<NotificationDefaults>()
    }
}
