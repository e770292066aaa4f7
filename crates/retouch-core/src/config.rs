use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub telegram: TelegramConfig,
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub tasks: TasksConfig,
    #[serde(default)]
    pub referral: ReferralConfig,
    #[serde(default = "default_packages")]
    pub packages: Vec<CreditPackage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub listen: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub sqlite_path: String,
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    pub base_url: String,
    pub api_key: String,
    /// Public base URL this daemon is reachable at; the vendor calls back to
    /// `{webhook_base_url}/gateway/webhook`.
    pub webhook_base_url: String,
    #[serde(default = "default_gateway_timeout_seconds")]
    pub timeout_seconds: u64,
    #[serde(default = "default_gateway_retry_max_attempts")]
    pub retry_max_attempts: usize,
    #[serde(default = "default_gateway_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TasksConfig {
    #[serde(default = "default_task_timeout_minutes")]
    pub timeout_minutes: u64,
    #[serde(default = "default_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            timeout_minutes: default_task_timeout_minutes(),
            sweep_interval_seconds: default_sweep_interval_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReferralConfig {
    /// Share of a referred payment credited to the referrer.
    #[serde(default = "default_referral_bonus_rate")]
    pub bonus_rate: f64,
    #[serde(default = "default_referral_max_chain_depth")]
    pub max_chain_depth: usize,
}

impl Default for ReferralConfig {
    fn default() -> Self {
        Self {
            bonus_rate: default_referral_bonus_rate(),
            max_chain_depth: default_referral_max_chain_depth(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreditPackage {
    pub id: i64,
    pub credits: i64,
    pub price: f64,
    pub description: String,
}

fn default_gateway_timeout_seconds() -> u64 {
    30
}

fn default_gateway_retry_max_attempts() -> usize {
    3
}

fn default_gateway_retry_backoff_ms() -> u64 {
    500
}

fn default_task_timeout_minutes() -> u64 {
    30
}

fn default_sweep_interval_seconds() -> u64 {
    60
}

fn default_referral_bonus_rate() -> f64 {
    0.5
}

fn default_referral_max_chain_depth() -> usize {
    10
}

fn default_packages() -> Vec<CreditPackage> {
    vec![
        CreditPackage {
            id: 1,
            credits: 4,
            price: 500.0,
            description: "4 generations (125/each)".to_string(),
        },
        CreditPackage {
            id: 2,
            credits: 8,
            price: 700.0,
            description: "8 generations (87.5/each)".to_string(),
        },
        CreditPackage {
            id: 3,
            credits: 16,
            price: 1120.0,
            description: "16 generations (70/each)".to_string(),
        },
        CreditPackage {
            id: 4,
            credits: 50,
            price: 2500.0,
            description: "50 generations (50/each)".to_string(),
        },
    ]
}

impl AppConfig {
    pub fn load(path: &str) -> Result<Self, config::ConfigError> {
        let cfg = config::Config::builder()
            .add_source(config::File::with_name(path))
            .build()?;
        cfg.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_cover_optional_sections() {
        let cfg = config::Config::builder()
            .add_source(config::File::from_str(
                r#"
                [server]
                listen = "127.0.0.1:8080"

                [database]
                sqlite_path = "data/retouch.db"
                busy_timeout_ms = 3000

                [telegram]
                bot_token = "test-token"

                [gateway]
                base_url = "https://vendor.example"
                api_key = "k"
                webhook_base_url = "https://bot.example"
                "#,
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap();
        let cfg: AppConfig = cfg.try_deserialize().unwrap();

        assert_eq!(cfg.tasks.timeout_minutes, 30);
        assert_eq!(cfg.tasks.sweep_interval_seconds, 60);
        assert_eq!(cfg.gateway.timeout_seconds, 30);
        assert_eq!(cfg.gateway.retry_max_attempts, 3);
        assert_eq!(cfg.referral.bonus_rate, 0.5);
        assert_eq!(cfg.referral.max_chain_depth, 10);
        assert_eq!(cfg.packages.len(), 4);
        assert_eq!(cfg.packages[0].credits, 4);
    }
}
