use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub session: SessionConfig,
    pub otp: OtpConfig,
    pub impersonation: ImpersonationConfig,
    pub google: OAuthClientConfig,
    pub microsoft: MicrosoftOAuthConfig,
    pub smtp: SmtpConfig,
    pub security: SecurityConfig,
    pub swagger: SwaggerConfig,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

/// Session cookie and lifetime settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    pub cookie_name: String,
    /// Parent domain shared with the proxied applications, e.g. `.example.com`.
    pub cookie_domain: Option<String>,
    pub cookie_secure: bool,
    pub lifetime_seconds: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OtpConfig {
    pub enabled: bool,
    pub ttl_minutes: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImpersonationConfig {
    pub default_minutes: i64,
    pub max_minutes: i64,
    pub cleanup_interval_seconds: u64,
    /// Email the impersonated user when a session starts.
    pub notify_target: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OAuthClientConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MicrosoftOAuthConfig {
    #[serde(flatten)]
    pub client: OAuthClientConfig,
    pub tenant: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from_address: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    pub allowed_origins: Vec<String>,
    /// Where browser flows land after login, registration or an OAuth error.
    pub frontend_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SwaggerConfig {
    pub enabled: SwaggerMode,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum SwaggerMode {
    Public,
    Disabled,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    pub login_attempts: u32,
    pub login_window_seconds: u64,
    pub register_attempts: u32,
    pub register_window_seconds: u64,
    pub global_ip_limit: u32,
    pub global_ip_window_seconds: u64,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;

        let config = GatewayConfig {
            common: common_config,
            environment: environment.clone(),
            service_name: get_env("SERVICE_NAME", Some("auth-gateway"), is_prod)?,
            service_version: get_env("SERVICE_VERSION", Some(env!("CARGO_PKG_VERSION")), is_prod)?,
            log_level: get_env("LOG_LEVEL", Some("info"), is_prod)?,
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|s| !s.is_empty()),
            database: DatabaseConfig {
                url: get_env("DATABASE_URL", None, is_prod)?,
                max_connections: get_parsed("DATABASE_MAX_CONNECTIONS", "10")?,
                min_connections: get_parsed("DATABASE_MIN_CONNECTIONS", "1")?,
            },
            redis: RedisConfig {
                url: get_env("REDIS_URL", Some("redis://127.0.0.1:6379"), is_prod)?,
            },
            session: SessionConfig {
                cookie_name: get_env("SESSION_COOKIE_NAME", Some("gateway_session"), is_prod)?,
                cookie_domain: env::var("SESSION_COOKIE_DOMAIN")
                    .ok()
                    .filter(|s| !s.is_empty()),
                cookie_secure: get_parsed("SESSION_COOKIE_SECURE", "true")?,
                lifetime_seconds: get_parsed("SESSION_LIFETIME_SECONDS", "14400")?,
            },
            otp: OtpConfig {
                enabled: get_parsed("OTP_ENABLED", "true")?,
                ttl_minutes: get_parsed("OTP_TTL_MINUTES", "10")?,
            },
            impersonation: ImpersonationConfig {
                default_minutes: get_parsed("IMPERSONATION_DEFAULT_MINUTES", "30")?,
                max_minutes: get_parsed("IMPERSONATION_MAX_MINUTES", "60")?,
                cleanup_interval_seconds: get_parsed("IMPERSONATION_CLEANUP_INTERVAL_SECONDS", "60")?,
                notify_target: get_parsed("IMPERSONATION_NOTIFY_TARGET", "false")?,
            },
            google: OAuthClientConfig {
                client_id: get_env("GOOGLE_CLIENT_ID", Some(""), is_prod)?,
                client_secret: get_env("GOOGLE_CLIENT_SECRET", Some(""), is_prod)?,
                redirect_uri: get_env(
                    "GOOGLE_REDIRECT_URI",
                    Some("http://localhost:8080/auth/oauth/google/callback"),
                    is_prod,
                )?,
            },
            microsoft: MicrosoftOAuthConfig {
                client: OAuthClientConfig {
                    client_id: get_env("MICROSOFT_CLIENT_ID", Some(""), is_prod)?,
                    client_secret: get_env("MICROSOFT_CLIENT_SECRET", Some(""), is_prod)?,
                    redirect_uri: get_env(
                        "MICROSOFT_REDIRECT_URI",
                        Some("http://localhost:8080/auth/oauth/microsoft/callback"),
                        is_prod,
                    )?,
                },
                tenant: get_env("MICROSOFT_TENANT", Some("common"), is_prod)?,
            },
            smtp: SmtpConfig {
                host: get_env("SMTP_HOST", Some("localhost"), is_prod)?,
                port: get_parsed("SMTP_PORT", "587")?,
                username: get_env("SMTP_USERNAME", Some(""), is_prod)?,
                password: get_env("SMTP_PASSWORD", Some(""), is_prod)?,
                from_address: get_env(
                    "SMTP_FROM_ADDRESS",
                    Some("no-reply@localhost"),
                    is_prod,
                )?,
            },
            security: SecurityConfig {
                allowed_origins: get_env(
                    "ALLOWED_ORIGINS",
                    Some("http://localhost:3000"),
                    is_prod,
                )?
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
                frontend_url: get_env("FRONTEND_URL", Some("http://localhost:3000"), is_prod)?,
            },
            swagger: SwaggerConfig {
                enabled: get_env("ENABLE_SWAGGER", Some("public"), is_prod)?
                    .parse()
                    .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?,
            },
            rate_limit: RateLimitConfig {
                login_attempts: get_parsed("RATE_LIMIT_LOGIN_ATTEMPTS", "10")?,
                login_window_seconds: get_parsed("RATE_LIMIT_LOGIN_WINDOW_SECONDS", "900")?,
                register_attempts: get_parsed("RATE_LIMIT_REGISTER_ATTEMPTS", "5")?,
                register_window_seconds: get_parsed("RATE_LIMIT_REGISTER_WINDOW_SECONDS", "3600")?,
                global_ip_limit: get_parsed("RATE_LIMIT_GLOBAL_IP_LIMIT", "300")?,
                global_ip_window_seconds: get_parsed("RATE_LIMIT_GLOBAL_IP_WINDOW_SECONDS", "60")?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.common.port == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PORT must be greater than 0"
            )));
        }

        if self.session.lifetime_seconds <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "SESSION_LIFETIME_SECONDS must be positive"
            )));
        }

        if self.otp.ttl_minutes <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "OTP_TTL_MINUTES must be positive"
            )));
        }

        if self.impersonation.max_minutes < 1 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "IMPERSONATION_MAX_MINUTES must be at least 1"
            )));
        }

        if self.impersonation.default_minutes < 1
            || self.impersonation.default_minutes > self.impersonation.max_minutes
        {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "IMPERSONATION_DEFAULT_MINUTES must be between 1 and IMPERSONATION_MAX_MINUTES"
            )));
        }

        if self.impersonation.cleanup_interval_seconds == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "IMPERSONATION_CLEANUP_INTERVAL_SECONDS must be positive"
            )));
        }

        if self.environment == Environment::Prod {
            if self.security.allowed_origins.iter().any(|o| o == "*") {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "Wildcard CORS origin not allowed in production"
                )));
            }

            if !self.session.cookie_secure {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "SESSION_COOKIE_SECURE must be true in production"
                )));
            }

            if self.swagger.enabled == SwaggerMode::Public {
                tracing::warn!("Swagger UI is publicly accessible in production");
            }
        }

        Ok(())
    }

    pub fn is_prod(&self) -> bool {
        self.environment == Environment::Prod
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required in production but not set",
                    key
                )))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required but not set",
                    key
                )))
            }
        }
    }
}

/// Tunables with a sane default are optional even in production.
fn get_parsed<T>(key: &str, default: &str) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = env::var(key).unwrap_or_else(|_| default.to_string());
    raw.trim()
        .parse()
        .map_err(|e: T::Err| AppError::ConfigError(anyhow::anyhow!("Invalid {}: {}", key, e)))
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}

impl FromStr for SwaggerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "public" => Ok(SwaggerMode::Public),
            "disabled" => Ok(SwaggerMode::Disabled),
            _ => Err(format!("Invalid swagger mode: {}", s)),
        }
    }
}

impl GatewayConfig {
    /// Settings for tests and local tooling; never read from the environment.
    pub fn for_tests() -> Self {
        Self {
            common: core_config::Config::default(),
            environment: Environment::Dev,
            service_name: "auth-gateway".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            log_level: "error".to_string(),
            otlp_endpoint: None,
            database: DatabaseConfig {
                url: "postgres://localhost/auth_gateway_test".to_string(),
                max_connections: 1,
                min_connections: 1,
            },
            redis: RedisConfig {
                url: "redis://127.0.0.1:6379".to_string(),
            },
            session: SessionConfig {
                cookie_name: "gateway_session".to_string(),
                cookie_domain: Some(".example.test".to_string()),
                cookie_secure: true,
                lifetime_seconds: 4 * 60 * 60,
            },
            otp: OtpConfig {
                enabled: true,
                ttl_minutes: 10,
            },
            impersonation: ImpersonationConfig {
                default_minutes: 30,
                max_minutes: 60,
                cleanup_interval_seconds: 60,
                notify_target: false,
            },
            google: OAuthClientConfig {
                client_id: "google-client".to_string(),
                client_secret: "google-secret".to_string(),
                redirect_uri: "https://auth.example.test/auth/oauth/google/callback".to_string(),
            },
            microsoft: MicrosoftOAuthConfig {
                client: OAuthClientConfig {
                    client_id: "microsoft-client".to_string(),
                    client_secret: "microsoft-secret".to_string(),
                    redirect_uri: "https://auth.example.test/auth/oauth/microsoft/callback"
                        .to_string(),
                },
                tenant: "common".to_string(),
            },
            smtp: SmtpConfig {
                host: "localhost".to_string(),
                port: 2525,
                username: String::new(),
                password: String::new(),
                from_address: "no-reply@example.test".to_string(),
            },
            security: SecurityConfig {
                allowed_origins: vec!["https://app.example.test".to_string()],
                frontend_url: "https://portal.example.test".to_string(),
            },
            swagger: SwaggerConfig {
                enabled: SwaggerMode::Disabled,
            },
            rate_limit: RateLimitConfig {
                login_attempts: 1000,
                login_window_seconds: 60,
                register_attempts: 1000,
                register_window_seconds: 60,
                global_ip_limit: 10_000,
                global_ip_window_seconds: 60,
            },
        }
    }
}
