use crate::events::{ConsumerConfig, EnvelopeOrigin};
use event_bus::{BackoffStrategy, RetryConfig};
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusType {
    Amqp,
    InMemory,
}

impl BusType {
    pub fn from_env() -> Self {
        match env::var("BUS_TYPE")
            .unwrap_or_else(|_| "amqp".to_string())
            .to_lowercase()
            .as_str()
        {
            "amqp" | "rabbitmq" => BusType::Amqp,
            "inmemory" => BusType::InMemory,
            _ => {
                tracing::warn!("Unknown BUS_TYPE, defaulting to amqp");
                BusType::Amqp
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreType {
    Postgres,
    InMemory,
}

impl StoreType {
    pub fn from_env() -> Self {
        match env::var("STORE_TYPE")
            .unwrap_or_else(|_| "inmemory".to_string())
            .to_lowercase()
            .as_str()
        {
            "postgres" => StoreType::Postgres,
            "inmemory" => StoreType::InMemory,
            _ => {
                tracing::warn!("Unknown STORE_TYPE, defaulting to inmemory");
                StoreType::InMemory
            }
        }
    }
}

/// Application configuration parsed from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub bus_type: BusType,
    pub amqp_url: String,
    pub amqp_prefetch: u16,
    pub store_type: StoreType,
    pub database_url: Option<String>,
    pub host: String,
    pub port: u16,
    pub broker_connect_attempts: u32,
    pub broker_connect_delay: Duration,
    pub broker_backoff: BackoffStrategy,
    pub broker_max_delay: Duration,
    pub redelivery_delay: Duration,
    pub handler_timeout: Option<Duration>,
    pub publish_timeout: Duration,
    pub service_origin: String,
    pub event_version: String,
    pub environment: String,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        let bus_type = BusType::from_env();
        let amqp_url = env::var("AMQP_URL").unwrap_or_else(|_| "amqp://rabbitmq:5672/".to_string());
        let amqp_prefetch: u16 = parse_var("AMQP_PREFETCH", 1)?;

        let store_type = StoreType::from_env();
        let database_url = match store_type {
            StoreType::Postgres => Some(
                env::var("DATABASE_URL")
                    .map_err(|_| "DATABASE_URL must be set when STORE_TYPE=postgres".to_string())?,
            ),
            StoreType::InMemory => None,
        };

        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port: u16 = parse_var("PORT", 8080)?;

        let broker_connect_attempts: u32 = parse_var("BROKER_CONNECT_ATTEMPTS", 30)?;
        if broker_connect_attempts == 0 {
            return Err("BROKER_CONNECT_ATTEMPTS must be at least 1".to_string());
        }
        let broker_connect_delay =
            Duration::from_millis(parse_var("BROKER_CONNECT_DELAY_MS", 5000)?);
        let broker_backoff = match env::var("BROKER_BACKOFF")
            .unwrap_or_else(|_| "fixed".to_string())
            .to_lowercase()
            .as_str()
        {
            "fixed" => BackoffStrategy::Fixed,
            "exponential" => BackoffStrategy::Exponential,
            other => {
                return Err(format!(
                    "BROKER_BACKOFF must be fixed or exponential, got '{}'",
                    other
                ))
            }
        };
        let broker_max_delay = Duration::from_millis(parse_var("BROKER_MAX_DELAY_MS", 60_000)?);

        let redelivery_delay = Duration::from_millis(parse_var("REDELIVERY_DELAY_MS", 1000)?);
        let handler_timeout = match parse_var::<u64>("HANDLER_TIMEOUT_MS", 10_000)? {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };
        let publish_timeout = Duration::from_millis(parse_var("PUBLISH_TIMEOUT_MS", 5000)?);

        let service_origin =
            env::var("SERVICE_ORIGIN").unwrap_or_else(|_| "BirthdayService".to_string());
        let event_version = env::var("EVENT_VERSION").unwrap_or_else(|_| "1.0".to_string());
        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "production".to_string());

        Ok(Self {
            bus_type,
            amqp_url,
            amqp_prefetch,
            store_type,
            database_url,
            host,
            port,
            broker_connect_attempts,
            broker_connect_delay,
            broker_backoff,
            broker_max_delay,
            redelivery_delay,
            handler_timeout,
            publish_timeout,
            service_origin,
            event_version,
            environment,
        })
    }

    pub fn broker_retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.broker_connect_attempts,
            initial_backoff: self.broker_connect_delay,
            max_backoff: self.broker_max_delay,
            strategy: self.broker_backoff,
        }
    }

    pub fn consumer(&self) -> ConsumerConfig {
        ConsumerConfig {
            retry: self.broker_retry(),
            redelivery_delay: self.redelivery_delay,
            handler_timeout: self.handler_timeout,
            ..ConsumerConfig::default()
        }
    }

    pub fn origin(&self) -> EnvelopeOrigin {
        EnvelopeOrigin {
            service_origin: self.service_origin.clone(),
            version: self.event_version.clone(),
            environment: self.environment.clone(),
        }
    }
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T, String> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| format!("{} must be a valid {}", name, std::any::type_name::<T>())),
        Err(_) => Ok(default),
    }
}
