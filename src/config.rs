// 配置读取：启动时从环境变量构建不可变配置。
use std::env;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub auth_token: String,
    pub jwt_secret: String,
    pub database_url: String,
    pub event_retention_days: i64,
    pub retention_interval_hours: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            auth_token: String::new(),
            jwt_secret: String::new(),
            database_url: String::new(),
            event_retention_days: 30,
            retention_interval_hours: 24,
        }
    }
}

impl Config {
    pub fn load() -> Self {
        let mut cfg = Config {
            auth_token: env_string("COORDINATOR_AUTH_TOKEN"),
            jwt_secret: env_string("COORDINATOR_JWT_SECRET"),
            database_url: env_string("COORDINATOR_DATABASE_URL"),
            ..Config::default()
        };

        if cfg.database_url.is_empty() {
            cfg.database_url = env_string("DATABASE_URL");
        }

        if let Some(port) = env_parse::<u16>("COORDINATOR_PORT").filter(|p| *p > 0) {
            cfg.port = port;
        }
        if let Some(days) = env_parse::<i64>("COORDINATOR_EVENT_RETENTION_DAYS").filter(|n| *n >= 0)
        {
            cfg.event_retention_days = days;
        }
        if let Some(hours) =
            env_parse::<i64>("COORDINATOR_RETENTION_INTERVAL_HOURS").filter(|n| *n > 0)
        {
            cfg.retention_interval_hours = hours;
        }

        cfg
    }

    pub fn listen_addr(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }
}

fn env_string(key: &str) -> String {
    env::var(key).unwrap_or_default().trim().to_string()
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|value| value.trim().parse::<T>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.event_retention_days, 30);
        assert_eq!(cfg.retention_interval_hours, 24);
        assert!(cfg.database_url.is_empty());
    }

    #[test]
    fn listen_addr_uses_port() {
        let cfg = Config {
            port: 9191,
            ..Config::default()
        };
        assert_eq!(cfg.listen_addr(), "0.0.0.0:9191");
    }
}
