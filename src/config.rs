use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    // Backend
    pub api_url: String,
    pub user_agent: String,
    pub http_timeout: Duration,

    // Location
    pub location_timeout: Duration,

    // Image budgets: small/fast pass for detection, large/high-fidelity
    // pass for the final submission.
    pub detect_max_width: u32,
    pub detect_quality: f32,
    pub submit_max_width: u32,
    pub submit_quality: f32,

    // Draft fallback
    pub draft_dir: PathBuf,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let api_url = env("REPORT_API_URL", "http://localhost:8000");
        let user_agent = env("USER_AGENT", "report-capture/0.1");
        let http_timeout = parse_duration("HTTP_TIMEOUT", "30s")?;
        let location_timeout = parse_duration("LOCATION_TIMEOUT", "10s")?;

        let detect_max_width = parse("DETECT_MAX_WIDTH", "640")?;
        let detect_quality = parse("DETECT_QUALITY", "0.5")?;
        let submit_max_width = parse("SUBMIT_MAX_WIDTH", "1280")?;
        let submit_quality = parse("SUBMIT_QUALITY", "0.85")?;

        let draft_dir_raw = env("DRAFT_DIR", "");
        let draft_dir = if draft_dir_raw.is_empty() {
            std::env::temp_dir().join("report-capture-drafts")
        } else {
            PathBuf::from(draft_dir_raw)
        };

        let config = Config {
            api_url,
            user_agent,
            http_timeout,
            location_timeout,
            detect_max_width,
            detect_quality,
            submit_max_width,
            submit_quality,
            draft_dir,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.api_url.is_empty() {
            return Err(ConfigError::InvalidEnvVar(
                "REPORT_API_URL".to_string(),
                "cannot be empty".to_string(),
            ));
        }
        if self.detect_max_width == 0 {
            return Err(ConfigError::InvalidEnvVar(
                "DETECT_MAX_WIDTH".to_string(),
                "must be greater than zero".to_string(),
            ));
        }
        if self.submit_max_width == 0 {
            return Err(ConfigError::InvalidEnvVar(
                "SUBMIT_MAX_WIDTH".to_string(),
                "must be greater than zero".to_string(),
            ));
        }
        for (key, quality) in [
            ("DETECT_QUALITY", self.detect_quality),
            ("SUBMIT_QUALITY", self.submit_quality),
        ] {
            if !(quality > 0.0 && quality <= 1.0) {
                return Err(ConfigError::InvalidEnvVar(
                    key.to_string(),
                    format!("must be in (0, 1], got {}", quality),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid environment variable {0}: {1}")]
    InvalidEnvVar(String, String),
}

fn env(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse<T: std::str::FromStr>(key: &str, default: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    env(key, default)
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidEnvVar(key.to_string(), e.to_string()))
}

fn parse_duration(key: &str, default: &str) -> Result<Duration, ConfigError> {
    humantime::parse_duration(&env(key, default))
        .map_err(|e| ConfigError::InvalidEnvVar(key.to_string(), e.to_string()))
}
