use anyhow::{Context, Result};
use std::env;

use crate::s3::multipart::{DEFAULT_CONCURRENCY, DEFAULT_PART_SIZE};

const DEFAULT_REGION: &str = "us-east-1";

/// Access key pair used instead of the default credential chain
#[derive(Clone)]
pub struct StaticCredentials {
    pub access_key: String,
    pub secret_key: String,
}

impl std::fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticCredentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"** redacted **")
            .finish()
    }
}

/// Configuration for the S3 sample client
#[derive(Debug, Clone)]
pub struct Config {
    pub region: String,
    pub profile: Option<String>,
    pub endpoint: Option<String>,
    pub credentials: Option<StaticCredentials>,
    pub force_path_style: bool,
    pub bucket: String,
    pub part_size: u64,
    pub concurrency: usize,
}

impl Config {
    /// Load configuration from environment variables and .env file
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing or invalid
    pub fn from_env() -> Result<Self> {
        Self::from_env_with(|_| None)
    }

    /// Like [`Config::from_env`], but `overrides` wins over the environment
    pub fn from_env_with(overrides: impl Fn(&str) -> Option<String>) -> Result<Self> {
        dotenv::dotenv().ok(); // Load .env file if it exists

        Self::from_lookup(|name| overrides(name).or_else(|| env::var(name).ok()))
    }

    /// Build the configuration from an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());

        let region = var("AWS_REGION").unwrap_or_else(|| DEFAULT_REGION.to_string());
        Self::validate_region(&region)?;

        let profile = var("AWS_PROFILE");

        let bucket = var("S3_BUCKET")
            .context("S3_BUCKET not found in environment. Please set it in .env file")?;
        Self::validate_bucket_name(&bucket)?;

        let endpoint = var("S3_ENDPOINT");
        if let Some(endpoint) = &endpoint {
            Self::validate_endpoint(endpoint)?;
        }

        let credentials = match (var("S3_ACCESS_KEY"), var("S3_SECRET_KEY")) {
            (Some(access_key), Some(secret_key)) => Some(StaticCredentials {
                access_key,
                secret_key,
            }),
            (None, None) => None,
            _ => anyhow::bail!("S3_ACCESS_KEY and S3_SECRET_KEY must be set together"),
        };

        let force_path_style = match var("S3_FORCE_PATH_STYLE") {
            Some(value) => Self::parse_bool("S3_FORCE_PATH_STYLE", &value)?,
            None => endpoint.is_some(),
        };

        let part_size = match var("S3_PART_SIZE") {
            Some(value) => value
                .trim()
                .parse::<u64>()
                .with_context(|| format!("S3_PART_SIZE '{}' is not a byte count", value))?,
            None => DEFAULT_PART_SIZE,
        };

        let concurrency = match var("S3_CONCURRENCY") {
            Some(value) => value
                .trim()
                .parse::<usize>()
                .with_context(|| format!("S3_CONCURRENCY '{}' is not a number", value))?,
            None => DEFAULT_CONCURRENCY,
        };

        Ok(Self {
            region,
            profile,
            endpoint,
            credentials,
            force_path_style,
            bucket,
            part_size,
            concurrency,
        })
    }

    /// Validate AWS region format
    fn validate_region(region: &str) -> Result<()> {
        // Basic validation - ensure it looks like a region (contains a dash)
        if !region.contains('-') {
            anyhow::bail!(
                "AWS_REGION '{}' doesn't look like a valid region (e.g., us-west-2, eu-west-1)",
                region
            );
        }

        Ok(())
    }

    /// Validate S3 bucket name according to AWS rules
    pub fn validate_bucket_name(bucket: &str) -> Result<()> {
        if bucket.len() < 3 || bucket.len() > 63 {
            anyhow::bail!(
                "Bucket name '{}' must be between 3 and 63 characters (got {})",
                bucket,
                bucket.len()
            );
        }

        let is_edge = |c: char| c.is_ascii_lowercase() || c.is_ascii_digit();
        if !bucket.starts_with(is_edge) || !bucket.ends_with(is_edge) {
            anyhow::bail!(
                "Bucket name '{}' must start and end with a lowercase letter or number",
                bucket
            );
        }

        if let Some(c) = bucket
            .chars()
            .find(|&c| !is_edge(c) && c != '-' && c != '.')
        {
            anyhow::bail!(
                "Bucket name '{}' contains invalid character '{}'. Only lowercase letters, numbers, hyphens, and periods are allowed",
                bucket,
                c
            );
        }

        if bucket.contains("..") {
            anyhow::bail!("Bucket name '{}' cannot contain consecutive periods", bucket);
        }

        if bucket.split('.').count() == 4 && bucket.split('.').all(|part| part.parse::<u8>().is_ok())
        {
            anyhow::bail!(
                "Bucket name '{}' cannot be formatted as an IP address",
                bucket
            );
        }

        Ok(())
    }

    fn validate_endpoint(endpoint: &str) -> Result<()> {
        if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
            anyhow::bail!(
                "S3_ENDPOINT '{}' must start with http:// or https://",
                endpoint
            );
        }

        Ok(())
    }

    fn parse_bool(name: &str, value: &str) -> Result<bool> {
        match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => anyhow::bail!("{} '{}' is not a boolean", name, value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn test_bucket_name_validation() {
        // Valid bucket names
        assert!(Config::validate_bucket_name("my-bucket").is_ok());
        assert!(Config::validate_bucket_name("my.bucket.123").is_ok());
        assert!(Config::validate_bucket_name("abc").is_ok());

        // Invalid bucket names
        assert!(Config::validate_bucket_name("ab").is_err()); // Too short
        assert!(Config::validate_bucket_name(&"a".repeat(64)).is_err()); // Too long
        assert!(Config::validate_bucket_name("MY-BUCKET").is_err()); // Uppercase
        assert!(Config::validate_bucket_name("my_bucket").is_err()); // Underscore
        assert!(Config::validate_bucket_name("-mybucket").is_err()); // Starts with dash
        assert!(Config::validate_bucket_name("mybucket-").is_err()); // Ends with dash
        assert!(Config::validate_bucket_name("my..bucket").is_err()); // Consecutive periods
        assert!(Config::validate_bucket_name("192.168.1.1").is_err()); // IP address format
        assert!(Config::validate_bucket_name("").is_err()); // Empty
    }

    #[test]
    fn test_region_validation() {
        assert!(Config::validate_region("us-west-2").is_ok());
        assert!(Config::validate_region("eu-west-1").is_ok());
        assert!(Config::validate_region("uswest2").is_err()); // No dash
    }

    #[test]
    fn test_defaults() {
        let config = load(&[("S3_BUCKET", "s3proxy-demo")]).unwrap();
        assert_eq!(config.region, "us-east-1");
        assert_eq!(config.bucket, "s3proxy-demo");
        assert_eq!(config.endpoint, None);
        assert!(config.credentials.is_none());
        assert!(!config.force_path_style);
        assert_eq!(config.part_size, DEFAULT_PART_SIZE);
        assert_eq!(config.concurrency, DEFAULT_CONCURRENCY);
    }

    #[test]
    fn test_custom_endpoint_with_static_credentials() {
        let config = load(&[
            ("S3_BUCKET", "s3proxy-demo"),
            ("S3_ENDPOINT", "http://localhost:8080"),
            ("S3_ACCESS_KEY", "local-identity"),
            ("S3_SECRET_KEY", "local-credential"),
            ("S3_PART_SIZE", "5242880"),
            ("S3_CONCURRENCY", "2"),
        ])
        .unwrap();

        assert_eq!(config.endpoint.as_deref(), Some("http://localhost:8080"));
        assert!(config.force_path_style); // implied by the custom endpoint
        let credentials = config.credentials.unwrap();
        assert_eq!(credentials.access_key, "local-identity");
        assert!(!format!("{:?}", credentials).contains("local-credential"));
        assert_eq!(config.part_size, 5_242_880);
        assert_eq!(config.concurrency, 2);
    }

    #[test]
    fn test_invalid_settings() {
        assert!(load(&[]).is_err()); // Missing bucket
        assert!(load(&[("S3_BUCKET", "ok-bucket"), ("S3_ENDPOINT", "localhost:8080")]).is_err());
        assert!(load(&[("S3_BUCKET", "ok-bucket"), ("S3_ACCESS_KEY", "only-one")]).is_err());
        assert!(load(&[("S3_BUCKET", "ok-bucket"), ("S3_PART_SIZE", "ten")]).is_err());
        assert!(load(&[("S3_BUCKET", "ok-bucket"), ("S3_FORCE_PATH_STYLE", "maybe")]).is_err());

        let config = load(&[("S3_BUCKET", "ok-bucket"), ("S3_FORCE_PATH_STYLE", "yes")]).unwrap();
        assert!(config.force_path_style);
    }
}
