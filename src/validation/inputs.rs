/// Deployment input rules
///
/// Shared by the environment check and `DeployConfig::validate`.
use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;

pub const SUPPORTED_REGIONS: &[&str] = &[
    "us-east-1",
    "us-east-2",
    "us-west-1",
    "us-west-2",
    "eu-west-1",
    "eu-west-2",
    "eu-central-1",
    "ap-northeast-1",
    "ap-southeast-1",
    "ap-southeast-2",
    "ap-south-1",
];

pub const MIN_SPOT_PRICE: f64 = 0.10;
pub const MAX_SPOT_PRICE: f64 = 10.0;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InputError {
    #[error("Unsupported region: '{0}'")]
    UnsupportedRegion(String),

    #[error("Instance type '{0}' is not a supported GPU type (g4dn, g5, g5g, p3 or 'auto')")]
    InvalidInstanceType(String),

    #[error("Spot price '{0}' must be a number between 0.10 and 10.00")]
    SpotPriceOutOfRange(String),

    #[error("Stack name '{0}' must start with a letter and contain 3-64 letters, digits or hyphens")]
    InvalidStackName(String),
}

static INSTANCE_TYPE_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^(g4dn|g5g|g5|p3)\.([0-9]{0,2}x)?large$").ok());

static STACK_NAME_PATTERN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][A-Za-z0-9-]{2,63}$").ok());

fn matches(pattern: &LazyLock<Option<Regex>>, value: &str) -> bool {
    pattern.as_ref().is_some_and(|re| re.is_match(value))
}

pub fn validate_region(region: &str) -> Result<(), InputError> {
    if SUPPORTED_REGIONS.contains(&region) {
        Ok(())
    } else {
        Err(InputError::UnsupportedRegion(region.to_string()))
    }
}

pub fn validate_instance_type(instance_type: &str) -> Result<(), InputError> {
    if instance_type == "auto" || matches(&INSTANCE_TYPE_PATTERN, instance_type) {
        Ok(())
    } else {
        Err(InputError::InvalidInstanceType(instance_type.to_string()))
    }
}

pub fn validate_spot_price(price: &str) -> Result<f64, InputError> {
    let value: f64 = price
        .trim()
        .parse()
        .map_err(|_| InputError::SpotPriceOutOfRange(price.to_string()))?;
    check_spot_price(value).map_err(|_| InputError::SpotPriceOutOfRange(price.to_string()))
}

pub fn check_spot_price(value: f64) -> Result<f64, InputError> {
    if value.is_finite() && (MIN_SPOT_PRICE..=MAX_SPOT_PRICE).contains(&value) {
        Ok(value)
    } else {
        Err(InputError::SpotPriceOutOfRange(value.to_string()))
    }
}

pub fn validate_stack_name(name: &str) -> Result<(), InputError> {
    if matches(&STACK_NAME_PATTERN, name) {
        Ok(())
    } else {
        Err(InputError::InvalidStackName(name.to_string()))
    }
}
