// Tests for lib.rs shared types
//
// Covers resource type ordering and naming, and the code/remediation surface
// of the umbrella error.

use super::*;
use crate::cloud::CloudError;
use crate::registry::RegistryError;
use crate::validation::inputs::InputError;
use crate::validation::ValidationError;

// ==================== RESOURCE TYPE TESTS ====================

#[test]
fn test_teardown_rank_puts_compute_before_network() {
    assert!(ResourceType::Compute.teardown_rank() < ResourceType::Network.teardown_rank());
    assert!(ResourceType::Compute.teardown_rank() < ResourceType::Storage.teardown_rank());
    assert!(ResourceType::LoadBalancer.teardown_rank() < ResourceType::Compute.teardown_rank());
    assert!(
        ResourceType::IdentityPolicy.teardown_rank() < ResourceType::Identity.teardown_rank()
    );
    assert_eq!(
        ResourceType::ALL
            .iter()
            .map(|t| t.teardown_rank())
            .max(),
        Some(ResourceType::Stack.teardown_rank())
    );
}

#[test]
fn test_resource_type_names_round_trip() {
    for resource_type in ResourceType::ALL {
        let parsed: ResourceType = resource_type.as_str().parse().unwrap();
        assert_eq!(parsed, resource_type);
    }
    assert!("vpc".parse::<ResourceType>().is_err());
}

#[test]
fn test_resource_type_serializes_kebab_case() {
    let json = serde_json::to_string(&ResourceType::SecurityRule).unwrap();
    assert_eq!(json, "\"security-rule\"");
    assert_eq!(ResourceType::IdentityPolicy.to_string(), "identity-policy");
}

// ==================== DEPLOY ERROR TESTS ====================

#[test]
fn test_registry_error_carries_conflict_code() {
    let err = DeployError::from(RegistryError::DuplicateResource {
        resource_id: "i-1".into(),
        existing_stack: "a-stack".into(),
        requested_stack: "b-stack".into(),
    });
    assert_eq!(err.code(), Some(ErrorCode::ResourceConflict));
    assert!(!err.remediation().is_empty());
}

#[test]
fn test_cloud_rejection_keeps_provider_code() {
    let err = DeployError::from(CloudError::rejected(
        ErrorCode::InsufficientPermissions,
        "denied",
    ));
    assert_eq!(err.code(), Some(ErrorCode::InsufficientPermissions));
}

#[test]
fn test_validation_input_error_code() {
    let err = DeployError::from(ValidationError::from(InputError::UnsupportedRegion(
        "mars-1".into(),
    )));
    assert_eq!(err.code(), Some(ErrorCode::InvalidConfigurationValue));
}

#[test]
fn test_config_error_is_configuration_code() {
    let err = DeployError::Config("provisioning.max_spot_price out of range".into());
    assert_eq!(err.code(), Some(ErrorCode::InvalidConfigurationValue));
    assert!(err.to_string().contains("max_spot_price"));
}

#[test]
fn test_io_error_still_has_remediation() {
    let err = DeployError::from(std::io::Error::new(
        std::io::ErrorKind::PermissionDenied,
        "state dir",
    ));
    assert_eq!(err.code(), None);
    assert_eq!(err.remediation().len(), 1);
}

#[test]
fn test_every_code_has_cause_and_remediation() {
    let codes = [
        ErrorCode::CapacityExhausted,
        ErrorCode::InstanceLimitExceeded,
        ErrorCode::SpotBidTooLow,
        ErrorCode::NetworkNotFound,
        ErrorCode::SecurityRuleInvalid,
        ErrorCode::InvalidCredentials,
        ErrorCode::InsufficientPermissions,
        ErrorCode::InvalidConfigurationValue,
        ErrorCode::MissingRequiredParameter,
        ErrorCode::OperationTimeout,
        ErrorCode::DependencyNotReady,
        ErrorCode::EndpointUnreachable,
        ErrorCode::ModuleMissing,
        ErrorCode::TeardownFailed,
        ErrorCode::ResourceConflict,
        ErrorCode::Other("quota-api-throttled".into()),
    ];
    for code in codes {
        assert!(!code.cause().is_empty(), "{} has no cause", code);
        assert!(!code.remediation().is_empty(), "{} has no remediation", code);
    }
}
