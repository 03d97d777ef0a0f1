use gpu_stack_deploy::ResourceType;

/// Position of `resource_id` in a release log
pub fn release_position(released: &[(String, ResourceType)], resource_id: &str) -> usize {
    released
        .iter()
        .position(|(id, _)| id == resource_id)
        .unwrap_or_else(|| panic!("{} was never released", resource_id))
}

pub fn assert_released_before(released: &[(String, ResourceType)], first: &str, second: &str) {
    let a = release_position(released, first);
    let b = release_position(released, second);
    assert!(
        a < b,
        "expected {} to be released before {}, log: {:?}",
        first,
        second,
        released
    );
}
