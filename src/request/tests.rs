//! Unit tests for request validation and key building.

use super::*;
use rstest::{fixture, rstest};

#[fixture]
fn base_request() -> ProvisionRequest {
    ProvisionRequest::builder()
        .location("eastus2")
        .image_reference("UbuntuLTS")
        .size_class("Standard_DS1_v2")
        .build()
        .expect("base request should build")
}

#[rstest]
fn equal_requests_produce_equal_keys(base_request: ProvisionRequest) {
    let other = base_request.clone();
    assert_eq!(
        build_key(&base_request).expect("key"),
        build_key(&other).expect("key")
    );
}

#[rstest]
fn key_lists_required_fields_in_canonical_order(base_request: ProvisionRequest) {
    let key = build_key(&base_request).expect("key");
    assert_eq!(key.as_str(), "node/eastus2/UbuntuLTS/Standard_DS1_v2");
}

#[rstest]
fn key_ignores_labels(base_request: ProvisionRequest) {
    let mut labelled = base_request.clone();
    labelled
        .labels
        .insert(String::from("owner"), String::from("ci"));
    assert_eq!(
        build_key(&base_request).expect("key"),
        build_key(&labelled).expect("key")
    );
}

#[rstest]
#[case::location("westus2", "Standard_DS1_v2")]
#[case::size("eastus2", "Standard_DS2_v2")]
fn keys_differ_by_location_or_size(
    base_request: ProvisionRequest,
    #[case] location: &str,
    #[case] size_class: &str,
) {
    let mut other = base_request.clone();
    other.location = location.to_owned();
    other.size_class = size_class.to_owned();
    assert_ne!(
        build_key(&base_request).expect("key"),
        build_key(&other).expect("key")
    );
}

#[rstest]
fn optional_segments_are_tagged(base_request: ProvisionRequest) {
    let mut setup = base_request.clone();
    setup.setup_variant = String::from("SRIOV");
    let mut networking = base_request;
    networking.networking_mode = String::from("sriov");

    let setup_key = build_key(&setup).expect("key");
    let networking_key = build_key(&networking).expect("key");

    assert_eq!(
        setup_key.as_str(),
        "node/eastus2/UbuntuLTS/Standard_DS1_v2/setup=SRIOV"
    );
    assert_eq!(
        networking_key.as_str(),
        "node/eastus2/UbuntuLTS/Standard_DS1_v2/net=SRIOV"
    );
    assert_ne!(setup_key, networking_key);
}

#[rstest]
#[case::location("location")]
#[case::image("image_reference")]
#[case::size("size_class")]
fn build_key_rejects_blank_required_fields(base_request: ProvisionRequest, #[case] field: &str) {
    let mut request = base_request;
    match field {
        "location" => request.location = String::from("  "),
        "image_reference" => request.image_reference = String::new(),
        _ => request.size_class = String::new(),
    }

    let err = build_key(&request).expect_err("blank field should fail");
    assert_eq!(err, RequestError::Validation(field.to_owned()));
}

#[rstest]
#[case::setup("setup_variant")]
#[case::networking("networking_mode")]
fn separator_in_optional_segment_is_rejected(
    base_request: ProvisionRequest,
    #[case] field: &str,
) {
    let mut request = base_request;
    if field == "setup_variant" {
        request.setup_variant = String::from("x/net=SRIOV");
    } else {
        request.networking_mode = String::from("SRIOV/setup=x");
    }

    let err = build_key(&request).expect_err("separator should be rejected");
    assert_eq!(err, RequestError::Separator(field.to_owned()));
}

#[rstest]
fn setup_variant_cannot_forge_a_networking_segment(base_request: ProvisionRequest) {
    let mut forged = base_request.clone();
    forged.setup_variant = String::from("x/net=SRIOV");
    let mut genuine = base_request;
    genuine.setup_variant = String::from("x");
    genuine.networking_mode = String::from("SRIOV");

    assert!(build_key(&forged).is_err());
    assert_eq!(
        build_key(&genuine).expect("key").as_str(),
        "node/eastus2/UbuntuLTS/Standard_DS1_v2/setup=x/net=SRIOV"
    );
}

#[rstest]
fn builder_rejects_separator_in_setup_variant() {
    let err = ProvisionRequest::builder()
        .location("eastus2")
        .image_reference("UbuntuLTS")
        .size_class("Standard_DS1_v2")
        .setup_variant("a/b")
        .build()
        .expect_err("builder should validate");
    assert_eq!(err, RequestError::Separator(String::from("setup_variant")));
}

#[rstest]
fn builder_trims_inputs() {
    let request = ProvisionRequest::builder()
        .location(" eastus2 ")
        .image_reference("UbuntuLTS\n")
        .size_class(" Standard_DS1_v2")
        .networking_mode(" SRIOV ")
        .build()
        .expect("request should build");

    assert_eq!(request.location, "eastus2");
    assert_eq!(request.networking_mode, "SRIOV");
    assert!(request.wants_accelerated_networking());
}

#[rstest]
fn file_stem_replaces_separators(base_request: ProvisionRequest) {
    let key = build_key(&base_request).expect("key");
    assert_eq!(key.file_stem(), "node_eastus2_UbuntuLTS_Standard_DS1_v2");
}
