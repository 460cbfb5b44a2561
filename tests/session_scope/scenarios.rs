use super::test_helpers::{ScopeContext, scope_context};
use rstest_bdd_macros::scenario;

#[scenario(
    path = "tests/features/session_scope.feature",
    name = "Empty cache provisions a node and stores its handle"
)]
fn scenario_empty_cache_provisions(scope_context: ScopeContext) {
    let _ = scope_context;
}

#[scenario(
    path = "tests/features/session_scope.feature",
    name = "Cached handle is reused without provisioning"
)]
fn scenario_cached_handle_reused(scope_context: ScopeContext) {
    let _ = scope_context;
}

#[scenario(
    path = "tests/features/session_scope.feature",
    name = "Retained resources survive the end of the session"
)]
fn scenario_retained_resources(scope_context: ScopeContext) {
    let _ = scope_context;
}

#[scenario(
    path = "tests/features/session_scope.feature",
    name = "Timed-out command leaves the session usable"
)]
fn scenario_timeout_keeps_session(scope_context: ScopeContext) {
    let _ = scope_context;
}

#[scenario(
    path = "tests/features/session_scope.feature",
    name = "Provisioning failure is reported and nothing is cached"
)]
fn scenario_provisioning_failure(scope_context: ScopeContext) {
    let _ = scope_context;
}
