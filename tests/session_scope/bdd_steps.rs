//! BDD step definitions for session scope behaviour: resolution through the
//! cache, retention on close, command timeouts, and provisioning failures.

use nodekeeper::test_support::fake_handle;
use nodekeeper::{BrokerError, ProvisionCache, ProvisionError, ScopeError, ScopeState};
use rstest_bdd_macros::{given, then, when};

use super::test_helpers::{ScopeContext, StepError, ensure, runtime};

#[given("an empty provisioning cache")]
fn empty_cache(scope_context: &ScopeContext) -> Result<(), StepError> {
    let entries = scope_context
        .cache
        .entries()
        .map_err(|err| StepError::Assertion(err.to_string()))?;
    ensure(entries.is_empty(), "cache should start empty")
}

#[given("the cache already holds a node for the request")]
fn cache_holds_node(scope_context: &ScopeContext) -> Result<(), StepError> {
    scope_context
        .cache
        .store(&ScopeContext::key()?, &fake_handle(42))
        .map_err(|err| StepError::Assertion(err.to_string()))
}

#[given("the session keeps its resources")]
fn session_keeps_resources(scope_context: &ScopeContext) {
    scope_context.observed().keep_resources = true;
}

#[given("the next remote command will time out")]
fn next_command_times_out(scope_context: &ScopeContext) {
    // Control master start, then the first command.
    scope_context.runner.push_success();
    scope_context.runner.push_timeout();
}

#[given("the provider rejects the next creation")]
fn provider_rejects_creation(scope_context: &ScopeContext) {
    scope_context
        .provisioner
        .fail_next_provision(ProvisionError::CommandFailure {
            program: String::from("az"),
            step: String::from("vm create"),
            status_text: String::from("1"),
            stderr: String::from("QuotaExceeded"),
        });
}

#[when("a session resolves a node")]
fn session_resolves(scope_context: &ScopeContext) -> Result<(), StepError> {
    let scope = scope_context.scope()?;
    let result = runtime()?.block_on(scope.resolve());
    scope_context.observed().resolution = Some(result);
    Ok(())
}

#[when("the session is closed")]
fn session_closed(scope_context: &ScopeContext) -> Result<(), StepError> {
    let scope = scope_context.scope()?;
    let result = runtime()?.block_on(scope.close());
    scope_context.observed().closed = Some(result);
    Ok(())
}

#[when("the command \"{command}\" runs on the node")]
fn command_runs(scope_context: &ScopeContext, command: String) -> Result<(), StepError> {
    let scope = scope_context.scope()?;
    let result = runtime()?.block_on(async {
        let node = scope.node().await?;
        Ok::<_, ScopeError>(node.run(&command, None).await)
    });
    let outcome = result.map_err(|err| StepError::Assertion(format!("node unavailable: {err}")))?;
    scope_context.observed().commands.push(outcome);
    Ok(())
}

#[then("the provider provisioned \"{count}\" nodes")]
fn provider_provisioned(scope_context: &ScopeContext, count: usize) -> Result<(), StepError> {
    let actual = scope_context.provisioner.provision_count();
    ensure(
        actual == count,
        format!("expected {count} provisioning calls, got {actual}"),
    )
}

#[then("the session is ready")]
fn session_is_ready(scope_context: &ScopeContext) -> Result<(), StepError> {
    let resolution = scope_context.observed().resolution.clone();
    ensure(
        matches!(resolution, Some(Ok(()))),
        format!("expected successful resolution, got {resolution:?}"),
    )?;
    let state = scope_context.scope()?.state();
    ensure(
        state == ScopeState::Ready,
        format!("expected ready scope, got {state:?}"),
    )
}

#[then("the cache returns the provisioned handle")]
fn cache_returns_handle(scope_context: &ScopeContext) -> Result<(), StepError> {
    let cached = scope_context
        .cache
        .lookup(&ScopeContext::key()?)
        .map_err(|err| StepError::Assertion(err.to_string()))?;
    ensure(
        cached == Some(fake_handle(1)),
        format!("expected the provisioned handle in the cache, got {cached:?}"),
    )
}

#[then("the session uses the cached handle")]
fn session_uses_cached_handle(scope_context: &ScopeContext) -> Result<(), StepError> {
    let scope = scope_context.scope()?;
    let handle = runtime()?
        .block_on(scope.node())
        .map(|node| node.handle().clone())
        .map_err(|err| StepError::Assertion(err.to_string()))?;
    ensure(
        handle == fake_handle(42),
        format!("expected the cached handle, got {handle:?}"),
    )
}

#[then("no destruction was requested")]
fn no_destruction(scope_context: &ScopeContext) -> Result<(), StepError> {
    let closed = scope_context.observed().closed.clone();
    ensure(
        closed == Some(Ok(Some(nodekeeper::TeardownOutcome::Retained))),
        format!("expected a retained teardown, got {closed:?}"),
    )?;
    let destroyed = scope_context.provisioner.destroyed();
    ensure(
        destroyed.is_empty(),
        format!("expected no destruction calls, got {destroyed:?}"),
    )
}

#[then("command \"{index}\" reported a timeout")]
fn command_timed_out(scope_context: &ScopeContext, index: usize) -> Result<(), StepError> {
    let outcome = recorded_command(scope_context, index)?;
    ensure(
        matches!(outcome, Err(BrokerError::Timeout { .. })),
        format!("expected a timeout, got {outcome:?}"),
    )
}

#[then("command \"{index}\" exited with status \"{code}\"")]
fn command_exited(scope_context: &ScopeContext, index: usize, code: i32) -> Result<(), StepError> {
    let outcome = recorded_command(scope_context, index)?;
    ensure(
        matches!(outcome, Ok(ref result) if result.exit_code == Some(code)),
        format!("expected exit status {code}, got {outcome:?}"),
    )
}

#[then("resolution fails with a provisioning error")]
fn resolution_fails(scope_context: &ScopeContext) -> Result<(), StepError> {
    let resolution = scope_context.observed().resolution.clone();
    ensure(
        matches!(resolution, Some(Err(ScopeError::Provision(_)))),
        format!("expected a provisioning error, got {resolution:?}"),
    )?;
    let state = scope_context.scope()?.state();
    ensure(
        state == ScopeState::Failed,
        format!("expected failed scope, got {state:?}"),
    )
}

#[then("the cache has no entry for the request")]
fn cache_has_no_entry(scope_context: &ScopeContext) -> Result<(), StepError> {
    let cached = scope_context
        .cache
        .lookup(&ScopeContext::key()?)
        .map_err(|err| StepError::Assertion(err.to_string()))?;
    ensure(cached.is_none(), format!("expected no cache entry, got {cached:?}"))
}

fn recorded_command(
    scope_context: &ScopeContext,
    index: usize,
) -> Result<Result<nodekeeper::CommandResult, BrokerError>, StepError> {
    index
        .checked_sub(1)
        .and_then(|position| scope_context.observed().commands.get(position).cloned())
        .ok_or_else(|| StepError::Assertion(format!("no command {index} was recorded")))
}
