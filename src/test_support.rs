//! Test support utilities shared across unit and integration tests.

use std::collections::{BTreeSet, VecDeque};
use std::env;
use std::ffi::OsString;
use std::sync::{Arc, PoisonError};
use std::time::{Duration, SystemTime};

use tokio::sync::{Mutex, MutexGuard};

use crate::provisioner::{DestroyOutcome, ProvisionError, ProvisionFuture, Provisioner};
use crate::request::ProvisionRequest;
use crate::resource::ResourceHandle;
use crate::runner::{CommandOutput, CommandRunner, CommandSpec, RunnerError, RunnerFuture};

type Shared<T> = Arc<std::sync::Mutex<T>>;

fn locked<T>(shared: &Shared<T>) -> std::sync::MutexGuard<'_, T> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Scripted command runner that returns pre-seeded outputs in FIFO order.
///
/// Used to drive deterministic command outcomes without spawning processes.
/// Clones share the same queue and invocation log.
#[derive(Clone, Debug, Default)]
pub struct ScriptedRunner {
    responses: Shared<VecDeque<Result<CommandOutput, RunnerError>>>,
    invocations: Shared<Vec<CommandSpec>>,
    succeed_when_empty: bool,
}

impl ScriptedRunner {
    /// Creates a new runner with no queued responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a runner that answers every unscripted call with exit code 0.
    #[must_use]
    pub fn always_succeeding() -> Self {
        Self {
            succeed_when_empty: true,
            ..Self::default()
        }
    }

    /// Returns a snapshot of all invocations recorded so far.
    #[must_use]
    pub fn invocations(&self) -> Vec<CommandSpec> {
        locked(&self.invocations).clone()
    }

    /// Returns the recorded invocations rendered as command lines.
    #[must_use]
    pub fn command_lines(&self) -> Vec<String> {
        locked(&self.invocations)
            .iter()
            .map(CommandSpec::display)
            .collect()
    }

    /// Returns the number of responses still queued.
    #[must_use]
    pub fn pending(&self) -> usize {
        locked(&self.responses).len()
    }

    fn push(&self, response: Result<CommandOutput, RunnerError>) {
        locked(&self.responses).push_back(response);
    }

    /// Pushes a successful exit status.
    pub fn push_success(&self) {
        self.push_output(Some(0), "", "");
    }

    /// Pushes a failing exit code with stderr text.
    pub fn push_failure(&self, code: i32) {
        self.push_output(Some(code), "", "simulated failure");
    }

    /// Pushes an explicit command output response.
    pub fn push_output(
        &self,
        code: Option<i32>,
        stdout: impl Into<String>,
        stderr: impl Into<String>,
    ) {
        self.push(Ok(CommandOutput {
            code,
            stdout: stdout.into(),
            stderr: stderr.into(),
        }));
    }

    /// Pushes a response reporting that the command hit its timeout.
    pub fn push_timeout(&self) {
        self.push(Err(RunnerError::Timeout {
            program: String::from("scripted"),
            limit: Duration::from_secs(1),
        }));
    }

    /// Pushes a response reporting that the command could not be spawned.
    pub fn push_spawn_error(&self, message: &str) {
        self.push(Err(RunnerError::Spawn {
            program: String::from("scripted"),
            message: message.to_owned(),
        }));
    }
}

impl CommandRunner for ScriptedRunner {
    fn run<'a>(&'a self, spec: &'a CommandSpec) -> RunnerFuture<'a> {
        locked(&self.invocations).push(spec.clone());
        let next = locked(&self.responses).pop_front();
        let response = match next {
            Some(Ok(output)) => Ok(output),
            Some(Err(RunnerError::Timeout { limit, .. })) => Err(RunnerError::Timeout {
                program: spec.program.clone(),
                limit: spec.timeout.unwrap_or(limit),
            }),
            Some(Err(RunnerError::Spawn { message, .. })) => Err(RunnerError::Spawn {
                program: spec.program.clone(),
                message,
            }),
            None if self.succeed_when_empty => Ok(CommandOutput {
                code: Some(0),
                stdout: String::new(),
                stderr: String::new(),
            }),
            None => Err(RunnerError::Spawn {
                program: spec.program.clone(),
                message: String::from("no scripted response available"),
            }),
        };
        Box::pin(async move { response })
    }
}

#[derive(Debug, Default)]
struct FakeState {
    provisioned: Vec<ProvisionRequest>,
    destroyed: Vec<ResourceHandle>,
    restarted: Vec<ResourceHandle>,
    provision_failures: VecDeque<ProvisionError>,
    destroy_results: VecDeque<Result<DestroyOutcome, ProvisionError>>,
}

/// In-memory provisioner that hands out numbered fake nodes.
///
/// Clones share state, so a test can keep one copy for assertions while the
/// code under test owns another.
#[derive(Clone, Debug, Default)]
pub struct FakeProvisioner {
    state: Shared<FakeState>,
    provision_delay: Duration,
}

impl FakeProvisioner {
    /// Creates a provisioner whose operations all succeed immediately.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every provisioning call wait `delay` before returning, widening
    /// the window in which concurrent callers race.
    #[must_use]
    pub const fn with_provision_delay(mut self, delay: Duration) -> Self {
        self.provision_delay = delay;
        self
    }

    /// Makes the next provisioning call fail with `error`.
    pub fn fail_next_provision(&self, error: ProvisionError) {
        locked(&self.state).provision_failures.push_back(error);
    }

    /// Scripts the result of the next destruction call.
    pub fn push_destroy_result(&self, result: Result<DestroyOutcome, ProvisionError>) {
        locked(&self.state).destroy_results.push_back(result);
    }

    /// Returns how many provisioning calls were made.
    #[must_use]
    pub fn provision_count(&self) -> usize {
        locked(&self.state).provisioned.len()
    }

    /// Returns the handles passed to destruction calls, in order.
    #[must_use]
    pub fn destroyed(&self) -> Vec<ResourceHandle> {
        locked(&self.state).destroyed.clone()
    }

    /// Returns the handles passed to restart calls, in order.
    #[must_use]
    pub fn restarted(&self) -> Vec<ResourceHandle> {
        locked(&self.state).restarted.clone()
    }

    fn record_provision(&self, request: &ProvisionRequest) -> Result<ResourceHandle, ProvisionError> {
        let mut state = locked(&self.state);
        state.provisioned.push(request.clone());
        if let Some(error) = state.provision_failures.pop_front() {
            return Err(error);
        }
        Ok(fake_handle(state.provisioned.len()))
    }
}

/// Handle for the `index`-th fake node.
#[must_use]
pub fn fake_handle(index: usize) -> ResourceHandle {
    let name = format!("fake-node-{index}");
    ResourceHandle {
        resource_group_name: format!("{name}-rg"),
        resource_name: name,
        host_address: format!("fake-node-{index}.example.test"),
        port: 22,
        boot_diagnostics_account: String::from("fakediag"),
        created_at: SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000),
    }
}

impl Provisioner for FakeProvisioner {
    fn provision<'a>(
        &'a self,
        request: &'a ProvisionRequest,
    ) -> ProvisionFuture<'a, ResourceHandle> {
        Box::pin(async move {
            if !self.provision_delay.is_zero() {
                tokio::time::sleep(self.provision_delay).await;
            }
            self.record_provision(request)
        })
    }

    fn destroy<'a>(&'a self, handle: &'a ResourceHandle) -> ProvisionFuture<'a, DestroyOutcome> {
        let result = {
            let mut state = locked(&self.state);
            state.destroyed.push(handle.clone());
            state
                .destroy_results
                .pop_front()
                .unwrap_or(Ok(DestroyOutcome::Requested))
        };
        Box::pin(async move { result })
    }

    fn boot_log<'a>(&'a self, handle: &'a ResourceHandle) -> ProvisionFuture<'a, CommandOutput> {
        let output = CommandOutput {
            code: Some(0),
            stdout: format!("boot log for {}", handle.resource_name),
            stderr: String::new(),
        };
        Box::pin(async move { Ok(output) })
    }

    fn restart<'a>(&'a self, handle: &'a ResourceHandle) -> ProvisionFuture<'a, CommandOutput> {
        locked(&self.state).restarted.push(handle.clone());
        Box::pin(async move {
            Ok(CommandOutput {
                code: Some(0),
                stdout: String::new(),
                stderr: String::new(),
            })
        })
    }
}

/// Global mutex used to serialise environment mutation in tests.
pub static ENV_LOCK: Mutex<()> = Mutex::const_new(());

/// Guard that holds the env mutex and cleans up variables on drop.
pub struct EnvGuard {
    previous: Vec<(String, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl EnvGuard {
    /// Sets multiple environment variables while holding a global mutex.
    pub async fn set_vars(pairs: &[(&str, &str)]) -> Self {
        debug_assert!(
            {
                let mut seen = BTreeSet::new();
                pairs.iter().all(|(key, _)| seen.insert(*key))
            },
            "duplicate environment variable keys passed to EnvGuard::set_vars"
        );

        let guard = ENV_LOCK.lock().await;
        let mut previous = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            let old = env::var_os(key);
            // SAFETY: Environment mutation is serialised by `ENV_LOCK`, preventing races.
            unsafe { env::set_var(key, value) };
            previous.push(((*key).to_owned(), old));
        }

        Self {
            previous,
            _guard: guard,
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, old) in &self.previous {
            // SAFETY: Environment mutation is serialised by holding `_guard`.
            unsafe {
                match old {
                    Some(val) => env::set_var(key, val),
                    None => env::remove_var(key),
                }
            }
        }
    }
}

/// Produces a minimal JSON payload matching `az account show -o json`.
#[must_use]
pub fn json_account(is_default: bool, user: &str, subscription: &str) -> String {
    format!(
        "{{\"isDefault\":{is_default},\"name\":\"{subscription}\",\"user\":{{\"name\":\"{user}\",\"type\":\"user\"}}}}"
    )
}

/// Produces a minimal JSON payload matching `az vm create -o json`.
#[must_use]
pub fn json_vm_created(public_ip: &str, resource_group: &str) -> String {
    format!(
        "{{\"powerState\":\"VM running\",\"publicIpAddress\":\"{public_ip}\",\"resourceGroup\":\"{resource_group}\"}}"
    )
}
