//! Unit tests for the connection broker.

use super::*;
use crate::test_support::{ScriptedRunner, fake_handle};
use rstest::{fixture, rstest};

fn no_wait_retry() -> RetryPolicy {
    RetryPolicy::new(3, Duration::ZERO, Duration::ZERO)
}

struct Harness {
    runner: ScriptedRunner,
    broker: Broker<ScriptedRunner>,
}

#[fixture]
fn harness() -> Harness {
    let runner = ScriptedRunner::new();
    let broker = Broker::new(ConnectionConfig::default(), runner.clone())
        .expect("default config should be valid")
        .with_retry_policy(no_wait_retry());
    Harness { runner, broker }
}

fn args_of(spec: &CommandSpec) -> Vec<String> {
    spec.args
        .iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect()
}

async fn open_session(harness: &Harness) -> Session<ScriptedRunner> {
    harness.runner.push_success();
    harness
        .broker
        .open(&fake_handle(1))
        .await
        .expect("session should open")
}

#[rstest]
#[tokio::test]
async fn open_starts_a_control_master(harness: Harness) {
    let session = open_session(&harness).await;

    let invocations = harness.runner.invocations();
    let master = invocations.first().expect("master invocation");
    let args = args_of(master);
    assert_eq!(master.program, "ssh");
    assert_eq!(args.get(..3), Some(&[String::from("-M"), String::from("-N"), String::from("-f")][..]));
    assert!(args.iter().any(|arg| arg.starts_with("ControlPath=/tmp/nk-")));
    assert!(args.contains(&String::from("ControlPersist=yes")));
    assert!(args.contains(&String::from("StrictHostKeyChecking=no")));
    assert_eq!(
        args.last().map(String::as_str),
        Some("azureuser@fake-node-1.example.test")
    );
    assert!(!session.is_closed());
}

#[rstest]
#[tokio::test]
async fn open_retries_until_sshd_answers(harness: Harness) {
    harness
        .runner
        .push_output(Some(255), "", "ssh: connect to host: Connection refused");
    harness
        .runner
        .push_output(Some(255), "", "ssh: connect to host: Connection refused");
    harness.runner.push_success();

    harness
        .broker
        .open(&fake_handle(1))
        .await
        .expect("third attempt should connect");

    assert_eq!(harness.runner.invocations().len(), 3);
}

#[rstest]
#[tokio::test]
async fn open_surfaces_the_last_connection_failure(harness: Harness) {
    harness.runner.push_output(Some(255), "", "Connection refused");
    harness.runner.push_output(Some(255), "", "Connection timed out");
    harness.runner.push_output(Some(255), "", "No route to host\n");

    let err = harness
        .broker
        .open(&fake_handle(1))
        .await
        .expect_err("open should fail");

    assert_eq!(
        err,
        BrokerError::Unreachable {
            host: String::from("fake-node-1.example.test"),
            message: String::from("No route to host"),
        }
    );
    assert_eq!(harness.runner.invocations().len(), 3);
}

#[rstest]
#[tokio::test]
async fn remote_commands_run_over_the_master_with_a_fixed_path(harness: Harness) {
    let session = open_session(&harness).await;
    harness.runner.push_output(Some(0), "Linux\n", "");

    let result = session
        .run("uname -s", Target::Remote, None)
        .await
        .expect("command should run");

    assert_eq!(result.target, Target::Remote);
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.stdout, "Linux\n");

    let invocations = harness.runner.invocations();
    let master_path = args_of(invocations.first().expect("master"))
        .into_iter()
        .find(|arg| arg.starts_with("ControlPath="))
        .expect("master control path");
    let remote = invocations.get(1).expect("remote invocation");
    let args = args_of(remote);
    assert!(args.contains(&master_path), "command must reuse the master");
    assert!(!args.contains(&String::from("-M")));
    let wrapped = args.last().expect("remote command");
    assert!(wrapped.starts_with("export PATH="));
    assert!(wrapped.contains("/usr/local/bin"));
    assert!(wrapped.ends_with("; uname -s"));
    assert_eq!(remote.timeout, Some(Duration::from_secs(1200)));
}

#[rstest]
#[tokio::test]
async fn non_zero_exit_is_a_result_not_an_error(harness: Harness) {
    let session = open_session(&harness).await;
    harness.runner.push_output(Some(2), "", "ls: cannot access '/nope'");

    let result = session
        .run("ls /nope", Target::Remote, None)
        .await
        .expect("non-zero exit is still a result");

    assert!(!result.is_success());
    assert_eq!(result.exit_code, Some(2));
    assert!(result.stderr.contains("cannot access"));
}

#[rstest]
#[tokio::test]
async fn timed_out_command_leaves_the_session_usable(harness: Harness) {
    let session = open_session(&harness).await;
    harness.runner.push_timeout();
    harness.runner.push_output(Some(0), "ok\n", "");

    let err = session
        .run("sleep 600", Target::Remote, Some(Duration::from_secs(5)))
        .await
        .expect_err("command should time out");
    assert_eq!(
        err,
        BrokerError::Timeout {
            target: Target::Remote,
            command: String::from("sleep 600"),
            limit: Duration::from_secs(5),
        }
    );

    let next = session
        .run("echo ok", Target::Remote, None)
        .await
        .expect("session should still work");
    assert_eq!(next.stdout, "ok\n");
    assert!(!session.is_closed());
}

#[rstest]
#[tokio::test]
async fn local_commands_use_an_isolated_shell(harness: Harness) {
    let session = open_session(&harness).await;
    harness.runner.push_success();

    let result = session
        .run("ping -c 1 example.test", Target::Local, Some(Duration::from_secs(9)))
        .await
        .expect("local command should run");

    assert_eq!(result.target, Target::Local);
    let invocations = harness.runner.invocations();
    let local = invocations.get(1).expect("local invocation");
    assert_eq!(local.program, "sh");
    assert_eq!(args_of(local), vec!["-c", "ping -c 1 example.test"]);
    assert!(matches!(local.env, CommandEnv::Isolated { .. }));
    assert_eq!(local.timeout, Some(Duration::from_secs(9)));
}

#[rstest]
#[tokio::test]
async fn closed_sessions_refuse_commands(harness: Harness) {
    let session = open_session(&harness).await;
    harness.runner.push_success();

    session.close().await.expect("close");
    session.close().await.expect("second close is a no-op");

    let lines = harness.runner.command_lines();
    assert_eq!(lines.len(), 2);
    assert!(lines.get(1).is_some_and(|line| line.contains("-O exit")));

    let err = session
        .run("true", Target::Remote, None)
        .await
        .expect_err("closed session");
    assert!(matches!(err, BrokerError::Closed { .. }), "got {err:?}");
}

#[rstest]
#[tokio::test]
async fn close_tolerates_a_master_that_already_exited(harness: Harness) {
    let session = open_session(&harness).await;
    harness
        .runner
        .push_output(Some(255), "", "Control socket connect: No such file or directory");

    session.close().await.expect("close should not fail");
    assert!(session.is_closed());
}

#[rstest]
#[case::blank_binary(ConnectionConfig { ssh_bin: String::from(" "), ..ConnectionConfig::default() })]
#[case::blank_identity(ConnectionConfig { ssh_identity_file: Some(String::new()), ..ConnectionConfig::default() })]
#[case::zero_timeout(ConnectionConfig { command_timeout_secs: 0, ..ConnectionConfig::default() })]
fn invalid_config_is_rejected(#[case] config: ConnectionConfig) {
    let err = Broker::new(config, ScriptedRunner::new()).expect_err("config should be rejected");
    assert!(matches!(err, BrokerError::InvalidConfig(_)), "got {err:?}");
}

#[rstest]
fn identity_file_is_expanded_and_passed() {
    let Some(home) = std::env::var_os("HOME") else {
        return;
    };
    let config = ConnectionConfig {
        ssh_identity_file: Some(String::from("~/.ssh/id_ed25519")),
        ..ConnectionConfig::default()
    };
    let session = Session {
        config: Arc::new(config),
        runner: Arc::new(ScriptedRunner::new()),
        handle: fake_handle(1),
        control_path: String::from("/tmp/nk-test"),
        local_env: CommandEnv::Inherit,
        closed: AtomicBool::new(false),
    };

    let args = session
        .control_options()
        .into_iter()
        .map(|arg| arg.to_string_lossy().into_owned())
        .collect::<Vec<_>>();
    let expected = format!("{}/.ssh/id_ed25519", home.to_string_lossy());
    assert!(
        args.windows(2)
            .any(|pair| pair == [String::from("-i"), expected.clone()])
    );
}

#[rstest]
fn expand_tilde_leaves_absolute_paths_alone() {
    assert_eq!(expand_tilde("/etc/ssh/key"), "/etc/ssh/key");
}
