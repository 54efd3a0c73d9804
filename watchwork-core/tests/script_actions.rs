//! External-process action behavior. Unix only: the contract depends on
//! the executable bit and shell scripts.
#![cfg(unix)]

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use watchwork_core::actions::{Action, ActionCommon, ScriptAction};
use watchwork_core::{Params, RunnerConfig, TaskRunner};
use watchwork_model::ScriptArgs;

fn write_script(dir: &Path, name: &str, body: &str) {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

fn runner_rooted_at(dir: &TempDir) -> TaskRunner {
    TaskRunner::new(RunnerConfig {
        scripts_root: dir.path().to_path_buf(),
        ..RunnerConfig::default()
    })
}

fn script(name: &str, file: &str, args: ScriptArgs, env: BTreeMap<String, String>) -> Arc<dyn Action> {
    Arc::new(ScriptAction::new(ActionCommon::new(name), file, args, env))
}

fn params(pairs: &[(&str, serde_json::Value)]) -> Params {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[tokio::test]
async fn zero_exit_succeeds_and_captures_stdout_lines() -> watchwork_core::Result<()> {
    let dir = TempDir::new()?;
    write_script(dir.path(), "greet.sh", "echo hello\necho world");
    let runner = runner_rooted_at(&dir);

    let mut handle = runner
        .submit(
            script("greet", "greet.sh", ScriptArgs::Inline, BTreeMap::new()),
            Params::new(),
        )
        .await?;
    handle.wait().await;

    assert!(handle.reporter.succeeded());
    let texts: Vec<String> = handle
        .reporter
        .messages_since(0)
        .into_iter()
        .map(|m| m.text)
        .collect();
    assert!(texts.contains(&"hello".to_string()), "messages: {texts:?}");
    assert!(texts.contains(&"world".to_string()), "messages: {texts:?}");
    runner.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn nonzero_exit_fails_with_the_status() -> watchwork_core::Result<()> {
    let dir = TempDir::new()?;
    write_script(dir.path(), "fail.sh", "exit 3");
    let runner = runner_rooted_at(&dir);

    let mut handle = runner
        .submit(
            script("fail", "fail.sh", ScriptArgs::Inline, BTreeMap::new()),
            Params::new(),
        )
        .await?;
    handle.wait().await;

    assert!(!handle.reporter.succeeded());
    let message = handle.reporter.failure_message().expect("failure recorded");
    assert!(message.contains("status 3"), "unexpected message: {message}");
    runner.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn non_executable_target_is_rejected_without_a_spawn() -> watchwork_core::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let dir = TempDir::new()?;
    let path = dir.path().join("plain.sh");
    std::fs::write(&path, "#!/bin/sh\necho should never run\n")?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o644))?;
    let runner = runner_rooted_at(&dir);

    let mut handle = runner
        .submit(
            script("plain", "plain.sh", ScriptArgs::Inline, BTreeMap::new()),
            Params::new(),
        )
        .await?;
    handle.wait().await;

    assert!(!handle.reporter.succeeded());
    let message = handle.reporter.failure_message().expect("failure recorded");
    assert!(
        message.contains("not executable"),
        "unexpected message: {message}"
    );
    // No process ran: its output never reached the log.
    assert!(
        handle
            .reporter
            .messages_since(0)
            .iter()
            .all(|m| !m.text.contains("should never run"))
    );
    runner.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn inline_convention_passes_the_parameter_set_as_json() -> watchwork_core::Result<()> {
    let dir = TempDir::new()?;
    write_script(dir.path(), "dump.sh", "echo \"$1\"");
    let runner = runner_rooted_at(&dir);

    let mut handle = runner
        .submit(
            script("dump", "dump.sh", ScriptArgs::Inline, BTreeMap::new()),
            params(&[("target", serde_json::json!("prod"))]),
        )
        .await?;
    handle.wait().await;

    assert!(handle.reporter.succeeded());
    let texts: Vec<String> = handle
        .reporter
        .messages_since(0)
        .into_iter()
        .map(|m| m.text)
        .collect();
    assert!(
        texts.iter().any(|t| t.contains("\"target\":\"prod\"")),
        "messages: {texts:?}"
    );
    runner.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn file_convention_passes_a_readable_params_file() -> watchwork_core::Result<()> {
    let dir = TempDir::new()?;
    write_script(dir.path(), "readfile.sh", "cat \"$1\"");
    let runner = runner_rooted_at(&dir);

    let mut handle = runner
        .submit(
            script("readfile", "readfile.sh", ScriptArgs::File, BTreeMap::new()),
            params(&[("answer", serde_json::json!(42))]),
        )
        .await?;
    handle.wait().await;

    assert!(handle.reporter.succeeded());
    let texts: Vec<String> = handle
        .reporter
        .messages_since(0)
        .into_iter()
        .map(|m| m.text)
        .collect();
    assert!(
        texts.iter().any(|t| t.contains("\"answer\":42")),
        "messages: {texts:?}"
    );
    runner.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn named_convention_passes_parameters_in_order() -> watchwork_core::Result<()> {
    let dir = TempDir::new()?;
    write_script(dir.path(), "pair.sh", "echo \"$1-$2\"");
    let runner = runner_rooted_at(&dir);

    let mut handle = runner
        .submit(
            script(
                "pair",
                "pair.sh",
                ScriptArgs::Named {
                    names: vec!["second".into(), "first".into()],
                },
                BTreeMap::new(),
            ),
            params(&[
                ("first", serde_json::json!("one")),
                ("second", serde_json::json!("two")),
            ]),
        )
        .await?;
    handle.wait().await;

    assert!(handle.reporter.succeeded());
    let texts: Vec<String> = handle
        .reporter
        .messages_since(0)
        .into_iter()
        .map(|m| m.text)
        .collect();
    assert!(texts.contains(&"two-one".to_string()), "messages: {texts:?}");
    runner.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn environment_overrides_reach_the_child() -> watchwork_core::Result<()> {
    let dir = TempDir::new()?;
    write_script(dir.path(), "env.sh", "echo \"DEPLOY_ENV=$DEPLOY_ENV\"");
    let runner = runner_rooted_at(&dir);

    let env = BTreeMap::from([("DEPLOY_ENV".to_string(), "staging".to_string())]);
    let mut handle = runner
        .submit(
            script("env", "env.sh", ScriptArgs::Inline, env),
            Params::new(),
        )
        .await?;
    handle.wait().await;

    assert!(handle.reporter.succeeded());
    let texts: Vec<String> = handle
        .reporter
        .messages_since(0)
        .into_iter()
        .map(|m| m.text)
        .collect();
    assert!(
        texts.contains(&"DEPLOY_ENV=staging".to_string()),
        "messages: {texts:?}"
    );
    runner.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn timeout_kills_the_child() -> watchwork_core::Result<()> {
    let dir = TempDir::new()?;
    write_script(dir.path(), "hang.sh", "sleep 30");
    let runner = runner_rooted_at(&dir);

    let action: Arc<dyn Action> = Arc::new(ScriptAction::new(
        ActionCommon::new("hang").with_timeout(Duration::from_millis(100)),
        "hang.sh",
        ScriptArgs::Inline,
        BTreeMap::new(),
    ));

    let started = Instant::now();
    let mut handle = runner.submit(action, Params::new()).await?;
    handle.wait().await;

    assert!(!handle.reporter.succeeded());
    let message = handle.reporter.failure_message().expect("failure recorded");
    assert!(message.contains("timeout"), "unexpected message: {message}");
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "child outlived its timeout"
    );
    runner.shutdown().await;
    Ok(())
}
