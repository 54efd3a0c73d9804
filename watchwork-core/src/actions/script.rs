//! External-process action variant.

use std::collections::BTreeMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tempfile::NamedTempFile;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::debug;

use super::{Action, ActionCommon, ActionContext, ActionLookup, Params};
use crate::Result;
use crate::progress::ProgressReporter;
use watchwork_model::ScriptArgs;

/// Spawns an external program with the merged parameters handed over in
/// one of three argument conventions, captures stdout and stderr line by
/// line into the progress log, and maps the exit status to the verdict:
/// zero succeeds, anything else fails with the status recorded.
///
/// The working directory is the configured scripts root and relative
/// script paths resolve against it. The target must carry the executable
/// bit; a non-executable target is rejected before any process is spawned.
/// Cancellation and timeouts kill the child process.
pub struct ScriptAction {
    common: ActionCommon,
    script: PathBuf,
    args: ScriptArgs,
    env: BTreeMap<String, String>,
}

impl ScriptAction {
    pub fn new(
        common: ActionCommon,
        script: impl Into<PathBuf>,
        args: ScriptArgs,
        env: BTreeMap<String, String>,
    ) -> Self {
        Self {
            common,
            script: script.into(),
            args,
            env,
        }
    }
}

impl fmt::Debug for ScriptAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptAction")
            .field("name", &self.common.name)
            .field("script", &self.script)
            .finish()
    }
}

#[async_trait]
impl Action for ScriptAction {
    fn name(&self) -> &str {
        &self.common.name
    }

    fn timeout(&self) -> Option<Duration> {
        self.common.timeout
    }

    fn trigger(&self) -> Option<Regex> {
        self.common.trigger.clone()
    }

    fn on_success(&self) -> Option<Arc<dyn Action>> {
        self.common.success_chain()
    }

    fn on_error(&self) -> Option<Arc<dyn Action>> {
        self.common.error_chain()
    }

    fn resolve(&self, lookup: &dyn ActionLookup) -> Result<()> {
        self.common.resolve(lookup)
    }

    async fn run(
        &self,
        ctx: &ActionContext,
        params: Params,
        reporter: Arc<ProgressReporter>,
    ) -> anyhow::Result<Params> {
        let merged = self.common.merged(&params);
        let program = if self.script.is_absolute() {
            self.script.clone()
        } else {
            ctx.scripts_root.join(&self.script)
        };

        ensure_executable(&program)?;

        // The params file must outlive the child, so it is created before
        // the spawn and dropped after the wait.
        let mut params_file = None;
        let args = build_args(&self.args, &merged, &mut params_file)?;

        debug!(
            "Running script '{}' for action '{}'",
            program.display(),
            self.common.name
        );
        let mut child = tokio::process::Command::new(&program)
            .args(&args)
            .current_dir(&ctx.scripts_root)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|error| {
                anyhow::anyhow!("failed to spawn '{}': {}", program.display(), error)
            })?;

        let stdout = child
            .stdout
            .take()
            .map(|out| capture_lines(out, Arc::clone(&reporter), None));
        let stderr = child
            .stderr
            .take()
            .map(|err| capture_lines(err, Arc::clone(&reporter), Some("stderr")));

        // kill_on_drop covers a dropped body future; an explicit kill on
        // cancellation keeps the child from outliving a cooperative stop.
        let finished = tokio::select! {
            status = child.wait() => Some(status),
            _ = ctx.cancel.cancelled() => None,
        };
        let status = match finished {
            Some(status) => status,
            None => {
                let _ = child.kill().await;
                child.wait().await
            }
        };
        if let Some(task) = stdout {
            let _ = task.await;
        }
        if let Some(task) = stderr {
            let _ = task.await;
        }
        drop(params_file);

        match status {
            Ok(status) if status.success() => {
                reporter.message(format!("script '{}' exited with status 0", self.common.name));
                Ok(merged)
            }
            Ok(status) => match status.code() {
                Some(code) => Err(anyhow::anyhow!(
                    "script '{}' exited with status {}",
                    program.display(),
                    code
                )),
                None => Err(anyhow::anyhow!(
                    "script '{}' was terminated by a signal",
                    program.display()
                )),
            },
            Err(error) => Err(anyhow::anyhow!(
                "waiting for script '{}' failed: {}",
                program.display(),
                error
            )),
        }
    }
}

#[cfg(unix)]
fn ensure_executable(program: &Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = std::fs::metadata(program).map_err(|error| {
        anyhow::anyhow!("script '{}' is not accessible: {}", program.display(), error)
    })?;
    if metadata.permissions().mode() & 0o111 == 0 {
        return Err(anyhow::anyhow!(
            "script '{}' is not executable (permissions {:o})",
            program.display(),
            metadata.permissions().mode() & 0o777
        ));
    }
    Ok(())
}

#[cfg(not(unix))]
fn ensure_executable(program: &Path) -> anyhow::Result<()> {
    if !program.exists() {
        return Err(anyhow::anyhow!(
            "script '{}' is not accessible",
            program.display()
        ));
    }
    Ok(())
}

/// Materialize the command-line arguments for one invocation. The `file`
/// convention stores its temp file in `params_file` so the caller controls
/// its lifetime.
fn build_args(
    convention: &ScriptArgs,
    params: &Params,
    params_file: &mut Option<NamedTempFile>,
) -> anyhow::Result<Vec<String>> {
    match convention {
        ScriptArgs::Inline => {
            let payload = serde_json::to_string(&serde_json::Value::Object(params.clone()))?;
            Ok(vec![payload])
        }
        ScriptArgs::File => {
            let mut file = NamedTempFile::new()?;
            serde_json::to_writer(&mut file, &serde_json::Value::Object(params.clone()))?;
            file.flush()?;
            let path = file.path().to_string_lossy().into_owned();
            *params_file = Some(file);
            Ok(vec![path])
        }
        ScriptArgs::Named { names } => names
            .iter()
            .map(|name| {
                let value = params
                    .get(name)
                    .ok_or_else(|| anyhow::anyhow!("missing script parameter '{}'", name))?;
                Ok(match value {
                    serde_json::Value::String(text) => text.clone(),
                    other => other.to_string(),
                })
            })
            .collect(),
    }
}

/// Forward each captured line to the progress log, optionally tagged with
/// the originating stream.
fn capture_lines<R>(
    stream: R,
    reporter: Arc<ProgressReporter>,
    tag: Option<&'static str>,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match tag {
                Some(tag) => reporter.message(format!("{}: {}", tag, line)),
                None => reporter.message(line),
            }
        }
    })
}
