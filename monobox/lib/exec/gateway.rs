//! High-level command and file operations addressed to sandboxes by name.
//!
//! The gateway resolves a sandbox to its backing pod, enforces that the
//! sandbox is actually claimable for work, and turns file transfers into
//! shell pipelines run over the exec transport.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::debug;

use crate::config::ControllerConfig;
use crate::resource::{Sandbox, SandboxPhase, SANDBOX_CONTAINER, WORKSPACE_DIR};
use crate::store::ResourceStore;
use crate::MonoboxError;
use crate::MonoboxResult;

use super::transport::{shell_argv, shell_quote, validate_working_dir, ExecOutcome, ExecTransport};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Executes commands and transfers files inside running sandboxes.
pub struct ExecGateway<S, T> {
    store: Arc<S>,
    transport: Arc<T>,
    config: ControllerConfig,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl<S, T> ExecGateway<S, T>
where
    S: ResourceStore,
    T: ExecTransport,
{
    /// Creates a gateway over the given store and transport.
    pub fn new(store: Arc<S>, transport: Arc<T>, config: ControllerConfig) -> Self {
        Self {
            store,
            transport,
            config,
        }
    }

    /// Runs `command` in the sandbox, in `working_dir` or the workspace root.
    ///
    /// A nonzero exit is a legitimate result and comes back in the outcome;
    /// only transport and state problems surface as errors.
    pub async fn execute(
        &self,
        namespace: &str,
        name: &str,
        command: &str,
        working_dir: Option<&str>,
    ) -> MonoboxResult<ExecOutcome> {
        let working_dir = working_dir.unwrap_or(WORKSPACE_DIR);
        validate_working_dir(working_dir)?;
        let (_, pod_name) = self.ensure_running(namespace, name).await?;

        debug!(%namespace, %name, %working_dir, "executing command in sandbox");
        let argv = shell_argv(command, working_dir);
        self.transport
            .exec(
                namespace,
                &pod_name,
                SANDBOX_CONTAINER,
                &argv,
                *self.config.get_exec_timeout(),
            )
            .await
    }

    /// Writes `content` to `path` inside the sandbox, creating parent
    /// directories as needed. Relative paths land under the workspace.
    pub async fn upload_file(
        &self,
        namespace: &str,
        name: &str,
        path: &str,
        content: &str,
    ) -> MonoboxResult<()> {
        let target = resolve_path(path)?;
        let parent = parent_dir(&target);
        let (_, pod_name) = self.ensure_running(namespace, name).await?;

        // Content travels base64-encoded so arbitrary text survives the
        // shell round trip.
        let encoded = STANDARD.encode(content.as_bytes());
        let script = format!(
            "mkdir -p {} && printf '%s' {} | base64 -d > {}",
            shell_quote(parent),
            shell_quote(&encoded),
            shell_quote(&target),
        );

        debug!(%namespace, %name, %target, "uploading file to sandbox");
        let outcome = self.run_script(namespace, &pod_name, &script).await?;
        if !outcome.success() {
            return Err(MonoboxError::CommandFailed {
                exit_code: outcome.exit_code,
                stderr: outcome.stderr,
            });
        }
        Ok(())
    }

    /// Reads the file at `path` inside the sandbox and returns its content.
    pub async fn download_file(
        &self,
        namespace: &str,
        name: &str,
        path: &str,
    ) -> MonoboxResult<String> {
        let target = resolve_path(path)?;
        let (_, pod_name) = self.ensure_running(namespace, name).await?;

        let script = format!("cat {}", shell_quote(&target));
        debug!(%namespace, %name, %target, "downloading file from sandbox");
        let outcome = self.run_script(namespace, &pod_name, &script).await?;
        if !outcome.success() {
            return Err(MonoboxError::CommandFailed {
                exit_code: outcome.exit_code,
                stderr: outcome.stderr,
            });
        }
        Ok(outcome.stdout)
    }

    /// Fetches container logs for the sandbox's backing pod.
    ///
    /// Works for any sandbox whose status still records a pod, including
    /// terminated ones whose pod has not been reaped yet.
    pub async fn logs(
        &self,
        namespace: &str,
        name: &str,
        tail_lines: Option<i64>,
    ) -> MonoboxResult<String> {
        let sandbox = self.store.get_sandbox(namespace, name).await?;
        let pod_name = backing_pod_name(&sandbox)?;
        self.transport
            .logs(namespace, &pod_name, SANDBOX_CONTAINER, tail_lines)
            .await
    }

    async fn run_script(
        &self,
        namespace: &str,
        pod_name: &str,
        script: &str,
    ) -> MonoboxResult<ExecOutcome> {
        // Generated scripts address absolute paths only.
        let argv = shell_argv(script, "/");
        self.transport
            .exec(
                namespace,
                pod_name,
                SANDBOX_CONTAINER,
                &argv,
                *self.config.get_exec_timeout(),
            )
            .await
    }

    async fn ensure_running(
        &self,
        namespace: &str,
        name: &str,
    ) -> MonoboxResult<(Sandbox, String)> {
        let sandbox = self.store.get_sandbox(namespace, name).await?;
        match sandbox.phase() {
            Some(SandboxPhase::Running) => {}
            phase => {
                return Err(MonoboxError::SandboxNotRunning {
                    name: name.to_string(),
                    phase: phase
                        .map(|p| p.to_string())
                        .unwrap_or_else(|| "Unknown".to_string()),
                });
            }
        }
        let pod_name = backing_pod_name(&sandbox)?;
        Ok((sandbox, pod_name))
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn backing_pod_name(sandbox: &Sandbox) -> MonoboxResult<String> {
    sandbox
        .status
        .as_ref()
        .and_then(|status| status.pod_name.clone())
        .ok_or_else(|| MonoboxError::MissingPod(sandbox.metadata.name.clone().unwrap_or_default()))
}

fn resolve_path(path: &str) -> MonoboxResult<String> {
    if path.is_empty() {
        return Err(MonoboxError::InvalidPath("path is empty".to_string()));
    }
    if path.chars().any(char::is_control) {
        return Err(MonoboxError::InvalidPath(
            "path contains control characters".to_string(),
        ));
    }
    if path.ends_with('/') {
        return Err(MonoboxError::InvalidPath(format!(
            "'{path}' is not a file path"
        )));
    }
    if path.starts_with('/') {
        Ok(path.to_string())
    } else {
        Ok(format!("{WORKSPACE_DIR}/{path}"))
    }
}

fn parent_dir(target: &str) -> &str {
    match target.rsplit_once('/') {
        Some(("", _)) | None => "/",
        Some((parent, _)) => parent,
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::resource::{SandboxPhase, SandboxSpec, SandboxStatus};
    use crate::store::MemoryStore;

    use super::*;

    struct RecordedCall {
        pod: String,
        container: String,
        argv: Vec<String>,
    }

    #[derive(Default)]
    struct FakeTransport {
        calls: Mutex<Vec<RecordedCall>>,
        responses: Mutex<VecDeque<ExecOutcome>>,
    }

    impl FakeTransport {
        fn queue(&self, outcome: ExecOutcome) {
            self.responses.lock().unwrap().push_back(outcome);
        }

        fn last_argv(&self) -> Vec<String> {
            self.calls.lock().unwrap().last().unwrap().argv.clone()
        }
    }

    #[async_trait]
    impl ExecTransport for FakeTransport {
        async fn exec(
            &self,
            _namespace: &str,
            pod: &str,
            container: &str,
            argv: &[String],
            _timeout: Duration,
        ) -> MonoboxResult<ExecOutcome> {
            self.calls.lock().unwrap().push(RecordedCall {
                pod: pod.to_string(),
                container: container.to_string(),
                argv: argv.to_vec(),
            });
            Ok(self.responses.lock().unwrap().pop_front().unwrap_or(ExecOutcome {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            }))
        }

        async fn logs(
            &self,
            _namespace: &str,
            _pod: &str,
            _container: &str,
            _tail_lines: Option<i64>,
        ) -> MonoboxResult<String> {
            Ok("log line\n".to_string())
        }
    }

    async fn gateway_with_running_sandbox(
    ) -> (ExecGateway<MemoryStore, FakeTransport>, Arc<FakeTransport>) {
        let store = Arc::new(MemoryStore::new());
        let created = store
            .create_sandbox("default", &Sandbox::new("sb-1", SandboxSpec::default()))
            .await
            .unwrap();
        store
            .patch_sandbox_status(
                "default",
                "sb-1",
                created.metadata.resource_version.as_deref().unwrap(),
                &SandboxStatus {
                    phase: Some(SandboxPhase::Running),
                    pod_name: Some("sb-1".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let transport = Arc::new(FakeTransport::default());
        let gateway = ExecGateway::new(store, transport.clone(), ControllerConfig::default());
        (gateway, transport)
    }

    #[tokio::test]
    async fn test_execute_defaults_to_workspace_directory() {
        let (gateway, transport) = gateway_with_running_sandbox().await;

        let outcome = gateway
            .execute("default", "sb-1", "ls -la", None)
            .await
            .unwrap();
        assert!(outcome.success());

        let argv = transport.last_argv();
        assert_eq!(argv[3], WORKSPACE_DIR);
        assert_eq!(argv[4], "ls -la");
        let call = &transport.calls.lock().unwrap()[0];
        assert_eq!(call.pod, "sb-1");
        assert_eq!(call.container, SANDBOX_CONTAINER);
    }

    #[tokio::test]
    async fn test_execute_rejects_relative_working_dir() {
        let (gateway, _) = gateway_with_running_sandbox().await;

        let result = gateway
            .execute("default", "sb-1", "ls", Some("srv/app"))
            .await;
        assert!(matches!(result, Err(MonoboxError::InvalidWorkingDir(_))));
    }

    #[tokio::test]
    async fn test_execute_requires_running_sandbox() {
        let store = Arc::new(MemoryStore::new());
        store
            .create_sandbox("default", &Sandbox::new("sb-cold", SandboxSpec::default()))
            .await
            .unwrap();
        let gateway = ExecGateway::new(
            store,
            Arc::new(FakeTransport::default()),
            ControllerConfig::default(),
        );

        let result = gateway.execute("default", "sb-cold", "ls", None).await;
        assert!(matches!(result, Err(MonoboxError::SandboxNotRunning { .. })));
    }

    #[tokio::test]
    async fn test_upload_pipes_base64_through_decode_script() {
        let (gateway, transport) = gateway_with_running_sandbox().await;

        gateway
            .upload_file("default", "sb-1", "notes/readme.md", "hello")
            .await
            .unwrap();

        let argv = transport.last_argv();
        assert_eq!(argv[3], "/");
        let script = &argv[4];
        assert!(script.contains("mkdir -p '/workspace/notes'"));
        assert!(script.contains("base64 -d > '/workspace/notes/readme.md'"));
        assert!(script.contains("aGVsbG8="));
    }

    #[tokio::test]
    async fn test_upload_surfaces_nonzero_exit() {
        let (gateway, transport) = gateway_with_running_sandbox().await;
        transport.queue(ExecOutcome {
            exit_code: 1,
            stdout: String::new(),
            stderr: "no space left on device".to_string(),
        });

        let result = gateway
            .upload_file("default", "sb-1", "big.bin", "data")
            .await;
        assert!(matches!(
            result,
            Err(MonoboxError::CommandFailed { exit_code: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_download_returns_stdout() {
        let (gateway, transport) = gateway_with_running_sandbox().await;
        transport.queue(ExecOutcome {
            exit_code: 0,
            stdout: "file body".to_string(),
            stderr: String::new(),
        });

        let content = gateway
            .download_file("default", "sb-1", "/shared/data.txt")
            .await
            .unwrap();
        assert_eq!(content, "file body");
        assert_eq!(transport.last_argv()[4], "cat '/shared/data.txt'");
    }

    #[tokio::test]
    async fn test_path_resolution_rules() {
        assert_eq!(resolve_path("/etc/hosts").unwrap(), "/etc/hosts");
        assert_eq!(resolve_path("main.py").unwrap(), "/workspace/main.py");
        assert!(matches!(resolve_path(""), Err(MonoboxError::InvalidPath(_))));
        assert!(matches!(
            resolve_path("dir/"),
            Err(MonoboxError::InvalidPath(_))
        ));

        assert_eq!(parent_dir("/workspace/a/b.txt"), "/workspace/a");
        assert_eq!(parent_dir("/top.txt"), "/");
    }
}
