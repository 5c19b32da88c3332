use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use monobox::{
    config::ControllerConfig,
    exec::{ExecOutcome, ExecTransport},
    ops::{CreateSandbox, SandboxOps},
    reconcile::{Dispatcher, PoolReconciler, SandboxReconciler},
    resource::{
        SandboxPool, SandboxPoolSpec, SandboxTemplate, SandboxTemplateSpec, TemplateRef,
        SANDBOX_CONTAINER,
    },
    store::{MemoryStore, ResourceStore},
    MonoboxResult,
};
use tokio::{sync::watch, time};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const NS: &str = "default";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

struct ExecCall {
    pod: String,
    container: String,
    argv: Vec<String>,
}

/// Transport double that records every call and plays back queued outcomes.
#[derive(Default)]
struct RecordingTransport {
    calls: Mutex<Vec<ExecCall>>,
    responses: Mutex<VecDeque<ExecOutcome>>,
    log_requests: Mutex<Vec<Option<i64>>>,
}

impl RecordingTransport {
    fn queue(&self, exit_code: i32, stdout: &str) {
        self.responses.lock().unwrap().push_back(ExecOutcome {
            exit_code,
            stdout: stdout.to_string(),
            stderr: String::new(),
        });
    }
}

#[async_trait]
impl ExecTransport for RecordingTransport {
    async fn exec(
        &self,
        _namespace: &str,
        pod: &str,
        container: &str,
        argv: &[String],
        _timeout: Duration,
    ) -> MonoboxResult<ExecOutcome> {
        self.calls.lock().unwrap().push(ExecCall {
            pod: pod.to_string(),
            container: container.to_string(),
            argv: argv.to_vec(),
        });
        Ok(self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(ExecOutcome {
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
        tail_lines: Option<i64>,
    ) -> MonoboxResult<String> {
        self.log_requests.lock().unwrap().push(tail_lines);
        Ok("6 * 7 = 42\n".to_string())
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

fn fast_config() -> ControllerConfig {
    ControllerConfig::builder()
        .namespace(NS.to_string())
        .sync_interval(Duration::from_millis(25))
        .ready_wait_timeout(Duration::from_secs(2))
        .ready_poll_interval(Duration::from_millis(10))
        .shutdown_grace(Duration::from_secs(1))
        .retry_base_delay(Duration::from_millis(1))
        .build()
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[test_log::test(tokio::test)]
async fn test_full_consumer_journey() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    let transport = Arc::new(RecordingTransport::default());
    let ops = SandboxOps::new(store.clone(), transport.clone(), fast_config());

    let dispatcher = Arc::new(Dispatcher::new(store.clone(), fast_config()));
    let (shutdown, shutdown_rx) = watch::channel(false);
    let controller = tokio::spawn(dispatcher.run(shutdown_rx));

    let created = ops
        .create(
            NS,
            CreateSandbox {
                name: Some("sb-journey".to_string()),
                image: Some("python:3.12-slim".to_string()),
                ttl_minutes: Some(30),
                ..Default::default()
            },
        )
        .await?;
    assert_eq!(created.phase, "Unknown");

    // Stand in for the kubelet: flip the pod once the controller creates it.
    let mut pod_name = None;
    for _ in 0..200 {
        if let Some(name) = ops.get(NS, "sb-journey").await?.pod_name {
            pod_name = Some(name);
            break;
        }
        time::sleep(Duration::from_millis(10)).await;
    }
    let pod_name = pod_name.expect("controller never provisioned a pod");
    store.set_pod_phase(NS, &pod_name, "Running", Some("10.3.0.14")).await?;

    let ready = ops.wait_until_ready(NS, "sb-journey").await?;
    assert_eq!(ready.phase, "Running");
    assert_eq!(ready.pod_ip.as_deref(), Some("10.3.0.14"));
    assert!(ready.expires_at.is_some());

    // Upload a script, run it, read its output file back, then check logs.
    transport.queue(0, "");
    ops.upload_file(NS, "sb-journey", "main.py", "print(6 * 7)").await?;

    transport.queue(0, "42\n");
    let outcome = ops.execute(NS, "sb-journey", "python main.py", None).await?;
    assert!(outcome.success());
    assert_eq!(outcome.stdout, "42\n");

    transport.queue(0, "42");
    let content = ops.download_file(NS, "sb-journey", "out/result.txt").await?;
    assert_eq!(content, "42");

    let logs = ops.logs(NS, "sb-journey", Some(25)).await?;
    assert_eq!(logs, "6 * 7 = 42\n");
    assert_eq!(transport.log_requests.lock().unwrap().as_slice(), &[Some(25)]);

    // Every exec call addressed the controller-provisioned pod.
    {
        let calls = transport.calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        for call in calls.iter() {
            assert_eq!(call.pod, pod_name);
            assert_eq!(call.container, SANDBOX_CONTAINER);
        }
        assert!(calls[0].argv[4].contains("base64 -d > '/workspace/main.py'"));
        assert_eq!(calls[1].argv[4], "python main.py");
        assert_eq!(calls[2].argv[4], "cat '/workspace/out/result.txt'");
    }

    assert!(ops.delete(NS, "sb-journey").await?);
    let mut reaped = false;
    for _ in 0..200 {
        if store.get_pod(NS, &pod_name).await?.is_none() {
            reaped = true;
            break;
        }
        time::sleep(Duration::from_millis(10)).await;
    }
    assert!(reaped, "deleting the sandbox must clean up its pod");

    shutdown.send(true)?;
    controller.await??;
    Ok(())
}

#[test_log::test(tokio::test)]
async fn test_claimed_member_accepts_commands() -> anyhow::Result<()> {
    let store = Arc::new(MemoryStore::new());
    store
        .insert_template(
            NS,
            &SandboxTemplate::new(
                "py-tmpl",
                SandboxTemplateSpec {
                    image: Some("python:3.12-slim".to_string()),
                    ttl_minutes: Some(60),
                    resources: None,
                },
            ),
        )
        .await?;
    store
        .insert_pool(
            NS,
            &SandboxPool::new(
                "py-pool",
                SandboxPoolSpec {
                    min_size: 1,
                    max_size: Some(1),
                    template_ref: Some(TemplateRef {
                        name: "py-tmpl".to_string(),
                    }),
                },
            ),
        )
        .await?;

    // Warm the single member by hand instead of running the dispatcher.
    let pools = PoolReconciler::new(store.clone(), fast_config());
    let sandboxes = SandboxReconciler::new(store.clone(), fast_config());
    pools.reconcile(NS, "py-pool").await?;
    let member = store.list_sandboxes(NS, None).await?.remove(0);
    let member_name = member.metadata.name.clone().unwrap();
    sandboxes.reconcile(NS, &member_name).await?;
    store.set_pod_phase(NS, &member_name, "Running", Some("10.3.0.20")).await?;
    sandboxes.reconcile(NS, &member_name).await?;

    let transport = Arc::new(RecordingTransport::default());
    let ops = SandboxOps::new(store.clone(), transport.clone(), fast_config());

    let claimed = ops.claim(NS, "py-pool", None).await?;
    assert_eq!(claimed.name, member_name);
    assert!(claimed.claimed);

    transport.queue(0, "Python 3.12.0\n");
    let outcome = ops.execute(NS, &claimed.name, "python -V", None).await?;
    assert_eq!(outcome.stdout, "Python 3.12.0\n");

    // The command ran against the member's own backing pod.
    let calls = transport.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].pod, member_name);
    Ok(())
}
