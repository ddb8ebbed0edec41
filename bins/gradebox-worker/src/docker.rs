// Docker container management using Bollard
//
// Every context is created with networking off, all capabilities dropped,
// no-new-privileges, a seccomp filter, memory/pids/CPU ceilings, a read-only
// root filesystem, the workspace bound read-only and a small /tmp tmpfs.

use crate::engine::{
    CapturedOutput, Completion, ContainerRuntime, ContainerSpec, ExecOutcome, RuntimeError,
    SeccompPolicy, MANAGED_LABEL,
};
use crate::harness::MOUNT_POINT;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, WaitContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::stream::StreamExt;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Docker-backed container runtime
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to the local daemon and verify it answers
    pub async fn connect() -> Result<Self, RuntimeError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RuntimeError::Unreachable(e.to_string()))?;
        let runtime = Self { docker };
        runtime.ping().await?;
        Ok(runtime)
    }

    /// Ids of every container carrying the managed label
    pub async fn managed_container_ids(&self) -> Result<Vec<String>, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![format!("{}=true", MANAGED_LABEL)]);
        let options = ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        };
        let containers = self
            .docker
            .list_containers(Some(options))
            .await
            .map_err(|e| RuntimeError::operation("list", e))?;
        Ok(containers.into_iter().filter_map(|c| c.id).collect())
    }
}

/// Security and resource settings for a context
pub fn host_config(spec: &ContainerSpec) -> HostConfig {
    let policy = &spec.policy;

    let mut security_opt = vec!["no-new-privileges:true".to_string()];
    match &policy.seccomp {
        SeccompPolicy::EngineDefault => {}
        SeccompPolicy::Profile(profile) => security_opt.push(format!("seccomp={}", profile)),
        SeccompPolicy::Unconfined => security_opt.push("seccomp=unconfined".to_string()),
    }

    let mut tmpfs = HashMap::new();
    tmpfs.insert(
        "/tmp".to_string(),
        format!("rw,noexec,nosuid,size={}m", policy.tmpfs_size_mb),
    );

    HostConfig {
        binds: Some(vec![format!("{}:{}:ro", spec.workspace.display(), MOUNT_POINT)]),
        network_mode: Some("none".to_string()),
        cap_drop: Some(vec!["ALL".to_string()]),
        security_opt: Some(security_opt),
        memory: Some(policy.memory_bytes()),
        // Same as memory: no swap on top of the ceiling
        memory_swap: Some(policy.memory_bytes()),
        pids_limit: Some(policy.pids_limit),
        nano_cpus: Some(policy.nano_cpus()),
        readonly_rootfs: Some(true),
        tmpfs: Some(tmpfs),
        ..Default::default()
    }
}

/// Full create-container request for a context
pub fn container_config(spec: &ContainerSpec) -> Config<String> {
    let mut labels = HashMap::new();
    labels.insert(MANAGED_LABEL.to_string(), "true".to_string());

    Config {
        image: Some(spec.image.clone()),
        cmd: Some(spec.cmd.clone()),
        env: Some(spec.env.clone()),
        working_dir: Some(MOUNT_POINT.to_string()),
        labels: Some(labels),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        network_disabled: Some(true), // SECURITY: No network access
        host_config: Some(host_config(spec)),
        ..Default::default()
    }
}

fn capture(output: &mut CapturedOutput, chunk: LogOutput) {
    match chunk {
        LogOutput::StdOut { message } => output.push_stdout(&message),
        LogOutput::StdErr { message } => output.push_stderr(&message),
        _ => {}
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| RuntimeError::Unreachable(e.to_string()))
    }

    /// Image cache health check: inspect first, pull only on a miss
    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError> {
        if self.docker.inspect_image(image).await.is_ok() {
            debug!(image, "Image cache hit");
            return Ok(());
        }

        warn!(image, "Image cache miss, pulling");
        let options = Some(CreateImageOptions {
            from_image: image,
            ..Default::default()
        });
        let mut stream = self.docker.create_image(options, None, None);
        while let Some(progress) = stream.next().await {
            progress.map_err(|e| RuntimeError::Image {
                image: image.to_string(),
                message: e.to_string(),
            })?;
        }

        info!(image, "Image pulled");
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        if spec.policy.seccomp == SeccompPolicy::Unconfined {
            warn!(container = %spec.name, "Creating container without a seccomp filter");
        }

        let options = CreateContainerOptions {
            name: spec.name.as_str(),
            platform: None,
        };
        let created = self
            .docker
            .create_container(Some(options), container_config(spec))
            .await
            .map_err(|e| RuntimeError::operation("create", e))?;

        for warning in &created.warnings {
            warn!(container_id = %created.id, warning = %warning, "Docker create warning");
        }
        Ok(created.id)
    }

    async fn start(&self, container_id: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(container_id, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| RuntimeError::operation("start", e))
    }

    async fn wait(&self, container_id: &str, timeout: Duration) -> Result<Completion, RuntimeError> {
        let options = WaitContainerOptions {
            condition: "not-running",
        };
        let mut stream = self.docker.wait_container(container_id, Some(options));

        match tokio::time::timeout(timeout, stream.next()).await {
            Err(_) => Ok(Completion::TimedOut),
            Ok(Some(Ok(response))) => Ok(Completion::Exited(response.status_code)),
            // Bollard reports non-zero exits as an error carrying the code
            Ok(Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. }))) => {
                Ok(Completion::Exited(code))
            }
            Ok(Some(Err(e))) => Err(RuntimeError::operation("wait", e)),
            Ok(None) => Err(RuntimeError::operation("wait", "no status from daemon")),
        }
    }

    async fn logs(&self, container_id: &str) -> Result<CapturedOutput, RuntimeError> {
        let options = Some(LogsOptions::<String> {
            stdout: true,
            stderr: true,
            follow: false,
            ..Default::default()
        });
        let mut stream = self.docker.logs(container_id, options);

        let mut output = CapturedOutput::default();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| RuntimeError::operation("logs", e))?;
            capture(&mut output, chunk);
        }
        Ok(output)
    }

    async fn exec(
        &self,
        container_id: &str,
        cmd: &[String],
        env: &[String],
        timeout: Duration,
    ) -> Result<ExecOutcome, RuntimeError> {
        let exec_config = CreateExecOptions {
            cmd: Some(cmd.to_vec()),
            env: Some(env.to_vec()),
            working_dir: Some(MOUNT_POINT.to_string()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let exec = self
            .docker
            .create_exec(container_id, exec_config)
            .await
            .map_err(|e| RuntimeError::operation("create_exec", e))?;

        let run = async {
            let started = self
                .docker
                .start_exec(&exec.id, Some(StartExecOptions {
                    detach: false,
                    ..Default::default()
                }))
                .await
                .map_err(|e| RuntimeError::operation("start_exec", e))?;

            let mut output = CapturedOutput::default();
            if let StartExecResults::Attached { output: mut stream, .. } = started {
                while let Some(chunk) = stream.next().await {
                    let chunk = chunk.map_err(|e| RuntimeError::operation("exec output", e))?;
                    capture(&mut output, chunk);
                }
            }

            let inspect = self
                .docker
                .inspect_exec(&exec.id)
                .await
                .map_err(|e| RuntimeError::operation("inspect_exec", e))?;
            Ok::<_, RuntimeError>((inspect.exit_code, output))
        };

        match tokio::time::timeout(timeout, run).await {
            // The exec'd process keeps running until the context is removed
            Err(_) => Ok(ExecOutcome {
                completion: Completion::TimedOut,
                output: CapturedOutput::default(),
            }),
            Ok(Err(e)) => Err(e),
            Ok(Ok((exit_code, output))) => Ok(ExecOutcome {
                completion: Completion::Exited(exit_code.unwrap_or(-1)),
                output,
            }),
        }
    }

    async fn remove(&self, container_id: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self.docker.remove_container(container_id, Some(options)).await {
            Ok(()) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(()),
            Err(e) => Err(RuntimeError::operation("remove", e)),
        }
    }
}
