//! Pre-release hook and on-demand command runner

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::pods::{self, PodTemplate};
use super::Pipeline;
use crate::cluster::ensure_namespace;
use crate::cluster::resources::LABEL_CATEGORY;
use crate::credentials::PULL_SECRET_NAME;
use crate::error::{EngineError, EngineResult};
use crate::models::{Build, Command, CommandKind, HookSpec, JobStatus, WlApp};
use crate::stream::StreamChannel;

pub const HOOK_CATEGORY: &str = "pre-release-hook";
pub const COMMAND_CATEGORY: &str = "app-command";
const HOOK_PROCESS_TYPE: &str = "sys-pre-rel";
const COMMAND_PROCESS_TYPE: &str = "sys-command";

pub fn hook_pod_name(wl_app: &WlApp) -> String {
    format!("{}-{}", HOOK_CATEGORY, wl_app.scheduler_safe_name())
}

fn command_pod_name(wl_app: &WlApp, command_id: Uuid) -> String {
    let short = command_id.simple().to_string();
    format!("{}-{}-{}", COMMAND_CATEGORY, wl_app.scheduler_safe_name(), &short[..8])
}

fn pod_identity(kind: CommandKind, wl_app: &WlApp, command_id: Uuid) -> (String, &'static str, &'static str) {
    match kind {
        CommandKind::PreReleaseHook => (hook_pod_name(wl_app), HOOK_CATEGORY, HOOK_PROCESS_TYPE),
        CommandKind::Exec => (
            command_pod_name(wl_app, command_id),
            COMMAND_CATEGORY,
            COMMAND_PROCESS_TYPE,
        ),
    }
}

impl Pipeline {
    /// Run `hook` against `build` as a one-shot pod
    ///
    /// The command row records the outcome; anything but a `Succeeded` pod
    /// fails with `HookFailed`.
    #[tracing::instrument(skip_all, fields(wl_app = %wl_app_id))]
    pub async fn run_pre_release_hook(
        &self,
        wl_app_id: Uuid,
        build: &Build,
        hook: &HookSpec,
        extras: &BTreeMap<String, String>,
        channel: &StreamChannel,
        cancel: &CancellationToken,
    ) -> EngineResult<Command> {
        let argv = hook.argv();
        if argv.is_empty() {
            return Err(EngineError::field("pre_release_hook", "hook command is empty"));
        }
        let command = self.insert_command(
            wl_app_id,
            CommandKind::PreReleaseHook,
            argv,
            build,
            Some(channel.id()),
            &build.owner,
        )?;
        self.execute_command(&command, build, extras, channel, cancel)
            .await
    }

    /// Record an on-demand command against the current release's build
    pub fn create_command(&self, wl_app_id: Uuid, command_line: &str, operator: &str) -> EngineResult<Command> {
        let argv = Command::split_command(command_line);
        if argv.is_empty() {
            return Err(EngineError::field("command", "command is empty"));
        }
        let release = self
            .store
            .latest_successful_release(wl_app_id)
            .ok_or_else(|| EngineError::field("command", "application has no successful release"))?;
        let build = self.store.builds.get(&release.build_id)?;
        self.insert_command(wl_app_id, CommandKind::Exec, argv, &build, None, operator)
    }

    /// Execute a recorded command; finished commands are returned unchanged
    #[tracing::instrument(skip(self, extras, cancel))]
    pub async fn run_command(
        &self,
        command_id: Uuid,
        stream_channel_id: Option<Uuid>,
        extras: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> EngineResult<Command> {
        let command = self.store.commands.get(&command_id)?;
        if command.status.is_terminal() {
            return Ok(command);
        }
        let build = self.store.builds.get(&command.build_id)?;
        let channel_id = stream_channel_id
            .or(command.stream_channel_id)
            .unwrap_or_else(Uuid::new_v4);
        if command.stream_channel_id != Some(channel_id) {
            self.store
                .commands
                .update(&command_id, |c| c.stream_channel_id = Some(channel_id))?;
        }
        let channel = self.streams.channel(channel_id, &command.tenant_id);

        let result = self
            .execute_command(&command, &build, extras, &channel, cancel)
            .await;
        let status = match &result {
            Ok(c) => c.status,
            Err(EngineError::Interrupted(_)) => JobStatus::Interrupted,
            Err(_) => JobStatus::Failed,
        };
        if let Err(e) = channel.close(status.as_str()).await {
            tracing::warn!(command_id = %command_id, "closing stream failed: {}", e);
        }
        match result {
            Err(EngineError::HookFailed(_)) if command.kind == CommandKind::Exec => {
                Ok(self.store.commands.get(&command_id)?)
            }
            other => other,
        }
    }

    fn insert_command(
        &self,
        wl_app_id: Uuid,
        kind: CommandKind,
        argv: Vec<String>,
        build: &Build,
        stream_channel_id: Option<Uuid>,
        operator: &str,
    ) -> EngineResult<Command> {
        let config = self.store.latest_config(wl_app_id)?;
        let now = Utc::now();
        let command = self.store.commands.insert(Command {
            id: Uuid::new_v4(),
            wl_app_id,
            kind,
            status: JobStatus::Scheduled,
            argv,
            build_id: build.id,
            config_id: Some(config.id),
            stream_channel_id,
            exit_code: None,
            logs: String::new(),
            operator: operator.to_string(),
            tenant_id: build.tenant_id.clone(),
            created: now,
            updated: now,
        })?;
        Ok(command)
    }

    async fn execute_command(
        &self,
        command: &Command,
        build: &Build,
        extras: &BTreeMap<String, String>,
        channel: &StreamChannel,
        cancel: &CancellationToken,
    ) -> EngineResult<Command> {
        match self.launch_command(command, build, extras, channel, cancel).await {
            Ok(outcome) => {
                let status = if outcome.succeeded {
                    JobStatus::Successful
                } else {
                    JobStatus::Failed
                };
                let finished = self.store.commands.update(&command.id, |c| {
                    c.status = status;
                    c.exit_code = outcome.exit_code;
                    c.logs = outcome.logs.join("\n");
                })?;
                if outcome.succeeded {
                    Ok(finished)
                } else {
                    Err(EngineError::HookFailed(format!(
                        "hook exited with code {}",
                        outcome.exit_code.unwrap_or(-1)
                    )))
                }
            }
            Err(e) => {
                let status = match e {
                    EngineError::Interrupted(_) => JobStatus::Interrupted,
                    _ => JobStatus::Failed,
                };
                self.store.commands.update(&command.id, |c| c.status = status)?;
                Err(e)
            }
        }
    }

    async fn launch_command(
        &self,
        command: &Command,
        build: &Build,
        extras: &BTreeMap<String, String>,
        channel: &StreamChannel,
        cancel: &CancellationToken,
    ) -> EngineResult<pods::PodOutcome> {
        let wl_app_id = command.wl_app_id;
        let records = self.store.env_records(wl_app_id)?;
        let wl_app = &records.wl_app;
        let (_, client) = self.directory.client_for(wl_app)?;
        ensure_namespace(&client, wl_app).await?;

        let (name, category, process_type) = pod_identity(command.kind, wl_app, command.id);
        let env = self
            .scheduler
            .command_env(wl_app_id, build, process_type, extras)?;
        let mut labels = self
            .store
            .latest_config(wl_app_id)?
            .mapper_version()
            .owner_labels(wl_app);
        labels.insert(LABEL_CATEGORY.to_string(), category.to_string());
        let namespace = wl_app.namespace();
        let pod = pods::run_once_pod(&PodTemplate {
            name: &name,
            namespace: &namespace,
            labels,
            image: &build.image,
            command: command.argv.clone(),
            env: &env,
            pull_secret: Some(PULL_SECRET_NAME),
        });

        let title = match command.kind {
            CommandKind::PreReleaseHook => "Running pre-release hook",
            CommandKind::Exec => "Running command",
        };
        let _ = channel.write_title(title).await;
        pods::launch(&client, &namespace, &pod).await?;
        self.store
            .commands
            .update(&command.id, |c| c.status = JobStatus::Pending)?;

        pods::follow(
            &client,
            &namespace,
            &name,
            channel,
            self.settings.release.poll_interval(),
            Duration::from_secs(self.settings.build.builder_pod_timeout_secs),
            cancel,
        )
        .await
    }
}
