//! # Job Builder
//!
//! Assembles the actuator-facing [`Job`] for one task: placeholder-resolved
//! shell commands, object-storage staging commands for file-typed values, and
//! the signed HTTP callback that reports outputs back to the engine.

use crate::actuator::Job;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::models::{Task, TaskDef, ValueKind};
use crate::placeholder::Resolver;

/// Build the job for a task; called once per node before first dispatch.
pub fn build_job(
    config: &EngineConfig,
    task: &Task,
    def: &TaskDef,
    resolver: &Resolver<'_>,
) -> Result<Job> {
    let storage_alias = format!("{}/{}", task.run_id, task.id);

    let mut commands = Vec::with_capacity(def.commands.len());
    for command in &def.commands {
        commands.push(resolver.resolve(command)?);
    }

    let mut pre_commands = Vec::new();
    for input in &def.inputs {
        if input.kind == ValueKind::File {
            pre_commands.push(stage_pull_command(&storage_alias, &input.name));
        }
    }

    let mut post_commands = Vec::new();
    for value in def.outputs.iter().chain(def.contexts.iter()) {
        if value.kind == ValueKind::File {
            post_commands.push(stage_push_command(&storage_alias, &value.name));
        }
    }
    post_commands.push(callback_command(config, task, def));

    Ok(Job {
        run_id: task.run_id,
        task_id: task.id,
        name: def.alias.clone(),
        executor: def.executor,
        image: def.image.clone(),
        pre_commands,
        commands,
        post_commands,
        timeout_seconds: def
            .timeout_seconds
            .unwrap_or(config.default_task_timeout_seconds),
        storage_alias,
        sign: task.sign.clone(),
    })
}

fn stage_pull_command(storage_alias: &str, name: &str) -> String {
    format!("conductor-stage pull --alias {storage_alias} --name {name}")
}

fn stage_push_command(storage_alias: &str, name: &str) -> String {
    format!("conductor-stage push --alias {storage_alias} --name {name}")
}

/// The callback reports declared outputs and must fail the job when the
/// engine does not answer with success.
fn callback_command(config: &EngineConfig, task: &Task, def: &TaskDef) -> String {
    let outputs: Vec<&str> = def.outputs.iter().map(|o| o.name.as_str()).collect();
    format!(
        "conductor-callback --url {}/api/v1/runs/{}/tasks/{}/callback --auth {} --outputs '{}' || exit 1",
        config.callback_base_url.trim_end_matches('/'),
        task.run_id,
        task.id,
        task.extra.callback_secret,
        outputs.join(",")
    )
}
