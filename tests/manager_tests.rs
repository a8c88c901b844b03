//! Flow-manager integration tests: trigger intake, recovery, synchronous
//! cancellation and inbound callbacks.

mod common;

use common::*;
use serde_json::json;
use std::collections::HashMap;
use uuid::Uuid;

use conductor_core::models::{Event, PipelineContent, Task, Trigger, ValueDef, ValueKind};
use conductor_core::orchestration::TaskCallback;
use conductor_core::state_machine::{RunStatus, TaskStatus, TriggerStatus};
use conductor_core::store::Store;

fn seeded_trigger(h: &Harness, pipeline: &str) -> Trigger {
    let event = Event::new("webhook", json!({ "ref": "refs/heads/main" }));
    let mut trigger = Trigger::new(pipeline, NS);
    trigger.event_id = Some(event.id);
    trigger.content = json!({ "branch": "main" });
    h.store.put_event(event);
    h.store.put_trigger(trigger.clone());
    trigger
}

#[tokio::test]
async fn run_by_trigger_launches_and_completes() {
    let h = harness();
    h.store.put_pipeline(definition(
        "deploy",
        PipelineContent {
            tasks: vec![task_def("ship", &["root"])],
            ..Default::default()
        },
    ));
    let trigger = seeded_trigger(&h, "deploy");

    let run_id = h.manager.run_by_trigger(trigger.id).await.unwrap();
    let run = h.wait_for_terminal(run_id, 5_000).await;
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.trigger_id, Some(trigger.id));

    // The trigger advanced through its guarded state machine.
    let stored = h.store.get_trigger(trigger.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TriggerStatus::Launched);

    // Event and trigger content were snapshotted onto the run.
    let extra = h.store.get_run_extra(run_id).await.unwrap().unwrap();
    assert_eq!(extra.event_content.unwrap()["ref"], "refs/heads/main");
    assert_eq!(extra.trigger_content.unwrap()["branch"], "main");
}

#[tokio::test]
async fn run_by_trigger_fires_at_most_once() {
    let h = harness();
    h.store.put_pipeline(definition(
        "deploy",
        PipelineContent {
            tasks: vec![task_def("ship", &["root"])],
            ..Default::default()
        },
    ));
    let trigger = seeded_trigger(&h, "deploy");

    let run_id = h.manager.run_by_trigger(trigger.id).await.unwrap();
    h.wait_for_terminal(run_id, 5_000).await;

    // The trigger is no longer `matched`; a second signal is rejected.
    let err = h.manager.run_by_trigger(trigger.id).await.unwrap_err();
    assert!(err.to_string().contains("not in matched status"));
}

#[tokio::test]
async fn missing_definition_marks_the_trigger_failed() {
    let h = harness();
    let trigger = seeded_trigger(&h, "ghost-pipeline");

    assert!(h.manager.run_by_trigger(trigger.id).await.is_err());
    let stored = h.store.get_trigger(trigger.id).await.unwrap().unwrap();
    assert_eq!(stored.status, TriggerStatus::Failed);
}

#[tokio::test]
async fn cancel_run_waits_for_the_terminal_commit() {
    let h = harness();
    h.actuator.hold("work");
    h.store.put_pipeline(definition(
        "long",
        PipelineContent {
            tasks: vec![task_def("work", &["root"])],
            ..Default::default()
        },
    ));

    let run_id = h.manager.start_run(NS, "long", None).await.unwrap();
    h.wait_for_task(run_id, "work", TaskStatus::Running, 2_000).await;

    h.manager.cancel_run(run_id, "operator").await.unwrap();
    // cancel_run resolves only after the run committed its terminal status.
    let run = h.store.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
    assert_eq!(run.reason.as_deref(), Some("operator"));
}

#[tokio::test]
async fn cancelling_an_orphaned_run_updates_the_store() {
    let h = harness();
    let run = conductor_core::models::PipelineRun::new("orphan", "v1", NS);
    let run_id = run.id;
    h.store.create_run(&run).await.unwrap();

    h.manager.cancel_run(run_id, "cleanup").await.unwrap();
    let run = h.store.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Cancelled);
}

#[tokio::test]
async fn callback_merges_outputs_into_declared_slots() {
    let h = harness();
    h.actuator.hold("build");
    h.store.put_pipeline(definition(
        "artifacts",
        PipelineContent {
            tasks: vec![{
                let mut build = task_def("build", &["root"]);
                build.outputs = vec![ValueDef::new("digest", ValueKind::String, None)];
                build
            }],
            ..Default::default()
        },
    ));

    let run_id = h.manager.start_run(NS, "artifacts", None).await.unwrap();
    let task = h
        .wait_for_task(run_id, "build", TaskStatus::Running, 2_000)
        .await;

    h.manager
        .handle_callback(TaskCallback {
            run_id,
            task_id: task.id,
            auth: task.extra.callback_secret.clone(),
            outputs: HashMap::from([
                ("digest".to_string(), "sha256:abc".to_string()),
                ("undeclared".to_string(), "dropped".to_string()),
            ]),
        })
        .await
        .unwrap();

    h.actuator.finish("build", TaskStatus::Success);
    let run = h.wait_for_terminal(run_id, 5_000).await;
    assert_eq!(run.status, RunStatus::Success);

    let build = h.task_by_alias(run_id, "build").await.unwrap();
    assert_eq!(build.extra.outputs.get("digest").unwrap().value, "sha256:abc");
    assert!(!build.extra.outputs.contains_key("undeclared"));
}

#[tokio::test]
async fn callback_with_bad_auth_is_rejected_without_mutation() {
    let h = harness();
    h.actuator.hold("build");
    h.store.put_pipeline(definition(
        "artifacts",
        PipelineContent {
            tasks: vec![{
                let mut build = task_def("build", &["root"]);
                build.outputs = vec![ValueDef::new("digest", ValueKind::String, None)];
                build
            }],
            ..Default::default()
        },
    ));

    let run_id = h.manager.start_run(NS, "artifacts", None).await.unwrap();
    let task = h
        .wait_for_task(run_id, "build", TaskStatus::Running, 2_000)
        .await;

    let err = h
        .manager
        .handle_callback(TaskCallback {
            run_id,
            task_id: task.id,
            auth: "wrong-secret".to_string(),
            outputs: HashMap::from([("digest".to_string(), "sha256:evil".to_string())]),
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("auth"));

    let build = h.task_by_alias(run_id, "build").await.unwrap();
    assert_eq!(build.extra.outputs.get("digest").unwrap().value, "");

    h.manager.cancel_run(run_id, "test done").await.unwrap();
}

#[tokio::test]
async fn sub_pipeline_outputs_resolve_from_child_callbacks() {
    let h = harness();
    h.actuator.hold("s1");
    h.store.put_pipeline(definition(
        "sub",
        PipelineContent {
            outputs: vec![ValueDef::new(
                "bundle",
                ValueKind::String,
                Some("${{ outputs.s1.res }}".to_string()),
            )],
            tasks: vec![{
                let mut s1 = task_def("s1", &["root"]);
                s1.outputs = vec![ValueDef::new("res", ValueKind::String, None)];
                s1
            }],
            ..Default::default()
        },
    ));
    h.store.put_pipeline(definition(
        "top",
        PipelineContent {
            tasks: vec![{
                let mut deploy = pipeline_task_def("deploy", &["root"], "sub:v1");
                deploy.outputs = vec![ValueDef::new("bundle", ValueKind::String, None)];
                deploy
            }],
            ..Default::default()
        },
    ));

    let run_id = h.manager.start_run(NS, "top", None).await.unwrap();
    let s1 = h.wait_for_task(run_id, "s1", TaskStatus::Running, 2_000).await;

    h.manager
        .handle_callback(TaskCallback {
            run_id,
            task_id: s1.id,
            auth: s1.extra.callback_secret.clone(),
            outputs: HashMap::from([("res".to_string(), "42".to_string())]),
        })
        .await
        .unwrap();
    h.actuator.finish("s1", TaskStatus::Success);

    let run = h.wait_for_terminal(run_id, 5_000).await;
    assert_eq!(run.status, RunStatus::Success);

    let deploy = h.task_by_alias(run_id, "deploy").await.unwrap();
    assert_eq!(deploy.extra.outputs.get("bundle").unwrap().value, "42");
}

#[tokio::test]
async fn recover_resumes_interrupted_runs() {
    let h = harness();
    // A run left `running` by a previous process, with `build` already done.
    let content = PipelineContent {
        tasks: vec![task_def("build", &["root"]), task_def("test", &["build"])],
        ..Default::default()
    };
    let mut run = conductor_core::models::PipelineRun::new("demo", "v1", NS);
    run.status = RunStatus::Running;
    run.time_begin = Some(chrono::Utc::now());
    let run_id = run.id;
    let extra = conductor_core::models::RunExtra::new(run_id, content);
    h.store.create_run(&run).await.unwrap();
    h.store.create_run_extra(&extra).await.unwrap();

    let mut root = Task::new(run_id, Uuid::nil(), "root");
    root.status = TaskStatus::Success;
    h.store.create_task(&root).await.unwrap();
    let mut build = Task::new(run_id, Uuid::nil(), "build");
    build.status = TaskStatus::Success;
    h.store.create_task(&build).await.unwrap();

    let recovered = h.manager.recover().await.unwrap();
    assert_eq!(recovered, 1);

    let run = h.wait_for_terminal(run_id, 5_000).await;
    assert_eq!(run.status, RunStatus::Success);
    // Only the unfinished node was dispatched.
    assert_eq!(h.actuator.count("create:build"), 0);
    assert_eq!(h.actuator.count("create:test"), 1);
}

#[tokio::test]
async fn active_runs_tracks_live_flows() {
    let h = harness();
    h.actuator.hold("work");
    h.store.put_pipeline(definition(
        "long",
        PipelineContent {
            tasks: vec![task_def("work", &["root"])],
            ..Default::default()
        },
    ));

    let run_id = h.manager.start_run(NS, "long", None).await.unwrap();
    h.wait_for_task(run_id, "work", TaskStatus::Running, 2_000).await;
    assert!(h.manager.active_runs().contains(&run_id));

    h.manager.cancel_run(run_id, "done").await.unwrap();
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_millis(2_000);
    while h.manager.active_runs().contains(&run_id) {
        assert!(tokio::time::Instant::now() < deadline, "flow not deregistered");
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
}
