//! The directory-backed action catalogue: decoding, hot reload, and
//! trigger fan-out.

use std::path::Path;
use std::sync::{Arc, Mutex};

use serde_json::json;
use tempfile::TempDir;

use watchwork_core::actions::catalog::ActionRegistry;
use watchwork_core::actions::decode::{ActionConstructor, ActionDecoder};
use watchwork_core::actions::{Action, ActionCommon, FnWork, SimpleAction};
use watchwork_core::registry::RegistryConfig;
use watchwork_core::{Params, ProgressReporter, RunnerConfig, TaskRunner};
use watchwork_model::ActionDoc;

type SharedLog = Arc<Mutex<Vec<String>>>;

/// Leaf kind for these tests: records `name:target:trigger_event` into a
/// shared log and succeeds.
struct RecordConstructor {
    log: SharedLog,
}

impl ActionConstructor for RecordConstructor {
    fn construct(
        &self,
        _decoder: &ActionDecoder,
        _doc: &ActionDoc,
        common: ActionCommon,
    ) -> watchwork_core::Result<Arc<dyn Action>> {
        let log = Arc::clone(&self.log);
        let tag = common.name.clone();
        let work = move |params: Params, _reporter: Arc<ProgressReporter>| {
            let log = Arc::clone(&log);
            let tag = tag.clone();
            async move {
                let target = params
                    .get("target")
                    .and_then(|v| v.as_str())
                    .unwrap_or("-")
                    .to_string();
                let event = params
                    .get("trigger_event")
                    .and_then(|v| v.as_str())
                    .unwrap_or("-")
                    .to_string();
                log.lock().unwrap().push(format!("{tag}:{target}:{event}"));
                Ok(params)
            }
        };
        Ok(Arc::new(SimpleAction::new(
            common,
            Arc::new(FnWork::new(work)),
        )))
    }
}

fn catalog_at(dir: &TempDir, log: &SharedLog) -> ActionRegistry {
    let mut decoder = ActionDecoder::new();
    decoder.register(
        "record",
        Arc::new(RecordConstructor {
            log: Arc::clone(log),
        }),
    );
    ActionRegistry::new(dir.path(), RegistryConfig::default(), decoder)
}

fn write_doc(dir: &Path, file: &str, value: serde_json::Value) {
    std::fs::write(dir.join(file), serde_json::to_string_pretty(&value).unwrap()).unwrap();
}

fn entries(log: &SharedLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

#[tokio::test]
async fn forward_references_resolve_within_one_document() -> watchwork_core::Result<()> {
    let dir = TempDir::new()?;
    // The wrapped action appears before the base it references.
    write_doc(
        dir.path(),
        "deploy.json",
        json!([
            {
                "type": "wrapped",
                "name": "deploy-prod",
                "base": "deploy",
                "params": { "target": "prod" }
            },
            { "type": "record", "name": "deploy" }
        ]),
    );

    let log = SharedLog::default();
    let catalog = catalog_at(&dir, &log);
    let runner = TaskRunner::new(RunnerConfig::default());

    let action = catalog
        .action("deploy-prod")
        .await
        .expect("forward reference should resolve");
    let mut handle = runner.submit(action, Params::new()).await?;
    handle.wait().await;

    // The wrapper's bindings override the (absent) base binding.
    assert!(handle.reporter.succeeded());
    assert_eq!(entries(&log), vec!["deploy:prod:-"]);

    runner.shutdown().await;
    catalog.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn references_across_sets_resolve_against_the_installed_catalog()
-> watchwork_core::Result<()> {
    let dir = TempDir::new()?;
    write_doc(
        dir.path(),
        "base.json",
        json!({ "type": "record", "name": "notify" }),
    );

    let log = SharedLog::default();
    let catalog = catalog_at(&dir, &log);
    assert!(catalog.action("notify").await.is_some());

    write_doc(
        dir.path(),
        "extra.json",
        json!({
            "type": "wrapped",
            "name": "notify-loud",
            "base": "notify",
            "params": { "target": "everyone" }
        }),
    );
    catalog.refresh().await?;
    assert!(catalog.action("notify-loud").await.is_some());
    assert_eq!(catalog.len().await, 2);

    catalog.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn unresolved_reference_keeps_the_previous_set() -> watchwork_core::Result<()> {
    let dir = TempDir::new()?;
    write_doc(
        dir.path(),
        "jobs.json",
        json!({ "type": "record", "name": "alpha" }),
    );

    let log = SharedLog::default();
    let catalog = catalog_at(&dir, &log);
    assert!(catalog.action("alpha").await.is_some());

    // A broken edit must not evict the working set.
    write_doc(
        dir.path(),
        "jobs.json",
        json!({
            "type": "wrapped",
            "name": "beta",
            "base": "does-not-exist"
        }),
    );
    catalog.refresh().await?;
    assert!(catalog.action("alpha").await.is_some());
    assert!(catalog.action("beta").await.is_none());

    catalog.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn invalid_document_keeps_the_previous_set() -> watchwork_core::Result<()> {
    let dir = TempDir::new()?;
    write_doc(
        dir.path(),
        "jobs.json",
        json!({ "type": "record", "name": "alpha" }),
    );

    let log = SharedLog::default();
    let catalog = catalog_at(&dir, &log);
    assert!(catalog.action("alpha").await.is_some());

    std::fs::write(dir.path().join("jobs.json"), "{ not json at all")?;
    catalog.refresh().await?;
    assert!(catalog.action("alpha").await.is_some());

    catalog.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn firing_an_event_submits_every_matching_action() -> watchwork_core::Result<()> {
    let dir = TempDir::new()?;
    write_doc(
        dir.path(),
        "triggers.json",
        json!([
            { "type": "record", "name": "on-deploy", "trigger": "deploy-.*" },
            { "type": "record", "name": "on-release", "trigger": "release-.*" },
            { "type": "record", "name": "on-anything", "trigger": ".*" }
        ]),
    );

    let log = SharedLog::default();
    let catalog = catalog_at(&dir, &log);
    let runner = TaskRunner::new(RunnerConfig::default());

    let handles = catalog
        .fire(
            &runner,
            "deploy-prod",
            [("target".to_string(), json!("prod"))].into_iter().collect(),
        )
        .await?;
    assert_eq!(handles.len(), 2);
    for mut handle in handles {
        handle.wait().await;
        assert!(handle.reporter.succeeded());
    }

    let mut ran = entries(&log);
    ran.sort();
    assert_eq!(
        ran,
        vec!["on-anything:prod:deploy-prod", "on-deploy:prod:deploy-prod"]
    );

    runner.shutdown().await;
    catalog.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn duplicate_names_resolve_in_sorted_set_order() -> watchwork_core::Result<()> {
    let dir = TempDir::new()?;
    // Two sets define the same action name; the set earliest in sorted
    // set-name order owns it.
    write_doc(
        dir.path(),
        "alpha.json",
        json!({
            "type": "record",
            "name": "greet",
            "trigger": "greet-.*",
            "params": { "target": "from-alpha" }
        }),
    );
    write_doc(
        dir.path(),
        "beta.json",
        json!({
            "type": "record",
            "name": "greet",
            "trigger": "greet-.*",
            "params": { "target": "from-beta" }
        }),
    );

    let log = SharedLog::default();
    let catalog = catalog_at(&dir, &log);
    let runner = TaskRunner::new(RunnerConfig::default());

    let action = catalog.action("greet").await.expect("greet resolves");
    let mut handle = runner.submit(action, Params::new()).await?;
    handle.wait().await;
    assert_eq!(entries(&log), vec!["greet:from-alpha:-"]);

    // Firing submits the shadowed name exactly once, from the winning set.
    log.lock().unwrap().clear();
    let handles = catalog.fire(&runner, "greet-now", Params::new()).await?;
    assert_eq!(handles.len(), 1);
    for mut handle in handles {
        handle.wait().await;
        assert!(handle.reporter.succeeded());
    }
    assert_eq!(entries(&log), vec!["greet:from-alpha:greet-now"]);

    runner.shutdown().await;
    catalog.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn sequences_from_documents_run_catalogued_components() -> watchwork_core::Result<()> {
    let dir = TempDir::new()?;
    write_doc(
        dir.path(),
        "pipeline.json",
        json!([
            {
                "type": "sequence",
                "name": "pipeline",
                "components": [
                    "first",
                    { "type": "record", "name": "second" }
                ]
            },
            { "type": "record", "name": "first" }
        ]),
    );

    let log = SharedLog::default();
    let catalog = catalog_at(&dir, &log);
    let runner = TaskRunner::new(RunnerConfig::default());

    let pipeline = catalog.action("pipeline").await.expect("pipeline decoded");
    let mut handle = runner.submit(pipeline, Params::new()).await?;
    handle.wait().await;

    assert!(handle.reporter.succeeded());
    assert_eq!(entries(&log), vec!["first:-:-", "second:-:-"]);

    runner.shutdown().await;
    catalog.shutdown().await;
    Ok(())
}
