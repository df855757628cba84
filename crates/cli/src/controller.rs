//! Wiring of the reconciler into the kube runtime.
//!
//! The runtime controller only sees stacks that exist, so a separate watcher
//! forwards deletions to the reconciler, which then uninstalls. Deletions
//! missed while the watch was down show up as installed stacks absent from
//! the relist.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use kube::{
    runtime::{
        controller::{Action, Controller},
        watcher, WatchStreamExt,
    },
    Api, Client,
};
use rudder_api::ServingStack;
use rudder_core::{Error, ObjectKey};
use rudder_reconcile::{Outcome, Reconciler};
use tracing::{debug, error, info, warn};

const ERROR_REQUEUE: Duration = Duration::from_secs(5);
const UNINSTALL_ATTEMPTS: usize = 5;

fn scoped<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
    <K as kube::Resource>::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

fn action_for(outcome: Outcome, requeue_after: Duration) -> Action {
    match outcome.requeue(requeue_after) {
        Some(after) => Action::requeue(after),
        None => Action::await_change(),
    }
}

async fn reconcile(stack: Arc<ServingStack>, ctx: Arc<Reconciler>) -> Result<Action, Error> {
    let outcome = ctx.reconcile(&stack.key()).await?;
    Ok(action_for(outcome, ctx.config().requeue_after))
}

fn error_policy(stack: Arc<ServingStack>, error: &Error, _ctx: Arc<Reconciler>) -> Action {
    warn!(stack = %stack.key(), error = %error, "reconcile failed, requeueing");
    Action::requeue(ERROR_REQUEUE)
}

/// Installed stacks missing from a full relist.
fn vanished(installed: Vec<ObjectKey>, listed: &[ServingStack]) -> Vec<ObjectKey> {
    let present: Vec<ObjectKey> = listed.iter().map(ServingStack::key).collect();
    installed.into_iter().filter(|k| !present.contains(k)).collect()
}

/// Reconcile a deleted stack until its resources are gone or attempts run out.
async fn uninstall(reconciler: &Reconciler, key: &ObjectKey) {
    for attempt in 1..=UNINSTALL_ATTEMPTS {
        match reconciler.reconcile(key).await {
            Ok(_) => break,
            Err(e) if attempt < UNINSTALL_ATTEMPTS => {
                warn!(stack = %key, attempt, error = %e, "uninstall failed, retrying");
                tokio::time::sleep(ERROR_REQUEUE).await;
            }
            Err(e) => error!(stack = %key, error = %e, "giving up on uninstall"),
        }
    }
}

async fn watch_deletions(api: Api<ServingStack>, reconciler: Arc<Reconciler>) {
    let mut events = watcher(api, watcher::Config::default()).default_backoff().boxed();
    while let Some(event) = events.next().await {
        let gone = match event {
            Ok(watcher::Event::Deleted(stack)) => vec![stack.key()],
            Ok(watcher::Event::Restarted(stacks)) => vanished(reconciler.installed_keys(), &stacks),
            Ok(watcher::Event::Applied(_)) => continue,
            Err(e) => {
                warn!(error = %e, "stack watch error");
                continue;
            }
        };
        for key in gone {
            uninstall(&reconciler, &key).await;
        }
    }
}

/// Run the controller and the deletion watcher until a shutdown signal.
pub async fn run(client: Client, namespace: Option<&str>, reconciler: Arc<Reconciler>) {
    let stacks: Api<ServingStack> = scoped(client.clone(), namespace);
    let deployments: Api<Deployment> = scoped(client, namespace);

    let deletions = tokio::spawn(watch_deletions(stacks.clone(), reconciler.clone()));

    Controller::new(stacks, watcher::Config::default())
        .owns(deployments, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, reconciler)
        .for_each(|res| async move {
            match res {
                Ok((obj, _)) => debug!(stack = %obj.name, "reconciled"),
                Err(e) => debug!(error = %e, "controller event"),
            }
        })
        .await;

    deletions.abort();
    info!("controller shut down");
}
