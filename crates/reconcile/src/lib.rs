//! Rudder reconciliation pipeline.
//!
//! [`Reconciler::reconcile`] brings the cluster in line with one
//! `ServingStack`: it initializes the status, installs the transformed
//! manifest, aggregates deployment readiness and prunes resources of earlier
//! releases. When the stack is gone it deletes everything it installed.
//!
//! Invocations for the same stack never overlap; callers may trigger them
//! from several places at once.

#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use rudder_api::ServingStack;
use rudder_apply::{inject_namespace, Manifest};
use rudder_core::{ObjectKey, Result};
use rudder_kubehub::Hub;
use rustc_hash::FxHashMap;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info};

mod obsolete;
mod platform;
mod readiness;
mod status;

pub use obsolete::{delete_obsolete, ObsoleteNamespace, ObsoleteResource, OBSOLETE_RESOURCES};
pub use platform::{Common, Platform, Platforms};
pub use readiness::{check_deployments, deployment_available, WORKLOAD_KIND};
pub use status::{update_status, MAX_STATUS_ATTEMPTS};

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Version recorded in the status after a successful install
    pub version: String,
    /// Delay before a stack that is not ready yet is looked at again
    pub requeue_after: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            version: format!("v{}", env!("CARGO_PKG_VERSION")),
            requeue_after: Duration::from_secs(30),
        }
    }
}

/// Result of one successful invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Reconciled { ready: bool },
    /// The stack no longer exists and its resources were removed
    Uninstalled,
}

impl Outcome {
    /// Delay after which the trigger should run again, if any.
    pub fn requeue(&self, after: Duration) -> Option<Duration> {
        match self {
            Self::Reconciled { ready: false } => Some(after),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    InitStatus,
    Install,
    CheckDeployments,
    DeleteObsolete,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InitStatus => "init_status",
            Self::Install => "install",
            Self::CheckDeployments => "check_deployments",
            Self::DeleteObsolete => "delete_obsolete",
        }
    }
}

/// Stages of a reconciliation, in execution order.
pub const STAGES: [Stage; 4] = [Stage::InitStatus, Stage::Install, Stage::CheckDeployments, Stage::DeleteObsolete];

/// State threaded through the stages of one invocation.
struct Context {
    stack: ServingStack,
    manifest: Manifest,
}

pub struct Reconciler {
    hub: Arc<dyn Hub>,
    template: Arc<Manifest>,
    platforms: Platforms,
    config: ReconcilerConfig,
    /// Last transformed manifest per stack, used to uninstall
    applied: Mutex<FxHashMap<ObjectKey, Manifest>>,
    /// One lock per stack serializing invocations
    locks: Mutex<FxHashMap<ObjectKey, Arc<AsyncMutex<()>>>>,
}

impl Reconciler {
    pub fn new(hub: Arc<dyn Hub>, template: Arc<Manifest>, platforms: Platforms, config: ReconcilerConfig) -> Self {
        Self {
            hub,
            template,
            platforms,
            config,
            applied: Mutex::new(FxHashMap::default()),
            locks: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    fn applied(&self) -> MutexGuard<'_, FxHashMap<ObjectKey, Manifest>> {
        self.applied.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn locks(&self) -> MutexGuard<'_, FxHashMap<ObjectKey, Arc<AsyncMutex<()>>>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stacks this process installed and has not uninstalled yet.
    pub fn installed_keys(&self) -> Vec<ObjectKey> {
        let mut keys: Vec<_> = self.applied().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Reconcile the stack identified by `key`. Stages run in order and the
    /// first error stops the run; the caller is expected to retry.
    pub async fn reconcile(&self, key: &ObjectKey) -> Result<Outcome> {
        let t0 = Instant::now();
        counter!("reconcile_attempts", 1u64);
        let lock = self.locks().entry(key.clone()).or_default().clone();
        let guard = lock.lock().await;
        let res = self.run(key).await;
        if matches!(res, Ok(Outcome::Uninstalled)) {
            let mut locks = self.locks();
            // Only the map and this call hold it, so nobody is waiting
            if Arc::strong_count(&lock) == 2 {
                locks.remove(key);
            }
        }
        drop(guard);
        histogram!("reconcile_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match &res {
            Ok(outcome) => {
                counter!("reconcile_ok", 1u64);
                debug!(stack = %key, ?outcome, "reconciled");
            }
            Err(e) => {
                counter!("reconcile_err", 1u64);
                error!(stack = %key, error = %e, "reconcile failed");
            }
        }
        res
    }

    async fn run(&self, key: &ObjectKey) -> Result<Outcome> {
        let stack = match self.hub.get_stack(key).await {
            Ok(s) => s,
            Err(e) if e.is_not_found() => return self.uninstall(key).await,
            Err(e) => return Err(e),
        };
        let mut ctx = Context { stack, manifest: (*self.template).clone() };
        for stage in STAGES {
            debug!(stack = %key, stage = stage.as_str(), "running stage");
            match stage {
                Stage::InitStatus => self.init_status(&mut ctx).await?,
                Stage::Install => self.install(&mut ctx).await?,
                Stage::CheckDeployments => self.check_deployments(&mut ctx).await?,
                Stage::DeleteObsolete => self.delete_obsolete(&ctx).await?,
            }
        }
        Ok(Outcome::Reconciled { ready: ctx.stack.is_ready() })
    }

    /// Delete what was installed for `key`, in reverse manifest order.
    async fn uninstall(&self, key: &ObjectKey) -> Result<Outcome> {
        let cached = self.applied().get(key).cloned();
        let manifest = match cached {
            Some(m) => m,
            None => {
                let mut m = (*self.template).clone();
                m.transform(&[inject_namespace(key.namespace.clone())])?;
                m
            }
        };
        let deleted = manifest.delete_all(self.hub.as_ref()).await?;
        self.applied().remove(key);
        info!(stack = %key, deleted, "stack gone, resources removed");
        Ok(Outcome::Uninstalled)
    }

    async fn init_status(&self, ctx: &mut Context) -> Result<()> {
        if ctx.stack.status.as_ref().map(|s| !s.conditions.is_empty()).unwrap_or(false) {
            return Ok(());
        }
        ctx.stack.status_mut().initialize_conditions();
        update_status(self.hub.as_ref(), &mut ctx.stack).await
    }

    async fn install(&self, ctx: &mut Context) -> Result<()> {
        let key = ctx.stack.key();
        let transformers = self.platforms.transformers(&ctx.stack)?;
        ctx.manifest.transform(&transformers)?;
        self.applied().insert(key.clone(), ctx.manifest.clone());

        let result = ctx.manifest.apply_all(self.hub.as_ref()).await;
        let status = ctx.stack.status_mut();
        match &result {
            Ok(summary) => {
                status.mark_install_succeeded(self.config.version.clone());
                info!(stack = %key, version = %self.config.version, writes = summary.writes(), "install succeeded");
            }
            Err(e) => {
                status.mark_install_failed(e.to_string());
                error!(stack = %key, error = %e, "install failed");
            }
        }
        let persisted = update_status(self.hub.as_ref(), &mut ctx.stack).await;
        result.and(persisted)
    }

    async fn check_deployments(&self, ctx: &mut Context) -> Result<()> {
        let result = check_deployments(self.hub.as_ref(), &ctx.manifest, ctx.stack.status_mut()).await;
        let persisted = update_status(self.hub.as_ref(), &mut ctx.stack).await;
        result.and(persisted)
    }

    async fn delete_obsolete(&self, ctx: &Context) -> Result<()> {
        let deleted = delete_obsolete(self.hub.as_ref(), &ctx.stack.key().namespace).await?;
        if deleted > 0 {
            info!(stack = %ctx.stack.key(), deleted, "obsolete resources pruned");
        }
        Ok(())
    }
}
