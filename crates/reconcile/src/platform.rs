//! Platform transform providers.
//!
//! A platform turns the desired-state object into an ordered list of
//! manifest transformers. Platforms are consulted in registration order and
//! their lists are concatenated.

use kube::Resource as _;
use rudder_api::ServingStack;
use rudder_apply::{config_maps, images, inject_namespace, inject_owner, Transformer};
use rudder_core::Result;

pub trait Platform: Send + Sync {
    fn name(&self) -> &str;
    fn transformers(&self, stack: &ServingStack) -> Result<Vec<Transformer>>;
}

/// Transformers every installation needs: namespace, owner, config map
/// overrides and image overrides.
pub struct Common;

impl Platform for Common {
    fn name(&self) -> &str {
        "common"
    }

    fn transformers(&self, stack: &ServingStack) -> Result<Vec<Transformer>> {
        let key = stack.key();
        let mut out = vec![inject_namespace(key.namespace.clone())];
        if let Some(owner) = stack.controller_owner_ref(&()) {
            out.push(inject_owner(owner, key.namespace));
        }
        if !stack.spec.config.is_empty() {
            out.push(config_maps(stack.spec.config.clone()));
        }
        if let Some(reg) = &stack.spec.registry {
            out.push(images(
                reg.default.clone(),
                reg.override_.clone(),
                reg.image_pull_secrets.iter().map(|s| s.name.clone()).collect(),
            ));
        }
        Ok(out)
    }
}

#[derive(Default)]
pub struct Platforms {
    platforms: Vec<Box<dyn Platform>>,
}

impl Platforms {
    pub fn new() -> Self {
        Self::default()
    }

    /// Only the common transformers.
    pub fn common() -> Self {
        Self::new().with(Common)
    }

    pub fn with(mut self, platform: impl Platform + 'static) -> Self {
        self.platforms.push(Box::new(platform));
        self
    }

    pub fn names(&self) -> Vec<&str> {
        self.platforms.iter().map(|p| p.name()).collect()
    }

    pub fn transformers(&self, stack: &ServingStack) -> Result<Vec<Transformer>> {
        let mut out = Vec::new();
        for p in &self.platforms {
            out.extend(p.transformers(stack)?);
        }
        Ok(out)
    }
}
