//! Type-string registries for steps, facilitators, advisers and resolvers.
//!
//! Populated by explicit registration at startup; lookups of unknown types
//! fail with the matching [`EngineError`] variant.

use crate::adviser::{Adviser, NextStepAdviser, OnFailAdviser, OnSuccessAdviser, RetryAdviser};
use crate::error::EngineError;
use crate::facilitator::{Facilitator, ModeFacilitator};
use crate::remote::{ModuleLink, RemoteAdviser, RemoteFacilitator};
use crate::resolver::{OutcomeResolver, Resolver};
use crate::step::{ForkStep, NoopStep, SectionStep, Step};
use crate::store::ExecutionStore;
use crate::types::{ExecutionMode, OUTCOME_REF_TYPE};
use std::collections::BTreeMap;
use std::sync::Arc;

pub struct Registry<T: Clone> {
    entries: BTreeMap<String, T>,
    missing: fn(String) -> EngineError,
}

impl<T: Clone> Registry<T> {
    pub fn new(missing: fn(String) -> EngineError) -> Self {
        Self {
            entries: BTreeMap::new(),
            missing,
        }
    }

    /// Register `entry` under `name`, replacing any previous registration.
    pub fn register(&mut self, name: impl Into<String>, entry: T) -> &mut Self {
        let name = name.into();
        tracing::debug!(name = %name, "Registered");
        self.entries.insert(name, entry);
        self
    }

    pub fn get(&self, name: &str) -> Option<T> {
        self.entries.get(name).cloned()
    }

    /// Like [`Registry::get`], failing with the registry's unknown-type error.
    pub fn obtain(&self, name: &str) -> Result<T, EngineError> {
        self.get(name).ok_or_else(|| (self.missing)(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }
}

/// A step is either linked into this process or hosted by a remote module.
#[derive(Clone)]
pub enum StepBinding {
    Local(Arc<dyn Step>),
    Remote(Arc<ModuleLink>),
}

pub type StepRegistry = Registry<StepBinding>;
pub type FacilitatorRegistry = Registry<Arc<dyn Facilitator>>;
pub type AdviserRegistry = Registry<Arc<dyn Adviser>>;
pub type ResolverRegistry = Registry<Arc<dyn Resolver>>;

impl Registry<StepBinding> {
    pub fn register_local(&mut self, name: impl Into<String>, step: Arc<dyn Step>) -> &mut Self {
        self.register(name, StepBinding::Local(step))
    }

    pub fn register_remote(&mut self, name: impl Into<String>, link: Arc<ModuleLink>) -> &mut Self {
        self.register(name, StepBinding::Remote(link))
    }
}

/// The four registries the engine consults, plus the remote modules their
/// remote entries point at.
pub struct Registries {
    pub steps: StepRegistry,
    pub facilitators: FacilitatorRegistry,
    pub advisers: AdviserRegistry,
    pub resolvers: ResolverRegistry,
    modules: BTreeMap<String, Arc<ModuleLink>>,
}

impl Registries {
    pub fn empty() -> Self {
        Self {
            steps: Registry::new(EngineError::UnknownStep),
            facilitators: Registry::new(EngineError::UnknownFacilitator),
            advisers: Registry::new(EngineError::UnknownAdviser),
            resolvers: Registry::new(EngineError::UnknownResolver),
            modules: BTreeMap::new(),
        }
    }

    /// Bind a remote module: its steps, facilitators and advisers are
    /// registered under the given type names and proxied through `link`.
    pub fn register_module(
        &mut self,
        link: Arc<ModuleLink>,
        steps: &[&str],
        facilitators: &[&str],
        advisers: &[&str],
    ) -> &mut Self {
        for name in steps {
            self.steps.register_remote(*name, link.clone());
        }
        for name in facilitators {
            self.facilitators.register(
                *name,
                Arc::new(RemoteFacilitator::new(link.clone(), *name)) as Arc<dyn Facilitator>,
            );
        }
        for name in advisers {
            self.advisers.register(
                *name,
                Arc::new(RemoteAdviser::new(link.clone(), *name)) as Arc<dyn Adviser>,
            );
        }
        tracing::info!(module = %link.name(), "Remote module registered");
        self.modules.insert(link.name().to_string(), link);
        self
    }

    pub fn modules(&self) -> impl Iterator<Item = &Arc<ModuleLink>> {
        self.modules.values()
    }

    /// Registries holding the built-in steps, facilitators, advisers and the
    /// outcome resolver backed by `store`.
    pub fn with_defaults(store: Arc<dyn ExecutionStore>) -> Self {
        let mut r = Self::empty();
        r.steps
            .register_local("noop", Arc::new(NoopStep))
            .register_local("section", Arc::new(SectionStep))
            .register_local("fork", Arc::new(ForkStep));
        for (name, mode) in [
            ("sync", ExecutionMode::Sync),
            ("async", ExecutionMode::Async),
            ("task", ExecutionMode::Task),
            ("child", ExecutionMode::Child),
            ("children", ExecutionMode::Children),
        ] {
            r.facilitators
                .register(name, Arc::new(ModeFacilitator::new(mode)) as Arc<dyn Facilitator>);
        }
        r.advisers
            .register("on_success", Arc::new(OnSuccessAdviser) as Arc<dyn Adviser>)
            .register("on_fail", Arc::new(OnFailAdviser) as Arc<dyn Adviser>)
            .register("next_step", Arc::new(NextStepAdviser) as Arc<dyn Adviser>)
            .register("retry", Arc::new(RetryAdviser) as Arc<dyn Adviser>);
        r.resolvers.register(
            OUTCOME_REF_TYPE,
            Arc::new(OutcomeResolver::new(store)) as Arc<dyn Resolver>,
        );
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store_memory::MemoryStore;

    #[test]
    fn test_defaults_registered() {
        let r = Registries::with_defaults(Arc::new(MemoryStore::new()));
        assert!(r.steps.contains("fork"));
        assert_eq!(
            r.facilitators.names(),
            vec!["async", "child", "children", "sync", "task"]
        );
        assert!(r.advisers.contains("retry"));
        assert!(r.resolvers.contains(OUTCOME_REF_TYPE));
    }

    #[test]
    fn test_obtain_unknown_reports_kind() {
        let r = Registries::empty();
        let err = r.advisers.obtain("oracle").err().unwrap();
        assert!(matches!(err, EngineError::UnknownAdviser(ref name) if name == "oracle"));
        assert!(r.steps.obtain("x").is_err());
    }

    struct Silent;

    #[async_trait::async_trait]
    impl crate::protocol::ModuleChannel for Silent {
        async fn send(&self, _event: crate::protocol::ModuleEvent) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_register_module_binds_all_roles() {
        let mut r = Registries::empty();
        let link = Arc::new(ModuleLink::new(
            "billing",
            Arc::new(Silent),
            std::time::Duration::from_secs(1),
        ));
        r.register_module(link, &["charge"], &["billing_mode"], &["billing_next"]);
        assert!(matches!(r.steps.get("charge"), Some(StepBinding::Remote(_))));
        assert!(r.facilitators.contains("billing_mode"));
        assert!(r.advisers.contains("billing_next"));
        assert_eq!(r.modules().count(), 1);
    }
}
