//! Turning an approved plan source into a training plan.

use std::collections::HashMap;

use anyhow::anyhow;

use crate::plan::{PlanError, TrainingPlan};

/// Instantiates training plans.
pub trait PlanLoader: Send + Sync {
    /// Instantiates the plan of class `class` from its `source`.
    ///
    /// # Errors
    /// Fails if the class is unknown or the source is invalid for it.
    fn load(&self, class: &str, source: &str) -> Result<Box<dyn TrainingPlan>, PlanError>;
}

type PlanFactory = Box<dyn Fn(&str) -> Result<Box<dyn TrainingPlan>, PlanError> + Send + Sync>;

/// A plan loader resolving plan classes through a table of factories.
///
/// Only classes registered on the node can ever be instantiated. The plan source parametrizes the
/// instance.
#[derive(Default)]
pub struct RegistryLoader {
    factories: HashMap<String, PlanFactory>,
}

impl RegistryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory for a plan class.
    pub fn register<F>(mut self, class: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&str) -> Result<Box<dyn TrainingPlan>, PlanError> + Send + Sync + 'static,
    {
        self.factories.insert(class.into(), Box::new(factory));
        self
    }

    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

impl PlanLoader for RegistryLoader {
    fn load(&self, class: &str, source: &str) -> Result<Box<dyn TrainingPlan>, PlanError> {
        let factory = self
            .factories
            .get(class)
            .ok_or_else(|| anyhow!("unknown training plan class {}", class))?;
        factory(source)
    }
}
