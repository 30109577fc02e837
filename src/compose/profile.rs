//! Profile selection

use super::environment::VariableSnapshot;
use super::model::Project;
use std::collections::BTreeSet;

/// Variable listing active profiles, comma separated
pub const PROFILES_VAR: &str = "COMPOSE_PROFILES";

/// Profile that activates every other profile
pub const ALL_PROFILES: &str = "*";

/// Decides which services take part in a run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileSelector {
    active: BTreeSet<String>,
}

impl ProfileSelector {
    /// Create a selector for the given active profiles
    pub fn new<I, S>(active: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            active: active
                .into_iter()
                .map(Into::into)
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    /// Use `explicit` when non-empty, otherwise fall back to `COMPOSE_PROFILES`
    pub fn from_args(explicit: &[String], vars: &VariableSnapshot) -> Self {
        if !explicit.is_empty() {
            return Self::new(explicit.iter().cloned());
        }
        Self::new(vars.get(PROFILES_VAR).unwrap_or_default().split(','))
    }

    /// Active profile names
    pub fn active(&self) -> &BTreeSet<String> {
        &self.active
    }

    /// Whether a service with these profiles takes part in the run
    pub fn includes(&self, profiles: &BTreeSet<String>) -> bool {
        profiles.is_empty()
            || self.active.contains(ALL_PROFILES)
            || !profiles.is_disjoint(&self.active)
    }

    /// Return the project restricted to the selected services.
    ///
    /// Networks and volumes are kept as declared; only what the remaining
    /// services use gets provisioned.
    pub fn select(&self, project: &Project) -> Project {
        let mut selected = project.clone();
        selected
            .services
            .retain(|_, service| self.includes(&service.profiles));

        let excluded: Vec<&String> = project
            .services
            .keys()
            .filter(|name| !selected.services.contains_key(*name))
            .collect();
        if !excluded.is_empty() {
            tracing::debug!(
                "Profiles {:?} exclude services {:?}",
                self.active,
                excluded
            );
        }

        selected
    }
}
