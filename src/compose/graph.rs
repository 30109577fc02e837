//! Service dependency graph

use super::model::{DependencyCondition, Service};
use crate::error::{KeelError, Result};
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Directed graph of `depends_on` edges between the services of one run
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// service -> the services it depends on, with the condition to wait for
    dependencies: BTreeMap<String, BTreeMap<String, DependencyCondition>>,
    /// service -> the services depending on it
    dependents: BTreeMap<String, BTreeSet<String>>,
    /// Topological order, ties broken by name
    order: Vec<String>,
    /// Start levels; services within a level may start concurrently
    levels: Vec<Vec<String>>,
}

impl DependencyGraph {
    /// Build and check the graph
    pub fn build(services: &BTreeMap<String, Service>) -> Result<Self> {
        let mut dependencies = BTreeMap::new();
        let mut dependents: BTreeMap<String, BTreeSet<String>> = services
            .keys()
            .map(|name| (name.clone(), BTreeSet::new()))
            .collect();

        for (name, service) in services {
            for (dependency, condition) in &service.depends_on {
                let Some(reverse) = dependents.get_mut(dependency) else {
                    return Err(KeelError::UnknownDependency {
                        service: name.clone(),
                        dependency: dependency.clone(),
                    });
                };
                reverse.insert(name.clone());

                if *condition == DependencyCondition::Healthy
                    && services[dependency].healthcheck.is_none()
                {
                    return Err(KeelError::Parse(format!(
                        "service '{}' waits for '{}' to be healthy, but '{}' has no healthcheck",
                        name, dependency, dependency
                    )));
                }
            }
            dependencies.insert(name.clone(), service.depends_on.clone());
        }

        let mut graph = Self {
            dependencies,
            dependents,
            order: Vec::new(),
            levels: Vec::new(),
        };
        graph.sort()?;
        Ok(graph)
    }

    /// Kahn's algorithm, one level at a time
    fn sort(&mut self) -> Result<()> {
        let mut in_degree: BTreeMap<&str, usize> = self
            .dependencies
            .iter()
            .map(|(name, deps)| (name.as_str(), deps.len()))
            .collect();

        let mut ready: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(name, _)| *name)
            .collect();

        let mut order = Vec::with_capacity(in_degree.len());
        let mut levels = Vec::new();

        while !ready.is_empty() {
            let level: Vec<&str> = ready.drain(..).collect();
            let mut next = BTreeSet::new();

            for name in &level {
                for dependent in &self.dependents[*name] {
                    if let Some(degree) = in_degree.get_mut(dependent.as_str()) {
                        *degree -= 1;
                        if *degree == 0 {
                            next.insert(dependent.as_str());
                        }
                    }
                }
            }

            order.extend(level.iter().map(|s| s.to_string()));
            levels.push(level.iter().map(|s| s.to_string()).collect());
            ready.extend(next);
        }

        if order.len() < self.dependencies.len() {
            let blocked: BTreeSet<&str> = in_degree
                .iter()
                .filter(|(_, degree)| **degree > 0)
                .map(|(name, _)| *name)
                .collect();
            return Err(KeelError::CyclicDependency {
                members: self.find_cycle(&blocked),
            });
        }

        self.order = order;
        self.levels = levels;
        Ok(())
    }

    /// Walk dependency edges inside the blocked set until a service repeats
    fn find_cycle(&self, blocked: &BTreeSet<&str>) -> Vec<String> {
        let Some(start) = blocked.iter().next() else {
            return Vec::new();
        };

        let mut path: Vec<&str> = Vec::new();
        let mut current = *start;
        loop {
            if let Some(position) = path.iter().position(|s| *s == current) {
                let mut members: Vec<String> =
                    path[position..].iter().map(|s| s.to_string()).collect();
                members.sort();
                return members;
            }
            path.push(current);

            // every blocked service has at least one blocked dependency
            let next = self.dependencies[current]
                .keys()
                .map(|s| s.as_str())
                .find(|dep| blocked.contains(dep));
            match next {
                Some(next) => current = next,
                None => return blocked.iter().map(|s| s.to_string()).collect(),
            }
        }
    }

    /// Services in a valid start order
    pub fn start_order(&self) -> &[String] {
        &self.order
    }

    /// Services grouped by start level
    pub fn levels(&self) -> &[Vec<String>] {
        &self.levels
    }

    /// Direct dependencies of a service with their conditions
    pub fn dependencies(&self, name: &str) -> Result<&BTreeMap<String, DependencyCondition>> {
        self.dependencies
            .get(name)
            .ok_or_else(|| KeelError::ServiceNotFound(name.to_string()))
    }

    /// Services depending directly on `name`
    pub fn dependents(&self, name: &str) -> Result<&BTreeSet<String>> {
        self.dependents
            .get(name)
            .ok_or_else(|| KeelError::ServiceNotFound(name.to_string()))
    }

    /// Every service that directly or indirectly depends on `name`
    pub fn transitive_dependents(&self, name: &str) -> Result<BTreeSet<String>> {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<&str> = self.dependents(name)?.iter().map(|s| s.as_str()).collect();

        while let Some(current) = queue.pop_front() {
            if seen.insert(current.to_string()) {
                queue.extend(self.dependents[current].iter().map(|s| s.as_str()));
            }
        }
        Ok(seen)
    }

    /// Number of services in the graph
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the graph has no services
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compose::model::HealthCheck;

    fn services(list: Vec<Service>) -> BTreeMap<String, Service> {
        list.into_iter().map(|s| (s.name.clone(), s)).collect()
    }

    #[test]
    fn test_start_order() {
        let graph = DependencyGraph::build(&services(vec![
            Service::new("web", "nginx").depends_on("api"),
            Service::new("api", "node").depends_on("db"),
            Service::new("db", "postgres"),
        ]))
        .unwrap();

        assert_eq!(graph.start_order(), ["db", "api", "web"]);
    }

    #[test]
    fn test_every_service_after_its_dependencies() {
        let graph = DependencyGraph::build(&services(vec![
            Service::new("compute", "node")
                .depends_on("ollama")
                .depends_on("relay"),
            Service::new("relay", "waku").depends_on("postgres"),
            Service::new("ollama", "ollama"),
            Service::new("postgres", "postgres"),
            Service::new("monitor", "grafana").depends_on("compute"),
        ]))
        .unwrap();

        let order = graph.start_order();
        let position = |name: &str| order.iter().position(|s| s == name).unwrap();
        for name in order {
            for dependency in graph.dependencies(name).unwrap().keys() {
                assert!(position(dependency) < position(name));
            }
        }
    }

    #[test]
    fn test_levels_group_independent_services() {
        let graph = DependencyGraph::build(&services(vec![
            Service::new("a", "x"),
            Service::new("b", "x").depends_on("a"),
            Service::new("c", "x"),
            Service::new("d", "x").depends_on("b").depends_on("c"),
        ]))
        .unwrap();

        assert_eq!(
            graph.levels(),
            [vec!["a", "c"], vec!["b"], vec!["d"]]
                .map(|l| l.into_iter().map(String::from).collect::<Vec<_>>())
        );
    }

    #[test]
    fn test_cycle_names_members() {
        let err = DependencyGraph::build(&services(vec![
            Service::new("a", "x").depends_on("b"),
            Service::new("b", "x").depends_on("a"),
            Service::new("c", "x"),
        ]))
        .unwrap_err();

        match err {
            KeelError::CyclicDependency { members } => assert_eq!(members, vec!["a", "b"]),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_cycle_excludes_blocked_bystanders() {
        let err = DependencyGraph::build(&services(vec![
            Service::new("a", "x").depends_on("b"),
            Service::new("b", "x").depends_on("c"),
            Service::new("c", "x").depends_on("b"),
        ]))
        .unwrap_err();

        match err {
            KeelError::CyclicDependency { members } => assert_eq!(members, vec!["b", "c"]),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let err = DependencyGraph::build(&services(vec![Service::new("a", "x").depends_on("a")]))
            .unwrap_err();
        assert!(matches!(err, KeelError::CyclicDependency { members } if members == vec!["a"]));
    }

    #[test]
    fn test_unknown_dependency() {
        let err = DependencyGraph::build(&services(vec![Service::new("a", "x").depends_on("ghost")]))
            .unwrap_err();
        match err {
            KeelError::UnknownDependency {
                service,
                dependency,
            } => {
                assert_eq!(service, "a");
                assert_eq!(dependency, "ghost");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_healthy_condition_needs_a_healthcheck() {
        let mut api = Service::new("api", "x");
        api.depends_on
            .insert("db".to_string(), DependencyCondition::Healthy);

        let err = DependencyGraph::build(&services(vec![api.clone(), Service::new("db", "x")]))
            .unwrap_err();
        assert!(matches!(err, KeelError::Parse(ref m) if m.contains("no healthcheck")));

        let mut db = Service::new("db", "x");
        db.healthcheck = Some(HealthCheck::command(&["pg_isready"]));
        assert!(DependencyGraph::build(&services(vec![api, db])).is_ok());
    }

    #[test]
    fn test_transitive_dependents() {
        let graph = DependencyGraph::build(&services(vec![
            Service::new("db", "x"),
            Service::new("api", "x").depends_on("db"),
            Service::new("web", "x").depends_on("api"),
            Service::new("cron", "x"),
        ]))
        .unwrap();

        let affected = graph.transitive_dependents("db").unwrap();
        assert_eq!(
            affected.into_iter().collect::<Vec<_>>(),
            vec!["api".to_string(), "web".to_string()]
        );
        assert!(graph.transitive_dependents("cron").unwrap().is_empty());
        assert!(graph.dependents("ghost").is_err());
    }
}
