//! Compose project orchestration
//!
//! Ties the pipeline together: profile selection, dependency ordering,
//! port checks, provisioning and finally supervision.

use super::graph::DependencyGraph;
use super::model::{Project, Service};
use super::profile::ProfileSelector;
use crate::container::ContainerConfig;
use crate::error::Result;
use crate::provision::{ProvisionAction, ProvisionReport, Provisioner};
use crate::supervisor::{check_port_conflicts, Deployment, ServicePlan, Supervisor};

/// Label naming the project a container belongs to
pub const PROJECT_LABEL: &str = "com.docker.compose.project";
/// Label naming the service a container runs
pub const SERVICE_LABEL: &str = "com.docker.compose.service";

/// Compose orchestrator
pub struct ComposeOrchestrator {
    /// Project restricted to the active profiles
    project: Project,
    /// Dependency graph of the selected services
    graph: DependencyGraph,
    /// Network and volume provisioning
    provisioner: Provisioner,
    /// Service supervision
    supervisor: Supervisor,
}

impl ComposeOrchestrator {
    /// Select, order and check a loaded project.
    ///
    /// Nothing is created yet; every error here aborts before any side effect.
    pub fn new(
        project: &Project,
        profiles: &ProfileSelector,
        provisioner: Provisioner,
        supervisor: Supervisor,
    ) -> Result<Self> {
        let project = profiles.select(project);
        let graph = DependencyGraph::build(&project.services)?;
        check_port_conflicts(project.services.values())?;

        Ok(Self {
            project,
            graph,
            provisioner,
            supervisor,
        })
    }

    /// The selected project
    pub fn project(&self) -> &Project {
        &self.project
    }

    /// Dependency graph of the selected services
    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// Provisioner used for networks and volumes
    pub fn provisioner(&self) -> &Provisioner {
        &self.provisioner
    }

    /// Supervisor running the services
    pub fn supervisor(&self) -> &Supervisor {
        &self.supervisor
    }

    /// Provision infrastructure and launch every selected service
    pub fn up(&self) -> Result<Deployment> {
        tracing::info!("Starting compose project: {}", self.project.name);

        let report = self.provisioner.provision(&self.project)?;
        log_report(&report);

        let plans = match self.plans() {
            Ok(plans) => plans,
            Err(e) => {
                self.detach_all();
                return Err(e);
            }
        };

        self.supervisor.launch(plans, &self.graph).inspect_err(|_| self.detach_all())
    }

    /// Stop a deployment and remove the project's networks, and volumes if asked
    pub async fn down(&self, deployment: Option<Deployment>, remove_volumes: bool) -> Result<()> {
        tracing::info!("Stopping compose project: {}", self.project.name);

        if let Some(mut deployment) = deployment {
            deployment.shutdown().await?;
        }

        self.detach_all();
        self.provisioner.teardown(&self.project, remove_volumes)
    }

    fn plans(&self) -> Result<Vec<ServicePlan>> {
        self.graph
            .start_order()
            .iter()
            .map(|name| {
                let service = self.project.service(name)?;
                Ok(ServicePlan {
                    container: self.service_to_container_config(service)?,
                    service: service.clone(),
                })
            })
            .collect()
    }

    fn detach_all(&self) {
        for service in self.project.services.values() {
            if let Err(e) = self.provisioner.detach(&self.project, service) {
                tracing::warn!("Failed to detach {}: {}", service.name, e);
            }
        }
    }

    /// Convert a service to the configuration of its container
    fn service_to_container_config(&self, service: &Service) -> Result<ContainerConfig> {
        let name = self.project.container_name(service);
        let image = service
            .image
            .clone()
            .unwrap_or_else(|| format!("{}-{}:latest", self.project.name, service.name));

        let mut config = ContainerConfig::new(&name, &image)
            .service(&service.name)
            .cmd(service.argv())
            .label(PROJECT_LABEL, &self.project.name)
            .label(SERVICE_LABEL, &service.name);

        config.env = service.environment.clone();
        config.working_dir = service.working_dir.as_ref().map(Into::into);
        config.user = service.user.clone();
        if let Some(hostname) = &service.hostname {
            config.hostname = hostname.clone();
        }
        config.ports = service.ports.clone();
        config.devices = service.devices.clone();
        config.cpus = service.cpus;
        if let Some(grace) = service.stop_grace_period {
            config.stop_grace_period = grace;
        }
        config.labels.extend(service.labels.clone());

        config.mounts = self.provisioner.mounts(&self.project, service)?;
        config.networks = self.provisioner.attach(&self.project, service)?;

        Ok(config)
    }
}

fn log_report(report: &ProvisionReport) {
    for (kind, outcomes) in [("network", &report.networks), ("volume", &report.volumes)] {
        for outcome in outcomes {
            match outcome.action {
                ProvisionAction::Created => tracing::info!("Created {} {}", kind, outcome.name),
                ProvisionAction::Unchanged => tracing::debug!("Reusing {} {}", kind, outcome.name),
                ProvisionAction::External => {
                    tracing::debug!("Using external {} {}", kind, outcome.name)
                }
            }
        }
    }
}
