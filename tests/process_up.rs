//! Bring a small project up with host processes

use keel::compose::{ComposeOrchestrator, ConfigLoader, ProfileSelector, VariableSnapshot};
use keel::container::ProcessRuntime;
use keel::provision::Provisioner;
use keel::supervisor::{ServiceState, Supervisor, SupervisorConfig};
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

const COMPOSE: &str = r#"
name: pipeline

services:
  setup:
    image: busybox
    command: ["/bin/sh", "-c", "echo $${GREETING} > \"$$KEEL_MOUNT_DATA/flag\""]
    environment:
      GREETING: ${GREETING:-hello}
    volumes: ["shared:/data"]

  worker:
    image: busybox
    command: /bin/sh -c 'test -f "$$KEEL_MOUNT_DATA/flag" && exec sleep 30'
    volumes: ["shared:/data"]
    depends_on:
      setup:
        condition: service_completed_successfully

  broken:
    image: busybox
    command: ["/bin/sh", "-c", "exit 7"]
    restart: on-failure:1

  tools:
    image: busybox
    command: ["/bin/sh", "-c", "sleep 30"]
    profiles: [tools]

volumes:
  shared:
"#;

#[tokio::test]
async fn test_up_with_process_runtime() {
    let project_dir = tempdir().unwrap();
    let data_dir = tempdir().unwrap();
    let compose = project_dir.path().join("compose.yaml");
    std::fs::write(&compose, COMPOSE).unwrap();

    let vars = VariableSnapshot::from_pairs([("GREETING", "ahoy")]);
    let project = ConfigLoader::new(project_dir.path())
        .load_files(&[compose], &vars)
        .unwrap();
    assert_eq!(project.name, "pipeline");

    let supervisor = Supervisor::new(
        Arc::new(ProcessRuntime::new()),
        SupervisorConfig {
            start_timeout: Duration::from_secs(5),
            dependency_timeout: Some(Duration::from_secs(10)),
            restart_delay: Duration::from_millis(10),
        },
    );
    let orchestrator = ComposeOrchestrator::new(
        &project,
        &ProfileSelector::from_args(&[], &vars),
        Provisioner::new(data_dir.path()).unwrap(),
        supervisor,
    )
    .unwrap();
    assert_eq!(orchestrator.graph().start_order(), ["broken", "setup", "worker"]);

    let deployment = orchestrator.up().unwrap();

    let worker = deployment
        .wait_for(
            "worker",
            |s| s.state == ServiceState::Running || s.settled,
            Duration::from_secs(10),
        )
        .await
        .unwrap();
    assert_eq!(worker.state, ServiceState::Running);

    let setup = deployment.status("setup").unwrap();
    assert!(setup.completed_successfully);
    let flag = orchestrator
        .provisioner()
        .volume_path(orchestrator.project(), "shared")
        .unwrap()
        .join("flag");
    assert_eq!(std::fs::read_to_string(flag).unwrap().trim(), "ahoy");

    let broken = deployment
        .wait_for("broken", |s| s.settled, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(broken.state, ServiceState::Exited { code: 7 });
    assert_eq!(broken.attempts, 2);
    assert!(deployment.status("tools").is_err());

    orchestrator.down(Some(deployment), true).await.unwrap();
    assert!(orchestrator
        .provisioner()
        .volumes()
        .list()
        .unwrap()
        .is_empty());
}
