//! Tests for task/executor descriptions and their serialization.

use stevedore::{
    CommandInfo, ContainerId, ExecutorInfo, ImageInfo, ResourceStatistics, Resources, TaskInfo,
    Termination,
};

// =============================================================================
// ContainerId
// =============================================================================

#[test]
fn test_container_id_display_and_serde() {
    let id = ContainerId::from("c1");
    assert_eq!(format!("{}", id), "c1");
    assert_eq!(id.as_str(), "c1");

    // Transparent serialization: ids are plain JSON strings.
    assert_eq!(serde_json::to_string(&id).unwrap(), "\"c1\"");
    let back: ContainerId = serde_json::from_str("\"c1\"").unwrap();
    assert_eq!(back, id);
}

// =============================================================================
// Image Recognition
// =============================================================================

#[test]
fn test_docker_image_extraction() {
    let mut command = CommandInfo::shell("echo hi");
    assert_eq!(command.docker_image(), None);

    command.container = Some(ImageInfo {
        image: "docker:///library/nginx:1.25".to_string(),
    });
    assert_eq!(command.docker_image(), Some("library/nginx:1.25"));
}

#[test]
fn test_unrecognized_schemes_are_not_ours() {
    for image in ["oci:///foo", "docker://foo", "http://example.com/img", ""] {
        let mut command = CommandInfo::shell("run");
        command.container = Some(ImageInfo {
            image: image.to_string(),
        });
        assert_eq!(command.docker_image(), None, "scheme {:?}", image);
    }
}

// =============================================================================
// Serialization
// =============================================================================

#[test]
fn test_task_info_deserializes_from_agent_json() {
    let task: TaskInfo = serde_json::from_str(
        r#"{
            "task_id": "t1",
            "command": {
                "value": "run",
                "container": {"image": "docker:///nginx"},
                "environment": {"KEY": "value"}
            },
            "resources": {"cpus": 1.0, "mem_bytes": 268435456}
        }"#,
    )
    .unwrap();

    assert_eq!(task.task_id, "t1");
    let command = task.command.unwrap();
    assert_eq!(command.docker_image(), Some("nginx"));
    assert_eq!(command.environment.get("KEY"), Some(&"value".to_string()));
    assert_eq!(task.resources.cpus, Some(1.0));
    assert_eq!(task.resources.mem_bytes, Some(256 * 1024 * 1024));
}

#[test]
fn test_executor_info_defaults_resources() {
    let executor: ExecutorInfo = serde_json::from_str(
        r#"{
            "executor_id": "e1",
            "framework_id": "f1",
            "command": {"value": "run-executor"}
        }"#,
    )
    .unwrap();

    assert!(executor.resources.is_empty());
    assert_eq!(executor.command.docker_image(), None);
}

#[test]
fn test_termination_omits_absent_status() {
    let termination = Termination {
        killed: true,
        status: None,
        message: "Docker task killed".to_string(),
    };

    let json = serde_json::to_value(&termination).unwrap();
    assert_eq!(json["killed"], true);
    assert!(json.get("status").is_none());
    assert_eq!(json["message"], "Docker task killed");
}

#[test]
fn test_resource_statistics_round_trip() {
    let statistics = ResourceStatistics {
        timestamp: 1_700_000_000.5,
        cpus_user_time_secs: 2.5,
        cpus_system_time_secs: 0.75,
        cpus_limit: Some(2.0),
        mem_rss_bytes: 64 * 1024 * 1024,
        mem_limit_bytes: Some(512 * 1024 * 1024),
        threads: Some(4),
    };

    let json = serde_json::to_string(&statistics).unwrap();
    let back: ResourceStatistics = serde_json::from_str(&json).unwrap();
    assert_eq!(back, statistics);
}

#[test]
fn test_resources_without_limits_serialize_compactly() {
    let json = serde_json::to_value(Resources::default()).unwrap();
    assert_eq!(json, serde_json::json!({}));
}
