//! Shared topology used across crate tests

/// Broker, sensor, camera and router on the physical side, each mirrored by a
/// twin on 10.10.0.0/24. The camera has no management login, so it is never
/// an enforcer.
pub const SAMPLE_TOPOLOGY: &str = r#"
monitor:
  check_interval_seconds: 10
mqtt:
  host: 192.168.20.2
orchestrator:
  url: http://10.10.0.254:3080/v2
  project_id: 6f1b2a9e-lab
  user: admin
  password: admin
devices:
  broker:
    type: broker
    physical: 192.168.20.2
    digital: 10.10.0.2
    credentials: { user: pi, password: raspberry }
    node_id: node-broker
    peers: [sensor]
  sensor:
    type: sensor
    physical: 192.168.20.3
    digital: 10.10.0.3
    credentials: { user: pi, password: raspberry }
    node_id: node-sensor
    peers:
      - broker
      - name: router
        fallback_topic: sensors/physical/data
  ipcam:
    type: camera
    physical: 192.168.20.4
    digital: 10.10.0.4
    node_id: node-cam
    peers: [broker]
  router:
    type: router
    physical: 192.168.20.1
    digital: 10.10.0.1
    credentials: { user: admin, password: cisco, enable_password: class }
    physical_credentials: { user: admin, password: cisco, enable_password: class }
    node_id: node-router
    peers:
      - sensor
      - name: ipcam
        rtsp_url: rtsp://192.168.20.4:554/stream1
"#;
