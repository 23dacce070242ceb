// Copyright (c) Nettrace Contributors
// SPDX-License-Identifier: MIT

//! Supervisor lifecycle against the in-memory kernel: the watchdog notices
//! a dead worker and turns it into exit code 1.

use std::{fs, time::Duration};
use tokio::time::{sleep, timeout};
use nettrace::{
    config::ConfigStore,
    kernel::mock::MockKernel,
    supervisor::{Supervisor, SupervisorOpts},
};

#[tokio::test(flavor = "multi_thread")]
async fn dead_worker_escalates_to_exit_code_one() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("config.yml");
    fs::write(&config_path, "tcp_connect:\n  filters: []\n").unwrap();
    let output_path = dir.path().join("out.json");

    let kernel = MockKernel::new();
    let store = ConfigStore::load(&config_path).unwrap();
    let supervisor = Supervisor::new(
        kernel.clone(),
        store,
        SupervisorOpts {
            output_file: output_path.to_string_lossy().into_owned(),
            health_check_period: Duration::from_secs(1),
            lost_event_telemetry: None,
            watch_config: false,
        },
    );
    let run = tokio::spawn(supervisor.run());

    for _ in 0..500 {
        if kernel.is_loaded("tcp_connect") {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    // killing the event channel fails the worker's pump loop
    kernel.close_events("tcp_connect");

    let exit_code = timeout(Duration::from_secs(10), run)
        .await
        .expect("supervisor did not stop")
        .expect("supervisor task panicked")
        .expect("supervisor returned an error");
    assert_eq!(exit_code, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_probe_in_config_fails_startup() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("config.yml");
    fs::write(&config_path, "martian_probe: {}\n").unwrap();

    let store = ConfigStore::load(&config_path).unwrap();
    let supervisor = Supervisor::new(
        MockKernel::new(),
        store,
        SupervisorOpts {
            output_file: "-".to_string(),
            health_check_period: Duration::from_secs(60),
            lost_event_telemetry: None,
            watch_config: false,
        },
    );
    assert!(supervisor.run().await.is_err());
}
