// Copyright (c) Nettrace Contributors
// SPDX-License-Identifier: MIT

//! End-to-end probe pipeline tests over the in-memory kernel: raw events in,
//! JSON records out.

use std::time::Duration;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use bpf_common::{TcpConnectEvent, UdpSessionEvent, UdpSessionKind};
use nettrace::{
    config::ProbeConfig,
    filtering::build_network_filters,
    kernel::mock::MockKernel,
    probes::spawn_worker,
};

async fn wait_loaded(kernel: &MockKernel, name: &str) {
    for _ in 0..500 {
        if kernel.is_loaded(name) {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("program {} never loaded", name);
}

async fn next_record(rx: &mut mpsc::UnboundedReceiver<String>) -> Value {
    let line = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a record")
        .expect("output channel closed");
    serde_json::from_str(&line).expect("records are json objects")
}

#[tokio::test(flavor = "multi_thread")]
async fn tcp_connect_events_come_out_enriched() {
    let kernel = MockKernel::new();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    let (_hot_tx, hot_rx) = mpsc::unbounded_channel();
    let config = ProbeConfig::from_yaml(
        "filters:\n  - network: 10.0.0.0\n    network_mask: 255.0.0.0\n    except_ports: [22]\n",
    )
    .unwrap();
    let _worker = spawn_worker("tcp_connect", &config, kernel.clone(), out_tx, None, hot_rx)
        .unwrap();
    wait_loaded(&kernel, "tcp_connect").await;

    // the initial filter application reached the kernel maps
    let expected_key = build_network_filters(&config.filters().unwrap()).unwrap()[0]
        .0
        .to_bytes()
        .to_vec();
    for _ in 0..500 {
        if kernel
            .net_filter("tcp_connect")
            .lock()
            .unwrap()
            .entries()
            .contains_key(&expected_key)
        {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert!(kernel
        .net_filter("tcp_connect")
        .lock()
        .unwrap()
        .entries()
        .contains_key(&expected_key));

    let own_pid = std::process::id();
    let event = TcpConnectEvent {
        pid: own_pid,
        saddr: 0x7f000001,
        daddr: 0x0a010203,
        dport: 80,
    };
    kernel.inject("tcp_connect", event.to_rb_bytes().to_vec());

    let record = next_record(&mut out_rx).await;
    assert_eq!(record["probe"], "tcp_connect");
    assert_eq!(record["pid"], own_pid);
    assert_eq!(record["daddr"], "10.1.2.3");
    assert_eq!(record["saddr"], "127.0.0.1");
    assert_eq!(record["port"], 80);
    assert_eq!(record["proctree"][0]["pid"], own_pid);
    let timestamp = record["timestamp"].as_str().unwrap();
    assert!(timestamp.ends_with('Z'));
    assert!(timestamp.contains('T'));
}

#[tokio::test(flavor = "multi_thread")]
async fn hot_swap_payload_rewrites_the_filter_maps() {
    let kernel = MockKernel::new();
    let (out_tx, _out_rx) = mpsc::unbounded_channel();
    let (hot_tx, hot_rx) = mpsc::unbounded_channel();
    let config = ProbeConfig::from_yaml(
        "filters:\n  - network: 10.0.0.0\n    network_mask: 255.0.0.0\n",
    )
    .unwrap();
    let _worker = spawn_worker("tcp_connect", &config, kernel.clone(), out_tx, None, hot_rx)
        .unwrap();
    wait_loaded(&kernel, "tcp_connect").await;

    let payload = ProbeConfig::from_yaml(
        "filters:\n  - network: 192.168.0.0\n    network_mask: 255.255.0.0\n",
    )
    .unwrap();
    let new_key = build_network_filters(&payload.filters().unwrap()).unwrap()[0]
        .0
        .to_bytes()
        .to_vec();
    let old_key = build_network_filters(&config.filters().unwrap()).unwrap()[0]
        .0
        .to_bytes()
        .to_vec();
    hot_tx.send(payload).unwrap();

    for _ in 0..500 {
        let entries = kernel
            .net_filter("tcp_connect")
            .lock()
            .unwrap()
            .entries()
            .clone();
        if entries.contains_key(&new_key) && !entries.contains_key(&old_key) {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("hot swap never reached the kernel maps");
}

#[tokio::test(flavor = "multi_thread")]
async fn udp_sessions_emit_one_record_at_end() {
    let kernel = MockKernel::new();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    let (_hot_tx, hot_rx) = mpsc::unbounded_channel();
    let config = ProbeConfig::default();
    let _worker = spawn_worker("udp_session", &config, kernel.clone(), out_tx, None, hot_rx)
        .unwrap();
    wait_loaded(&kernel, "udp_session").await;

    let own_pid = std::process::id();
    let mut send = |kind, daddr, dport| {
        let event = UdpSessionEvent {
            kind,
            pid: own_pid,
            sock: 1,
            daddr,
            dport,
        };
        kernel.inject("udp_session", event.to_rb_bytes().to_vec());
    };
    send(UdpSessionKind::Start, 0x0a0a0a0a, 1337);
    send(UdpSessionKind::Continue, 0x7f000001, 1337);
    send(UdpSessionKind::End, 0, 0);

    let record = next_record(&mut out_rx).await;
    assert_eq!(record["probe"], "udp_session");
    assert_eq!(record["pid"], own_pid);
    let destinations = record["destinations"].as_array().unwrap();
    assert_eq!(destinations.len(), 2);
    assert_eq!(destinations[0]["daddr"], "10.10.10.10");
    assert_eq!(destinations[0]["port"], 1337);
    assert_eq!(destinations[1]["daddr"], "127.0.0.1");

    // only the end event produced output
    assert!(out_rx.try_recv().is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn lost_event_telemetry_flows_through_the_same_queue() {
    let kernel = MockKernel::new();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel();
    let (_hot_tx, hot_rx) = mpsc::unbounded_channel();
    let config = ProbeConfig::default();
    let _worker = spawn_worker(
        "net_listen",
        &config,
        kernel.clone(),
        out_tx,
        Some(1),
        hot_rx,
    )
    .unwrap();
    wait_loaded(&kernel, "net_listen").await;
    kernel.set_lost("net_listen", 7);

    let event = bpf_common::NetListenEvent {
        pid: std::process::id(),
        laddr: 0x7f000001,
        port: 1337,
        protocol: 6,
    };
    kernel.inject("net_listen", event.to_rb_bytes().to_vec());

    let record = next_record(&mut out_rx).await;
    assert_eq!(record["probe"], "net_listen");
    assert_eq!(record["protocol"], "tcp");

    let telemetry = next_record(&mut out_rx).await;
    assert_eq!(telemetry["type"], "lost_event_telemetry");
    assert_eq!(telemetry["probe"], "net_listen");
    assert_eq!(telemetry["count"], 7);
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_probe_names_are_rejected() {
    let kernel = MockKernel::new();
    let (out_tx, _out_rx) = mpsc::unbounded_channel();
    let (_hot_tx, hot_rx) = mpsc::unbounded_channel();
    assert!(spawn_worker(
        "no_such_probe",
        &ProbeConfig::default(),
        kernel,
        out_tx,
        None,
        hot_rx,
    )
    .is_err());
}
