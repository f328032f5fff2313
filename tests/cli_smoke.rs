//! Smoke tests -- verify the binary parses its flags and runs end to end.

use std::net::UdpSocket;
use std::thread;

use assert_cmd::Command;
use predicates::prelude::*;
use stun::message::{Message, Setter, BINDING_SUCCESS};
use stun::xoraddr::XorMappedAddress;

fn turnstress() -> Command {
    let mut cmd = Command::cargo_bin("turnstress").unwrap();
    cmd.env_remove("RUST_LOG")
        .env_remove("TURNSTRESS_DEVICE_ID")
        .env_remove("TURNSTRESS_TOKEN");
    cmd
}

/// Blocking STUN responder on a background thread.
fn spawn_stun_responder() -> String {
    let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
    let addr = socket.local_addr().unwrap().to_string();

    thread::spawn(move || {
        let mut buf = [0u8; 1500];
        while let Ok((n, from)) = socket.recv_from(&mut buf) {
            let mut req = Message::new();
            req.raw = buf[..n].to_vec();
            if req.decode().is_err() {
                continue;
            }
            let setters: Vec<Box<dyn Setter>> = vec![
                Box::new(req.transaction_id),
                Box::new(BINDING_SUCCESS),
                Box::new(XorMappedAddress {
                    ip: from.ip(),
                    port: from.port(),
                }),
            ];
            let mut resp = Message::new();
            if resp.build(&setters).is_ok() {
                let _ = socket.send_to(&resp.raw, from);
            }
        }
    });

    addr
}

#[test]
fn test_cli_help() {
    turnstress()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Concurrent STUN/TURN relay load tester"));
}

#[test]
fn test_cli_version() {
    turnstress()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("turnstress"));
}

#[test]
fn test_run_subcommand_flags() {
    turnstress()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--sessions"))
        .stdout(predicate::str::contains("--double-hop"))
        .stdout(predicate::str::contains("--send-interval"));
}

#[test]
fn test_monitor_subcommand_exists() {
    turnstress()
        .args(["monitor", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--cycles"));
}

#[test]
fn test_turn_without_server_fails_fast() {
    turnstress()
        .args(["run", "-m", "turn", "-d", "1s"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("without a TURN server address"));
}

#[test]
fn test_packet_size_minimum_enforced() {
    turnstress()
        .args(["run", "-m", "stun", "--stun", "127.0.0.1:3478", "-s", "64"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("below the minimum"));
}

#[test]
fn test_bad_duration_rejected() {
    turnstress()
        .args(["run", "-m", "stun", "--stun", "127.0.0.1:3478", "-d", "soon"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid --duration"));
}

#[test]
fn test_compound_duration_accepted() {
    // Reaches config validation, so the duration itself parsed.
    turnstress()
        .args(["run", "-m", "stun", "--stun", "127.0.0.1:3478", "-d", "1m30s", "-s", "64"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("below the minimum"))
        .stderr(predicate::str::contains("invalid --duration").not());
}

#[test]
fn test_remote_conflicts_with_static_flags() {
    turnstress()
        .args(["run", "--remote", "--turn", "10.0.0.1:3478"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot be used with"));

    turnstress()
        .args(["run", "--endpoint", "https://alloc.example.com", "-u", "load"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot be used with"));
}

#[test]
fn test_stun_run_prints_summary() {
    let server = spawn_stun_responder();

    turnstress()
        .args([
            "run", "-m", "stun", "--stun", &server, "-c", "2", "-d", "400ms", "-w", "50ms",
        ])
        .timeout(std::time::Duration::from_secs(20))
        .assert()
        .success()
        .stdout(predicate::str::contains("=== turnstress summary ==="))
        .stdout(predicate::str::contains("Target sessions      : 2"))
        .stdout(predicate::str::contains("Max concurrent up"));
}

#[test]
fn test_stun_run_json_summary() {
    let server = spawn_stun_responder();

    turnstress()
        .args([
            "run", "-m", "stun", "--stun", &server, "-c", "2", "-d", "400ms", "-w", "50ms",
            "--json",
        ])
        .timeout(std::time::Duration::from_secs(20))
        .assert()
        .success()
        .stdout(predicate::str::contains("\"target_sessions\": 2"))
        .stdout(predicate::str::contains("\"latency_sum\""))
        .stdout(predicate::str::contains("=== turnstress summary ===").not());
}
