use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

fn spawn_console(extra_env: &[(&str, &str)]) -> std::process::Child {
    let bin = std::env::var("CARGO_BIN_EXE_console").unwrap_or_else(|_| {
        let current = std::env::current_exe().expect("current exe");
        let debug_dir = current
            .parent()
            .and_then(|p| p.parent())
            .expect("target debug dir");
        debug_dir.join("console").to_string_lossy().to_string()
    });
    let mut cmd = Command::new(bin);
    cmd.env("CONSOLE_BIND", "127.0.0.1:0")
        .env("CONSOLE_METRICS_BIND", "127.0.0.1:0")
        .env("CONSOLE_STORAGE", "memory")
        .env_remove("CONSOLE_CONFIG")
        .env_remove("CONSOLE_ORCHESTRATOR_URL")
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    for (key, value) in extra_env {
        cmd.env(key, value);
    }
    cmd.spawn().expect("spawn console")
}

fn stop_with_sigint(child: &mut std::process::Child) {
    let status = Command::new("kill")
        .arg("-INT")
        .arg(child.id().to_string())
        .status()
        .expect("send SIGINT");
    assert!(status.success());
}

fn wait_for_exit(child: &mut std::process::Child, timeout: Duration) -> std::process::ExitStatus {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait().expect("try_wait") {
            return status;
        }
        if Instant::now() >= deadline {
            child.kill().expect("kill on timeout");
            return child.wait().expect("wait after kill");
        }
        std::thread::sleep(Duration::from_millis(25));
    }
}

#[test]
fn binary_starts_and_stops_on_sigint() {
    let mut child = spawn_console(&[("CONSOLE_ADMIN_USER", "root")]);
    std::thread::sleep(Duration::from_millis(250));
    stop_with_sigint(&mut child);
    let status = wait_for_exit(&mut child, Duration::from_secs(3));
    assert!(status.success());
}

#[test]
fn binary_fails_fast_on_invalid_config() {
    let mut child = spawn_console(&[("CONSOLE_STORAGE", "mongo")]);
    let status = wait_for_exit(&mut child, Duration::from_secs(3));
    assert!(!status.success());
}
