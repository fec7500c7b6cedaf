//! Launcher integration tests: rule checking, printing and running a
//! program with the agent preloaded.

use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::process::{Command, Output, Stdio};
use std::time::Duration;

fn sockshim() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_sockshim"));
    command.env_remove("SOCKSHIM_AGENT").env_remove("RUST_LOG");
    command
}

fn run(args: &[&str]) -> Output {
    sockshim().args(args).output().expect("failed to run sockshim")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

/// The agent built alongside the launcher, if the workspace was built.
fn agent_library() -> Option<PathBuf> {
    let exe = PathBuf::from(env!("CARGO_BIN_EXE_sockshim"));
    let lib = exe.parent()?.join("libsockshim_agent.so");
    lib.is_file().then_some(lib)
}

#[test]
fn test_check_accepts_valid_rules() {
    let output = run(&["-c", "-r", "in,tcp,port=8080,path=/run/web.sock", "-r", "reject"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert!(stdout(&output).is_empty());
}

#[test]
fn test_check_rejects_invalid_rules() {
    let output = run(&["-c", "-r", "in,path=relative.sock"]);
    assert!(!output.status.success());
    let err = stderr(&output);
    assert!(err.contains("rule #1"), "stderr: {}", err);
    assert!(err.contains("relative.sock"), "stderr: {}", err);

    let output = run(&["-c", "-r", "out,systemd"]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("only valid for incoming"));
}

#[test]
fn test_print_rules_from_document() {
    let document = r#"
- direction: outgoing
  type: udp
  address: "10.*"
  port: 53
  blackhole: true
- socketPath: /run/app/%t-%p.sock
"#;
    let output = run(&["-p", "-c", "-F", document]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let text = stdout(&output);
    assert!(text.contains(
        "Rule #1:\n  Direction: outgoing\n  Socket type: udp\n  Address: 10.*\n  Port: 53\n  \
         Action: black hole\n"
    ));
    assert!(text.contains("Rule #2:\n  Direction: <any>\n"));
    assert!(text.contains("  Action: socket path /run/app/%t-%p.sock\n"));
}

#[test]
fn test_printed_rules_go_to_stderr_when_running() {
    let output = sockshim()
        .env("SOCKSHIM_AGENT", "/nonexistent/libsockshim_agent.so")
        .args(["-p", "-r", "out,blackhole", "true"])
        .output()
        .unwrap();
    assert!(stdout(&output).is_empty(), "stdout: {}", stdout(&output));
    assert!(stderr(&output).contains("Rule #1:\n  Direction: outgoing\n"));
}

#[test]
fn test_rules_file() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("rules.yaml");
    std::fs::write(
        &file,
        "- direction: incoming\n  port: 80\n  portEnd: 70\n  reject: true\n",
    )
    .unwrap();

    let output = run(&["-c", "-f", file.to_str().unwrap()]);
    assert!(!output.status.success());
    assert!(stderr(&output).contains("invalid port range 80-70"));
}

#[test]
fn test_missing_agent_is_reported() {
    let output = sockshim()
        .env("SOCKSHIM_AGENT", "/nonexistent/libsockshim_agent.so")
        .args(["-r", "reject", "true"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(stderr(&output).contains("SOCKSHIM_AGENT"));
}

#[test]
fn test_program_runs_with_agent_preloaded() {
    let Some(agent) = agent_library() else {
        eprintln!("SKIPPED: agent library not built");
        return;
    };
    let output = run(&[
        "-r",
        "out,blackhole",
        "sh",
        "-c",
        "echo \"$LD_PRELOAD\"; echo \"$SOCKSHIM_RULES\"; exit 3",
    ]);
    assert_eq!(output.status.code(), Some(3), "stderr: {}", stderr(&output));
    let text = stdout(&output);
    let mut lines = text.lines();
    let preload = lines.next().unwrap();
    assert!(preload.starts_with(agent.canonicalize().unwrap().to_str().unwrap()));
    let rules = lines.next().unwrap();
    assert!(rules.contains("outgoing"), "rules: {}", rules);
}

const ECHO_CHILD_VAR: &str = "SOCKSHIM_TEST_ECHO_CHILD";
const ECHO_PORT: u16 = 4711;

/// Runs inside the preloaded program started by
/// `test_tcp_listener_is_served_on_unix_socket`; a no-op otherwise.
#[test]
fn echo_server_child() {
    if std::env::var_os(ECHO_CHILD_VAR).is_none() {
        return;
    }
    let listener = TcpListener::bind(("127.0.0.1", ECHO_PORT)).unwrap();
    let local = listener.local_addr().unwrap();
    assert_eq!(local, SocketAddr::from(([127, 0, 0, 1], ECHO_PORT)));
    println!("ready");

    let (mut stream, peer) = listener.accept().unwrap();
    assert!(peer.ip().is_loopback(), "peer: {}", peer);
    let mut buf = [0u8; 5];
    stream.read_exact(&mut buf).unwrap();
    stream.write_all(&buf.to_ascii_uppercase()).unwrap();
}

#[test]
fn test_tcp_listener_is_served_on_unix_socket() {
    if agent_library().is_none() {
        eprintln!("SKIPPED: agent library not built");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let rule = format!("in,path={}/%p.sock", dir.path().display());
    let test_binary = std::env::current_exe().unwrap();

    let mut child = sockshim()
        .env(ECHO_CHILD_VAR, "1")
        .args(["-r", &rule])
        .arg(&test_binary)
        .args(["--exact", "echo_server_child", "--nocapture", "--test-threads=1"])
        .stdout(Stdio::piped())
        .spawn()
        .unwrap();

    let mut lines = BufReader::new(child.stdout.take().unwrap()).lines();
    let ready = lines.by_ref().map_while(Result::ok).any(|line| line == "ready");
    assert!(ready, "program under the agent never listened");

    let path = dir.path().join(format!("{}.sock", ECHO_PORT));
    assert!(path.exists(), "{} missing", path.display());
    let mut stream = UnixStream::connect(&path).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    stream.write_all(b"hello").unwrap();
    let mut reply = [0u8; 5];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"HELLO");

    lines.for_each(drop);
    let status = child.wait().unwrap();
    assert!(status.success(), "program exited with {}", status);
}
