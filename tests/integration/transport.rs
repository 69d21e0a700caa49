//! Transport behaviour against real subprocesses: echo, timeout,
//! broken-pipe latching material, and child reaping.

use std::os::fd::OwnedFd;
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ferric_sftp::sftp::error::SftpError;
use ferric_sftp::sftp::launcher::SshChild;
use ferric_sftp::sftp::transport::{PipeTransport, Transport};

fn child_transport(
    command: &mut Command,
    timeout: Duration,
) -> (PipeTransport, SshChild, Arc<AtomicBool>) {
    let mut child = command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    let stdin = child.stdin.take().unwrap();
    let stdout = child.stdout.take().unwrap();
    let flag = Arc::new(AtomicBool::new(false));
    let transport = PipeTransport::new(
        OwnedFd::from(stdout),
        OwnedFd::from(stdin),
        timeout,
        flag.clone(),
    )
    .unwrap();
    (transport, SshChild::from_child(child), flag)
}

#[test]
fn cat_echoes_a_whole_frame() {
    let (mut transport, mut child, _) =
        child_transport(&mut Command::new("cat"), Duration::from_secs(5));
    let frame = [0u8, 0, 0, 5, 1, 0, 0, 0, 6];
    transport.write_all(&frame).unwrap();
    let mut buf = [0u8; 9];
    transport.read_exact(&mut buf).unwrap();
    assert_eq!(buf, frame);
    // closing our pipe ends makes cat exit on its own
    drop(transport);
    let status = child.reap(Duration::from_secs(5)).unwrap();
    assert!(status.success());
}

#[test]
fn silent_child_times_out_and_raises_the_flag() {
    let (mut transport, mut child, flag) =
        child_transport(Command::new("sleep").arg("30"), Duration::from_millis(200));
    let mut buf = [0u8; 1];
    match transport.read_exact(&mut buf) {
        Err(SftpError::Timeout) => {}
        other => panic!("expected Timeout, got {:?}", other),
    }
    assert!(flag.load(Ordering::SeqCst));
    // a timed-out session reaps with zero grace
    child.reap(Duration::ZERO);
}

#[test]
fn writes_to_a_dead_child_break_the_pipe() {
    let (mut transport, mut child, _) =
        child_transport(&mut Command::new("true"), Duration::from_secs(1));
    std::thread::sleep(Duration::from_millis(100));
    let mut result = Ok(());
    for _ in 0..64 {
        result = transport.write_all(&[0u8; 8_192]);
        if result.is_err() {
            break;
        }
    }
    match result {
        Err(SftpError::BrokenPipe) | Err(SftpError::ConnectionReset) => {}
        other => panic!("expected a broken pipe, got {:?}", other),
    }
    child.reap(Duration::ZERO);
}

#[test]
fn reading_from_an_exited_child_reports_pipe_closed() {
    let (mut transport, mut child, _) =
        child_transport(&mut Command::new("true"), Duration::from_secs(1));
    let mut buf = [0u8; 1];
    match transport.read_exact(&mut buf) {
        Err(SftpError::PipeClosed) => {}
        other => panic!("expected PipeClosed, got {:?}", other),
    }
    child.reap(Duration::ZERO);
}
