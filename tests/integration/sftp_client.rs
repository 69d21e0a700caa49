//! End-to-end flows against the scripted server, over real file
//! descriptors and the production transport.

use std::os::fd::OwnedFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use ferric_sftp::sftp::constants::EXT_POSIX_RENAME;
use ferric_sftp::sftp::session::SftpSession;
use ferric_sftp::sftp::transport::PipeTransport;
use ferric_sftp::sftp::{OpenMode, SftpClient, SftpError};

use super::fake_server::{self, ServerConfig, ServerState, HOME};

fn connect(config: ServerConfig) -> (SftpClient, JoinHandle<ServerState>) {
    super::init_logs();
    let (client_end, server_end) = UnixStream::pair().unwrap();
    let server = fake_server::spawn(server_end, config);
    let flag = Arc::new(AtomicBool::new(false));
    let read_fd = OwnedFd::from(client_end.try_clone().unwrap());
    let write_fd = OwnedFd::from(client_end);
    let transport =
        PipeTransport::new(read_fd, write_fd, Duration::from_secs(5), flag.clone()).unwrap();
    let session = SftpSession::handshake(Box::new(transport), flag).unwrap();
    (SftpClient::with_session(session), server)
}

#[test]
fn upload_in_blocks_lands_byte_identical() {
    let (mut client, server) = connect(ServerConfig::default());
    client.cd(HOME, false, None).unwrap();
    client
        .open_file(OpenMode::Write, "a.bin", 0, Some(0o644), false, None, 4_000)
        .unwrap();

    let block0 = vec![1u8; 4_000];
    let block1 = vec![2u8; 4_000];
    let block2 = vec![3u8; 2_000];
    client.write(&block0).unwrap();
    client.write(&block1).unwrap();
    client.write(&block2).unwrap();
    client.close_file().unwrap();
    assert_eq!(client.file_offset(), 10_000);

    let attrs = client.stat(Some("a.bin")).unwrap();
    assert_eq!(attrs.size, Some(10_000));

    client.quit();
    let state = server.join().unwrap();
    assert_eq!(state.write_frames, 3);
    let mut expected = block0;
    expected.extend_from_slice(&block1);
    expected.extend_from_slice(&block2);
    assert_eq!(state.files[&format!("{}/a.bin", HOME)], expected);
}

#[test]
fn pipelined_download_delivers_the_whole_file() {
    let payload: Vec<u8> = (0..40_960u32).map(|i| (i % 251) as u8).collect();
    let config = ServerConfig {
        files: vec![(format!("{}/big.bin", HOME), payload.clone())],
        ..Default::default()
    };
    let (mut client, server) = connect(config);
    client.cd(HOME, false, None).unwrap();
    client
        .open_file(OpenMode::Read, "big.bin", 0, None, false, None, 4_096)
        .unwrap();

    let permits = client.multi_read_init(4_096, 40_960);
    assert!(permits >= 1);
    let mut got = Vec::new();
    let mut buf = vec![0u8; 4_096];
    loop {
        client.multi_read_dispatch().unwrap();
        match client.multi_read_catch(&mut buf) {
            Ok(n) => got.extend_from_slice(&buf[..n]),
            Err(SftpError::Eof) => break,
            Err(err) => panic!("unexpected error: {}", err),
        }
        if client.multi_read_eof() {
            break;
        }
    }
    assert_eq!(got, payload);
    assert_eq!(client.file_offset(), 40_960);

    client.close_file().unwrap();
    client.quit();
    server.join().unwrap();
}

#[test]
fn cd_with_create_builds_the_whole_path() {
    let (mut client, server) = connect(ServerConfig::default());
    let created = client.cd("/srv/in/new", true, Some(0o750)).unwrap();
    assert_eq!(created.as_deref(), Some("srv/in/new"));
    assert_eq!(client.cwd(), Some("/srv/in/new"));
    client.quit();
    let state = server.join().unwrap();
    for dir in ["/srv", "/srv/in", "/srv/in/new"] {
        assert!(state.dirs.iter().any(|d| d == dir), "missing {}", dir);
    }
}

#[test]
fn rename_onto_an_existing_target_removes_and_retries() {
    let config = ServerConfig {
        dirs: vec![format!("{}/tmp", HOME), format!("{}/out", HOME)],
        files: vec![
            (format!("{}/tmp/x", HOME), b"fresh".to_vec()),
            (format!("{}/out/x", HOME), b"stale".to_vec()),
        ],
        ..Default::default()
    };
    let (mut client, server) = connect(config);
    client.cd(HOME, false, None).unwrap();
    client.rename("tmp/x", "out/x", false, None).unwrap();
    client.quit();
    let state = server.join().unwrap();
    assert_eq!(state.files[&format!("{}/out/x", HOME)], b"fresh");
    assert!(!state.files.contains_key(&format!("{}/tmp/x", HOME)));
    // the v3 overwrite dance: the old target was explicitly removed
    assert_eq!(state.removes, vec![format!("{}/out/x", HOME)]);
}

#[test]
fn posix_rename_overwrites_without_a_remove() {
    let config = ServerConfig {
        extensions: vec![(EXT_POSIX_RENAME, "1")],
        dirs: vec![format!("{}/tmp", HOME), format!("{}/out", HOME)],
        files: vec![
            (format!("{}/tmp/x", HOME), b"fresh".to_vec()),
            (format!("{}/out/x", HOME), b"stale".to_vec()),
        ],
        ..Default::default()
    };
    let (mut client, server) = connect(config);
    assert!(client.features().posix_rename);
    client.cd(HOME, false, None).unwrap();
    client.rename("tmp/x", "out/x", false, None).unwrap();
    client.quit();
    let state = server.join().unwrap();
    assert_eq!(state.files[&format!("{}/out/x", HOME)], b"fresh");
    assert!(state.removes.is_empty());
}

#[test]
fn directory_listing_yields_every_entry_once() {
    let config = ServerConfig {
        dirs: vec![format!("{}/sub", HOME)],
        files: vec![
            (format!("{}/a.txt", HOME), b"aaa".to_vec()),
            (format!("{}/b.txt", HOME), b"bb".to_vec()),
        ],
        ..Default::default()
    };
    let (mut client, server) = connect(config);
    client.cd(HOME, false, None).unwrap();
    client.open_dir(".").unwrap();
    let mut names = Vec::new();
    while let Some(entry) = client.readdir().unwrap() {
        // protocol 3 servers always ship a longname
        assert!(entry.longname.is_some());
        assert!(!entry.display_line().is_empty());
        names.push(entry.name);
    }
    names.sort();
    assert_eq!(names, vec!["a.txt", "b.txt", "sub"]);
    client.close_dir().unwrap();
    client.quit();
    server.join().unwrap();
}

#[test]
fn pwd_returns_the_canonical_form() {
    let config = ServerConfig {
        dirs: vec![format!("{}/sub", HOME)],
        ..Default::default()
    };
    let (mut client, server) = connect(config);
    client.cd("/home/test/sub/..", false, None).unwrap();
    assert_eq!(client.cwd(), Some(HOME));
    assert_eq!(client.pwd().unwrap(), HOME);

    // resetting the cwd goes back to the server's default
    client.cd("", false, None).unwrap();
    assert_eq!(client.pwd().unwrap(), HOME);
    client.quit();
    server.join().unwrap();
}

#[test]
fn symlink_round_trip_records_resolved_paths() {
    let (mut client, server) = connect(ServerConfig::default());
    client.cd(HOME, false, None).unwrap();
    client.symlink("data/real", "alias", false, None).unwrap();
    client.quit();
    let state = server.join().unwrap();
    assert_eq!(
        state.symlinks,
        vec![(
            format!("{}/data/real", HOME),
            format!("{}/alias", HOME)
        )]
    );
}

#[test]
fn stat_size_matches_a_full_sequential_read() {
    let payload = vec![7u8; 10_000];
    let config = ServerConfig {
        files: vec![(format!("{}/f", HOME), payload)],
        ..Default::default()
    };
    let (mut client, server) = connect(config);
    client.cd(HOME, false, None).unwrap();
    let size = client.stat(Some("f")).unwrap().size.unwrap();
    client
        .open_file(OpenMode::Read, "f", 0, None, false, None, 4_096)
        .unwrap();
    let mut buf = vec![0u8; 4_096];
    loop {
        match client.read(&mut buf) {
            Ok(_) => {}
            Err(SftpError::Eof) => break,
            Err(err) => panic!("unexpected error: {}", err),
        }
    }
    assert_eq!(client.file_offset(), size);
    client.close_file().unwrap();
    client.quit();
    server.join().unwrap();
}
