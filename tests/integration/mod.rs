mod fake_server;
mod sftp_client;
mod transport;

/// Wire the crate's log output into the test harness.
pub fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}
