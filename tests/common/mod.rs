//! Integration test common infrastructure.
//!
//! Spawns real blockd instances (the compiled binary, a generated TOML
//! config, an ephemeral port) and waits for them to accept traffic.

// Each test binary uses its own subset of this module.
#![allow(dead_code)]

use std::path::PathBuf;
use std::process::{Child, Command};
use std::time::Duration;
use tokio::time::sleep;

/// A test daemon instance, killed on drop.
pub struct TestServer {
    child: Child,
    port: u16,
    _data_dir: tempfile::TempDir,
}

/// Policy used by every test server: 3 attempts / 5s window / 60s block.
pub const TEST_POLICY: &str = "\n[policy]\nattempts = 3\nperiod = 5\nblocktime = 60\n";

impl TestServer {
    /// Spawn with the default test policy and a 1s sweep.
    pub async fn spawn() -> anyhow::Result<Self> {
        Self::spawn_with("").await
    }

    /// Spawn with extra lines appended inside the `[server]` section.
    pub async fn spawn_with(server_extra: &str) -> anyhow::Result<Self> {
        let data_dir = tempfile::tempdir()?;
        let port = free_port();

        let config_path = data_dir.path().join("config.toml");
        let config_content = format!(
            "[server]\nlisten = \"127.0.0.1:{port}\"\n{server_extra}\n{TEST_POLICY}\n[sweep]\ninterval_secs = 1\n"
        );
        std::fs::write(&config_path, config_content)?;

        let binary_path =
            PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("target/debug/blockd");

        let child = Command::new(&binary_path)
            .arg(config_path.to_str().unwrap())
            .spawn()?;

        let server = Self { child, port, _data_dir: data_dir };
        server.wait_until_ready().await?;
        Ok(server)
    }

    /// Wait until the API socket accepts connections.
    async fn wait_until_ready(&self) -> anyhow::Result<()> {
        for _ in 0..30 {
            if tokio::net::TcpStream::connect(("127.0.0.1", self.port))
                .await
                .is_ok()
            {
                return Ok(());
            }
            sleep(Duration::from_millis(100)).await;
        }
        anyhow::bail!("server failed to start within 3 seconds")
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.port, path)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Deliver SIGINT, as a service manager's stop does.
    pub fn interrupt(&self) {
        let _ = Command::new("kill")
            .args(["-INT", &self.child.id().to_string()])
            .status();
    }

    /// Poll for process exit until `deadline` elapses.
    pub async fn wait_for_exit(&mut self, deadline: Duration) -> bool {
        let start = std::time::Instant::now();
        while start.elapsed() < deadline {
            if matches!(self.child.try_wait(), Ok(Some(_))) {
                return true;
            }
            sleep(Duration::from_millis(100)).await;
        }
        false
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// An OS-assigned port, released before the daemon binds it.
fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .expect("bind ephemeral port")
        .local_addr()
        .expect("local addr")
        .port()
}
