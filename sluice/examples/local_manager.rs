//! Run a manager on localhost, submit a few commands, execute them with an
//! in-process runner and watch them complete.
//!
//! ```bash
//! cargo run --example local_manager
//! ```

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use sluice::{Accounting, Client, JobSpec, Manager, ManagerConfig, CMDS_QUEUE};
use sluice_testkit::{MemoryStore, MockScheduler};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let cfg = ManagerConfig::default().with_release_backoff(Duration::ZERO);
    let addr = cfg.client_addr;
    let manager = Manager::new(
        cfg,
        Arc::new(MemoryStore::new()),
        Arc::new(MockScheduler::new()),
    );
    tokio::spawn(manager.serve());
    tokio::time::sleep(Duration::from_millis(200)).await;

    // submit a small pipeline
    let mut client = Client::connect(addr, CMDS_QUEUE).await?;
    let added = client
        .add(vec![
            JobSpec::new("echo hello from sluice", "/tmp").with_rep_group("demo"),
            JobSpec::new("uname -a", "/tmp").with_rep_group("demo"),
        ])
        .await?;
    for job in &added {
        println!("[SUBMIT] {} (existed: {})", job.key, job.already_existed);
    }

    // act as a runner: reserve, execute, report
    let mut runner = Client::connect(addr, CMDS_QUEUE).await?;
    while let Some(job) = runner
        .reserve_wait("", Duration::from_secs(30), Duration::from_secs(1))
        .await?
    {
        println!("[RUN] {}", job.cmd);
        let started = std::time::Instant::now();
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&job.cmd)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;
        let accounting = Accounting {
            exit_code: output.status.code().unwrap_or(-1),
            walltime: started.elapsed(),
            host: "localhost".to_string(),
            ..Accounting::default()
        };
        runner
            .complete(
                &job.key,
                accounting,
                &String::from_utf8_lossy(&output.stdout),
                &String::from_utf8_lossy(&output.stderr),
            )
            .await?;
        println!("[DONE] {}", job.key);
    }

    for job in client.get_complete("demo").await? {
        println!("[COMPLETE] {} exited {}", job.cmd, job.exit_code);
    }

    client.shutdown().await?;
    Ok(())
}
