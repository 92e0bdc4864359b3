use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use super::*;
use crate::config::Config;

#[test]
fn backoff_doubles_and_caps() {
    let expected = [1, 2, 4, 8, 16, 30, 30];
    for (failures, secs) in expected.iter().enumerate() {
        let got = backoff_delay(failures as u32);
        assert!(got == Duration::from_secs(*secs), "unexpected delay after {} failures, got {:?}, expected {}s", failures, got, secs);
    }
    let got = backoff_delay(200);
    assert!(got == Duration::from_secs(30), "unexpected delay for a huge failure count, got {:?}", got);
}

#[test]
fn daemon_type_maps_storage_binaries() {
    for (binary, expected) in [("ceph-mon", Some("mon")), ("/usr/bin/ceph-osd", Some("osd")), ("radosgw", Some("rgw")), ("sh", None)] {
        let got = daemon_type(binary);
        assert!(got == expected, "unexpected daemon type for {}, got {:?}, expected {:?}", binary, got, expected);
    }
}

/// Arguments of an `sh` process which stays up and carries `tag` on its command line. The
/// trailing command keeps the shell from exec'ing into `sleep`.
fn sleeper_args(tag: &str) -> Vec<String> {
    vec!["-c".to_string(), "sleep 30; exit 0".to_string(), tag.to_string()]
}

/// Spawn an unsupervised sleeper, reaping it in the background once it exits.
fn spawn_foreign_sleeper(tag: &str) -> Result<tokio::task::JoinHandle<std::io::Result<std::process::ExitStatus>>> {
    let mut child = tokio::process::Command::new("sh").args(sleeper_args(tag)).spawn()?;
    Ok(tokio::spawn(async move { child.wait().await }))
}

#[test]
fn restart_tracker_backs_off_and_flags_crash_loops() {
    let mut restarts = RestartTracker::default();
    let mut delays = vec![];
    let mut flags = vec![];
    for _ in 0..6 {
        restarts.exited(false, Duration::from_millis(100));
        let (delay, crash_looping) = restarts.next_restart();
        delays.push(delay.as_secs());
        flags.push(crash_looping);
    }
    assert!(delays == [1, 2, 4, 8, 16, 30], "unexpected restart delays, got {:?}", delays);
    assert!(flags == [false, false, false, false, true, true], "unexpected crash loop flags, got {:?}", flags);
}

#[test]
fn restart_tracker_resets_after_stable_or_clean_runs() {
    let mut restarts = RestartTracker::default();
    for _ in 0..4 {
        restarts.exited(false, Duration::from_secs(1));
        restarts.next_restart();
    }

    restarts.exited(false, Duration::from_secs(31));
    let (delay, crash_looping) = restarts.next_restart();
    assert!(delay == Duration::from_secs(1) && !crash_looping, "expected a stable run to reset the backoff, got {:?}", delay);

    restarts.exited(false, Duration::from_secs(1));
    let (delay, _) = restarts.next_restart();
    assert!(delay == Duration::from_secs(2), "expected the backoff to grow again, got {:?}", delay);

    restarts.exited(true, Duration::from_millis(10));
    let (delay, _) = restarts.next_restart();
    assert!(delay == Duration::from_secs(1), "expected a clean exit to reset the backoff, got {:?}", delay);
}

#[tokio::test]
async fn crashing_process_is_restarted_with_backoff() -> Result<()> {
    let (config, tmpdir) = Config::new_test("a", "1.2.3.4")?;
    let manager = ProcManager::new(Arc::new(config));
    let marker = tmpdir.path().join("runs");
    let script = format!("echo run >> {}; exit 1", marker.display());
    let args = vec!["-c".to_string(), script];

    let handle = manager.start("crasher", "sh", "castle-never-matches", StartPolicy::RestartExisting, &args).await?;
    let handle = match handle {
        Some(handle) => handle,
        None => anyhow::bail!("expected a new process to be started"),
    };

    // Restarts follow after 1s and then 2s more.
    let mut runs = 0;
    for _ in 0..50 {
        runs = tokio::fs::read_to_string(&marker).await.map(|out| out.lines().count()).unwrap_or(0);
        if runs >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(runs >= 2, "expected the crashed process to be restarted, got {} runs", runs);
    tokio::time::sleep(Duration::from_millis(500)).await;
    let runs = tokio::fs::read_to_string(&marker).await?.lines().count();
    assert!(runs == 2, "expected the second restart to wait out its backoff, got {} runs", runs);

    manager.stop(&handle).await?;
    Ok(())
}

#[tokio::test]
async fn reuse_policy_adopts_foreign_process() -> Result<()> {
    if !cfg!(target_os = "linux") {
        return Ok(());
    }
    let (config, _tmpdir) = Config::new_test("a", "1.2.3.4")?;
    let manager = ProcManager::new(Arc::new(config));
    let tag = format!("castle-proc-test-{}", uuid::Uuid::new_v4());
    let foreign = spawn_foreign_sleeper(&tag)?;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let adopted = manager.start("sleeper", "sh", &regex::escape(&tag), StartPolicy::ReuseExisting, &sleeper_args(&tag)).await?;
    assert!(adopted.is_none(), "expected the foreign process to be adopted, got {:?}", adopted);
    let supervised = manager.inner.procs.read().await.len();
    assert!(supervised == 0, "expected nothing new to be supervised, got {}", supervised);

    let stopped = manager.stop_matching("sh", &regex::escape(&tag)).await?;
    assert!(stopped == 1, "unexpected number of stopped processes, got {}, expected 1", stopped);
    let status = tokio::time::timeout(Duration::from_secs(5), foreign).await???;
    assert!(!status.success(), "expected the foreign process to be terminated, got {}", status);
    Ok(())
}

#[tokio::test]
async fn restart_policy_terminates_foreign_process() -> Result<()> {
    if !cfg!(target_os = "linux") {
        return Ok(());
    }
    let (config, _tmpdir) = Config::new_test("a", "1.2.3.4")?;
    let manager = ProcManager::new(Arc::new(config));
    let tag = format!("castle-proc-test-{}", uuid::Uuid::new_v4());
    let foreign = spawn_foreign_sleeper(&tag)?;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let handle = manager.start("sleeper", "sh", &regex::escape(&tag), StartPolicy::RestartExisting, &sleeper_args(&tag)).await?;
    let handle = match handle {
        Some(handle) => handle,
        None => anyhow::bail!("expected a replacement process to be started"),
    };
    let status = tokio::time::timeout(Duration::from_secs(5), foreign).await???;
    assert!(!status.success(), "expected the foreign process to be terminated, got {}", status);
    let supervised = manager.inner.procs.read().await.len();
    assert!(supervised == 1, "expected the replacement to be supervised, got {}", supervised);

    manager.stop(&handle).await?;
    Ok(())
}

#[tokio::test]
async fn start_then_stop_supervised_process() -> Result<()> {
    let (config, _tmpdir) = Config::new_test("a", "1.2.3.4")?;
    let manager = ProcManager::new(Arc::new(config));
    let tag = format!("castle-proc-test-{}", uuid::Uuid::new_v4());
    let args = sleeper_args(&tag);

    let handle = manager.start("sleeper", "sh", &regex::escape(&tag), StartPolicy::RestartExisting, &args).await?;
    let handle = match handle {
        Some(handle) => handle,
        None => anyhow::bail!("expected a new process to be started"),
    };

    // A second start with the reuse policy adopts the running process.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let adopted = manager.start("sleeper", "sh", &regex::escape(&tag), StartPolicy::ReuseExisting, &args).await?;
    if cfg!(target_os = "linux") {
        assert!(adopted.is_none(), "expected the running process to be adopted, got {:?}", adopted);
    }

    manager.stop(&handle).await?;
    let remaining = manager.inner.procs.read().await.len();
    assert!(remaining <= 1, "unexpected number of supervised processes after stop, got {}", remaining);
    manager.stop_all().await;
    let remaining = manager.inner.procs.read().await.len();
    assert!(remaining == 0, "expected no supervised processes after stop_all, got {}", remaining);
    Ok(())
}
