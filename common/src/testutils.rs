use crate::job::SyncJob;
use crate::transfer::Transport;

pub async fn setup_test_dir() -> anyhow::Result<tempfile::TempDir> {
    // create a temporary directory
    let tmp_dir = tempfile::tempdir()?;
    // foo
    // |- 0.txt
    // |- bar
    //    |- 1.txt
    //    |- 2.txt
    //    |- 3.txt
    // |- baz
    //    |- 4.txt
    //    |- 5.txt -> ../bar/2.txt
    //    |- deep
    //       |- 6.txt
    let foo_path = tmp_dir.path().join("foo");
    tokio::fs::create_dir(&foo_path).await.unwrap();
    tokio::fs::write(foo_path.join("0.txt"), "0").await.unwrap();
    let bar_path = foo_path.join("bar");
    tokio::fs::create_dir(&bar_path).await.unwrap();
    tokio::fs::write(bar_path.join("1.txt"), "1").await.unwrap();
    tokio::fs::write(bar_path.join("2.txt"), "2").await.unwrap();
    tokio::fs::write(bar_path.join("3.txt"), "3").await.unwrap();
    let baz_path = foo_path.join("baz");
    tokio::fs::create_dir(&baz_path).await.unwrap();
    tokio::fs::write(baz_path.join("4.txt"), "4").await.unwrap();
    tokio::fs::symlink("../bar/2.txt", baz_path.join("5.txt"))
        .await
        .unwrap();
    let deep_path = baz_path.join("deep");
    tokio::fs::create_dir(&deep_path).await.unwrap();
    tokio::fs::write(deep_path.join("6.txt"), "6").await.unwrap();
    Ok(tmp_dir)
}

/// Job for `/src/<name>` without touching the filesystem.
pub fn sample_job(name: &str) -> SyncJob {
    let marker = crate::job::partial_marker(std::ffi::OsStr::new(name));
    let mut transfer_options = crate::transfer::Settings::default().transfer_options();
    transfer_options.push(format!("--partial-dir={}{}", crate::job::PARTIAL_DIR_PREFIX, marker));
    SyncJob {
        source_path: std::path::Path::new("/src").join(name),
        destination_dir: std::path::PathBuf::from("/dst/src"),
        remote_address: "u@h".to_string(),
        ssh_command: "ssh -p 22".to_string(),
        transfer_options,
        partial_marker: marker,
    }
}

#[derive(Default)]
struct FakeState {
    calls: Vec<(tokio::time::Instant, Vec<std::ffi::OsString>)>,
    failures: std::collections::HashMap<Vec<std::ffi::OsString>, u32>,
    running: usize,
    peak: usize,
}

/// Transport that never spawns anything and fails on demand.
///
/// Failures are counted per distinct argument list, i.e. per job.
pub struct FakeTransport {
    /// `None` fails every attempt.
    fail_first: Option<u32>,
    duration: std::time::Duration,
    state: std::sync::Mutex<FakeState>,
}

impl FakeTransport {
    pub fn failing_first(failures: u32) -> Self {
        Self {
            fail_first: Some(failures),
            duration: std::time::Duration::ZERO,
            state: Default::default(),
        }
    }

    pub fn always_failing() -> Self {
        Self {
            fail_first: None,
            duration: std::time::Duration::ZERO,
            state: Default::default(),
        }
    }

    /// Every attempt takes `duration` before reporting its result.
    pub fn taking(mut self, duration: std::time::Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn calls(&self) -> Vec<Vec<std::ffi::OsString>> {
        let state = self.state.lock().unwrap();
        state.calls.iter().map(|(_, args)| args.clone()).collect()
    }

    pub fn call_times(&self) -> Vec<tokio::time::Instant> {
        let state = self.state.lock().unwrap();
        state.calls.iter().map(|(time, _)| *time).collect()
    }

    /// Highest number of attempts that were running at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.state.lock().unwrap().peak
    }
}

impl Transport for FakeTransport {
    async fn run(&self, args: &[std::ffi::OsString]) -> anyhow::Result<()> {
        let fail = {
            let mut state = self.state.lock().unwrap();
            state.calls.push((tokio::time::Instant::now(), args.to_vec()));
            state.running += 1;
            state.peak = std::cmp::max(state.peak, state.running);
            let failed_so_far = state.failures.entry(args.to_vec()).or_default();
            match self.fail_first {
                Some(limit) if *failed_so_far >= limit => false,
                _ => {
                    *failed_so_far += 1;
                    true
                }
            }
        };
        if !self.duration.is_zero() {
            tokio::time::sleep(self.duration).await;
        }
        self.state.lock().unwrap().running -= 1;
        if fail {
            anyhow::bail!("simulated transfer failure");
        }
        Ok(())
    }
}
