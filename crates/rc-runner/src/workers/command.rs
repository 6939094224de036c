//! Out-of-process optimizer: one child process per trial.
//!
//! The executable is invoked as
//! `<exec> <args…> --data <file> --out <staging> --device <index>`
//! followed by `--host <name>` and `--hostfile <path>` on cluster runs,
//! `--prev <dir>` for warm starts, `--generation <g>` inside GA,
//! and `--alpha <image> --breed-mode <m> --sw-threshold <t> --sw-sigma <s>`
//! when breeding. A zero exit status means success; the process leaves
//! `metrics.json` and `image.npy` in the staging directory.

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::{debug, warn};
use wait_timeout::ChildExt;

use rc_types::{Device, IterationSeed, MetricMap, Trial, TrialError};

use crate::worker::{Worker, WorkerFactory};

pub const METRICS_FILE: &str = "metrics.json";
pub const LOG_FILE: &str = "worker.log";

pub struct CommandFactory {
    exec: PathBuf,
    args: Vec<String>,
}

impl CommandFactory {
    pub fn new(exec: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            exec: exec.into(),
            args,
        }
    }
}

impl WorkerFactory for CommandFactory {
    fn create(&self, trial: &Trial) -> Result<Box<dyn Worker>, TrialError> {
        if !self.exec.is_file() {
            return Err(TrialError::Spawn {
                message: format!("optimizer executable {} not found", self.exec.display()),
            });
        }
        Ok(Box::new(CommandWorker {
            exec: self.exec.clone(),
            args: self.args.clone(),
            datafile: trial.datafile.clone(),
            staging: staging_dir(&trial.out_dir),
            timeout: trial.config.trial_timeout_secs,
            hostfile: trial.hostfile.clone(),
            device: None,
            host: None,
            seed: IterationSeed::random(),
            saved: None,
        }))
    }

    fn name(&self) -> &str {
        "command"
    }
}

/// Scratch directory the child writes into before the result is published.
fn staging_dir(out_dir: &Path) -> PathBuf {
    out_dir.with_extension("partial")
}

struct CommandWorker {
    exec: PathBuf,
    args: Vec<String>,
    datafile: PathBuf,
    staging: PathBuf,
    timeout: Option<u64>,
    hostfile: Option<PathBuf>,
    device: Option<i64>,
    host: Option<String>,
    seed: IterationSeed,
    saved: Option<PathBuf>,
}

impl CommandWorker {
    fn command(&self, device: i64) -> Command {
        let mut command = Command::new(&self.exec);
        command
            .args(&self.args)
            .arg("--data")
            .arg(&self.datafile)
            .arg("--out")
            .arg(&self.staging)
            .arg("--device")
            .arg(device.to_string());

        if let Some(host) = &self.host {
            command.arg("--host").arg(host);
        }
        if let Some(hostfile) = &self.hostfile {
            command.arg("--hostfile").arg(hostfile);
        }
        if let Some(prev) = &self.seed.prev_dir {
            command.arg("--prev").arg(prev);
        }
        if let Some(generation) = self.seed.generation {
            command.arg("--generation").arg(generation.to_string());
        }
        if let Some(breeding) = &self.seed.breeding {
            command
                .arg("--alpha")
                .arg(&breeding.alpha_image)
                .arg("--breed-mode")
                .arg(&breeding.mode)
                .arg("--sw-threshold")
                .arg(breeding.sw_threshold.to_string())
                .arg("--sw-sigma")
                .arg(breeding.sw_gauss_sigma.to_string());
        }
        command
    }
}

fn iteration_error(message: impl Into<String>) -> TrialError {
    TrialError::Iteration {
        message: message.into(),
    }
}

impl Worker for CommandWorker {
    fn init_device(&mut self, device: &Device) -> Result<(), TrialError> {
        self.device = Some(device.index());
        self.host = device.host.clone();
        Ok(())
    }

    fn init_iteration_state(&mut self, seed: &IterationSeed) -> Result<(), TrialError> {
        if let Some(prev) = &seed.prev_dir {
            if !prev.is_dir() {
                return Err(TrialError::IterationInit {
                    message: format!("previous result {} does not exist", prev.display()),
                });
            }
        }
        if let Some(breeding) = &seed.breeding {
            if !breeding.alpha_image.is_file() {
                return Err(TrialError::IterationInit {
                    message: format!("alpha image {} does not exist", breeding.alpha_image.display()),
                });
            }
        }
        self.seed = seed.clone();
        Ok(())
    }

    fn iterate(&mut self) -> Result<(), TrialError> {
        let device = self.device.ok_or_else(|| iteration_error("device was not initialized"))?;

        if self.staging.exists() {
            fs::remove_dir_all(&self.staging).map_err(|e| iteration_error(e.to_string()))?;
        }
        fs::create_dir_all(&self.staging).map_err(|e| iteration_error(e.to_string()))?;
        let log = File::create(self.staging.join(LOG_FILE)).map_err(|e| iteration_error(e.to_string()))?;
        let log_err = log.try_clone().map_err(|e| iteration_error(e.to_string()))?;

        let mut child = self
            .command(device)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .spawn()
            .map_err(|e| TrialError::Spawn {
                message: format!("{}: {e}", self.exec.display()),
            })?;
        debug!(pid = child.id(), exec = ?self.exec, device, "Optimizer process started");

        let status = match self.timeout {
            Some(seconds) => match child
                .wait_timeout(Duration::from_secs(seconds))
                .map_err(|e| iteration_error(e.to_string()))?
            {
                Some(status) => status,
                None => {
                    warn!(pid = child.id(), timeout_seconds = seconds, "Optimizer process timed out");
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(TrialError::Timeout {
                        timeout_seconds: seconds,
                    });
                }
            },
            None => child.wait().map_err(|e| iteration_error(e.to_string()))?,
        };

        if status.success() {
            Ok(())
        } else {
            Err(iteration_error(format!(
                "optimizer exited with {status}, see {}",
                self.staging.join(LOG_FILE).display()
            )))
        }
    }

    fn save_result(&mut self, dir: &Path) -> Result<(), TrialError> {
        let save_error = |e: std::io::Error| TrialError::Save {
            dir: dir.display().to_string(),
            message: e.to_string(),
        };
        if dir.exists() {
            fs::remove_dir_all(dir).map_err(save_error)?;
        }
        if let Some(parent) = dir.parent() {
            fs::create_dir_all(parent).map_err(save_error)?;
        }
        fs::rename(&self.staging, dir).map_err(save_error)?;
        self.saved = Some(dir.to_path_buf());
        Ok(())
    }

    fn metric(&self) -> Result<MetricMap, TrialError> {
        let dir = self.saved.as_ref().ok_or_else(|| TrialError::Metric {
            message: "result was not saved".into(),
        })?;
        let path = dir.join(METRICS_FILE);
        let text = fs::read_to_string(&path).map_err(|e| TrialError::Metric {
            message: format!("{}: {e}", path.display()),
        })?;
        serde_json::from_str(&text).map_err(|e| TrialError::Metric {
            message: format!("{}: {e}", path.display()),
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::worker::run_trial;
    use rc_types::{RecConfig, TrialSpec};
    use std::sync::Arc;

    /// Runs `body` through `/bin/sh` so the test never executes a file it just wrote.
    fn factory(dir: &Path, body: &str) -> CommandFactory {
        let path = dir.join("optimizer.sh");
        fs::write(&path, body).unwrap();
        CommandFactory::new("/bin/sh", vec![path.display().to_string()])
    }

    const WRITES_RESULT: &str = r#"
while [ $# -gt 0 ]; do
  case "$1" in
    --out) out="$2"; shift ;;
    --device) device="$2"; shift ;;
  esac
  shift
done
echo "running on $device"
printf 'image' > "$out/image.npy"
printf '{"chi": 0.25, "device": %s}' "$device" > "$out/metrics.json"
"#;

    /// Writes its argument list, one per line, next to the script.
    const RECORDS_ARGS: &str = r#"
printf '%s\n' "$@" > "$(dirname "$0")/args.txt"
while [ $# -gt 0 ]; do
  case "$1" in
    --out) out="$2"; shift ;;
  esac
  shift
done
printf '{"chi": 0.5}' > "$out/metrics.json"
"#;

    fn trial(dir: &Path, config: RecConfig) -> Trial {
        TrialSpec::new(0, Arc::new(config), dir.join("data.tif"), dir.join("out").join("0"))
            .bind(Device::gpu(2, 0))
    }

    #[test]
    fn successful_process_publishes_result() {
        let dir = tempfile::tempdir().unwrap();
        let factory = factory(dir.path(), WRITES_RESULT);
        let trial = trial(dir.path(), RecConfig::default());

        let result = run_trial(&factory, &trial);
        let metrics = result.metric().unwrap();
        assert_eq!(metrics.get("chi"), Some(&0.25));
        assert_eq!(metrics.get("device"), Some(&2.0));
        assert!(trial.out_dir.join("image.npy").exists());
        assert!(!staging_dir(&trial.out_dir).exists());
    }

    #[test]
    fn cluster_placement_reaches_the_process() {
        let dir = tempfile::tempdir().unwrap();
        let factory = factory(dir.path(), RECORDS_ARGS);
        let hostfile = dir.path().join("hostfile_run1");
        let trial = TrialSpec::new(
            0,
            Arc::new(RecConfig::default()),
            dir.path().join("data.tif"),
            dir.path().join("out").join("0"),
        )
        .with_hostfile(Some(hostfile.clone()))
        .bind(Device::gpu(1, 0).on_host("node2"));

        assert!(run_trial(&factory, &trial).is_success());
        let args: Vec<String> = fs::read_to_string(dir.path().join("args.txt"))
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect();
        let after = |flag: &str| {
            args.iter()
                .position(|a| a == flag)
                .map(|i| args[i + 1].clone())
        };
        assert_eq!(after("--device").as_deref(), Some("1"));
        assert_eq!(after("--host").as_deref(), Some("node2"));
        assert_eq!(after("--hostfile"), Some(hostfile.display().to_string()));
    }

    #[test]
    fn local_trial_has_no_host_arguments() {
        let dir = tempfile::tempdir().unwrap();
        let factory = factory(dir.path(), RECORDS_ARGS);
        let trial = trial(dir.path(), RecConfig::default());
        assert!(run_trial(&factory, &trial).is_success());
        let args = fs::read_to_string(dir.path().join("args.txt")).unwrap();
        assert!(!args.lines().any(|a| a == "--host" || a == "--hostfile"));
    }

    #[test]
    fn failing_process_leaves_no_result() {
        let dir = tempfile::tempdir().unwrap();
        let factory = factory(dir.path(), "exit 3");
        let trial = trial(dir.path(), RecConfig::default());

        let result = run_trial(&factory, &trial);
        assert!(result.failure_reason().unwrap().contains("during iterations"));
        assert!(!trial.out_dir.exists());
    }

    #[test]
    fn slow_process_is_killed() {
        let dir = tempfile::tempdir().unwrap();
        let factory = factory(dir.path(), "exec sleep 30");
        let mut config = RecConfig::default();
        config.trial_timeout_secs = Some(1);
        let trial = trial(dir.path(), config);

        let result = run_trial(&factory, &trial);
        assert!(result.failure_reason().unwrap().contains("deadline of 1 seconds"));
    }

    #[test]
    fn missing_executable() {
        let dir = tempfile::tempdir().unwrap();
        let factory = CommandFactory::new(dir.path().join("nope"), vec![]);
        let result = run_trial(&factory, &trial(dir.path(), RecConfig::default()));
        assert!(result.failure_reason().unwrap().contains("not found"));
    }

    #[test]
    fn missing_previous_result_fails_init() {
        let dir = tempfile::tempdir().unwrap();
        let factory = factory(dir.path(), WRITES_RESULT);
        let trial = TrialSpec::new(
            0,
            Arc::new(RecConfig::default()),
            dir.path().join("data.tif"),
            dir.path().join("out"),
        )
        .with_seed(IterationSeed::continue_from(dir.path().join("gone")))
        .bind(Device::cpu(0));

        let result = run_trial(&factory, &trial);
        assert!(result.failure_reason().unwrap().contains("does not exist"));
    }
}
