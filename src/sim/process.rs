//! # Simulator Process
//!
//! Starts the SITL executable pointed at our dataref listener and makes
//! sure it is gone at the end of the session.

use std::process::{ExitStatus, Stdio};

use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::config::SimulatorConfig;
use crate::error::{BridgeError, Result};

/// Command-line arguments for the SITL executable
///
/// `--sim=xp` selects the X-Plane bridge; `--simip`/`--simport` tell it
/// where we listen; `--path` selects the EEPROM image. Configured extra
/// arguments come last.
pub fn build_args(config: &SimulatorConfig) -> Vec<String> {
    let mut args = vec![
        "--sim=xp".to_string(),
        format!("--simip={}", config.ip),
        format!("--simport={}", config.port),
    ];
    if let Some(path) = config.eeprom_path() {
        args.push(format!("--path={}", path.display()));
    }
    args.extend(config.args.iter().cloned());
    args
}

/// A running simulator child process
#[derive(Debug)]
pub struct SimulatorProcess {
    child: Child,
    program: String,
}

impl SimulatorProcess {
    /// Start the configured simulator
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Simulator`] if the executable cannot be started.
    pub fn spawn(config: &SimulatorConfig) -> Result<Self> {
        let args = build_args(config);
        debug!("Starting {} {}", config.executable, args.join(" "));

        let child = Command::new(&config.executable)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                BridgeError::Simulator(format!("cannot start {}: {}", config.executable, e))
            })?;

        info!(
            "Started simulator {} (pid {})",
            config.executable,
            child.id().unwrap_or_default()
        );
        Ok(Self {
            child,
            program: config.executable.clone(),
        })
    }

    /// Process id, if still running
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Kill the simulator and reap it
    pub async fn terminate(mut self) -> Result<ExitStatus> {
        if let Err(e) = self.child.start_kill() {
            // Already exited; wait() still reaps it
            debug!("{} kill: {}", self.program, e);
        }
        let status = self.child.wait().await?;
        if status.success() {
            info!("Simulator {} exited", self.program);
        } else {
            warn!("Simulator {} ended: {}", self.program, status);
        }
        Ok(status)
    }
}
