// drapto encoder driver
//
// drapto prints one JSON object per stdout line when run with
// `--progress-json`; anything unparseable is passed through to the debug log.

use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::{Command, Stdio};

use serde::Deserialize;

use crate::config::ToolsConfig;
use crate::error::{Result, SpindleError};
use crate::tools::drapto_path;

#[derive(Debug, Deserialize)]
struct ProgressLine {
    #[serde(default)]
    percent: Option<f64>,
    #[serde(default)]
    stage: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

/// Encode `input` into `output`, reporting percent-complete through
/// `progress` and honouring `should_stop` between progress lines.
pub fn encode(
    tools: &ToolsConfig,
    input: &Path,
    output: &Path,
    mut progress: impl FnMut(f64, &str),
    should_stop: impl Fn() -> bool,
) -> Result<()> {
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let mut child = Command::new(drapto_path(tools))
        .arg("encode")
        .arg("--input")
        .arg(input)
        .arg("--output")
        .arg(output)
        .arg("--progress-json")
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| SpindleError::ExternalTool(format!("failed to run drapto: {}", e)))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| SpindleError::Internal("drapto stdout unavailable".to_string()))?;

    for line in BufReader::new(stdout).lines() {
        if should_stop() {
            let _ = child.kill();
            let _ = child.wait();
            return Err(SpindleError::Stopped);
        }
        let line = line?;
        match serde_json::from_str::<ProgressLine>(&line) {
            Ok(update) => {
                let label = update
                    .stage
                    .or(update.message)
                    .unwrap_or_else(|| "encoding".to_string());
                if let Some(percent) = update.percent {
                    progress(percent.clamp(0.0, 100.0), &label);
                }
            }
            Err(_) => log::debug!("drapto: {}", line),
        }
    }

    let status = child.wait()?;
    if !status.success() {
        return Err(SpindleError::ExternalTool(format!(
            "drapto exited with {} encoding {} (check the input file is intact)",
            status.code().map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()),
            input.display()
        )));
    }

    if !output.exists() {
        return Err(SpindleError::ExternalTool(format!(
            "drapto reported success but produced no output at {}",
            output.display()
        )));
    }

    Ok(())
}
