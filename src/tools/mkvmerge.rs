// mkvmerge wrapper for muxing subtitles into a container

use std::path::Path;
use std::process::Command;

use crate::config::ToolsConfig;
use crate::error::{Result, SpindleError};
use crate::tools::mkvmerge_path;

/// Mux `subtitle` into `input`, writing the combined container to `output`.
pub fn mux_subtitle(
    tools: &ToolsConfig,
    input: &Path,
    subtitle: &Path,
    language: &str,
    output: &Path,
) -> Result<()> {
    if let Some(parent) = output.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let result = Command::new(mkvmerge_path(tools))
        .arg("-o")
        .arg(output)
        .arg(input)
        .arg("--language")
        .arg(format!("0:{}", language))
        .arg(subtitle)
        .output()
        .map_err(|e| SpindleError::ExternalTool(format!("failed to run mkvmerge: {}", e)))?;

    // mkvmerge exit 1 is warnings-only; treat it as success
    match result.status.code() {
        Some(0) | Some(1) => Ok(()),
        code => Err(SpindleError::ExternalTool(format!(
            "mkvmerge exited with {} muxing {}: {}",
            code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()),
            input.display(),
            String::from_utf8_lossy(&result.stdout).trim()
        ))),
    }
}
