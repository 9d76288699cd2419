// External tool resolution
//
// Resolution order:
// 1) Environment variable override (SPINDLE_MAKEMKVCON_PATH, etc.)
// 2) Configured path
// 3) PATH fallback

pub mod drapto;
pub mod ffprobe;
pub mod makemkv;
pub mod mkvmerge;

use std::env;
use std::path::PathBuf;
use std::process::Command;

use crate::config::ToolsConfig;

/// Resolve one tool binary.
fn resolve_tool(env_key: &str, configured: Option<&PathBuf>, default_name: &str) -> PathBuf {
    if let Ok(v) = env::var(env_key) {
        let p = PathBuf::from(&v);
        if p.exists() {
            return p;
        }
    }

    if let Some(p) = configured {
        return p.clone();
    }

    PathBuf::from(default_name)
}

pub fn makemkvcon_path(tools: &ToolsConfig) -> PathBuf {
    resolve_tool("SPINDLE_MAKEMKVCON_PATH", tools.makemkvcon.as_ref(), "makemkvcon")
}

pub fn drapto_path(tools: &ToolsConfig) -> PathBuf {
    resolve_tool("SPINDLE_DRAPTO_PATH", tools.drapto.as_ref(), "drapto")
}

pub fn ffprobe_path(tools: &ToolsConfig) -> PathBuf {
    resolve_tool("SPINDLE_FFPROBE_PATH", tools.ffprobe.as_ref(), "ffprobe")
}

pub fn mkvmerge_path(tools: &ToolsConfig) -> PathBuf {
    resolve_tool("SPINDLE_MKVMERGE_PATH", tools.mkvmerge.as_ref(), "mkvmerge")
}

/// Check a tool answers a version probe at its resolved path.
pub fn is_tool_available(tools: &ToolsConfig, tool: &str) -> bool {
    let (path, probe_arg) = match tool {
        "makemkvcon" => (makemkvcon_path(tools), "info"),
        "drapto" => (drapto_path(tools), "--version"),
        "ffprobe" => (ffprobe_path(tools), "-version"),
        "mkvmerge" => (mkvmerge_path(tools), "--version"),
        _ => return false,
    };

    // makemkvcon has no clean version flag; an existing binary is enough
    if tool == "makemkvcon" {
        if path.exists() {
            return true;
        }
        let _ = probe_arg;
        return which(&path);
    }

    Command::new(&path)
        .arg(probe_arg)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn which(path: &PathBuf) -> bool {
    let Some(name) = path.to_str() else {
        return false;
    };
    env::var_os("PATH")
        .map(|paths| {
            env::split_paths(&paths).any(|dir| dir.join(name).exists())
        })
        .unwrap_or(false)
}
