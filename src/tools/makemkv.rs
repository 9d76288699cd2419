// makemkvcon robot-mode driver
//
// Robot mode (`-r`) emits one record per line: `TYPE:field,field,...` with
// quoted strings. We parse the records the engine needs (drive/title info,
// progress values, messages) and ignore the rest.

use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use crate::config::ToolsConfig;
use crate::error::{Result, SpindleError};
use crate::tools::makemkvcon_path;

/// One parsed robot-mode record.
#[derive(Debug, Clone, PartialEq)]
pub enum MkvRecord {
    /// `PRGV:current,total,max` — progress values.
    ProgressValues { current: u64, max: u64 },
    /// `PRGT`/`PRGC` — current progress title/operation name.
    ProgressName(String),
    /// `TCOUNT:n` — number of titles on the disc.
    TitleCount(u32),
    /// `TINFO:title,code,flag,value` — per-title attribute.
    TitleInfo { title_id: u32, code: u32, value: String },
    /// `CINFO:code,flag,value` — per-disc attribute.
    DiscInfo { code: u32, value: String },
    /// `MSG:code,flags,count,text,...` — human-readable message.
    Message { code: i64, text: String },
    Other,
}

// TINFO attribute codes we consume
const TINFO_NAME: u32 = 2;
const TINFO_CHAPTER_COUNT: u32 = 8;
const TINFO_DURATION: u32 = 9;
const TINFO_SIZE_BYTES: u32 = 11;
const TINFO_OUTPUT_FILENAME: u32 = 27;
// CINFO attribute codes
const CINFO_TITLE: u32 = 2;
const CINFO_VOLUME_NAME: u32 = 32;

/// Split a robot-mode line into unquoted fields.
fn split_fields(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim_matches(|c| c == '"' || c == '\\').to_string())
        .collect()
}

pub fn parse_line(line: &str) -> MkvRecord {
    let trimmed = line.trim();
    let Some((type_str, rest)) = trimmed.split_once(':') else {
        return MkvRecord::Other;
    };
    let fields = split_fields(rest);
    let field = |i: usize| fields.get(i).cloned().unwrap_or_default();
    let num = |i: usize| field(i).parse::<u64>().unwrap_or(0);

    match type_str {
        "PRGV" => MkvRecord::ProgressValues {
            current: num(0),
            max: num(2).max(1),
        },
        "PRGT" | "PRGC" => MkvRecord::ProgressName(field(2)),
        "TCOUNT" => MkvRecord::TitleCount(num(0) as u32),
        "TINFO" => MkvRecord::TitleInfo {
            title_id: num(0) as u32,
            code: num(1) as u32,
            value: field(3),
        },
        "CINFO" => MkvRecord::DiscInfo {
            code: num(0) as u32,
            value: field(2),
        },
        "MSG" => MkvRecord::Message {
            code: field(0).parse().unwrap_or(0),
            text: field(3),
        },
        _ => MkvRecord::Other,
    }
}

/// Parse `H:MM:SS` (or `MM:SS`) into seconds.
fn parse_duration_seconds(raw: &str) -> Option<i64> {
    let mut seconds = 0i64;
    for part in raw.split(':') {
        seconds = seconds * 60 + part.parse::<i64>().ok()?;
    }
    Some(seconds)
}

#[derive(Debug, Clone, Default)]
pub struct TitleDetails {
    pub title_id: u32,
    pub name: String,
    pub output_filename: String,
    pub duration_seconds: Option<i64>,
    pub size_bytes: Option<u64>,
    pub chapter_count: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct DiscInfo {
    pub label: String,
    pub titles: Vec<TitleDetails>,
}

/// Fold a stream of records into a `DiscInfo`.
fn collect_disc_info(records: impl Iterator<Item = MkvRecord>) -> DiscInfo {
    let mut info = DiscInfo::default();
    for record in records {
        match record {
            MkvRecord::DiscInfo { code, value } => {
                if (code == CINFO_VOLUME_NAME || code == CINFO_TITLE) && info.label.is_empty() {
                    info.label = value;
                }
            }
            MkvRecord::TitleInfo { title_id, code, value } => {
                let idx = title_id as usize;
                if info.titles.len() <= idx {
                    info.titles.resize_with(idx + 1, TitleDetails::default);
                    info.titles[idx].title_id = title_id;
                }
                let title = &mut info.titles[idx];
                title.title_id = title_id;
                match code {
                    TINFO_NAME => title.name = value,
                    TINFO_DURATION => title.duration_seconds = parse_duration_seconds(&value),
                    TINFO_SIZE_BYTES => title.size_bytes = value.parse().ok(),
                    TINFO_CHAPTER_COUNT => title.chapter_count = value.parse().ok(),
                    TINFO_OUTPUT_FILENAME => title.output_filename = value,
                    _ => {}
                }
            }
            _ => {}
        }
    }
    info
}

/// Scan the disc in `device` and return its label and title table.
pub fn scan_disc(tools: &ToolsConfig, device: &Path, timeout: Duration) -> Result<DiscInfo> {
    let output = run_with_timeout(
        Command::new(makemkvcon_path(tools))
            .arg("-r")
            .arg("--cache=1")
            .arg("info")
            .arg(format!("dev:{}", device.display())),
        timeout,
    )?;

    let records = output.lines().map(parse_line);
    Ok(collect_disc_info(records))
}

/// Rip the given titles into `dest_dir`, reporting fraction-complete through
/// `progress` and honouring `should_stop` between output lines.
pub fn rip_titles(
    tools: &ToolsConfig,
    device: &Path,
    title_ids: &[u32],
    dest_dir: &Path,
    mut progress: impl FnMut(f64, &str),
    should_stop: impl Fn() -> bool,
) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dest_dir)?;

    for &title_id in title_ids {
        let mut child = Command::new(makemkvcon_path(tools))
            .arg("-r")
            .arg("--progress=-same")
            .arg("mkv")
            .arg(format!("dev:{}", device.display()))
            .arg(title_id.to_string())
            .arg(dest_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| SpindleError::ExternalTool(format!("failed to run makemkvcon: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpindleError::Internal("makemkvcon stdout unavailable".to_string()))?;
        let reader = BufReader::new(stdout);
        let mut operation = String::new();

        for line in reader.lines() {
            if should_stop() {
                let _ = child.kill();
                let _ = child.wait();
                return Err(SpindleError::Stopped);
            }
            let line = line?;
            match parse_line(&line) {
                MkvRecord::ProgressValues { current, max } => {
                    progress(current as f64 / max as f64, &operation);
                }
                MkvRecord::ProgressName(name) => operation = name,
                MkvRecord::Message { code, text } => {
                    log::debug!("makemkvcon [{}]: {}", code, text);
                }
                _ => {}
            }
        }

        let status = child.wait()?;
        if !status.success() {
            return Err(SpindleError::ExternalTool(format!(
                "makemkvcon exited with {} ripping title {} (verify the disc is readable)",
                status.code().map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()),
                title_id
            )));
        }
    }

    // makemkvcon names outputs itself; report what landed in the directory
    let mut produced: Vec<PathBuf> = std::fs::read_dir(dest_dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.extension()
                .map(|e| e.to_string_lossy().eq_ignore_ascii_case("mkv"))
                .unwrap_or(false)
        })
        .collect();
    produced.sort();
    Ok(produced)
}

/// Run a command to completion with a deadline, returning stdout.
fn run_with_timeout(command: &mut Command, timeout: Duration) -> Result<String> {
    let mut child = command
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| SpindleError::ExternalTool(format!("failed to run makemkvcon: {}", e)))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| SpindleError::Internal("makemkvcon stdout unavailable".to_string()))?;

    let deadline = Instant::now() + timeout;
    let reader_thread = std::thread::spawn(move || {
        let mut collected = String::new();
        let reader = BufReader::new(stdout);
        for line in reader.lines().map_while(|l| l.ok()) {
            collected.push_str(&line);
            collected.push('\n');
        }
        collected
    });

    loop {
        match child.try_wait()? {
            Some(status) => {
                let output = reader_thread.join().unwrap_or_default();
                if !status.success() {
                    return Err(SpindleError::ExternalTool(format!(
                        "makemkvcon info exited with {}",
                        status.code().map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string())
                    )));
                }
                return Ok(output);
            }
            None if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(SpindleError::ExternalTool(
                    "makemkvcon info timed out (is a disc inserted?)".to_string(),
                ));
            }
            None => std::thread::sleep(Duration::from_millis(200)),
        }
    }
}
