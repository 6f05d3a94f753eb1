/// Functions and structs for building external tool command lines and running them

use std::process::{Output, Stdio};

use anyhow::{anyhow, Result};
use log::debug;
use tokio::process::Command;

use crate::config::defs::{PipelineError, COUNT_TOOL_TAG, MACS2_TAG, TOOL_VERSIONS};
use crate::utils::streams::{read_child_output_to_vec, ChildStream};


pub mod macs2 {
    use std::path::{Path, PathBuf};
    use crate::config::defs::{Macs2Subcommand, MACS2_FORMAT, MACS2_KEEP_DUP};

    #[derive(Debug, Clone)]
    pub struct Macs2Config {
        pub subcommand: Macs2Subcommand,
        pub name: String,
        pub genome_size: String,
        pub qvalue: f64,
        pub extsize: u32,
    }

    pub fn arg_generator(config: &Macs2Config, tracks: &[PathBuf], out_dir: &Path) -> Vec<String> {
        let mut args_vec: Vec<String> = Vec::new();
        match config.subcommand {
            Macs2Subcommand::Callpeak => args_vec.push("callpeak".to_string()),
        }

        // One joint call, every sample is its own treatment track
        args_vec.push("-t".to_string());
        for track in tracks {
            args_vec.push(track.to_string_lossy().to_string());
        }
        args_vec.push("-f".to_string());
        args_vec.push(MACS2_FORMAT.to_string());
        args_vec.push("-g".to_string());
        args_vec.push(config.genome_size.clone());
        args_vec.push("--outdir".to_string());
        args_vec.push(out_dir.to_string_lossy().to_string());
        args_vec.push("-n".to_string());
        args_vec.push(config.name.clone());
        args_vec.push("-q".to_string());
        args_vec.push(config.qvalue.to_string());
        args_vec.push("--nomodel".to_string());
        args_vec.push("--shift".to_string());
        args_vec.push("0".to_string());
        args_vec.push("--extsize".to_string());
        args_vec.push(config.extsize.to_string());
        args_vec.push("--keep-dup".to_string());
        args_vec.push(MACS2_KEEP_DUP.to_string());
        args_vec
    }
}

pub mod count_tool {
    use std::path::Path;

    #[derive(Debug, Clone)]
    pub struct CountToolConfig {
        pub species: String,
        pub out_prefix: String,
    }

    /// Binary output mode, grouped count table, species tag, output directory, filename prefix.
    pub fn arg_generator(config: &CountToolConfig, count_table: &Path, out_dir: &Path) -> Vec<String> {
        let mut args_vec: Vec<String> = Vec::new();
        args_vec.push("--binary".to_string());
        args_vec.push("--matrix".to_string());
        args_vec.push(count_table.to_string_lossy().to_string());
        args_vec.push("--species".to_string());
        args_vec.push(config.species.clone());
        args_vec.push("--directory".to_string());
        args_vec.push(out_dir.to_string_lossy().to_string());
        args_vec.push("--outprefix".to_string());
        args_vec.push(config.out_prefix.clone());
        args_vec
    }
}


/// Asks a tool for its version and returns the version token.
///
/// # Arguments
///
/// * `tool` - Tool tag from config::defs.
/// * `program` - Executable to run (may be a full path).
///
/// # Returns
/// Version string, e.g. "2.2.7.1".
pub async fn check_version(tool: &str, program: &str) -> Result<String> {
    let mut child = Command::new(program)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| anyhow!("Failed to spawn {}: {}. Is {} installed?", program, e, tool))?;

    let mut lines = read_child_output_to_vec(&mut child, ChildStream::Stdout).await?;
    if lines.is_empty() {
        // macs2 < 2.2 reports its version on stderr
        lines = read_child_output_to_vec(&mut child, ChildStream::Stderr).await?;
    }
    child.wait().await?;

    let first_line = lines
        .first()
        .ok_or_else(|| anyhow!("No output from {} --version", program))?;
    let version = first_line
        .split_whitespace()
        .last()
        .ok_or_else(|| anyhow!("Invalid {} --version output: {}", program, first_line))?
        .to_string();

    if let Some(min_version) = TOOL_VERSIONS.get(tool) {
        let found = major_minor(&version)
            .ok_or_else(|| anyhow!("Unparseable {} version: {}", tool, version))?;
        if found < *min_version {
            return Err(anyhow!(
                "{} version {} is older than required {}.{}",
                tool,
                version,
                min_version.0,
                min_version.1
            ));
        }
    }
    Ok(version)
}

fn major_minor(version: &str) -> Option<(u32, u32)> {
    let mut parts = version.trim_start_matches('v').split('.');
    let major = parts.next()?.parse::<u32>().ok()?;
    let minor = match parts.next() {
        Some(minor) => minor.parse::<u32>().ok()?,
        None => 0,
    };
    Some((major, minor))
}


/// Runs a tool to completion and fails with ToolExecution on a non-zero exit.
pub async fn run_tool(tool: &str, program: &str, args: &[String]) -> Result<Output, PipelineError> {
    debug!("Running {} {}", program, args.join(" "));
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .map_err(|e| PipelineError::ToolExecution {
            tool: tool.to_string(),
            error: format!("failed to spawn {}: {}", program, e),
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: Vec<&str> = stderr.lines().rev().take(20).collect::<Vec<_>>().into_iter().rev().collect();
        return Err(PipelineError::ToolExecution {
            tool: tool.to_string(),
            error: format!("exited with {}: {}", output.status, tail.join("\n")),
        });
    }
    Ok(output)
}

/// Presence checks for every tool the run will invoke.
pub async fn check_versions(macs2_program: Option<&str>, count_tool_program: Option<&str>) -> Result<Vec<(String, String)>> {
    let mut versions = Vec::new();
    if let Some(program) = macs2_program {
        versions.push((MACS2_TAG.to_string(), check_version(MACS2_TAG, program).await?));
    }
    if let Some(program) = count_tool_program {
        versions.push((COUNT_TOOL_TAG.to_string(), check_version(COUNT_TOOL_TAG, program).await?));
    }
    Ok(versions)
}
