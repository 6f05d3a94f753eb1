// src/utils/streams.rs
use anyhow::{anyhow, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChildStream {
    Stdout,
    Stderr,
}

/// Drains one output stream of a child process into lines.
///
/// # Arguments
///
/// * `child` - Spawned child with piped stdout/stderr.
/// * `stream` - Which of the two streams to read.
///
/// # Returns
/// Vec of lines, without newlines.
pub async fn read_child_output_to_vec(child: &mut Child, stream: ChildStream) -> Result<Vec<String>> {
    let mut lines = Vec::new();
    match stream {
        ChildStream::Stdout => {
            let stdout = child.stdout.take().ok_or_else(|| anyhow!("Child stdout was not piped"))?;
            let mut reader = BufReader::new(stdout).lines();
            while let Some(line) = reader.next_line().await? {
                lines.push(line);
            }
        }
        ChildStream::Stderr => {
            let stderr = child.stderr.take().ok_or_else(|| anyhow!("Child stderr was not piped"))?;
            let mut reader = BufReader::new(stderr).lines();
            while let Some(line) = reader.next_line().await? {
                lines.push(line);
            }
        }
    }
    Ok(lines)
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;
    use tokio::process::Command;

    #[tokio::test]
    async fn test_read_child_output_to_vec() -> Result<()> {
        let mut child = Command::new("sh")
            .args(["-c", "printf 'a\\nb\\n'; printf 'err\\n' 1>&2"])
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        let out = read_child_output_to_vec(&mut child, ChildStream::Stdout).await?;
        let err = read_child_output_to_vec(&mut child, ChildStream::Stderr).await?;
        child.wait().await?;
        assert_eq!(out, vec!["a", "b"]);
        assert_eq!(err, vec!["err"]);
        Ok(())
    }
}
