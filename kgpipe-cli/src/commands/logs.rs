//! `kgpipe logs`: print a stage's captured output.

use anyhow::{bail, Result};
use kgpipe::config::PipelineConfig;
use kgpipe::core::StageName;
use kgpipe::process::read_log_tail;
use kgpipe::volume::SharedVolume;
use std::path::Path;

/// Prints the stage log, or its last `tail` lines.
pub fn run(config: &PipelineConfig, stage: StageName, tail: Option<usize>) -> Result<u8> {
    let volume = SharedVolume::new(config.volume_root());
    print!("{}", read(&volume.log_path(stage), stage, tail)?);
    Ok(0)
}

fn read(path: &Path, stage: StageName, tail: Option<usize>) -> Result<String> {
    if !path.is_file() {
        bail!("no log for stage '{stage}' at {}", path.display());
    }
    let text = match tail {
        Some(lines) => read_log_tail(path, lines) + "\n",
        None => std::fs::read_to_string(path)?,
    };
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_tail_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("build.log");
        std::fs::write(&path, "==> build\nloading\ndone\n").unwrap();

        assert_eq!(read(&path, StageName::Build, Some(1)).unwrap(), "done\n");
        assert_eq!(
            read(&path, StageName::Build, None).unwrap(),
            "==> build\nloading\ndone\n"
        );
        let err = read(&dir.path().join("deploy.log"), StageName::Deploy, None).unwrap_err();
        assert!(err.to_string().contains("no log for stage 'deploy'"));
    }
}
