//! Command construction boundary.
//!
//! The core treats the external tool's invocation as an opaque argument
//! vector; collaborators implement [`CommandBuilder`] to supply it.

use std::path::{Path, PathBuf};

use crate::error::RunnerError;
use crate::job::Job;
use crate::settings::Settings;

/// An executable invocation plus the output path it will produce.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub output_path: PathBuf,
}

/// Turns a job descriptor into an executable command.
pub trait CommandBuilder: Send + Sync {
    fn build(&self, job: &Job, settings: &Settings) -> Result<Invocation, RunnerError>;
}

/// Default builder for the HandBrake CLI.
pub struct HandBrakeCommand {
    cli_path: PathBuf,
    source_directory: PathBuf,
}

impl HandBrakeCommand {
    pub fn new(cli_path: impl Into<PathBuf>, source_directory: impl Into<PathBuf>) -> Self {
        Self {
            cli_path: cli_path.into(),
            source_directory: source_directory.into(),
        }
    }
}

impl CommandBuilder for HandBrakeCommand {
    fn build(&self, job: &Job, settings: &Settings) -> Result<Invocation, RunnerError> {
        let input_path = self.source_directory.join(&job.file_name);
        let output_path = settings.output_directory.join(&job.output_file_name);

        if let Some(parent) = output_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut args = vec![
            "--input".to_string(),
            input_path.to_string_lossy().to_string(),
            "--output".to_string(),
            output_path.to_string_lossy().to_string(),
            "--title".to_string(),
            job.title_number.to_string(),
            "--preset".to_string(),
            job.preset.clone(),
        ];

        // Testing mode trims the encode via the tool's own parameters
        if settings.testing_mode {
            args.push("--start-at".to_string());
            args.push("seconds:0".to_string());
            args.push("--stop-at".to_string());
            args.push(format!("seconds:{}", settings.test_duration_seconds));
        }

        Ok(Invocation {
            program: self.cli_path.to_string_lossy().to_string(),
            args,
            output_path,
        })
    }
}

/// Sanitizes a display name into a safe output file name.
pub fn output_file_name(display_name: &str, extension: &str) -> String {
    let safe: String = display_name
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            other => other,
        })
        .collect();
    format!("{}.{}", safe, extension)
}

/// Helper for tests and demos: a builder returning a fixed shell command.
pub struct ShellCommand {
    script: String,
    output_path: PathBuf,
}

impl ShellCommand {
    pub fn new(script: impl Into<String>, output_path: impl Into<PathBuf>) -> Self {
        Self {
            script: script.into(),
            output_path: output_path.into(),
        }
    }
}

impl CommandBuilder for ShellCommand {
    fn build(&self, _job: &Job, _settings: &Settings) -> Result<Invocation, RunnerError> {
        Ok(Invocation {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), self.script.clone()],
            output_path: self.output_path.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn sample_job() -> Job {
        Job::new(
            "disc.img".to_string(),
            3,
            "My Movie".to_string(),
            "My Movie.mp4".to_string(),
            "Fast 1080p30".to_string(),
        )
    }

    #[test]
    fn test_handbrake_command_shape() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut settings = Settings::default();
        settings.output_directory = dir.path().join("out");

        let builder = HandBrakeCommand::new("/usr/bin/HandBrakeCLI", "/media/discs");
        let invocation = builder.build(&sample_job(), &settings).unwrap();

        assert_eq!(invocation.program, "/usr/bin/HandBrakeCLI");
        assert_eq!(invocation.args[0], "--input");
        assert!(invocation.args[1].ends_with("disc.img"));
        assert_eq!(invocation.args[4], "--title");
        assert_eq!(invocation.args[5], "3");
        assert_eq!(invocation.args[7], "Fast 1080p30");
        assert!(invocation.output_path.ends_with("My Movie.mp4"));
        // Output directory was created for the tool
        assert!(dir.path().join("out").exists());
    }

    #[test]
    fn test_testing_mode_adds_trim_args() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut settings = Settings::default();
        settings.output_directory = dir.path().to_path_buf();
        settings.testing_mode = true;
        settings.test_duration_seconds = 45;

        let builder = HandBrakeCommand::new("HandBrakeCLI", "/media");
        let invocation = builder.build(&sample_job(), &settings).unwrap();

        let args = invocation.args.join(" ");
        assert!(args.contains("--start-at seconds:0"));
        assert!(args.contains("--stop-at seconds:45"));
    }

    #[test]
    fn test_output_file_name_sanitized() {
        assert_eq!(
            output_file_name("A/B: The \"Sequel\"?", "mp4"),
            "A_B_ The _Sequel__.mp4"
        );
        assert_eq!(output_file_name("Plain", "mkv"), "Plain.mkv");
    }

    #[test]
    fn test_shell_command_builder() {
        let builder = ShellCommand::new("echo hi", "/tmp/out.mp4");
        let invocation = builder
            .build(&sample_job(), &Settings::default())
            .unwrap();
        assert_eq!(invocation.program, "sh");
        assert_eq!(invocation.args, vec!["-c", "echo hi"]);
        assert_eq!(invocation.output_path, Path::new("/tmp/out.mp4"));
    }
}
