//! External process invocation.
//!
//! The pipeline never spawns a tool directly; it hands an [`Invocation`] to a
//! [`ToolRunner`]. [`ScriptRunner`] is the production runner: it writes a
//! small wrapper script into the working directory so every tool starts from
//! that directory with its output captured in one diagnostics log.

use crate::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, warn};

/// Everything needed to run one external tool once.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    /// 1-based pipeline stage
    pub stage: usize,
    pub tool: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub work_dir: PathBuf,
    /// Receives stdout and stderr, appended across stages
    pub diagnostics: PathBuf,
    /// Files the tool is expected to leave in `work_dir`
    pub expected_outputs: Vec<PathBuf>,
}

pub trait ToolRunner {
    /// Run to completion and return the exit code.
    fn run(&self, invocation: &Invocation) -> Result<i32>;
}

impl<R: ToolRunner + ?Sized> ToolRunner for &R {
    fn run(&self, invocation: &Invocation) -> Result<i32> {
        (**self).run(invocation)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ScriptRunner;

impl ScriptRunner {
    pub fn new() -> Self {
        Self
    }

    fn launch_failed(invocation: &Invocation, reason: String) -> Error {
        Error::ExternalToolFailed {
            stage: invocation.stage,
            tool: invocation.tool.clone(),
            reason,
        }
    }
}

impl ToolRunner for ScriptRunner {
    fn run(&self, invocation: &Invocation) -> Result<i32> {
        let script = invocation
            .work_dir
            .join(format!("run_{}.{}", invocation.tool, SCRIPT_EXTENSION));
        fs::write(&script, wrapper_script(invocation)).map_err(|e| Error::io(&script, e))?;
        debug!(script = %script.display(), "wrapper script written");

        let status = shell(&script)
            .current_dir(&invocation.work_dir)
            .status()
            .map_err(|e| Self::launch_failed(invocation, format!("could not start: {}", e)))?;

        match status.code() {
            Some(code) => Ok(code),
            None => {
                warn!(tool = %invocation.tool, "terminated by signal");
                Ok(-1)
            }
        }
    }
}

#[cfg(not(windows))]
const SCRIPT_EXTENSION: &str = "sh";
#[cfg(windows)]
const SCRIPT_EXTENSION: &str = "bat";

#[cfg(not(windows))]
fn shell(script: &Path) -> Command {
    let mut cmd = Command::new("/bin/sh");
    cmd.arg(script);
    cmd
}

#[cfg(windows)]
fn shell(script: &Path) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(script);
    cmd
}

#[cfg(not(windows))]
fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(windows)]
fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "\"\""))
}

#[cfg(not(windows))]
fn wrapper_script(inv: &Invocation) -> String {
    let mut command = quote(&inv.program.to_string_lossy());
    for arg in &inv.args {
        command.push(' ');
        command.push_str(&quote(arg));
    }
    format!(
        "#!/bin/sh\ncd {} || exit 1\n{} >> {} 2>&1\n",
        quote(&inv.work_dir.to_string_lossy()),
        command,
        quote(&inv.diagnostics.to_string_lossy()),
    )
}

#[cfg(windows)]
fn wrapper_script(inv: &Invocation) -> String {
    let mut command = quote(&inv.program.to_string_lossy());
    for arg in &inv.args {
        command.push(' ');
        command.push_str(&quote(arg));
    }
    format!(
        "@echo off\r\ncd /d {}\r\n{} >> {} 2>&1\r\nexit /b %ERRORLEVEL%\r\n",
        quote(&inv.work_dir.to_string_lossy()),
        command,
        quote(&inv.diagnostics.to_string_lossy()),
    )
}
