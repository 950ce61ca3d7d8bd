// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! External computation descriptors.
//!
//! A [`Processor`] describes an external program whose command line is
//! a template: `%%name%%` tokens expand from the attached parameter
//! space and `%%:OUTFILE:n%%` tokens reserve a write slot on the nth
//! output disk buffer. Running is gated by the enabled flag and an
//! optional prepare hook, and a done hook observes the outcome.

use crate::diskbuffer::DiskBufferRef;
use crate::error::TincError;
use crate::param::space::SpaceRef;
use crate::protocol::wire::{
    ConfigureObject, ConfigureProcessor, ProcessorUpdate, RegisterObject, RegisterProcessor,
};
use crate::protocol::{Details, Envelope, MessageType, ObjectType, Outbound};
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, warn};

/// Outcome of one external execution.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub exit_code: i32,
    /// Captured stdout, empty unless capture was requested.
    pub stdout: Vec<u8>,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs an expanded command line.
pub trait ExecutionBackend: Send + Sync {
    fn execute(
        &self,
        program: &str,
        args: &[String],
        working_dir: Option<&Path>,
        capture_output: bool,
    ) -> Result<ExecutionResult, TincError>;
}

/// Spawns the program as a local child process.
pub struct LocalExecution;

impl ExecutionBackend for LocalExecution {
    fn execute(
        &self,
        program: &str,
        args: &[String],
        working_dir: Option<&Path>,
        capture_output: bool,
    ) -> Result<ExecutionResult, TincError> {
        let mut cmd = Command::new(program);
        cmd.args(args);
        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }
        if capture_output {
            let output = cmd
                .output()
                .map_err(|e| TincError::Process(format!("spawn {:?}: {}", program, e)))?;
            Ok(ExecutionResult {
                exit_code: output.status.code().unwrap_or(-1),
                stdout: output.stdout,
            })
        } else {
            let status = cmd
                .status()
                .map_err(|e| TincError::Process(format!("spawn {:?}: {}", program, e)))?;
            Ok(ExecutionResult {
                exit_code: status.code().unwrap_or(-1),
                stdout: Vec::new(),
            })
        }
    }
}

/// Shared handle to a processor.
pub type ProcessorRef = std::sync::Arc<parking_lot::Mutex<Processor>>;

type PrepareHook = Box<dyn Fn() -> bool + Send + Sync>;
type DoneHook = Box<dyn Fn(bool) + Send + Sync>;

/// Descriptor for an external program run against a parameter space.
pub struct Processor {
    id: String,
    program: String,
    arg_template: String,
    running_directory: Option<PathBuf>,
    enabled: bool,
    capture_output: bool,
    ignore_fail: bool,
    space: Option<SpaceRef>,
    output_buffers: Vec<DiskBufferRef>,
    prepare: Option<PrepareHook>,
    done: Option<DoneHook>,
    backend: Box<dyn ExecutionBackend>,
    last_output: Vec<u8>,
    outbound: Option<Outbound>,
}

impl Processor {
    pub fn new(id: impl Into<String>) -> Result<Self, TincError> {
        let id = id.into();
        crate::param::validate_identifier(&id)?;
        Ok(Self {
            id,
            program: String::new(),
            arg_template: String::new(),
            running_directory: None,
            enabled: true,
            capture_output: false,
            ignore_fail: false,
            space: None,
            output_buffers: Vec::new(),
            prepare: None,
            done: None,
            backend: Box::new(LocalExecution),
            last_output: Vec::new(),
            outbound: None,
        })
    }

    pub fn with_backend(mut self, backend: Box<dyn ExecutionBackend>) -> Self {
        self.backend = backend;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arg_template(&self) -> &str {
        &self.arg_template
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn last_output(&self) -> &[u8] {
        &self.last_output
    }

    pub fn attach(&mut self, outbound: Outbound) {
        self.outbound = Some(outbound);
    }

    pub fn detach(&mut self) {
        self.outbound = None;
    }

    /// Parameter space used for `%%name%%` expansion.
    pub fn set_parameter_space(&mut self, space: SpaceRef) {
        self.space = Some(space);
    }

    /// Buffers addressed by `%%:OUTFILE:n%%`, in index order.
    pub fn add_output_buffer(&mut self, buffer: DiskBufferRef) {
        self.output_buffers.push(buffer);
    }

    pub fn set_capture_output(&mut self, capture: bool) {
        self.capture_output = capture;
    }

    pub fn set_ignore_fail(&mut self, ignore: bool) {
        self.ignore_fail = ignore;
    }

    pub fn set_prepare<F>(&mut self, f: F)
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.prepare = Some(Box::new(f));
    }

    pub fn set_done<F>(&mut self, f: F)
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        self.done = Some(Box::new(f));
    }

    /// Set the full command line. The text before the first space is
    /// the program, the rest is the argument template.
    pub fn set_command_line(&mut self, command_line: &str) {
        self.set_command_line_inner(command_line);
        self.emit_update(ProcessorUpdate::CommandLine {
            command_line: command_line.to_string(),
        });
    }

    fn set_command_line_inner(&mut self, command_line: &str) {
        match command_line.split_once(' ') {
            Some((program, args)) => {
                self.program = program.to_string();
                self.arg_template = args.to_string();
            }
            None => {
                self.program = command_line.to_string();
                self.arg_template = String::new();
            }
        }
    }

    pub fn command_line(&self) -> String {
        if self.arg_template.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.arg_template)
        }
    }

    pub fn set_running_directory(&mut self, dir: impl Into<PathBuf>) {
        let dir = dir.into();
        self.emit_update(ProcessorUpdate::RunningDirectory {
            path: dir.to_string_lossy().into_owned(),
        });
        self.running_directory = Some(dir);
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        self.emit_update(ProcessorUpdate::Enabled { enabled });
    }

    /// Apply one CONFIGURE field from a peer.
    pub fn apply_update(&mut self, update: &ProcessorUpdate) {
        match update {
            ProcessorUpdate::CommandLine { command_line } => {
                self.set_command_line_inner(command_line)
            }
            ProcessorUpdate::RunningDirectory { path } => {
                self.running_directory = Some(PathBuf::from(path))
            }
            ProcessorUpdate::Enabled { enabled } => self.enabled = *enabled,
        }
    }

    /// Expand the template and run the program.
    ///
    /// Returns `Ok(false)` when skipped (disabled, or the prepare hook
    /// declined). A nonzero exit is an error unless ignore-fail is
    /// set.
    pub fn run(&mut self) -> Result<bool, TincError> {
        if !self.enabled {
            debug!(processor = %self.id, "disabled, skipping");
            return Ok(false);
        }
        if let Some(prepare) = &self.prepare {
            if !prepare() {
                debug!(processor = %self.id, "prepare declined, skipping");
                return Ok(false);
            }
        }
        if self.program.is_empty() {
            return Err(TincError::Process(format!(
                "processor {} has no command line",
                self.id
            )));
        }

        let (args, mut reserved) = self.expand_args()?;
        debug!(processor = %self.id, program = %self.program, ?args, "running");

        let result = self.backend.execute(
            &self.program,
            &args,
            self.running_directory.as_deref(),
            self.capture_output,
        );

        let (success, output) = match result {
            Ok(res) => (res.success(), res.stdout),
            Err(e) => {
                if let Some(done) = &self.done {
                    done(false);
                }
                return Err(e);
            }
        };
        if self.capture_output {
            self.last_output = output.clone();
        }

        if success {
            if self.capture_output && !self.output_buffers.is_empty() {
                self.write_captured_stdout(&output, &mut reserved)?;
            }
            for (buffer, path) in reserved {
                buffer.lock().done_writing(&path)?;
            }
        }
        if let Some(done) = &self.done {
            done(success);
        }

        if !success && !self.ignore_fail {
            return Err(TincError::Process(format!(
                "processor {} exited with failure",
                self.id
            )));
        }
        Ok(true)
    }

    // Captured stdout lands in the first output's write path. Reuses
    // the slot an OUTFILE token already reserved, otherwise reserves
    // one so the write is announced like any other.
    fn write_captured_stdout(
        &mut self,
        output: &[u8],
        reserved: &mut Vec<(DiskBufferRef, PathBuf)>,
    ) -> Result<(), TincError> {
        let buffer = &self.output_buffers[0];
        let path = match reserved
            .iter()
            .find(|(b, _)| std::sync::Arc::ptr_eq(b, buffer))
            .map(|(_, p)| p.clone())
        {
            Some(path) => path,
            None => {
                let path = buffer.lock().get_filename_for_writing()?;
                reserved.push((std::sync::Arc::clone(buffer), path.clone()));
                path
            }
        };
        std::fs::write(&path, output)?;
        Ok(())
    }

    // Splits the template on whitespace, then expands OUTFILE tokens
    // and parameter tokens inside each argument.
    fn expand_args(&mut self) -> Result<(Vec<String>, Vec<(DiskBufferRef, PathBuf)>), TincError> {
        let mut reserved: Vec<(DiskBufferRef, PathBuf)> = Vec::new();
        let mut args = Vec::new();
        let template = self.arg_template.clone();

        for token in template.split_whitespace() {
            let mut arg = token.to_string();

            while let Some(start) = arg.find("%%:OUTFILE:") {
                let tail = &arg[start + "%%:OUTFILE:".len()..];
                let Some(end) = tail.find("%%") else {
                    return Err(TincError::Validation(format!(
                        "unterminated OUTFILE token in {:?}",
                        token
                    )));
                };
                let index: usize = tail[..end].parse().map_err(|_| {
                    TincError::Validation(format!("bad OUTFILE index in {:?}", token))
                })?;
                let buffer = self.output_buffers.get(index).ok_or_else(|| {
                    TincError::Validation(format!(
                        "processor {} has no output buffer {}",
                        self.id, index
                    ))
                })?;
                let path = buffer.lock().get_filename_for_writing()?;
                let replacement = path.to_string_lossy().into_owned();
                reserved.push((std::sync::Arc::clone(buffer), path));
                arg.replace_range(start..start + "%%:OUTFILE:".len() + end + 2, &replacement);
            }

            if arg.contains("%%") {
                if let Some(space) = &self.space {
                    arg = space.lock().resolve_template(&arg);
                }
                if arg.contains("%%") {
                    warn!(processor = %self.id, arg = %arg, "unresolved command token");
                }
            }
            args.push(arg);
        }
        Ok((args, reserved))
    }

    pub fn to_register(&self) -> RegisterObject {
        RegisterObject::Processor(RegisterProcessor {
            id: self.id.clone(),
        })
    }

    fn emit_update(&self, update: ProcessorUpdate) {
        if let Some(tx) = &self.outbound {
            let env = Envelope::new(
                MessageType::Configure,
                ObjectType::Processor,
                Details::Configure(ConfigureObject::Processor(ConfigureProcessor {
                    id: self.id.clone(),
                    update,
                })),
            );
            if tx.send(env).is_err() {
                warn!(processor = %self.id, "peer channel closed, dropping configure");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diskbuffer::DiskBuffer;
    use crate::param::space::ParameterSpace;
    use crate::param::value::ParamValue;
    use crate::param::Parameter;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicI32, Ordering};
    use std::sync::Arc;

    /// Records invocations instead of spawning anything.
    struct FakeBackend {
        exit_code: i32,
        calls: Arc<Mutex<Vec<(String, Vec<String>)>>>,
    }

    impl ExecutionBackend for FakeBackend {
        fn execute(
            &self,
            program: &str,
            args: &[String],
            _working_dir: Option<&Path>,
            capture_output: bool,
        ) -> Result<ExecutionResult, TincError> {
            self.calls.lock().push((program.to_string(), args.to_vec()));
            Ok(ExecutionResult {
                exit_code: self.exit_code,
                stdout: if capture_output { b"out".to_vec() } else { Vec::new() },
            })
        }
    }

    fn fake_processor(exit_code: i32) -> (Processor, Arc<Mutex<Vec<(String, Vec<String>)>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let proc = Processor::new("proc")
            .unwrap()
            .with_backend(Box::new(FakeBackend {
                exit_code,
                calls: Arc::clone(&calls),
            }));
        (proc, calls)
    }

    fn space_with_param() -> SpaceRef {
        let mut ps = ParameterSpace::new("ps").unwrap();
        let mut p = Parameter::new("n", ParamValue::Int32(0)).unwrap();
        p.set_values((0..4).map(ParamValue::Int32).collect()).unwrap();
        p.set_at(2).unwrap();
        ps.add_parameter(Arc::new(Mutex::new(p)));
        Arc::new(Mutex::new(ps))
    }

    #[test]
    fn test_command_line_split_at_first_space() {
        let (mut proc, _) = fake_processor(0);
        proc.set_command_line("solver --level 3");
        assert_eq!(proc.program(), "solver");
        assert_eq!(proc.arg_template(), "--level 3");
        assert_eq!(proc.command_line(), "solver --level 3");

        proc.set_command_line("bare");
        assert_eq!(proc.program(), "bare");
        assert!(proc.arg_template().is_empty());
    }

    #[test]
    fn test_parameter_token_expansion() {
        let (mut proc, calls) = fake_processor(0);
        proc.set_parameter_space(space_with_param());
        proc.set_command_line("solver --n=%%n%% fixed");

        assert!(proc.run().unwrap());
        let recorded = calls.lock();
        assert_eq!(recorded[0].0, "solver");
        assert_eq!(recorded[0].1, vec!["--n=2".to_string(), "fixed".to_string()]);
    }

    #[test]
    fn test_outfile_token_reserves_and_finishes() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = Arc::new(Mutex::new(
            DiskBuffer::new("out", "result.json", dir.path()).unwrap(),
        ));

        let calls = Arc::new(Mutex::new(Vec::new()));
        struct WritingBackend {
            calls: Arc<Mutex<Vec<(String, Vec<String>)>>>,
        }
        impl ExecutionBackend for WritingBackend {
            fn execute(
                &self,
                program: &str,
                args: &[String],
                _dir: Option<&Path>,
                _capture: bool,
            ) -> Result<ExecutionResult, TincError> {
                // The "program" writes its output file like a real
                // solver would.
                std::fs::write(&args[0], b"{\"done\": true}").unwrap();
                self.calls.lock().push((program.to_string(), args.to_vec()));
                Ok(ExecutionResult {
                    exit_code: 0,
                    stdout: Vec::new(),
                })
            }
        }

        let mut proc = Processor::new("proc")
            .unwrap()
            .with_backend(Box::new(WritingBackend {
                calls: Arc::clone(&calls),
            }));
        proc.add_output_buffer(Arc::clone(&buffer));
        proc.set_command_line("solver %%:OUTFILE:0%%");

        assert!(proc.run().unwrap());
        let guard = buffer.lock();
        assert_eq!(guard.current_file(), "result.json");
        assert!(!guard.is_locked("result.json"));
    }

    #[test]
    fn test_missing_outfile_buffer_rejected() {
        let (mut proc, _) = fake_processor(0);
        proc.set_command_line("solver %%:OUTFILE:0%%");
        assert!(matches!(proc.run(), Err(TincError::Validation(_))));
    }

    #[test]
    fn test_disabled_skips() {
        let (mut proc, calls) = fake_processor(0);
        proc.set_command_line("solver");
        proc.apply_update(&ProcessorUpdate::Enabled { enabled: false });
        assert!(!proc.run().unwrap());
        assert!(calls.lock().is_empty());
    }

    #[test]
    fn test_prepare_gate() {
        let (mut proc, calls) = fake_processor(0);
        proc.set_command_line("solver");
        proc.set_prepare(|| false);
        assert!(!proc.run().unwrap());
        assert!(calls.lock().is_empty());
    }

    #[test]
    fn test_failure_without_ignore_fail() {
        let (mut proc, _) = fake_processor(3);
        proc.set_command_line("solver");
        let outcome = Arc::new(AtomicI32::new(-1));
        let seen = Arc::clone(&outcome);
        proc.set_done(move |ok| seen.store(ok as i32, Ordering::SeqCst));

        assert!(matches!(proc.run(), Err(TincError::Process(_))));
        assert_eq!(outcome.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failure_with_ignore_fail() {
        let (mut proc, _) = fake_processor(3);
        proc.set_command_line("solver");
        proc.set_ignore_fail(true);
        assert!(proc.run().unwrap());
    }

    #[test]
    fn test_capture_output() {
        let (mut proc, _) = fake_processor(0);
        proc.set_command_line("solver");
        proc.set_capture_output(true);
        proc.run().unwrap();
        assert_eq!(proc.last_output(), b"out");
    }

    #[test]
    fn test_captured_output_written_to_first_output_file() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = Arc::new(Mutex::new(
            DiskBuffer::new("out", "result.txt", dir.path()).unwrap(),
        ));
        let (mut proc, _) = fake_processor(0);
        proc.add_output_buffer(Arc::clone(&buffer));
        proc.set_command_line("solver");
        proc.set_capture_output(true);

        assert!(proc.run().unwrap());
        assert_eq!(
            std::fs::read(dir.path().join("result.txt")).unwrap(),
            b"out"
        );
        let guard = buffer.lock();
        assert_eq!(guard.current_file(), "result.txt");
        assert_eq!(
            *guard.data(),
            crate::diskbuffer::BufferData::Text("out".into())
        );
    }

    #[test]
    fn test_apply_update_command_line() {
        let (mut proc, _) = fake_processor(0);
        proc.apply_update(&ProcessorUpdate::CommandLine {
            command_line: "tool --flag".into(),
        });
        assert_eq!(proc.program(), "tool");
        assert_eq!(proc.arg_template(), "--flag");
    }

    #[test]
    fn test_empty_command_line_is_error() {
        let (mut proc, _) = fake_processor(0);
        assert!(matches!(proc.run(), Err(TincError::Process(_))));
    }
}
