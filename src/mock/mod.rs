//! Scripted [`TaskRunner`] for tests.
//!
//! No test in this crate shells out to the real Xcode toolchain. Instead a
//! [`ScriptedRunner`] is configured with rules matching the rendered
//! command line; the first matching rule supplies canned stdout or a canned
//! failure. Every invocation is recorded so tests can assert how often and
//! in what order toolchain programs were run.

use std::sync::Mutex;

use crate::task::{CancelToken, TaskError, TaskEvent, TaskRequest, TaskResult, TaskRunner};

enum Response {
    Success(Vec<u8>),
    Failure { exit_code: i32, stderr: String },
}

struct Rule {
    program: Option<String>,
    contains: Vec<String>,
    response: Response,
}

impl Rule {
    fn matches(&self, request: &TaskRequest) -> bool {
        if let Some(ref program) = self.program {
            if *program != request.program {
                return false;
            }
        }
        let command = request.display_command();
        self.contains.iter().all(|needle| command.contains(needle))
    }
}

/// Test double for the toolchain-invocation contract.
#[derive(Default)]
pub struct ScriptedRunner {
    rules: Vec<Rule>,
    invocations: Mutex<Vec<TaskRequest>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Respond with `stdout` to any invocation of `program`.
    pub fn on_program(mut self, program: impl Into<String>, stdout: Vec<u8>) -> Self {
        self.rules.push(Rule {
            program: Some(program.into()),
            contains: Vec::new(),
            response: Response::Success(stdout),
        });
        self
    }

    /// Respond with `stdout` when the rendered command contains `needle`.
    pub fn on_args(self, needle: impl Into<String>, stdout: Vec<u8>) -> Self {
        self.on_all([needle], stdout)
    }

    /// Respond with `stdout` when the rendered command contains every
    /// needle. Rules are consulted in registration order.
    pub fn on_all(
        mut self,
        needles: impl IntoIterator<Item = impl Into<String>>,
        stdout: Vec<u8>,
    ) -> Self {
        self.rules.push(Rule {
            program: None,
            contains: needles.into_iter().map(Into::into).collect(),
            response: Response::Success(stdout),
        });
        self
    }

    /// Fail with `exit_code`/`stderr` when the rendered command contains
    /// `needle`.
    pub fn fail_on(
        mut self,
        needle: impl Into<String>,
        exit_code: i32,
        stderr: impl Into<String>,
    ) -> Self {
        self.rules.push(Rule {
            program: None,
            contains: vec![needle.into()],
            response: Response::Failure {
                exit_code,
                stderr: stderr.into(),
            },
        });
        self
    }

    /// Every invocation observed so far, in order.
    pub fn invocations(&self) -> Vec<TaskRequest> {
        self.invocations.lock().unwrap().clone()
    }

    /// Number of invocations of `program`.
    pub fn invocation_count(&self, program: &str) -> usize {
        self.invocations
            .lock()
            .unwrap()
            .iter()
            .filter(|request| request.program == program)
            .count()
    }

    /// Number of invocations whose rendered command contains `needle`.
    pub fn invocation_count_matching(&self, needle: &str) -> usize {
        self.invocations
            .lock()
            .unwrap()
            .iter()
            .filter(|request| request.display_command().contains(needle))
            .count()
    }
}

impl TaskRunner for ScriptedRunner {
    fn run(
        &self,
        request: &TaskRequest,
        cancel: &CancelToken,
        sink: &mut dyn FnMut(TaskEvent),
    ) -> TaskResult<Vec<u8>> {
        if cancel.is_cancelled() {
            return Err(TaskError::Cancelled);
        }
        self.invocations.lock().unwrap().push(request.clone());

        let rule = self.rules.iter().find(|rule| rule.matches(request));
        sink(TaskEvent::Launch {
            command: request.display_command(),
        });

        match rule.map(|rule| &rule.response) {
            Some(Response::Success(stdout)) => {
                for line in stdout.split(|byte| *byte == b'\n') {
                    if !line.is_empty() {
                        sink(TaskEvent::Stdout(line.to_vec()));
                    }
                }
                Ok(stdout.clone())
            }
            Some(Response::Failure { exit_code, stderr }) => {
                sink(TaskEvent::Stderr(stderr.clone().into_bytes()));
                Err(TaskError::Failed {
                    program: request.program.clone(),
                    exit_code: Some(*exit_code),
                    stderr: stderr.clone(),
                })
            }
            None => Err(TaskError::Failed {
                program: request.program.clone(),
                exit_code: Some(1),
                stderr: format!("no scripted response for: {}", request.display_command()),
            }),
        }
    }
}
