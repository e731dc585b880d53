use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use bytes::Bytes;

use crate::encoding::Encoding;
use crate::runner::ProcessCommand;
use crate::stage::StageStep;
use crate::stdio::{ConfiguredItem, InputValue, StageOptions, StdioItem, StdioSpec};

pub struct ProcessCommandBuilder {
    command: ProcessCommand,
}

impl ProcessCommandBuilder {
    pub fn new(program: &str) -> Self {
        Self {
            command: ProcessCommand {
                program: program.to_string(),
                args: Vec::new(),
                env: HashMap::new(),
                working_dir: None,
                timeout: None,
                stdin: StdioSpec::default(),
                stdout: StdioSpec::default(),
                stderr: StdioSpec::default(),
            },
        }
    }

    pub fn arg(mut self, arg: &str) -> Self {
        self.command.args.push(arg.to_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.command
            .args
            .extend(args.into_iter().map(|s| s.as_ref().to_string()));
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.command.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            self.command
                .env
                .insert(key.as_ref().to_string(), value.as_ref().to_string());
        }
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.command.working_dir = Some(dir.to_path_buf());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.command.timeout = Some(timeout);
        self
    }

    pub fn stdin(mut self, spec: StdioSpec) -> Self {
        self.command.stdin = spec;
        self
    }

    pub fn stdout(mut self, spec: StdioSpec) -> Self {
        self.command.stdout = spec;
        self
    }

    pub fn stderr(mut self, spec: StdioSpec) -> Self {
        self.command.stderr = spec;
        self
    }

    /// Feed a literal string to the child's stdin.
    pub fn stdin_text(mut self, input: &str) -> Self {
        self.command
            .stdin
            .push_item(StdioItem::Input(InputValue::Text(input.to_string())));
        self
    }

    /// Feed literal bytes to the child's stdin.
    pub fn stdin_bytes(mut self, input: Bytes) -> Self {
        self.command
            .stdin
            .push_item(StdioItem::Input(InputValue::Bytes(input)));
        self
    }

    /// Append a transform stage to the stdout chain.
    pub fn stdout_transform(mut self, step: Box<dyn StageStep>) -> Self {
        self.command.stdout.push_item(StdioItem::Transform(step));
        self
    }

    /// Append a transform stage with explicit stage options.
    pub fn stdout_transform_with(
        mut self,
        step: Box<dyn StageStep>,
        options: StageOptions,
    ) -> Self {
        self.command.stdout.push_item(ConfiguredItem {
            item: StdioItem::Transform(step),
            options,
        });
        self
    }

    /// Append a transform stage to the stderr chain.
    pub fn stderr_transform(mut self, step: Box<dyn StageStep>) -> Self {
        self.command.stderr.push_item(StdioItem::Transform(step));
        self
    }

    /// Append a transform stage to the stdin chain.
    pub fn stdin_transform(mut self, step: Box<dyn StageStep>) -> Self {
        self.command.stdin.push_item(StdioItem::Transform(step));
        self
    }

    /// Enable line-boundary chunking on stdout and stderr.
    pub fn lines(mut self, enabled: bool) -> Self {
        self.command.stdout.lines = enabled;
        self.command.stderr.lines = enabled;
        self
    }

    /// Set the codec for stdout and stderr.
    pub fn encoding(mut self, encoding: Encoding) -> Self {
        self.command.stdout.encoding = encoding;
        self.command.stderr.encoding = encoding;
        self
    }

    /// Toggle in-memory result buffering on stdout and stderr.
    pub fn buffer(mut self, enabled: bool) -> Self {
        self.command.stdout.buffer = enabled;
        self.command.stderr.buffer = enabled;
        self
    }

    /// Cap the aggregated size (bytes, or items in structured mode).
    pub fn max_buffer(mut self, limit: u64) -> Self {
        self.command.stdout.max_buffer = limit;
        self.command.stderr.max_buffer = limit;
        self
    }

    pub fn strip_final_newline(mut self, enabled: bool) -> Self {
        self.command.stdout.strip_final_newline = enabled;
        self.command.stderr.strip_final_newline = enabled;
        self
    }

    pub fn build(self) -> ProcessCommand {
        self.command
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::Chunk;
    use crate::stage::FnStep;

    #[test]
    fn test_builder_accumulates_args_and_env() {
        let command = ProcessCommandBuilder::new("echo")
            .arg("-n")
            .args(["a", "b"])
            .env("KEY", "value")
            .timeout(Duration::from_secs(5))
            .build();
        assert_eq!(command.program, "echo");
        assert_eq!(command.args, vec!["-n", "a", "b"]);
        assert_eq!(command.env.get("KEY").map(String::as_str), Some("value"));
        assert_eq!(command.timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_builder_stdio_configuration() {
        let command = ProcessCommandBuilder::new("cat")
            .stdin_text("payload")
            .stdout_transform(FnStep::new(|chunk: Chunk| Ok(vec![chunk])))
            .lines(true)
            .max_buffer(1024)
            .build();
        assert!(command.stdin.items.len() > 1);
        assert!(command.stdout.has_stages());
        assert!(command.stdout.lines);
        assert_eq!(command.stdout.max_buffer, 1024);
        assert_eq!(command.stderr.max_buffer, 1024);
    }
}
