//! Shared fixture for integration tests: a miniature tools/input/cache
//! tree with shell-script tools that log every execution.

#![allow(dead_code)]

use std::fs;
use std::path::PathBuf;

use assert_cmd::Command;
use tempfile::TempDir;

pub const DEFAULT_TRANSFORMS: &str = r#"{ "transforms": [
    { "name": "default", "stages": [
        { "name": "uprez", "processes": [
            { "name": "esr", "process": "copytool",
              "vars": { "x.input": "{transform.input}",
                        "x.output": "{cache.path}/{transform.input.filename}.up.png" },
              "cmdline": "{x.input} {x.output}" }
        ] },
        { "name": "finish", "processes": [
            { "name": "deliver", "process": "copytool",
              "vars": { "y.input": "{x.output}",
                        "y.output": "{transform.output}" },
              "cmdline": "{y.input} {y.output}" }
        ] }
    ] }
] }"#;

/// Same shape as [`DEFAULT_TRANSFORMS`], but the delivery stage invokes the
/// always-failing tool.
pub const FAILING_TRANSFORMS: &str = r#"{ "transforms": [
    { "name": "default", "stages": [
        { "name": "uprez", "processes": [
            { "name": "esr", "process": "copytool",
              "vars": { "x.input": "{transform.input}",
                        "x.output": "{cache.path}/{transform.input.filename}.up.png" },
              "cmdline": "{x.input} {x.output}" }
        ] },
        { "name": "finish", "processes": [
            { "name": "deliver", "process": "failtool",
              "vars": { "y.input": "{x.output}",
                        "y.output": "{transform.output}" },
              "cmdline": "{y.input} {y.output}" }
        ] }
    ] }
] }"#;

pub struct Fixture {
    pub dir: TempDir,
}

impl Fixture {
    /// Standard two-stage copy pipeline over one artifact `a.png`.
    pub fn new() -> Self {
        Self::with_transforms(DEFAULT_TRANSFORMS)
    }

    pub fn with_transforms(transforms_json: &str) -> Self {
        let dir = TempDir::new().unwrap();
        for sub in ["in", "out", "cache", "tools"] {
            fs::create_dir_all(dir.path().join(sub)).unwrap();
        }

        let fixture = Self { dir };
        fixture.write_tool("copy.sh", "cp \"$1\" \"$2\"");
        fixture.write_tool("fail.sh", "exit 7");
        fixture.write(
            "tools/processes.config.json",
            r#"{ "processes": [
                { "name": "copytool", "executable": "copy.sh", "package": ["copy.sh"] },
                { "name": "failtool", "executable": "fail.sh", "package": ["fail.sh"] }
            ] }"#,
        );
        fixture.write("tools/transforms.config.json", transforms_json);
        fixture.write("in/global.config.json", r#"{ "vars": { "transform": "default" } }"#);
        fixture.write("in/a.png", "pixels-a");
        fixture
    }

    /// Writes a logging shell tool into tools/. Every run appends one line
    /// to cache/tool.log before running `body`.
    pub fn write_tool(&self, name: &str, body: &str) {
        let log = self.path("cache/tool.log");
        let script = format!("#!/bin/sh\necho \"{name} $@\" >> \"{}\"\n{body}\n", log.display());
        let path = self.path(&format!("tools/{name}"));
        fs::write(&path, script).unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        }
    }

    pub fn write(&self, relative: &str, content: &str) {
        fs::write(self.path(relative), content).unwrap();
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.dir.path().join(relative)
    }

    /// The `--vars` argument defining the four root paths.
    pub fn vars_arg(&self) -> String {
        ["input.path=in", "output.path=out", "cache.path=cache", "tools.path=tools"]
            .iter()
            .map(|entry| {
                let (key, sub) = entry.split_once('=').unwrap();
                format!("{key}={}", self.dir.path().join(sub).display())
            })
            .collect::<Vec<_>>()
            .join(";")
    }

    /// A `uprez` command with the fixture's variables bound.
    pub fn uprez(&self, subcommand: &str) -> Command {
        let mut cmd = Command::cargo_bin("uprez").unwrap();
        cmd.arg(subcommand).arg("--vars").arg(self.vars_arg());
        cmd
    }

    /// Number of tool executions logged so far.
    pub fn executions(&self) -> usize {
        fs::read_to_string(self.path("cache/tool.log"))
            .map(|log| log.lines().count())
            .unwrap_or(0)
    }
}
