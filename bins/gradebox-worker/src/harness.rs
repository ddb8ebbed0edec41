//! Harness workspace
//!
//! A workspace is a host temp directory bound read-only into the execution
//! context at [`MOUNT_POINT`]. It holds the submitted code, a generated entry
//! script and `params.json`. The entry script imports the solution, calls the
//! function named by `HARNESS_FUNCTION` with the decoded parameters and prints
//! the JSON-encoded return value as its last line. Any exception exits
//! non-zero with the traceback on stderr.

use gradebox_common::error::Result;
use gradebox_common::{Language, Value};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

pub const MOUNT_POINT: &str = "/workspace";
pub const PARAMS_FILE: &str = "params.json";
pub const FUNCTION_ENV: &str = "HARNESS_FUNCTION";

const PYTHON_HARNESS: &str = r#"import importlib.util
import json
import os
import sys
import traceback


def load_function():
    name = os.environ.get("HARNESS_FUNCTION", "")
    spec = importlib.util.spec_from_file_location("solution", "/workspace/solution.py")
    module = importlib.util.module_from_spec(spec)
    spec.loader.exec_module(module)
    return getattr(module, name)


def main():
    try:
        func = load_function()
    except BaseException:
        traceback.print_exc()
        sys.exit(2)

    with open("/workspace/params.json") as handle:
        params = json.load(handle)

    try:
        result = func(*params)
    except BaseException:
        traceback.print_exc()
        sys.exit(1)

    sys.stdout.write("\n" + json.dumps(result, default=repr) + "\n")
    sys.stdout.flush()


if __name__ == "__main__":
    main()
"#;

const JS_HARNESS: &str = r#""use strict";
const fs = require("fs");
const vm = require("vm");

const SOLUTION = "/workspace/solution.js";
const name = process.env.HARNESS_FUNCTION || "";

function fail(err, code) {
  console.error(err && err.stack ? err.stack : String(err));
  process.exit(code);
}

function loadFunction() {
  const source = fs.readFileSync(SOLUTION, "utf8");
  const module = { exports: {} };
  const context = vm.createContext({ module, exports: module.exports, require, console, process });
  vm.runInContext(
    source + `\n;globalThis.__harness_fn = typeof ${name} === "function" ? ${name} : undefined;`,
    context,
    { filename: SOLUTION },
  );
  const exported = context.module.exports;
  if (typeof exported === "function") return exported;
  if (exported && typeof exported[name] === "function") return exported[name];
  if (typeof context.__harness_fn === "function") return context.__harness_fn;
  throw new Error(`function '${name}' not found in solution.js`);
}

let fn;
try {
  fn = loadFunction();
} catch (err) {
  fail(err, 2);
}

const params = JSON.parse(fs.readFileSync("/workspace/params.json", "utf8"));

Promise.resolve()
  .then(() => fn(...params))
  .then(
    (result) => {
      process.stdout.write("\n" + JSON.stringify(result === undefined ? null : result) + "\n");
    },
    (err) => fail(err, 1),
  );
"#;

/// Entry script for a harness flavour
pub fn harness_source(language: Language) -> &'static str {
    match language {
        Language::Python => PYTHON_HARNESS,
        Language::JavaScript => JS_HARNESS,
    }
}

/// Command that runs the harness inside the context
pub fn harness_command(language: Language) -> Vec<String> {
    let interpreter = match language {
        Language::Python => "python",
        Language::JavaScript => "node",
    };
    vec![
        interpreter.to_string(),
        format!("{}/{}", MOUNT_POINT, language.harness_file()),
    ]
}

/// Environment handed to every harness invocation
pub fn harness_env(function_name: &str) -> Vec<String> {
    vec![
        format!("{}={}", FUNCTION_ENV, function_name),
        "PYTHONDONTWRITEBYTECODE=1".to_string(),
        "PYTHONUNBUFFERED=1".to_string(),
    ]
}

/// Host directory holding one submission's files
pub struct Workspace {
    dir: TempDir,
}

impl Workspace {
    /// Create a workspace with the solution and harness written out.
    ///
    /// `root` must be a directory the container engine can bind from; the
    /// system temp dir is used when none is given.
    pub fn create(language: Language, code: &str, root: Option<&Path>) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("gradebox-");
        let dir = match root {
            Some(root) => {
                fs::create_dir_all(root)?;
                builder.tempdir_in(root)?
            }
            None => builder.tempdir()?,
        };

        let workspace = Self { dir };
        workspace.write_file(&language.solution_file(), code.as_bytes())?;
        workspace.write_file(&language.harness_file(), harness_source(language).as_bytes())?;

        // The container drops every capability, so ownership does not help it
        set_mode(workspace.path(), 0o755)?;
        Ok(workspace)
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Replace `params.json` with the given positional arguments
    pub fn write_params(&self, parameters: &[Value]) -> Result<()> {
        let payload = serde_json::to_vec(parameters)
            .map_err(|e| gradebox_common::GradingError::config(format!("unserializable parameters: {}", e)))?;
        let staged = format!("{}.tmp", PARAMS_FILE);
        self.write_file(&staged, &payload)?;
        // Rename keeps a running context from ever reading a half-written file
        fs::rename(self.path().join(&staged), self.path().join(PARAMS_FILE))?;
        Ok(())
    }

    /// Delete the directory, reporting failures instead of ignoring them
    pub fn close(self) -> Result<()> {
        self.dir.close()?;
        Ok(())
    }

    fn write_file(&self, name: &str, contents: &[u8]) -> Result<()> {
        let path = self.path().join(name);
        fs::write(&path, contents)?;
        set_mode(&path, 0o644)?;
        Ok(())
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}
