//! Restricted execution environment for submitted snippets
//!
//! A snippet never runs as a top-level script. It is embedded as a string
//! literal inside a generated Python wrapper (the scaffold) which:
//!
//! - arms `signal.alarm` as a second timeout path next to the engine's own
//! - restores `SIGXFSZ` to its default action so the file-size ceiling kills
//! - builds a globals dictionary whose `__builtins__` is the allow-list from
//!   [`Capabilities`], plus public-attribute views of the allowed modules
//! - routes `import` through a guard that only admits allowed modules
//! - compiles and `exec`s the snippet in that dictionary and turns any
//!   exception into a single `Error: <Type>: <message>` line
//!
//! This confines *names*, not the interpreter: attribute introspection
//! (`__class__`, `__globals__`, ...) can still reach the host. Treat the
//! scaffold as a tripwire for honest mistakes, not a security boundary.

use crate::{Result, SnipboxError};
use once_cell::sync::Lazy;
use regex::Regex;

/// Exit status used when user code raised an exception
pub const USER_ERROR_EXIT: i32 = 3;

/// Exit status used when user code hit the address-space ceiling
pub const MEMORY_EXIT: i32 = 4;

/// Callables reachable by name from a snippet.
pub const SAFE_BUILTINS: &[&str] = &[
    // I/O and core types
    "print", "len", "str", "int", "float", "list", "dict", "tuple", "set",
    "frozenset", "bool", "bytes", "bytearray", "object", "slice",
    // iteration
    "range", "enumerate", "zip", "map", "filter", "iter", "next", "reversed",
    "sorted", "any", "all",
    // arithmetic
    "min", "max", "sum", "abs", "round", "divmod", "pow",
    // conversion and inspection
    "chr", "ord", "hex", "bin", "oct", "repr", "format", "hash", "type",
    "isinstance", "issubclass", "callable", "hasattr", "getattr", "setattr",
    // class definitions
    "__build_class__", "super", "property", "staticmethod", "classmethod",
    // exceptions
    "Exception", "ValueError", "TypeError", "IndexError", "KeyError",
    "AttributeError", "StopIteration", "RuntimeError", "NotImplementedError",
    "ZeroDivisionError", "ArithmeticError", "LookupError", "NameError",
    "AssertionError", "OverflowError",
];

/// Standard-library modules reachable by name and by `import`.
pub const SAFE_MODULES: &[&str] = &["math", "random", "json", "re", "datetime", "time"];

static PY_IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("static regex"));

/// The allow-list of names a snippet may use, as auditable data.
///
/// Built once at startup and handed to [`Scaffold::new`]; it is never
/// recomputed per execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    builtins: Vec<String>,
    modules: Vec<String>,
}

impl Capabilities {
    /// Build a table from explicit lists. Every entry must be a plain
    /// Python identifier since it is rendered into source.
    pub fn new<B, M>(builtins: B, modules: M) -> Result<Self>
    where
        B: IntoIterator,
        B::Item: Into<String>,
        M: IntoIterator,
        M::Item: Into<String>,
    {
        let builtins: Vec<String> = builtins.into_iter().map(Into::into).collect();
        let modules: Vec<String> = modules.into_iter().map(Into::into).collect();

        if let Some(bad) = builtins
            .iter()
            .chain(&modules)
            .find(|name| !PY_IDENTIFIER.is_match(name))
        {
            return Err(SnipboxError::Config(format!(
                "capability {bad:?} is not a python identifier"
            )));
        }

        Ok(Self { builtins, modules })
    }

    /// The standard table: [`SAFE_BUILTINS`] and [`SAFE_MODULES`].
    #[must_use]
    pub fn standard() -> Self {
        Self {
            builtins: SAFE_BUILTINS.iter().map(|s| (*s).to_owned()).collect(),
            modules: SAFE_MODULES.iter().map(|s| (*s).to_owned()).collect(),
        }
    }

    #[must_use]
    pub fn builtins(&self) -> &[String] {
        &self.builtins
    }

    #[must_use]
    pub fn modules(&self) -> &[String] {
        &self.modules
    }

    #[must_use]
    pub fn allows_module(&self, name: &str) -> bool {
        self.modules.iter().any(|m| m == name)
    }
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::standard()
    }
}

const PRELUDE: &str = r#"import signal as _signal
_signal.signal(_signal.SIGXFSZ, _signal.SIG_DFL)
_signal.alarm(@ALARM@)

import builtins as _builtins
import types as _types
@IMPORTS@

def _public(module):
    view = _types.ModuleType(module.__name__, module.__doc__)
    for key in dir(module):
        if not key.startswith("_"):
            setattr(view, key, getattr(module, key))
    return view

_VIEWS = {@VIEWS@}

def _guarded_import(name, globals=None, locals=None, fromlist=(), level=0):
    if level == 0 and name in _VIEWS:
        return _VIEWS[name]
    raise ImportError("module '%s' is not available in the sandbox" % name)

_SAFE = {name: getattr(_builtins, name) for name in (@BUILTINS@)}
_SAFE["__import__"] = _guarded_import
_SAFE.update(_VIEWS)
"#;

const EPILOGUE: &str = r#"
def _main():
    namespace = {"__builtins__": _SAFE, "__name__": "__main__"}
    try:
        exec(compile(_SOURCE, "<snippet>", "exec"), namespace)
    except MemoryError:
        raise SystemExit(@MEMORY_EXIT@)
    except Exception as err:
        print("Error: %s: %s" % (type(err).__name__, err))
        raise SystemExit(@USER_ERROR_EXIT@)

_main()
"#;

/// Pre-rendered wrapper; only the snippet literal changes per execution.
#[derive(Debug, Clone)]
pub struct Scaffold {
    prelude: String,
    epilogue: String,
}

impl Scaffold {
    #[must_use]
    pub fn new(capabilities: &Capabilities, alarm_secs: u64) -> Self {
        let imports = capabilities
            .modules()
            .iter()
            .map(|m| format!("import {m}"))
            .collect::<Vec<_>>()
            .join("\n");
        let views = capabilities
            .modules()
            .iter()
            .map(|m| format!("\"{m}\": _public({m})"))
            .collect::<Vec<_>>()
            .join(", ");
        // trailing comma keeps a one-element list a tuple
        let builtins = capabilities
            .builtins()
            .iter()
            .map(|b| format!("\"{b}\","))
            .collect::<Vec<_>>()
            .join(" ");

        let prelude = PRELUDE
            .replace("@ALARM@", &alarm_secs.to_string())
            .replace("@IMPORTS@", &imports)
            .replace("@VIEWS@", &views)
            .replace("@BUILTINS@", &builtins);
        let epilogue = EPILOGUE
            .replace("@MEMORY_EXIT@", &MEMORY_EXIT.to_string())
            .replace("@USER_ERROR_EXIT@", &USER_ERROR_EXIT.to_string());

        Self { prelude, epilogue }
    }

    /// Produce the full program for one snippet.
    #[must_use]
    pub fn render(&self, source: &str) -> String {
        // A JSON string is also a valid Python string literal.
        let literal = serde_json::Value::String(source.to_owned()).to_string();

        let mut program =
            String::with_capacity(self.prelude.len() + literal.len() + self.epilogue.len() + 16);
        program.push_str(&self.prelude);
        program.push_str("\n_SOURCE = ");
        program.push_str(&literal);
        program.push('\n');
        program.push_str(&self.epilogue);
        program
    }
}
