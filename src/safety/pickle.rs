//! Static analysis of pickle-family artifacts

use super::{Finding, FindingSink, Severity};
use crate::pickle::{Flavor, GlobalRef, GlobalUse, Machine, PickleError};

/// Modules whose every member is a process, filesystem, network or code
/// loading primitive
const DENIED_MODULES: &[&str] = &[
    "os",
    "posix",
    "nt",
    "subprocess",
    "sys",
    "socket",
    "shutil",
    "runpy",
    "pty",
    "ctypes",
    "marshal",
    "importlib",
    "pickle",
    "_pickle",
    "cPickle",
    "webbrowser",
    "commands",
    "multiprocessing",
    "code",
    "codeop",
    "pdb",
    "signal",
    "asyncio",
    "http",
    "urllib",
    "ftplib",
    "smtplib",
    "telnetlib",
];

const DENIED_BUILTINS: &[&str] = &[
    "eval",
    "exec",
    "execfile",
    "compile",
    "open",
    "file",
    "__import__",
    "getattr",
    "setattr",
    "delattr",
    "globals",
    "locals",
    "vars",
    "input",
    "breakpoint",
    "apply",
];

const DENIED_GLOBALS: &[(&str, &str)] = &[
    ("types", "CodeType"),
    ("types", "FunctionType"),
    ("types", "LambdaType"),
    ("operator", "attrgetter"),
    ("operator", "methodcaller"),
    ("functools", "reduce"),
    ("torch.storage", "_load_from_bytes"),
];

const SAFE_BUILTINS: &[&str] = &[
    "object",
    "bytearray",
    "set",
    "frozenset",
    "slice",
    "complex",
    "list",
    "dict",
    "tuple",
    "int",
    "float",
    "str",
    "bytes",
    "bool",
    "range",
];

const NUMPY_RECONSTRUCTORS: &[&str] = &["_reconstruct", "scalar", "ndarray", "dtype", "_frombuffer"];

const TORCH_REBUILDERS: &[&str] = &[
    "_rebuild_tensor",
    "_rebuild_tensor_v2",
    "_rebuild_parameter",
    "_rebuild_parameter_with_state",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GlobalClass {
    Denied,
    Allowed,
    Unknown,
}

fn module_matches(module: &str, root: &str) -> bool {
    module == root
        || module
            .strip_prefix(root)
            .is_some_and(|rest| rest.starts_with('.'))
}

/// Classify a referenced global
pub fn classify(global: &GlobalRef) -> GlobalClass {
    let GlobalRef { module, name } = global;

    if DENIED_MODULES.iter().any(|m| module_matches(module, m)) {
        return GlobalClass::Denied;
    }
    if matches!(module.as_str(), "builtins" | "__builtin__") {
        if DENIED_BUILTINS.contains(&name.as_str()) {
            return GlobalClass::Denied;
        }
        if SAFE_BUILTINS.contains(&name.as_str()) {
            return GlobalClass::Allowed;
        }
        return GlobalClass::Unknown;
    }
    if DENIED_GLOBALS.iter().any(|(m, n)| global.is(m, n)) {
        return GlobalClass::Denied;
    }

    let allowed = (module_matches(module, "numpy") && NUMPY_RECONSTRUCTORS.contains(&name.as_str()))
        || module_matches(module, "sklearn")
        || global.is("collections", "OrderedDict")
        || global.is("copyreg", "_reconstructor")
        || global.is("copy_reg", "_reconstructor")
        || global.is("_codecs", "encode")
        || (name == "NumpyArrayWrapper" && module.ends_with("numpy_pickle"))
        || (module == "torch._utils" && TORCH_REBUILDERS.contains(&name.as_str()))
        || (module == "torch" && name.ends_with("Storage"))
        || global.is("torch", "device")
        || global.is("torch", "Size");

    if allowed {
        GlobalClass::Allowed
    } else {
        GlobalClass::Unknown
    }
}

/// Walk one pickle stream and record findings for its globals.
///
/// Returns `false` when the stream is structurally unparseable.
pub(crate) fn analyze_stream(
    data: &[u8],
    flavor: Flavor,
    label: &str,
    sink: &mut FindingSink,
) -> bool {
    let mut machine = Machine::new(data, flavor);
    let outcome = machine.run();
    record_globals(machine.globals(), label, sink);

    match outcome {
        Ok(_) => true,
        Err(PickleError::Unsupported { name, offset }) => {
            sink.push(Finding::new(
                Severity::Critical,
                "UNRESOLVABLE_REFERENCE",
                format!(
                    "{}: {} opcode at offset {} references objects outside the stream",
                    label, name, offset
                ),
            ));
            true
        }
        Err(e) => {
            sink.push(Finding::new(
                Severity::Critical,
                "MALFORMED_ARTIFACT",
                format!("{}: pickle stream could not be parsed: {}", label, e),
            ));
            false
        }
    }
}

fn record_globals(globals: &[GlobalUse], label: &str, sink: &mut FindingSink) {
    // One finding per distinct global, noting whether any use invoked it
    let mut distinct: Vec<(&GlobalRef, bool)> = Vec::new();
    for usage in globals {
        match distinct.iter_mut().find(|(g, _)| *g == &usage.global) {
            Some((_, invoked)) => *invoked |= usage.invoked,
            None => distinct.push((&usage.global, usage.invoked)),
        }
    }

    for (global, invoked) in distinct {
        let verb = if invoked { "invokes" } else { "references" };
        match classify(global) {
            GlobalClass::Allowed => {}
            GlobalClass::Denied => sink.push(Finding::new(
                Severity::Critical,
                "DANGEROUS_GLOBAL",
                format!(
                    "{}: {} '{}', which can execute code or touch the system on load",
                    label, verb, global
                ),
            )),
            GlobalClass::Unknown => sink.push(Finding::new(
                Severity::Warning,
                "UNKNOWN_GLOBAL",
                format!("{}: {} unrecognised global '{}'", label, verb, global),
            )),
        }
    }
}
