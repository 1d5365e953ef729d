//! Byte-level marker pass over raw artifact bytes

use aho_corasick::{AhoCorasick, AhoCorasickBuilder, MatchKind};

/// Byte sequences that indicate a payload reaching for process execution.
///
/// Protocol 0 `GLOBAL` opcodes encode `module\nname`, so both the dotted and
/// the newline-separated spellings are listed.
const EXECUTION_MARKERS: &[&str] = &[
    "os.system",
    "os\nsystem",
    "posix\nsystem",
    "nt\nsystem",
    "os.popen",
    "os\npopen",
    "os.exec",
    "os\nexec",
    "subprocess",
    "/bin/sh",
    "/bin/bash",
    "cmd.exe",
    "powershell",
    "__import__",
    "builtins\neval",
    "builtins\nexec",
    "__builtin__\neval",
    "__builtin__\nexec",
    "pty\nspawn",
    "runpy",
    "socket.socket",
    "socket\nsocket",
];

/// A marker hit inside the scanned bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerHit {
    pub marker: &'static str,
    pub offset: usize,
}

#[derive(Debug, Clone)]
pub struct MarkerScanner {
    automaton: AhoCorasick,
}

impl MarkerScanner {
    pub fn new() -> Result<Self, aho_corasick::BuildError> {
        let automaton = AhoCorasickBuilder::new()
            .match_kind(MatchKind::LeftmostFirst)
            .build(EXECUTION_MARKERS)?;
        Ok(Self { automaton })
    }

    /// First hit of each distinct marker, in order of appearance
    pub fn scan(&self, data: &[u8]) -> Vec<MarkerHit> {
        let mut seen = vec![false; EXECUTION_MARKERS.len()];
        let mut hits = Vec::new();
        for mat in self.automaton.find_iter(data) {
            let index = mat.pattern().as_usize();
            if !seen[index] {
                seen[index] = true;
                hits.push(MarkerHit {
                    marker: EXECUTION_MARKERS[index],
                    offset: mat.start(),
                });
            }
        }
        hits
    }
}
