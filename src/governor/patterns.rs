//! Pattern tables for the classifier.
//!
//! The tables are data: the built-in set below can be replaced wholesale
//! from a TOML file so thresholds and patterns can be tuned without a
//! rebuild.
//!
//! ```toml
//! [[capabilities]]
//! pattern = "unlink("
//! capability = "DESTRUCTIVE"
//! weight = 4
//! alternative = "hide"
//!
//! [[behaviors]]
//! behavior = "FORK_BOMB"
//! weight = 40
//! description = "Potential fork bomb: fork() in loop"
//! detector = { kind = "in_loop", any = ["fork()"] }
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::types::{Behavior, Capability};
use crate::error::CoreError;

/// One capability pattern.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityRule {
    /// Substring matched against lowercased request text.
    pub pattern: String,
    /// Capability added on match.
    pub capability: Capability,
    /// Threat weight contributed; each capability counts its heaviest match once.
    pub weight: u32,
    /// Safer substitute suggested when this pattern causes a decline.
    #[serde(default)]
    pub alternative: Option<String>,
}

/// How a behaviour rule inspects text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Detector {
    /// Any of `any` occurs and, if `with_any` is non-empty, any of it too.
    Contains {
        /// Primary substrings.
        any: Vec<String>,
        /// Co-occurring substrings.
        #[serde(default)]
        with_any: Vec<String>,
    },
    /// Any of `any` occurs in text that also has a loop construct:
    /// `for (`, `while (`, `while true`, `loop {`, or `for x in`.
    InLoop {
        /// Substrings that are dangerous inside a loop.
        any: Vec<String>,
    },
    /// A quoted run of at least `min_len` base64 characters that decodes.
    Base64Literal {
        /// Minimum run length.
        min_len: usize,
    },
    /// Command substitution inside a double-quoted string.
    ShellInterpolation,
    /// A `while` loop with an empty body.
    BusyLoop,
}

/// One behaviour rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BehaviorRule {
    /// Flag raised on match.
    pub behavior: Behavior,
    /// Score contributed the first time the flag is raised.
    pub weight: u8,
    /// Human-readable finding.
    pub description: String,
    /// Matcher.
    pub detector: Detector,
}

/// Capability and behaviour rules used by the classifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatternTable {
    /// Capability patterns.
    #[serde(default)]
    pub capabilities: Vec<CapabilityRule>,
    /// Behaviour rules.
    #[serde(default)]
    pub behaviors: Vec<BehaviorRule>,
}

impl Default for PatternTable {
    fn default() -> Self {
        Self::builtin()
    }
}

fn cap(pattern: &str, capability: Capability, weight: u32) -> CapabilityRule {
    CapabilityRule {
        pattern: pattern.to_owned(),
        capability,
        weight,
        alternative: None,
    }
}

fn destructive(pattern: &str, alternative: &str) -> CapabilityRule {
    CapabilityRule {
        alternative: Some(alternative.to_owned()),
        ..cap(pattern, Capability::Destructive, 4)
    }
}

fn contains(
    behavior: Behavior,
    weight: u8,
    description: &str,
    any: &[&str],
    with_any: &[&str],
) -> BehaviorRule {
    BehaviorRule {
        behavior,
        weight,
        description: description.to_owned(),
        detector: Detector::Contains {
            any: any.iter().map(|s| (*s).to_owned()).collect(),
            with_any: with_any.iter().map(|s| (*s).to_owned()).collect(),
        },
    }
}

fn in_loop(behavior: Behavior, weight: u8, description: &str, any: &[&str]) -> BehaviorRule {
    BehaviorRule {
        behavior,
        weight,
        description: description.to_owned(),
        detector: Detector::InLoop {
            any: any.iter().map(|s| (*s).to_owned()).collect(),
        },
    }
}

impl PatternTable {
    /// The built-in table.
    pub fn builtin() -> Self {
        use Behavior as B;
        use Capability as C;

        let capabilities = vec![
            cap("read_file(", C::FsRead, 1),
            cap("fopen(", C::FsRead, 1),
            cap("open(", C::FsRead, 1),
            cap("read(", C::FsRead, 1),
            cap("readdir(", C::FsRead, 1),
            cap("write_file(", C::FsWrite, 1),
            cap("write(", C::FsWrite, 1),
            cap("fwrite(", C::FsWrite, 1),
            cap("fprintf(", C::FsWrite, 1),
            cap("overwrite", C::FsWrite, 1),
            cap("hide(", C::FsHide, 0),
            cap("hide_file(", C::FsHide, 0),
            cap("rename(", C::FsStructure, 1),
            cap("move(", C::FsStructure, 1),
            cap("mkdir(", C::FsStructure, 1),
            cap("mv ", C::FsStructure, 1),
            cap("fork(", C::ProcSpawn, 2),
            cap("exec(", C::ProcSpawn, 2),
            cap("execve(", C::ProcSpawn, 2),
            cap("spawn(", C::ProcSpawn, 2),
            cap("system(", C::ProcSpawn, 2),
            cap("popen(", C::ProcSpawn, 2),
            cap("suspend(", C::ProcSuspend, 1),
            cap("sigstop", C::ProcSuspend, 1),
            cap("resume(", C::ProcResume, 1),
            cap("sigcont", C::ProcResume, 1),
            cap("connect(", C::NetConnect, 2),
            cap("socket(", C::NetConnect, 2),
            cap("listen(", C::NetListen, 2),
            cap("bind(", C::NetListen, 2),
            cap("accept(", C::NetListen, 2),
            cap("tls", C::NetSecure, 0),
            cap("ssl_", C::NetSecure, 0),
            cap("https://", C::NetSecure, 0),
            cap("malloc(", C::MemAlloc, 1),
            cap("calloc(", C::MemAlloc, 1),
            cap("realloc(", C::MemAlloc, 1),
            cap("alloc(", C::MemAlloc, 1),
            cap("mmap(", C::MemMap, 1),
            cap("munmap(", C::MemMap, 1),
            cap("mprotect(", C::MemExec, 3),
            cap("prot_exec", C::MemExec, 3),
            cap("uname(", C::SysInfo, 0),
            cap("getpid(", C::SysInfo, 0),
            cap("sysinfo(", C::SysInfo, 0),
            cap("/proc/", C::SysInfo, 0),
            cap("/etc/", C::SysConfig, 1),
            cap("sysctl(", C::SysConfig, 1),
            cap("setenv(", C::SysConfig, 1),
            destructive("delete", "hide"),
            destructive("unlink(", "hide"),
            destructive("remove(", "hide"),
            destructive("rm ", "hide"),
            destructive("rmdir(", "hide"),
            destructive("destroy", "hide"),
            destructive("wipe", "hide"),
            destructive("shred", "hide"),
            destructive("kill(", "suspend"),
            destructive("truncate", "new version"),
            destructive("ftruncate(", "new version"),
            destructive("format(", "new version"),
        ];

        let behaviors = vec![
            contains(
                B::InfiniteLoop,
                20,
                "Potential infinite loop detected (while(1) or for(;;))",
                &[
                    "while(1)",
                    "while (1)",
                    "while(true)",
                    "while (true)",
                    "for(;;)",
                    "for (;;)",
                    "loop {",
                ],
                &[],
            ),
            in_loop(
                B::MemoryBomb,
                30,
                "Potential memory bomb: allocation in loop",
                &["malloc", "calloc", "alloc("],
            ),
            in_loop(
                B::ForkBomb,
                40,
                "Potential fork bomb: fork() in loop",
                &["fork()"],
            ),
            contains(
                B::Obfuscation,
                10,
                "Possible code obfuscation detected",
                &["\\x", "atoi", "fromcharcode", "chr("],
                &[],
            ),
            contains(
                B::EncodedPayload,
                25,
                "Encoded payload or dynamic evaluation detected",
                &["base64", "b64decode", "eval("],
                &[],
            ),
            BehaviorRule {
                behavior: B::EncodedPayload,
                weight: 25,
                description: "Base64-dense string literal".to_owned(),
                detector: Detector::Base64Literal { min_len: 40 },
            },
            contains(
                B::ShellInjection,
                30,
                "Potential shell injection via system()/exec()",
                &["system(", "popen(", "exec("],
                &[],
            ),
            BehaviorRule {
                behavior: B::ShellInjection,
                weight: 30,
                description: "Command substitution inside an interpolated string".to_owned(),
                detector: Detector::ShellInterpolation,
            },
            contains(
                B::PathTraversal,
                20,
                "Path traversal pattern detected (../)",
                &["../", "..\\"],
                &[],
            ),
            contains(
                B::ResourceExhaust,
                25,
                "Potential resource exhaustion pattern",
                &["ulimit", "setrlimit"],
                &[],
            ),
            in_loop(
                B::ResourceExhaust,
                25,
                "Descriptor exhaustion: open() in loop",
                &["open("],
            ),
            BehaviorRule {
                behavior: B::ResourceExhaust,
                weight: 25,
                description: "Tight busy loop".to_owned(),
                detector: Detector::BusyLoop,
            },
            in_loop(
                B::LoopDestruction,
                35,
                "Destructive operation in loop detected",
                &["rm ", "unlink", "delete", "kill(", "truncate", "shred"],
            ),
        ];

        Self {
            capabilities,
            behaviors,
        }
    }

    /// Parse a table from TOML.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidInput`] if the TOML is malformed or a
    /// rule is empty.
    pub fn from_toml(text: &str) -> Result<Self, CoreError> {
        let table: Self = toml::from_str(text)
            .map_err(|e| CoreError::InvalidInput(format!("pattern table: {e}")))?;
        table.validate()?;
        Ok(table)
    }

    /// Load a table from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidInput`] if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self, CoreError> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| CoreError::InvalidInput(format!("{}: {e}", path.display())))?;
        Self::from_toml(&text)
    }

    /// Reject empty patterns, which would match everything.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidInput`] naming the offending rule.
    pub fn validate(&self) -> Result<(), CoreError> {
        if let Some(rule) = self.capabilities.iter().find(|r| r.pattern.is_empty()) {
            return Err(CoreError::InvalidInput(format!(
                "empty pattern for {}",
                rule.capability.as_str()
            )));
        }
        for rule in &self.behaviors {
            let empty = match &rule.detector {
                Detector::Contains { any, with_any } => {
                    any.is_empty() || any.iter().chain(with_any).any(String::is_empty)
                }
                Detector::InLoop { any } => any.is_empty() || any.iter().any(String::is_empty),
                _ => false,
            };
            if empty {
                return Err(CoreError::InvalidInput(format!(
                    "empty pattern for {}",
                    rule.behavior.as_str()
                )));
            }
        }
        Ok(())
    }
}
