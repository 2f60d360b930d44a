//! Static analysis of shell command lines.
//!
//! [`analyze`] turns an untrusted command line into the file operations it
//! would perform, so the guard can evaluate a `Bash` tool call the same way
//! it evaluates a direct file edit:
//!
//! ```text
//! cat input.txt && echo 'done' > output.txt; rm temp.log
//!   -> Read  input.txt
//!   -> Write output.txt
//!   -> Delete temp.log
//! ```
//!
//! Commands matching the hazard table are flagged dangerous regardless of
//! what they touch. Constructs whose targets are only known at run time
//! (command substitution, variable expansion) produce warnings; substitution
//! bodies and scripts handed to `sh -c`, `eval` or `pwsh -Command` are
//! analyzed as commands in their own right.

mod classify;
mod hazard;
mod lexer;

use serde::Serialize;

use crate::policy::{FileOperation, OperationKind};

pub use lexer::{Expansions, RedirectKind, Token, scan_expansions, split_subcommands, tokenize};

/// Maximum nesting of command substitutions and inner scripts that is analyzed.
pub const MAX_SUBSTITUTION_DEPTH: usize = 4;

/// Result of analyzing one command line.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CommandAnalysis {
    /// Every file operation found, in command order
    pub operations: Vec<FileOperation>,
    /// Constructs the analysis could not resolve
    pub warnings: Vec<String>,
    /// The command matched the hazard table
    pub dangerous: bool,
    /// Which hazard matched
    #[serde(skip_serializing_if = "Option::is_none")]
    pub danger_reason: Option<String>,
    /// Simple commands the line was split into
    pub subcommands: Vec<String>,
}

impl CommandAnalysis {
    fn add_warning(&mut self, warning: String) {
        if !self.warnings.contains(&warning) {
            self.warnings.push(warning);
        }
    }

    /// Fold the analysis of an inner command line into this one.
    fn merge(&mut self, inner: CommandAnalysis) {
        self.operations.extend(inner.operations);
        for warning in inner.warnings {
            self.add_warning(warning);
        }
        if inner.dangerous && !self.dangerous {
            self.dangerous = true;
            self.danger_reason = inner.danger_reason;
        }
    }
}

/// Analyze a shell command line.
pub fn analyze(command: &str) -> CommandAnalysis {
    analyze_at_depth(command, 0)
}

fn analyze_at_depth(command: &str, depth: usize) -> CommandAnalysis {
    let mut analysis = CommandAnalysis::default();

    if let Some(reason) = hazard::find_hazard(command) {
        analysis.dangerous = true;
        analysis.danger_reason = Some(reason.to_string());
    }

    analysis.subcommands = split_subcommands(command);
    let mut nested = Vec::new();
    for sub in &analysis.subcommands {
        let tokens = tokenize(sub);
        analysis.operations.extend(classify::classify(&tokens));
        nested.extend(classify::nested_script(&tokens));
    }
    for script in &nested {
        if depth + 1 >= MAX_SUBSTITUTION_DEPTH {
            // Unanalyzed scripts count as mutating.
            analysis.add_warning("shell script nested too deeply to analyze".to_string());
            analysis
                .operations
                .push(FileOperation::new(script.trim(), OperationKind::Unknown));
            continue;
        }
        analysis.merge(analyze_at_depth(script, depth + 1));
    }

    let expansions = scan_expansions(command);
    for var in &expansions.variables {
        analysis.add_warning(format!(
            "variable expansion: `{}` is resolved at run time and its target cannot be checked",
            var
        ));
    }
    for body in &expansions.substitutions {
        analysis.add_warning(format!(
            "command substitution: `{}` is evaluated at run time and its output cannot be checked",
            body.trim()
        ));

        if depth + 1 >= MAX_SUBSTITUTION_DEPTH {
            analysis.add_warning("command substitution nested too deeply to analyze".to_string());
            continue;
        }
        analysis.merge(analyze_at_depth(body, depth + 1));
    }

    tracing::trace!(
        command,
        operations = analysis.operations.len(),
        warnings = analysis.warnings.len(),
        dangerous = analysis.dangerous,
        "analyzed command"
    );
    analysis
}
