//! Map a tokenized simple command to the file operations it performs.

use super::lexer::{RedirectKind, Token};
use crate::policy::{FileOperation, OperationKind};

/// Prefixes that run the rest of the line as a command.
const WRAPPERS: &[&str] = &["sudo", "command", "env", "nohup", "time", "exec", "builtin"];

/// Redirection targets that are not project files.
const PSEUDO_FILES: &[&str] = &["/dev/null", "/dev/stdout", "/dev/stderr", "/dev/tty", "nul", "$null"];

/// Commands whose operands are read.
const READ_VERBS: &[&str] = &[
    "cat", "head", "tail", "type", "get-content", "gc", "less", "more", "grep", "egrep", "fgrep",
    "rg", "wc", "sort", "uniq",
];

/// Commands whose operands are deleted.
const DELETE_VERBS: &[&str] = &["rm", "rmdir", "unlink", "remove-item", "del", "ri"];

/// PowerShell cmdlets, which take named parameters.
const POWERSHELL_VERBS: &[&str] = &[
    "get-content", "gc", "set-content", "add-content", "out-file", "remove-item", "ri", "del",
];

/// Classify one simple command.
pub fn classify(tokens: &[Token]) -> Vec<FileOperation> {
    let mut ops = Vec::new();
    let mut words: Vec<&str> = Vec::new();

    for token in tokens {
        match token {
            Token::Word(word) => words.push(word),
            Token::Redirect { kind, target } => {
                if is_pseudo_file(target) {
                    continue;
                }
                match kind {
                    RedirectKind::Write | RedirectKind::Append => {
                        ops.push(FileOperation::new(target.as_str(), OperationKind::Write));
                    }
                    RedirectKind::Read => {
                        ops.push(FileOperation::new(target.as_str(), OperationKind::Read));
                    }
                    RedirectKind::HereDoc | RedirectKind::Duplicate => {}
                }
            }
        }
    }

    let args = strip_prefixes(&words);
    let Some((program, args)) = args.split_first() else {
        return ops;
    };
    let verb = verb_name(program);
    let verb = verb.as_str();

    let mut command_ops = match verb {
        "grep" | "egrep" | "fgrep" | "rg" => classify_search(verb, args),
        "sed" => classify_sed(args),
        "sort" => classify_sort(args),
        "head" | "tail" => operands(args, &["-n", "-c", "--lines", "--bytes"])
            .map(|p| FileOperation::new(p, OperationKind::Read))
            .collect(),
        "cp" | "copy" | "copy-item" | "cpi" => classify_copy(args, OperationKind::Read),
        "mv" | "move" | "move-item" | "mi" => classify_copy(args, OperationKind::Delete),
        "tee" => operands(args, &[])
            .map(|p| FileOperation::new(p, OperationKind::Write))
            .collect(),
        "touch" => operands(args, &["-d", "-r", "-t", "--date", "--reference"])
            .map(|p| FileOperation::new(p, OperationKind::Write))
            .collect(),
        "mkdir" => operands(args, &["-m", "--mode"])
            .map(|p| FileOperation::new(p, OperationKind::Write))
            .collect(),
        "set-content" | "add-content" | "out-file" => {
            powershell_paths(args, 1, &["-value", "-encoding", "-inputobject", "-stream", "-width"])
                .into_iter()
                .map(|p| FileOperation::new(p, OperationKind::Write))
                .collect()
        }
        "echo" | "printf" | "write-output" | "write-host" => Vec::new(),
        v if POWERSHELL_VERBS.contains(&v) && DELETE_VERBS.contains(&v) => {
            powershell_paths(args, usize::MAX, &["-filter", "-include", "-exclude", "-stream"])
                .into_iter()
                .map(|p| FileOperation::new(p, OperationKind::Delete))
                .collect()
        }
        v if POWERSHELL_VERBS.contains(&v) => {
            powershell_paths(
                args,
                usize::MAX,
                &["-encoding", "-totalcount", "-tail", "-head", "-first", "-last", "-delimiter"],
            )
            .into_iter()
            .map(|p| FileOperation::new(p, OperationKind::Read))
            .collect()
        }
        v if READ_VERBS.contains(&v) => operands(args, &[])
            .map(|p| FileOperation::new(p, OperationKind::Read))
            .collect(),
        v if DELETE_VERBS.contains(&v) => operands(args, &[])
            .map(|p| FileOperation::new(p, OperationKind::Delete))
            .collect(),
        _ => vec![FileOperation::new(*program, OperationKind::Execute)],
    };

    ops.append(&mut command_ops);
    ops
}

/// Script text a simple command hands to another interpreter: the `-c`
/// argument of a POSIX shell, the arguments of `eval`, or the `-Command`
/// text of PowerShell.
pub fn nested_script(tokens: &[Token]) -> Option<String> {
    let words: Vec<&str> = tokens
        .iter()
        .filter_map(|token| match token {
            Token::Word(word) => Some(word.as_str()),
            Token::Redirect { .. } => None,
        })
        .collect();
    let args = strip_prefixes(&words);
    let (program, args) = args.split_first()?;

    match verb_name(program).as_str() {
        "sh" | "bash" | "zsh" | "dash" | "ksh" => {
            let mut args = args.iter();
            while let Some(arg) = args.next() {
                match *arg {
                    "--" => return None,
                    "-o" | "+o" | "-O" | "+O" => {
                        args.next();
                    }
                    flag if flag == "-c" || is_short_cluster_with(flag, 'c') => {
                        return args.next().map(|script| script.to_string());
                    }
                    flag if flag.starts_with(['-', '+']) => {}
                    _ => return None,
                }
            }
            None
        }
        "eval" => (!args.is_empty()).then(|| args.join(" ")),
        "pwsh" | "powershell" => {
            let at = args.iter().position(|arg| {
                let flag = arg.to_ascii_lowercase();
                flag.len() > 1 && "-command".starts_with(flag.as_str())
            })?;
            let script = args[at + 1..].join(" ");
            (!script.is_empty()).then_some(script)
        }
        _ => None,
    }
}

fn is_pseudo_file(target: &str) -> bool {
    PSEUDO_FILES.iter().any(|p| p.eq_ignore_ascii_case(target))
}

/// Lowercased file name of the program, without a Windows extension.
fn verb_name(program: &str) -> String {
    let name = program.rsplit(['/', '\\']).next().unwrap_or(program);
    let lower = name.to_ascii_lowercase();
    for ext in [".exe", ".cmd", ".bat"] {
        if let Some(stem) = lower.strip_suffix(ext) {
            return stem.to_string();
        }
    }
    lower
}

fn is_assignment(word: &str) -> bool {
    match word.split_once('=') {
        Some((name, _)) => {
            !name.is_empty()
                && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                && !name.starts_with(|c: char| c.is_ascii_digit())
        }
        None => false,
    }
}

/// Drop leading environment assignments and wrapper commands.
fn strip_prefixes<'a>(words: &[&'a str]) -> Vec<&'a str> {
    let mut i = 0;
    loop {
        while i < words.len() && is_assignment(words[i]) {
            i += 1;
        }
        let Some(word) = words.get(i) else {
            break;
        };
        if !WRAPPERS.contains(&verb_name(word).as_str()) {
            break;
        }
        let wrapper = verb_name(word);
        i += 1;
        while let Some(flag) = words.get(i).filter(|w| w.starts_with('-')) {
            i += 1;
            // Wrapper flags that take a value.
            if matches!(
                (wrapper.as_str(), *flag),
                ("sudo", "-u" | "-g" | "-C" | "-D" | "-h" | "-p" | "-U")
                    | ("env", "-u" | "-C" | "-S")
                    | ("time", "-f" | "-o")
            ) {
                i += 1;
            }
        }
    }
    words[i.min(words.len())..].to_vec()
}

/// Operands after flags. `value_flags` consume the following word; `--`
/// ends flag parsing; `-` (stdin) is skipped.
fn operands<'a>(args: &[&'a str], value_flags: &[&str]) -> std::vec::IntoIter<&'a str> {
    let mut out = Vec::new();
    let mut only_operands = false;
    let mut skip_next = false;
    for arg in args {
        if skip_next {
            skip_next = false;
            continue;
        }
        if only_operands {
            out.push(*arg);
            continue;
        }
        match *arg {
            "--" => only_operands = true,
            "-" => {}
            flag if flag.starts_with('-') => {
                if value_flags.contains(&flag) {
                    skip_next = true;
                }
            }
            operand => out.push(operand),
        }
    }
    out.into_iter()
}

fn classify_search(verb: &str, args: &[&str]) -> Vec<FileOperation> {
    let value_flags: &[&str] = match verb {
        "rg" => &[
            "-e", "-f", "-g", "-t", "-T", "-m", "-A", "-B", "-C", "-j", "-M", "--glob", "--type",
            "--regexp", "--file", "--max-count", "--context",
        ],
        _ => &[
            "-e", "-f", "-m", "-A", "-B", "-C", "-d", "-D", "--regexp", "--file", "--include",
            "--exclude", "--exclude-dir", "--max-count",
        ],
    };

    let mut ops = Vec::new();
    let mut explicit_pattern = false;
    let mut iter = args.iter().peekable();
    while let Some(arg) = iter.next() {
        match *arg {
            "-e" | "--regexp" => explicit_pattern = true,
            "-f" | "--file" => {
                explicit_pattern = true;
                if let Some(file) = iter.peek() {
                    ops.push(FileOperation::new(**file, OperationKind::Read));
                }
            }
            a if a.starts_with("--regexp=") => explicit_pattern = true,
            a if a.starts_with("--file=") => {
                explicit_pattern = true;
                ops.push(FileOperation::new(&a["--file=".len()..], OperationKind::Read));
            }
            _ => {}
        }
    }

    let mut files = operands(args, value_flags);
    if !explicit_pattern {
        files.next();
    }
    ops.extend(files.map(|p| FileOperation::new(p, OperationKind::Read)));
    ops
}

fn classify_sed(args: &[&str]) -> Vec<FileOperation> {
    let in_place = args.iter().any(|a| {
        a.starts_with("--in-place")
            || (a.starts_with("-i") && !a.starts_with("--"))
            || is_short_cluster_with(a, 'i')
    });
    let explicit_script = args.iter().any(|a| {
        matches!(*a, "-e" | "-f" | "--expression" | "--file") || a.starts_with("--expression=")
    });

    let kind = if in_place {
        OperationKind::Write
    } else {
        OperationKind::Read
    };
    let mut files = operands(args, &["-e", "-f", "--expression", "--file", "-l"]);
    if !explicit_script {
        files.next();
    }
    files.map(|p| FileOperation::new(p, kind)).collect()
}

/// `-ni`, `-Ei` and similar short-flag clusters.
fn is_short_cluster_with(arg: &str, flag: char) -> bool {
    arg.strip_prefix('-')
        .filter(|rest| !rest.starts_with('-') && rest.len() > 1)
        .is_some_and(|rest| rest.chars().all(|c| c.is_ascii_alphabetic()) && rest.contains(flag))
}

fn classify_sort(args: &[&str]) -> Vec<FileOperation> {
    let mut ops = Vec::new();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if *arg == "-o" || *arg == "--output" {
            if let Some(out) = iter.next() {
                ops.push(FileOperation::new(*out, OperationKind::Write));
            }
        } else if let Some(out) = arg.strip_prefix("--output=") {
            ops.push(FileOperation::new(out, OperationKind::Write));
        }
    }
    ops.extend(
        operands(args, &["-o", "--output", "-k", "-t", "-S", "-T", "--key", "--field-separator"])
            .map(|p| FileOperation::new(p, OperationKind::Read)),
    );
    ops
}

/// `cp`/`mv`: sources get `source_kind`, the destination is written.
fn classify_copy(args: &[&str], source_kind: OperationKind) -> Vec<FileOperation> {
    let mut target_dir = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if *arg == "-t" || *arg == "--target-directory" || arg.eq_ignore_ascii_case("-destination") {
            target_dir = iter.next().copied();
        } else if let Some(dir) = arg.strip_prefix("--target-directory=") {
            target_dir = Some(dir);
        }
    }

    let mut paths: Vec<&str> = Vec::new();
    let mut skip_next = false;
    let mut only_operands = false;
    for arg in args {
        if skip_next {
            skip_next = false;
            continue;
        }
        if only_operands {
            paths.push(arg);
            continue;
        }
        match *arg {
            "--" => only_operands = true,
            "-t" | "--target-directory" | "-S" | "--suffix" => skip_next = true,
            a if a.eq_ignore_ascii_case("-destination") => skip_next = true,
            a if a.eq_ignore_ascii_case("-path") || a.eq_ignore_ascii_case("-literalpath") => {}
            a if a.starts_with('-') => {}
            a => paths.push(a),
        }
    }

    let (sources, destination) = match target_dir {
        Some(dir) => (paths.as_slice(), Some(dir)),
        None => match paths.split_last() {
            Some((last, rest)) if !rest.is_empty() => (rest, Some(*last)),
            // A single operand has no destination.
            _ => (paths.as_slice(), None),
        },
    };

    let mut ops: Vec<FileOperation> = sources
        .iter()
        .map(|p| FileOperation::new(*p, source_kind))
        .collect();
    if let Some(dest) = destination {
        ops.push(FileOperation::new(dest, OperationKind::Write));
    }
    ops
}

/// Paths of a PowerShell cmdlet: values of `-Path`, `-LiteralPath` and
/// `-FilePath`, plus up to `max_positional` positional arguments. A named
/// path parameter shifts positionals to later parameters, so when one is
/// present and `max_positional` is bounded, positionals are not paths.
/// Parameters in `value_params` consume their value.
fn powershell_paths<'a>(args: &[&'a str], max_positional: usize, value_params: &[&str]) -> Vec<&'a str> {
    const PATH_PARAMS: &[&str] = &["-path", "-literalpath", "-filepath", "-lp", "-pspath"];

    let mut named = Vec::new();
    let mut positional = Vec::new();
    let mut iter = args.iter().copied();
    while let Some(arg) = iter.next() {
        let lower = arg.to_ascii_lowercase();
        if let Some((name, _)) = lower.split_once(':').filter(|(n, _)| n.starts_with('-')) {
            if PATH_PARAMS.contains(&name) {
                named.extend(split_list(&arg[name.len() + 1..]));
            }
            continue;
        }
        match lower.as_str() {
            p if PATH_PARAMS.contains(&p) => {
                if let Some(value) = iter.next() {
                    named.extend(split_list(value));
                }
            }
            p if value_params.contains(&p) => {
                iter.next();
            }
            p if p.starts_with('-') => {}
            _ => positional.push(arg),
        }
    }

    let take = if !named.is_empty() && max_positional != usize::MAX {
        0
    } else {
        max_positional
    };
    named
        .into_iter()
        .chain(positional.into_iter().take(take).flat_map(split_list))
        .collect()
}

fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}
