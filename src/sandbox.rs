use std::sync::Arc;

use crate::normalize::normalize_command;
use crate::pathguard::{AccessMode, PathGuard};
use crate::policy::SandboxPolicy;
use crate::types::ErrorKind;

/// A rejected command with its canonical kind and an operator-facing
/// detail naming the offending token.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandDenied {
    pub kind: ErrorKind,
    pub detail: String,
}

impl CommandDenied {
    fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        CommandDenied {
            kind,
            detail: detail.into(),
        }
    }
}

/// Interpreters that must not receive inline program text.
const INTERPRETERS: &[&str] = &["python", "python3", "node"];
const INLINE_FLAGS: &[&str] = &["-c", "-e", "--eval", "--exec", "-"];
/// Python module targets that open sockets; rejected behind `-m`.
const NETWORK_MODULES: &[&str] = &["http.server", "smtplib", "smtpd", "SimpleHTTPServer"];

/// Four-phase validation pipeline over the canonical command form.
///
/// The sandbox never interprets shell grammar: a command that even
/// *could* embed chaining, substitution, or redirection is refused, and
/// the accepted token vector is spawned directly without any shell.
#[derive(Debug, Clone)]
pub struct CommandSandbox {
    policy: Arc<SandboxPolicy>,
    guard: Arc<PathGuard>,
}

impl CommandSandbox {
    pub fn new(policy: Arc<SandboxPolicy>, guard: Arc<PathGuard>) -> Self {
        CommandSandbox { policy, guard }
    }

    /// Run all phases. On success returns the argv vector to spawn.
    pub fn validate(&self, raw: &str) -> Result<Vec<String>, CommandDenied> {
        // Phase 0: normalization. Later phases only see the canonical form.
        let canonical =
            normalize_command(raw).map_err(|kind| CommandDenied::new(kind, "command is not ASCII after normalization"))?;
        if canonical.is_empty() {
            return Err(CommandDenied::new(ErrorKind::ParseError, "empty command"));
        }

        self.reject_metacharacters(&canonical)?;
        let tokens = tokenize(&canonical)?;
        self.check_allowlist(&tokens)?;
        self.confine_path_arguments(&tokens)?;
        Ok(tokens)
    }

    /// Phase 1: refuse any command containing a shell-meta substring,
    /// quoted or not.
    fn reject_metacharacters(&self, canonical: &str) -> Result<(), CommandDenied> {
        for meta in &self.policy.blocked_metacharacters {
            if canonical.contains(meta.as_str()) {
                return Err(CommandDenied::new(
                    ErrorKind::BlockedMetacharacter,
                    format!("shell operator '{meta}' is not permitted"),
                ));
            }
        }
        Ok(())
    }

    /// Phase 2: first token must be allowlisted, not blocklisted, not
    /// path-qualified, and interpreters may not receive inline code.
    fn check_allowlist(&self, tokens: &[String]) -> Result<(), CommandDenied> {
        let cmd = tokens.first().map(String::as_str).unwrap_or_default();
        if cmd.contains('/') || cmd.contains('\\') {
            return Err(CommandDenied::new(
                ErrorKind::CommandNotAllowed,
                format!("path-qualified command not permitted: {cmd}"),
            ));
        }
        if self.policy.command_blocklist.contains(cmd) {
            return Err(CommandDenied::new(
                ErrorKind::CommandNotAllowed,
                format!("command is blocklisted: {cmd}"),
            ));
        }
        if !self.policy.command_allowlist.contains(cmd) {
            return Err(CommandDenied::new(
                ErrorKind::CommandNotAllowed,
                format!("command not in allowlist: {cmd}"),
            ));
        }

        if INTERPRETERS.contains(&cmd) {
            for (i, tok) in tokens.iter().enumerate().skip(1) {
                if INLINE_FLAGS.contains(&tok.as_str()) {
                    return Err(CommandDenied::new(
                        ErrorKind::InlineInterpreter,
                        format!("inline interpreter execution not permitted: {cmd} {tok}"),
                    ));
                }
                if tok == "-m" {
                    let module = tokens.get(i + 1).map(String::as_str).unwrap_or_default();
                    if NETWORK_MODULES.contains(&module) || module.starts_with("http") {
                        return Err(CommandDenied::new(
                            ErrorKind::CommandNotAllowed,
                            format!("network module not permitted: {cmd} -m {module}"),
                        ));
                    }
                }
            }
        }

        if cmd == "git" {
            let sub = tokens
                .iter()
                .skip(1)
                .find(|t| !t.starts_with('-'))
                .map(String::as_str)
                .unwrap_or_default();
            if !SandboxPolicy::git_subcommand_allowed(sub) {
                return Err(CommandDenied::new(
                    ErrorKind::CommandNotAllowed,
                    format!("git subcommand not permitted: {sub}"),
                ));
            }
        }
        Ok(())
    }

    /// Phase 3: path-shaped arguments of filesystem commands must stay
    /// inside the sandbox; copy/rename destinations are held to the
    /// write rules so an allowed file cannot become an executable.
    fn confine_path_arguments(&self, tokens: &[String]) -> Result<(), CommandDenied> {
        let cmd = tokens.first().map(String::as_str).unwrap_or_default();
        if cmd == "git" || !self.policy.path_arg_commands.contains(cmd) {
            return Ok(());
        }

        let non_options: Vec<&String> =
            tokens[1..].iter().filter(|t| !t.starts_with('-')).collect();

        let to_confine: &[&String] = match cmd {
            // First non-option argument is the search pattern, not a path.
            "grep" | "rg" | "ag" => {
                if non_options.len() > 1 {
                    &non_options[1..]
                } else {
                    &[]
                }
            }
            // find <root> [expressions]: only the root is a path.
            "find" => {
                if non_options.is_empty() {
                    &[]
                } else {
                    &non_options[..1]
                }
            }
            _ => &non_options[..],
        };

        for arg in to_confine {
            self.guard
                .confine(arg.as_str())
                .map_err(|e| CommandDenied::new(e.kind, e.detail))?;
        }

        if matches!(cmd, "cp" | "mv") {
            if let Some(dest) = non_options.last() {
                if non_options.len() >= 2 {
                    self.guard
                        .validate(dest.as_str(), AccessMode::Write)
                        .map_err(|e| CommandDenied::new(e.kind, e.detail))?;
                }
            }
        }
        Ok(())
    }
}

/// Split by ASCII whitespace honoring single and double quotes. No
/// backslash escapes and no expansion of any kind.
fn tokenize(canonical: &str) -> Result<Vec<String>, CommandDenied> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut started = false;
    let mut quote: Option<char> = None;

    for c in canonical.chars() {
        match quote {
            Some(q) => {
                if c == q {
                    quote = None;
                } else {
                    current.push(c);
                }
            }
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    started = true;
                }
                c if c.is_ascii_whitespace() => {
                    if started {
                        tokens.push(std::mem::take(&mut current));
                        started = false;
                    }
                }
                _ => {
                    current.push(c);
                    started = true;
                }
            },
        }
    }
    if quote.is_some() {
        return Err(CommandDenied::new(ErrorKind::ParseError, "unterminated quote"));
    }
    if started {
        tokens.push(current);
    }
    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::tempdir;

    use super::{tokenize, CommandSandbox};
    use crate::pathguard::PathGuard;
    use crate::policy::SandboxPolicy;
    use crate::types::ErrorKind;

    fn sandbox_in(dir: &std::path::Path) -> CommandSandbox {
        let policy = Arc::new(SandboxPolicy::with_defaults(vec![dir.to_path_buf()]));
        let guard = Arc::new(PathGuard::from_policy(&policy, dir).expect("guard"));
        CommandSandbox::new(policy, guard)
    }

    #[test]
    fn tokenizer_honors_quotes() {
        let toks = tokenize("git commit -m 'fix the parser'").expect("tokens");
        assert_eq!(toks, vec!["git", "commit", "-m", "fix the parser"]);
        let toks = tokenize("echo \"two words\" bare").expect("tokens");
        assert_eq!(toks, vec!["echo", "two words", "bare"]);
        assert!(tokenize("echo 'unterminated").is_err());
    }

    #[test]
    fn chaining_is_rejected_before_anything_else() {
        let tmp = tempdir().expect("tempdir");
        let sb = sandbox_in(tmp.path());
        let err = sb.validate("git status && echo hacked").expect_err("deny");
        assert_eq!(err.kind, ErrorKind::BlockedMetacharacter);
        for cmd in [
            "ls ; date",
            "cat a.txt | grep x",
            "echo `whoami`",
            "echo $(date)",
            "echo ${HOME}",
            "echo hi > out.txt",
            "cat < in.txt",
        ] {
            assert_eq!(
                sb.validate(cmd).expect_err("deny").kind,
                ErrorKind::BlockedMetacharacter,
                "{cmd}"
            );
        }
    }

    #[test]
    fn quoting_is_not_a_defense() {
        let tmp = tempdir().expect("tempdir");
        let sb = sandbox_in(tmp.path());
        let err = sb.validate("echo \"a && b\"").expect_err("deny");
        assert_eq!(err.kind, ErrorKind::BlockedMetacharacter);
    }

    #[test]
    fn allowlist_and_blocklist_enforced() {
        let tmp = tempdir().expect("tempdir");
        let sb = sandbox_in(tmp.path());
        assert_eq!(
            sb.validate("frobnicate --all").expect_err("deny").kind,
            ErrorKind::CommandNotAllowed
        );
        for cmd in ["env", "printenv", "curl http://x", "npx cowsay", "sudo ls"] {
            assert_eq!(
                sb.validate(cmd).expect_err("deny").kind,
                ErrorKind::CommandNotAllowed,
                "{cmd}"
            );
        }
        assert_eq!(
            sb.validate("/usr/bin/ls").expect_err("deny").kind,
            ErrorKind::CommandNotAllowed
        );
    }

    #[test]
    fn inline_interpreter_rejected_even_after_homoglyph_folding() {
        let tmp = tempdir().expect("tempdir");
        let sb = sandbox_in(tmp.path());
        assert_eq!(
            sb.validate("python -c 'print(1)'").expect_err("deny").kind,
            ErrorKind::InlineInterpreter
        );
        assert_eq!(
            sb.validate("node --eval 'x'").expect_err("deny").kind,
            ErrorKind::InlineInterpreter
        );
        // FULLWIDTH 'ｐ' folds to 'p' in phase 0, then phase 2 sees -c.
        assert_eq!(
            sb.validate("\u{ff50}ython -c 'print(1)'").expect_err("deny").kind,
            ErrorKind::InlineInterpreter
        );
        assert_eq!(
            sb.validate("python -m http.server").expect_err("deny").kind,
            ErrorKind::CommandNotAllowed
        );
        // Running a script file is fine.
        std::fs::write(tmp.path().join("s.py"), "print(1)\n").expect("write");
        sb.validate("python s.py").expect("script run allowed");
    }

    #[test]
    fn git_subcommands_are_gated() {
        let tmp = tempdir().expect("tempdir");
        let sb = sandbox_in(tmp.path());
        sb.validate("git status").expect("allowed");
        sb.validate("git commit -m 'msg'").expect("allowed");
        for cmd in ["git push origin main", "git pull", "git fetch", "git clone x", "git remote -v"] {
            assert_eq!(
                sb.validate(cmd).expect_err("deny").kind,
                ErrorKind::CommandNotAllowed,
                "{cmd}"
            );
        }
    }

    #[test]
    fn path_arguments_are_confined() {
        let tmp = tempdir().expect("tempdir");
        let sb = sandbox_in(tmp.path());
        assert_eq!(
            sb.validate("ls -la /etc").expect_err("deny").kind,
            ErrorKind::OutsideSandbox
        );
        assert_eq!(
            sb.validate("cat /etc/passwd").expect_err("deny").kind,
            ErrorKind::OutsideSandbox
        );
        sb.validate("ls -la").expect("bare listing allowed");
        std::fs::write(tmp.path().join("notes.txt"), "x").expect("write");
        sb.validate("cat notes.txt").expect("inside sandbox");
        // grep's first non-option argument is the pattern, not a path.
        sb.validate("grep TODO notes.txt").expect("grep in sandbox");
        assert_eq!(
            sb.validate("grep TODO /etc/hosts").expect_err("deny").kind,
            ErrorKind::OutsideSandbox
        );
    }

    #[test]
    fn rename_to_executable_extension_is_rejected() {
        let tmp = tempdir().expect("tempdir");
        let sb = sandbox_in(tmp.path());
        std::fs::write(tmp.path().join("helper.txt"), "x").expect("write");
        assert_eq!(
            sb.validate("mv helper.txt helper.sh").expect_err("deny").kind,
            ErrorKind::BlockedExtension
        );
        assert_eq!(
            sb.validate("cp helper.txt payload.bat").expect_err("deny").kind,
            ErrorKind::BlockedExtension
        );
        sb.validate("mv helper.txt helper.md").expect("benign rename");
    }

    #[test]
    fn accepted_command_returns_argv() {
        let tmp = tempdir().expect("tempdir");
        let sb = sandbox_in(tmp.path());
        let argv = sb.validate("git log -5 --oneline").expect("argv");
        assert_eq!(argv, vec!["git", "log", "-5", "--oneline"]);
    }
}
