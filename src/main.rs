use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info, warn};

use warden::audit::AuditLog;
use warden::binpath::BinPathRegistry;
use warden::config::{apply_config, find_config_file, load_config, FileConfig};
use warden::dispatch::Dispatcher;
use warden::gate::{Arbitrator, PermissionMode, StdinPrompt};
use warden::integrity::{default_trust_roots, IntegrityVerifier, ManifestError};
use warden::pathguard::PathGuard;
use warden::plugins::load_plugins;
use warden::policy::SandboxPolicy;
use warden::protocol::ToolRegistry;
use warden::providers::http::HttpProvider;
use warden::providers::mock::MockProvider;
use warden::providers::{GenerateRequest, ModelProvider};
use warden::sandbox::CommandSandbox;
use warden::tools::{register_builtin_tools, ToolContext};
use warden::types::{Message, Role};
use warden::{
    build_system_prompt, RunArgs, EXIT_CONFIG_ERROR, EXIT_INTEGRITY_FAILURE, EXIT_OK,
    EXIT_PERMISSION_REFUSED,
};

const MAX_TOOL_ROUNDS: usize = 8;

#[tokio::main]
async fn main() {
    let code = run().await;
    std::process::exit(code);
}

async fn run() -> i32 {
    let args = RunArgs::parse();
    init_tracing();

    let workdir = match resolve_workdir(&args) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("ERROR: {e:#}");
            return EXIT_CONFIG_ERROR;
        }
    };

    let file_config = match load_file_config(&args, &workdir) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("ERROR: {e:#}");
            return EXIT_CONFIG_ERROR;
        }
    };

    // Boot integrity comes before anything touches the policy or tools.
    let verifier = IntegrityVerifier::new(&workdir);
    if args.generate_manifest {
        return generate_manifest(&verifier, &workdir, &file_config);
    }
    match check_integrity(&args, &verifier) {
        Ok(()) => {}
        Err(code) => return code,
    }
    if args.verify_only {
        println!("manifest verified");
        return EXIT_OK;
    }

    let binpaths = match BinPathRegistry::resolve_at_boot() {
        Ok(b) => b,
        Err(e) => {
            eprintln!("ERROR: {e:#}");
            return EXIT_CONFIG_ERROR;
        }
    };
    for w in binpaths.warnings() {
        warn!("{w}");
    }

    let mut policy = SandboxPolicy::with_defaults(vec![workdir.clone()]);
    policy.allowed_dirs.extend(args.allow_dirs.iter().cloned());
    apply_config(&mut policy, &file_config);
    // The trust roots, the manifest, and persistent memory are never
    // writable through tools, no matter what allowed_dirs says.
    policy.protected_paths.push(verifier.manifest_path().to_path_buf());
    policy.protected_paths.push(workdir.join("MEMORY.md"));
    for root in default_trust_roots(&workdir) {
        policy.protected_paths.push(root);
    }

    let policy = Arc::new(policy);
    let guard = match PathGuard::from_policy(&policy, &workdir) {
        Ok(g) => Arc::new(g),
        Err(e) => {
            eprintln!("ERROR: {e:#}");
            return EXIT_CONFIG_ERROR;
        }
    };
    let sandbox = Arc::new(CommandSandbox::new(policy.clone(), guard.clone()));
    let audit = Arc::new(AuditLog::new(&workdir));

    let mut registry = ToolRegistry::new();
    if let Err(e) = register_builtin_tools(&mut registry) {
        eprintln!("ERROR: {e:#}");
        return EXIT_CONFIG_ERROR;
    }
    let mut aliases = warden::plugins::PluginAliases::new();
    if let Some(dir) = &args.plugins_dir {
        match load_plugins(dir, &mut registry) {
            Ok(a) => aliases = a,
            Err(e) => {
                eprintln!("ERROR: {e:#}");
                return EXIT_CONFIG_ERROR;
            }
        }
    }
    registry.freeze();

    let provider: Box<dyn ModelProvider> = if args.offline {
        Box::new(MockProvider::new(Vec::new()))
    } else {
        let endpoint = file_config.endpoint.as_deref().unwrap_or(&args.endpoint);
        let model = file_config.model.as_deref().unwrap_or(&args.model);
        match HttpProvider::new(endpoint, model) {
            Ok(p) => Box::new(p),
            Err(e) => {
                eprintln!("ERROR: {e:#}");
                return EXIT_CONFIG_ERROR;
            }
        }
    };

    if let Some(expected) = &args.expected_model {
        match provider.model_id().await {
            Ok(actual) if &actual == expected => {
                info!(model = %actual, "model identity pinned");
            }
            Ok(actual) => {
                eprintln!("ERROR: backend reports model '{actual}', expected '{expected}'");
                return EXIT_CONFIG_ERROR;
            }
            Err(e) => {
                eprintln!("ERROR: cannot confirm model identity: {e:#}");
                return EXIT_CONFIG_ERROR;
            }
        }
    }

    let ctx = ToolContext {
        policy,
        guard: guard.clone(),
        sandbox,
        binpaths: Arc::new(binpaths),
        audit: audit.clone(),
        workdir: guard.base_dir().to_path_buf(),
    };
    let arbitrator = Arbitrator::new(args.dangerously_skip_permissions);
    let mut dispatcher = Dispatcher::new(registry, arbitrator, ctx);
    dispatcher.set_plugin_aliases(aliases);

    audit.session_start(&workdir, &args.model, args.dangerously_skip_permissions);
    info!(
        workdir = %workdir.display(),
        audit = %audit.log_path().display(),
        git_sha = env!("WARDEN_GIT_SHA"),
        "warden ready"
    );

    let code = repl(&mut dispatcher, provider.as_ref()).await;
    audit.session_end(dispatcher.turn.turn_index, dispatcher.tool_calls_total());
    code
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let filter = EnvFilter::try_from_env("WARDEN_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn resolve_workdir(args: &RunArgs) -> anyhow::Result<PathBuf> {
    let dir = match &args.workdir {
        Some(d) => d.clone(),
        None => std::env::current_dir()?,
    };
    Ok(std::fs::canonicalize(&dir)?)
}

fn load_file_config(args: &RunArgs, workdir: &std::path::Path) -> anyhow::Result<FileConfig> {
    let path = match &args.config {
        Some(p) => Some(p.clone()),
        None => find_config_file(workdir),
    };
    match path {
        Some(p) => load_config(&p),
        None => Ok(FileConfig::default()),
    }
}

fn read_passphrase(prompt: &str) -> Option<String> {
    if let Ok(pass) = std::env::var("WARDEN_MANIFEST_PASSPHRASE") {
        return Some(pass);
    }
    eprint!("{prompt}");
    let _ = std::io::stderr().flush();
    let mut line = String::new();
    std::io::stdin().read_line(&mut line).ok()?;
    let pass = line.trim_end_matches(['\n', '\r']).to_string();
    (!pass.is_empty()).then_some(pass)
}

fn generate_manifest(
    verifier: &IntegrityVerifier,
    workdir: &std::path::Path,
    config: &FileConfig,
) -> i32 {
    let Some(pass) = read_passphrase("Manifest signing passphrase: ") else {
        eprintln!("ERROR: passphrase cannot be empty");
        return EXIT_CONFIG_ERROR;
    };
    let roots = if config.trust_roots.is_empty() {
        default_trust_roots(workdir)
    } else {
        config.trust_roots.clone()
    };
    if roots.is_empty() {
        eprintln!("ERROR: no trust root files found to sign");
        return EXIT_CONFIG_ERROR;
    }
    match verifier.generate(&pass, &roots) {
        Ok(path) => {
            println!("manifest written: {} ({} files)", path.display(), roots.len());
            EXIT_OK
        }
        Err(e) => {
            eprintln!("ERROR: {e}");
            EXIT_CONFIG_ERROR
        }
    }
}

/// Integrity gate at boot. `Err` carries the process exit code.
fn check_integrity(args: &RunArgs, verifier: &IntegrityVerifier) -> Result<(), i32> {
    if !verifier.manifest_exists() {
        if args.verify_only {
            eprintln!("ERROR: {}", ManifestError::Missing(verifier.manifest_path().to_path_buf()));
            return Err(EXIT_INTEGRITY_FAILURE);
        }
        if args.strict_sandbox {
            eprintln!("ERROR: --strict-sandbox requires a manifest; run --generate-manifest");
            return Err(EXIT_INTEGRITY_FAILURE);
        }
        warn!("no integrity manifest found; run --generate-manifest to create one");
        eprint!("Proceed without boot integrity verification? [y/N] ");
        let _ = std::io::stderr().flush();
        let mut line = String::new();
        let _ = std::io::stdin().read_line(&mut line);
        if !matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes") {
            return Err(EXIT_PERMISSION_REFUSED);
        }
        return Ok(());
    }

    let Some(pass) = read_passphrase("Manifest passphrase: ") else {
        eprintln!("ERROR: passphrase required to verify manifest");
        return Err(EXIT_PERMISSION_REFUSED);
    };
    match verifier.verify(&pass) {
        Ok(report) => {
            info!(files = report.files_checked, "trust roots verified");
            Ok(())
        }
        Err(e) => {
            eprintln!("ERROR: {e}");
            Err(EXIT_INTEGRITY_FAILURE)
        }
    }
}

/// Operator loop. One line in, one turn out: generation, then a bounded
/// sequence of tool rounds, then the next prompt. Ctrl-C cancels the
/// round in flight and keeps the session.
async fn repl(dispatcher: &mut Dispatcher, provider: &dyn ModelProvider) -> i32 {
    let system_prompt = build_system_prompt(&dispatcher.registry);
    let mut conversation: Vec<Message> = Vec::new();
    let mut prompt = StdinPrompt;
    let stdin = std::io::stdin();

    loop {
        print!("warden> ");
        let _ = std::io::stdout().flush();
        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => return EXIT_OK,
            Ok(_) => {}
            Err(e) => {
                error!("stdin: {e}");
                return EXIT_OK;
            }
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if let Some(done) = handle_slash_command(dispatcher, input) {
            if done {
                return EXIT_OK;
            }
            continue;
        }

        dispatcher.begin_turn();
        conversation.push(Message::new(Role::User, input));

        for _round in 0..MAX_TOOL_ROUNDS {
            let req = GenerateRequest {
                system: system_prompt.clone(),
                messages: conversation.clone(),
            };
            let output = tokio::select! {
                result = provider.generate(req) => match result {
                    Ok(text) => text,
                    Err(e) => {
                        eprintln!("backend error: {e:#}");
                        dispatcher.ctx.audit.error("provider", &format!("{e:#}"));
                        break;
                    }
                },
                _ = tokio::signal::ctrl_c() => {
                    eprintln!("\n[interrupted]");
                    break;
                }
            };

            println!("{}", display_text(&output));
            conversation.push(Message::new(Role::Assistant, output.clone()));

            let frames = tokio::select! {
                frames = dispatcher.run_model_output(&output, &mut prompt) => frames,
                _ = tokio::signal::ctrl_c() => {
                    // Partial tool results are discarded, never injected.
                    eprintln!("\n[interrupted]");
                    break;
                }
            };
            if frames.is_empty() {
                break;
            }
            for frame in &frames {
                if let Some(denied) = denied_summary(frame) {
                    eprintln!("  [blocked] {denied}");
                }
            }
            conversation.push(Message::new(Role::Tool, frames.join("\n")));
        }
    }
}

/// Session-local operator commands. Returns Some(true) to quit,
/// Some(false) when a command was handled, None for plain chat input.
fn handle_slash_command(dispatcher: &mut Dispatcher, input: &str) -> Option<bool> {
    let mut parts = input.split_whitespace();
    match parts.next()? {
        "/quit" | "/exit" => Some(true),
        "/tools" => {
            println!("{}", dispatcher.registry.render_tool_docs());
            Some(false)
        }
        "/trust" => {
            match parts.next() {
                Some(path) => match dispatcher.trust_path(path) {
                    Ok(resolved) => println!("trusted: {}", resolved.display()),
                    Err(e) => println!("cannot trust {path}: {}", e.detail),
                },
                None => println!("usage: /trust <path>"),
            }
            Some(false)
        }
        "/undo" => {
            match dispatcher.undo_last_write() {
                Ok(target) => println!("restored {}", target.display()),
                Err(e) => println!("{e}"),
            }
            Some(false)
        }
        "/permission" => {
            match (parts.next(), parts.next().and_then(PermissionMode::parse)) {
                (Some(tool), Some(mode)) => {
                    dispatcher.arbitrator.set_override(tool, mode);
                    println!("{tool} -> {}", mode.as_str());
                }
                _ => println!("usage: /permission <tool> <allow|ask|deny>"),
            }
            Some(false)
        }
        cmd if cmd.starts_with('/') => {
            println!("unknown command: {cmd} (try /tools, /trust, /permission, /undo, /quit)");
            Some(false)
        }
        _ => None,
    }
}

/// Strip tool-call markers from the text shown on the operator terminal;
/// the full output still goes to the model transcript untouched.
fn display_text(output: &str) -> String {
    let mut cleaned = output.to_string();
    for parsed in warden::protocol::extract_tool_calls(output).iter().rev() {
        let (start, end) = parsed.span;
        cleaned.replace_range(start..end, "");
    }
    cleaned.trim().to_string()
}

/// One-line operator summary for a denied call, pulled back out of the
/// framed JSON.
fn denied_summary(frame: &str) -> Option<String> {
    let json_line = frame.lines().nth(1)?;
    let v: serde_json::Value = serde_json::from_str(json_line).ok()?;
    if v["ok"].as_bool() == Some(false) {
        let kind = v["error_kind"].as_str().unwrap_or("error");
        let detail = v["detail"].as_str().unwrap_or("");
        Some(format!("{kind}: {detail}"))
    } else {
        None
    }
}
