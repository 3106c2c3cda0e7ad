use chrono::Utc;
use clap::Parser;
use dirs::home_dir;
use serde::de::{self, MapAccess, Visitor};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

const DEFAULT_CONFIG_YAML: &str = include_str!("../config/default.yaml");
const TOOL_NAME: &str = "reins";
const DEFAULT_PROGRAM: &str = "litellm";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 4000;
const SECRET_REF_PREFIX: &str = "env:";
const LAUNCHD_LABEL: &str = "com.reins.proxy";
const SYSTEMD_UNIT: &str = "reins.service";
const ENV_PASSTHROUGH: &[&str] = &["PATH", "HOME"];

#[derive(Parser, Debug)]
#[command(name = "reins", version, about = "Profile-driven launcher for a local LLM proxy")]
struct Cli {
    #[arg(long)]
    profile: Option<String>,
    #[arg(long, conflicts_with_all = ["install_service", "uninstall_service", "restart_service"])]
    host: Option<String>,
    #[arg(long, conflicts_with_all = ["install_service", "uninstall_service", "restart_service"])]
    port: Option<u16>,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    json: bool,
    #[arg(long, group = "action")]
    init: bool,
    #[arg(long, group = "action")]
    config_dir: bool,
    #[arg(long, group = "action")]
    list_profiles: bool,
    #[arg(long, group = "action")]
    get_default: bool,
    #[arg(long, group = "action", value_name = "PROFILE")]
    set_default: Option<String>,
    #[arg(long, group = "action")]
    install_service: bool,
    #[arg(long, group = "action")]
    uninstall_service: bool,
    #[arg(long, group = "action")]
    restart_service: bool,
    #[arg(last = true, conflicts_with = "action")]
    extra_args: Vec<String>,
}

#[derive(Debug, Error)]
enum ReinsError {
    #[error("config not found at {0}; run 'reins --init' to create a starter config")]
    ConfigNotFound(String),
    #[error("invalid config {path}: {message}")]
    ConfigMalformed { path: String, message: String },
    #[error("{0}")]
    ProfileNotFound(String),
    #[error("{0}")]
    ProfileConfigMissing(String),
    #[error("cannot resolve env.{entry}: environment variable '{variable}' is not set")]
    SecretUnresolved { entry: String, variable: String },
    #[error("service manager unavailable: {0}")]
    ServiceManagerUnavailable(String),
    #[error("service is not installed; run 'reins --install-service' first")]
    ServiceNotInstalled,
    #[error("service {step} failed: {message}")]
    ServiceOperationFailed { step: String, message: String },
    #[error("failed to launch '{program}': {message}")]
    LaunchFailed { program: String, message: String },
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ReinsError {
    // Exit codes are part of the scripting interface. Keep them stable.
    fn exit_code(&self) -> i32 {
        match self {
            Self::ConfigNotFound(_) => 10,
            Self::ConfigMalformed { .. } => 11,
            Self::ProfileNotFound(_) => 12,
            Self::ProfileConfigMissing(_) => 13,
            Self::SecretUnresolved { .. } => 14,
            Self::ServiceManagerUnavailable(_) => 20,
            Self::ServiceNotInstalled => 21,
            Self::ServiceOperationFailed { .. } => 22,
            Self::LaunchFailed { .. } => 23,
            Self::PermissionDenied(_) => 24,
            Self::Io(_) | Self::Json(_) => 1,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default, deny_unknown_fields)]
struct Catalog {
    default_profile: Option<String>,
    program: String,
    profiles: BTreeMap<String, Profile>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self {
            default_profile: None,
            program: DEFAULT_PROGRAM.to_string(),
            profiles: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default, deny_unknown_fields)]
struct Profile {
    description: String,
    config: String,
    host: String,
    port: u16,
    #[serde(deserialize_with = "deserialize_env_entries")]
    env: Vec<EnvEntry>,
    args: Vec<String>,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            description: String::new(),
            config: String::new(),
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            env: Vec::new(),
            args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct EnvEntry {
    name: String,
    value: EnvValue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum EnvValue {
    Literal(String),
    Secret(String),
}

// Profile env is kept as a list of entries, not a map: declaration order
// decides override order when the composed environment is built.
fn deserialize_env_entries<'de, D>(deserializer: D) -> Result<Vec<EnvEntry>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    struct EnvEntriesVisitor;

    impl<'de> Visitor<'de> for EnvEntriesVisitor {
        type Value = Vec<EnvEntry>;

        fn expecting(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            formatter.write_str("a mapping of environment variable names to scalar values")
        }

        fn visit_map<A>(self, mut access: A) -> Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut entries = Vec::new();
            while let Some((name, value)) = access.next_entry::<String, serde_yaml::Value>()? {
                let entry = env_entry_from_scalar(name, value).map_err(de::Error::custom)?;
                entries.push(entry);
            }
            Ok(entries)
        }
    }

    deserializer.deserialize_map(EnvEntriesVisitor)
}

fn env_entry_from_scalar(name: String, value: serde_yaml::Value) -> Result<EnvEntry, String> {
    if !is_valid_env_name(&name) {
        return Err(format!("invalid environment variable name '{name}'"));
    }
    let raw = match value {
        serde_yaml::Value::String(text) => text,
        serde_yaml::Value::Number(number) => number.to_string(),
        serde_yaml::Value::Bool(flag) => flag.to_string(),
        _ => return Err(format!("env.{name} must be a scalar value")),
    };
    if let Some(reference) = raw.strip_prefix(SECRET_REF_PREFIX) {
        if !is_valid_env_name(reference) {
            return Err(format!(
                "env.{name} references an invalid environment variable name '{reference}'"
            ));
        }
        return Ok(EnvEntry {
            name,
            value: EnvValue::Secret(reference.to_string()),
        });
    }
    Ok(EnvEntry {
        name,
        value: EnvValue::Literal(raw),
    })
}

fn is_valid_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

#[derive(Debug, Clone)]
struct Context {
    config_path: PathBuf,
    paths: HostPaths,
    json: bool,
}

#[derive(Debug, Clone)]
struct HostPaths {
    config_dir: PathBuf,
    log_dir: PathBuf,
    descriptor_dir: PathBuf,
}

fn main() {
    let cli = Cli::parse();
    let json = cli.json;
    let result = build_context(&cli).and_then(|ctx| dispatch(&cli, &ctx));
    let code = match result {
        Ok(code) => code,
        Err(err) => {
            report_error(&err, json);
            err.exit_code()
        }
    };
    std::process::exit(code);
}

fn report_error(err: &ReinsError, json: bool) {
    if json {
        let wrapper: JsonResult<serde_json::Value> = JsonResult {
            ok: false,
            result: None,
            error: Some(err.to_string()),
        };
        if let Ok(text) = serde_json::to_string_pretty(&wrapper) {
            println!("{text}");
        }
        return;
    }
    eprintln!("error: {err}");
}

fn dispatch(cli: &Cli, ctx: &Context) -> Result<i32, ReinsError> {
    let runner = RealCommandRunner;
    if cli.init {
        handle_init(ctx)?;
        return Ok(0);
    }
    if cli.config_dir {
        handle_config_dir(ctx)?;
        return Ok(0);
    }
    if cli.list_profiles {
        handle_list_profiles(ctx)?;
        return Ok(0);
    }
    if cli.get_default {
        handle_get_default(ctx)?;
        return Ok(0);
    }
    if let Some(name) = &cli.set_default {
        handle_set_default(ctx, name)?;
        return Ok(0);
    }
    if cli.install_service {
        handle_install_service(ctx, &runner, cli.profile.as_deref())?;
        return Ok(0);
    }
    if cli.uninstall_service {
        handle_uninstall_service(ctx, &runner)?;
        return Ok(0);
    }
    if cli.restart_service {
        handle_restart_service(ctx, &runner)?;
        return Ok(0);
    }
    handle_foreground(ctx, cli)
}

fn build_context(cli: &Cli) -> Result<Context, ReinsError> {
    let config_path = resolve_config_path(cli.config.as_ref());
    let home = required_home_dir()?;
    let config_dir = config_dir_from_path(&config_path);
    let paths = host_paths_for_os(env::consts::OS, &home, config_dir)?;
    Ok(Context {
        config_path,
        paths,
        json: cli.json,
    })
}

fn resolve_config_path(override_path: Option<&PathBuf>) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    if let Ok(path) = env::var("REINS_CONFIG") {
        return PathBuf::from(expand_path(&path));
    }
    let mut base = default_config_dir();
    base.push("config.yaml");
    base
}

fn default_config_dir() -> PathBuf {
    if let Ok(path) = env::var("REINS_CONFIG_DIR") {
        return PathBuf::from(expand_path(&path));
    }
    let mut base = home_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push(".config");
    base.push(TOOL_NAME);
    base
}

fn config_dir_from_path(config_path: &Path) -> PathBuf {
    config_path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map_or_else(default_config_dir, Path::to_path_buf)
}

fn required_home_dir() -> Result<PathBuf, ReinsError> {
    home_dir().ok_or_else(|| {
        ReinsError::Io(io::Error::new(
            io::ErrorKind::NotFound,
            "unable to resolve the home directory; set HOME to an existing directory",
        ))
    })
}

fn host_paths_for_os(os: &str, home: &Path, config_dir: PathBuf) -> Result<HostPaths, ReinsError> {
    match os {
        "macos" => Ok(HostPaths {
            config_dir,
            log_dir: home.join("Library/Logs").join(TOOL_NAME),
            descriptor_dir: home.join("Library/LaunchAgents"),
        }),
        "linux" => Ok(HostPaths {
            config_dir,
            log_dir: home.join(".local/state").join(TOOL_NAME),
            descriptor_dir: home.join(".config/systemd/user"),
        }),
        other => Err(ReinsError::ServiceManagerUnavailable(format!(
            "unsupported host operating system '{other}'; supported: macos, linux"
        ))),
    }
}

fn expand_path(input: &str) -> String {
    if let Some(stripped) = input.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(stripped).to_string_lossy().to_string();
        }
    }
    input.to_string()
}

fn read_catalog(path: &Path) -> Result<Catalog, ReinsError> {
    if !path.exists() {
        return Err(ReinsError::ConfigNotFound(path.display().to_string()));
    }
    let content = fs::read_to_string(path).map_err(|err| fs_error("read", path, err))?;
    read_catalog_from_str(&content, path)
}

fn read_catalog_from_str(content: &str, path: &Path) -> Result<Catalog, ReinsError> {
    serde_yaml::from_str(content).map_err(|err| ReinsError::ConfigMalformed {
        path: path.display().to_string(),
        message: err.to_string(),
    })
}

fn resolve_profile<'a>(
    catalog: &'a Catalog,
    requested: Option<&str>,
) -> Result<(String, &'a Profile), ReinsError> {
    let name = match requested.or(catalog.default_profile.as_deref()) {
        Some(name) => name.to_string(),
        None => {
            return Err(ReinsError::ProfileNotFound(
                "no profile selected: pass --profile or set default_profile in the config"
                    .to_string(),
            ))
        }
    };
    match catalog.profiles.get(&name) {
        Some(profile) => Ok((name, profile)),
        None => Err(ReinsError::ProfileNotFound(format!(
            "unknown profile '{name}'; available profiles: {}",
            available_profiles(catalog)
        ))),
    }
}

fn available_profiles(catalog: &Catalog) -> String {
    if catalog.profiles.is_empty() {
        return "(none)".to_string();
    }
    catalog
        .profiles
        .keys()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

fn validate_profile(name: &str, profile: &Profile) -> Result<(), ReinsError> {
    if profile.config.trim().is_empty() {
        return Err(ReinsError::ProfileConfigMissing(format!(
            "profiles.{name}.config must be non-empty"
        )));
    }
    if profile.host.trim().is_empty() {
        return Err(ReinsError::ProfileConfigMissing(format!(
            "profiles.{name}.host must be non-empty"
        )));
    }
    if profile.port == 0 {
        return Err(ReinsError::ProfileConfigMissing(format!(
            "profiles.{name}.port must be greater than 0"
        )));
    }
    Ok(())
}

fn resolve_proxy_config(
    name: &str,
    profile: &Profile,
    config_dir: &Path,
) -> Result<PathBuf, ReinsError> {
    let expanded = PathBuf::from(expand_path(&profile.config));
    let resolved = if expanded.is_absolute() {
        expanded
    } else {
        config_dir.join(expanded)
    };
    if !resolved.exists() {
        return Err(ReinsError::ProfileConfigMissing(format!(
            "profiles.{name}.config: proxy config file not found at {}",
            resolved.display()
        )));
    }
    if let Err(err) = fs::File::open(&resolved) {
        return Err(ReinsError::ProfileConfigMissing(format!(
            "profiles.{name}.config: proxy config file at {} is not readable: {err}",
            resolved.display()
        )));
    }
    Ok(resolved)
}

fn compose_environment(
    profile: &Profile,
    ambient: &BTreeMap<String, String>,
) -> Result<BTreeMap<String, String>, ReinsError> {
    let mut environment = BTreeMap::new();
    for key in ENV_PASSTHROUGH {
        if let Some(value) = ambient.get(*key) {
            environment.insert((*key).to_string(), value.clone());
        }
    }
    for entry in &profile.env {
        let value = match &entry.value {
            EnvValue::Literal(value) => value.clone(),
            EnvValue::Secret(variable) => {
                ambient
                    .get(variable)
                    .cloned()
                    .ok_or_else(|| ReinsError::SecretUnresolved {
                        entry: entry.name.clone(),
                        variable: variable.clone(),
                    })?
            }
        };
        environment.insert(entry.name.clone(), value);
    }
    Ok(environment)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ServiceDescriptor {
    program_arguments: Vec<String>,
    working_dir: PathBuf,
    stdout_log: PathBuf,
    stderr_log: PathBuf,
    env: Vec<(String, String)>,
}

// The service runs the tool itself, which re-reads the catalog and resolves
// secret references at startup. Only literal entries land in the descriptor.
fn build_descriptor(
    profile_name: &str,
    profile: &Profile,
    tool_exe: &Path,
    catalog_path: &Path,
    paths: &HostPaths,
) -> ServiceDescriptor {
    let mut env = Vec::new();
    for entry in &profile.env {
        if let EnvValue::Literal(value) = &entry.value {
            env.push((entry.name.clone(), value.clone()));
        }
    }
    let working_dir = catalog_path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .map_or_else(|| paths.config_dir.clone(), Path::to_path_buf);
    ServiceDescriptor {
        program_arguments: vec![
            tool_exe.display().to_string(),
            "--config".to_string(),
            catalog_path.display().to_string(),
            "--profile".to_string(),
            profile_name.to_string(),
        ],
        working_dir,
        stdout_log: paths.log_dir.join(format!("{TOOL_NAME}.out.log")),
        stderr_log: paths.log_dir.join(format!("{TOOL_NAME}.err.log")),
        env,
    }
}

fn render_launchd_plist(descriptor: &ServiceDescriptor) -> String {
    let mut plist = String::new();
    plist.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    plist.push_str(
        "<!DOCTYPE plist PUBLIC \"-//Apple//DTD PLIST 1.0//EN\" \"http://www.apple.com/DTDs/PropertyList-1.0.dtd\">\n",
    );
    plist.push_str("<plist version=\"1.0\">\n<dict>\n");
    plist.push_str("    <key>Label</key>\n");
    plist.push_str(&format!(
        "    <string>{}</string>\n",
        xml_escape(LAUNCHD_LABEL)
    ));
    plist.push_str("    <key>ProgramArguments</key>\n    <array>\n");
    for argument in &descriptor.program_arguments {
        plist.push_str(&format!(
            "        <string>{}</string>\n",
            xml_escape(argument)
        ));
    }
    plist.push_str("    </array>\n");
    if !descriptor.env.is_empty() {
        plist.push_str("    <key>EnvironmentVariables</key>\n    <dict>\n");
        for (name, value) in &descriptor.env {
            plist.push_str(&format!("        <key>{}</key>\n", xml_escape(name)));
            plist.push_str(&format!("        <string>{}</string>\n", xml_escape(value)));
        }
        plist.push_str("    </dict>\n");
    }
    plist.push_str("    <key>WorkingDirectory</key>\n");
    plist.push_str(&format!(
        "    <string>{}</string>\n",
        xml_escape(&descriptor.working_dir.display().to_string())
    ));
    plist.push_str("    <key>RunAtLoad</key>\n    <true/>\n");
    plist.push_str("    <key>KeepAlive</key>\n    <true/>\n");
    plist.push_str("    <key>StandardOutPath</key>\n");
    plist.push_str(&format!(
        "    <string>{}</string>\n",
        xml_escape(&descriptor.stdout_log.display().to_string())
    ));
    plist.push_str("    <key>StandardErrorPath</key>\n");
    plist.push_str(&format!(
        "    <string>{}</string>\n",
        xml_escape(&descriptor.stderr_log.display().to_string())
    ));
    plist.push_str("    <key>ProcessType</key>\n    <string>Background</string>\n");
    plist.push_str("</dict>\n</plist>\n");
    plist
}

fn xml_escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

fn render_systemd_unit(descriptor: &ServiceDescriptor) -> String {
    let mut unit = String::new();
    unit.push_str("# Managed by reins; rewritten on every --install-service.\n\n");
    unit.push_str("[Unit]\n");
    unit.push_str("Description=reins managed proxy\n");
    unit.push_str("After=network-online.target\n\n");
    unit.push_str("[Service]\n");
    unit.push_str("Type=simple\n");
    unit.push_str(&format!(
        "ExecStart={}\n",
        systemd_exec_start(&descriptor.program_arguments)
    ));
    unit.push_str(&format!(
        "WorkingDirectory={}\n",
        descriptor.working_dir.display()
    ));
    for (name, value) in &descriptor.env {
        unit.push_str(&format!(
            "Environment={}\n",
            systemd_quote(&format!("{name}={value}"))
        ));
    }
    unit.push_str(&format!(
        "StandardOutput=append:{}\n",
        descriptor.stdout_log.display()
    ));
    unit.push_str(&format!(
        "StandardError=append:{}\n",
        descriptor.stderr_log.display()
    ));
    unit.push_str("Restart=on-failure\nRestartSec=5\n\n");
    unit.push_str("[Install]\nWantedBy=default.target\n");
    unit
}

fn systemd_quote(value: &str) -> String {
    let mut quoted = String::from("\"");
    for ch in value.chars() {
        match ch {
            '"' => quoted.push_str("\\\""),
            '\\' => quoted.push_str("\\\\"),
            _ => quoted.push(ch),
        }
    }
    quoted.push('"');
    quoted
}

fn systemd_exec_start(arguments: &[String]) -> String {
    arguments
        .iter()
        .map(|argument| systemd_quote(argument))
        .collect::<Vec<_>>()
        .join(" ")
}

trait CommandRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, io::Error>;
}

#[derive(Debug, Clone)]
struct CommandOutput {
    status_code: i32,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl CommandOutput {
    fn success(&self) -> bool {
        self.status_code == 0
    }
}

struct RealCommandRunner;

impl CommandRunner for RealCommandRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, io::Error> {
        let output = Command::new(program).args(args).output()?;
        let status_code = output
            .status
            .code()
            .unwrap_or(if output.status.success() { 0 } else { 1 });
        Ok(CommandOutput {
            status_code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

fn run_manager_step<R: CommandRunner>(
    runner: &R,
    program: &str,
    args: &[String],
    step: &str,
) -> Result<CommandOutput, ReinsError> {
    runner.run(program, args).map_err(|err| match err.kind() {
        io::ErrorKind::NotFound => {
            ReinsError::ServiceManagerUnavailable(format!("'{program}' was not found on PATH"))
        }
        io::ErrorKind::PermissionDenied => {
            ReinsError::PermissionDenied(format!("running {program}"))
        }
        _ => ReinsError::ServiceOperationFailed {
            step: step.to_string(),
            message: err.to_string(),
        },
    })
}

fn run_manager_step_checked<R: CommandRunner>(
    runner: &R,
    program: &str,
    args: &[String],
    step: &str,
) -> Result<(), ReinsError> {
    let output = run_manager_step(runner, program, args, step)?;
    if !output.success() {
        return Err(ReinsError::ServiceOperationFailed {
            step: step.to_string(),
            message: stderr_snippet(&output),
        });
    }
    Ok(())
}

fn stderr_snippet(output: &CommandOutput) -> String {
    let text = String::from_utf8_lossy(&output.stderr);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        format!("exit status {}", output.status_code)
    } else {
        trimmed.to_string()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServiceState {
    Absent,
    // Stopped and Running both mean the descriptor is registered.
    Stopped,
    Running,
}

trait ServiceManager {
    fn descriptor_path(&self) -> &Path;
    fn render(&self, descriptor: &ServiceDescriptor) -> String;
    fn query_state(&self) -> Result<ServiceState, ReinsError>;
    fn register(&self) -> Result<(), ReinsError>;
    fn unregister(&self) -> Result<(), ReinsError>;
    fn force_start(&self) -> Result<(), ReinsError>;
}

fn platform_service_manager<'a, R: CommandRunner>(
    runner: &'a R,
    paths: &HostPaths,
) -> Result<Box<dyn ServiceManager + 'a>, ReinsError> {
    match env::consts::OS {
        "macos" => {
            which::which("launchctl").map_err(|_| {
                ReinsError::ServiceManagerUnavailable("'launchctl' was not found on PATH".to_string())
            })?;
            Ok(Box::new(LaunchdManager {
                runner,
                uid: current_uid(),
                plist_path: paths
                    .descriptor_dir
                    .join(format!("{LAUNCHD_LABEL}.plist")),
            }))
        }
        "linux" => {
            which::which("systemctl").map_err(|_| {
                ReinsError::ServiceManagerUnavailable("'systemctl' was not found on PATH".to_string())
            })?;
            Ok(Box::new(SystemdManager {
                runner,
                unit_path: paths.descriptor_dir.join(SYSTEMD_UNIT),
            }))
        }
        other => Err(ReinsError::ServiceManagerUnavailable(format!(
            "unsupported host operating system '{other}'; supported: macos, linux"
        ))),
    }
}

struct LaunchdManager<'a, R: CommandRunner> {
    runner: &'a R,
    uid: u32,
    plist_path: PathBuf,
}

impl<'a, R: CommandRunner> LaunchdManager<'a, R> {
    fn domain_target(&self) -> String {
        format!("gui/{}", self.uid)
    }

    fn service_target(&self) -> String {
        format!("gui/{}/{}", self.uid, LAUNCHD_LABEL)
    }
}

impl<'a, R: CommandRunner> ServiceManager for LaunchdManager<'a, R> {
    fn descriptor_path(&self) -> &Path {
        &self.plist_path
    }

    fn render(&self, descriptor: &ServiceDescriptor) -> String {
        render_launchd_plist(descriptor)
    }

    fn query_state(&self) -> Result<ServiceState, ReinsError> {
        let args = vec!["print".to_string(), self.service_target()];
        let output = run_manager_step(self.runner, "launchctl", &args, "query")?;
        if !output.success() {
            return Ok(ServiceState::Absent);
        }
        Ok(parse_launchd_state(&String::from_utf8_lossy(&output.stdout)))
    }

    fn register(&self) -> Result<(), ReinsError> {
        let bootstrap = vec![
            "bootstrap".to_string(),
            self.domain_target(),
            self.plist_path.display().to_string(),
        ];
        run_manager_step_checked(self.runner, "launchctl", &bootstrap, "bootstrap")?;
        let enable = vec!["enable".to_string(), self.service_target()];
        run_manager_step_checked(self.runner, "launchctl", &enable, "enable")
    }

    fn unregister(&self) -> Result<(), ReinsError> {
        let bootout = vec!["bootout".to_string(), self.service_target()];
        run_manager_step_checked(self.runner, "launchctl", &bootout, "bootout")?;
        remove_file_if_exists(&self.plist_path)
    }

    fn force_start(&self) -> Result<(), ReinsError> {
        let kickstart = vec![
            "kickstart".to_string(),
            "-k".to_string(),
            self.service_target(),
        ];
        run_manager_step_checked(self.runner, "launchctl", &kickstart, "kickstart")
    }
}

// Match whole lines: a stopped service prints `state = not running`, which
// contains the running substring.
fn parse_launchd_state(report: &str) -> ServiceState {
    for line in report.lines() {
        let trimmed = line.trim();
        if trimmed == "state = running" || trimmed.starts_with("pid = ") {
            return ServiceState::Running;
        }
    }
    ServiceState::Stopped
}

struct SystemdManager<'a, R: CommandRunner> {
    runner: &'a R,
    unit_path: PathBuf,
}

impl<'a, R: CommandRunner> ServiceManager for SystemdManager<'a, R> {
    fn descriptor_path(&self) -> &Path {
        &self.unit_path
    }

    fn render(&self, descriptor: &ServiceDescriptor) -> String {
        render_systemd_unit(descriptor)
    }

    fn query_state(&self) -> Result<ServiceState, ReinsError> {
        let args = systemctl_args(&["show", SYSTEMD_UNIT, "--property=LoadState,ActiveState"]);
        let output = run_manager_step(self.runner, "systemctl", &args, "query")?;
        if !output.success() {
            return Err(ReinsError::ServiceManagerUnavailable(format!(
                "systemd user manager is not reachable: {}",
                stderr_snippet(&output)
            )));
        }
        Ok(parse_systemd_state(&String::from_utf8_lossy(&output.stdout)))
    }

    fn register(&self) -> Result<(), ReinsError> {
        run_manager_step_checked(
            self.runner,
            "systemctl",
            &systemctl_args(&["daemon-reload"]),
            "daemon-reload",
        )?;
        run_manager_step_checked(
            self.runner,
            "systemctl",
            &systemctl_args(&["enable", SYSTEMD_UNIT]),
            "enable",
        )
    }

    fn unregister(&self) -> Result<(), ReinsError> {
        run_manager_step_checked(
            self.runner,
            "systemctl",
            &systemctl_args(&["stop", SYSTEMD_UNIT]),
            "stop",
        )?;
        run_manager_step_checked(
            self.runner,
            "systemctl",
            &systemctl_args(&["disable", SYSTEMD_UNIT]),
            "disable",
        )?;
        remove_file_if_exists(&self.unit_path)?;
        run_manager_step_checked(
            self.runner,
            "systemctl",
            &systemctl_args(&["daemon-reload"]),
            "daemon-reload",
        )
    }

    fn force_start(&self) -> Result<(), ReinsError> {
        run_manager_step_checked(
            self.runner,
            "systemctl",
            &systemctl_args(&["restart", SYSTEMD_UNIT]),
            "restart",
        )
    }
}

fn systemctl_args(tail: &[&str]) -> Vec<String> {
    let mut args = vec!["--user".to_string()];
    args.extend(tail.iter().map(|arg| (*arg).to_string()));
    args
}

fn parse_systemd_state(report: &str) -> ServiceState {
    let mut load_state = "";
    let mut active_state = "";
    for line in report.lines() {
        let trimmed = line.trim();
        if let Some(value) = trimmed.strip_prefix("LoadState=") {
            load_state = value;
        } else if let Some(value) = trimmed.strip_prefix("ActiveState=") {
            active_state = value;
        }
    }
    if load_state == "not-found" {
        return ServiceState::Absent;
    }
    if matches!(active_state, "active" | "activating" | "reloading") {
        return ServiceState::Running;
    }
    ServiceState::Stopped
}

#[derive(Debug, Clone, Copy)]
struct StartWait {
    attempts: u32,
    delay: Duration,
}

const DEFAULT_START_WAIT: StartWait = StartWait {
    attempts: 20,
    delay: Duration::from_millis(250),
};

const TEARDOWN_WAIT: StartWait = StartWait {
    attempts: 10,
    delay: Duration::from_millis(200),
};

fn install_service(
    manager: &dyn ServiceManager,
    descriptor: &ServiceDescriptor,
    wait: StartWait,
) -> Result<(), ReinsError> {
    if manager.query_state()? != ServiceState::Absent {
        manager.unregister()?;
        wait_for_state(manager, ServiceState::Absent, TEARDOWN_WAIT, "teardown")?;
    }
    let descriptor_path = manager.descriptor_path().to_path_buf();
    ensure_parent(&descriptor.stdout_log)?;
    ensure_parent(&descriptor_path)?;
    write_atomic_text_file(&descriptor_path, &manager.render(descriptor), Some(0o644))?;
    manager.register()?;
    manager.force_start()?;
    wait_for_state(manager, ServiceState::Running, wait, "start confirmation")
}

fn restart_service(manager: &dyn ServiceManager, wait: StartWait) -> Result<(), ReinsError> {
    if manager.query_state()? == ServiceState::Absent {
        return Err(ReinsError::ServiceNotInstalled);
    }
    manager.force_start()?;
    wait_for_state(manager, ServiceState::Running, wait, "start confirmation")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UninstallOutcome {
    Removed,
    RemovedStaleDescriptor,
    NothingInstalled,
}

fn uninstall_service(manager: &dyn ServiceManager) -> Result<UninstallOutcome, ReinsError> {
    let descriptor_path = manager.descriptor_path().to_path_buf();
    if manager.query_state()? == ServiceState::Absent {
        if descriptor_path.exists() {
            remove_file_if_exists(&descriptor_path)?;
            return Ok(UninstallOutcome::RemovedStaleDescriptor);
        }
        return Ok(UninstallOutcome::NothingInstalled);
    }
    manager.unregister()?;
    Ok(UninstallOutcome::Removed)
}

fn wait_for_state(
    manager: &dyn ServiceManager,
    wanted: ServiceState,
    wait: StartWait,
    step: &str,
) -> Result<(), ReinsError> {
    for attempt in 0..wait.attempts {
        if manager.query_state()? == wanted {
            return Ok(());
        }
        if attempt + 1 < wait.attempts {
            thread::sleep(wait.delay);
        }
    }
    Err(ReinsError::ServiceOperationFailed {
        step: step.to_string(),
        message: format!(
            "service did not reach the expected state within {} checks",
            wait.attempts
        ),
    })
}

fn resolve_program(program: &str) -> Result<PathBuf, ReinsError> {
    which::which(program).map_err(|_| ReinsError::LaunchFailed {
        program: program.to_string(),
        message: "executable not found on PATH".to_string(),
    })
}

fn build_launch_args(
    proxy_config: &Path,
    host: &str,
    port: u16,
    profile_args: &[String],
    extra_args: &[String],
) -> Vec<String> {
    let mut args = vec![
        "--config".to_string(),
        proxy_config.display().to_string(),
        "--host".to_string(),
        host.to_string(),
        "--port".to_string(),
        port.to_string(),
    ];
    args.extend(profile_args.iter().cloned());
    args.extend(extra_args.iter().cloned());
    args
}

fn run_foreground(
    program: &Path,
    args: &[String],
    environment: &BTreeMap<String, String>,
) -> Result<i32, ReinsError> {
    let mut cmd = Command::new(program);
    cmd.args(args).env_clear().envs(environment);
    let status = cmd.status().map_err(|err| ReinsError::LaunchFailed {
        program: program.display().to_string(),
        message: err.to_string(),
    })?;
    Ok(exit_code_from_status(status))
}

fn exit_code_from_status(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    if status.success() {
        0
    } else {
        1
    }
}

fn handle_init(ctx: &Context) -> Result<(), ReinsError> {
    if ctx.config_path.exists() {
        if ctx.json {
            return output(ctx, json!({ "path": ctx.config_path, "created": false }));
        }
        println!("config already exists at {}", ctx.config_path.display());
        return Ok(());
    }
    ensure_parent(&ctx.config_path)?;
    fs::write(&ctx.config_path, DEFAULT_CONFIG_YAML)
        .map_err(|err| fs_error("write", &ctx.config_path, err))?;
    if ctx.json {
        return output(ctx, json!({ "path": ctx.config_path, "created": true }));
    }
    println!("wrote starter config to {}", ctx.config_path.display());
    Ok(())
}

fn handle_config_dir(ctx: &Context) -> Result<(), ReinsError> {
    if ctx.json {
        return output(ctx, json!({ "config_dir": ctx.paths.config_dir }));
    }
    println!("{}", ctx.paths.config_dir.display());
    Ok(())
}

fn handle_list_profiles(ctx: &Context) -> Result<(), ReinsError> {
    let catalog = read_catalog(&ctx.config_path)?;
    if ctx.json {
        let profiles: Vec<serde_json::Value> = catalog
            .profiles
            .iter()
            .map(|(name, profile)| {
                json!({
                    "name": name,
                    "description": profile.description,
                    "host": profile.host,
                    "port": profile.port,
                    "default": catalog.default_profile.as_deref() == Some(name.as_str()),
                })
            })
            .collect();
        return output(ctx, json!({ "profiles": profiles }));
    }
    if catalog.profiles.is_empty() {
        println!("no profiles configured in {}", ctx.config_path.display());
        return Ok(());
    }
    println!("available profiles:");
    for (name, profile) in &catalog.profiles {
        let marker = if catalog.default_profile.as_deref() == Some(name.as_str()) {
            "*"
        } else {
            " "
        };
        if profile.description.is_empty() {
            println!("{marker} {name} ({}:{})", profile.host, profile.port);
        } else {
            println!(
                "{marker} {name} - {} ({}:{})",
                profile.description, profile.host, profile.port
            );
        }
    }
    Ok(())
}

fn handle_get_default(ctx: &Context) -> Result<(), ReinsError> {
    let catalog = read_catalog(&ctx.config_path)?;
    if ctx.json {
        return output(ctx, json!({ "default_profile": catalog.default_profile }));
    }
    match catalog.default_profile {
        Some(name) => println!("{name}"),
        None => println!("no default profile configured"),
    }
    Ok(())
}

fn handle_set_default(ctx: &Context, name: &str) -> Result<(), ReinsError> {
    let catalog = read_catalog(&ctx.config_path)?;
    if !catalog.profiles.contains_key(name) {
        return Err(ReinsError::ProfileNotFound(format!(
            "unknown profile '{name}'; available profiles: {}",
            available_profiles(&catalog)
        )));
    }
    let content = fs::read_to_string(&ctx.config_path)
        .map_err(|err| fs_error("read", &ctx.config_path, err))?;
    let (patched, changed) =
        patch_default_profile(&content, name).map_err(|message| ReinsError::ConfigMalformed {
            path: ctx.config_path.display().to_string(),
            message,
        })?;
    if changed {
        write_atomic_text_file_preserving_mode(&ctx.config_path, &patched, 0o644)?;
    }
    if ctx.json {
        return output(ctx, json!({ "default_profile": name, "changed": changed }));
    }
    println!("default profile set to '{name}'");
    Ok(())
}

fn handle_install_service<R: CommandRunner>(
    ctx: &Context,
    runner: &R,
    requested: Option<&str>,
) -> Result<(), ReinsError> {
    let catalog = read_catalog(&ctx.config_path)?;
    let (name, profile) = resolve_profile(&catalog, requested)?;
    validate_profile(&name, profile)?;
    resolve_proxy_config(&name, profile, &ctx.paths.config_dir)?;
    let tool_exe = env::current_exe()?;
    let catalog_path = fs::canonicalize(&ctx.config_path)
        .map_err(|err| fs_error("resolve", &ctx.config_path, err))?;
    let descriptor = build_descriptor(&name, profile, &tool_exe, &catalog_path, &ctx.paths);
    let manager = platform_service_manager(runner, &ctx.paths)?;
    install_service(manager.as_ref(), &descriptor, DEFAULT_START_WAIT)?;
    log_operation(&ctx.paths, &format!("installed service, profile '{name}'"));
    if ctx.json {
        return output(
            ctx,
            json!({
                "installed": true,
                "profile": name,
                "descriptor": manager.descriptor_path(),
            }),
        );
    }
    println!("service installed and started (profile '{name}')");
    println!("descriptor: {}", manager.descriptor_path().display());
    println!("logs: {}", ctx.paths.log_dir.display());
    Ok(())
}

fn handle_uninstall_service<R: CommandRunner>(ctx: &Context, runner: &R) -> Result<(), ReinsError> {
    let manager = platform_service_manager(runner, &ctx.paths)?;
    let outcome = uninstall_service(manager.as_ref())?;
    if outcome != UninstallOutcome::NothingInstalled {
        log_operation(&ctx.paths, "uninstalled service");
    }
    if ctx.json {
        return output(
            ctx,
            json!({ "removed": outcome != UninstallOutcome::NothingInstalled }),
        );
    }
    match outcome {
        UninstallOutcome::Removed => println!("service removed"),
        UninstallOutcome::RemovedStaleDescriptor => {
            println!("service was not registered; removed leftover descriptor")
        }
        UninstallOutcome::NothingInstalled => println!("service is not installed; nothing to remove"),
    }
    Ok(())
}

fn handle_restart_service<R: CommandRunner>(ctx: &Context, runner: &R) -> Result<(), ReinsError> {
    let manager = platform_service_manager(runner, &ctx.paths)?;
    restart_service(manager.as_ref(), DEFAULT_START_WAIT)?;
    log_operation(&ctx.paths, "restarted service");
    if ctx.json {
        return output(ctx, json!({ "restarted": true }));
    }
    println!("service restarted");
    Ok(())
}

fn handle_foreground(ctx: &Context, cli: &Cli) -> Result<i32, ReinsError> {
    let catalog = read_catalog(&ctx.config_path)?;
    let (name, profile) = resolve_profile(&catalog, cli.profile.as_deref())?;
    let mut profile = profile.clone();
    if let Some(host) = &cli.host {
        profile.host = host.clone();
    }
    if let Some(port) = cli.port {
        profile.port = port;
    }
    validate_profile(&name, &profile)?;
    let proxy_config = resolve_proxy_config(&name, &profile, &ctx.paths.config_dir)?;
    // env::vars() panics on non-UTF-8 entries; they can never be allowlisted
    // or referenced from the catalog, so drop them instead of aborting.
    let ambient: BTreeMap<String, String> = env::vars_os()
        .filter_map(|(name, value)| Some((name.into_string().ok()?, value.into_string().ok()?)))
        .collect();
    let environment = compose_environment(&profile, &ambient)?;
    let program = resolve_program(&catalog.program)?;
    let args = build_launch_args(
        &proxy_config,
        &profile.host,
        profile.port,
        &profile.args,
        &cli.extra_args,
    );
    if !ctx.json {
        if profile.description.is_empty() {
            println!("[{TOOL_NAME}] profile: {name}");
        } else {
            println!("[{TOOL_NAME}] profile: {name} ({})", profile.description);
        }
        println!("[{TOOL_NAME}] proxy config: {}", proxy_config.display());
        println!(
            "[{TOOL_NAME}] starting {} on {}:{}",
            catalog.program, profile.host, profile.port
        );
    }
    log_operation(
        &ctx.paths,
        &format!(
            "foreground start, profile '{name}', bind {}:{}",
            profile.host, profile.port
        ),
    );
    run_foreground(&program, &args, &environment)
}

fn patch_default_profile(content: &str, name: &str) -> Result<(String, bool), String> {
    let had_trailing_newline = content.ends_with('\n');
    let mut lines: Vec<String> = content.lines().map(|line| line.to_string()).collect();
    for idx in 0..lines.len() {
        let line = lines[idx].clone();
        if is_blank_or_comment(&line) {
            continue;
        }
        let indent = leading_space_count(&line)?;
        if indent != 0 {
            continue;
        }
        if match_scalar_key_line(&line, "default_profile")?.is_none() {
            continue;
        }
        let (patched, changed) = replace_yaml_scalar_value_in_line(&line, "default_profile", name)?;
        lines[idx] = patched;
        return Ok((join_lines(&lines, had_trailing_newline), changed));
    }
    let insert_at = lines
        .iter()
        .position(|line| !is_blank_or_comment(line))
        .unwrap_or(lines.len());
    lines.insert(
        insert_at,
        format!("default_profile: {}", quote_yaml_scalar(name)),
    );
    Ok((join_lines(&lines, true), true))
}

fn join_lines(lines: &[String], trailing_newline: bool) -> String {
    let mut text = lines.join("\n");
    if trailing_newline {
        text.push('\n');
    }
    text
}

fn is_blank_or_comment(line: &str) -> bool {
    let trimmed = line.trim();
    trimmed.is_empty() || trimmed.starts_with('#')
}

fn leading_space_count(line: &str) -> Result<usize, String> {
    let mut count = 0usize;
    for ch in line.chars() {
        match ch {
            ' ' => count += 1,
            '\t' => return Err("tabs are not supported in config indentation".to_string()),
            _ => break,
        }
    }
    Ok(count)
}

fn match_scalar_key_line(line: &str, key: &str) -> Result<Option<usize>, String> {
    if is_blank_or_comment(line) {
        return Ok(None);
    }
    let indent = leading_space_count(line)?;
    let rest = &line[indent..];
    if !rest.starts_with(key) {
        return Ok(None);
    }
    let mut idx = key.len();
    while idx < rest.len() && rest.as_bytes()[idx].is_ascii_whitespace() {
        idx += 1;
    }
    if idx >= rest.len() || rest.as_bytes()[idx] != b':' {
        return Ok(None);
    }
    Ok(Some(indent))
}

fn is_yaml_indicator(ch: char) -> bool {
    matches!(
        ch,
        '#' | ':' | '{' | '}' | '[' | ']' | ',' | '&' | '*' | '!' | '|' | '>' | '\'' | '"' | '%'
            | '@' | '`'
    )
}

fn is_safe_plain_yaml_scalar(value: &str) -> bool {
    if value.is_empty() {
        return false;
    }
    if value.chars().any(|c| c == '\n' || c == '\r') {
        return false;
    }
    if value.trim() != value {
        return false;
    }
    if value.chars().next().map(is_yaml_indicator).unwrap_or(true) {
        return false;
    }
    if value.contains(": ") {
        return false;
    }
    if value.contains(" #") || value.contains("\t#") {
        return false;
    }
    true
}

fn quote_yaml_scalar(value: &str) -> String {
    if is_safe_plain_yaml_scalar(value) {
        return value.to_string();
    }
    force_double_quote(value)
}

fn force_double_quote(value: &str) -> String {
    let mut inner = String::new();
    for ch in value.chars() {
        match ch {
            '\\' => inner.push_str("\\\\"),
            '\"' => inner.push_str("\\\""),
            '\n' => inner.push_str("\\n"),
            '\r' => inner.push_str("\\r"),
            '\t' => inner.push_str("\\t"),
            _ => inner.push(ch),
        }
    }
    format!("\"{inner}\"")
}

fn format_yaml_scalar_preserving(existing_token: &str, new_value: &str) -> String {
    let token = existing_token.trim();
    if token.len() >= 2 && token.starts_with('\'') && token.ends_with('\'') {
        let inner = new_value.replace('\'', "''");
        return format!("'{inner}'");
    }
    if token.len() >= 2 && token.starts_with('\"') && token.ends_with('\"') {
        return force_double_quote(new_value);
    }
    quote_yaml_scalar(new_value)
}

fn replace_yaml_scalar_value_in_line(
    line: &str,
    key: &str,
    new_value: &str,
) -> Result<(String, bool), String> {
    let indent = leading_space_count(line)?;
    let rest = &line[indent..];
    if !rest.starts_with(key) {
        return Ok((line.to_string(), false));
    }
    let mut idx = key.len();
    while idx < rest.len() && rest.as_bytes()[idx].is_ascii_whitespace() {
        idx += 1;
    }
    if idx >= rest.len() || rest.as_bytes()[idx] != b':' {
        return Ok((line.to_string(), false));
    }
    let colon_idx = indent + idx;
    let mut value_start = colon_idx + 1;
    while value_start < line.len() && line.as_bytes()[value_start].is_ascii_whitespace() {
        value_start += 1;
    }
    if value_start >= line.len() {
        // Bare `key:` with no value: append one.
        let new_line = format!("{} {}", line.trim_end(), quote_yaml_scalar(new_value));
        return Ok((new_line, true));
    }

    // Find comment start outside quotes where '#' is preceded by whitespace.
    let mut in_single = false;
    let mut in_double = false;
    let mut i = value_start;
    let bytes = line.as_bytes();
    let mut comment_start: Option<usize> = None;
    while i < line.len() {
        let ch = bytes[i] as char;
        if in_double {
            if ch == '\\' {
                i = (i + 2).min(line.len());
                continue;
            }
            if ch == '\"' {
                in_double = false;
            }
            i += 1;
            continue;
        }
        if in_single {
            if ch == '\'' {
                if i + 1 < line.len() && bytes[i + 1] as char == '\'' {
                    i += 2;
                    continue;
                }
                in_single = false;
            }
            i += 1;
            continue;
        }
        match ch {
            '\'' => in_single = true,
            '"' => in_double = true,
            '#' => {
                if i == 0 || bytes[i.saturating_sub(1)].is_ascii_whitespace() {
                    comment_start = Some(i);
                    break;
                }
            }
            _ => {}
        }
        i += 1;
    }

    let (pre_comment, comment_part) = if let Some(cs) = comment_start {
        (&line[..cs], &line[cs..])
    } else {
        (line, "")
    };
    let value_with_ws = &pre_comment[value_start..];
    let value_trimmed = value_with_ws.trim_end_matches(|c: char| c.is_ascii_whitespace());
    let trailing_ws = &value_with_ws[value_trimmed.len()..];

    let formatted = format_yaml_scalar_preserving(value_trimmed, new_value);
    // A '#' only opens a comment after whitespace; keep one when the old
    // value was empty so the new scalar does not swallow the comment.
    let separator = if trailing_ws.is_empty() && !comment_part.is_empty() {
        " "
    } else {
        ""
    };
    let new_line = format!(
        "{}{}{}{}{}",
        &line[..value_start],
        formatted,
        trailing_ws,
        separator,
        comment_part
    );
    let changed = new_line != line;
    Ok((new_line, changed))
}

fn current_uid() -> u32 {
    #[cfg(unix)]
    {
        let output = Command::new("id").arg("-u").output();
        if let Ok(output) = output {
            if output.status.success() {
                let text = String::from_utf8_lossy(&output.stdout);
                if let Ok(value) = text.trim().parse::<u32>() {
                    return value;
                }
            }
        }
    }
    0
}

fn fs_error(action: &str, path: &Path, err: io::Error) -> ReinsError {
    if err.kind() == io::ErrorKind::PermissionDenied {
        return ReinsError::PermissionDenied(format!("cannot {action} {}", path.display()));
    }
    ReinsError::Io(err)
}

fn ensure_parent(path: &Path) -> Result<(), ReinsError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| fs_error("create", parent, err))?;
    }
    Ok(())
}

fn remove_file_if_exists(path: &Path) -> Result<(), ReinsError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(fs_error("remove", path, err)),
    }
}

fn write_atomic_text_file(path: &Path, content: &str, mode: Option<u32>) -> Result<(), ReinsError> {
    ensure_parent(path)?;
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let pid = std::process::id();
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let tmp_path = parent.join(format!(
        ".{}.tmp.{}.{}",
        path.file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| TOOL_NAME.to_string()),
        pid,
        ts
    ));

    fs::write(&tmp_path, content).map_err(|err| fs_error("write", &tmp_path, err))?;
    #[cfg(unix)]
    if let Some(mode) = mode {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp_path, fs::Permissions::from_mode(mode))?;
    }
    fs::rename(&tmp_path, path).map_err(|err| fs_error("write", path, err))?;
    Ok(())
}

fn write_atomic_text_file_preserving_mode(
    path: &Path,
    content: &str,
    default_mode: u32,
) -> Result<(), ReinsError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = fs::metadata(path)
            .map(|m| m.permissions().mode())
            .unwrap_or(default_mode);
        return write_atomic_text_file(path, content, Some(mode));
    }
    #[cfg(not(unix))]
    {
        let _ = default_mode;
        write_atomic_text_file(path, content, None)
    }
}

fn log_operation(paths: &HostPaths, message: &str) {
    let line = format!(
        "{} {}\n",
        Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
        message
    );
    let path = paths.log_dir.join(format!("{TOOL_NAME}.log"));
    let _ = fs::create_dir_all(&paths.log_dir);
    let _ = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .and_then(|mut file| file.write_all(line.as_bytes()));
}

fn output(ctx: &Context, payload: serde_json::Value) -> Result<(), ReinsError> {
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
        };
        print_json(&wrapper)?;
    } else {
        println!("{}", payload);
    }
    Ok(())
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), ReinsError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{}", text);
    Ok(())
}
