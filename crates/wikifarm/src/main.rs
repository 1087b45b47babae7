use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::rc::Rc;

use anyhow::{Context, Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing_subscriber::EnvFilter;
use wikifarm_core::backup::{
    create_backup, delete_snapshot, init_repository, list_snapshots, restore_backup,
};
use wikifarm_core::context::FarmContext;
use wikifarm_core::error::FarmError;
use wikifarm_core::lifecycle::{
    CreateInstallationRequest, create_installation, delete_installation, list_installations,
    restart_installation, set_dev_mode, start, stop,
};
use wikifarm_core::process::{CommandRunner, SystemRunner};
use wikifarm_core::registry::OrchestratorKind;
use wikifarm_core::routing::ConfigUpdateReport;
use wikifarm_core::runtime::{PathOverrides, ResolutionContext, RuntimePaths, resolve_paths};
use wikifarm_core::schedule::{list_schedules, remove_schedule, set_schedule};
use wikifarm_core::settings::{
    KNOWN_SETTINGS, SetOptions, get_setting, get_settings, set_settings, unset_settings,
};
use wikifarm_core::tenants::{AddWikiRequest, DEFAULT_ADMIN_USER, add_wiki, list_wikis, remove_wiki};

const LOG_ENV: &str = "WIKIFARM_LOG";

#[derive(Debug, Parser)]
#[command(
    name = "wikifarm",
    version,
    about = "Manage multi-tenant MediaWiki farms on docker compose or Kubernetes"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH", help = "Directory holding conf.json and config.toml")]
    config_dir: Option<PathBuf>,
    #[arg(long, global = true, value_name = "ID", help = "Installation to operate on (default: the one containing the working directory)")]
    id: Option<String>,
    #[arg(long, global = true, help = "Print results as JSON")]
    json: bool,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[arg(short, long, global = true, action = clap::ArgAction::Count, help = "Increase log verbosity (-v info, -vv debug)")]
    verbose: u8,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    config_dir: Option<PathBuf>,
    id: Option<String>,
    json: bool,
    diagnostics: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Self {
        Self {
            config_dir: cli.config_dir.clone(),
            id: cli.id.clone(),
            json: cli.json,
            diagnostics: cli.diagnostics,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "List registered installations")]
    List,
    #[command(about = "Create, start and register a new installation")]
    Create(CreateArgs),
    #[command(about = "Tear down an installation and deregister it")]
    Delete(DeleteArgs),
    #[command(about = "Regenerate routing config and start the installation")]
    Start,
    #[command(about = "Stop the installation")]
    Stop,
    #[command(about = "Regenerate routing config and restart the installation")]
    Restart(RestartArgs),
    #[command(about = "Toggle the compose development overlay")]
    Devmode(DevmodeArgs),
    #[command(about = "Add a wiki to the installation")]
    Add(AddArgs),
    #[command(about = "Remove a wiki and its data")]
    Remove(RemoveArgs),
    #[command(about = "Inspect the installation's wikis")]
    Wikis(WikisArgs),
    #[command(about = "Read and change installation settings")]
    Config(ConfigArgs),
    #[command(about = "Snapshot and restore the installation")]
    Backup(BackupArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OrchestratorArg {
    Compose,
    Kubernetes,
}

impl From<OrchestratorArg> for OrchestratorKind {
    fn from(value: OrchestratorArg) -> Self {
        match value {
            OrchestratorArg::Compose => OrchestratorKind::Compose,
            OrchestratorArg::Kubernetes => OrchestratorKind::Kubernetes,
        }
    }
}

#[derive(Debug, Args)]
struct CreateArgs {
    #[arg(value_name = "ID", help = "Installation id")]
    installation: String,
    #[arg(long, value_name = "PATH", help = "Directory to lay the installation out in")]
    path: PathBuf,
    #[arg(long, value_enum, default_value = "compose")]
    orchestrator: OrchestratorArg,
    #[arg(long, value_name = "NAME", help = "Manage a local kind cluster with this name")]
    cluster: Option<String>,
    #[arg(long = "from", value_name = "PATH", help = "Stack template directory to copy")]
    template_dir: Option<PathBuf>,
    #[arg(long, value_name = "ID", help = "Id of the first wiki")]
    wiki: String,
    #[arg(long, value_name = "URL", help = "URL of the first wiki (domain[:port][/path])")]
    url: String,
    #[arg(long, value_name = "NAME")]
    name: Option<String>,
    #[arg(long, value_name = "USER", default_value = DEFAULT_ADMIN_USER)]
    admin_user: String,
    #[arg(long, value_name = "PASSWORD", help = "Admin password (generated when omitted)")]
    admin_password: Option<String>,
    #[arg(long = "env", value_name = "KEY=VALUE", help = "Initial setting, repeatable")]
    env: Vec<String>,
}

#[derive(Debug, Args)]
struct DeleteArgs {
    #[arg(value_name = "ID", help = "Installation id")]
    installation: String,
    #[arg(long, help = "Also remove the installation directory")]
    remove_files: bool,
    #[arg(short = 'y', long, help = "Do not ask for confirmation")]
    yes: bool,
}

#[derive(Debug, Args)]
struct RestartArgs {
    #[arg(long, help = "Recreate the managed cluster before starting")]
    recreate_cluster: bool,
}

#[derive(Debug, Args)]
struct DevmodeArgs {
    #[arg(value_enum)]
    state: Toggle,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Toggle {
    On,
    Off,
}

#[derive(Debug, Args)]
struct AddArgs {
    #[arg(help = "Wiki id (also the database name)")]
    wiki: String,
    #[arg(help = "Wiki URL (domain[:port][/path])")]
    url: String,
    #[arg(long, value_name = "NAME")]
    name: Option<String>,
    #[arg(long, value_name = "FILE", help = "Import this SQL dump instead of running the installer")]
    dump: Option<PathBuf>,
    #[arg(long, value_name = "FILE", help = "Settings file to stage for the wiki")]
    settings: Option<PathBuf>,
    #[arg(long, value_name = "USER", default_value = DEFAULT_ADMIN_USER)]
    admin_user: String,
    #[arg(long, value_name = "PASSWORD", help = "Admin password (generated when omitted)")]
    admin_password: Option<String>,
}

#[derive(Debug, Args)]
struct RemoveArgs {
    #[arg(help = "Wiki id")]
    wiki: String,
    #[arg(short = 'y', long, help = "Do not ask for confirmation")]
    yes: bool,
}

#[derive(Debug, Args)]
struct WikisArgs {
    #[command(subcommand)]
    command: WikisSubcommand,
}

#[derive(Debug, Subcommand)]
enum WikisSubcommand {
    List,
}

#[derive(Debug, Args)]
struct ConfigArgs {
    #[command(subcommand)]
    command: ConfigSubcommand,
}

#[derive(Debug, Subcommand)]
enum ConfigSubcommand {
    #[command(about = "Print one setting, or all of them")]
    Get { key: Option<String> },
    #[command(about = "Set one or more settings and restart")]
    Set {
        #[arg(required = true, value_name = "KEY=VALUE")]
        pairs: Vec<String>,
        #[command(flatten)]
        options: ChangeOptions,
    },
    #[command(about = "Remove one or more settings and restart")]
    Unset {
        #[arg(required = true, value_name = "KEY")]
        keys: Vec<String>,
        #[command(flatten)]
        options: ChangeOptions,
    },
    #[command(about = "List settings with side effects")]
    Known,
}

#[derive(Debug, Args)]
struct ChangeOptions {
    #[arg(long, help = "Accept setting names that are not known")]
    force: bool,
    #[arg(long, help = "Write the settings without restarting")]
    skip_restart: bool,
}

impl From<&ChangeOptions> for SetOptions {
    fn from(value: &ChangeOptions) -> Self {
        Self {
            force: value.force,
            skip_restart: value.skip_restart,
        }
    }
}

#[derive(Debug, Args)]
struct BackupArgs {
    #[command(subcommand)]
    command: BackupSubcommand,
}

#[derive(Debug, Subcommand)]
enum BackupSubcommand {
    #[command(about = "Initialise the snapshot repository")]
    Init,
    #[command(about = "Stage files and databases and take a snapshot")]
    Create { label: String },
    #[command(about = "Restore a snapshot, taking a safety snapshot first")]
    Restore {
        snapshot: String,
        #[arg(long, help = "Skip the safety snapshot")]
        skip_safety: bool,
    },
    #[command(about = "List snapshots")]
    List,
    #[command(about = "Forget a snapshot")]
    Delete { snapshot: String },
    #[command(about = "Manage the scheduled backup")]
    Schedule(ScheduleArgs),
}

#[derive(Debug, Args)]
struct ScheduleArgs {
    #[command(subcommand)]
    command: ScheduleSubcommand,
}

#[derive(Debug, Subcommand)]
enum ScheduleSubcommand {
    #[command(about = "Install or replace the crontab entry")]
    Set {
        #[arg(help = "Cron expression, e.g. \"0 3 * * *\" or @daily")]
        expression: String,
        #[arg(long, default_value = "scheduled")]
        label: String,
    },
    List,
    Remove,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("error: {error:#}");
            let code = FarmError::find(&error)
                .map(FarmError::exit_code)
                .unwrap_or(1);
            ExitCode::from(u8::try_from(code).unwrap_or(1))
        }
    }
}

fn init_logging(verbose: u8) {
    let fallback = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    let runtime = RuntimeOptions::from_cli(&cli);
    let Some(command) = cli.command else {
        let mut command = Cli::command();
        command.print_help()?;
        println!();
        return Ok(());
    };

    let paths = resolve_runtime_paths(&runtime)?;
    if runtime.diagnostics {
        eprintln!("[diagnostics]\n{}", paths.diagnostics());
    }
    let runner: Rc<dyn CommandRunner> = Rc::new(SystemRunner);

    match command {
        Commands::List => run_list(&runtime, &paths),
        Commands::Create(args) => run_create(&runtime, &paths, runner, args),
        Commands::Delete(args) => run_delete(&runtime, &paths, runner, args),
        Commands::Start => {
            let context = open_context(&runtime, paths, runner)?;
            let report = start(&context)?;
            print_config_update(&runtime, &report)
        }
        Commands::Stop => {
            let context = open_context(&runtime, paths, runner)?;
            stop(&context)?;
            println!("stopped: {}", context.installation.id);
            Ok(())
        }
        Commands::Restart(args) => {
            let context = open_context(&runtime, paths, runner)?;
            let report = restart_installation(&context, args.recreate_cluster)?;
            if runtime.json {
                return print_json(&report);
            }
            println!("cluster_recreated: {}", format_flag(report.cluster_recreated));
            print_config_update(&runtime, &report.config)
        }
        Commands::Devmode(args) => {
            let mut context = open_context(&runtime, paths, runner)?;
            let enabled = matches!(args.state, Toggle::On);
            let changed = set_dev_mode(&mut context, enabled)?;
            println!("dev_mode: {}", format_flag(enabled));
            println!("changed: {}", format_flag(changed));
            Ok(())
        }
        Commands::Add(args) => run_add(&runtime, open_context(&runtime, paths, runner)?, args),
        Commands::Remove(args) => run_remove(&runtime, open_context(&runtime, paths, runner)?, args),
        Commands::Wikis(WikisArgs { command }) => match command {
            WikisSubcommand::List => {
                let context = open_context(&runtime, paths, runner)?;
                let wikis = list_wikis(&context.installation)?;
                if runtime.json {
                    return print_json(&wikis);
                }
                for wiki in wikis {
                    println!("{}\t{}\t{}", wiki.id, wiki.url, wiki.display_name());
                }
                Ok(())
            }
        },
        Commands::Config(ConfigArgs { command }) => {
            if let ConfigSubcommand::Known = command {
                return run_config_known(&runtime);
            }
            run_config(&runtime, open_context(&runtime, paths, runner)?, command)
        }
        Commands::Backup(BackupArgs { command }) => {
            run_backup(&runtime, open_context(&runtime, paths, runner)?, command)
        }
    }
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<RuntimePaths> {
    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        config_dir: runtime.config_dir.clone(),
    };
    resolve_paths(&context, &overrides)
}

fn open_context(
    runtime: &RuntimeOptions,
    paths: RuntimePaths,
    runner: Rc<dyn CommandRunner>,
) -> Result<FarmContext> {
    FarmContext::open(paths, runtime.id.as_deref(), runner)
}

fn run_list(runtime: &RuntimeOptions, paths: &RuntimePaths) -> Result<()> {
    let installations = list_installations(paths)?;
    if runtime.json {
        return print_json(&installations);
    }
    if installations.is_empty() {
        println!("installations: <none>");
        return Ok(());
    }
    for installation in installations {
        println!(
            "{}\t{}\t{}{}",
            installation.id,
            installation.orchestrator.as_str(),
            normalize_path(&installation.path),
            if installation.dev_mode { "\tdev" } else { "" }
        );
    }
    Ok(())
}

fn run_create(
    runtime: &RuntimeOptions,
    paths: &RuntimePaths,
    runner: Rc<dyn CommandRunner>,
    args: CreateArgs,
) -> Result<()> {
    let env = args
        .env
        .iter()
        .map(|pair| parse_pair(pair))
        .collect::<Result<Vec<_>>>()?;
    let tool = wikifarm_core::config::load_config(&paths.tool_config_path)?;
    let report = create_installation(
        paths,
        &tool,
        runner,
        CreateInstallationRequest {
            id: args.installation,
            path: args.path,
            orchestrator: args.orchestrator.into(),
            managed_cluster: args.cluster,
            template_dir: args.template_dir,
            wiki_id: args.wiki,
            wiki_url: args.url,
            wiki_name: args.name,
            admin_user: args.admin_user,
            admin_password: args.admin_password,
            env,
        },
    )?;

    if runtime.json {
        return print_json(&report);
    }
    println!("created: {}", report.installation.id);
    println!("path: {}", normalize_path(&report.installation.path));
    println!("orchestrator: {}", report.installation.orchestrator.as_str());
    println!("wiki: {} ({})", report.wiki.id, report.wiki.url);
    if let Some(password) = &report.generated_admin_password {
        println!("admin_password: {password}");
    }
    print_config_update(runtime, &report.config)
}

fn run_delete(
    runtime: &RuntimeOptions,
    paths: &RuntimePaths,
    runner: Rc<dyn CommandRunner>,
    args: DeleteArgs,
) -> Result<()> {
    if !args.yes {
        let files = if args.remove_files { " and its files" } else { "" };
        if !confirm(&format!("Delete installation '{}'{files}?", args.installation))? {
            bail!("aborted");
        }
    }
    let tool = wikifarm_core::config::load_config(&paths.tool_config_path)?;
    let report = delete_installation(paths, &tool, runner, &args.installation, args.remove_files)?;
    if runtime.json {
        return print_json(&report);
    }
    println!("deleted: {}", report.installation.id);
    println!("resources_removed: {}", report.destroy.removed.len());
    println!("files_removed: {}", format_flag(report.files_removed));
    Ok(())
}

fn run_add(runtime: &RuntimeOptions, context: FarmContext, args: AddArgs) -> Result<()> {
    let report = add_wiki(
        &context,
        AddWikiRequest {
            id: args.wiki,
            url: args.url,
            name: args.name,
            database_dump: args.dump,
            settings_file: args.settings,
            admin_user: args.admin_user,
            admin_password: args.admin_password,
        },
    )?;
    if runtime.json {
        return print_json(&report);
    }
    println!("added: {} ({})", report.wiki.id, report.wiki.url);
    if let Some(password) = &report.generated_admin_password {
        println!("admin_password: {password}");
    }
    print_config_update(runtime, &report.restart.config)
}

fn run_remove(runtime: &RuntimeOptions, context: FarmContext, args: RemoveArgs) -> Result<()> {
    let skip_prompt = args.yes;
    let report = remove_wiki(&context, &args.wiki, |wiki| {
        if skip_prompt {
            return Ok(true);
        }
        confirm(&format!(
            "Remove wiki '{}' ({}) with its database and images?",
            wiki.id, wiki.url
        ))
    })?;
    if runtime.json {
        return print_json(&report);
    }
    println!("removed: {} ({})", report.removed.id, report.removed.url);
    print_config_update(runtime, &report.restart.config)
}

fn run_config(runtime: &RuntimeOptions, context: FarmContext, command: ConfigSubcommand) -> Result<()> {
    match command {
        ConfigSubcommand::Get { key: Some(key) } => {
            let value = get_setting(&context, &key)?;
            if runtime.json {
                return print_json(&value);
            }
            println!("{value}");
            Ok(())
        }
        ConfigSubcommand::Get { key: None } => {
            let entries = get_settings(&context)?;
            if runtime.json {
                return print_json(&entries.into_iter().collect::<std::collections::BTreeMap<_, _>>());
            }
            for (key, value) in entries {
                println!("{key}={value}");
            }
            Ok(())
        }
        ConfigSubcommand::Set { pairs, options } => {
            let batch = pairs
                .iter()
                .map(|pair| parse_pair(pair))
                .collect::<Result<Vec<_>>>()?;
            let report = set_settings(&context, &batch, SetOptions::from(&options))?;
            print_settings_change(runtime, "set", &report)
        }
        ConfigSubcommand::Unset { keys, options } => {
            let report = unset_settings(&context, &keys, SetOptions::from(&options))?;
            print_settings_change(runtime, "unset", &report)
        }
        ConfigSubcommand::Known => run_config_known(runtime),
    }
}

fn run_config_known(runtime: &RuntimeOptions) -> Result<()> {
    if runtime.json {
        let rows = KNOWN_SETTINGS
            .iter()
            .map(|setting| (setting.key, setting.description))
            .collect::<std::collections::BTreeMap<_, _>>();
        return print_json(&rows);
    }
    for setting in KNOWN_SETTINGS {
        let marker = if setting.side_effect.is_some() { "*" } else { " " };
        println!("{marker} {:<28} {}", setting.key, setting.description);
    }
    println!("(* changes trigger a side effect)");
    Ok(())
}

fn print_settings_change(
    runtime: &RuntimeOptions,
    verb: &str,
    report: &wikifarm_core::settings::SettingsChangeReport,
) -> Result<()> {
    if runtime.json {
        return print_json(report);
    }
    println!("{verb}: {}", report.keys.join(", "));
    match &report.restart {
        Some(restart) => {
            println!("cluster_recreated: {}", format_flag(restart.cluster_recreated));
            print_config_update(runtime, &restart.config)
        }
        None => {
            println!("restart: skipped (run `wikifarm restart` to apply)");
            Ok(())
        }
    }
}

fn run_backup(runtime: &RuntimeOptions, context: FarmContext, command: BackupSubcommand) -> Result<()> {
    match command {
        BackupSubcommand::Init => {
            let output = init_repository(&context)?;
            println!("{}", output.trim_end());
            Ok(())
        }
        BackupSubcommand::Create { label } => {
            let report = create_backup(&context, &label)?;
            if runtime.json {
                return print_json(&report);
            }
            println!("tag: {}", report.tag);
            println!(
                "snapshot: {}",
                report.snapshot_id.as_deref().unwrap_or("<unknown>")
            );
            println!("databases: {}", report.databases.join(", "));
            println!("staged_files: {}", report.staged_files);
            Ok(())
        }
        BackupSubcommand::Restore {
            snapshot,
            skip_safety,
        } => {
            let report = restore_backup(&context, &snapshot, skip_safety)?;
            if runtime.json {
                return print_json(&report);
            }
            println!("restored: {}", report.snapshot_id);
            match &report.safety_snapshot {
                Some(safety) => println!(
                    "safety_snapshot: {} ({})",
                    safety.snapshot_id.as_deref().unwrap_or("<unknown>"),
                    safety.tag
                ),
                None => println!("safety_snapshot: <skipped>"),
            }
            println!("databases: {}", report.databases.join(", "));
            print_config_update(runtime, &report.restart.config)
        }
        BackupSubcommand::List => {
            let snapshots = list_snapshots(&context)?;
            if runtime.json {
                return print_json(&snapshots);
            }
            if snapshots.is_empty() {
                println!("snapshots: <none>");
            }
            for snapshot in snapshots {
                println!(
                    "{}\t{}\t{}\t{}",
                    snapshot.short_id,
                    snapshot.time,
                    snapshot.hostname,
                    snapshot.tags.join(",")
                );
            }
            Ok(())
        }
        BackupSubcommand::Delete { snapshot } => {
            delete_snapshot(&context, &snapshot)?;
            println!("forgotten: {snapshot}");
            Ok(())
        }
        BackupSubcommand::Schedule(ScheduleArgs { command }) => run_schedule(runtime, &context, command),
    }
}

fn run_schedule(runtime: &RuntimeOptions, context: &FarmContext, command: ScheduleSubcommand) -> Result<()> {
    match command {
        ScheduleSubcommand::Set { expression, label } => {
            let executable = std::env::current_exe().context("failed to locate the wikifarm executable")?;
            let schedule = set_schedule(context, &expression, &label, &executable)?;
            if runtime.json {
                return print_json(&schedule);
            }
            println!("schedule: {}", schedule.expression);
            println!("command: {}", schedule.command);
            Ok(())
        }
        ScheduleSubcommand::List => {
            let schedules = list_schedules(context)?;
            if runtime.json {
                return print_json(&schedules);
            }
            if schedules.is_empty() {
                println!("schedules: <none>");
            }
            for schedule in schedules {
                println!("{}\t{}", schedule.expression, schedule.command);
            }
            Ok(())
        }
        ScheduleSubcommand::Remove => {
            let removed = remove_schedule(context)?;
            println!("removed: {}", format_flag(removed));
            Ok(())
        }
    }
}

fn print_config_update(runtime: &RuntimeOptions, report: &ConfigUpdateReport) -> Result<()> {
    if runtime.json {
        return print_json(report);
    }
    println!("domains: {}", report.domains.join(", "));
    for artifact in &report.artifacts {
        println!(
            "artifact: {} ({})",
            normalize_path(&artifact.path),
            if artifact.changed { "updated" } else { "unchanged" }
        );
    }
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_pair(pair: &str) -> Result<(String, String)> {
    match pair.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(FarmError::ValidationFailed(format!("expected KEY=VALUE, got '{pair}'")).into()),
    }
}

fn confirm(prompt: &str) -> Result<bool> {
    eprint!("{prompt} [y/N] ");
    io::stderr().flush()?;
    let mut answer = String::new();
    io::stdin()
        .lock()
        .read_line(&mut answer)
        .context("failed to read confirmation")?;
    Ok(matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

fn format_flag(value: bool) -> &'static str {
    if value { "yes" } else { "no" }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{Cli, Commands, ConfigSubcommand, parse_pair};

    #[test]
    fn parses_key_value_pairs() {
        assert_eq!(
            parse_pair("HTTPS_PORT=8443").expect("pair"),
            ("HTTPS_PORT".to_string(), "8443".to_string())
        );
        assert_eq!(
            parse_pair("MW_SITE_NOTICE=a=b").expect("pair").1,
            "a=b".to_string()
        );
        assert!(parse_pair("HTTPS_PORT").is_err());
        assert!(parse_pair("=value").is_err());
    }

    #[test]
    fn global_flags_follow_subcommands() {
        let cli = Cli::try_parse_from([
            "wikifarm", "config", "set", "HTTPS_PORT=8443", "--skip-restart", "--id", "farm", "-vv",
        ])
        .expect("parse");
        assert_eq!(cli.id.as_deref(), Some("farm"));
        assert_eq!(cli.verbose, 2);
        match cli.command {
            Some(Commands::Config(args)) => match args.command {
                ConfigSubcommand::Set { pairs, options } => {
                    assert_eq!(pairs, vec!["HTTPS_PORT=8443".to_string()]);
                    assert!(options.skip_restart);
                    assert!(!options.force);
                }
                other => panic!("unexpected config command: {other:?}"),
            },
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
