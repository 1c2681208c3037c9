use std::{
    collections::BTreeMap,
    fs,
    io::Read,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::{Local, NaiveDate};
use clap::{Args, Subcommand};
use serde_json::{Value, json};
use tracing::{error, warn};

use crate::{
    api::{ApiClient, ApiError},
    changelog::{ChangelogFeed, ChangelogLine, render as render_changelog},
    fifo::TaskQueue,
    planner::{DayEdit, DefaultsEditor, PlanDay, PlanDraft, PlanWeek, default_is_empty},
    schedule::{EditOutcome, ScheduleEditor, ScheduleError, group_by_date, registration_window},
    settings::Settings,
    stats::{Division, StatsTable},
    types::{DaySettings, DayShift, ShiftKey, ShiftRow, WeekIndex, Weekday, Worker, WorkerRef},
    window::{WindowLoader, WindowSnapshot},
    workers::{WorkerDirectory, WorkerError, WorkerPatch, login_link},
};

const SCHEMA_VERSION: &str = "cli.v1";

#[derive(Debug, Clone, Subcommand)]
pub enum RootCommand {
    /// The week schedule and its assignments.
    Week {
        #[command(subcommand)]
        command: WeekCommand,
    },
    Worker {
        #[command(subcommand)]
        command: WorkerCommand,
    },
    /// Shift counts per worker.
    Stats(StatsArgs),
    Changelog(ChangelogArgs),
    /// Upcoming shifts per day.
    Plan {
        #[command(subcommand)]
        command: PlanCommand,
    },
    /// Weekday defaults used for new weeks.
    Defaults {
        #[command(subcommand)]
        command: DefaultsCommand,
    },
    Retention {
        #[command(subcommand)]
        command: RetentionCommand,
    },
    /// The settings file.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Clone, Subcommand)]
pub enum WeekCommand {
    Show(WeekShowArgs),
    Assign(WeekAssignArgs),
    Unassign(WeekUnassignArgs),
    Move(WeekMoveArgs),
}

#[derive(Debug, Clone, Subcommand)]
pub enum WorkerCommand {
    List(WorkerListArgs),
    Import(WorkerImportArgs),
    Update(WorkerUpdateArgs),
    Delete(WorkerDeleteArgs),
    LoginLink(WorkerLoginLinkArgs),
}

#[derive(Debug, Clone, Subcommand)]
pub enum PlanCommand {
    Show(PlanShowArgs),
    Edit(PlanEditArgs),
}

#[derive(Debug, Clone, Subcommand)]
pub enum PlanEditAction {
    /// Add a shift at the end of the day.
    Append { name: String },
    Rename { position: usize, name: String },
    Remove { position: usize },
    /// Move the shift at FROM to just before TO (use count + 1 for the end).
    Move { from: usize, to: usize },
}

#[derive(Debug, Clone, Subcommand)]
pub enum DefaultsCommand {
    Show,
    Set(DefaultsSetArgs),
}

#[derive(Debug, Clone, Subcommand)]
pub enum ConfigCommand {
    /// Print the settings file path and its values.
    Show,
    Set(ConfigSetArgs),
}

#[derive(Debug, Clone, Subcommand)]
pub enum RetentionCommand {
    Status,
    Run(RetentionRunArgs),
}

#[derive(Debug, Clone, Args)]
pub struct WeekSelectorArgs {
    /// Week to start from, as YYYYwW. Defaults to the configured start week.
    #[arg(long, value_name = "WEEK")]
    pub week: Option<WeekIndex>,
}

#[derive(Debug, Clone, Args)]
pub struct ShiftSelectorArgs {
    #[command(flatten)]
    pub week: WeekSelectorArgs,

    #[arg(long, value_name = "YYYY-MM-DD")]
    pub date: String,

    #[arg(long, value_name = "SLUG")]
    pub slug: String,
}

#[derive(Debug, Clone, Args)]
pub struct WeekShowArgs {
    #[command(flatten)]
    pub week: WeekSelectorArgs,

    /// Pages to move from the start week, following the server's cursors.
    #[arg(long, value_name = "N", default_value_t = 0, allow_hyphen_values = true)]
    pub offset: i64,
}

#[derive(Debug, Clone, Args)]
pub struct WeekAssignArgs {
    #[command(flatten)]
    pub shift: ShiftSelectorArgs,

    #[arg(long, value_name = "WORKER_ID")]
    pub worker: u64,
}

#[derive(Debug, Clone, Args)]
pub struct WeekUnassignArgs {
    #[command(flatten)]
    pub shift: ShiftSelectorArgs,

    /// 1-based position in the shift's worker list.
    #[arg(long, value_name = "N")]
    pub position: usize,
}

#[derive(Debug, Clone, Args)]
pub struct WeekMoveArgs {
    #[command(flatten)]
    pub shift: ShiftSelectorArgs,

    #[arg(long, value_name = "N")]
    pub from: usize,

    #[arg(long, value_name = "N")]
    pub to: usize,
}

#[derive(Debug, Clone, Args)]
pub struct WorkerListArgs {
    /// Include inactive workers.
    #[arg(long)]
    pub all: bool,
}

#[derive(Debug, Clone, Args)]
pub struct WorkerImportArgs {
    /// File with one `name;phone;email` row per line, or `-` for stdin.
    #[arg(long, value_name = "PATH")]
    pub file: PathBuf,
}

#[derive(Debug, Clone, Args)]
pub struct WorkerUpdateArgs {
    #[arg(long, value_name = "WORKER_ID")]
    pub id: u64,

    #[arg(long, value_name = "TEXT")]
    pub name: Option<String>,

    #[arg(long, value_name = "PHONE")]
    pub phone: Option<String>,

    #[arg(long, value_name = "TEXT")]
    pub note: Option<String>,

    #[arg(long, value_name = "BOOL")]
    pub active: Option<bool>,
}

#[derive(Debug, Clone, Args)]
pub struct WorkerDeleteArgs {
    #[arg(long = "id", value_name = "WORKER_ID", required = true)]
    pub ids: Vec<u64>,
}

#[derive(Debug, Clone, Args)]
pub struct WorkerLoginLinkArgs {
    #[arg(long, value_name = "WORKER_ID")]
    pub id: u64,

    /// Open the link in the default browser.
    #[arg(long)]
    pub open: bool,
}

#[derive(Debug, Clone, Args)]
pub struct StatsArgs {
    #[arg(long, value_enum, default_value_t = Division::Month)]
    pub by: Division,
}

#[derive(Debug, Clone, Args)]
pub struct ChangelogArgs {
    #[arg(long, value_name = "WORKER_ID")]
    pub worker: Option<u64>,
}

#[derive(Debug, Clone, Args)]
pub struct PlanShowArgs {
    /// First day to plan from; rounded down to its Monday. Defaults to today.
    #[arg(long, value_name = "YYYY-MM-DD")]
    pub from: Option<NaiveDate>,
}

#[derive(Debug, Clone, Args)]
pub struct PlanEditArgs {
    #[arg(long, value_name = "YYYY-MM-DD")]
    pub date: NaiveDate,

    #[command(subcommand)]
    pub action: PlanEditAction,
}

#[derive(Debug, Clone, Args)]
pub struct DefaultsSetArgs {
    #[arg(long, value_name = "WEEKDAY", value_parser = parse_weekday)]
    pub day: Weekday,

    /// Shift names in order. Pass none to clear the day.
    pub shifts: Vec<String>,
}

#[derive(Debug, Clone, Args)]
pub struct RetentionRunArgs {
    /// Delete shifts dated before this Monday.
    #[arg(long, value_name = "YYYY-MM-DD")]
    pub before: NaiveDate,
}

#[derive(Debug, Clone, Default, Args)]
pub struct ConfigSetArgs {
    #[arg(long, value_name = "URL")]
    pub base_url: Option<String>,

    /// CSRF token sent with every change. An empty value clears it.
    #[arg(long, value_name = "TOKEN")]
    pub csrf_token: Option<String>,

    #[arg(long, value_name = "WEEK", conflicts_with = "clear_start_week")]
    pub start_week: Option<WeekIndex>,

    /// Start at the current week again.
    #[arg(long)]
    pub clear_start_week: bool,

    #[arg(long, value_name = "BOOL")]
    pub rollback_on_failure: Option<bool>,

    #[arg(long, value_name = "MS")]
    pub request_timeout_ms: Option<u64>,
}

fn parse_weekday(raw: &str) -> Result<Weekday, String> {
    raw.parse()
        .map_err(|()| format!("unknown weekday '{raw}'"))
}

pub async fn run(settings: Settings, command: RootCommand, json_output: bool, quiet: bool) -> i32 {
    match execute(&settings, command).await {
        Ok(output) => {
            print_success(output, json_output, quiet);
            0
        }
        Err(err) => {
            print_error(&err, json_output);
            err.exit_code
        }
    }
}

struct CommandOutput {
    command: &'static str,
    base_url: String,
    data: Value,
    text: String,
}

#[derive(Debug)]
struct CliError {
    exit_code: i32,
    code: &'static str,
    message: String,
    details: Option<Value>,
}

type CliResult<T> = Result<T, CliError>;

struct Context<'a> {
    settings: &'a Settings,
    client: ApiClient,
}

impl Context<'_> {
    fn output(&self, command: &'static str, data: Value, text: String) -> CommandOutput {
        CommandOutput {
            command,
            base_url: self.client.base_url().to_string(),
            data,
            text,
        }
    }
}

async fn execute(settings: &Settings, command: RootCommand) -> CliResult<CommandOutput> {
    let client = match command {
        RootCommand::Config { command } => {
            let path = Settings::config_path().ok_or_else(|| {
                runtime_error("unable to determine the settings file location")
            })?;
            return execute_config_command(&path, command);
        }
        _ => ApiClient::new(settings.api_config()).map_err(runtime_error)?,
    };
    let ctx = Context { settings, client };

    match command {
        RootCommand::Week { command } => execute_week_command(&ctx, command).await,
        RootCommand::Worker { command } => execute_worker_command(&ctx, command).await,
        RootCommand::Stats(args) => stats(&ctx, args).await,
        RootCommand::Changelog(args) => changelog(&ctx, args).await,
        RootCommand::Plan { command } => execute_plan_command(&ctx, command).await,
        RootCommand::Defaults { command } => execute_defaults_command(&ctx, command).await,
        RootCommand::Retention { command } => execute_retention_command(&ctx, command).await,
        RootCommand::Config { .. } => Err(runtime_error("config commands run without a client")),
    }
}

fn execute_config_command(path: &Path, command: ConfigCommand) -> CliResult<CommandOutput> {
    match command {
        ConfigCommand::Show => {
            let settings = Settings::load_from_path(path);
            Ok(config_output("config.show", path, &settings, false))
        }
        ConfigCommand::Set(args) => {
            let current = Settings::load_from_path(path);
            let next = apply_config_changes(current.clone(), &args)?;
            let changed = next != current;
            if changed {
                next.save_to_path(path).map_err(|err| {
                    runtime_error(format!("failed to save settings: {err:#}"))
                })?;
            }
            Ok(config_output("config.set", path, &next, changed))
        }
    }
}

fn apply_config_changes(mut settings: Settings, args: &ConfigSetArgs) -> CliResult<Settings> {
    if let Some(base_url) = &args.base_url {
        let base_url = base_url.trim();
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(usage_error(
                "INVALID_BASE_URL",
                format!("base URL '{base_url}' must start with http:// or https://"),
            ));
        }
        settings.base_url = base_url.trim_end_matches('/').to_string();
    }
    if let Some(token) = &args.csrf_token {
        settings.csrf_token = Some(token.trim().to_string()).filter(|token| !token.is_empty());
    }
    if let Some(week) = args.start_week {
        settings.start_week = Some(week.to_string());
    }
    if args.clear_start_week {
        settings.start_week = None;
    }
    if let Some(rollback) = args.rollback_on_failure {
        settings.rollback_on_failure = rollback;
    }
    if let Some(timeout) = args.request_timeout_ms {
        settings.request_timeout_ms = timeout;
    }
    Ok(settings)
}

fn config_output(
    command: &'static str,
    path: &Path,
    settings: &Settings,
    changed: bool,
) -> CommandOutput {
    let token = settings.csrf_token.as_ref().map(|_| "<set>");
    let data = json!({
        "path": path.display().to_string(),
        "changed": changed,
        "settings": {
            "base_url": settings.base_url,
            "csrf_token": token,
            "request_timeout_ms": settings.request_timeout_ms,
            "rollback_on_failure": settings.rollback_on_failure,
            "start_week": settings.start_week
        }
    });
    let rows = vec![
        vec!["base_url".to_string(), settings.base_url.clone()],
        vec!["csrf_token".to_string(), token.unwrap_or("-").to_string()],
        vec![
            "request_timeout_ms".to_string(),
            settings.request_timeout_ms.to_string(),
        ],
        vec![
            "rollback_on_failure".to_string(),
            settings.rollback_on_failure.to_string(),
        ],
        vec![
            "start_week".to_string(),
            settings.start_week.clone().unwrap_or_else(|| "-".to_string()),
        ],
    ];
    let text = format!(
        "{}\n{}",
        path.display(),
        render_text_table(&["KEY", "VALUE"], &rows)
    );
    CommandOutput {
        command,
        base_url: settings.base_url.clone(),
        data,
        text,
    }
}

async fn execute_week_command(ctx: &Context<'_>, command: WeekCommand) -> CliResult<CommandOutput> {
    match command {
        WeekCommand::Show(args) => week_show(ctx, args).await,
        WeekCommand::Assign(args) => week_assign(ctx, args).await,
        WeekCommand::Unassign(args) => week_unassign(ctx, args).await,
        WeekCommand::Move(args) => week_move(ctx, args).await,
    }
}

async fn execute_worker_command(
    ctx: &Context<'_>,
    command: WorkerCommand,
) -> CliResult<CommandOutput> {
    match command {
        WorkerCommand::List(args) => worker_list(ctx, args).await,
        WorkerCommand::Import(args) => worker_import(ctx, args).await,
        WorkerCommand::Update(args) => worker_update(ctx, args).await,
        WorkerCommand::Delete(args) => worker_delete(ctx, args).await,
        WorkerCommand::LoginLink(args) => worker_login_link(ctx, args).await,
    }
}

async fn execute_plan_command(ctx: &Context<'_>, command: PlanCommand) -> CliResult<CommandOutput> {
    match command {
        PlanCommand::Show(args) => plan_show(ctx, args).await,
        PlanCommand::Edit(args) => plan_edit(ctx, args).await,
    }
}

async fn execute_defaults_command(
    ctx: &Context<'_>,
    command: DefaultsCommand,
) -> CliResult<CommandOutput> {
    match command {
        DefaultsCommand::Show => defaults_show(ctx).await,
        DefaultsCommand::Set(args) => defaults_set(ctx, args).await,
    }
}

async fn execute_retention_command(
    ctx: &Context<'_>,
    command: RetentionCommand,
) -> CliResult<CommandOutput> {
    match command {
        RetentionCommand::Status => {
            let status = ctx.client.retention_status().await.map_err(api_error)?;
            let text = render_key_values(&status);
            Ok(ctx.output("retention.status", Value::Object(status), text))
        }
        RetentionCommand::Run(args) => {
            let status = ctx
                .client
                .run_retention(args.before)
                .await
                .map_err(api_error)?;
            let text = format!(
                "deleted shifts before {}\n{}",
                args.before,
                render_key_values(&status)
            );
            Ok(ctx.output("retention.run", Value::Object(status), text))
        }
    }
}

async fn open_week(
    ctx: &Context<'_>,
    week: &WeekSelectorArgs,
    offset: i64,
) -> CliResult<(WindowLoader<ApiClient>, WindowSnapshot)> {
    let start = week.week.unwrap_or_else(|| ctx.settings.start_week());
    let window = WindowLoader::new(ctx.client.clone(), start);
    window.load();
    window.navigate(offset);
    let snapshot = window.settled().await;
    if let Some(message) = snapshot.error() {
        return Err(runtime_error(format!(
            "failed to load week {}: {message}",
            snapshot.position.index
        )));
    }
    Ok((window, snapshot))
}

async fn week_show(ctx: &Context<'_>, args: WeekShowArgs) -> CliResult<CommandOutput> {
    let (window, snapshot) = open_week(ctx, &args.week, args.offset).await?;
    let data = week_json(&snapshot, &window.admin_path());
    let text = render_week_text(&snapshot);
    Ok(ctx.output("week.show", data, text))
}

async fn week_assign(ctx: &Context<'_>, args: WeekAssignArgs) -> CliResult<CommandOutput> {
    let workers = ctx.client.list_workers().await.map_err(api_error)?;
    let directory = WorkerDirectory::from_rows(workers);
    let worker = directory.get(args.worker).ok_or_else(|| {
        not_found_error(
            "WORKER_NOT_FOUND",
            format!("worker {} not found", args.worker),
        )
    })?;
    if !worker.active {
        return Err(conflict_error(
            "WORKER_INACTIVE",
            format!("worker {} is not active", worker.id),
            None,
        ));
    }
    let worker = WorkerRef::from(worker);

    apply_shift_edit(ctx, "week.assign", &args.shift, |editor, key| {
        editor.add_worker(key, worker)
    })
    .await
}

async fn week_unassign(ctx: &Context<'_>, args: WeekUnassignArgs) -> CliResult<CommandOutput> {
    let position = one_based(args.position, "--position")?;
    apply_shift_edit(ctx, "week.unassign", &args.shift, |editor, key| {
        editor.remove_worker(key, position)
    })
    .await
}

async fn week_move(ctx: &Context<'_>, args: WeekMoveArgs) -> CliResult<CommandOutput> {
    let from = one_based(args.from, "--from")?;
    let to = one_based(args.to, "--to")?;
    apply_shift_edit(ctx, "week.move", &args.shift, |editor, key| {
        editor.move_worker(key, from, to)
    })
    .await
}

type WeekEditor = ScheduleEditor<ApiClient, ApiClient>;

async fn apply_shift_edit(
    ctx: &Context<'_>,
    command: &'static str,
    shift: &ShiftSelectorArgs,
    edit: impl FnOnce(&WeekEditor, &ShiftKey) -> Result<EditOutcome, ScheduleError>,
) -> CliResult<CommandOutput> {
    let (window, _) = open_week(ctx, &shift.week, 0).await?;
    let editor = ScheduleEditor::new(window, ctx.client.clone(), TaskQueue::new("schedule"))
        .with_rollback(ctx.settings.rollback_on_failure);
    let key = ShiftKey {
        date: shift.date.clone(),
        slug: shift.slug.clone(),
    };

    let changed = match edit(&editor, &key).map_err(schedule_error)? {
        EditOutcome::Skipped => false,
        EditOutcome::Queued(receiver) => {
            receiver
                .await
                .map_err(|_| runtime_error("schedule queue stopped before the edit finished"))?
                .map_err(api_error)?;
            true
        }
    };

    let snapshot = editor.window().settled().await;
    let row = snapshot
        .rows
        .iter()
        .find(|row| row.date == key.date && row.slug == key.slug);
    let data = json!({
        "changed": changed,
        "shift": row.map(shift_row_json),
    });
    let text = match (changed, row) {
        (false, _) => format!("shift {key} unchanged"),
        (true, Some(row)) => format!("{key}: {}", worker_names(row)),
        (true, None) => format!("shift {key} saved"),
    };
    Ok(ctx.output(command, data, text))
}

fn one_based(position: usize, flag: &str) -> CliResult<usize> {
    position
        .checked_sub(1)
        .ok_or_else(|| usage_error("INVALID_POSITION", format!("{flag} starts at 1")))
}

async fn load_directory(ctx: &Context<'_>) -> CliResult<WorkerDirectory> {
    let workers = ctx.client.list_workers().await.map_err(api_error)?;
    Ok(WorkerDirectory::from_rows(workers))
}

async fn worker_list(ctx: &Context<'_>, args: WorkerListArgs) -> CliResult<CommandOutput> {
    let directory = load_directory(ctx).await?;
    let workers = directory
        .all()
        .filter(|worker| args.all || worker.active)
        .collect::<Vec<_>>();

    let data = json!({
        "workers": workers.iter().copied().map(worker_json).collect::<Vec<_>>()
    });
    let rows = workers
        .iter()
        .map(|worker| {
            vec![
                worker.id.to_string(),
                worker.name.clone(),
                worker.phone.clone().unwrap_or_else(|| "-".to_string()),
                if worker.active { "yes" } else { "no" }.to_string(),
                worker.note.clone(),
            ]
        })
        .collect::<Vec<_>>();
    let text = render_text_table(&["ID", "NAME", "PHONE", "ACTIVE", "NOTE"], &rows);
    Ok(ctx.output("worker.list", data, text))
}

async fn worker_import(ctx: &Context<'_>, args: WorkerImportArgs) -> CliResult<CommandOutput> {
    let text = if args.file.as_os_str() == "-" {
        let mut buffer = String::new();
        std::io::stdin()
            .read_to_string(&mut buffer)
            .map_err(runtime_error)?;
        buffer
    } else {
        fs::read_to_string(&args.file).map_err(|err| {
            usage_error(
                "IMPORT_FILE_UNREADABLE",
                format!("failed to read '{}': {err}", args.file.display()),
            )
        })?
    };

    let directory = load_directory(ctx).await?;
    let created = directory
        .import(&ctx.client, &text)
        .await
        .map_err(worker_error)?;
    Ok(ctx.output(
        "worker.import",
        json!({ "created": created }),
        format!("imported {created} workers"),
    ))
}

async fn worker_update(ctx: &Context<'_>, args: WorkerUpdateArgs) -> CliResult<CommandOutput> {
    let mut directory = load_directory(ctx).await?;
    let current = directory
        .get(args.id)
        .ok_or_else(|| not_found_error("WORKER_NOT_FOUND", format!("worker {} not found", args.id)))?;

    let mut patch = WorkerPatch::from_worker(current);
    if let Some(name) = args.name {
        patch.name = name;
    }
    if let Some(phone) = args.phone {
        patch.phone = Some(phone).filter(|phone| !phone.trim().is_empty());
    }
    if let Some(note) = args.note {
        patch.note = note;
    }
    if let Some(active) = args.active {
        patch.active = active;
    }

    let saved = directory
        .save(&ctx.client, args.id, patch)
        .await
        .map_err(worker_error)?;
    let worker = directory.get(args.id).map(worker_json);
    let text = if saved {
        format!("worker {} updated", args.id)
    } else {
        format!("worker {} unchanged", args.id)
    };
    Ok(ctx.output(
        "worker.update",
        json!({ "changed": saved, "worker": worker }),
        text,
    ))
}

async fn worker_delete(ctx: &Context<'_>, args: WorkerDeleteArgs) -> CliResult<CommandOutput> {
    ctx.client
        .delete_workers(&args.ids)
        .await
        .map_err(api_error)?;
    let ids = args
        .ids
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    Ok(ctx.output(
        "worker.delete",
        json!({ "deleted": args.ids }),
        format!("deleted workers {ids}"),
    ))
}

async fn worker_login_link(
    ctx: &Context<'_>,
    args: WorkerLoginLinkArgs,
) -> CliResult<CommandOutput> {
    let directory = load_directory(ctx).await?;
    let worker = directory
        .get(args.id)
        .ok_or_else(|| not_found_error("WORKER_NOT_FOUND", format!("worker {} not found", args.id)))?;
    let link = login_link(ctx.client.base_url(), worker).ok_or_else(|| {
        conflict_error(
            "NO_LOGIN_SECRET",
            format!("worker {} has no login secret", worker.id),
            None,
        )
    })?;

    if args.open
        && let Err(err) = open::that(&link)
    {
        warn!(error = %err, "failed to open login link");
    }
    Ok(ctx.output("worker.login_link", json!({ "url": link }), link))
}

async fn stats(ctx: &Context<'_>, args: StatsArgs) -> CliResult<CommandOutput> {
    let workers = ctx.client.worker_stats().await.map_err(api_error)?;
    let table = StatsTable::build(args.by, &workers);

    let mut headers = vec!["NAME"];
    headers.extend(table.columns.iter().map(String::as_str));
    let rows = table
        .rows
        .iter()
        .map(|row| {
            std::iter::once(row.name.clone())
                .chain(
                    row.counts
                        .iter()
                        .map(|count| count.map_or_else(String::new, |count| count.to_string())),
                )
                .collect()
        })
        .collect::<Vec<Vec<String>>>();
    let text = render_text_table(&headers, &rows);
    let data = serde_json::to_value(&table).map_err(runtime_error)?;
    Ok(ctx.output("stats", data, text))
}

async fn changelog(ctx: &Context<'_>, args: ChangelogArgs) -> CliResult<CommandOutput> {
    let directory = load_directory(ctx).await?;
    let feed = ChangelogFeed::new(ctx.client.clone(), TaskQueue::new("changelog"));
    feed.reload(args.worker);
    let entries = feed.settled().await.ok_or_else(|| {
        runtime_error("failed to load changelog; see the log file for details")
    })?;

    let lines = render_changelog(&entries, &directory);
    let data = json!({ "rows": lines });
    let text = render_changelog_text(&lines);
    Ok(ctx.output("changelog", data, text))
}

fn render_changelog_text(lines: &[ChangelogLine]) -> String {
    let rows = lines
        .iter()
        .map(|line| {
            vec![
                line.time.clone(),
                line.worker.clone(),
                line.user.clone(),
                line.kind.clone(),
                line.summary.clone(),
            ]
        })
        .collect::<Vec<_>>();
    render_text_table(&["TIME", "WORKER", "USER", "KIND", "DATA"], &rows)
}

async fn load_plan(ctx: &Context<'_>, from: NaiveDate) -> CliResult<PlanDraft<ApiClient>> {
    let queue = TaskQueue::new("plan");
    let draft = PlanDraft::new(Arc::new(ctx.client.clone()), queue.clone(), from);
    draft.load();
    queue.wait_idle().await;
    if !draft.is_loaded() {
        return Err(runtime_error(
            "failed to load shifts; see the log file for details",
        ));
    }
    Ok(draft)
}

async fn load_defaults(ctx: &Context<'_>) -> CliResult<DefaultsEditor<ApiClient>> {
    let queue = TaskQueue::new("defaults");
    let editor = DefaultsEditor::new(Arc::new(ctx.client.clone()), queue.clone());
    editor.load();
    queue.wait_idle().await;
    if editor.workplace().is_none() {
        return Err(runtime_error(
            "failed to load workplace settings; see the log file for details",
        ));
    }
    Ok(editor)
}

async fn plan_show(ctx: &Context<'_>, args: PlanShowArgs) -> CliResult<CommandOutput> {
    let from = args.from.unwrap_or_else(|| Local::now().date_naive());
    let draft = load_plan(ctx, from).await?;
    let weeks = draft.weeks();
    let data = json!({ "from": draft.from_date(), "weeks": weeks });
    let text = render_plan_text(&weeks);
    Ok(ctx.output("plan.show", data, text))
}

async fn plan_edit(ctx: &Context<'_>, args: PlanEditArgs) -> CliResult<CommandOutput> {
    let date_key = args.date.format("%Y-%m-%d").to_string();
    let defaults = load_defaults(ctx).await?;
    let draft = load_plan(ctx, args.date).await?;
    let day = draft.day(&date_key).ok_or_else(|| {
        not_found_error("DAY_NOT_FOUND", format!("no shifts planned on {date_key}"))
    })?;

    let edit = DayEdit::new(&day.shifts, default_is_empty(&defaults.settings(), args.date));
    let next = match &args.action {
        PlanEditAction::Append { name } => edit.append(name),
        PlanEditAction::Rename { position, name } => {
            edit.rename(one_based(*position, "POSITION")?, name)
        }
        PlanEditAction::Remove { position } => edit.remove(one_based(*position, "POSITION")?),
        PlanEditAction::Move { from, to } => {
            edit.reorder(one_based(*from, "FROM")?, one_based(*to, "TO")?)
        }
    };
    let Some(next) = next else {
        return Err(conflict_error(
            "EDIT_NOT_ALLOWED",
            format!("{date_key}: edit would change nothing or is not allowed"),
            Some(json!({ "shifts": day.shifts })),
        ));
    };

    draft.stage(&date_key, next);
    let receiver = draft
        .save()
        .ok_or_else(|| runtime_error("plan save could not be queued"))?;
    receiver
        .await
        .map_err(|_| runtime_error("plan queue stopped before the save finished"))?
        .map_err(api_error)?;

    let saved = draft.day(&date_key);
    let text = match &saved {
        Some(day) => render_plan_day(day),
        None => format!("{date_key} saved"),
    };
    Ok(ctx.output("plan.edit", json!({ "day": saved }), text))
}

fn render_plan_day(day: &PlanDay) -> String {
    let shifts = day
        .shifts
        .iter()
        .map(day_shift_label)
        .collect::<Vec<_>>()
        .join(", ");
    format!("{}: {shifts}", day.date)
}

fn day_shift_label(shift: &DayShift) -> String {
    match shift.worker_count {
        Some(count) if count > 0 => format!("{} ({count})", shift.name),
        _ => shift.name.clone(),
    }
}

fn render_plan_text(weeks: &[PlanWeek]) -> String {
    if weeks.is_empty() {
        return "no shifts planned".to_string();
    }
    weeks
        .iter()
        .map(|week| {
            let mut lines = vec![format!("week of {}", week.monday)];
            lines.extend(week.days.iter().map(|day| format!("  {}", render_plan_day(day))));
            lines.join("\n")
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

async fn defaults_show(ctx: &Context<'_>) -> CliResult<CommandOutput> {
    let editor = load_defaults(ctx).await?;
    let settings = editor.settings();
    let text = render_defaults_text(&settings.weekday_defaults);
    let data = serde_json::to_value(&settings.weekday_defaults).map_err(runtime_error)?;
    Ok(ctx.output("defaults.show", data, text))
}

async fn defaults_set(ctx: &Context<'_>, args: DefaultsSetArgs) -> CliResult<CommandOutput> {
    let editor = load_defaults(ctx).await?;
    let shifts = args
        .shifts
        .iter()
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .collect::<Vec<_>>();
    if editor
        .settings()
        .weekday_defaults
        .get(&args.day)
        .is_some_and(|day| day.shifts == shifts)
    {
        return Ok(ctx.output(
            "defaults.set",
            json!({ "changed": false }),
            format!("{} unchanged", args.day.as_str()),
        ));
    }

    editor.set_day(args.day, shifts);
    let receiver = editor
        .save()
        .ok_or_else(|| runtime_error("defaults save could not be queued"))?;
    receiver
        .await
        .map_err(|_| runtime_error("defaults queue stopped before the save finished"))?
        .map_err(api_error)?;

    let settings = editor.settings();
    let day = settings.weekday_defaults.get(&args.day);
    let text = format!(
        "{}: {}",
        args.day.as_str(),
        day.map(|day| day.shifts.join(", ")).unwrap_or_default()
    );
    Ok(ctx.output(
        "defaults.set",
        json!({ "changed": true, "day": args.day, "value": day }),
        text,
    ))
}

fn render_defaults_text(defaults: &BTreeMap<Weekday, DaySettings>) -> String {
    let rows = Weekday::ALL
        .iter()
        .filter_map(|weekday| {
            let day = defaults.get(weekday)?;
            Some(vec![
                weekday.as_str().to_string(),
                day.shifts.join(", "),
                day.registration_starts.clone().unwrap_or_default(),
                day.registration_deadline.clone(),
            ])
        })
        .collect::<Vec<_>>();
    render_text_table(&["DAY", "SHIFTS", "OPENS", "DEADLINE"], &rows)
}

fn render_key_values(map: &serde_json::Map<String, Value>) -> String {
    if map.is_empty() {
        return "ok".to_string();
    }
    let rows = map
        .iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            vec![key.clone(), value]
        })
        .collect::<Vec<_>>();
    render_text_table(&["KEY", "VALUE"], &rows)
}

fn worker_names(row: &ShiftRow) -> String {
    if row.workers.is_empty() {
        return "-".to_string();
    }
    row.workers
        .iter()
        .map(|worker| worker.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn render_week_text(snapshot: &WindowSnapshot) -> String {
    let week = snapshot
        .displayed()
        .map_or_else(|| "-".to_string(), |index| index.to_string());
    let mut sections = Vec::new();

    let shared = registration_window(&snapshot.rows);
    match shared {
        Some(settings) => sections.push(format!(
            "week {week}  registration opens: {}  closes: {}",
            settings.registration_starts.as_deref().unwrap_or("-"),
            settings.registration_deadline.as_deref().unwrap_or("-")
        )),
        None => sections.push(format!("week {week}")),
    }

    let mut headers = vec!["DATE", "SLUG", "SHIFT", "WORKERS"];
    if shared.is_none() {
        headers.extend(["OPENS", "CLOSES"]);
    }
    let rows = group_by_date(&snapshot.rows)
        .into_iter()
        .flat_map(|(_, rows)| rows)
        .map(|row| {
            let mut cells = vec![
                row.date.clone(),
                row.slug.clone(),
                row.name.clone(),
                worker_names(row),
            ];
            if shared.is_none() {
                cells.push(row.settings.registration_starts.clone().unwrap_or_default());
                cells.push(row.settings.registration_deadline.clone().unwrap_or_default());
            }
            cells
        })
        .collect::<Vec<_>>();
    sections.push(render_text_table(&headers, &rows));
    sections.join("\n")
}

fn render_text_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut widths = headers
        .iter()
        .map(|header| header.chars().count())
        .collect::<Vec<_>>();

    for row in rows {
        for (index, cell) in row.iter().enumerate() {
            let width = cell.chars().count();
            if width > widths[index] {
                widths[index] = width;
            }
        }
    }

    let border = format!(
        "+{}+",
        widths
            .iter()
            .map(|width| "-".repeat(*width + 2))
            .collect::<Vec<_>>()
            .join("+")
    );

    let mut lines = Vec::new();
    lines.push(border.clone());
    lines.push(format!(
        "| {} |",
        headers
            .iter()
            .enumerate()
            .map(|(index, header)| format!("{header:<width$}", width = widths[index]))
            .collect::<Vec<_>>()
            .join(" | ")
    ));
    lines.push(border.clone());

    for row in rows {
        lines.push(format!(
            "| {} |",
            row.iter()
                .enumerate()
                .map(|(index, cell)| format!("{cell:<width$}", width = widths[index]))
                .collect::<Vec<_>>()
                .join(" | ")
        ));
    }

    lines.push(border);
    lines.join("\n")
}

fn week_json(snapshot: &WindowSnapshot, admin_path: &str) -> Value {
    json!({
        "week": snapshot.displayed(),
        "path": admin_path,
        "registration": registration_window(&snapshot.rows),
        "rows": snapshot.rows.iter().map(shift_row_json).collect::<Vec<_>>()
    })
}

fn shift_row_json(row: &ShiftRow) -> Value {
    json!({
        "id": row.id,
        "date": row.date,
        "slug": row.slug,
        "name": row.name,
        "order": row.order,
        "workers": row.workers,
        "settings": row.settings
    })
}

fn worker_json(worker: &Worker) -> Value {
    json!({
        "id": worker.id,
        "name": worker.name,
        "phone": worker.phone,
        "email": worker.email,
        "active": worker.active,
        "note": worker.note
    })
}

fn usage_error(code: &'static str, message: impl Into<String>) -> CliError {
    CliError {
        exit_code: 2,
        code,
        message: message.into(),
        details: None,
    }
}

fn not_found_error(code: &'static str, message: impl Into<String>) -> CliError {
    CliError {
        exit_code: 3,
        code,
        message: message.into(),
        details: None,
    }
}

fn conflict_error(
    code: &'static str,
    message: impl Into<String>,
    details: Option<Value>,
) -> CliError {
    CliError {
        exit_code: 4,
        code,
        message: message.into(),
        details,
    }
}

fn runtime_error(err: impl std::fmt::Display) -> CliError {
    CliError {
        exit_code: 5,
        code: "RUNTIME_ERROR",
        message: err.to_string(),
        details: None,
    }
}

fn api_error(err: ApiError) -> CliError {
    match &err {
        ApiError::Http { status: 404 } => not_found_error("NOT_FOUND", err.to_string()),
        ApiError::Rejected { status, .. } => conflict_error(
            "REQUEST_REJECTED",
            err.to_string(),
            Some(json!({ "status": status })),
        ),
        ApiError::InvalidCutoff(_) => conflict_error("INVALID_CUTOFF", err.to_string(), None),
        ApiError::Http { status } => CliError {
            exit_code: 5,
            code: "HTTP_ERROR",
            message: err.to_string(),
            details: Some(json!({ "status": status })),
        },
        ApiError::Transport(_) | ApiError::Decode { .. } | ApiError::InvalidCursor(_) => {
            runtime_error(&err)
        }
    }
}

fn schedule_error(err: ScheduleError) -> CliError {
    match err {
        ScheduleError::Busy => conflict_error("BUSY", err.to_string(), None),
        ScheduleError::UnknownShift(_) => not_found_error("SHIFT_NOT_FOUND", err.to_string()),
    }
}

fn worker_error(err: WorkerError) -> CliError {
    match err {
        WorkerError::UnknownWorker(_) => not_found_error("WORKER_NOT_FOUND", err.to_string()),
        WorkerError::InvalidImport(problems) => conflict_error(
            "IMPORT_REJECTED",
            format!("import rejected with {} problem(s)", problems.len()),
            Some(json!({ "problems": problems })),
        ),
        WorkerError::Api(err) => api_error(err),
    }
}

fn print_success(output: CommandOutput, json_output: bool, quiet: bool) {
    if json_output {
        let payload = json!({
            "schema_version": SCHEMA_VERSION,
            "command": output.command,
            "base_url": output.base_url,
            "data": output.data
        });
        match serde_json::to_string_pretty(&payload) {
            Ok(value) => println!("{value}"),
            Err(_) => println!("{}", payload),
        }
        return;
    }

    if quiet {
        return;
    }

    if output.text.is_empty() {
        println!("ok");
    } else {
        println!("{}", output.text);
    }
}

fn print_error(err: &CliError, json_output: bool) {
    error!(
        code = err.code,
        message = %err.message,
        details = ?err.details,
        "cli command failed"
    );

    if json_output {
        let payload = json!({
            "schema_version": SCHEMA_VERSION,
            "error": {
                "code": err.code,
                "message": err.message,
                "details": err.details
            }
        });
        match serde_json::to_string_pretty(&payload) {
            Ok(value) => eprintln!("{value}"),
            Err(_) => eprintln!("{}", payload),
        }
        return;
    }

    eprintln!("error[{}]: {}", err.code, err.message);
    if let Some(Value::Object(details)) = &err.details
        && let Some(Value::Array(problems)) = details.get("problems")
    {
        for problem in problems {
            if let Value::String(problem) = problem {
                eprintln!("  {problem}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ShiftSettings;
    use crate::window::{LoadedMarker, WindowPhase, WindowPosition};

    fn row(date: &str, slug: &str, deadline: Option<&str>, workers: &[&str]) -> ShiftRow {
        ShiftRow {
            id: None,
            date: date.to_string(),
            slug: slug.to_string(),
            name: slug.to_uppercase(),
            order: 0,
            workers: workers
                .iter()
                .enumerate()
                .map(|(id, name)| WorkerRef {
                    id: id as u64,
                    name: name.to_string(),
                })
                .collect(),
            settings: ShiftSettings {
                registration_starts: None,
                registration_deadline: deadline.map(str::to_string),
            },
        }
    }

    fn snapshot(rows: Vec<ShiftRow>) -> WindowSnapshot {
        let index = WeekIndex::new(2022, 5).expect("valid week");
        WindowSnapshot {
            position: WindowPosition { index, offset: 0 },
            loaded: Some(LoadedMarker { index, refresh: 0 }),
            refresh_generation: 0,
            phase: WindowPhase::Idle,
            rows,
            revision: 1,
        }
    }

    #[test]
    fn render_text_table_pads_columns() {
        let table = render_text_table(
            &["ID", "NAME"],
            &[vec!["1".to_string(), "Anna".to_string()]],
        );
        let lines = table.lines().collect::<Vec<_>>();

        assert_eq!(lines[0], "+----+------+");
        assert_eq!(lines[1], "| ID | NAME |");
        assert_eq!(lines[3], "| 1  | Anna |");
    }

    #[test]
    fn week_text_hoists_shared_registration_times() {
        let text = render_week_text(&snapshot(vec![
            row("2022-02-01", "dv", Some("fri 18:00"), &["Anna", "Bo"]),
            row("2022-02-01", "av", Some("fri 18:00"), &[]),
        ]));

        assert!(text.starts_with("week 2022w5  registration opens: -  closes: fri 18:00"));
        assert!(text.contains("Anna, Bo"));
        assert!(!text.contains("CLOSES"));
    }

    #[test]
    fn week_text_shows_per_shift_times_when_they_differ() {
        let text = render_week_text(&snapshot(vec![
            row("2022-02-01", "dv", Some("fri 18:00"), &[]),
            row("2022-02-02", "dv", Some("sat 18:00"), &[]),
        ]));

        assert!(text.starts_with("week 2022w5\n"));
        assert!(text.contains("CLOSES"));
        assert!(text.contains("sat 18:00"));
    }

    #[test]
    fn positions_are_one_based() {
        assert_eq!(one_based(1, "--position").expect("valid"), 0);
        let err = one_based(0, "--position").expect_err("zero is invalid");
        assert_eq!(err.exit_code, 2);
        assert_eq!(err.code, "INVALID_POSITION");
    }

    #[test]
    fn api_errors_map_to_exit_codes() {
        assert_eq!(api_error(ApiError::Http { status: 404 }).exit_code, 3);
        assert_eq!(api_error(ApiError::Http { status: 500 }).exit_code, 5);

        let rejected = api_error(ApiError::Rejected {
            status: 400,
            message: "Shift is full".to_string(),
        });
        assert_eq!(rejected.exit_code, 4);
        assert_eq!(rejected.message, "Shift is full");
    }

    #[test]
    fn rejected_import_lists_problems_in_details() {
        let err = worker_error(WorkerError::InvalidImport(vec![
            "line 1: a worker named `A` already exists".to_string(),
        ]));

        assert_eq!(err.exit_code, 4);
        assert_eq!(err.code, "IMPORT_REJECTED");
        assert_eq!(
            err.details,
            Some(json!({ "problems": ["line 1: a worker named `A` already exists"] }))
        );
    }

    #[test]
    fn plan_text_groups_days_under_weeks() {
        let weeks = crate::planner::group_into_weeks(&[
            row("2022-02-07", "dv", None, &["Anna"]),
            row("2022-02-07", "av", None, &[]),
        ]);

        assert_eq!(
            render_plan_text(&weeks),
            "week of 2022-02-07\n  2022-02-07: DV (1), AV"
        );
    }

    #[test]
    fn config_set_persists_only_named_fields() {
        let temp_dir = tempfile::TempDir::new().expect("temp dir");
        let path = temp_dir.path().join("shiftdesk").join("settings.toml");
        let args = ConfigSetArgs {
            base_url: Some("https://shifts.example/".to_string()),
            csrf_token: Some("tok".to_string()),
            start_week: Some(WeekIndex::new(2022, 5).expect("valid week")),
            rollback_on_failure: Some(true),
            ..ConfigSetArgs::default()
        };

        let output =
            execute_config_command(&path, ConfigCommand::Set(args)).expect("config set");
        assert_eq!(output.data["changed"], json!(true));
        assert_eq!(output.data["settings"]["csrf_token"], json!("<set>"));

        let saved = Settings::load_from_path(&path);
        assert_eq!(saved.base_url, "https://shifts.example");
        assert_eq!(saved.csrf_token.as_deref(), Some("tok"));
        assert_eq!(saved.start_week.as_deref(), Some("2022w5"));
        assert!(saved.rollback_on_failure);
        assert_eq!(saved.request_timeout_ms, Settings::default().request_timeout_ms);

        let cleared = ConfigSetArgs {
            csrf_token: Some("  ".to_string()),
            clear_start_week: true,
            ..ConfigSetArgs::default()
        };
        execute_config_command(&path, ConfigCommand::Set(cleared)).expect("config set");
        let saved = Settings::load_from_path(&path);
        assert_eq!(saved.csrf_token, None);
        assert_eq!(saved.start_week, None);
        assert_eq!(saved.base_url, "https://shifts.example");
    }

    #[test]
    fn config_set_rejects_non_http_base_url_without_writing() {
        let temp_dir = tempfile::TempDir::new().expect("temp dir");
        let path = temp_dir.path().join("settings.toml");
        let args = ConfigSetArgs {
            base_url: Some("ftp://nope".to_string()),
            ..ConfigSetArgs::default()
        };

        let err = execute_config_command(&path, ConfigCommand::Set(args))
            .err()
            .expect("invalid base URL should be rejected");

        assert_eq!(err.exit_code, 2);
        assert_eq!(err.code, "INVALID_BASE_URL");
        assert!(!path.exists());
    }

    #[test]
    fn weekday_parser_accepts_short_names() {
        assert_eq!(parse_weekday("fri"), Ok(Weekday::Friday));
        assert!(parse_weekday("someday").is_err());
    }
}
