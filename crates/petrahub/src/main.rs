mod menu;

use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use petrahub_core::backend::Backend;
use petrahub_core::catalog::{
    DeleteReport, UpsertOptions, UpsertReport, delete_tool, find_tool, get_tool_details,
    list_tools, sample_tool_columns, test_connection, update_tool_fields,
};
use petrahub_core::config::{BackendSettings, load_config, resolve_backend_settings};
use petrahub_core::migrate::{NORMALIZED_SCHEMA_SQL, missing_required_tables, run_migration};
use petrahub_core::model::RelationKind;
use petrahub_core::options::{AddOutcome, add_option, list_options};
use petrahub_core::postgrest::RestClient;
use petrahub_core::runtime::{PathOverrides, ResolutionContext, ResolvedPaths, resolve_paths};
use petrahub_core::schema::{
    RelationStore, SchemaGeneration, SchemaMode, check_table, resolve_generation, store_for,
};
use petrahub_core::seed::{load_seed_file, sample_tools, seed_tools, unseed_tools};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use crate::menu::{Prompter, run_terms_menu, run_tools_menu, write_details};

#[derive(Debug, Parser)]
#[command(
    name = "petrahub",
    version,
    about = "Maintenance CLI for the petrahub tool catalog"
)]
struct Cli {
    #[arg(long, global = true, value_name = "PATH")]
    project_root: Option<PathBuf>,
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,
    #[arg(
        long,
        global = true,
        value_name = "MODE",
        help = "Schema generation: auto, legacy or normalized"
    )]
    schema: Option<String>,
    #[arg(long, global = true, help = "Print resolved runtime diagnostics")]
    diagnostics: bool,
    #[arg(short, long, global = true, help = "Enable debug logging")]
    verbose: bool,
    #[arg(long, global = true, help = "Print reports as JSON")]
    json: bool,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone)]
struct RuntimeOptions {
    project_root: Option<PathBuf>,
    config: Option<PathBuf>,
    schema: Option<SchemaMode>,
    diagnostics: bool,
    json: bool,
}

impl RuntimeOptions {
    fn from_cli(cli: &Cli) -> Result<Self> {
        let schema = cli
            .schema
            .as_deref()
            .map(str::parse::<SchemaMode>)
            .transpose()?;
        Ok(Self {
            project_root: cli.project_root.clone(),
            config: cli.config.clone(),
            schema,
            diagnostics: cli.diagnostics,
            json: cli.json,
        })
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Test the connection and report schema generation and table shapes")]
    Check,
    Tools(ToolsArgs),
    Terms(TermsArgs),
    Options(OptionsArgs),
    #[command(about = "Upsert the sample tools (or a seed file)")]
    Seed(SeedArgs),
    #[command(about = "Delete every tool listed in the seed set")]
    Unseed(UnseedArgs),
    #[command(about = "Copy legacy relation data into the normalized tables")]
    Migrate(MigrateArgs),
}

#[derive(Debug, Args)]
struct ToolsArgs {
    #[command(subcommand)]
    command: ToolsSubcommand,
}

#[derive(Debug, Subcommand)]
enum ToolsSubcommand {
    List,
    Show {
        petrahubid: String,
    },
    Edit {
        petrahubid: String,
        #[arg(long = "set", value_name = "FIELD=VALUE", required = true)]
        set: Vec<String>,
    },
    Delete {
        petrahubid: String,
        #[arg(long, help = "Skip the confirmation prompt")]
        yes: bool,
    },
    #[command(about = "Interactive tool management menu")]
    Manage,
}

#[derive(Debug, Args)]
struct TermsArgs {
    #[command(subcommand)]
    command: TermsSubcommand,
}

#[derive(Debug, Subcommand)]
enum TermsSubcommand {
    List,
    Add {
        term: String,
    },
    #[command(about = "Interactive term management menu")]
    Manage,
}

#[derive(Debug, Args)]
struct OptionsArgs {
    #[command(subcommand)]
    command: OptionsSubcommand,
}

#[derive(Debug, Subcommand)]
enum OptionsSubcommand {
    List {
        #[arg(value_name = "TYPE")]
        kind: String,
    },
    Add {
        #[arg(value_name = "TYPE")]
        kind: String,
        value: String,
    },
}

#[derive(Debug, Args)]
struct SeedArgs {
    #[arg(long, value_name = "PATH", help = "JSON file with one tool or an array of tools")]
    file: Option<PathBuf>,
    #[arg(long, help = "Leave tools that already exist untouched")]
    skip_updates: bool,
    #[arg(
        long,
        num_args = 2,
        value_names = ["TYPE", "VALUE"],
        help = "Only add one option value (e.g. --add-entity os Linux)"
    )]
    add_entity: Option<Vec<String>>,
}

#[derive(Debug, Args)]
struct UnseedArgs {
    #[arg(long, value_name = "PATH")]
    file: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct MigrateArgs {
    #[arg(long, help = "Skip the confirmation prompt")]
    yes: bool,
    #[arg(long, help = "Print the normalized schema SQL and exit")]
    print_sql: bool,
}

/// Connected backend plus the relation strategy chosen for this run.
struct Session {
    backend: RestClient,
    store: Box<dyn RelationStore>,
    generation: SchemaGeneration,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose)?;
    let runtime = RuntimeOptions::from_cli(&cli)?;

    match cli.command {
        Some(Commands::Check) => run_check(&runtime),
        Some(Commands::Tools(ToolsArgs { command })) => match command {
            ToolsSubcommand::List => run_tools_list(&runtime),
            ToolsSubcommand::Show { petrahubid } => run_tools_show(&runtime, &petrahubid),
            ToolsSubcommand::Edit { petrahubid, set } => {
                run_tools_edit(&runtime, &petrahubid, &set)
            }
            ToolsSubcommand::Delete { petrahubid, yes } => {
                run_tools_delete(&runtime, &petrahubid, yes)
            }
            ToolsSubcommand::Manage => run_tools_manage(&runtime),
        },
        Some(Commands::Terms(TermsArgs { command })) => match command {
            TermsSubcommand::List => run_options_list(&runtime, RelationKind::Topic),
            TermsSubcommand::Add { term } => run_options_add(&runtime, RelationKind::Topic, &term),
            TermsSubcommand::Manage => run_terms_manage(&runtime),
        },
        Some(Commands::Options(OptionsArgs { command })) => match command {
            OptionsSubcommand::List { kind } => run_options_list(&runtime, kind.parse()?),
            OptionsSubcommand::Add { kind, value } => {
                run_options_add(&runtime, kind.parse()?, &value)
            }
        },
        Some(Commands::Seed(args)) => run_seed(&runtime, args),
        Some(Commands::Unseed(args)) => run_unseed(&runtime, args),
        Some(Commands::Migrate(args)) => run_migrate(&runtime, args),
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn init_tracing(verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(verbose)
        .compact()
        .try_init()
        .map_err(|err| anyhow!(err))
}

#[derive(Debug, Serialize)]
struct TableState {
    table: &'static str,
    available: bool,
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct CheckReport {
    schema: SchemaGeneration,
    tool_columns: Option<Vec<String>>,
    tables: Vec<TableState>,
    request_count: usize,
}

fn check_report(backend: &mut dyn Backend, store: &dyn RelationStore) -> Result<CheckReport> {
    let tool_columns = sample_tool_columns(backend)?;
    let tables = RelationKind::ALL
        .into_iter()
        .map(|kind| {
            let table = store.relation_table(kind);
            let error = check_table(backend, table).err().map(|error| error.to_string());
            TableState {
                table,
                available: error.is_none(),
                error,
            }
        })
        .collect();
    Ok(CheckReport {
        schema: store.generation(),
        tool_columns,
        tables,
        request_count: backend.request_count(),
    })
}

fn run_check(runtime: &RuntimeOptions) -> Result<()> {
    let mut session = open_session(runtime)?;
    let report = check_report(&mut session.backend, session.store.as_ref())?;
    if runtime.json {
        return print_json(&report);
    }

    println!("check");
    println!("connection: ok");
    println!("schema: {}", report.schema.as_str());
    match &report.tool_columns {
        Some(columns) => println!("tools.columns: {}", columns.join(", ")),
        None => println!("tools.columns: <no rows>"),
    }
    for state in &report.tables {
        match &state.error {
            None => println!("tables.{}: ok", state.table),
            Some(error) => println!("tables.{}: unavailable ({error})", state.table),
        }
    }
    if report.schema == SchemaGeneration::Legacy {
        println!("hint: normalized tables not in use; run `petrahub migrate` to copy legacy data");
    }
    println!("requests: {}", report.request_count);
    Ok(())
}

fn run_tools_list(runtime: &RuntimeOptions) -> Result<()> {
    let mut session = open_session(runtime)?;
    let tools = list_tools(&mut session.backend)?;
    if runtime.json {
        return print_json(&tools);
    }

    println!("tools list");
    println!("tools.count: {}", tools.len());
    if tools.is_empty() {
        println!("tools: <none>");
    }
    for tool in &tools {
        println!("tools.item: {} ({})", tool.name, tool.petrahubid);
    }
    print_request_count(&session);
    Ok(())
}

fn run_tools_show(runtime: &RuntimeOptions, petrahubid: &str) -> Result<()> {
    let mut session = open_session(runtime)?;
    let Some(tool) = find_tool(&mut session.backend, petrahubid)? else {
        bail!("tool `{petrahubid}` not found");
    };
    let Some(details) = get_tool_details(&mut session.backend, session.store.as_ref(), &tool.id)?
    else {
        bail!("tool `{petrahubid}` disappeared while loading");
    };
    if runtime.json {
        return print_json(&details);
    }
    let mut stdout = io::stdout().lock();
    write_details(&mut stdout, &details)?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct EditReport {
    petrahubid: String,
    fields: Vec<String>,
    rows_updated: usize,
    request_count: usize,
}

fn parse_assignments(assignments: &[String]) -> Result<Vec<(String, String)>> {
    assignments
        .iter()
        .map(|assignment| {
            let (field, value) = assignment
                .split_once('=')
                .ok_or_else(|| anyhow!("expected FIELD=VALUE, got `{assignment}`"))?;
            Ok((field.trim().to_string(), value.to_string()))
        })
        .collect()
}

fn run_tools_edit(
    runtime: &RuntimeOptions,
    petrahubid: &str,
    assignments: &[String],
) -> Result<()> {
    let changes = parse_assignments(assignments)?;

    let mut session = open_session(runtime)?;
    let Some(tool) = find_tool(&mut session.backend, petrahubid)? else {
        bail!("tool `{petrahubid}` not found");
    };
    let rows_updated = update_tool_fields(&mut session.backend, &tool.id, &changes)?;
    let report = EditReport {
        petrahubid: petrahubid.to_string(),
        fields: changes.into_iter().map(|(field, _)| field).collect(),
        rows_updated,
        request_count: session.backend.request_count(),
    };
    if runtime.json {
        return print_json(&report);
    }

    println!("tools edit");
    println!("tool: {}", report.petrahubid);
    for field in &report.fields {
        println!("updated.field: {field}");
    }
    println!("rows_updated: {}", report.rows_updated);
    println!("requests: {}", report.request_count);
    Ok(())
}

fn run_tools_delete(runtime: &RuntimeOptions, petrahubid: &str, yes: bool) -> Result<()> {
    let mut session = open_session(runtime)?;
    if !yes {
        let stdin = io::stdin();
        let mut prompter = Prompter::new(stdin.lock(), io::stdout());
        let prompt =
            format!("Are you sure you want to delete `{petrahubid}`? This cannot be undone.");
        if !prompter.confirm(&prompt)? {
            println!("Deletion cancelled.");
            return Ok(());
        }
    }
    let report = delete_tool(&mut session.backend, session.store.as_ref(), petrahubid)?;
    print_delete_report(runtime, &report)?;
    print_request_count(&session);
    if report.relation_errors() > 0 {
        bail!(
            "tool `{petrahubid}` deleted but {} relation table(s) could not be cleared",
            report.relation_errors()
        );
    }
    Ok(())
}

fn run_tools_manage(runtime: &RuntimeOptions) -> Result<()> {
    let mut session = open_session(runtime)?;
    let stdin = io::stdin();
    let mut prompter = Prompter::new(stdin.lock(), io::stdout());
    run_tools_menu(&mut prompter, &mut session.backend, session.store.as_ref())
}

fn run_terms_manage(runtime: &RuntimeOptions) -> Result<()> {
    let mut session = open_session(runtime)?;
    let stdin = io::stdin();
    let mut prompter = Prompter::new(stdin.lock(), io::stdout());
    run_terms_menu(&mut prompter, &mut session.backend, session.store.as_ref())
}

fn run_options_list(runtime: &RuntimeOptions, kind: RelationKind) -> Result<()> {
    let mut session = open_session(runtime)?;
    let values = list_options(&mut session.backend, session.store.as_ref(), kind)?;
    if runtime.json {
        return print_json(&values);
    }

    println!("options list");
    println!("kind: {kind}");
    println!("schema: {}", session.generation.as_str());
    println!("values.count: {}", values.len());
    for value in &values {
        println!("values.item: {value}");
    }
    print_request_count(&session);
    Ok(())
}

#[derive(Debug, Serialize)]
struct OptionAddReport {
    kind: RelationKind,
    value: String,
    result: AddOutcome,
    request_count: usize,
}

fn option_add_report(
    backend: &mut dyn Backend,
    store: &dyn RelationStore,
    kind: RelationKind,
    value: &str,
) -> Result<OptionAddReport> {
    let result = add_option(backend, store, kind, value)?;
    Ok(OptionAddReport {
        kind,
        value: value.trim().to_string(),
        result,
        request_count: backend.request_count(),
    })
}

fn run_options_add(runtime: &RuntimeOptions, kind: RelationKind, value: &str) -> Result<()> {
    let mut session = open_session(runtime)?;
    let report = option_add_report(&mut session.backend, session.store.as_ref(), kind, value)?;
    if runtime.json {
        return print_json(&report);
    }

    println!("options add");
    println!("kind: {}", report.kind);
    println!("value: {}", report.value);
    println!(
        "result: {}",
        match report.result {
            AddOutcome::Added => "added",
            AddOutcome::AlreadyExists => "already exists",
        }
    );
    println!("requests: {}", report.request_count);
    Ok(())
}

fn run_seed(runtime: &RuntimeOptions, args: SeedArgs) -> Result<()> {
    if let Some(entity) = args.add_entity {
        let [kind, value] = entity.as_slice() else {
            bail!("--add-entity expects TYPE VALUE");
        };
        return run_options_add(runtime, kind.parse()?, value);
    }

    let tools = match &args.file {
        Some(path) => load_seed_file(path)?,
        None => sample_tools()?,
    };
    let mut session = open_session(runtime)?;
    let report = seed_tools(
        &mut session.backend,
        session.store.as_ref(),
        &tools,
        &UpsertOptions {
            skip_updates: args.skip_updates,
        },
    );
    if runtime.json {
        print_json(&report)?;
    } else {
        println!("seed");
        println!("tools.requested: {}", tools.len());
        for upsert in &report.upserts {
            print_upsert_report(upsert);
        }
        for failure in &report.failures {
            println!("failed.{}: {}", failure.petrahubid, failure.error);
        }
        print_request_count(&session);
    }
    if !report.success() {
        bail!("seeding finished with errors");
    }
    Ok(())
}

fn run_unseed(runtime: &RuntimeOptions, args: UnseedArgs) -> Result<()> {
    let tools = match &args.file {
        Some(path) => load_seed_file(path)?,
        None => sample_tools()?,
    };
    let mut session = open_session(runtime)?;
    let report = unseed_tools(&mut session.backend, session.store.as_ref(), &tools);
    if runtime.json {
        print_json(&report)?;
    } else {
        println!("unseed");
        for delete in &report.deletes {
            print_delete_report(runtime, delete)?;
        }
        for failure in &report.failures {
            println!("failed.{}: {}", failure.petrahubid, failure.error);
        }
        print_request_count(&session);
    }
    if !report.success() {
        bail!("unseed finished with errors");
    }
    Ok(())
}

fn run_migrate(runtime: &RuntimeOptions, args: MigrateArgs) -> Result<()> {
    if args.print_sql {
        println!("{NORMALIZED_SCHEMA_SQL}");
        return Ok(());
    }

    let mut session = open_session(runtime)?;
    let missing = missing_required_tables(&mut session.backend);
    if !missing.is_empty() {
        println!("migrate");
        println!("missing_tables: {}", missing.join(", "));
        println!(
            "Run the following SQL in the Supabase SQL editor, then rerun `petrahub migrate`:\n"
        );
        println!("{NORMALIZED_SCHEMA_SQL}");
        bail!("normalized tables are not ready; migration aborted");
    }

    if !args.yes {
        println!("This copies legacy relation rows into the normalized tables.");
        println!(
            "WARNING: this is a one-way operation. Make sure you have a backup of your database."
        );
        let stdin = io::stdin();
        let mut prompter = Prompter::new(stdin.lock(), io::stdout());
        if !prompter.confirm("Do you want to proceed?")? {
            println!("Migration cancelled.");
            return Ok(());
        }
    }

    let report = run_migration(&mut session.backend);
    if runtime.json {
        print_json(&report)?;
    } else {
        println!("migrate");
        for step in &report.steps {
            println!("step.{}.source_rows: {}", step.name, step.source_rows);
            println!("step.{}.unique_values: {}", step.name, step.unique_values);
            println!("step.{}.values_inserted: {}", step.name, step.values_inserted);
            if step.relations_created > 0 || step.relations_existing > 0 {
                println!("step.{}.relations_created: {}", step.name, step.relations_created);
                println!("step.{}.relations_existing: {}", step.name, step.relations_existing);
            }
            for error in &step.errors {
                println!("step.{}.error: {error}", step.name);
            }
        }
        println!("row_errors: {}", report.row_errors());
        println!("requests: {}", report.request_count);
    }

    if let Some(step) = &report.failed_step {
        bail!(
            "failed to migrate {step}: {}. Some data may have been migrated.",
            report.failure.as_deref().unwrap_or("unknown error")
        );
    }
    if !runtime.json {
        println!(
            "Migration completed. The legacy tables were kept; drop them manually after verifying."
        );
    }
    Ok(())
}

fn print_upsert_report(report: &UpsertReport) {
    println!("tool: {} ({})", report.petrahubid, report.action.as_str());
    println!("tool.{}.id: {}", report.petrahubid, report.tool_id);
    for category in &report.categories {
        println!(
            "tool.{}.{}: {}/{} written",
            report.petrahubid, category.kind, category.inserted, category.requested
        );
        if let Some(error) = &category.clear_error {
            println!("tool.{}.{}.clear_error: {error}", report.petrahubid, category.kind);
        }
        if let Some(error) = &category.error {
            println!("tool.{}.{}.error: {error}", report.petrahubid, category.kind);
        }
    }
    if report.stale_relations_possible() {
        println!(
            "warning: old relation rows of {} could not be cleared and may now be duplicated",
            report.petrahubid
        );
    }
}

fn print_delete_report(runtime: &RuntimeOptions, report: &DeleteReport) -> Result<()> {
    if runtime.json {
        return print_json(report);
    }
    println!(
        "deleted.{}: {}",
        report.petrahubid,
        if report.tool_id.is_some() {
            "yes"
        } else {
            "not found"
        }
    );
    for cleanup in &report.relations {
        match &cleanup.error {
            Some(error) => println!(
                "deleted.{}.{}: error ({error})",
                report.petrahubid, cleanup.table
            ),
            None => println!(
                "deleted.{}.{}: {}",
                report.petrahubid, cleanup.table, cleanup.deleted
            ),
        }
    }
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value).context("failed to render JSON")?;
    let mut stdout = io::stdout().lock();
    writeln!(stdout, "{rendered}").context("failed to write JSON")
}

fn print_request_count(session: &Session) {
    println!("requests: {}", session.backend.request_count());
}

fn open_session(runtime: &RuntimeOptions) -> Result<Session> {
    let paths = resolve_runtime_paths(runtime)?;
    let config = load_config(&paths.config_path)?;
    let mut settings = resolve_backend_settings(&config)?;
    if let Some(mode) = runtime.schema {
        settings.schema = mode;
    }
    if runtime.diagnostics {
        print_diagnostics(&paths, &settings);
    }

    let mut backend = RestClient::new(settings.clone())
        .with_context(|| format!("failed to build client for {}", settings.url))?;
    test_connection(&mut backend).context("database connection failed")?;
    let generation = resolve_generation(&mut backend, settings.schema);
    tracing::info!(
        schema = generation.as_str(),
        mode = settings.schema.as_str(),
        "selected relation strategy"
    );

    Ok(Session {
        backend,
        store: store_for(generation),
        generation,
    })
}

fn print_diagnostics(paths: &ResolvedPaths, settings: &BackendSettings) {
    eprintln!("[diagnostics]\n{}\n{}", paths.diagnostics(), settings.diagnostics());
}

fn resolve_runtime_paths(runtime: &RuntimeOptions) -> Result<ResolvedPaths> {
    dotenvy::dotenv().ok();

    let context = ResolutionContext::from_process()?;
    let overrides = PathOverrides {
        project_root: runtime.project_root.clone(),
        config: runtime.config.clone(),
    };

    let initial = resolve_paths(&context, &overrides)?;
    if initial.env_path.exists() {
        let _ = dotenvy::from_path_override(&initial.env_path);
    }

    resolve_paths(&context, &overrides)
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use petrahub_core::memory::MemoryBackend;
    use petrahub_core::model::RelationKind;
    use petrahub_core::schema::{LegacyRelations, NormalizedRelations, SchemaMode};
    use serde_json::json;

    use super::{
        Cli, Commands, RuntimeOptions, SeedArgs, ToolsSubcommand, check_report, option_add_report,
        parse_assignments,
    };

    #[test]
    fn add_entity_takes_type_and_value() {
        let cli = Cli::parse_from(["petrahub", "seed", "--add-entity", "os", "Linux"]);
        match cli.command {
            Some(Commands::Seed(SeedArgs { add_entity, .. })) => {
                assert_eq!(add_entity, Some(vec!["os".to_string(), "Linux".to_string()]));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn global_flags_work_after_subcommand() {
        let cli = Cli::parse_from(["petrahub", "tools", "list", "--schema", "legacy", "--json"]);
        let runtime = RuntimeOptions::from_cli(&cli).expect("runtime");
        assert_eq!(runtime.schema, Some(SchemaMode::Legacy));
        assert!(runtime.json);
    }

    #[test]
    fn edit_requires_assignments() {
        assert!(Cli::try_parse_from(["petrahub", "tools", "edit", "petrosim"]).is_err());
        let cli = Cli::parse_from([
            "petrahub", "tools", "edit", "petrosim", "--set", "license=MIT",
        ]);
        match cli.command {
            Some(Commands::Tools(args)) => match args.command {
                ToolsSubcommand::Edit { set, .. } => assert_eq!(set, vec!["license=MIT"]),
                other => panic!("unexpected subcommand: {other:?}"),
            },
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn unknown_schema_mode_is_rejected() {
        let cli = Cli::parse_from(["petrahub", "check", "--schema", "sideways"]);
        assert!(RuntimeOptions::from_cli(&cli).is_err());
    }

    #[test]
    fn check_report_serializes_table_states() {
        let mut backend = MemoryBackend::legacy_schema();
        backend.drop_table("languages");
        let report = check_report(&mut backend, &LegacyRelations).expect("check");

        let value = serde_json::to_value(&report).expect("json");
        assert_eq!(value["schema"], json!("legacy"));
        assert_eq!(value["tool_columns"], json!(null));
        let tables = value["tables"].as_array().expect("tables");
        assert_eq!(tables.len(), RelationKind::ALL.len());
        let languages = tables
            .iter()
            .find(|state| state["table"] == json!("languages"))
            .expect("languages entry");
        assert_eq!(languages["available"], json!(false));
        assert!(languages["error"].as_str().is_some_and(|error| error.contains("languages")));
        assert_eq!(tables[0]["available"], json!(true));
    }

    #[test]
    fn option_add_report_carries_the_outcome() {
        let mut backend = MemoryBackend::normalized_schema();
        let first = option_add_report(
            &mut backend,
            &NormalizedRelations,
            RelationKind::OperatingSystem,
            " Linux ",
        )
        .expect("add");
        let value = serde_json::to_value(&first).expect("json");
        assert_eq!(value["kind"], json!("operating_system"));
        assert_eq!(value["value"], json!("Linux"));
        assert_eq!(value["result"], json!("added"));

        let again = option_add_report(
            &mut backend,
            &NormalizedRelations,
            RelationKind::OperatingSystem,
            "Linux",
        )
        .expect("add again");
        assert_eq!(
            serde_json::to_value(&again).expect("json")["result"],
            json!("already_exists")
        );
    }

    #[test]
    fn assignments_split_on_the_first_equals_sign() {
        let parsed = parse_assignments(&["license=MIT".to_string(), "citation=a=b".to_string()])
            .expect("parse");
        assert_eq!(parsed[1], ("citation".to_string(), "a=b".to_string()));
        assert!(parse_assignments(&["license".to_string()]).is_err());
    }
}
