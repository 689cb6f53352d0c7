use std::io::{BufRead, Write};

use anyhow::{Context, Result};
use petrahub_core::backend::Backend;
use petrahub_core::catalog::{
    DeleteStatus, delete_tool, get_tool_details, list_tools, update_tool_fields,
};
use petrahub_core::model::{EDITABLE_FIELDS, RelationKind, ToolDetails, ToolSummary};
use petrahub_core::options::{AddOutcome, add_option, list_options};
use petrahub_core::schema::RelationStore;

/// Line-oriented question/answer over any reader and writer.
pub struct Prompter<R, W> {
    input: R,
    output: W,
}

impl<R: BufRead, W: Write> Prompter<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    pub fn say(&mut self, line: &str) -> Result<()> {
        writeln!(self.output, "{line}").context("failed to write to terminal")
    }

    /// `None` once input is exhausted.
    pub fn ask(&mut self, prompt: &str) -> Result<Option<String>> {
        write!(self.output, "{prompt}").context("failed to write to terminal")?;
        self.output.flush().context("failed to flush terminal")?;
        let mut line = String::new();
        let read = self
            .input
            .read_line(&mut line)
            .context("failed to read from terminal")?;
        if read == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim().to_string()))
    }

    /// Only `yes` (any case) confirms.
    pub fn confirm(&mut self, prompt: &str) -> Result<bool> {
        Ok(self
            .ask(&format!("{prompt} (yes/no): "))?
            .is_some_and(|answer| answer.eq_ignore_ascii_case("yes")))
    }

    pub fn output(&mut self) -> &mut W {
        &mut self.output
    }

    #[cfg(test)]
    pub fn into_output(self) -> W {
        self.output
    }
}

pub fn run_tools_menu<R: BufRead, W: Write>(
    prompter: &mut Prompter<R, W>,
    backend: &mut dyn Backend,
    store: &dyn RelationStore,
) -> Result<()> {
    prompter.say("\nWelcome to the Tool Management System!")?;
    loop {
        prompter.say("\nTool Management Menu:")?;
        prompter.say("1. View all tools")?;
        prompter.say("2. View tool details")?;
        prompter.say("3. Edit tool")?;
        prompter.say("4. Delete tool")?;
        prompter.say("5. Exit")?;
        let Some(choice) = prompter.ask("Select an option (1-5): ")? else {
            break;
        };
        match choice.as_str() {
            "1" => {
                show_tools(prompter, backend)?;
            }
            "2" => {
                if let Some(tool) = pick_tool(prompter, backend, "view")? {
                    match get_tool_details(backend, store, &tool.id) {
                        Ok(Some(details)) => write_details(prompter.output(), &details)?,
                        Ok(None) => prompter.say("Tool no longer exists.")?,
                        Err(error) => prompter.say(&format!("Failed to load tool: {error:#}"))?,
                    }
                }
            }
            "3" => {
                if let Some(tool) = pick_tool(prompter, backend, "edit")? {
                    edit_tool(prompter, backend, store, &tool)?;
                }
            }
            "4" => {
                if let Some(tool) = pick_tool(prompter, backend, "delete")? {
                    remove_tool(prompter, backend, store, &tool)?;
                }
            }
            "5" => {
                prompter.say("Exiting...")?;
                break;
            }
            _ => prompter.say("Invalid option. Please try again.")?,
        }
    }
    Ok(())
}

pub fn run_terms_menu<R: BufRead, W: Write>(
    prompter: &mut Prompter<R, W>,
    backend: &mut dyn Backend,
    store: &dyn RelationStore,
) -> Result<()> {
    prompter.say("\nWelcome to the Term Management Tool!")?;
    loop {
        prompter.say("\nTerm Management Menu:")?;
        prompter.say("1. View all terms")?;
        prompter.say("2. Add a new term")?;
        prompter.say("3. Exit")?;
        let Some(choice) = prompter.ask("Select an option (1-3): ")? else {
            break;
        };
        match choice.as_str() {
            "1" => match list_options(backend, store, RelationKind::Topic) {
                Ok(terms) => write_numbered(prompter, "Existing terms", "No terms found.", &terms)?,
                Err(error) => prompter.say(&format!("Failed to list terms: {error:#}"))?,
            },
            "2" => {
                let Some(term) = prompter.ask("Enter the new term: ")? else {
                    break;
                };
                if term.is_empty() {
                    prompter.say("Term cannot be empty.")?;
                    continue;
                }
                match add_option(backend, store, RelationKind::Topic, &term) {
                    Ok(AddOutcome::Added) => {
                        prompter.say(&format!("Term \"{term}\" added successfully!"))?
                    }
                    Ok(AddOutcome::AlreadyExists) => {
                        prompter.say(&format!("Term \"{term}\" already exists."))?
                    }
                    Err(error) => prompter.say(&format!("Failed to add term: {error:#}"))?,
                }
            }
            "3" => {
                prompter.say("Exiting...")?;
                break;
            }
            _ => prompter.say("Invalid option. Please try again.")?,
        }
    }
    Ok(())
}

fn show_tools<R: BufRead, W: Write>(
    prompter: &mut Prompter<R, W>,
    backend: &mut dyn Backend,
) -> Result<Vec<ToolSummary>> {
    let tools = match list_tools(backend) {
        Ok(tools) => tools,
        Err(error) => {
            prompter.say(&format!("Failed to fetch tools: {error:#}"))?;
            return Ok(Vec::new());
        }
    };
    let lines: Vec<String> = tools
        .iter()
        .map(|tool| format!("{} (ID: {})", tool.name, tool.petrahubid))
        .collect();
    write_numbered(prompter, "Available Tools", "No tools found.", &lines)?;
    Ok(tools)
}

fn pick_tool<R: BufRead, W: Write>(
    prompter: &mut Prompter<R, W>,
    backend: &mut dyn Backend,
    verb: &str,
) -> Result<Option<ToolSummary>> {
    let mut tools = show_tools(prompter, backend)?;
    if tools.is_empty() {
        return Ok(None);
    }
    let Some(answer) = prompter.ask(&format!("Enter the number of the tool to {verb}: "))? else {
        return Ok(None);
    };
    match answer.parse::<usize>() {
        Ok(number) if (1..=tools.len()).contains(&number) => {
            Ok(Some(tools.swap_remove(number - 1)))
        }
        _ => {
            prompter.say("Invalid tool number.")?;
            Ok(None)
        }
    }
}

fn edit_tool<R: BufRead, W: Write>(
    prompter: &mut Prompter<R, W>,
    backend: &mut dyn Backend,
    store: &dyn RelationStore,
    tool: &ToolSummary,
) -> Result<()> {
    let back = EDITABLE_FIELDS.len() + 1;
    loop {
        let details = match get_tool_details(backend, store, &tool.id) {
            Ok(Some(details)) => details,
            Ok(None) => {
                prompter.say("Tool no longer exists.")?;
                return Ok(());
            }
            Err(error) => {
                prompter.say(&format!("Failed to load tool: {error:#}"))?;
                return Ok(());
            }
        };

        prompter.say("\nEdit Tool Menu:")?;
        for (index, field) in EDITABLE_FIELDS.iter().enumerate() {
            prompter.say(&format!("{}. Edit {}", index + 1, title_case(field)))?;
        }
        prompter.say(&format!("{back}. Return to Main Menu"))?;
        let Some(answer) = prompter.ask(&format!("Select an option (1-{back}): "))? else {
            return Ok(());
        };
        let option = match answer.parse::<usize>() {
            Ok(option) if (1..=back).contains(&option) => option,
            _ => {
                prompter.say("Invalid option. Please try again.")?;
                continue;
            }
        };
        if option == back {
            return Ok(());
        }

        let field = EDITABLE_FIELDS[option - 1];
        let current = details.tool.record.field(field).unwrap_or_default();
        let Some(value) = prompter.ask(&format!("Enter new {field} (current: {current}): "))? else {
            return Ok(());
        };
        if value.is_empty() {
            prompter.say("No changes made.")?;
            continue;
        }
        match update_tool_fields(backend, &tool.id, &[(field.to_string(), value)]) {
            Ok(_) => prompter.say(&format!("{field} updated successfully!"))?,
            Err(error) => prompter.say(&format!("Failed to update {field}: {error:#}"))?,
        }
    }
}

fn remove_tool<R: BufRead, W: Write>(
    prompter: &mut Prompter<R, W>,
    backend: &mut dyn Backend,
    store: &dyn RelationStore,
    tool: &ToolSummary,
) -> Result<()> {
    let prompt = format!(
        "Are you sure you want to delete \"{}\"? This cannot be undone.",
        tool.name
    );
    if !prompter.confirm(&prompt)? {
        return prompter.say("Deletion cancelled.");
    }
    match delete_tool(backend, store, &tool.petrahubid) {
        Ok(report) if report.status == DeleteStatus::Deleted => {
            for cleanup in report.relations.iter().filter(|cleanup| cleanup.error.is_some()) {
                prompter.say(&format!(
                    "Warning: could not clear {}: {}",
                    cleanup.table,
                    cleanup.error.as_deref().unwrap_or_default()
                ))?;
            }
            prompter.say(&format!("Tool \"{}\" deleted successfully!", tool.name))
        }
        Ok(_) => prompter.say(&format!("Tool \"{}\" was already gone.", tool.name)),
        Err(error) => prompter.say(&format!(
            "Failed to delete tool \"{}\": {error:#}",
            tool.name
        )),
    }
}

fn write_numbered<R: BufRead, W: Write>(
    prompter: &mut Prompter<R, W>,
    heading: &str,
    empty: &str,
    lines: &[String],
) -> Result<()> {
    prompter.say(&format!("\n{heading}:"))?;
    prompter.say("---------------")?;
    if lines.is_empty() {
        prompter.say(empty)?;
    }
    for (index, line) in lines.iter().enumerate() {
        prompter.say(&format!("{}. {line}", index + 1))?;
    }
    prompter.say("---------------")
}

/// Human-readable tool card used by the menu and `tools show`.
pub fn write_details<W: Write>(output: &mut W, details: &ToolDetails) -> Result<()> {
    let record = &details.tool.record;
    let mut lines = vec![
        "\nTool Details:".to_string(),
        "---------------".to_string(),
        format!("Name: {}", record.name),
        format!("ID: {}", record.petrahubid),
    ];
    for field in &EDITABLE_FIELDS[1..] {
        lines.push(format!(
            "{}: {}",
            title_case(field),
            record.field(field).unwrap_or("N/A")
        ));
    }
    for kind in RelationKind::ALL {
        let values = details.relation(kind);
        if values.is_empty() {
            continue;
        }
        lines.push(format!("\n{}:", kind.label()));
        for value in values {
            match &value.note {
                Some(note) => lines.push(format!("- {} ({note})", value.value)),
                None => lines.push(format!("- {}", value.value)),
            }
        }
    }
    lines.push("---------------".to_string());
    for line in lines {
        writeln!(output, "{line}").context("failed to write tool details")?;
    }
    Ok(())
}

fn title_case(field: &str) -> String {
    let mut chars = field.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use petrahub_core::catalog::{UpsertOptions, find_tool};
    use petrahub_core::memory::MemoryBackend;
    use petrahub_core::schema::{LegacyRelations, NormalizedRelations};
    use petrahub_core::seed::{sample_tools, seed_tools};

    use super::{Prompter, run_terms_menu, run_tools_menu};

    fn seeded_backend() -> MemoryBackend {
        let mut backend = MemoryBackend::normalized_schema();
        let tools = sample_tools().expect("sample");
        let report = seed_tools(
            &mut backend,
            &NormalizedRelations,
            &tools,
            &UpsertOptions::default(),
        );
        assert!(report.success());
        backend
    }

    fn run_tools(backend: &mut MemoryBackend, script: &str) -> String {
        let mut prompter = Prompter::new(script.as_bytes(), Vec::new());
        run_tools_menu(&mut prompter, backend, &NormalizedRelations).expect("menu");
        String::from_utf8(prompter.into_output()).expect("utf8")
    }

    #[test]
    fn listing_shows_tools_sorted_by_name() {
        let mut backend = seeded_backend();
        let output = run_tools(&mut backend, "1\n5\n");
        assert!(output.contains("1. GeoThermo (ID: geothermo)"));
        assert!(output.contains("2. PetroSim (ID: petrosim)"));
        assert!(output.ends_with("Exiting...\n"));
    }

    #[test]
    fn details_include_relations_and_notes() {
        let mut backend = seeded_backend();
        let output = run_tools(&mut backend, "2\n2\n5\n");
        assert!(output.contains("Name: PetroSim"));
        assert!(output.contains("Documentation: N/A"));
        assert!(output.contains("Operating Systems:"));
        assert!(output.contains("- Modelling (Phase equilibria modeling)"));
    }

    #[test]
    fn edit_updates_selected_field() {
        let mut backend = seeded_backend();
        let output = run_tools(&mut backend, "3\n2\n8\nApache-2.0\n12\n5\n");
        assert!(output.contains("Enter new license (current: MIT): "));
        assert!(output.contains("license updated successfully!"));
        let tool = find_tool(&mut backend, "petrosim").unwrap().expect("tool");
        assert_eq!(tool.record.license.as_deref(), Some("Apache-2.0"));
    }

    #[test]
    fn delete_requires_literal_yes() {
        let mut backend = seeded_backend();
        let output = run_tools(&mut backend, "4\n1\nno\n5\n");
        assert!(output.contains("Deletion cancelled."));
        assert_eq!(backend.rows("tools").len(), 2);

        let output = run_tools(&mut backend, "4\n1\nyes\n5\n");
        assert!(output.contains("Tool \"GeoThermo\" deleted successfully!"));
        assert_eq!(backend.rows("tools").len(), 1);
        assert!(backend.rows("tool_petrology_terms").is_empty());
    }

    #[test]
    fn invalid_input_and_end_of_input_are_handled() {
        let mut backend = seeded_backend();
        let output = run_tools(&mut backend, "9\n2\n42\n");
        assert!(output.contains("Invalid option. Please try again."));
        assert!(output.contains("Invalid tool number."));
    }

    #[test]
    fn terms_menu_adds_each_term_once() {
        let mut backend = MemoryBackend::legacy_schema();
        let mut prompter = Prompter::new(
            "2\nGeochemistry\n2\nGeochemistry\n2\n\n1\n3\n".as_bytes(),
            Vec::new(),
        );
        run_terms_menu(&mut prompter, &mut backend, &LegacyRelations).expect("menu");
        let output = String::from_utf8(prompter.into_output()).expect("utf8");

        assert!(output.contains("Term \"Geochemistry\" added successfully!"));
        assert!(output.contains("Term \"Geochemistry\" already exists."));
        assert!(output.contains("Term cannot be empty."));
        assert!(output.contains("1. Geochemistry"));
        assert_eq!(backend.rows("topics").len(), 1);
    }

    #[test]
    fn confirm_accepts_only_yes() {
        let mut prompter = Prompter::new("YES\ny\n".as_bytes(), Vec::new());
        assert!(prompter.confirm("Proceed?").unwrap());
        assert!(!prompter.confirm("Proceed?").unwrap());
        assert!(!prompter.confirm("Proceed?").unwrap());
    }
}
