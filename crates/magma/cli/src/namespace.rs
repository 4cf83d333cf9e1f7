//! Stored namespace commands.

use std::collections::BTreeMap;

use magma::{DocumentFile, load_config};
use magma_core::{NamespaceStore, StateDirs};

use crate::{GlobalArgs, colors};

fn open_store(globals: &GlobalArgs, document: &str) -> anyhow::Result<(DocumentFile, NamespaceStore)> {
    let doc = DocumentFile::open(document)?;
    let config = load_config(globals.config.as_deref(), globals.state_dir.as_deref(), &doc)?;
    let dirs = StateDirs::new(config.resolve_state_dir())?;
    Ok((doc, NamespaceStore::new(&dirs)))
}

/// Print the stored namespace of a document.
pub fn show(globals: &GlobalArgs, document: &str, json: bool) -> anyhow::Result<()> {
    let (doc, store) = open_store(globals, document)?;
    let namespace = store.load(&doc.id);

    if json {
        let variables: BTreeMap<&str, serde_json::Value> = namespace
            .variables
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str(),
                    serde_json::json!({
                        "type": value.type_name(),
                        "repr": value.repr(),
                    }),
                )
            })
            .collect();
        let output = serde_json::json!({
            "document": doc.id.as_str(),
            "path": store.path_for(&doc.id),
            "variables": variables,
            "imports": namespace.imports,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    if namespace.is_empty() {
        println!("{}No stored namespace for {}.{}", colors::YELLOW, doc.file_name(), colors::RESET);
        return Ok(());
    }

    println!("{}Namespace of {}{}", colors::BOLD, doc.file_name(), colors::RESET);
    println!("{}", "─".repeat(50));
    for line in &namespace.imports {
        println!("{}{}{}", colors::DIM, line, colors::RESET);
    }
    for (name, value) in &namespace.variables {
        println!(
            "{}{}{}: {}{}{} = {}",
            colors::CYAN,
            name,
            colors::RESET,
            colors::DIM,
            value.type_name(),
            colors::RESET,
            value.repr()
        );
    }
    Ok(())
}

/// Delete the stored namespace of a document.
pub fn reset(globals: &GlobalArgs, document: &str) -> anyhow::Result<()> {
    let (doc, store) = open_store(globals, document)?;
    store.delete(&doc.id)?;
    println!("{}Cleared{} namespace of {}", colors::GREEN, colors::RESET, doc.file_name());
    Ok(())
}
