//! `noetl register <file>`

use std::path::Path;

use serde_json::Value;

use noetl_core::{validate_playbook, Playbook};

use crate::client::NoetlClient;
use crate::error::CliError;
use crate::output::{emit, field, Format};

pub async fn run(
    client: &NoetlClient,
    format: Format,
    file: &Path,
    path: Option<String>,
    version: Option<i64>,
) -> Result<(), CliError> {
    let content = std::fs::read_to_string(file)
        .map_err(|e| CliError::User(format!("cannot read {}: {e}", file.display())))?;

    // Validate locally before the round-trip so authoring mistakes fail
    // fast with the validation exit code.
    let playbook =
        Playbook::from_yaml(&content).map_err(|e| CliError::Validation(e.to_string()))?;
    validate_playbook(&playbook).map_err(|e| CliError::Validation(e.to_string()))?;

    let catalog_path = path.unwrap_or_else(|| {
        file.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "playbook".to_string())
    });

    let response = client
        .register_playbook(&catalog_path, version, &content)
        .await?;

    emit(format, &response, |v| {
        format!(
            "registered {} version {}",
            field(v, "path"),
            v.get("version").and_then(Value::as_i64).unwrap_or(0)
        )
    });
    Ok(())
}
