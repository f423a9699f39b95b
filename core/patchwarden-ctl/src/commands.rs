//! Subcommand bodies. Output goes to the given writer so tests can capture it.

use std::io::Write;

use chrono::{DateTime, Utc};
use patchwarden_core::{PatchError, SettingsStore};
use serde::Serialize;

#[derive(Debug, Serialize)]
struct StatusReport {
    debug_log: bool,
    patches: Vec<PatchStatus>,
}

#[derive(Debug, Serialize)]
struct PatchStatus {
    id: String,
    active: bool,
    changed_at: DateTime<Utc>,
}

fn write_err(source: std::io::Error) -> PatchError {
    PatchError::Io {
        context: "write output".to_string(),
        source,
    }
}

pub fn status(
    settings: &dyn SettingsStore,
    json: bool,
    out: &mut impl Write,
) -> Result<(), PatchError> {
    let report = StatusReport {
        debug_log: settings.debug_log_enabled(),
        patches: settings
            .entries()
            .into_iter()
            .map(|(id, setting)| PatchStatus {
                id,
                active: setting.active,
                changed_at: setting.changed_at,
            })
            .collect(),
    };

    if json {
        let text = serde_json::to_string_pretty(&report).map_err(|source| PatchError::Json {
            context: "serialize status".to_string(),
            source,
        })?;
        writeln!(out, "{text}").map_err(write_err)?;
        return Ok(());
    }

    let debug = if report.debug_log { "on" } else { "off" };
    writeln!(out, "debug log: {debug}").map_err(write_err)?;
    if report.patches.is_empty() {
        writeln!(out, "no persisted patches").map_err(write_err)?;
        return Ok(());
    }

    let width = report
        .patches
        .iter()
        .map(|patch| patch.id.len())
        .max()
        .unwrap_or(0);
    for patch in &report.patches {
        let state = if patch.active { "active" } else { "inactive" };
        writeln!(
            out,
            "{:<width$}  {:<8}  {}",
            patch.id,
            state,
            patch.changed_at.format("%Y-%m-%d %H:%M:%S UTC"),
        )
        .map_err(write_err)?;
    }
    Ok(())
}

pub fn set_active(
    settings: &dyn SettingsStore,
    id: &str,
    active: bool,
    out: &mut impl Write,
) -> Result<(), PatchError> {
    settings.set_persisted_active(id, active)?;
    tracing::info!(id = %id, active, "Updated persisted patch flag");
    let state = if active { "active" } else { "inactive" };
    writeln!(out, "{id}: {state} on next start").map_err(write_err)
}

pub fn debug_log(
    settings: &dyn SettingsStore,
    enabled: bool,
    out: &mut impl Write,
) -> Result<(), PatchError> {
    settings.set_debug_log_enabled(enabled)?;
    let state = if enabled { "on" } else { "off" };
    writeln!(out, "debug log: {state}").map_err(write_err)
}

pub fn clear(
    settings: &dyn SettingsStore,
    reset_all: bool,
    out: &mut impl Write,
) -> Result<(), PatchError> {
    let count = settings.entries().len();
    settings.clear(reset_all)?;
    writeln!(out, "cleared {count} persisted patch flag(s)").map_err(write_err)
}

pub fn disable_all(settings: &dyn SettingsStore, out: &mut impl Write) -> Result<(), PatchError> {
    let mut count = 0;
    for (id, setting) in settings.entries() {
        if setting.active {
            settings.set_persisted_active(&id, false)?;
            count += 1;
        }
    }
    writeln!(out, "disabled {count} patch(es)").map_err(write_err)
}
