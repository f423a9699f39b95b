//! Built-in interception log forwarder.
//!
//! Hooks the backend's own file log so its diagnostics land in `tracing`.
//! The coordinator activates this patch before any other one whenever debug
//! logging is on, so nothing the backend logs while patching is lost.

use std::sync::Arc;

use tracing::Level;

use crate::interception::SlotHandle;
use crate::provider::PatchProvider;
use crate::types::MethodRef;
use crate::unit::{PatchUnit, StaticUnit};

pub const INTERCEPTION_LOG_PATCH_ID: &str = "patchwarden.interception-log";

/// Declaring type of the backend's file logger.
pub const FILE_LOG_TYPE: &str = "interception::FileLog";

/// Slot logic for single lines: `fn(&str) -> bool`.
pub type LineForwarder = fn(&str) -> bool;

/// Slot logic for buffered lines: `fn(&[String]) -> bool`.
pub type BufferForwarder = fn(&[String]) -> bool;

#[derive(Debug, Default)]
pub struct InterceptionLogPatch;

impl PatchProvider for InterceptionLogPatch {
    fn id(&self) -> &str {
        INTERCEPTION_LOG_PATCH_ID
    }

    fn display_name(&self) -> &str {
        "Interception log"
    }

    fn description(&self) -> Option<&str> {
        Some("Forwards the interception backend's debug log into the application log")
    }

    fn populate_units(&self, units: &mut Vec<Box<dyn PatchUnit>>) {
        units.push(
            StaticUnit::new("file-log-line")
                .target(MethodRef::new(FILE_LOG_TYPE, "log"))
                .before(SlotHandle::new(
                    "forward_log_line",
                    forward_log_line as LineForwarder,
                ))
                .boxed(),
        );
        units.push(
            StaticUnit::new("file-log-buffer")
                .target(MethodRef::new(FILE_LOG_TYPE, "flush_buffer"))
                .before(SlotHandle::new(
                    "forward_buffer",
                    forward_buffer as BufferForwarder,
                ))
                .boxed(),
        );
    }
}

fn interception_log_provider() -> Arc<dyn PatchProvider> {
    Arc::new(InterceptionLogPatch)
}

crate::register_provider!(interception_log_provider);

/// Forwards one backend log line. Returns false if the line was blank and
/// nothing was emitted.
pub fn forward_log_line(line: &str) -> bool {
    let text = line.trim_start_matches(|c: char| c == '#' || c.is_whitespace()).trim_end();
    if text.is_empty() {
        return false;
    }

    match split_level(text) {
        Some((level, message)) => emit(level, message),
        None => tracing::info!(target: "interception", "{text}"),
    }
    true
}

/// Forwards each buffered line; returns true if anything was emitted.
pub fn forward_buffer(lines: &[String]) -> bool {
    lines
        .iter()
        .fold(false, |emitted, line| forward_log_line(line) || emitted)
}

/// `"[WARN] text"` -> `(WARN, "text")`
fn split_level(text: &str) -> Option<(Level, &str)> {
    let rest = text.strip_prefix('[')?;
    let (tag, message) = rest.split_once(']')?;
    let level = match tag.trim().to_ascii_uppercase().as_str() {
        "ERROR" => Level::ERROR,
        "WARN" | "WARNING" => Level::WARN,
        "INFO" => Level::INFO,
        "DEBUG" => Level::DEBUG,
        "TRACE" => Level::TRACE,
        _ => return None,
    };
    Some((level, message.trim_start()))
}

fn emit(level: Level, message: &str) {
    match level {
        Level::ERROR => tracing::error!(target: "interception", "{message}"),
        Level::WARN => tracing::warn!(target: "interception", "{message}"),
        Level::INFO => tracing::info!(target: "interception", "{message}"),
        Level::DEBUG => tracing::debug!(target: "interception", "{message}"),
        _ => tracing::trace!(target: "interception", "{message}"),
    }
}
