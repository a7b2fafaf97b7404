//! The fixed, ordered list of diagnostic steps run against every host.

use serde::Serialize;

/// Placeholder substituted with the run-scoped output directory.
pub const OUTPUT_DIR_TOKEN: &str = "{output_dir}";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiagnosticStep {
    /// 1-based position in the catalog
    pub ordinal: usize,
    pub name: String,
    pub command_line: String,
    pub description: String,
    /// Only the log export leaves files behind
    pub produces_artifacts: bool,
}

impl DiagnosticStep {
    /// Command line with `{output_dir}` replaced.
    pub fn render(&self, output_dir: &str) -> String {
        self.command_line.replace(OUTPUT_DIR_TOKEN, output_dir)
    }
}

/// Builds the three-step catalog for the given agent binary.
pub fn catalog(tool_path: &str) -> Vec<DiagnosticStep> {
    let tool = quote_if_needed(tool_path);
    vec![
        DiagnosticStep {
            ordinal: 1,
            name: "Status".to_string(),
            command_line: format!("{} show", tool),
            description: "Agent status, version and connection state".to_string(),
            produces_artifacts: false,
        },
        DiagnosticStep {
            ordinal: 2,
            name: "Health check".to_string(),
            command_line: format!("{} check", tool),
            description: "Connectivity check against required service endpoints".to_string(),
            produces_artifacts: false,
        },
        DiagnosticStep {
            ordinal: 3,
            name: "Log export".to_string(),
            command_line: format!("{} logs --full --output \"{}\"", tool, OUTPUT_DIR_TOKEN),
            description: "Full log archive for support analysis".to_string(),
            produces_artifacts: true,
        },
    ]
}

/// Base name of the agent binary, used to look for its running process.
pub fn tool_process_name(tool_path: &str) -> String {
    let base = tool_path
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(tool_path)
        .trim();
    base.strip_suffix(".exe").unwrap_or(base).to_string()
}

fn quote_if_needed(path: &str) -> String {
    if path.contains(char::is_whitespace) && !path.starts_with('"') {
        format!("\"{}\"", path)
    } else {
        path.to_string()
    }
}
