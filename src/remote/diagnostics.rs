//! Remediation hints for failed diagnostic steps.

/// Explains a failed step and suggests what the operator should check.
///
/// The first line is a one-sentence summary suitable for a result's error
/// field; the remaining lines are troubleshooting suggestions.
pub fn diagnose_step_failure(
    exit_code: i32,
    output: &str,
    command: &str,
    host: &str,
    is_local: bool,
) -> String {
    let combined = output.to_lowercase();
    let tool = extract_command_name(command);
    let mut suggestions = Vec::new();

    let summary = if exit_code == 127
        || combined.contains("command not found")
        || combined.contains("is not recognized as an internal or external command")
    {
        suggestions.push(format!("• Install the agent on {}", host));
        suggestions.push(format!("• Verify '{}' is on PATH for non-interactive sessions", tool));
        if !is_local {
            suggestions.push(format!("• Test manually: ssh {} 'which {}'", host, tool));
        }
        format!("'{}' is not installed or not on PATH on {}", tool, host)
    } else if exit_code == 126
        || combined.contains("permission denied")
        || combined.contains("access is denied")
    {
        suggestions.push("• Run the session as a user allowed to manage the agent".to_string());
        suggestions.push(format!("• Check execute permissions on {}", tool));
        format!("Permission denied running '{}' on {}", tool, host)
    } else if combined.contains("no space left") {
        suggestions.push(format!("• Free disk space on {} and rerun the export", host));
        format!("Disk full on {}", host)
    } else {
        suggestions.push("• Review the captured output above for the agent's own error".to_string());
        suggestions.push(format!("• Rerun manually on {}: {}", host, command));
        format!("'{}' exited with code {} on {}", command, exit_code, host)
    };

    format!("{}\n{}", summary, suggestions.join("\n"))
}

/// First line of a diagnosis, for one-line summaries.
pub fn summary_line(diagnosis: &str) -> &str {
    diagnosis.lines().next().unwrap_or(diagnosis)
}

fn extract_command_name(command: &str) -> &str {
    let trimmed = command.trim_start();
    if let Some(rest) = trimmed.strip_prefix('"') {
        return rest.split('"').next().unwrap_or(rest);
    }
    trimmed.split_whitespace().next().unwrap_or(command)
}
